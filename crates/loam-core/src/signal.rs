//! Signal kinds, port declarations, and the per-port buffers a plan owns.
//!
//! Every output port of every node gets exactly one [`SignalBuffer`], sized at
//! compile time:
//!
//! - **Audio**: interleaved `f32` samples, `block_size × channels`
//! - **MIDI / Trigger**: an [`EventList`] with a fixed, pre-reserved capacity
//! - **Control**: a single [`ControlValue`] ramp for the block
//!
//! None of these containers grow after construction. Event lists refuse pushes
//! beyond their capacity instead of reallocating, which keeps the render path
//! free of heap traffic.

/// The type of data flowing through a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Interleaved sample data.
    Audio,
    /// Frame-stamped MIDI events.
    Midi,
    /// One continuous control ramp per block.
    Control,
    /// Frame-stamped instantaneous triggers.
    Trigger,
}

impl core::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Audio => "audio",
            Self::Midi => "midi",
            Self::Control => "control",
            Self::Trigger => "trigger",
        };
        f.write_str(name)
    }
}

/// Declaration of one input or output port on a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortSpec {
    /// Human-readable port name.
    pub name: &'static str,
    /// Signal kind carried by the port.
    pub kind: SignalKind,
    /// Channel count. Only meaningful for audio ports; 1 for everything else.
    pub channels: u16,
}

impl PortSpec {
    /// An audio port with the given channel count.
    pub const fn audio(name: &'static str, channels: u16) -> Self {
        Self {
            name,
            kind: SignalKind::Audio,
            channels,
        }
    }

    /// A MIDI event port.
    pub const fn midi(name: &'static str) -> Self {
        Self {
            name,
            kind: SignalKind::Midi,
            channels: 1,
        }
    }

    /// A continuous control port.
    pub const fn control(name: &'static str) -> Self {
        Self {
            name,
            kind: SignalKind::Control,
            channels: 1,
        }
    }

    /// A trigger port.
    pub const fn trigger(name: &'static str) -> Self {
        Self {
            name,
            kind: SignalKind::Trigger,
            channels: 1,
        }
    }
}

// --- Audio ---

/// Interleaved audio for one block.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    channels: usize,
}

impl AudioBuffer {
    /// Creates a zeroed buffer of `frames × channels` samples.
    pub fn new(frames: usize, channels: usize) -> Self {
        let channels = channels.max(1);
        Self {
            samples: vec![0.0; frames * channels],
            channels,
        }
    }

    /// Number of interleaved channels.
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of frames (samples per channel).
    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    /// Interleaved samples.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    /// Mutable interleaved samples.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    /// Fills the buffer with silence.
    pub fn clear(&mut self) {
        self.samples.fill(0.0);
    }

    /// Sets every sample to `value`.
    pub fn fill(&mut self, value: f32) {
        self.samples.fill(value);
    }

    /// Copies samples from `src`. Lengths must match.
    pub fn copy_from(&mut self, src: &[f32]) {
        self.samples.copy_from_slice(src);
    }

    /// Accumulates `src × gain` into this buffer.
    pub fn add_scaled(&mut self, src: &[f32], gain: f32) {
        add_scaled(&mut self.samples, src, gain);
    }

    /// Returns true if every sample is exactly zero.
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|&s| s == 0.0)
    }
}

/// Accumulates `src × gain` into `dst`, sample by sample.
#[inline]
pub fn add_scaled(dst: &mut [f32], src: &[f32], gain: f32) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += *s * gain;
    }
}

// --- Events ---

/// Anything stamped with a frame offset inside a block.
pub trait Timed: Copy {
    /// Frame offset within the block.
    fn frame(&self) -> u32;

    /// Returns a copy re-stamped at `frame`.
    #[must_use]
    fn at_frame(self, frame: u32) -> Self;
}

/// Stable in-place insertion sort by frame.
///
/// Equal frames keep their relative order. Unlike `slice::sort_by_key` this
/// never allocates, so it is safe to call from the render thread.
pub fn sort_by_frame<T: Timed>(events: &mut [T]) {
    for i in 1..events.len() {
        let mut j = i;
        while j > 0 && events[j - 1].frame() > events[j].frame() {
            events.swap(j - 1, j);
            j -= 1;
        }
    }
}

/// Fixed-capacity list of frame-stamped events.
///
/// Capacity is reserved up front; [`push`](Self::push) refuses to grow past it.
#[derive(Clone, Debug)]
pub struct EventList<T> {
    events: Vec<T>,
    capacity: usize,
}

impl<T: Timed> EventList<T> {
    /// Creates an empty list that can hold `capacity` events without allocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an event. Returns `false` (and drops the event) when full.
    #[inline]
    pub fn push(&mut self, event: T) -> bool {
        if self.events.len() >= self.capacity {
            return false;
        }
        self.events.push(event);
        true
    }

    /// Appends events from a slice until full. Returns how many were dropped.
    pub fn extend_from_slice(&mut self, events: &[T]) -> usize {
        let room = self.capacity - self.events.len();
        let take = events.len().min(room);
        self.events.extend_from_slice(&events[..take]);
        events.len() - take
    }

    /// Removes all events, keeping the reservation.
    #[inline]
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Stable sort by frame offset.
    pub fn sort_by_frame(&mut self) {
        sort_by_frame(&mut self.events);
    }

    /// Events in their current order.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.events
    }

    /// Number of events currently held.
    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the list holds no events.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of events this list will hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if the events are ordered by frame.
    pub fn is_sorted(&self) -> bool {
        self.events.windows(2).all(|w| w[0].frame() <= w[1].frame())
    }
}

/// A MIDI channel message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note on.
    NoteOn {
        /// Channel 0-15.
        channel: u8,
        /// Note number 0-127.
        note: u8,
        /// Velocity 0-127.
        velocity: u8,
    },
    /// Note off.
    NoteOff {
        /// Channel 0-15.
        channel: u8,
        /// Note number 0-127.
        note: u8,
        /// Release velocity 0-127.
        velocity: u8,
    },
    /// Control change.
    ControlChange {
        /// Channel 0-15.
        channel: u8,
        /// Controller number 0-127.
        controller: u8,
        /// Value 0-127.
        value: u8,
    },
    /// Program change.
    ProgramChange {
        /// Channel 0-15.
        channel: u8,
        /// Program 0-127.
        program: u8,
    },
    /// Pitch bend, centered at 0 (-8192..=8191).
    PitchBend {
        /// Channel 0-15.
        channel: u8,
        /// Signed bend amount.
        value: i16,
    },
    /// Transport start.
    Start,
    /// Transport stop.
    Stop,
    /// Transport continue.
    Continue,
    /// MIDI clock tick (24 ppqn).
    TimingClock,
}

/// A MIDI message at a frame offset within the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MidiEvent {
    /// Frame offset within the block.
    pub frame: u32,
    /// The message.
    pub message: MidiMessage,
}

impl MidiEvent {
    /// Creates an event at `frame`.
    pub const fn new(frame: u32, message: MidiMessage) -> Self {
        Self { frame, message }
    }
}

impl Timed for MidiEvent {
    #[inline]
    fn frame(&self) -> u32 {
        self.frame
    }

    #[inline]
    fn at_frame(self, frame: u32) -> Self {
        Self { frame, ..self }
    }
}

/// An instantaneous trigger occurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trigger {
    /// Frame offset within the block.
    pub frame: u32,
    /// Caller-defined tag identifying what fired.
    pub tag: u32,
}

impl Trigger {
    /// Creates a trigger at `frame`.
    pub const fn new(frame: u32, tag: u32) -> Self {
        Self { frame, tag }
    }
}

impl Timed for Trigger {
    #[inline]
    fn frame(&self) -> u32 {
        self.frame
    }

    #[inline]
    fn at_frame(self, frame: u32) -> Self {
        Self { frame, ..self }
    }
}

// --- Control ---

/// A control value ramp across one block.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ControlValue {
    /// Value at the first frame.
    pub start: f32,
    /// Value at the last frame.
    pub end: f32,
}

impl ControlValue {
    /// A ramp from `start` to `end`.
    pub const fn ramp(start: f32, end: f32) -> Self {
        Self { start, end }
    }

    /// A flat value for the whole block.
    pub const fn constant(value: f32) -> Self {
        Self {
            start: value,
            end: value,
        }
    }

    /// Linear interpolation at `t` in `[0, 1]` across the block.
    #[inline]
    pub fn at(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        self.start + (self.end - self.start) * t
    }
}

// --- Per-port storage ---

/// The storage behind one output port.
#[derive(Clone, Debug)]
pub enum SignalBuffer {
    /// Interleaved audio.
    Audio(AudioBuffer),
    /// MIDI events.
    Midi(EventList<MidiEvent>),
    /// A control ramp.
    Control(ControlValue),
    /// Triggers.
    Trigger(EventList<Trigger>),
}

impl SignalBuffer {
    /// Allocates storage for `port` at the given block size and event capacity.
    pub fn for_port(port: &PortSpec, block_size: usize, event_capacity: usize) -> Self {
        match port.kind {
            SignalKind::Audio => Self::Audio(AudioBuffer::new(block_size, port.channels as usize)),
            SignalKind::Midi => Self::Midi(EventList::with_capacity(event_capacity)),
            SignalKind::Control => Self::Control(ControlValue::default()),
            SignalKind::Trigger => Self::Trigger(EventList::with_capacity(event_capacity)),
        }
    }

    /// The kind of signal held.
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Audio(_) => SignalKind::Audio,
            Self::Midi(_) => SignalKind::Midi,
            Self::Control(_) => SignalKind::Control,
            Self::Trigger(_) => SignalKind::Trigger,
        }
    }

    /// Resets to silence: zeroed audio, no events, a zero control value.
    pub fn clear(&mut self) {
        match self {
            Self::Audio(buf) => buf.clear(),
            Self::Midi(list) => list.clear(),
            Self::Control(value) => *value = ControlValue::default(),
            Self::Trigger(list) => list.clear(),
        }
    }

    /// Overwrites this buffer with `other`'s contents without allocating.
    ///
    /// Events beyond this buffer's capacity are dropped and counted in the
    /// return value. A kind mismatch leaves this buffer cleared.
    pub fn copy_from(&mut self, other: &SignalBuffer) -> usize {
        self.clear();
        match (self, other) {
            (Self::Audio(dst), Self::Audio(src)) => {
                dst.copy_from(src.as_slice());
                0
            }
            (Self::Midi(dst), Self::Midi(src)) => dst.extend_from_slice(src.as_slice()),
            (Self::Control(dst), Self::Control(src)) => {
                *dst = *src;
                0
            }
            (Self::Trigger(dst), Self::Trigger(src)) => dst.extend_from_slice(src.as_slice()),
            _ => 0,
        }
    }

    /// Returns the audio buffer, if this is an audio port.
    pub fn as_audio(&self) -> Option<&AudioBuffer> {
        match self {
            Self::Audio(buf) => Some(buf),
            _ => None,
        }
    }

    /// Returns the MIDI list, if this is a MIDI port.
    pub fn as_midi(&self) -> Option<&EventList<MidiEvent>> {
        match self {
            Self::Midi(list) => Some(list),
            _ => None,
        }
    }

    /// Returns the control value, if this is a control port.
    pub fn as_control(&self) -> Option<ControlValue> {
        match self {
            Self::Control(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the trigger list, if this is a trigger port.
    pub fn as_triggers(&self) -> Option<&EventList<Trigger>> {
        match self {
            Self::Trigger(list) => Some(list),
            _ => None,
        }
    }

    /// Returns true if the buffer holds silence.
    pub fn is_silent(&self) -> bool {
        match self {
            Self::Audio(buf) => buf.is_silent(),
            Self::Midi(list) => list.is_empty(),
            Self::Control(value) => *value == ControlValue::default(),
            Self::Trigger(list) => list.is_empty(),
        }
    }
}
