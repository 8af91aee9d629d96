//! The node contract and the per-block processing context.
//!
//! A [`Node`] is a black box with fixed typed ports. The engine only decides
//! when a node runs, which buffers it sees, and how its output is time-aligned.
//! What it computes is entirely up to the implementation.
//!
//! # Real-time rules
//!
//! [`Node::process`] runs on the render thread. It must not allocate, lock, or
//! block. Failures are reported through [`ProcessError`], whose reasons are
//! `&'static str` so that reporting one never touches the heap.

use crate::merge::InputView;
use crate::signal::{AudioBuffer, ControlValue, EventList, MidiEvent, PortSpec, SignalBuffer, Trigger};

/// Why a node produced no output for a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    /// Recoverable: output is silence for this block only.
    #[error("skipped: {reason}")]
    Skipped {
        /// Short diagnostic.
        reason: &'static str,
    },
    /// Unrecoverable: the node is silenced and never invoked again.
    #[error("failed: {reason}")]
    Failed {
        /// Short diagnostic.
        reason: &'static str,
    },
}

/// Result of processing one block.
pub type ProcessResult = Result<(), ProcessError>;

/// Whether rendering is bound to a wall-clock deadline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Synchronous rendering with no deadline.
    #[default]
    Offline,
    /// Live rendering; each block must finish within `deadline_ns`.
    Realtime {
        /// Per-block budget in nanoseconds.
        deadline_ns: u64,
    },
}

/// Transport state as seen by nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportState {
    /// Timeline position advances every block.
    #[default]
    Playing,
    /// Timeline position holds; the sample clock still advances.
    Stopped,
}

/// Timing information for the block being rendered.
///
/// `block_index` counts every rendered block and never stops. `position_samples`
/// is the transport position and only moves while [`TransportState::Playing`].
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessContext {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Frames per block.
    pub block_size: usize,
    /// Transport position of the first frame of this block.
    pub position_samples: u64,
    /// Number of blocks rendered before this one.
    pub block_index: u64,
    /// Tempo used to derive beat positions.
    pub tempo_bpm: f64,
    /// Offline or realtime.
    pub mode: ProcessingMode,
    /// Playing or stopped.
    pub transport: TransportState,
}

impl ProcessContext {
    /// A playing, offline context at position zero and 120 BPM.
    pub fn new(sample_rate: u32, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size,
            position_samples: 0,
            block_index: 0,
            tempo_bpm: 120.0,
            mode: ProcessingMode::Offline,
            transport: TransportState::Playing,
        }
    }

    /// Sets the processing mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the tempo.
    #[must_use]
    pub fn with_tempo(mut self, bpm: f64) -> Self {
        self.tempo_bpm = bpm;
        self
    }

    /// Monotonic sample clock at the start of this block.
    ///
    /// Unlike `position_samples`, this ignores the transport.
    #[inline]
    pub fn clock_samples(&self) -> u64 {
        self.block_index * self.block_size as u64
    }

    /// Transport position in seconds.
    pub fn position_seconds(&self) -> f64 {
        self.position_samples as f64 / f64::from(self.sample_rate.max(1))
    }

    /// Transport position in beats at the current tempo.
    pub fn position_beats(&self) -> f64 {
        self.position_seconds() * self.tempo_bpm / 60.0
    }

    /// Moves to the next block.
    pub fn advance(&mut self) {
        self.block_index += 1;
        if self.transport == TransportState::Playing {
            self.position_samples += self.block_size as u64;
        }
    }
}

/// Mutable access to a node's own output buffers for one block.
///
/// Buffers arrive cleared to silence.
pub struct OutputPorts<'a> {
    buffers: &'a mut [SignalBuffer],
}

impl<'a> OutputPorts<'a> {
    pub(crate) fn new(buffers: &'a mut [SignalBuffer]) -> Self {
        Self { buffers }
    }

    /// Number of output ports.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns true if the node has no outputs.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Raw access to a port's buffer.
    pub fn get_mut(&mut self, port: usize) -> Option<&mut SignalBuffer> {
        self.buffers.get_mut(port)
    }

    /// The audio buffer of `port`, if it is an audio port.
    pub fn audio(&mut self, port: usize) -> Option<&mut AudioBuffer> {
        match self.buffers.get_mut(port) {
            Some(SignalBuffer::Audio(buf)) => Some(buf),
            _ => None,
        }
    }

    /// The MIDI list of `port`, if it is a MIDI port.
    pub fn midi(&mut self, port: usize) -> Option<&mut EventList<MidiEvent>> {
        match self.buffers.get_mut(port) {
            Some(SignalBuffer::Midi(list)) => Some(list),
            _ => None,
        }
    }

    /// The trigger list of `port`, if it is a trigger port.
    pub fn triggers(&mut self, port: usize) -> Option<&mut EventList<Trigger>> {
        match self.buffers.get_mut(port) {
            Some(SignalBuffer::Trigger(list)) => Some(list),
            _ => None,
        }
    }

    /// Writes a control ramp to `port`. Returns `false` if it is not a control port.
    pub fn set_control(&mut self, port: usize, value: ControlValue) -> bool {
        match self.buffers.get_mut(port) {
            Some(SignalBuffer::Control(slot)) => {
                *slot = value;
                true
            }
            _ => false,
        }
    }
}

/// A unit of signal processing with typed ports.
///
/// Implementations are stored as `Box<dyn Node>` inside a compiled plan, so new
/// node kinds can be added without touching the engine.
pub trait Node: Send {
    /// Display name used in diagnostics and introspection.
    fn name(&self) -> &str;

    /// Input port declarations. Must not change after the node is added.
    fn inputs(&self) -> &[PortSpec];

    /// Output port declarations. Must not change after the node is added.
    fn outputs(&self) -> &[PortSpec];

    /// Current processing latency in samples.
    ///
    /// Read once per block on the render thread and forwarded to the latency
    /// compensator when it changes.
    fn latency_samples(&self) -> u64 {
        0
    }

    /// Upper bound on [`latency_samples`](Self::latency_samples) for the
    /// lifetime of this node. The compiler sizes delay lines from it.
    fn max_latency_samples(&self) -> u64 {
        self.latency_samples()
    }

    /// Renders one block.
    ///
    /// Must not allocate or block.
    fn process(
        &mut self,
        ctx: &ProcessContext,
        inputs: &mut InputView<'_>,
        outputs: &mut OutputPorts<'_>,
    ) -> ProcessResult;

    /// Clears internal state (delay memories, envelopes, held notes).
    fn reset(&mut self) {}
}
