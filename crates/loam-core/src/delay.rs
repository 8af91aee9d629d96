//! Pre-allocated delay lines for latency compensation.
//!
//! Capacity is fixed at compile time to the worst-case compensation the graph
//! can require. The delay applied per block may vary anywhere in
//! `0..=capacity` without reallocating. History is recorded even at zero delay,
//! so raising the delay later plays back real signal instead of stale memory.

use crate::signal::{EventList, MidiEvent, SignalBuffer, Timed, Trigger};

/// Interleaved audio ring buffer with a variable read offset.
#[derive(Clone, Debug)]
pub struct AudioDelayLine {
    ring: Vec<f32>,
    channels: usize,
    capacity: usize,
    write: usize,
}

impl AudioDelayLine {
    /// Creates a line that can delay up to `capacity` frames.
    pub fn new(capacity: usize, channels: usize) -> Self {
        let channels = channels.max(1);
        Self {
            ring: vec![0.0; capacity * channels],
            channels,
            capacity,
            write: 0,
        }
    }

    /// Maximum delay in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Delays an interleaved block in place by `delay` frames.
    ///
    /// `delay` must not exceed [`capacity`](Self::capacity).
    pub fn process(&mut self, block: &mut [f32], delay: usize) {
        if self.capacity == 0 {
            return;
        }
        debug_assert!(delay <= self.capacity);
        let ch = self.channels;
        for frame in block.chunks_exact_mut(ch) {
            let w = self.write * ch;
            if delay == 0 {
                self.ring[w..w + ch].copy_from_slice(frame);
            } else {
                let r = ((self.write + self.capacity - delay) % self.capacity) * ch;
                for (c, sample) in frame.iter_mut().enumerate() {
                    let out = self.ring[r + c];
                    self.ring[w + c] = *sample;
                    *sample = out;
                }
            }
            self.write = (self.write + 1) % self.capacity;
        }
    }

    /// Clears the history.
    pub fn clear(&mut self) {
        self.ring.fill(0.0);
        self.write = 0;
    }
}

/// Holds events back until their delayed due time.
///
/// Pending events are keyed by absolute sample clock, so delays longer than a
/// block carry across block boundaries.
#[derive(Clone, Debug)]
pub struct EventDelayLine<T> {
    pending: Vec<(u64, T)>,
    capacity: usize,
}

impl<T: Timed> EventDelayLine<T> {
    /// Creates a line that can hold `capacity` in-flight events.
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of events currently held back.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Delays the events in `list` by `delay` frames.
    ///
    /// `clock` is the absolute sample position of the block start. Returns the
    /// number of events dropped because a container was full.
    pub fn process(&mut self, list: &mut EventList<T>, delay: u64, clock: u64, block: usize) -> usize {
        if delay == 0 && self.pending.is_empty() {
            return 0;
        }
        let mut dropped = 0;
        for event in list.as_slice() {
            if self.pending.len() < self.capacity {
                self.pending
                    .push((clock + u64::from(event.frame()) + delay, *event));
            } else {
                dropped += 1;
            }
        }
        list.clear();

        let end = clock + block as u64;
        for &(due, event) in &self.pending {
            if due < end {
                let frame = due.saturating_sub(clock) as u32;
                if !list.push(event.at_frame(frame)) {
                    dropped += 1;
                }
            }
        }
        self.pending.retain(|&(due, _)| due >= end);
        list.sort_by_frame();
        dropped
    }

    /// Drops every pending event.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// The delay line attached to one output port.
#[derive(Clone, Debug)]
pub enum PortDelay {
    /// Sample delay for audio ports.
    Audio(AudioDelayLine),
    /// Event delay for MIDI ports.
    Midi(EventDelayLine<MidiEvent>),
    /// Event delay for trigger ports.
    Trigger(EventDelayLine<Trigger>),
    /// Control ramps pass through undelayed.
    Passthrough,
}

impl PortDelay {
    /// Builds a delay line matching `buffer`'s kind.
    pub fn for_buffer(buffer: &SignalBuffer, capacity: usize, block_size: usize) -> Self {
        match buffer {
            SignalBuffer::Audio(audio) => Self::Audio(AudioDelayLine::new(capacity, audio.channels())),
            SignalBuffer::Midi(list) => {
                Self::Midi(EventDelayLine::new(event_slots(list.capacity(), capacity, block_size)))
            }
            SignalBuffer::Trigger(list) => {
                Self::Trigger(EventDelayLine::new(event_slots(list.capacity(), capacity, block_size)))
            }
            SignalBuffer::Control(_) => Self::Passthrough,
        }
    }

    /// Applies `delay` frames to `buffer`. Returns dropped event count.
    pub fn apply(&mut self, buffer: &mut SignalBuffer, delay: u64, clock: u64, block: usize) -> usize {
        match (self, buffer) {
            (Self::Audio(line), SignalBuffer::Audio(audio)) => {
                line.process(audio.as_mut_slice(), delay as usize);
                0
            }
            (Self::Midi(line), SignalBuffer::Midi(list)) => line.process(list, delay, clock, block),
            (Self::Trigger(line), SignalBuffer::Trigger(list)) => {
                line.process(list, delay, clock, block)
            }
            _ => 0,
        }
    }

    /// Clears history and pending events.
    pub fn clear(&mut self) {
        match self {
            Self::Audio(line) => line.clear(),
            Self::Midi(line) => line.clear(),
            Self::Trigger(line) => line.clear(),
            Self::Passthrough => {}
        }
    }
}

/// In-flight event slots: one block's worth of events per block of delay, plus one.
fn event_slots(per_block: usize, capacity: usize, block_size: usize) -> usize {
    if capacity == 0 {
        return 0;
    }
    per_block * (capacity.div_ceil(block_size.max(1)) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_delay_shifts_impulse() {
        let mut line = AudioDelayLine::new(8, 1);
        let mut block = [1.0, 0.0, 0.0, 0.0];
        line.process(&mut block, 3);
        assert_eq!(block, [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_audio_delay_crosses_blocks() {
        let mut line = AudioDelayLine::new(8, 2);
        let mut first = [1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        line.process(&mut first, 6);
        assert!(first.iter().all(|&s| s == 0.0));

        let mut second = [0.0; 8];
        line.process(&mut second, 6);
        // Frame 6 of the stream is frame 2 of the second block.
        assert_eq!(&second[4..6], &[1.0, -1.0]);
    }

    #[test]
    fn test_audio_delay_full_capacity() {
        let mut line = AudioDelayLine::new(4, 1);
        let mut a = [1.0, 2.0, 3.0, 4.0];
        line.process(&mut a, 4);
        assert_eq!(a, [0.0; 4]);
        let mut b = [0.0; 4];
        line.process(&mut b, 4);
        assert_eq!(b, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_zero_delay_records_history() {
        let mut line = AudioDelayLine::new(4, 1);
        let mut a = [1.0, 2.0, 3.0, 4.0];
        line.process(&mut a, 0);
        assert_eq!(a, [1.0, 2.0, 3.0, 4.0]);

        let mut b = [5.0, 6.0, 7.0, 8.0];
        line.process(&mut b, 2);
        assert_eq!(b, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_event_delay_carries_into_next_block() {
        let mut line = EventDelayLine::new(16);
        let mut list = EventList::with_capacity(4);
        list.push(Trigger::new(2, 7));

        let dropped = line.process(&mut list, 5, 0, 4);
        assert_eq!(dropped, 0);
        assert!(list.is_empty());
        assert_eq!(line.pending(), 1);

        list.clear();
        line.process(&mut list, 5, 4, 4);
        assert_eq!(list.as_slice(), &[Trigger::new(3, 7)]);
        assert_eq!(line.pending(), 0);
    }

    #[test]
    fn test_event_delay_counts_overflow() {
        let mut line = EventDelayLine::new(1);
        let mut list = EventList::with_capacity(4);
        list.push(Trigger::new(0, 1));
        list.push(Trigger::new(1, 2));
        assert_eq!(line.process(&mut list, 8, 0, 4), 1);
    }

    #[test]
    fn test_event_slots() {
        assert_eq!(event_slots(16, 0, 64), 0);
        assert_eq!(event_slots(16, 64, 64), 32);
        assert_eq!(event_slots(16, 65, 64), 48);
    }
}
