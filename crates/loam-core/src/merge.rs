//! Lazy, allocation-free input merging.
//!
//! Before a node runs, the render engine records which buffers feed each of
//! its input ports and with what gain. No sample data moves until the node
//! asks for a port; the merge rule then depends on the signal kind:
//!
//! | Kind    | Rule                                                          |
//! |---------|---------------------------------------------------------------|
//! | Audio   | Sum of `source × gain`                                        |
//! | MIDI    | Union ordered by frame; ties keep edge declaration order      |
//! | Control | Arithmetic mean of the sources' ramps                         |
//! | Trigger | Union ordered by frame; duplicates kept                       |
//!
//! A single unity-gain audio source, or a single already-ordered event source,
//! is returned by reference without copying.

use std::ops::Range;

use crate::signal::{
    AudioBuffer, ControlValue, EventList, MidiEvent, SignalBuffer, Timed, Trigger, add_scaled,
};

/// Read-only view over a node's routed inputs for one block.
pub struct InputView<'a> {
    spans: &'a [Range<usize>],
    sources: &'a [(usize, f32)],
    buffers: &'a [SignalBuffer],
    audio: &'a mut [f32],
    midi: &'a mut EventList<MidiEvent>,
    triggers: &'a mut EventList<Trigger>,
    dropped: usize,
}

impl<'a> InputView<'a> {
    /// `spans[p]` selects the `(buffer, gain)` pairs in `sources` that feed port `p`.
    pub(crate) fn new(
        spans: &'a [Range<usize>],
        sources: &'a [(usize, f32)],
        buffers: &'a [SignalBuffer],
        audio: &'a mut [f32],
        midi: &'a mut EventList<MidiEvent>,
        triggers: &'a mut EventList<Trigger>,
    ) -> Self {
        Self {
            spans,
            sources,
            buffers,
            audio,
            midi,
            triggers,
            dropped: 0,
        }
    }

    /// Number of input ports.
    pub fn port_count(&self) -> usize {
        self.spans.len()
    }

    /// Returns false if no edge feeds `port`.
    pub fn is_connected(&self, port: usize) -> bool {
        self.source_count(port) > 0
    }

    /// Number of edges feeding `port`.
    pub fn source_count(&self, port: usize) -> usize {
        self.spans.get(port).map_or(0, |s| s.len())
    }

    /// The raw sources of `port` with their edge gains, in declaration order.
    pub fn sources(&self, port: usize) -> impl Iterator<Item = (&'a SignalBuffer, f32)> + 'a {
        let buffers = self.buffers;
        self.pairs(port)
            .iter()
            .map(move |&(idx, gain)| (&buffers[idx], gain))
    }

    /// Events dropped so far because the merge scratch was full.
    pub fn dropped_events(&self) -> usize {
        self.dropped
    }

    fn pairs(&self, port: usize) -> &'a [(usize, f32)] {
        let sources = self.sources;
        match self.spans.get(port) {
            Some(span) => &sources[span.clone()],
            None => &[],
        }
    }

    /// Gain-weighted sum of every audio source feeding `port`.
    ///
    /// Returns `None` if the port is not connected.
    pub fn audio(&mut self, port: usize) -> Option<&[f32]> {
        let pairs = self.pairs(port);
        let buffers = self.buffers;
        let (first, _) = *pairs.first()?;
        let first = buffers[first].as_audio()?;
        if let [(_, gain)] = pairs {
            if *gain == 1.0 {
                return Some(first.as_slice());
            }
        }

        let dst = &mut self.audio[..first.as_slice().len()];
        dst.fill(0.0);
        for &(idx, gain) in pairs {
            if let Some(src) = buffers[idx].as_audio() {
                add_scaled(dst, src.as_slice(), gain);
            }
        }
        Some(&*dst)
    }

    /// Accumulates the gain-weighted sum of `port` into `dst`.
    ///
    /// Returns `false` if the port is not connected.
    pub fn mix_audio_into(&self, port: usize, dst: &mut [f32]) -> bool {
        let pairs = self.pairs(port);
        for &(idx, gain) in pairs {
            if let Some(src) = self.buffers[idx].as_audio() {
                add_scaled(dst, src.as_slice(), gain);
            }
        }
        !pairs.is_empty()
    }

    /// Frame-ordered union of every MIDI source feeding `port`.
    pub fn midi(&mut self, port: usize) -> Option<&[MidiEvent]> {
        let pairs = self.pairs(port);
        if pairs.is_empty() {
            return None;
        }
        merge_events(pairs, self.buffers, SignalBuffer::as_midi, self.midi, &mut self.dropped)
    }

    /// Frame-ordered union of every trigger source feeding `port`.
    pub fn triggers(&mut self, port: usize) -> Option<&[Trigger]> {
        let pairs = self.pairs(port);
        if pairs.is_empty() {
            return None;
        }
        merge_events(
            pairs,
            self.buffers,
            SignalBuffer::as_triggers,
            self.triggers,
            &mut self.dropped,
        )
    }

    /// Mean of every control source feeding `port`.
    pub fn control(&self, port: usize) -> Option<ControlValue> {
        let pairs = self.pairs(port);
        let mut sum = ControlValue::default();
        let mut count = 0u32;
        for &(idx, _) in pairs {
            if let Some(value) = self.buffers[idx].as_control() {
                sum.start += value.start;
                sum.end += value.end;
                count += 1;
            }
        }
        if count == 0 {
            return None;
        }
        let n = count as f32;
        Some(ControlValue::ramp(sum.start / n, sum.end / n))
    }

    /// Audio channel count of the first source on `port`.
    pub fn audio_channels(&self, port: usize) -> Option<usize> {
        let (idx, _) = *self.pairs(port).first()?;
        self.buffers[idx].as_audio().map(AudioBuffer::channels)
    }
}

fn merge_events<'s, T: Timed>(
    pairs: &[(usize, f32)],
    buffers: &'s [SignalBuffer],
    extract: fn(&SignalBuffer) -> Option<&EventList<T>>,
    scratch: &'s mut EventList<T>,
    dropped: &mut usize,
) -> Option<&'s [T]> {
    if let [(idx, _)] = pairs {
        let list = extract(&buffers[*idx])?;
        if list.is_sorted() {
            return Some(list.as_slice());
        }
    }

    scratch.clear();
    for &(idx, _) in pairs {
        if let Some(list) = extract(&buffers[idx]) {
            *dropped += scratch.extend_from_slice(list.as_slice());
        }
    }
    scratch.sort_by_frame();
    Some(scratch.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{MidiMessage, PortSpec};

    struct Fixture {
        buffers: Vec<SignalBuffer>,
        audio: Vec<f32>,
        midi: EventList<MidiEvent>,
        triggers: EventList<Trigger>,
    }

    impl Fixture {
        fn new(buffers: Vec<SignalBuffer>) -> Self {
            Self {
                buffers,
                audio: vec![0.0; 16],
                midi: EventList::with_capacity(16),
                triggers: EventList::with_capacity(16),
            }
        }

        fn view<'a>(
            &'a mut self,
            spans: &'a [Range<usize>],
            sources: &'a [(usize, f32)],
        ) -> InputView<'a> {
            InputView::new(
                spans,
                sources,
                &self.buffers,
                &mut self.audio,
                &mut self.midi,
                &mut self.triggers,
            )
        }
    }

    fn constant_audio(value: f32, frames: usize) -> SignalBuffer {
        let mut buf = AudioBuffer::new(frames, 1);
        buf.fill(value);
        SignalBuffer::Audio(buf)
    }

    fn note(frame: u32, note: u8) -> MidiEvent {
        MidiEvent::new(
            frame,
            MidiMessage::NoteOn {
                channel: 0,
                note,
                velocity: 100,
            },
        )
    }

    fn midi_list(events: &[MidiEvent]) -> SignalBuffer {
        let mut list = EventList::with_capacity(8);
        for &e in events {
            list.push(e);
        }
        SignalBuffer::Midi(list)
    }

    #[test]
    fn test_audio_gain_weighted_sum() {
        let mut fx = Fixture::new(vec![constant_audio(1.0, 4), constant_audio(1.0, 4)]);
        let spans = [0..2];
        let sources = [(0, 0.5), (1, 0.25)];
        let mut view = fx.view(&spans, &sources);
        assert_eq!(view.audio(0), Some(&[0.75; 4][..]));
    }

    #[test]
    fn test_single_unity_source_is_borrowed() {
        let mut fx = Fixture::new(vec![constant_audio(0.3, 4)]);
        let spans = [0..1];
        let sources = [(0, 1.0)];
        let mut view = fx.view(&spans, &sources);
        assert_eq!(view.audio(0), Some(&[0.3; 4][..]));
        // The scratch was never written.
        drop(view);
        assert!(fx.audio.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_unconnected_port() {
        let mut fx = Fixture::new(vec![constant_audio(1.0, 4)]);
        let spans = [0..1, 1..1];
        let sources = [(0, 1.0)];
        let mut view = fx.view(&spans, &sources);
        assert!(view.is_connected(0));
        assert!(!view.is_connected(1));
        assert!(!view.is_connected(7));
        assert!(view.audio(1).is_none());
        assert!(view.control(1).is_none());
    }

    #[test]
    fn test_mix_audio_into_accumulates() {
        let mut fx = Fixture::new(vec![constant_audio(1.0, 2)]);
        let spans = [0..1];
        let sources = [(0, 0.5)];
        let view = fx.view(&spans, &sources);
        let mut dst = [1.0, 1.0];
        assert!(view.mix_audio_into(0, &mut dst));
        assert_eq!(dst, [1.5, 1.5]);
    }

    #[test]
    fn test_midi_union_ties_follow_declaration_order() {
        let mut fx = Fixture::new(vec![
            midi_list(&[note(3, 60), note(1, 61)]),
            midi_list(&[note(1, 70), note(0, 71)]),
        ]);
        let spans = [0..2];
        let sources = [(0, 1.0), (1, 1.0)];
        let mut view = fx.view(&spans, &sources);
        let merged = view.midi(0).map(<[MidiEvent]>::to_vec);
        let notes: Vec<(u32, u8)> = merged
            .unwrap_or_default()
            .iter()
            .map(|e| match e.message {
                MidiMessage::NoteOn { note, .. } => (e.frame, note),
                _ => (e.frame, 0),
            })
            .collect();
        assert_eq!(notes, vec![(0, 71), (1, 61), (1, 70), (3, 60)]);
    }

    #[test]
    fn test_control_mean() {
        let mut fx = Fixture::new(vec![
            SignalBuffer::Control(ControlValue::ramp(0.0, 1.0)),
            SignalBuffer::Control(ControlValue::ramp(1.0, 0.0)),
            SignalBuffer::Control(ControlValue::constant(0.5)),
        ]);
        let spans = [0..3];
        let sources = [(0, 1.0), (1, 0.1), (2, 1.0)];
        let view = fx.view(&spans, &sources);
        assert_eq!(view.control(0), Some(ControlValue::constant(0.5)));
    }

    #[test]
    fn test_triggers_keep_duplicates() {
        let mut a = EventList::with_capacity(4);
        a.push(Trigger::new(2, 1));
        let mut b = EventList::with_capacity(4);
        b.push(Trigger::new(2, 1));
        b.push(Trigger::new(0, 9));
        let mut fx = Fixture::new(vec![SignalBuffer::Trigger(a), SignalBuffer::Trigger(b)]);
        let spans = [0..2];
        let sources = [(0, 1.0), (1, 1.0)];
        let mut view = fx.view(&spans, &sources);
        assert_eq!(
            view.triggers(0),
            Some(&[Trigger::new(0, 9), Trigger::new(2, 1), Trigger::new(2, 1)][..])
        );
    }

    #[test]
    fn test_event_merge_overflow_is_counted() {
        let events: Vec<MidiEvent> = (0..8).map(|i| note(i, 60)).collect();
        let mut fx = Fixture::new(vec![midi_list(&events), midi_list(&events), midi_list(&events)]);
        let spans = [0..3];
        let sources = [(0, 1.0), (1, 1.0), (2, 1.0)];
        let mut view = fx.view(&spans, &sources);
        assert_eq!(view.midi(0).map(<[MidiEvent]>::len), Some(16));
        assert_eq!(view.dropped_events(), 8);
    }

    #[test]
    fn test_audio_channels() {
        let mut fx = Fixture::new(vec![SignalBuffer::for_port(&PortSpec::audio("out", 2), 4, 0)]);
        let spans = [0..1];
        let sources = [(0, 1.0)];
        let view = fx.view(&spans, &sources);
        assert_eq!(view.audio_channels(0), Some(2));
    }
}
