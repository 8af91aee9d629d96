//! Small built-in nodes.
//!
//! These cover what the engine itself needs (mixer channel strips for flattened
//! routing graphs) plus a few trivial sources and processors that are handy
//! for wiring tests and benchmarks. Real DSP lives outside this crate.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::delay::AudioDelayLine;
use crate::merge::InputView;
use crate::node::{Node, OutputPorts, ProcessContext, ProcessError, ProcessResult};
use crate::signal::PortSpec;

const NO_OUTPUT: ProcessError = ProcessError::Failed {
    reason: "audio output port missing",
};

/// Emits a constant value on every sample.
#[derive(Debug, Clone)]
pub struct Constant {
    value: f32,
    outputs: [PortSpec; 1],
}

impl Constant {
    /// A constant source with `channels` interleaved channels.
    pub fn new(value: f32, channels: u16) -> Self {
        Self {
            value,
            outputs: [PortSpec::audio("out", channels)],
        }
    }
}

impl Node for Constant {
    fn name(&self) -> &str {
        "constant"
    }

    fn inputs(&self) -> &[PortSpec] {
        &[]
    }

    fn outputs(&self) -> &[PortSpec] {
        &self.outputs
    }

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        _inputs: &mut InputView<'_>,
        outputs: &mut OutputPorts<'_>,
    ) -> ProcessResult {
        outputs.audio(0).ok_or(NO_OUTPUT)?.fill(self.value);
        Ok(())
    }
}

/// Sums its input and scales it by a fixed gain.
#[derive(Debug, Clone)]
pub struct Gain {
    gain: f32,
    inputs: [PortSpec; 1],
    outputs: [PortSpec; 1],
}

impl Gain {
    /// A gain stage with `channels` interleaved channels.
    pub fn new(gain: f32, channels: u16) -> Self {
        Self {
            gain,
            inputs: [PortSpec::audio("in", channels)],
            outputs: [PortSpec::audio("out", channels)],
        }
    }
}

impl Node for Gain {
    fn name(&self) -> &str {
        "gain"
    }

    fn inputs(&self) -> &[PortSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[PortSpec] {
        &self.outputs
    }

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        inputs: &mut InputView<'_>,
        outputs: &mut OutputPorts<'_>,
    ) -> ProcessResult {
        let out = outputs.audio(0).ok_or(NO_OUTPUT)?.as_mut_slice();
        inputs.mix_audio_into(0, out);
        for sample in out.iter_mut() {
            *sample *= self.gain;
        }
        Ok(())
    }
}

/// A unit impulse on the first frame of the first block after creation or reset.
#[derive(Debug, Clone)]
pub struct Impulse {
    fired: bool,
    outputs: [PortSpec; 1],
}

impl Impulse {
    /// An impulse source with `channels` interleaved channels.
    pub fn new(channels: u16) -> Self {
        Self {
            fired: false,
            outputs: [PortSpec::audio("out", channels)],
        }
    }
}

impl Node for Impulse {
    fn name(&self) -> &str {
        "impulse"
    }

    fn inputs(&self) -> &[PortSpec] {
        &[]
    }

    fn outputs(&self) -> &[PortSpec] {
        &self.outputs
    }

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        _inputs: &mut InputView<'_>,
        outputs: &mut OutputPorts<'_>,
    ) -> ProcessResult {
        if self.fired {
            return Ok(());
        }
        let out = outputs.audio(0).ok_or(NO_OUTPUT)?;
        let channels = out.channels();
        if let Some(frame) = out.as_mut_slice().get_mut(..channels) {
            frame.fill(1.0);
        }
        self.fired = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.fired = false;
    }
}

/// Changes a [`Delay`]'s latency from another thread.
#[derive(Debug, Clone)]
pub struct DelayHandle(Arc<AtomicU64>);

impl DelayHandle {
    /// Requests a new delay in samples. Clamped to the node's maximum.
    pub fn set(&self, samples: u64) {
        self.0.store(samples, Ordering::Relaxed);
    }

    /// The requested delay.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A pure delay that reports its delay as processing latency.
///
/// Stands in for any node with lookahead or block-based internals.
#[derive(Debug)]
pub struct Delay {
    samples: Arc<AtomicU64>,
    max_samples: u64,
    line: AudioDelayLine,
    inputs: [PortSpec; 1],
    outputs: [PortSpec; 1],
}

impl Delay {
    /// A delay of `samples`, adjustable up to `max_samples` through [`handle`](Self::handle).
    pub fn new(samples: u64, max_samples: u64, channels: u16) -> Self {
        let max_samples = max_samples.max(samples);
        Self {
            samples: Arc::new(AtomicU64::new(samples)),
            max_samples,
            line: AudioDelayLine::new(max_samples as usize, usize::from(channels)),
            inputs: [PortSpec::audio("in", channels)],
            outputs: [PortSpec::audio("out", channels)],
        }
    }

    /// A fixed delay.
    pub fn fixed(samples: u64, channels: u16) -> Self {
        Self::new(samples, samples, channels)
    }

    /// Handle for changing the delay while rendering.
    pub fn handle(&self) -> DelayHandle {
        DelayHandle(Arc::clone(&self.samples))
    }
}

impl Node for Delay {
    fn name(&self) -> &str {
        "delay"
    }

    fn inputs(&self) -> &[PortSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[PortSpec] {
        &self.outputs
    }

    fn latency_samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed).min(self.max_samples)
    }

    fn max_latency_samples(&self) -> u64 {
        self.max_samples
    }

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        inputs: &mut InputView<'_>,
        outputs: &mut OutputPorts<'_>,
    ) -> ProcessResult {
        let delay = self.latency_samples() as usize;
        let out = outputs.audio(0).ok_or(NO_OUTPUT)?.as_mut_slice();
        inputs.mix_audio_into(0, out);
        self.line.process(out, delay);
        Ok(())
    }

    fn reset(&mut self) {
        self.line.clear();
    }
}

/// A mixer channel: volume, balance pan, and mute.
///
/// Output 0 (`post`) is after the fader, output 1 (`pre`) before it. Mute
/// silences both.
#[derive(Debug, Clone)]
pub struct ChannelStrip {
    name: String,
    volume: f32,
    pan: f32,
    mute: bool,
    inputs: [PortSpec; 1],
    outputs: [PortSpec; 2],
}

impl ChannelStrip {
    /// Post-fader output port.
    pub const POST: usize = 0;
    /// Pre-fader output port.
    pub const PRE: usize = 1;

    /// A unity-gain, centered, unmuted strip.
    pub fn new(name: impl Into<String>, channels: u16) -> Self {
        Self {
            name: name.into(),
            volume: 1.0,
            pan: 0.0,
            mute: false,
            inputs: [PortSpec::audio("in", channels)],
            outputs: [PortSpec::audio("post", channels), PortSpec::audio("pre", channels)],
        }
    }

    /// Sets the fader level.
    #[must_use]
    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    /// Sets the pan position, -1.0 (left) to 1.0 (right).
    #[must_use]
    pub fn with_pan(mut self, pan: f32) -> Self {
        self.pan = pan.clamp(-1.0, 1.0);
        self
    }

    /// Mutes the strip.
    #[must_use]
    pub fn with_mute(mut self, mute: bool) -> Self {
        self.mute = mute;
        self
    }

    /// Per-channel gain after volume and pan.
    ///
    /// Balance law on stereo strips: the far side is attenuated, the near side
    /// stays at the fader level. Center is unity.
    fn channel_gain(&self, channel: usize, channels: usize) -> f32 {
        if channels != 2 {
            return self.volume;
        }
        let side = if channel == 0 {
            1.0 - self.pan.max(0.0)
        } else {
            1.0 + self.pan.min(0.0)
        };
        self.volume * side
    }
}

impl Node for ChannelStrip {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[PortSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[PortSpec] {
        &self.outputs
    }

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        inputs: &mut InputView<'_>,
        outputs: &mut OutputPorts<'_>,
    ) -> ProcessResult {
        if self.mute || !inputs.is_connected(0) {
            return Ok(());
        }

        if let Some(pre) = outputs.audio(Self::PRE) {
            inputs.mix_audio_into(0, pre.as_mut_slice());
        }

        let post = outputs.audio(Self::POST).ok_or(NO_OUTPUT)?;
        let channels = post.channels();
        let samples = post.as_mut_slice();
        inputs.mix_audio_into(0, samples);
        for frame in samples.chunks_exact_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample *= self.channel_gain(ch, channels);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;
    use crate::render::RenderEngine;
    use crate::topology::Topology;

    fn render_once(topo: Topology, block: usize) -> Vec<f32> {
        let Ok(mut plan) = compile(topo, block) else {
            panic!("compile failed");
        };
        let mut engine = RenderEngine::for_plan(&plan);
        let mut ctx = ProcessContext::new(48000, block);
        engine.process(&mut plan, &mut ctx).as_slice().to_vec()
    }

    #[test]
    fn test_impulse_fires_once() {
        let mut topo = Topology::new();
        topo.add_node(Impulse::new(2));
        let Ok(mut plan) = compile(topo, 4) else {
            panic!("compile failed");
        };
        let mut engine = RenderEngine::for_plan(&plan);
        let mut ctx = ProcessContext::new(48000, 4);
        assert_eq!(
            engine.process(&mut plan, &mut ctx).as_slice(),
            &[1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
        assert!(engine.process(&mut plan, &mut ctx).is_silent());

        plan.reset();
        assert_eq!(engine.process(&mut plan, &mut ctx).as_slice()[0], 1.0);
    }

    #[test]
    fn test_delay_reports_latency() {
        let delay = Delay::new(10, 100, 1);
        assert_eq!(delay.latency_samples(), 10);
        assert_eq!(delay.max_latency_samples(), 100);

        let handle = delay.handle();
        handle.set(500);
        assert_eq!(delay.latency_samples(), 100);
    }

    #[test]
    fn test_delay_shifts_signal() {
        let mut topo = Topology::new();
        let imp = topo.add_node(Impulse::new(1));
        let delay = topo.add_node(Delay::fixed(2, 1));
        topo.connect(imp, 0, delay, 0);
        assert_eq!(render_once(topo, 4), vec![0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_channel_strip_volume_and_pan() {
        let mut topo = Topology::new();
        let src = topo.add_node(Constant::new(1.0, 2));
        let strip = topo.add_node(ChannelStrip::new("track", 2).with_volume(0.5).with_pan(0.5));
        topo.connect(src, 0, strip, 0);
        topo.set_sink(strip);
        assert_eq!(render_once(topo, 2), vec![0.25, 0.5, 0.25, 0.5]);
    }

    #[test]
    fn test_channel_strip_pre_fader_ignores_volume() {
        let mut topo = Topology::new();
        let src = topo.add_node(Constant::new(1.0, 1));
        let strip = topo.add_node(ChannelStrip::new("track", 1).with_volume(0.0));
        let tap = topo.add_node(Gain::new(1.0, 1));
        topo.connect(src, 0, strip, 0);
        topo.connect(strip, ChannelStrip::PRE, tap, 0);
        topo.set_sink(tap);
        assert_eq!(render_once(topo, 3), vec![1.0; 3]);
    }

    #[test]
    fn test_channel_strip_mute() {
        let mut topo = Topology::new();
        let src = topo.add_node(Constant::new(1.0, 1));
        let strip = topo.add_node(ChannelStrip::new("track", 1).with_mute(true));
        topo.connect(src, 0, strip, 0);
        topo.set_sink(strip);
        assert_eq!(render_once(topo, 2), vec![0.0; 2]);
    }
}
