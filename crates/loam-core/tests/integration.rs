//! Integration tests for loam-core.
//!
//! Builds small graphs end to end: compile, render, and inspect. Covers gain
//! chains, fan-in summing, latency alignment across parallel paths and
//! direct fan-out, compensation clamping, node failure containment, MIDI
//! merge ordering, and mixer routing.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use loam_core::nodes::{Constant, Delay, Gain, Impulse};
use loam_core::{
    AuxSend, Bus, CompileError, CompileOptions, InputView, MidiEvent, MidiMessage, Node,
    OutputPorts, OutputTarget, PortSpec, ProcessContext, ProcessError, ProcessResult,
    RenderEngine, RoutingGraph, RoutingNode, Topology, Track, compile, compile_with,
};

const SAMPLE_RATE: u32 = 48000;

fn render_blocks(topology: Topology, block_size: usize, blocks: usize) -> Vec<f32> {
    let Ok(mut plan) = compile(topology, block_size) else {
        panic!("compile failed");
    };
    let mut engine = RenderEngine::for_plan(&plan);
    let mut ctx = ProcessContext::new(SAMPLE_RATE, block_size);
    let mut out = Vec::new();
    for _ in 0..blocks {
        out.extend_from_slice(engine.process(&mut plan, &mut ctx).as_slice());
    }
    out
}

fn note_on(frame: u32, note: u8) -> MidiEvent {
    MidiEvent::new(
        frame,
        MidiMessage::NoteOn {
            channel: 0,
            note,
            velocity: 100,
        },
    )
}

// ============================================================================
// Test nodes
// ============================================================================

/// Emits a fixed set of MIDI events every block.
struct MidiSource {
    events: Vec<MidiEvent>,
    outputs: [PortSpec; 1],
}

impl MidiSource {
    fn new(events: Vec<MidiEvent>) -> Self {
        Self {
            events,
            outputs: [PortSpec::midi("out")],
        }
    }
}

impl Node for MidiSource {
    fn name(&self) -> &str {
        "midi_source"
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
        if let Some(list) = outputs.midi(0) {
            for &event in &self.events {
                list.push(event);
            }
        }
        Ok(())
    }
}

/// Records the merged MIDI input of every block. Has a silent audio output so
/// it can be the sink.
struct MidiRecorder {
    seen: Arc<Mutex<Vec<Vec<MidiEvent>>>>,
    connected: Arc<Mutex<Vec<bool>>>,
    inputs: [PortSpec; 1],
    outputs: [PortSpec; 1],
}

impl Node for MidiRecorder {
    fn name(&self) -> &str {
        "midi_recorder"
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
        _outputs: &mut OutputPorts<'_>,
    ) -> ProcessResult {
        if let Ok(mut connected) = self.connected.lock() {
            connected.push(inputs.is_connected(0));
        }
        let events = inputs.midi(0).map(<[MidiEvent]>::to_vec).unwrap_or_default();
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(events);
        }
        Ok(())
    }
}

/// How a [`Flaky`] node misbehaves.
#[derive(Clone, Copy)]
enum Fault {
    SkipOnce,
    FailOnce,
}

/// Writes `value` to its output, except on the first call where it skips or fails.
struct Flaky {
    value: f32,
    fault: Fault,
    calls: Arc<AtomicUsize>,
    outputs: [PortSpec; 1],
}

impl Flaky {
    fn new(value: f32, fault: Fault, calls: Arc<AtomicUsize>) -> Self {
        Self {
            value,
            fault,
            calls,
            outputs: [PortSpec::audio("out", 1)],
        }
    }
}

impl Node for Flaky {
    fn name(&self) -> &str {
        "flaky"
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
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(out) = outputs.audio(0) {
            out.fill(self.value);
        }
        if call == 0 {
            return Err(match self.fault {
                Fault::SkipOnce => ProcessError::Skipped {
                    reason: "not ready",
                },
                Fault::FailOnce => ProcessError::Failed {
                    reason: "device lost",
                },
            });
        }
        Ok(())
    }
}

// ============================================================================
// 1. Gain chains and fan-in
// ============================================================================

#[test]
fn gain_chain_scales_source() {
    let mut topo = Topology::new();
    let src = topo.add_node(Constant::new(1.0, 1));
    let gain = topo.add_node(Gain::new(0.5, 1));
    topo.connect(src, 0, gain, 0);
    assert_eq!(render_blocks(topo, 4, 1), vec![0.5; 4]);
}

#[test]
fn fan_in_sums_weighted_sources() {
    let mut topo = Topology::new();
    let a = topo.add_node(Constant::new(1.0, 1));
    let b = topo.add_node(Constant::new(1.0, 1));
    let mix = topo.add_node(Gain::new(1.0, 1));
    topo.connect_with_gain(a, 0, mix, 0, 0.5);
    topo.connect_with_gain(b, 0, mix, 0, 0.25);
    assert_eq!(render_blocks(topo, 8, 2), vec![0.75; 16]);
}

#[test]
fn edge_gain_scales_contribution() {
    let mut topo = Topology::new();
    let a = topo.add_node(Constant::new(1.0, 2));
    let b = topo.add_node(Constant::new(1.0, 2));
    let mix = topo.add_node(Gain::new(1.0, 2));
    topo.connect_with_gain(a, 0, mix, 0, 0.5);
    topo.connect_with_gain(b, 0, mix, 0, -0.25);
    for sample in render_blocks(topo, 4, 1) {
        assert!((sample - 0.25).abs() < 1e-6);
    }
}

#[test]
fn render_order_respects_edges_declared_backwards() {
    let mut topo = Topology::new();
    let out = topo.add_node(Gain::new(2.0, 1));
    let mid = topo.add_node(Gain::new(0.5, 1));
    let src = topo.add_node(Constant::new(1.0, 1));
    topo.connect(mid, 0, out, 0);
    topo.connect(src, 0, mid, 0);
    topo.set_sink(out);
    let Ok(plan) = compile(topo, 4) else {
        panic!("compile failed");
    };
    assert_eq!(plan.render_order(), &[src, mid, out]);
}

// ============================================================================
// 2. Compile errors
// ============================================================================

#[test]
fn cycle_is_rejected_and_topology_returned() {
    let mut topo = Topology::new();
    let a = topo.add_node(Gain::new(1.0, 1));
    let b = topo.add_node(Gain::new(1.0, 1));
    topo.connect(a, 0, b, 0);
    topo.connect(b, 0, a, 0);
    let Err(failure) = compile(topo, 64) else {
        panic!("cycle compiled");
    };
    assert!(matches!(failure.error, CompileError::CycleDetected { .. }));
    assert_eq!(failure.topology.node_count(), 2);
    assert_eq!(failure.topology.edge_count(), 2);
}

#[test]
fn kind_mismatch_is_rejected() {
    let mut topo = Topology::new();
    let midi = topo.add_node(MidiSource::new(Vec::new()));
    let gain = topo.add_node(Gain::new(1.0, 1));
    topo.connect(midi, 0, gain, 0);
    let Err(failure) = compile(topo, 64) else {
        panic!("kind mismatch compiled");
    };
    assert!(matches!(failure.error, CompileError::KindMismatch { .. }));
}

#[test]
fn compensation_limit_is_enforced() {
    let mut topo = Topology::new();
    let src = topo.add_node(Impulse::new(1));
    let wet = topo.add_node(Delay::new(0, 10_000, 1));
    let dry = topo.add_node(Gain::new(1.0, 1));
    let sum = topo.add_node(Gain::new(1.0, 1));
    topo.connect(src, 0, wet, 0);
    topo.connect(src, 0, dry, 0);
    topo.connect(wet, 0, sum, 0);
    topo.connect(dry, 0, sum, 0);
    let options = CompileOptions::new(64).with_max_compensation(1000);
    let Err(failure) = compile_with(topo, options) else {
        panic!("oversized compensation compiled");
    };
    assert_eq!(
        failure.error,
        CompileError::CompensationTooLarge {
            required: 10_000,
            limit: 1000
        }
    );
}

// ============================================================================
// 3. Latency compensation
// ============================================================================

/// Impulse split into a 3-sample delay and a dry pass-through, then summed.
fn aligned_paths(delay: Delay) -> (Topology, loam_core::NodeId, loam_core::NodeId) {
    let mut topo = Topology::new();
    let src = topo.add_node(Impulse::new(1));
    let wet = topo.add_node(delay);
    let dry = topo.add_node(Gain::new(1.0, 1));
    let sum = topo.add_node(Gain::new(1.0, 1));
    topo.connect(src, 0, wet, 0);
    topo.connect(src, 0, dry, 0);
    topo.connect(wet, 0, sum, 0);
    topo.connect(dry, 0, sum, 0);
    (topo, dry, sum)
}

#[test]
fn parallel_paths_arrive_aligned() {
    let (topo, _, _) = aligned_paths(Delay::fixed(3, 1));
    let out = render_blocks(topo, 4, 2);
    assert_eq!(out, vec![0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn alignment_carries_across_blocks() {
    let (topo, _, _) = aligned_paths(Delay::fixed(6, 1));
    let out = render_blocks(topo, 4, 3);
    let peak = out.iter().position(|&s| s != 0.0);
    assert_eq!(peak, Some(6));
    assert_eq!(out[6], 2.0);
    assert_eq!(out.iter().filter(|&&s| s != 0.0).count(), 1);
}

#[test]
fn latency_change_is_picked_up_by_compensator() {
    let delay = Delay::new(0, 16, 1);
    let handle = delay.handle();
    let (topo, dry, _) = aligned_paths(delay);
    let Ok(mut plan) = compile(topo, 8) else {
        panic!("compile failed");
    };
    let compensator = plan.compensator();
    let monitor = Arc::clone(plan.monitor());
    let mut engine = RenderEngine::for_plan(&plan);
    let mut ctx = ProcessContext::new(SAMPLE_RATE, 8);

    assert_eq!(monitor.compensation(dry), Some(0));
    assert!(plan.compensation_bound() >= 16);

    handle.set(5);
    engine.process(&mut plan, &mut ctx);
    let Some(report) = compensator.refresh_if_dirty() else {
        panic!("latency change not reported");
    };
    assert!(report.changed >= 1);
    assert_eq!(report.max_compensation, 5);
    assert_eq!(monitor.compensation(dry), Some(5));
    assert_eq!(monitor.misaligned(), 0);

    // Nothing new to report.
    engine.process(&mut plan, &mut ctx);
    assert!(compensator.refresh_if_dirty().is_none());
}

/// Impulse feeding a 3-sample delay and the sum directly: no node in between.
fn direct_diamond() -> (Topology, loam_core::NodeId, loam_core::NodeId) {
    let mut topo = Topology::new();
    let src = topo.add_node(Impulse::new(1));
    let wet = topo.add_node(Delay::fixed(3, 1));
    let sum = topo.add_node(Gain::new(1.0, 1));
    topo.connect(src, 0, wet, 0);
    topo.connect(wet, 0, sum, 0);
    topo.connect(src, 0, sum, 0);
    (topo, src, sum)
}

#[test]
fn fan_out_to_disagreeing_consumers_is_aligned() {
    let (topo, src, sum) = direct_diamond();
    let Ok(mut plan) = compile(topo, 4) else {
        panic!("compile failed");
    };
    assert_eq!(plan.route_line_count(), 1);
    assert_eq!(plan.monitor().route_compensation(src, sum), Some(3));
    assert_eq!(plan.monitor().misaligned(), 0);

    let mut engine = RenderEngine::for_plan(&plan);
    let mut ctx = ProcessContext::new(SAMPLE_RATE, 4);
    let mut out = Vec::new();
    for _ in 0..2 {
        out.extend_from_slice(engine.process(&mut plan, &mut ctx).as_slice());
    }
    assert_eq!(out, vec![0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0]);

    let report = plan.compensator().refresh();
    assert_eq!(report.misaligned, 0);
    assert_eq!(plan.monitor().misaligned(), 0);
}

#[test]
fn fan_out_line_follows_latency_change() {
    let mut topo = Topology::new();
    let src = topo.add_node(Impulse::new(1));
    let delay = Delay::new(2, 8, 1);
    let handle = delay.handle();
    let wet = topo.add_node(delay);
    let sum = topo.add_node(Gain::new(1.0, 1));
    topo.connect(src, 0, wet, 0);
    topo.connect(wet, 0, sum, 0);
    topo.connect(src, 0, sum, 0);
    let Ok(mut plan) = compile(topo, 4) else {
        panic!("compile failed");
    };
    let compensator = plan.compensator();
    let mut engine = RenderEngine::for_plan(&plan);
    let mut ctx = ProcessContext::new(SAMPLE_RATE, 4);

    handle.set(6);
    engine.process(&mut plan, &mut ctx);
    assert!(compensator.refresh_if_dirty().is_some());
    assert_eq!(plan.monitor().route_compensation(src, sum), Some(6));
    assert_eq!(plan.monitor().misaligned(), 0);
    assert_eq!(plan.monitor().compensation_clamps(), 0);
}

/// A node whose latency can exceed the maximum it declared at compile time.
struct Unruly {
    latency: Arc<AtomicU64>,
    ports: [PortSpec; 1],
}

impl Node for Unruly {
    fn name(&self) -> &str {
        "unruly"
    }
    fn inputs(&self) -> &[PortSpec] {
        &self.ports
    }
    fn outputs(&self) -> &[PortSpec] {
        &self.ports
    }
    fn latency_samples(&self) -> u64 {
        self.latency.load(Ordering::Relaxed)
    }
    fn max_latency_samples(&self) -> u64 {
        2
    }
    fn process(
        &mut self,
        _ctx: &ProcessContext,
        inputs: &mut InputView<'_>,
        outputs: &mut OutputPorts<'_>,
    ) -> ProcessResult {
        if let Some(out) = outputs.audio(0) {
            inputs.mix_audio_into(0, out.as_mut_slice());
        }
        Ok(())
    }
}

#[test]
fn compensation_beyond_declared_maximum_is_clamped() {
    let latency = Arc::new(AtomicU64::new(0));
    let mut topo = Topology::new();
    let src = topo.add_node(Constant::new(0.5, 1));
    let wet = topo.add_node(Unruly {
        latency: Arc::clone(&latency),
        ports: [PortSpec::audio("io", 1)],
    });
    let dry = topo.add_node(Gain::new(1.0, 1));
    let sum = topo.add_node(Gain::new(1.0, 1));
    topo.connect(src, 0, wet, 0);
    topo.connect(src, 0, dry, 0);
    topo.connect(wet, 0, sum, 0);
    topo.connect(dry, 0, sum, 0);
    let Ok(mut plan) = compile(topo, 8) else {
        panic!("compile failed");
    };
    assert_eq!(plan.compensation_bound(), 2);
    let compensator = plan.compensator();
    let monitor = Arc::clone(plan.monitor());
    let mut engine = RenderEngine::for_plan(&plan);
    let mut ctx = ProcessContext::new(SAMPLE_RATE, 8);

    latency.store(20, Ordering::Relaxed);
    engine.process(&mut plan, &mut ctx);
    let Some(report) = compensator.refresh_if_dirty() else {
        panic!("latency change not reported");
    };
    assert_eq!(report.max_compensation, 20);
    assert_eq!(monitor.compensation(dry), Some(20));

    for _ in 0..4 {
        let out = engine.process(&mut plan, &mut ctx);
        assert!(out.as_slice().iter().all(|s| s.is_finite()));
    }
    assert!(monitor.compensation_clamps() >= 4);
    assert!(monitor.failed_nodes().is_empty());
}

// ============================================================================
// 4. Failure containment
// ============================================================================

#[test]
fn skipped_node_is_silent_for_one_block() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut topo = Topology::new();
    let flaky = topo.add_node(Flaky::new(0.5, Fault::SkipOnce, Arc::clone(&calls)));
    let steady = topo.add_node(Constant::new(0.25, 1));
    let mix = topo.add_node(Gain::new(1.0, 1));
    topo.connect(flaky, 0, mix, 0);
    topo.connect(steady, 0, mix, 0);

    let out = render_blocks(topo, 2, 3);
    assert_eq!(out, vec![0.25, 0.25, 0.75, 0.75, 0.75, 0.75]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn failed_node_is_never_called_again() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut topo = Topology::new();
    let flaky = topo.add_node(Flaky::new(0.5, Fault::FailOnce, Arc::clone(&calls)));
    let steady = topo.add_node(Constant::new(0.25, 1));
    let mix = topo.add_node(Gain::new(1.0, 1));
    topo.connect(flaky, 0, mix, 0);
    topo.connect(steady, 0, mix, 0);
    let Ok(mut plan) = compile(topo, 2) else {
        panic!("compile failed");
    };
    let mut engine = RenderEngine::for_plan(&plan);
    let mut ctx = ProcessContext::new(SAMPLE_RATE, 2);

    for _ in 0..4 {
        assert_eq!(engine.process(&mut plan, &mut ctx).as_slice(), &[0.25, 0.25]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(plan.monitor().is_failed(flaky));
    assert_eq!(plan.monitor().failed_nodes(), vec![flaky]);

    // Reset keeps the failed set.
    plan.reset();
    engine.process(&mut plan, &mut ctx);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// 5. Event merging
// ============================================================================

#[test]
fn midi_merge_orders_by_frame_then_edge() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let connected = Arc::new(Mutex::new(Vec::new()));
    let mut topo = Topology::new();
    let a = topo.add_node(MidiSource::new(vec![note_on(5, 60), note_on(1, 61)]));
    let b = topo.add_node(MidiSource::new(vec![note_on(5, 64), note_on(0, 65)]));
    let rec = topo.add_node(MidiRecorder {
        seen: Arc::clone(&seen),
        connected: Arc::clone(&connected),
        inputs: [PortSpec::midi("in")],
        outputs: [PortSpec::audio("out", 1)],
    });
    topo.connect(a, 0, rec, 0);
    topo.connect(b, 0, rec, 0);
    render_blocks(topo, 8, 1);

    let Ok(seen) = seen.lock() else {
        panic!("poisoned");
    };
    let notes: Vec<(u32, u8)> = seen[0]
        .iter()
        .map(|e| match e.message {
            MidiMessage::NoteOn { note, .. } => (e.frame, note),
            _ => (e.frame, 0),
        })
        .collect();
    assert_eq!(notes, vec![(0, 65), (1, 61), (5, 60), (5, 64)]);
}

#[test]
fn unconnected_port_reports_not_connected() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let connected = Arc::new(Mutex::new(Vec::new()));
    let mut topo = Topology::new();
    topo.add_node(MidiRecorder {
        seen: Arc::clone(&seen),
        connected: Arc::clone(&connected),
        inputs: [PortSpec::midi("in")],
        outputs: [PortSpec::audio("out", 1)],
    });
    render_blocks(topo, 8, 1);
    let Ok(connected) = connected.lock() else {
        panic!("poisoned");
    };
    assert_eq!(connected.as_slice(), &[false]);
}

// ============================================================================
// 6. Mixer routing
// ============================================================================

#[test]
fn routing_validate_and_order() {
    let mut graph = RoutingGraph::new(2);
    let drums = graph.add_bus(Bus::new("drums"));
    let reverb = graph.add_bus(Bus::new("reverb"));
    let kick = graph.add_track(
        Track::new("kick")
            .routed_to(OutputTarget::Bus(drums))
            .with_send(AuxSend::post(reverb, 0.2)),
    );
    let snare = graph.add_track(Track::new("snare").routed_to(OutputTarget::Bus(drums)));
    if let Some(bus) = graph.bus_mut(drums) {
        bus.sends.push(AuxSend::post(reverb, 0.1));
    }

    assert_eq!(graph.validate(), Ok(()));
    assert_eq!(
        graph.render_order(),
        vec![
            RoutingNode::Track(kick),
            RoutingNode::Track(snare),
            RoutingNode::Bus(drums),
            RoutingNode::Bus(reverb),
            RoutingNode::Master,
        ]
    );
}

#[test]
fn flattened_routing_renders_through_buses() {
    let mut graph = RoutingGraph::new(2);
    let drums = graph.add_bus(Bus::new("drums").with_volume(0.5));
    let kick = graph.add_track(Track::new("kick").routed_to(OutputTarget::Bus(drums)));
    let Ok(flat) = graph.flatten(vec![(kick, Box::new(Constant::new(1.0, 2)) as Box<dyn Node>)])
    else {
        panic!("flatten failed");
    };
    let master = flat.master;
    let Ok(plan) = compile(flat.topology, 4) else {
        panic!("compile failed");
    };
    assert_eq!(plan.render_order().last(), Some(&master));

    let Ok(flat) = graph.flatten(vec![(kick, Box::new(Constant::new(1.0, 2)) as Box<dyn Node>)])
    else {
        panic!("flatten failed");
    };
    assert_eq!(render_blocks(flat.topology, 4, 1), vec![0.5; 8]);
}
