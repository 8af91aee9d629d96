//! The per-block render loop.
//!
//! [`RenderEngine::process`] walks a [`CompiledPlan`] in topological order and
//! performs no heap allocation once [`RenderEngine::prepare`] has sized the
//! scratch space for that plan. Per node:
//!
//! 1. Skip if failed (its outputs hold silence and are never rewritten)
//! 2. Copy each incoming route line's producer output into the line and delay
//!    it by the published link compensation
//! 3. Record `(input buffer, gain)` pairs for each input port
//! 4. Clear the node's outputs and invoke it through an [`InputView`]
//! 5. On `Skipped`, silence for this block; on `Failed`, silence and mark failed
//! 6. Run the outputs through the node's delay lines at the published compensation
//! 7. Forward the node's current latency to the compensator
//!
//! Then the sink buffer is copied to the caller-visible output and the context
//! advances by one block.

use std::ops::Range;

use crate::merge::InputView;
use crate::node::{OutputPorts, ProcessContext, ProcessError};
use crate::plan::{CompiledPlan, PlanMonitor};
use crate::signal::{AudioBuffer, EventList, MidiEvent, Trigger};

/// Working storage for one plan shape.
///
/// Building it allocates, so it can be created on a control thread with
/// [`for_plan`](Self::for_plan) and handed to the render thread.
#[derive(Debug)]
pub struct RenderScratch {
    sources: Vec<(usize, f32)>,
    spans: Vec<Range<usize>>,
    audio: Vec<f32>,
    midi: EventList<MidiEvent>,
    triggers: EventList<Trigger>,
    output: AudioBuffer,
}

impl RenderScratch {
    /// Allocates scratch large enough for every node in `plan`.
    pub fn for_plan(plan: &CompiledPlan) -> Self {
        let merged_events = plan.event_capacity * plan.max_node_routes.max(1);
        Self {
            sources: Vec::with_capacity(plan.max_node_routes),
            spans: Vec::with_capacity(plan.max_node_inputs),
            audio: vec![0.0; plan.max_input_samples],
            midi: EventList::with_capacity(merged_events),
            triggers: EventList::with_capacity(merged_events),
            output: AudioBuffer::new(plan.block_size, plan.sink_channels),
        }
    }

    /// Returns true if this scratch can render `plan` without allocating.
    pub fn fits(&self, plan: &CompiledPlan) -> bool {
        let merged_events = plan.event_capacity * plan.max_node_routes.max(1);
        self.sources.capacity() >= plan.max_node_routes
            && self.spans.capacity() >= plan.max_node_inputs
            && self.audio.len() >= plan.max_input_samples
            && self.midi.capacity() >= merged_events
            && self.triggers.capacity() >= merged_events
            && self.output.frames() == plan.block_size
            && self.output.channels() == plan.sink_channels
    }
}

impl Default for RenderScratch {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            spans: Vec::new(),
            audio: Vec::new(),
            midi: EventList::with_capacity(0),
            triggers: EventList::with_capacity(0),
            output: AudioBuffer::new(0, 1),
        }
    }
}

/// Executes compiled plans block by block.
#[derive(Debug, Default)]
pub struct RenderEngine {
    scratch: RenderScratch,
}

impl RenderEngine {
    /// Creates an engine with empty scratch. Call [`prepare`](Self::prepare) before rendering.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine already prepared for `plan`.
    pub fn for_plan(plan: &CompiledPlan) -> Self {
        Self {
            scratch: RenderScratch::for_plan(plan),
        }
    }

    /// Sizes scratch space for `plan`. Allocates only if the current scratch is too small.
    pub fn prepare(&mut self, plan: &CompiledPlan) {
        if !self.scratch.fits(plan) {
            self.scratch = RenderScratch::for_plan(plan);
        }
    }

    /// Installs scratch built elsewhere, returning the previous one.
    pub fn adopt_scratch(&mut self, scratch: RenderScratch) -> RenderScratch {
        core::mem::replace(&mut self.scratch, scratch)
    }

    /// Returns true if [`process`](Self::process) will not allocate for `plan`.
    pub fn is_prepared_for(&self, plan: &CompiledPlan) -> bool {
        self.scratch.fits(plan)
    }

    /// The output of the last rendered block.
    pub fn output(&self) -> &AudioBuffer {
        &self.scratch.output
    }

    /// Renders one block and returns the sink's output.
    ///
    /// Allocation-free when the engine is prepared for `plan`. If it is not,
    /// the scratch is resized first.
    pub fn process(&mut self, plan: &mut CompiledPlan, ctx: &mut ProcessContext) -> &AudioBuffer {
        if !self.scratch.fits(plan) {
            self.prepare(plan);
        }

        let CompiledPlan {
            nodes,
            output_base,
            output_count,
            input_ports,
            port_routes,
            routes,
            lines,
            node_lines,
            buffers,
            delays,
            delay_capacity,
            sink_buffer,
            block_size,
            monitor,
            ..
        } = plan;
        let scratch = &mut self.scratch;
        let latency = monitor.latency();
        let clock = ctx.clock_samples();

        for (pos, node) in nodes.iter_mut().enumerate() {
            if monitor.is_failed_at(pos) {
                continue;
            }

            // A line sits above its producer's output and below this node's.
            for line in &lines[node_lines[pos].clone()] {
                let applied = clamp_compensation(
                    monitor,
                    latency.link_compensation(line.link),
                    line.capacity,
                );
                let (below, above) = buffers.split_at_mut(line.buffer);
                let buffer = &mut above[0];
                let mut dropped = buffer.copy_from(&below[line.source_buffer]);
                dropped += delays[line.buffer].apply(buffer, applied, clock, *block_size);
                monitor.count_overflow(dropped);
            }

            scratch.sources.clear();
            scratch.spans.clear();
            for port in &port_routes[input_ports[pos].clone()] {
                let start = scratch.sources.len();
                for route in &routes[port.clone()] {
                    scratch.sources.push((route.input_buffer, route.gain));
                }
                scratch.spans.push(start..scratch.sources.len());
            }

            // Producers sit earlier in the buffer array than this node's outputs.
            let base = output_base[pos];
            let count = output_count[pos];
            let (upstream, rest) = buffers.split_at_mut(base);
            let outputs = &mut rest[..count];
            for buffer in outputs.iter_mut() {
                buffer.clear();
            }

            let mut view = InputView::new(
                &scratch.spans,
                &scratch.sources,
                upstream,
                &mut scratch.audio,
                &mut scratch.midi,
                &mut scratch.triggers,
            );
            let result = node.process(ctx, &mut view, &mut OutputPorts::new(outputs));
            monitor.count_overflow(view.dropped_events());

            match result {
                Ok(()) => {}
                Err(ProcessError::Skipped { .. }) => {
                    for buffer in outputs.iter_mut() {
                        buffer.clear();
                    }
                }
                Err(ProcessError::Failed { reason }) => {
                    if monitor.mark_failed(pos) {
                        #[cfg(feature = "tracing")]
                        tracing::error!("node_failed: {} ({reason})", node.name());
                        #[cfg(not(feature = "tracing"))]
                        let _ = reason;
                    }
                    for buffer in outputs.iter_mut() {
                        buffer.clear();
                    }
                    continue;
                }
            }

            let applied = clamp_compensation(monitor, latency.compensation(pos), delay_capacity[pos]);
            for (buffer, delay) in outputs.iter_mut().zip(delays[base..base + count].iter_mut()) {
                let dropped = delay.apply(buffer, applied, clock, *block_size);
                monitor.count_overflow(dropped);
            }

            latency.report_intrinsic(pos, node.latency_samples());
        }

        if let Some(audio) = buffers[*sink_buffer].as_audio() {
            scratch.output.copy_from(audio.as_slice());
        }
        monitor.count_block();
        ctx.advance();
        &self.scratch.output
    }
}

/// Limits a published compensation to what a delay line can hold, counting clamps.
#[inline]
fn clamp_compensation(monitor: &PlanMonitor, wanted: u64, capacity: u64) -> u64 {
    if wanted > capacity {
        monitor.count_clamp();
        capacity
    } else {
        wanted
    }
}
