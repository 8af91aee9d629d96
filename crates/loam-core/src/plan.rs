//! The compiled execution plan and its read-only monitor.
//!
//! A [`CompiledPlan`] is what the compiler hands to the render engine. Its
//! shape is fixed: nodes in render order, one buffer per output port, a flat
//! routing table, and one delay line per output port. Routes out of a node
//! that feeds consumers at different latencies get a buffer and delay line
//! of their own. Nothing in it is resized after compilation.
//!
//! [`PlanMonitor`] is the part other threads may look at. It is shared through
//! an `Arc` and holds only immutable data and atomics, so reading it never
//! interrupts rendering.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::delay::PortDelay;
use crate::latency::{LatencyCompensator, LatencyGraph, LatencyState};
use crate::node::Node;
use crate::signal::SignalBuffer;
use crate::topology::NodeId;

/// One flattened edge of the routing table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Route {
    /// Index of the producing output buffer.
    pub source_buffer: usize,
    /// Buffer the consumer reads: the route's delay line, or `source_buffer`.
    pub input_buffer: usize,
    /// Render position of the consuming node.
    pub dest_node: usize,
    /// Input port on the consuming node.
    pub dest_port: usize,
    /// Linear gain.
    pub gain: f32,
}

/// A per-route delay line, run just before its consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RouteLine {
    /// Producer output copied into the line.
    pub(crate) source_buffer: usize,
    /// The line's own buffer.
    pub(crate) buffer: usize,
    /// Link whose compensation the line applies.
    pub(crate) link: usize,
    pub(crate) capacity: u64,
}

/// Point-in-time view of one node, for monitoring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeReport {
    /// Topology id.
    pub id: NodeId,
    /// Node name.
    pub name: String,
    /// Whether the node has failed.
    pub failed: bool,
    /// Last reported intrinsic latency.
    pub intrinsic_latency: u64,
    /// Compensation currently applied.
    pub compensation: u64,
}

/// Thread-safe introspection of a running plan.
#[derive(Debug)]
pub struct PlanMonitor {
    order: Vec<NodeId>,
    names: Vec<String>,
    positions: Vec<usize>,
    failed: Vec<AtomicBool>,
    latency: Arc<LatencyState>,
    graph: Arc<LatencyGraph>,
    compensation_bound: u64,
    uncompensated_control: Vec<NodeId>,
    compensation_clamps: AtomicU64,
    event_overflows: AtomicU64,
    blocks_rendered: AtomicU64,
    misaligned: AtomicU64,
}

impl PlanMonitor {
    pub(crate) fn new(
        order: Vec<NodeId>,
        names: Vec<String>,
        latency: Arc<LatencyState>,
        graph: Arc<LatencyGraph>,
        compensation_bound: u64,
        uncompensated_control: Vec<NodeId>,
    ) -> Self {
        let slots = order.iter().map(|id| id.0 as usize + 1).max().unwrap_or(0);
        let mut positions = vec![usize::MAX; slots];
        for (position, id) in order.iter().enumerate() {
            positions[id.0 as usize] = position;
        }
        let failed = order.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            order,
            names,
            positions,
            failed,
            latency,
            graph,
            compensation_bound,
            uncompensated_control,
            compensation_clamps: AtomicU64::new(0),
            event_overflows: AtomicU64::new(0),
            blocks_rendered: AtomicU64::new(0),
            misaligned: AtomicU64::new(0),
        }
    }

    /// Node ids in the order they are rendered.
    pub fn render_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Render position of a node.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.positions
            .get(id.0 as usize)
            .copied()
            .filter(|&p| p != usize::MAX)
    }

    /// Name of a node.
    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.position(id).map(|p| self.names[p].as_str())
    }

    /// Returns true if the node has reported an unrecoverable failure.
    pub fn is_failed(&self, id: NodeId) -> bool {
        self.position(id).is_some_and(|p| self.is_failed_at(p))
    }

    /// Ids of every failed node, in render order.
    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .enumerate()
            .filter(|&(p, _)| self.is_failed_at(p))
            .map(|(_, &id)| id)
            .collect()
    }

    /// Last reported intrinsic latency of a node.
    pub fn intrinsic_latency(&self, id: NodeId) -> Option<u64> {
        self.position(id).map(|p| self.latency.intrinsic(p))
    }

    /// Compensation currently applied to a node.
    pub fn compensation(&self, id: NodeId) -> Option<u64> {
        self.position(id).map(|p| self.latency.compensation(p))
    }

    /// Delay applied at `to`'s input on top of `from`'s own compensation.
    ///
    /// `None` if the two nodes are not directly connected.
    pub fn route_compensation(&self, from: NodeId, to: NodeId) -> Option<u64> {
        let link = self.graph.link(self.position(from)?, self.position(to)?)?;
        Some(self.latency.link_compensation(link))
    }

    /// Nodes with control outputs that latency compensation would delay.
    ///
    /// Control ramps are never delayed, so these stay early by that amount.
    pub fn uncompensated_control(&self) -> &[NodeId] {
        &self.uncompensated_control
    }

    /// Per-node snapshot in render order.
    pub fn snapshot(&self) -> Vec<NodeReport> {
        self.order
            .iter()
            .enumerate()
            .map(|(p, &id)| NodeReport {
                id,
                name: self.names[p].clone(),
                failed: self.is_failed_at(p),
                intrinsic_latency: self.latency.intrinsic(p),
                compensation: self.latency.compensation(p),
            })
            .collect()
    }

    /// Longest delay line in the plan, in frames.
    pub fn compensation_bound(&self) -> u64 {
        self.compensation_bound
    }

    /// Times a published compensation exceeded the delay-line capacity.
    pub fn compensation_clamps(&self) -> u64 {
        self.compensation_clamps.load(Ordering::Relaxed)
    }

    /// Events dropped because a pre-reserved container was full.
    pub fn event_overflows(&self) -> u64 {
        self.event_overflows.load(Ordering::Relaxed)
    }

    /// Blocks rendered with this plan.
    pub fn blocks_rendered(&self) -> u64 {
        self.blocks_rendered.load(Ordering::Relaxed)
    }

    /// Routes the last compensation pass could not fully align.
    pub fn misaligned(&self) -> u64 {
        self.misaligned.load(Ordering::Relaxed)
    }

    /// Shared latency state.
    pub fn latency(&self) -> &LatencyState {
        &self.latency
    }

    /// Producer and consumer positions the compensator works on.
    pub fn latency_graph(&self) -> &Arc<LatencyGraph> {
        &self.graph
    }

    // --- render-side updates ---

    #[inline]
    pub(crate) fn is_failed_at(&self, position: usize) -> bool {
        self.failed[position].load(Ordering::Acquire)
    }

    /// One-way transition. Returns true on the first call for this node.
    #[inline]
    pub(crate) fn mark_failed(&self, position: usize) -> bool {
        !self.failed[position].swap(true, Ordering::Release)
    }

    #[inline]
    pub(crate) fn count_clamp(&self) {
        self.compensation_clamps.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_overflow(&self, events: usize) {
        if events > 0 {
            self.event_overflows
                .fetch_add(events as u64, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn count_block(&self) {
        self.blocks_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_misaligned(&self, routes: u64) {
        self.misaligned.store(routes, Ordering::Relaxed);
    }
}

/// An immutable-shape execution artifact for one block size.
///
/// Owns every node. Built by [`compile`](crate::compile); run by
/// [`RenderEngine`](crate::RenderEngine).
pub struct CompiledPlan {
    pub(crate) nodes: Vec<Box<dyn Node>>,
    /// First output buffer of each node.
    pub(crate) output_base: Vec<usize>,
    pub(crate) output_count: Vec<usize>,
    /// Each node's input ports as a range into `port_routes`.
    pub(crate) input_ports: Vec<Range<usize>>,
    /// Each input port's routes as a range into `routes`.
    pub(crate) port_routes: Vec<Range<usize>>,
    pub(crate) routes: Vec<Route>,
    pub(crate) lines: Vec<RouteLine>,
    /// Each node's incoming route lines as a range into `lines`.
    pub(crate) node_lines: Vec<Range<usize>>,
    pub(crate) buffers: Vec<SignalBuffer>,
    pub(crate) delays: Vec<PortDelay>,
    /// Delay-line length of each node's outputs.
    pub(crate) delay_capacity: Vec<u64>,
    pub(crate) sink_buffer: usize,
    pub(crate) sink_channels: usize,
    pub(crate) block_size: usize,
    pub(crate) event_capacity: usize,
    /// Most routes feeding any single node.
    pub(crate) max_node_routes: usize,
    pub(crate) max_node_inputs: usize,
    /// Widest audio input port, in samples per block.
    pub(crate) max_input_samples: usize,
    pub(crate) monitor: Arc<PlanMonitor>,
}

impl CompiledPlan {
    /// Frames per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Channels of the rendered output.
    pub fn output_channels(&self) -> usize {
        self.sink_channels
    }

    /// Node ids in render order.
    pub fn render_order(&self) -> &[NodeId] {
        self.monitor.render_order()
    }

    /// The flattened routing table, grouped by destination port.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Number of routes with their own delay line.
    pub fn route_line_count(&self) -> usize {
        self.lines.len()
    }

    /// Number of pre-allocated port and route-line buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Longest delay line in the plan, in frames.
    pub fn compensation_bound(&self) -> u64 {
        self.monitor.compensation_bound()
    }

    /// Shared monitor for introspection from any thread.
    pub fn monitor(&self) -> &Arc<PlanMonitor> {
        &self.monitor
    }

    /// A compensator bound to this plan's latency state, for a background thread.
    pub fn compensator(&self) -> LatencyCompensator {
        LatencyCompensator::new(
            Arc::clone(self.monitor.latency_graph()),
            Arc::clone(&self.monitor),
        )
    }

    /// The buffer behind `port` of `node`, as of the last rendered block.
    pub fn output(&self, node: NodeId, port: usize) -> Option<&SignalBuffer> {
        let position = self.monitor.position(node)?;
        if port >= self.output_count[position] {
            return None;
        }
        self.buffers.get(self.output_base[position] + port)
    }

    /// Resets every node and clears all buffers and delay history.
    ///
    /// The failed set is left alone; a failed node stays failed until the
    /// topology is recompiled.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.reset();
        }
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        for delay in &mut self.delays {
            delay.clear();
        }
    }
}

impl core::fmt::Debug for CompiledPlan {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompiledPlan")
            .field("nodes", &self.nodes.len())
            .field("buffers", &self.buffers.len())
            .field("routes", &self.routes.len())
            .field("route_lines", &self.lines.len())
            .field("block_size", &self.block_size)
            .field("compensation_bound", &self.compensation_bound())
            .finish()
    }
}
