//! Graph compiler: [`Topology`] → [`CompiledPlan`].
//!
//! Compilation runs in two phases. Analysis only borrows the topology and
//! can fail; assembly consumes it and cannot. A failed compile therefore hands
//! the topology back untouched inside [`CompileFailure`] and no partial plan
//! ever exists.
//!
//! # Analysis
//!
//! 1. Edge validation: node and port indices, signal kinds, audio channel counts
//! 2. Kahn's topological sort with a min-heap ready set, so ties between
//!    independent nodes always resolve to the lowest node id
//! 3. Routing table, grouped by destination port, edges in declaration order
//! 4. Buffer layout in render order: one buffer per output port, preceded by
//!    a line buffer for every route that may need its own delay
//! 5. Sink selection: the designated node, or the last node in render order
//!    with an audio output
//! 6. Delay-line sizing from declared maximum latencies, plus the initial
//!    compensation from current latencies
//!
//! A route gets a line when its producer feeds more than one consumer, it
//! carries audio or events, and its consumer can arrive late at all. The
//! producer's own delay aligns it with its earliest consumer; the line holds
//! the rest.
//!
//! Because buffers are laid out in render order, every buffer a node reads,
//! line buffers included, sits below its own first output buffer. The render engine relies on this to
//! split the buffer array into a read-only upstream half and the node's own
//! outputs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::ops::Range;
use std::sync::Arc;

use crate::delay::PortDelay;
use crate::error::{CompileError, CompileFailure};
use crate::latency::{
    Compensation, LatencyGraph, LatencyState, compute_compensation, count_misaligned,
};
use crate::node::Node;
use crate::plan::{CompiledPlan, PlanMonitor, Route, RouteLine};
use crate::signal::{PortSpec, SignalBuffer, SignalKind};
use crate::topology::{EdgeId, NodeId, Topology};

/// Default capacity of every MIDI and trigger buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default ceiling on delay-line length, in frames.
pub const DEFAULT_MAX_COMPENSATION: u64 = 1 << 20;

/// Settings for [`compile_with`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompileOptions {
    /// Frames per block.
    pub block_size: usize,
    /// Events each MIDI or trigger buffer can hold per block.
    pub event_capacity: usize,
    /// Longest delay line the compiler may allocate.
    pub max_compensation: u64,
}

impl CompileOptions {
    /// Defaults for the given block size.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_compensation: DEFAULT_MAX_COMPENSATION,
        }
    }

    /// Sets the per-buffer event capacity.
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Sets the delay-line ceiling.
    #[must_use]
    pub fn with_max_compensation(mut self, samples: u64) -> Self {
        self.max_compensation = samples;
        self
    }
}

/// Compiles `topology` at a fixed block size with default options.
pub fn compile(topology: Topology, block_size: usize) -> Result<CompiledPlan, CompileFailure> {
    compile_with(topology, CompileOptions::new(block_size))
}

/// Compiles `topology` with explicit options.
pub fn compile_with(
    topology: Topology,
    options: CompileOptions,
) -> Result<CompiledPlan, CompileFailure> {
    match analyze(&topology, &options) {
        Ok(layout) => Ok(assemble(topology, layout, &options)),
        Err(error) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("graph_compile: rejected: {error}");
            Err(CompileFailure { error, topology })
        }
    }
}

/// Everything analysis decides, by render position.
struct Layout {
    /// Topology slot of each render position.
    order: Vec<usize>,
    output_base: Vec<usize>,
    output_count: Vec<usize>,
    input_ports: Vec<Range<usize>>,
    port_routes: Vec<Range<usize>>,
    routes: Vec<Route>,
    lines: Vec<RouteLine>,
    /// Port each line copies, for sizing its buffer.
    line_ports: Vec<PortSpec>,
    node_lines: Vec<Range<usize>>,
    producers: Vec<Vec<usize>>,
    buffer_count: usize,
    sink_buffer: usize,
    sink_channels: usize,
    intrinsic: Vec<u64>,
    compensation: Vec<u64>,
    link_compensation: Vec<u64>,
    link_capacity: Vec<u64>,
    delay_capacity: Vec<u64>,
    uncompensated_control: Vec<usize>,
    bound: u64,
}

/// One validated edge, by render position.
#[derive(Clone, Copy)]
struct Wire {
    dest: usize,
    dest_port: usize,
    edge: EdgeId,
    source: usize,
    source_port: usize,
    gain: f32,
}

fn analyze(topology: &Topology, options: &CompileOptions) -> Result<Layout, CompileError> {
    if options.block_size == 0 {
        return Err(CompileError::InvalidBlockSize);
    }
    if topology.is_empty() {
        return Err(CompileError::EmptyTopology);
    }
    validate_edges(topology)?;

    let order = kahn_sort(topology)?;
    #[cfg(feature = "tracing")]
    tracing::debug!("graph_sort: {} nodes in topo order", order.len());

    let n = order.len();
    let mut position = vec![usize::MAX; topology.nodes.len()];
    for (pos, &slot) in order.iter().enumerate() {
        position[slot] = pos;
    }
    let nodes: Vec<&dyn Node> = order
        .iter()
        .filter_map(|&slot| topology.nodes[slot].as_deref())
        .collect();

    // Grouped by (dest position, dest port), declaration order within.
    let mut wires: Vec<Wire> = topology
        .edges()
        .map(|(edge, e)| Wire {
            dest: position[e.dest.0 as usize],
            dest_port: e.dest_port,
            edge,
            source: position[e.source.0 as usize],
            source_port: e.source_port,
            gain: e.gain,
        })
        .collect();
    wires.sort_by_key(|w| (w.dest, w.dest_port, w.edge));

    let mut producers: Vec<Vec<usize>> = vec![Vec::new(); n];
    for wire in &wires {
        let list = &mut producers[wire.dest];
        if !list.contains(&wire.source) {
            list.push(wire.source);
        }
    }

    let intrinsic: Vec<u64> = nodes.iter().map(|node| node.latency_samples()).collect();
    let declared_max: Vec<u64> = nodes
        .iter()
        .zip(intrinsic.iter())
        .map(|(node, &current)| node.max_latency_samples().max(current))
        .collect();

    let graph = LatencyGraph::new(producers.clone());
    let worst = compute_compensation(&graph, &declared_max);
    let mut link_capacity = vec![0u64; graph.link_count()];

    // Buffer layout in render order. Each node's route lines come right
    // before its own outputs.
    let mut output_base = Vec::with_capacity(n);
    let mut output_count = Vec::with_capacity(n);
    let mut node_lines = Vec::with_capacity(n);
    let mut routes = Vec::with_capacity(wires.len());
    let mut lines = Vec::new();
    let mut line_ports = Vec::new();
    let mut buffer_count = 0;
    let mut cursor = 0;
    for (pos, node) in nodes.iter().enumerate() {
        let first_line = lines.len();
        let start = cursor;
        while cursor < wires.len() && wires[cursor].dest == pos {
            cursor += 1;
        }
        for wire in &wires[start..cursor] {
            let source_buffer = output_base[wire.source] + wire.source_port;
            let port = &nodes[wire.source].outputs()[wire.source_port];
            let fans_out = graph.consumers(wire.source).len() > 1;
            let link = graph.link(wire.source, pos);
            let input_buffer = match link {
                Some(link)
                    if fans_out && port.kind != SignalKind::Control && worst.arrival[pos] > 0 =>
                {
                    let buffer = buffer_count;
                    buffer_count += 1;
                    link_capacity[link] = worst.arrival[pos];
                    lines.push(RouteLine {
                        source_buffer,
                        buffer,
                        link,
                        capacity: worst.arrival[pos],
                    });
                    line_ports.push(*port);
                    buffer
                }
                _ => source_buffer,
            };
            routes.push(Route {
                source_buffer,
                input_buffer,
                dest_node: pos,
                dest_port: wire.dest_port,
                gain: wire.gain,
            });
        }
        node_lines.push(first_line..lines.len());

        let outputs = node.outputs().len();
        output_base.push(buffer_count);
        output_count.push(outputs);
        buffer_count += outputs;
    }

    let (sink_pos, sink_port, sink_channels) = select_sink(topology, &order, &position)?;
    let sink_buffer = output_base[sink_pos] + sink_port;

    let mut input_ports = Vec::with_capacity(n);
    let mut port_routes = Vec::new();
    let mut cursor = 0;
    for (pos, node) in nodes.iter().enumerate() {
        let first_port = port_routes.len();
        for port in 0..node.inputs().len() {
            let start = cursor;
            while cursor < routes.len()
                && routes[cursor].dest_node == pos
                && routes[cursor].dest_port == port
            {
                cursor += 1;
            }
            port_routes.push(start..cursor);
        }
        input_ports.push(first_port..port_routes.len());
    }

    // A node is only ever aligned with its earliest consumer, so that
    // consumer's worst-case arrival is all its own delay lines need.
    let delay_capacity: Vec<u64> = (0..n)
        .map(|pos| {
            graph
                .consumers(pos)
                .iter()
                .map(|&d| worst.arrival[d])
                .min()
                .unwrap_or(0)
        })
        .collect();
    let bound = delay_capacity
        .iter()
        .chain(link_capacity.iter())
        .copied()
        .max()
        .unwrap_or(0);
    if bound > options.max_compensation {
        return Err(CompileError::CompensationTooLarge {
            required: bound,
            limit: options.max_compensation,
        });
    }
    let initial = compute_compensation(&graph, &intrinsic);

    // Control ramps are never delayed. Flag control routes that would need it.
    let mut uncompensated_control = Vec::new();
    for wire in &wires {
        let src = wire.source;
        if nodes[src].outputs()[wire.source_port].kind != SignalKind::Control
            || uncompensated_control.contains(&src)
        {
            continue;
        }
        let Some(link) = graph.link(src, wire.dest) else {
            continue;
        };
        let needed = |c: &Compensation| c.values[src] + c.links[link];
        let samples = needed(&worst).max(needed(&initial));
        if samples > 0 {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "graph_latency: control output of node[{src}] {} is not delayed, up to {samples} samples of compensation ignored",
                nodes[src].name()
            );
            uncompensated_control.push(src);
        }
    }
    uncompensated_control.sort_unstable();

    Ok(Layout {
        order,
        output_base,
        output_count,
        input_ports,
        port_routes,
        routes,
        lines,
        line_ports,
        node_lines,
        producers,
        buffer_count,
        sink_buffer,
        sink_channels,
        intrinsic,
        compensation: initial.values,
        link_compensation: initial.links,
        link_capacity,
        delay_capacity,
        uncompensated_control,
        bound,
    })
}

fn validate_edges(topology: &Topology) -> Result<(), CompileError> {
    for (edge, e) in topology.edges() {
        let Some(source) = topology.node(e.source) else {
            return Err(CompileError::DanglingNode {
                edge,
                node: e.source,
            });
        };
        let Some(dest) = topology.node(e.dest) else {
            return Err(CompileError::DanglingNode { edge, node: e.dest });
        };
        let Some(from) = source.outputs().get(e.source_port) else {
            return Err(CompileError::DanglingPort {
                edge,
                node: e.source,
                port: e.source_port,
            });
        };
        let Some(to) = dest.inputs().get(e.dest_port) else {
            return Err(CompileError::DanglingPort {
                edge,
                node: e.dest,
                port: e.dest_port,
            });
        };
        if from.kind != to.kind {
            return Err(CompileError::KindMismatch {
                edge,
                from_kind: from.kind,
                to_kind: to.kind,
            });
        }
        if from.kind == SignalKind::Audio && from.channels != to.channels {
            return Err(CompileError::ChannelMismatch {
                edge,
                from_channels: from.channels,
                to_channels: to.channels,
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm over live slots. Returns slot indices in render order.
fn kahn_sort(topology: &Topology) -> Result<Vec<usize>, CompileError> {
    let n = topology.nodes.len();
    let live = |i: usize| topology.nodes[i].is_some();
    let mut in_degree = vec![0u32; n];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (_, e) in topology.edges() {
        in_degree[e.dest.0 as usize] += 1;
        outgoing[e.source.0 as usize].push(e.dest.0 as usize);
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| live(i) && in_degree[i] == 0)
        .map(Reverse)
        .collect();
    let mut sorted = Vec::with_capacity(n);

    while let Some(Reverse(idx)) = ready.pop() {
        sorted.push(idx);
        for &dest in &outgoing[idx] {
            in_degree[dest] -= 1;
            if in_degree[dest] == 0 {
                ready.push(Reverse(dest));
            }
        }
    }

    if sorted.len() < topology.node_count() {
        let stuck = (0..n).find(|&i| live(i) && in_degree[i] > 0).unwrap_or(0);
        return Err(CompileError::CycleDetected {
            node: NodeId(stuck as u32),
        });
    }
    Ok(sorted)
}

/// Returns (render position, output port, channels) of the sink.
fn select_sink(
    topology: &Topology,
    order: &[usize],
    position: &[usize],
) -> Result<(usize, usize, usize), CompileError> {
    let first_audio = |slot: usize| {
        topology
            .node(NodeId(slot as u32))?
            .outputs()
            .iter()
            .enumerate()
            .find(|(_, p)| p.kind == SignalKind::Audio)
            .map(|(port, p)| (port, usize::from(p.channels.max(1))))
    };

    if let Some(id) = topology.sink {
        let (port, channels) =
            first_audio(id.0 as usize).ok_or(CompileError::InvalidSink { node: id })?;
        return Ok((position[id.0 as usize], port, channels));
    }

    order
        .iter()
        .rev()
        .find_map(|&slot| first_audio(slot).map(|(port, ch)| (position[slot], port, ch)))
        .ok_or(CompileError::NoSink)
}

fn assemble(topology: Topology, layout: Layout, options: &CompileOptions) -> CompiledPlan {
    let Topology { mut nodes, .. } = topology;

    let mut ordered = Vec::with_capacity(layout.order.len());
    let mut ids = Vec::with_capacity(layout.order.len());
    for &slot in &layout.order {
        if let Some(boxed) = nodes[slot].take() {
            ordered.push(boxed);
            ids.push(NodeId(slot as u32));
        }
    }

    // Same order analysis numbered them in: each node's lines, then its outputs.
    let mut buffers = Vec::with_capacity(layout.buffer_count);
    let mut delays = Vec::with_capacity(layout.buffer_count);
    let mut max_input_samples = 0;
    for (pos, node) in ordered.iter().enumerate() {
        for line in layout.node_lines[pos].clone() {
            let buffer = SignalBuffer::for_port(
                &layout.line_ports[line],
                options.block_size,
                options.event_capacity,
            );
            delays.push(PortDelay::for_buffer(
                &buffer,
                layout.lines[line].capacity as usize,
                options.block_size,
            ));
            buffers.push(buffer);
        }
        for port in node.outputs() {
            let buffer = SignalBuffer::for_port(port, options.block_size, options.event_capacity);
            delays.push(PortDelay::for_buffer(
                &buffer,
                layout.delay_capacity[pos] as usize,
                options.block_size,
            ));
            buffers.push(buffer);
        }
        for port in node.inputs() {
            if port.kind == SignalKind::Audio {
                max_input_samples =
                    max_input_samples.max(options.block_size * usize::from(port.channels.max(1)));
            }
        }
    }
    debug_assert_eq!(buffers.len(), layout.buffer_count);

    let max_node_routes = layout
        .input_ports
        .iter()
        .map(|ports| {
            layout.port_routes[ports.clone()]
                .iter()
                .map(|r| r.len())
                .sum::<usize>()
        })
        .max()
        .unwrap_or(0);
    let max_node_inputs = layout.input_ports.iter().map(|r| r.len()).max().unwrap_or(0);

    let misaligned = count_misaligned(&layout.link_compensation, &layout.link_capacity);
    let uncompensated_control = layout
        .uncompensated_control
        .iter()
        .map(|&pos| ids[pos])
        .collect();
    let names: Vec<String> = ordered.iter().map(|n| n.name().to_string()).collect();
    let latency = Arc::new(LatencyState::new(
        &layout.intrinsic,
        &layout.compensation,
        &layout.link_compensation,
        layout.link_capacity,
    ));
    let graph = Arc::new(LatencyGraph::new(layout.producers));
    let monitor = Arc::new(PlanMonitor::new(
        ids,
        names,
        latency,
        graph,
        layout.bound,
        uncompensated_control,
    ));
    monitor.set_misaligned(misaligned as u64);

    #[cfg(feature = "tracing")]
    {
        tracing::debug!(
            "graph_buffers: {} buffers, {} routes, {} route lines, sink buf[{}]",
            buffers.len(),
            layout.routes.len(),
            layout.lines.len(),
            layout.sink_buffer
        );
        tracing::debug!("graph_latency: compensation bound {} samples", layout.bound);
        for (pos, node) in ordered.iter().enumerate() {
            tracing::debug!(
                "  node[{pos}] {} outputs buf[{}..{}] inputs {} latency {} comp {}",
                node.name(),
                layout.output_base[pos],
                layout.output_base[pos] + layout.output_count[pos],
                layout.input_ports[pos].len(),
                layout.intrinsic[pos],
                layout.compensation[pos]
            );
        }
    }

    CompiledPlan {
        nodes: ordered,
        output_base: layout.output_base,
        output_count: layout.output_count,
        input_ports: layout.input_ports,
        port_routes: layout.port_routes,
        routes: layout.routes,
        lines: layout.lines,
        node_lines: layout.node_lines,
        buffers,
        delays,
        delay_capacity: layout.delay_capacity,
        sink_buffer: layout.sink_buffer,
        sink_channels: layout.sink_channels,
        block_size: options.block_size,
        event_capacity: options.event_capacity,
        max_node_routes,
        max_node_inputs,
        max_input_samples,
        monitor,
    }
}
