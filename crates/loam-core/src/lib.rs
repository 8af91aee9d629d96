//! Loam Core - signal-graph compiler and block renderer
//!
//! This crate turns a graph of processing nodes into a fixed execution plan and
//! renders it one block at a time, with zero allocation in the render path.
//!
//! # Core Abstractions
//!
//! ## Graph Construction
//!
//! - [`Node`] - Object-safe trait every processing unit implements
//! - [`Topology`] - Nodes plus gain-weighted, port-to-port edges, editable with stable ids
//! - [`RoutingGraph`] - Track → bus → master mixer view, flattened into a [`Topology`]
//!
//! ## Compilation
//!
//! - [`compile`] / [`compile_with`] - Validate, sort, and pre-allocate a [`CompiledPlan`]
//! - [`CompileError`] - Why a topology was rejected; [`CompileFailure`] returns the topology
//!
//! ## Rendering
//!
//! - [`RenderEngine`] - Walks a plan per block and hands out the sink output
//! - [`InputView`] - Per-node merged view of audio, MIDI, control, and trigger inputs
//! - [`PlanMonitor`] - Failed nodes, latencies, and counters, readable from any thread
//!
//! ## Latency Compensation
//!
//! - [`LatencyCompensator`] - Recomputes compensation off the render thread
//! - [`AudioDelayLine`], [`EventDelayLine`] - Pre-allocated delay lines per output
//!   port, plus one per fanned-out route that needs its own alignment
//!
//! # Example
//!
//! ```rust,ignore
//! use loam_core::{ProcessContext, RenderEngine, Topology, compile, nodes::{Constant, Gain}};
//!
//! let mut topology = Topology::new();
//! let src = topology.add_node(Constant::new(1.0, 2));
//! let gain = topology.add_node(Gain::new(0.5, 2));
//! topology.connect(src, 0, gain, 0);
//!
//! let mut plan = compile(topology, 256).map_err(|f| f.error)?;
//! let mut engine = RenderEngine::for_plan(&plan);
//! let mut ctx = ProcessContext::new(48000, 256);
//! let block = engine.process(&mut plan, &mut ctx);
//! ```
//!
//! # Design Principles
//!
//! - **Real-time safe**: Every buffer, delay line, and event list is sized at compile time
//! - **Single writer**: Shared state is atomics with acquire/release publication
//! - **Failures are contained**: A failed node goes silent; the rest of the graph keeps rendering

pub mod compiler;
pub mod delay;
pub mod error;
pub mod latency;
pub mod merge;
pub mod node;
pub mod nodes;
pub mod plan;
pub mod render;
pub mod routing;
pub mod signal;
pub mod topology;

// Re-export main types at crate root
pub use compiler::{
    CompileOptions, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_COMPENSATION, compile, compile_with,
};
pub use delay::{AudioDelayLine, EventDelayLine, PortDelay};
pub use error::{CompileError, CompileFailure, RoutingError, TopologyError};
pub use latency::{
    Compensation, CompensationReport, LatencyCompensator, LatencyGraph, LatencyState,
    compute_compensation, worst_case_bound,
};
pub use merge::InputView;
pub use node::{
    Node, OutputPorts, ProcessContext, ProcessError, ProcessResult, ProcessingMode,
    TransportState,
};
pub use plan::{CompiledPlan, NodeReport, PlanMonitor, Route};
pub use render::{RenderEngine, RenderScratch};
pub use routing::{
    AuxSend, Bus, BusId, FlattenedRouting, OutputTarget, RoutingGraph, RoutingNode, Track,
    TrackId,
};
pub use signal::{
    AudioBuffer, ControlValue, EventList, MidiEvent, MidiMessage, PortSpec, SignalBuffer,
    SignalKind, Timed, Trigger, add_scaled, sort_by_frame,
};
pub use topology::{Edge, EdgeId, NodeId, Topology};
