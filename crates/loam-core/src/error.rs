//! Compile-time and routing errors.

use crate::routing::{BusId, RoutingNode, TrackId};
use crate::signal::SignalKind;
use crate::topology::{EdgeId, NodeId, Topology};

/// Why a topology could not be compiled.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// The topology has no nodes.
    #[error("topology has no nodes")]
    EmptyTopology,

    /// Block size must be at least one frame.
    #[error("block size must be non-zero")]
    InvalidBlockSize,

    /// An edge references a node that does not exist.
    #[error("{edge} references missing node {node}")]
    DanglingNode {
        /// Offending edge.
        edge: EdgeId,
        /// The missing node.
        node: NodeId,
    },

    /// An edge references a port index the node does not declare.
    #[error("{edge} references missing port {port} on {node}")]
    DanglingPort {
        /// Offending edge.
        edge: EdgeId,
        /// Node that lacks the port.
        node: NodeId,
        /// The missing port index.
        port: usize,
    },

    /// Source and destination ports carry different signal kinds.
    #[error("{edge} connects {from_kind} output to {to_kind} input")]
    KindMismatch {
        /// Offending edge.
        edge: EdgeId,
        /// Kind of the source port.
        from_kind: SignalKind,
        /// Kind of the destination port.
        to_kind: SignalKind,
    },

    /// Audio ports with different channel counts.
    #[error("{edge} connects {from_channels} channels to {to_channels} channels")]
    ChannelMismatch {
        /// Offending edge.
        edge: EdgeId,
        /// Channels on the source port.
        from_channels: u16,
        /// Channels on the destination port.
        to_channels: u16,
    },

    /// The synchronous dependency graph has a cycle through `node`.
    #[error("cycle detected through {node}")]
    CycleDetected {
        /// A node on (or downstream of) the cycle.
        node: NodeId,
    },

    /// No node has an audio output to render from.
    #[error("no node has an audio output to use as the sink")]
    NoSink,

    /// The designated sink is missing or has no audio output.
    #[error("sink {node} is missing or has no audio output")]
    InvalidSink {
        /// The designated node.
        node: NodeId,
    },

    /// Worst-case compensation exceeds the configured delay-line limit.
    #[error("worst-case compensation of {required} samples exceeds the limit of {limit}")]
    CompensationTooLarge {
        /// Samples the graph could require.
        required: u64,
        /// Configured maximum.
        limit: u64,
    },
}

/// Why a topology edit was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// No live node has this id.
    #[error("{0} not found")]
    NodeNotFound(NodeId),

    /// No edge connects the two nodes.
    #[error("no edge from {from} to {to}")]
    EdgeNotFound {
        /// Expected producer.
        from: NodeId,
        /// Expected consumer.
        to: NodeId,
    },
}

/// A failed compilation, handing the topology back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct CompileFailure {
    /// What went wrong.
    #[source]
    pub error: CompileError,
    /// The untouched input topology.
    pub topology: Topology,
}

impl CompileFailure {
    /// Discards the topology and keeps the error.
    pub fn into_error(self) -> CompileError {
        self.error
    }
}

/// Why a routing graph is not valid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    /// A bus names itself as its primary output.
    #[error("{bus} routes to itself")]
    SelfRoute {
        /// The offending bus.
        bus: BusId,
    },

    /// A bus sends to itself.
    #[error("{bus} sends to itself")]
    SelfSend {
        /// The offending bus.
        bus: BusId,
    },

    /// A send targets a bus that does not exist.
    #[error("send from {from} targets missing {bus}")]
    MissingSendTarget {
        /// The sending track or bus.
        from: RoutingNode,
        /// The missing bus.
        bus: BusId,
    },

    /// A primary output targets a bus that does not exist.
    #[error("output of {from} targets missing {bus}")]
    MissingOutputTarget {
        /// The routed track or bus.
        from: RoutingNode,
        /// The missing bus.
        bus: BusId,
    },

    /// Buses feed each other in a loop.
    #[error("bus cycle detected through {bus}")]
    BusCycle {
        /// A bus on the cycle.
        bus: BusId,
    },

    /// A source node was supplied for a track that does not exist.
    #[error("no such track {track}")]
    MissingTrack {
        /// The unknown track.
        track: TrackId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display_names_ids() {
        let err = CompileError::KindMismatch {
            edge: EdgeId(3),
            from_kind: SignalKind::Midi,
            to_kind: SignalKind::Audio,
        };
        assert_eq!(
            err.to_string(),
            "EdgeId(3) connects midi output to audio input"
        );

        let err = CompileError::CycleDetected { node: NodeId(2) };
        assert!(err.to_string().contains("NodeId(2)"));
    }

    #[test]
    fn test_topology_error_display() {
        assert_eq!(
            TopologyError::NodeNotFound(NodeId(4)).to_string(),
            "NodeId(4) not found"
        );
        let err = TopologyError::EdgeNotFound {
            from: NodeId(0),
            to: NodeId(1),
        };
        assert_eq!(err.to_string(), "no edge from NodeId(0) to NodeId(1)");
    }

    #[test]
    fn test_routing_error_display() {
        let err = RoutingError::SelfRoute { bus: BusId(1) };
        assert_eq!(err.to_string(), "BusId(1) routes to itself");

        let err = RoutingError::MissingSendTarget {
            from: RoutingNode::Track(TrackId(0)),
            bus: BusId(9),
        };
        assert!(err.to_string().contains("BusId(9)"));
    }

    #[test]
    fn test_compile_failure_source_is_error() {
        use std::error::Error as _;
        let failure = CompileFailure {
            error: CompileError::EmptyTopology,
            topology: Topology::new(),
        };
        assert!(failure.source().is_some());
        assert_eq!(failure.into_error(), CompileError::EmptyTopology);
    }
}
