//! Author-facing graph description.
//!
//! A [`Topology`] is an arena: nodes live in a `Vec` and are addressed by
//! [`NodeId`], edges are index pairs addressed by [`EdgeId`]. Nothing is
//! validated here. [`connect`](Topology::connect) simply records the edge and
//! the compiler reports every problem at once, with the offending id.
//!
//! Removing a node leaves its slot empty, so the ids of every other node and
//! edge stay valid across edits.

use crate::error::TopologyError;
use crate::node::Node;

/// Stable identifier for a node in a [`Topology`].
///
/// Ids are assigned sequentially and never reused within a topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Returns the raw numeric identifier.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Stable identifier for an edge in a [`Topology`].
///
/// Edge ids also record declaration order, which breaks ties when events
/// from several sources land on the same frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub(crate) u32);

impl EdgeId {
    /// Returns the raw numeric identifier.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EdgeId({})", self.0)
    }
}

/// A directed connection from an output port to an input port.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Edge {
    /// Producing node.
    pub source: NodeId,
    /// Output port index on the producer.
    pub source_port: usize,
    /// Consuming node.
    pub dest: NodeId,
    /// Input port index on the consumer.
    pub dest_port: usize,
    /// Linear gain applied to audio on this edge.
    pub gain: f32,
}

/// Mutable description of nodes and their connections.
#[derive(Default)]
pub struct Topology {
    pub(crate) nodes: Vec<Option<Box<dyn Node>>>,
    pub(crate) edges: Vec<Option<Edge>>,
    pub(crate) sink: Option<NodeId>,
}

impl Topology {
    /// Creates an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its id.
    pub fn add_node<N: Node + 'static>(&mut self, node: N) -> NodeId {
        self.add_boxed(Box::new(node))
    }

    /// Adds an already-boxed node and returns its id.
    pub fn add_boxed(&mut self, node: Box<dyn Node>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        #[cfg(feature = "tracing")]
        tracing::debug!("graph_add: node {id} ({})", node_name(&self.nodes, id));
        id
    }

    /// Removes a node and every edge touching it, returning the node.
    ///
    /// Clears the sink designation if it pointed at this node.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Box<dyn Node>, TopologyError> {
        let node = self
            .nodes
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(TopologyError::NodeNotFound(id))?;
        for slot in &mut self.edges {
            if slot.is_some_and(|e| e.source == id || e.dest == id) {
                *slot = None;
            }
        }
        if self.sink == Some(id) {
            self.sink = None;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!("graph_remove: node {id}");
        Ok(node)
    }

    /// Swaps the node behind `id` for `node`, keeping its id and edges.
    ///
    /// Returns the previous node. Port compatibility is checked at compile time.
    pub fn replace_node(
        &mut self,
        id: NodeId,
        node: Box<dyn Node>,
    ) -> Result<Box<dyn Node>, TopologyError> {
        let slot = self
            .nodes
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(TopologyError::NodeNotFound(id))?;
        Ok(core::mem::replace(slot, node))
    }

    /// Splices `node` into the first edge from `before` to `after`.
    ///
    /// The edge is replaced by `before -> node` at unity gain on the new
    /// node's input 0, and `node -> after` from its output 0 carrying the
    /// original gain.
    pub fn insert_between(
        &mut self,
        before: NodeId,
        after: NodeId,
        node: Box<dyn Node>,
    ) -> Result<NodeId, TopologyError> {
        for id in [before, after] {
            if self.node(id).is_none() {
                return Err(TopologyError::NodeNotFound(id));
            }
        }
        let (edge, old) = self
            .edges()
            .find(|(_, e)| e.source == before && e.dest == after)
            .map(|(id, e)| (id, *e))
            .ok_or(TopologyError::EdgeNotFound {
                from: before,
                to: after,
            })?;
        self.disconnect(edge);
        let id = self.add_boxed(node);
        self.connect(before, old.source_port, id, 0);
        self.connect_with_gain(id, 0, after, old.dest_port, old.gain);
        Ok(id)
    }

    /// Removes a node and reconnects around it.
    ///
    /// Every incoming edge is joined to every outgoing edge, port to port,
    /// with the product of the two gains. Returns the removed node.
    pub fn bypass_node(&mut self, id: NodeId) -> Result<Box<dyn Node>, TopologyError> {
        if self.node(id).is_none() {
            return Err(TopologyError::NodeNotFound(id));
        }
        let incoming: Vec<Edge> = self
            .edges()
            .filter(|(_, e)| e.dest == id && e.source != id)
            .map(|(_, e)| *e)
            .collect();
        let outgoing: Vec<Edge> = self
            .edges()
            .filter(|(_, e)| e.source == id && e.dest != id)
            .map(|(_, e)| *e)
            .collect();
        let node = self.remove_node(id)?;
        for inc in &incoming {
            for out in &outgoing {
                self.connect_with_gain(
                    inc.source,
                    inc.source_port,
                    out.dest,
                    out.dest_port,
                    inc.gain * out.gain,
                );
            }
        }
        Ok(node)
    }

    /// Connects `source:source_port` to `dest:dest_port` at unity gain.
    pub fn connect(
        &mut self,
        source: NodeId,
        source_port: usize,
        dest: NodeId,
        dest_port: usize,
    ) -> EdgeId {
        self.connect_with_gain(source, source_port, dest, dest_port, 1.0)
    }

    /// Connects two ports with an explicit gain.
    pub fn connect_with_gain(
        &mut self,
        source: NodeId,
        source_port: usize,
        dest: NodeId,
        dest_port: usize,
        gain: f32,
    ) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Some(Edge {
            source,
            source_port,
            dest,
            dest_port,
            gain,
        }));
        id
    }

    /// Removes an edge. Returns the removed edge, if it existed.
    pub fn disconnect(&mut self, edge: EdgeId) -> Option<Edge> {
        self.edges.get_mut(edge.0 as usize).and_then(Option::take)
    }

    /// Changes the gain of an existing edge. Returns `false` if it does not exist.
    pub fn set_gain(&mut self, edge: EdgeId, gain: f32) -> bool {
        match self.edges.get_mut(edge.0 as usize) {
            Some(Some(e)) => {
                e.gain = gain;
                true
            }
            _ => false,
        }
    }

    /// Designates the node whose first audio output becomes the render output.
    ///
    /// Without a designation the compiler picks the last node in topological
    /// order that has an audio output.
    pub fn set_sink(&mut self, node: NodeId) {
        self.sink = Some(node);
    }

    /// The designated sink, if any.
    pub fn sink(&self) -> Option<NodeId> {
        self.sink
    }

    /// Looks up a node.
    pub fn node(&self, id: NodeId) -> Option<&dyn Node> {
        self.nodes
            .get(id.0 as usize)
            .and_then(Option::as_deref)
    }

    /// Live node ids in ascending order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| NodeId(i as u32))
    }

    /// Looks up an edge.
    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// Live edges in declaration order.
    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &Edge)> {
        self.edges
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (EdgeId(i as u32), e)))
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Number of live edges.
    pub fn edge_count(&self) -> usize {
        self.edges.iter().filter(|e| e.is_some()).count()
    }

    /// Returns true if the topology has no live nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.iter().all(Option::is_none)
    }
}

#[cfg(feature = "tracing")]
fn node_name(nodes: &[Option<Box<dyn Node>>], id: NodeId) -> &str {
    nodes
        .get(id.0 as usize)
        .and_then(Option::as_deref)
        .map_or("?", |n| n.name())
}

impl core::fmt::Debug for Topology {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<&str> = self.nodes.iter().flatten().map(|n| n.name()).collect();
        f.debug_struct("Topology")
            .field("nodes", &names)
            .field("edges", &self.edge_count())
            .field("sink", &self.sink)
            .finish()
    }
}
