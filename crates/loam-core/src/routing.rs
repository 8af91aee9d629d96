//! Track → bus → master routing.
//!
//! A [`RoutingGraph`] is the mixer-level view of a session. Every track and bus
//! has one primary output (a bus or master) and any number of sends to buses.
//! The graph is never rendered directly: [`RoutingGraph::flatten`] turns it into
//! a [`Topology`] of [`ChannelStrip`] nodes for the compiler.
//!
//! [`validate`](RoutingGraph::validate) must pass before the render order or
//! the flattened topology is relied on.

use std::collections::HashMap;

use crate::error::RoutingError;
use crate::node::Node;
use crate::nodes::ChannelStrip;
use crate::topology::{NodeId, Topology};

/// Identifies a track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub(crate) u32);

impl TrackId {
    /// Returns the raw numeric identifier.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for TrackId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "TrackId({})", self.0)
    }
}

/// Identifies a bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(pub(crate) u32);

impl BusId {
    /// Returns the raw numeric identifier.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for BusId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "BusId({})", self.0)
    }
}

/// An element of the routing graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoutingNode {
    /// A track.
    Track(TrackId),
    /// A bus.
    Bus(BusId),
    /// The master output.
    Master,
}

impl core::fmt::Display for RoutingNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Track(id) => id.fmt(f),
            Self::Bus(id) => id.fmt(f),
            Self::Master => f.write_str("Master"),
        }
    }
}

/// Where a track or bus sends its primary output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputTarget {
    /// The master output.
    #[default]
    Master,
    /// A bus.
    Bus(BusId),
}

/// An auxiliary feed into a bus.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AuxSend {
    /// Target bus.
    pub bus: BusId,
    /// Linear send level.
    pub amount: f32,
    /// Tap before the fader instead of after it.
    pub pre_fader: bool,
}

impl AuxSend {
    /// A post-fader send.
    pub fn post(bus: BusId, amount: f32) -> Self {
        Self {
            bus,
            amount,
            pre_fader: false,
        }
    }

    /// A pre-fader send.
    pub fn pre(bus: BusId, amount: f32) -> Self {
        Self {
            bus,
            amount,
            pre_fader: true,
        }
    }
}

/// A source channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    /// Display name.
    pub name: String,
    /// Primary output.
    pub output: OutputTarget,
    /// Auxiliary sends.
    pub sends: Vec<AuxSend>,
    /// Fader level.
    pub volume: f32,
    /// Pan, -1.0 to 1.0.
    pub pan: f32,
    /// Muted.
    pub mute: bool,
    /// Soloed. Any soloed track mutes every non-soloed track.
    pub solo: bool,
}

impl Track {
    /// A unity, centered track routed to master.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: OutputTarget::Master,
            sends: Vec::new(),
            volume: 1.0,
            pan: 0.0,
            mute: false,
            solo: false,
        }
    }

    /// Sets the primary output.
    #[must_use]
    pub fn routed_to(mut self, output: OutputTarget) -> Self {
        self.output = output;
        self
    }

    /// Adds a send.
    #[must_use]
    pub fn with_send(mut self, send: AuxSend) -> Self {
        self.sends.push(send);
        self
    }

    /// Sets the fader level.
    #[must_use]
    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    /// Sets the pan.
    #[must_use]
    pub fn with_pan(mut self, pan: f32) -> Self {
        self.pan = pan;
        self
    }
}

/// A submix channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Bus {
    /// Display name.
    pub name: String,
    /// Primary output.
    pub output: OutputTarget,
    /// Auxiliary sends.
    pub sends: Vec<AuxSend>,
    /// Fader level.
    pub volume: f32,
    /// Pan, -1.0 to 1.0.
    pub pan: f32,
    /// Muted.
    pub mute: bool,
}

impl Bus {
    /// A unity, centered bus routed to master.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: OutputTarget::Master,
            sends: Vec::new(),
            volume: 1.0,
            pan: 0.0,
            mute: false,
        }
    }

    /// Sets the primary output.
    #[must_use]
    pub fn routed_to(mut self, output: OutputTarget) -> Self {
        self.output = output;
        self
    }

    /// Adds a send.
    #[must_use]
    pub fn with_send(mut self, send: AuxSend) -> Self {
        self.sends.push(send);
        self
    }

    /// Sets the fader level.
    #[must_use]
    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }
}

/// Tracks, buses, and master.
#[derive(Clone, Debug)]
pub struct RoutingGraph {
    channels: u16,
    master_volume: f32,
    tracks: Vec<(TrackId, Track)>,
    buses: Vec<(BusId, Bus)>,
    next_track: u32,
    next_bus: u32,
}

/// Output of [`RoutingGraph::flatten`].
#[derive(Debug)]
pub struct FlattenedRouting {
    /// The compiled-ready topology, with master as its sink.
    pub topology: Topology,
    /// Master strip.
    pub master: NodeId,
    /// Strip per track.
    pub tracks: Vec<(TrackId, NodeId)>,
    /// Strip per bus.
    pub buses: Vec<(BusId, NodeId)>,
}

impl FlattenedRouting {
    /// The strip node for a track.
    pub fn track_node(&self, id: TrackId) -> Option<NodeId> {
        self.tracks.iter().find(|(t, _)| *t == id).map(|&(_, n)| n)
    }

    /// The strip node for a bus.
    pub fn bus_node(&self, id: BusId) -> Option<NodeId> {
        self.buses.iter().find(|(b, _)| *b == id).map(|&(_, n)| n)
    }
}

impl RoutingGraph {
    /// An empty graph whose strips carry `channels` interleaved channels.
    pub fn new(channels: u16) -> Self {
        Self {
            channels,
            master_volume: 1.0,
            tracks: Vec::new(),
            buses: Vec::new(),
            next_track: 0,
            next_bus: 0,
        }
    }

    /// Adds a track.
    pub fn add_track(&mut self, track: Track) -> TrackId {
        let id = TrackId(self.next_track);
        self.next_track += 1;
        self.tracks.push((id, track));
        id
    }

    /// Adds a bus.
    pub fn add_bus(&mut self, bus: Bus) -> BusId {
        let id = BusId(self.next_bus);
        self.next_bus += 1;
        self.buses.push((id, bus));
        id
    }

    /// Removes a bus. References to it are left dangling for `validate` to report.
    pub fn remove_bus(&mut self, id: BusId) -> Option<Bus> {
        let index = self.buses.iter().position(|(b, _)| *b == id)?;
        Some(self.buses.remove(index).1)
    }

    /// Looks up a track.
    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|(t, _)| *t == id).map(|(_, t)| t)
    }

    /// Looks up a bus.
    pub fn bus_mut(&mut self, id: BusId) -> Option<&mut Bus> {
        self.buses.iter_mut().find(|(b, _)| *b == id).map(|(_, b)| b)
    }

    /// Sets the master fader.
    pub fn set_master_volume(&mut self, volume: f32) {
        self.master_volume = volume;
    }

    /// Number of tracks.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Number of buses.
    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    fn has_bus(&self, id: BusId) -> bool {
        self.buses.iter().any(|(b, _)| *b == id)
    }

    fn bus_index(&self, id: BusId) -> Option<usize> {
        self.buses.iter().position(|(b, _)| *b == id)
    }

    /// Checks self-routing, dangling targets, and bus cycles.
    pub fn validate(&self) -> Result<(), RoutingError> {
        for (id, track) in &self.tracks {
            self.check_targets(RoutingNode::Track(*id), track.output, &track.sends)?;
        }
        for (id, bus) in &self.buses {
            if bus.output == OutputTarget::Bus(*id) {
                return Err(RoutingError::SelfRoute { bus: *id });
            }
            if bus.sends.iter().any(|s| s.bus == *id) {
                return Err(RoutingError::SelfSend { bus: *id });
            }
            self.check_targets(RoutingNode::Bus(*id), bus.output, &bus.sends)?;
        }

        let (_, stuck) = self.bus_order();
        if let Some(&index) = stuck.first() {
            return Err(RoutingError::BusCycle {
                bus: self.buses[index].0,
            });
        }
        Ok(())
    }

    fn check_targets(
        &self,
        from: RoutingNode,
        output: OutputTarget,
        sends: &[AuxSend],
    ) -> Result<(), RoutingError> {
        if let OutputTarget::Bus(bus) = output {
            if !self.has_bus(bus) {
                return Err(RoutingError::MissingOutputTarget { from, bus });
            }
        }
        for send in sends {
            if !self.has_bus(send.bus) {
                return Err(RoutingError::MissingSendTarget {
                    from,
                    bus: send.bus,
                });
            }
        }
        Ok(())
    }

    /// Buses a bus feeds, by index. Self-references and missing targets are skipped.
    fn bus_targets(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        let (id, bus) = &self.buses[index];
        let output = match bus.output {
            OutputTarget::Bus(b) => Some(b),
            OutputTarget::Master => None,
        };
        output
            .into_iter()
            .chain(bus.sends.iter().map(|s| s.bus))
            .filter(move |b| b != id)
            .filter_map(|b| self.bus_index(b))
    }

    /// Places buses after every bus that feeds them. Returns (placed, stuck) indices.
    fn bus_order(&self) -> (Vec<usize>, Vec<usize>) {
        let n = self.buses.len();
        let mut feeders: Vec<Vec<usize>> = vec![Vec::new(); n];
        for src in 0..n {
            for dest in self.bus_targets(src) {
                if !feeders[dest].contains(&src) {
                    feeders[dest].push(src);
                }
            }
        }

        let mut placed = vec![false; n];
        let mut order = Vec::with_capacity(n);
        loop {
            let mut progress = false;
            for i in 0..n {
                if !placed[i] && feeders[i].iter().all(|&f| placed[f]) {
                    placed[i] = true;
                    order.push(i);
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        let stuck = (0..n).filter(|&i| !placed[i]).collect();
        (order, stuck)
    }

    /// Tracks first, then buses after everything feeding them, then master.
    ///
    /// Buses caught in a cycle are appended in insertion order so this always
    /// terminates; [`validate`](Self::validate) reports the cycle.
    pub fn render_order(&self) -> Vec<RoutingNode> {
        let (placed, stuck) = self.bus_order();
        let mut order = Vec::with_capacity(self.tracks.len() + self.buses.len() + 1);
        order.extend(self.tracks.iter().map(|(id, _)| RoutingNode::Track(*id)));
        order.extend(
            placed
                .into_iter()
                .chain(stuck)
                .map(|i| RoutingNode::Bus(self.buses[i].0)),
        );
        order.push(RoutingNode::Master);
        order
    }

    /// Builds a topology of channel strips.
    ///
    /// `sources` supplies the node feeding each track's input; tracks without
    /// a source render silence. Solo is resolved here: when any track is
    /// soloed, every other track is flattened muted.
    pub fn flatten(
        &self,
        sources: Vec<(TrackId, Box<dyn Node>)>,
    ) -> Result<FlattenedRouting, RoutingError> {
        self.validate()?;

        let any_solo = self.tracks.iter().any(|(_, t)| t.solo);
        let mut topology = Topology::new();
        let master = topology.add_node(
            ChannelStrip::new("master", self.channels).with_volume(self.master_volume),
        );

        let mut bus_nodes = HashMap::with_capacity(self.buses.len());
        let mut buses = Vec::with_capacity(self.buses.len());
        for (id, bus) in &self.buses {
            let node = topology.add_node(
                ChannelStrip::new(bus.name.clone(), self.channels)
                    .with_volume(bus.volume)
                    .with_pan(bus.pan)
                    .with_mute(bus.mute),
            );
            bus_nodes.insert(*id, node);
            buses.push((*id, node));
        }

        let mut tracks = Vec::with_capacity(self.tracks.len());
        for (id, track) in &self.tracks {
            let muted = track.mute || (any_solo && !track.solo);
            let node = topology.add_node(
                ChannelStrip::new(track.name.clone(), self.channels)
                    .with_volume(track.volume)
                    .with_pan(track.pan)
                    .with_mute(muted),
            );
            tracks.push((*id, node));
        }

        let target = |output: OutputTarget| match output {
            OutputTarget::Master => master,
            OutputTarget::Bus(b) => bus_nodes[&b],
        };
        let strips = tracks
            .iter()
            .map(|&(_, node)| node)
            .zip(self.tracks.iter().map(|(_, t)| (t.output, &t.sends)))
            .chain(
                buses
                    .iter()
                    .map(|&(_, node)| node)
                    .zip(self.buses.iter().map(|(_, b)| (b.output, &b.sends))),
            )
            .collect::<Vec<_>>();
        for (node, (output, sends)) in strips {
            topology.connect(node, ChannelStrip::POST, target(output), 0);
            for send in sends {
                let port = if send.pre_fader {
                    ChannelStrip::PRE
                } else {
                    ChannelStrip::POST
                };
                topology.connect_with_gain(node, port, bus_nodes[&send.bus], 0, send.amount);
            }
        }

        for (track, source) in sources {
            let Some(&(_, strip)) = tracks.iter().find(|(t, _)| *t == track) else {
                return Err(RoutingError::MissingTrack { track });
            };
            let node = topology.add_boxed(source);
            topology.connect(node, 0, strip, 0);
        }

        topology.set_sink(master);
        Ok(FlattenedRouting {
            topology,
            master,
            tracks,
            buses,
        })
    }
}
