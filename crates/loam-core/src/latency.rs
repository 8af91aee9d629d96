//! Latency compensation.
//!
//! Each node reports an intrinsic latency. Off the render thread, the
//! compensator walks the graph and decides how much extra delay each node's
//! output needs so that every path converging on a node arrives with the same
//! accumulated latency.
//!
//! # Algorithm
//!
//! Positions are in topological order, so a producer always has a lower index
//! than its consumers. Two passes:
//!
//! 1. Forward: `arrival[d] = max over producers s of (arrival[s] + intrinsic[s])`.
//!    Sources arrive at 0.
//! 2. Reverse: `compensation[s] = min over consumers d of arrival[d]`, minus
//!    `arrival[s] + intrinsic[s]`. Sinks get 0.
//!
//! The latest producer into any node always gets zero slack, so the arrival
//! computed from raw latencies is also the real arrival after compensation.
//!
//! When a node feeds several consumers that arrive at different times, its
//! own delay lines align it with the earliest one. Every other consumer gets
//! the remainder on the link between the two, `arrival[d]` minus that
//! earliest arrival, which the plan applies at the consumer's input. A link
//! whose remainder is larger than its line can hold is counted in
//! [`CompensationReport::misaligned`].
//!
//! # Memory ordering
//!
//! The render thread stores intrinsic latency with `Release` and the
//! compensator loads it with `Acquire`. Compensation flows the other way with
//! the same pairing. A value one block stale is harmless.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::plan::PlanMonitor;

/// Latency and compensation for one node.
#[derive(Debug, Default)]
pub struct NodeLatency {
    intrinsic: AtomicU64,
    compensation: AtomicU64,
}

/// Shared latency state.
///
/// Nodes are indexed by render position, links by [`LatencyGraph::link`].
#[derive(Debug)]
pub struct LatencyState {
    nodes: Vec<NodeLatency>,
    links: Vec<AtomicU64>,
    link_capacity: Vec<u64>,
    dirty: AtomicBool,
}

impl LatencyState {
    pub(crate) fn new(
        intrinsic: &[u64],
        compensation: &[u64],
        links: &[u64],
        link_capacity: Vec<u64>,
    ) -> Self {
        debug_assert_eq!(links.len(), link_capacity.len());
        let nodes = intrinsic
            .iter()
            .zip(compensation.iter())
            .map(|(&i, &c)| NodeLatency {
                intrinsic: AtomicU64::new(i),
                compensation: AtomicU64::new(c),
            })
            .collect();
        Self {
            nodes,
            links: links.iter().map(|&l| AtomicU64::new(l)).collect(),
            link_capacity,
            dirty: AtomicBool::new(false),
        }
    }

    /// Number of nodes tracked.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no nodes are tracked.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Last reported intrinsic latency of the node at `position`.
    #[inline]
    pub fn intrinsic(&self, position: usize) -> u64 {
        self.nodes[position].intrinsic.load(Ordering::Acquire)
    }

    /// Compensation currently published for the node at `position`.
    #[inline]
    pub fn compensation(&self, position: usize) -> u64 {
        self.nodes[position].compensation.load(Ordering::Acquire)
    }

    /// Number of producer-to-consumer links tracked.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Remaining delay published for `link`, applied at the consumer's input.
    #[inline]
    pub fn link_compensation(&self, link: usize) -> u64 {
        self.links[link].load(Ordering::Acquire)
    }

    /// Longest delay the plan can apply on `link`. Zero if it has no line.
    pub fn link_capacity(&self, link: usize) -> u64 {
        self.link_capacity[link]
    }

    /// Publishes the remaining delay for `link`.
    #[inline]
    pub fn publish_link_compensation(&self, link: usize, samples: u64) {
        self.links[link].store(samples, Ordering::Release);
    }

    /// Records a node's latency. Marks the state dirty and returns `true` if it changed.
    #[inline]
    pub fn report_intrinsic(&self, position: usize, samples: u64) -> bool {
        let slot = &self.nodes[position].intrinsic;
        if slot.load(Ordering::Relaxed) == samples {
            return false;
        }
        slot.store(samples, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Publishes a compensation value for the node at `position`.
    #[inline]
    pub fn publish_compensation(&self, position: usize, samples: u64) {
        self.nodes[position]
            .compensation
            .store(samples, Ordering::Release);
    }

    /// Returns true if a latency changed since the last recompute.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

/// Adjacency of the compiled graph, by render position.
#[derive(Debug, Clone)]
pub struct LatencyGraph {
    producers: Vec<Vec<usize>>,
    consumers: Vec<Vec<usize>>,
    /// First link index of each producer.
    link_base: Vec<usize>,
}

impl LatencyGraph {
    /// Builds the graph from each node's producer list.
    ///
    /// Producers must precede their consumers.
    pub fn new(producers: Vec<Vec<usize>>) -> Self {
        let mut consumers = vec![Vec::new(); producers.len()];
        for (dest, sources) in producers.iter().enumerate() {
            debug_assert!(sources.iter().all(|&s| s < dest));
            for &src in sources {
                if !consumers[src].contains(&dest) {
                    consumers[src].push(dest);
                }
            }
        }
        let mut link_base = Vec::with_capacity(consumers.len());
        let mut links = 0;
        for list in &consumers {
            link_base.push(links);
            links += list.len();
        }
        Self {
            producers,
            consumers,
            link_base,
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Nodes feeding `position`.
    pub fn producers(&self, position: usize) -> &[usize] {
        &self.producers[position]
    }

    /// Nodes fed by `position`.
    pub fn consumers(&self, position: usize) -> &[usize] {
        &self.consumers[position]
    }

    /// Number of distinct producer-to-consumer links.
    pub fn link_count(&self) -> usize {
        self.consumers.iter().map(Vec::len).sum()
    }

    /// Flat index of the link from `producer` to `consumer`.
    ///
    /// Links of one producer are contiguous, in the order of
    /// [`consumers`](Self::consumers).
    pub fn link(&self, producer: usize, consumer: usize) -> Option<usize> {
        let base = *self.link_base.get(producer)?;
        self.consumers[producer]
            .iter()
            .position(|&c| c == consumer)
            .map(|i| base + i)
    }
}

/// Output of [`compute_compensation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compensation {
    /// Extra delay per node, by render position.
    pub values: Vec<u64>,
    /// Remaining delay per link, by [`LatencyGraph::link`].
    pub links: Vec<u64>,
    /// Accumulated latency at each node's inputs.
    pub arrival: Vec<u64>,
}

impl Compensation {
    /// Largest arrival latency anywhere in the graph.
    pub fn max_arrival(&self) -> u64 {
        self.arrival.iter().copied().max().unwrap_or(0)
    }

    /// Largest compensation value on any node or link.
    pub fn max_value(&self) -> u64 {
        self.values
            .iter()
            .chain(self.links.iter())
            .copied()
            .max()
            .unwrap_or(0)
    }
}

/// Computes per-node and per-link compensation from intrinsic latencies.
pub fn compute_compensation(graph: &LatencyGraph, intrinsic: &[u64]) -> Compensation {
    let n = graph.len();
    let mut arrival = vec![0u64; n];

    for dest in 0..n {
        arrival[dest] = graph
            .producers(dest)
            .iter()
            .map(|&s| arrival[s] + intrinsic[s])
            .max()
            .unwrap_or(0);
    }

    let mut values = vec![0u64; n];
    let mut links = vec![0u64; graph.link_count()];
    for src in 0..n {
        let consumers = graph.consumers(src);
        let Some(earliest) = consumers.iter().map(|&d| arrival[d]).min() else {
            continue;
        };
        values[src] = earliest - (arrival[src] + intrinsic[src]);
        let base = graph.link_base[src];
        for (i, &dest) in consumers.iter().enumerate() {
            links[base + i] = arrival[dest] - earliest;
        }
    }

    Compensation {
        values,
        links,
        arrival,
    }
}

/// Worst-case compensation for declared maximum latencies.
///
/// No compensation value can exceed the largest arrival latency, and arrival
/// only grows with latency, so this bounds every value the compensator can
/// publish while nodes stay within their declared maxima.
pub fn worst_case_bound(graph: &LatencyGraph, max_latency: &[u64]) -> u64 {
    compute_compensation(graph, max_latency).max_arrival()
}

/// Summary of one compensation refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompensationReport {
    /// Number of node and link values whose published compensation changed.
    pub changed: usize,
    /// Links whose remaining delay does not fit their line.
    pub misaligned: usize,
    /// Largest compensation published.
    pub max_compensation: u64,
}

/// Counts links whose remaining delay exceeds what their line can hold.
pub(crate) fn count_misaligned(links: &[u64], capacity: &[u64]) -> usize {
    links.iter().zip(capacity).filter(|(l, c)| l > c).count()
}

/// Recomputes and publishes compensation for one compiled plan.
///
/// Intended for a control or background thread; never call it from the
/// render thread.
#[derive(Debug, Clone)]
pub struct LatencyCompensator {
    graph: Arc<LatencyGraph>,
    monitor: Arc<PlanMonitor>,
}

impl LatencyCompensator {
    pub(crate) fn new(graph: Arc<LatencyGraph>, monitor: Arc<PlanMonitor>) -> Self {
        Self { graph, monitor }
    }

    /// The monitor of the plan this compensator serves.
    pub fn monitor(&self) -> &Arc<PlanMonitor> {
        &self.monitor
    }

    /// Recomputes compensation from the latest reported latencies and publishes it.
    pub fn refresh(&self) -> CompensationReport {
        let state = self.monitor.latency();
        let intrinsic: Vec<u64> = (0..state.len()).map(|i| state.intrinsic(i)).collect();
        let result = compute_compensation(&self.graph, &intrinsic);

        let mut changed = 0;
        for (position, &value) in result.values.iter().enumerate() {
            if state.compensation(position) != value {
                state.publish_compensation(position, value);
                changed += 1;
            }
        }
        for (link, &value) in result.links.iter().enumerate() {
            if state.link_compensation(link) != value {
                state.publish_link_compensation(link, value);
                changed += 1;
            }
        }
        let misaligned = count_misaligned(&result.links, &state.link_capacity);
        self.monitor.set_misaligned(misaligned as u64);

        #[cfg(feature = "tracing")]
        if changed > 0 {
            tracing::debug!(
                "latency_refresh: {changed} values updated, max compensation {} samples, {misaligned} misaligned",
                result.max_value()
            );
        }

        CompensationReport {
            changed,
            misaligned,
            max_compensation: result.max_value(),
        }
    }

    /// Refreshes only if a node reported a latency change since the last call.
    pub fn refresh_if_dirty(&self) -> Option<CompensationReport> {
        if self.monitor.latency().take_dirty() {
            Some(self.refresh())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// a -> b(L) -> d, a -> c -> d
    fn diamond() -> LatencyGraph {
        LatencyGraph::new(vec![vec![], vec![0], vec![0], vec![1, 2]])
    }

    #[test]
    fn test_parallel_path_gets_padding() {
        let result = compute_compensation(&diamond(), &[0, 64, 0, 0]);
        assert_eq!(result.arrival, vec![0, 0, 0, 64]);
        assert_eq!(result.values, vec![0, 0, 64, 0]);
        assert!(result.links.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_unequal_latencies_pad_shorter_path() {
        let result = compute_compensation(&diamond(), &[0, 3, 5, 0]);
        assert_eq!(result.values, vec![0, 2, 0, 0]);
        assert_eq!(result.arrival[3], 5);
    }

    #[test]
    fn test_fan_out_remainder_goes_on_the_link() {
        // a -> b(L) -> c, a -> c: a aligns with b, the a -> c link carries L.
        let graph = LatencyGraph::new(vec![vec![], vec![0], vec![0, 1]]);
        let result = compute_compensation(&graph, &[0, 10, 0]);
        assert_eq!(result.values[0], 0);
        assert_eq!(graph.link_count(), 3);
        assert_eq!(graph.link(0, 1).map(|l| result.links[l]), Some(0));
        assert_eq!(graph.link(0, 2).map(|l| result.links[l]), Some(10));
        assert_eq!(graph.link(1, 2).map(|l| result.links[l]), Some(0));
        assert_eq!(result.max_value(), 10);
    }

    #[test]
    fn test_link_lookup() {
        let graph = diamond();
        assert_eq!(graph.link(0, 1), Some(0));
        assert_eq!(graph.link(0, 2), Some(1));
        assert_eq!(graph.link(1, 3), Some(2));
        assert_eq!(graph.link(2, 3), Some(3));
        assert_eq!(graph.link(1, 2), None);
        assert_eq!(graph.link(9, 0), None);
    }

    #[test]
    fn test_count_misaligned_against_capacity() {
        assert_eq!(count_misaligned(&[0, 10, 3], &[0, 10, 2]), 1);
        assert_eq!(count_misaligned(&[5], &[0]), 1);
        assert_eq!(count_misaligned(&[], &[]), 0);
    }

    #[test]
    fn test_chain_needs_no_compensation() {
        let graph = LatencyGraph::new(vec![vec![], vec![0], vec![1]]);
        let result = compute_compensation(&graph, &[5, 7, 11]);
        assert!(result.values.iter().all(|&v| v == 0));
        assert_eq!(result.arrival, vec![0, 5, 12]);
    }

    #[test]
    fn test_worst_case_bound_covers_lower_latencies() {
        let graph = diamond();
        let bound = worst_case_bound(&graph, &[0, 100, 0, 0]);
        assert_eq!(bound, 100);
        for l in [0, 1, 50, 100] {
            let result = compute_compensation(&graph, &[0, l, 0, 0]);
            assert!(result.max_value() <= bound);
        }
    }

    #[test]
    fn test_report_intrinsic_sets_dirty_once() {
        let state = LatencyState::new(&[0, 0], &[0, 0], &[0], vec![8]);
        assert!(!state.is_dirty());
        assert!(!state.report_intrinsic(0, 0));
        assert!(state.report_intrinsic(1, 32));
        assert!(state.is_dirty());
        assert_eq!(state.intrinsic(1), 32);
        assert!(state.take_dirty());
        assert!(!state.is_dirty());
    }

    #[test]
    fn test_link_compensation_is_published() {
        let state = LatencyState::new(&[0, 0], &[0, 0], &[0], vec![8]);
        assert_eq!(state.link_count(), 1);
        assert_eq!(state.link_capacity(0), 8);
        state.publish_link_compensation(0, 6);
        assert_eq!(state.link_compensation(0), 6);
        assert!(!state.is_dirty());
    }
}
