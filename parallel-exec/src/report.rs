//! Offline report of the dependency structure of a finished batch.
//!
//! Nothing here feeds back into scheduling.

use crate::types::Incarnation;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Timing of the committed attempt of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionStat {
    pub tx_idx: usize,
    pub incarnation: Incarnation,
    /// Nanoseconds since the start of the batch.
    pub start: u64,
    pub end: u64,
    pub worker: usize,
}

impl ExecutionStat {
    pub fn duration(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// Dependencies discovered while executing a batch.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    vertices: usize,
    parents: HashMap<usize, BTreeSet<usize>>,
}

impl DependencyGraph {
    pub fn new(vertices: usize) -> Self {
        Self {
            vertices,
            parents: HashMap::new(),
        }
    }

    pub fn add_edge(&mut self, blocker: usize, dependent: usize) {
        self.parents.entry(dependent).or_default().insert(blocker);
    }

    pub fn vertices(&self) -> usize {
        self.vertices
    }

    pub fn edge_count(&self) -> usize {
        self.parents.values().map(BTreeSet::len).sum()
    }

    pub fn parents(&self, tx: usize) -> impl Iterator<Item = usize> + '_ {
        self.parents.get(&tx).into_iter().flatten().copied()
    }
}

/// Finds the heaviest path through the graph, weighting each vertex by its
/// execution time. Returns the path in ascending order and its weight.
pub fn longest_path(
    graph: &DependencyGraph,
    stats: &HashMap<usize, ExecutionStat>,
) -> (Vec<usize>, u64) {
    let n = graph.vertices();
    let weight_of = |i: usize| stats.get(&i).map_or(0, ExecutionStat::duration);

    let mut prev: Vec<Option<usize>> = vec![None; n];
    let mut path_weights = vec![0u64; n];
    let mut max_path = 0;
    let mut max_weight = 0;

    // Parents always have lower indices, so one ascending pass suffices.
    for i in 0..n {
        path_weights[i] = weight_of(i);
        for p in graph.parents(i).filter(|&p| p < i) {
            let weight = path_weights[p] + weight_of(i);
            if weight > path_weights[i] {
                path_weights[i] = weight;
                prev[i] = Some(p);
            }
        }

        if path_weights[i] > max_weight {
            max_path = i;
            max_weight = path_weights[i];
        }
    }

    if n == 0 {
        return (Vec::new(), 0);
    }

    let mut path = vec![max_path];
    let mut cursor = max_path;
    while let Some(p) = prev[cursor] {
        path.push(p);
        cursor = p;
    }
    path.reverse();

    (path, max_weight)
}

/// Writes the longest path and its share of the serial execution time.
pub fn report(
    graph: &DependencyGraph,
    stats: &HashMap<usize, ExecutionStat>,
    mut out: impl FnMut(String),
) {
    let (path, weight) = longest_path(graph, stats);
    let serial: u64 = (0..graph.vertices())
        .map(|i| stats.get(&i).map_or(0, ExecutionStat::duration))
        .sum();

    let steps: Vec<String> = path.iter().map(ToString::to_string).collect();
    out("Longest execution path:".to_string());
    out(format!("({}) {}", path.len(), steps.join("->")));

    let share = if serial == 0 {
        0.0
    } else {
        weight as f64 * 100.0 / serial as f64
    };
    out(format!(
        "Longest path ideal execution time: {:?} of {:?} (serial total), {:.1}%",
        Duration::from_nanos(weight),
        Duration::from_nanos(serial),
        share
    ));
}
