//! Blocking edges between in-flight computations.

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};

/// Identifies an in-flight computation. Ids are handed out in increasing order and are
/// never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A bidirectional multimap of "`node` is blocked on `dependency`" edges.
///
/// The forward and reverse indexes are always mirror images of each other, and a node with
/// no outgoing edges has no forward entry at all.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    forward: FxHashMap<NodeId, FxHashSet<NodeId>>,
    reverse: FxHashMap<NodeId, FxHashSet<NodeId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dependency(&mut self, node: NodeId, dependency: NodeId) {
        self.forward.entry(node).or_default().insert(dependency);
        self.reverse.entry(dependency).or_default().insert(node);
    }

    /// Replaces all outgoing edges of `node`.
    pub fn set_dependencies(&mut self, node: NodeId, dependencies: impl IntoIterator<Item = NodeId>) {
        self.clear_dependencies(node);
        for dependency in dependencies {
            self.add_dependency(node, dependency);
        }
    }

    /// Whether `node` still waits on anything.
    pub fn is_blocked(&self, node: NodeId) -> bool {
        self.forward.contains_key(&node)
    }

    pub fn dependencies(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.forward.get(&node).into_iter().flatten().copied()
    }

    pub fn dependents(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.reverse.get(&node).into_iter().flatten().copied()
    }

    /// The lowest id `node` is blocked on.
    pub fn first_dependency(&self, node: NodeId) -> Option<NodeId> {
        self.dependencies(node).min()
    }

    /// Removes all outgoing edges of `node`.
    pub fn clear_dependencies(&mut self, node: NodeId) {
        let Some(dependencies) = self.forward.remove(&node) else {
            return;
        };
        for dependency in dependencies {
            if let Some(dependents) = self.reverse.get_mut(&dependency) {
                dependents.remove(&node);
                if dependents.is_empty() {
                    self.reverse.remove(&dependency);
                }
            }
        }
    }

    /// Removes `node` and every edge touching it.
    ///
    /// Returns the former dependents of `node` which are no longer blocked on anything,
    /// in ascending order.
    pub fn remove_node(&mut self, node: NodeId) -> Vec<NodeId> {
        self.clear_dependencies(node);

        let mut unblocked = Vec::new();
        for dependent in self.reverse.remove(&node).into_iter().flatten() {
            if let Some(dependencies) = self.forward.get_mut(&dependent) {
                dependencies.remove(&node);
                if dependencies.is_empty() {
                    self.forward.remove(&dependent);
                    unblocked.push(dependent);
                }
            }
        }
        unblocked.sort_unstable();
        unblocked
    }

    /// Follows lowest-id edges from `start` and returns the cycle the walk runs into.
    ///
    /// The returned nodes are in walk order, beginning with the first node that was
    /// revisited. Nodes in `visited` are treated as already explored and end the walk;
    /// every node touched is added to it.
    pub fn find_cycle_from(&self, start: NodeId, visited: &mut FxHashSet<NodeId>) -> Option<Vec<NodeId>> {
        let mut path = Vec::new();
        let mut position = FxHashMap::default();
        let mut current = start;

        loop {
            if let Some(&index) = position.get(&current) {
                return Some(path.split_off(index));
            }
            if !visited.insert(current) {
                return None;
            }
            position.insert(current, path.len());
            path.push(current);

            current = self.first_dependency(current)?;
        }
    }

    /// Searches for a cycle, starting walks from the lowest blocked node first.
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        let mut starts: Vec<_> = self.forward.keys().copied().collect();
        starts.sort_unstable();

        let mut visited = FxHashSet::default();
        starts
            .into_iter()
            .find_map(|start| self.find_cycle_from(start, &mut visited))
    }

    pub fn edge_count(&self) -> usize {
        self.forward.values().map(FxHashSet::len).sum()
    }
}
