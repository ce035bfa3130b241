//! Usage graph using petgraph.
//!
//! Stores test-to-class usage as a bipartite directed graph where edge U→C
//! means "usage record U touched class C".

use crate::model::TestId;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Maximum number of nodes before records stop being stored.
///
/// A record that cannot be stored is treated as unknown and its test selected.
pub(crate) const MAX_GRAPH_NODES: usize = 500_000;

/// Key of a usage record: the declaring class plus the test, or `None` for a
/// class-level record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub class: String,
    pub test: Option<TestId>,
}

impl UsageKey {
    pub fn class_level(class: impl Into<String>) -> Self {
        Self { class: class.into(), test: None }
    }

    pub fn test(class: impl Into<String>, test: TestId) -> Self {
        Self { class: class.into(), test: Some(test) }
    }
}

/// A node in the usage graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GraphNode {
    /// A recorded test or class-level run.
    Usage(UsageKey),
    /// A class touched by one or more usages.
    Class(String),
}

/// Usage graph storing which classes each recorded run touched.
pub struct UsageGraph {
    graph: StableDiGraph<GraphNode, ()>,
    usage_to_idx: HashMap<UsageKey, NodeIndex>,
    class_to_idx: HashMap<String, NodeIndex>,
    overflow: bool,
}

impl Default for UsageGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageGraph {
    /// Create a new empty usage graph.
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            usage_to_idx: HashMap::new(),
            class_to_idx: HashMap::new(),
            overflow: false,
        }
    }

    fn has_room(&mut self, needed: usize) -> bool {
        if self.graph.node_count() + needed <= MAX_GRAPH_NODES {
            return true;
        }
        if !self.overflow {
            tracing::warn!(
                max_nodes = MAX_GRAPH_NODES,
                "usage graph is full, new usage records will be treated as unknown"
            );
            self.overflow = true;
        }
        false
    }

    fn class_node(&mut self, class: &str) -> NodeIndex {
        if let Some(&idx) = self.class_to_idx.get(class) {
            return idx;
        }
        let idx = self.graph.add_node(GraphNode::Class(class.to_string()));
        self.class_to_idx.insert(class.to_string(), idx);
        idx
    }

    /// Replace the touched-class edges for a usage atomically.
    ///
    /// Returns `false` if the graph is full. The key is then left without a
    /// record, even if it had one before.
    pub fn record(&mut self, key: UsageKey, touched: &HashSet<String>) -> bool {
        let new_classes = touched
            .iter()
            .filter(|c| !self.class_to_idx.contains_key(c.as_str()))
            .count();
        let new_usage = usize::from(!self.usage_to_idx.contains_key(&key));
        if !self.has_room(new_classes + new_usage) {
            self.forget(&key);
            return false;
        }

        let usage_idx = match self.usage_to_idx.get(&key) {
            Some(&idx) => idx,
            None => {
                let idx = self.graph.add_node(GraphNode::Usage(key.clone()));
                self.usage_to_idx.insert(key, idx);
                idx
            }
        };

        let previous = self.detach_outgoing(usage_idx);

        for class in touched {
            let class_idx = self.class_node(class);
            self.graph.add_edge(usage_idx, class_idx, ());
        }

        self.remove_orphans(previous);
        true
    }

    /// Remove all outgoing edges of a usage, returning the former targets.
    fn detach_outgoing(&mut self, usage_idx: NodeIndex) -> Vec<NodeIndex> {
        let edges: Vec<_> = self
            .graph
            .edges_directed(usage_idx, Direction::Outgoing)
            .map(|e| (e.id(), e.target()))
            .collect();

        edges
            .into_iter()
            .map(|(edge_id, target)| {
                self.graph.remove_edge(edge_id);
                target
            })
            .collect()
    }

    /// Drop class nodes that no usage points at anymore.
    fn remove_orphans(&mut self, candidates: Vec<NodeIndex>) {
        for idx in candidates {
            let still_used = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .next()
                .is_some();
            if still_used {
                continue;
            }
            if let Some(GraphNode::Class(name)) = self.graph.remove_node(idx) {
                self.class_to_idx.remove(&name);
            }
        }
    }

    /// Get every usage that touched the given class.
    pub fn users_of(&self, class: &str) -> Vec<UsageKey> {
        let Some(&idx) = self.class_to_idx.get(class) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(idx, Direction::Incoming)
            .filter_map(|e| match self.graph.node_weight(e.source()) {
                Some(GraphNode::Usage(key)) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    /// Get the classes a usage touched, or `None` if it was never recorded.
    pub fn touched(&self, key: &UsageKey) -> Option<HashSet<String>> {
        let &idx = self.usage_to_idx.get(key)?;
        Some(
            self.graph
                .edges_directed(idx, Direction::Outgoing)
                .filter_map(|e| match self.graph.node_weight(e.target()) {
                    Some(GraphNode::Class(name)) => Some(name.clone()),
                    _ => None,
                })
                .collect(),
        )
    }

    /// Remove every usage declared by the given class.
    pub fn remove_declaring_class(&mut self, class: &str) {
        let keys: Vec<UsageKey> = self
            .usage_to_idx
            .keys()
            .filter(|k| k.class == class)
            .cloned()
            .collect();

        for key in keys {
            self.forget(&key);
        }
    }

    /// Drop one usage node and any class nodes left without users.
    fn forget(&mut self, key: &UsageKey) {
        if let Some(idx) = self.usage_to_idx.remove(key) {
            let previous = self.detach_outgoing(idx);
            self.graph.remove_node(idx);
            self.remove_orphans(previous);
        }
    }

    /// Check if a usage has been recorded.
    pub fn contains(&self, key: &UsageKey) -> bool {
        self.usage_to_idx.contains_key(key)
    }

    /// Check if graph has overflowed.
    pub fn is_overflow(&self) -> bool {
        self.overflow
    }

    /// Number of recorded usages.
    pub fn usage_count(&self) -> usize {
        self.usage_to_idx.len()
    }

    /// Number of distinct touched classes.
    pub fn class_count(&self) -> usize {
        self.class_to_idx.len()
    }

    /// Get current edge count.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}
