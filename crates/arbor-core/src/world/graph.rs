//! Labelled graph storage
//!
//! `GraphStore` is the persistence substrate of the world model: plain node
//! and edge CRUD keyed by element ids. The default backend keeps a petgraph
//! `StableGraph` plus an id -> index map, so removing a node never shifts
//! the indices of the others.

use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::stable_graph::StableGraph;
use petgraph::visit::EdgeRef;
use petgraph::{Directed, Direction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use super::element::{Element, ElementId};

/// Payload stored for each world-model node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Vec<Value>>,
}

impl NodeRecord {
    pub fn from_element(element: &Element) -> Self {
        Self {
            kind: element.kind.clone(),
            label: element.label.clone(),
            properties: element.properties.clone(),
        }
    }

    pub fn to_element(&self, id: ElementId) -> Element {
        Element {
            kind: self.kind.clone(),
            label: self.label.clone(),
            id,
            properties: self.properties.clone(),
            relations: Vec::new(),
        }
    }
}

/// A directed, labelled edge between two grounded elements.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub src: ElementId,
    pub predicate: String,
    pub dst: ElementId,
}

impl Relation {
    pub fn new(src: ElementId, predicate: impl Into<String>, dst: ElementId) -> Self {
        Self {
            src,
            predicate: predicate.into(),
            dst,
        }
    }
}

/// Node/edge CRUD with integer ids.
///
/// Listing methods return results sorted so callers get a deterministic
/// order for a given graph state.
pub trait GraphStore: Send + Sync {
    fn contains(&self, id: ElementId) -> bool;

    fn node(&self, id: ElementId) -> Option<&NodeRecord>;

    fn node_ids(&self) -> Vec<ElementId>;

    /// Insert a node or overwrite the payload of an existing one.
    fn upsert_node(&mut self, id: ElementId, record: NodeRecord);

    /// Remove a node together with every incident edge.
    fn remove_node(&mut self, id: ElementId) -> Option<NodeRecord>;

    /// Add an edge. Returns false when an endpoint is missing.
    fn add_edge(&mut self, relation: &Relation) -> bool;

    /// Remove every edge equal to `relation`; returns how many were removed.
    fn remove_edge(&mut self, relation: &Relation) -> usize;

    fn edges(&self) -> Vec<Relation>;

    fn edges_from(&self, src: ElementId) -> Vec<Relation>;

    fn edges_into(&self, dst: ElementId) -> Vec<Relation>;

    fn clear(&mut self);

    fn node_count(&self) -> usize;
}

#[derive(Debug, Clone)]
struct StoredNode {
    id: ElementId,
    record: NodeRecord,
}

/// In-memory `GraphStore` backed by petgraph.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    graph: StableGraph<StoredNode, String, Directed, u32>,
    index: HashMap<ElementId, NodeIndex<u32>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn relation_of(&self, edge: EdgeIndex<u32>) -> Option<Relation> {
        let (a, b) = self.graph.edge_endpoints(edge)?;
        let predicate = self.graph.edge_weight(edge)?;
        Some(Relation {
            src: self.graph.node_weight(a)?.id,
            predicate: predicate.clone(),
            dst: self.graph.node_weight(b)?.id,
        })
    }

    fn directed(&self, id: ElementId, direction: Direction) -> Vec<Relation> {
        let Some(&idx) = self.index.get(&id) else {
            return Vec::new();
        };
        let mut out: Vec<Relation> = self
            .graph
            .edges_directed(idx, direction)
            .filter_map(|edge| self.relation_of(edge.id()))
            .collect();
        out.sort();
        out
    }
}

impl GraphStore for MemoryGraphStore {
    fn contains(&self, id: ElementId) -> bool {
        self.index.contains_key(&id)
    }

    fn node(&self, id: ElementId) -> Option<&NodeRecord> {
        let idx = self.index.get(&id)?;
        self.graph.node_weight(*idx).map(|n| &n.record)
    }

    fn node_ids(&self) -> Vec<ElementId> {
        let mut ids: Vec<ElementId> = self.index.keys().copied().collect();
        ids.sort();
        ids
    }

    fn upsert_node(&mut self, id: ElementId, record: NodeRecord) {
        match self.index.get(&id) {
            Some(&idx) => {
                if let Some(node) = self.graph.node_weight_mut(idx) {
                    node.record = record;
                }
            }
            None => {
                let idx = self.graph.add_node(StoredNode { id, record });
                self.index.insert(id, idx);
            }
        }
    }

    fn remove_node(&mut self, id: ElementId) -> Option<NodeRecord> {
        let idx = self.index.remove(&id)?;
        self.graph.remove_node(idx).map(|n| n.record)
    }

    fn add_edge(&mut self, relation: &Relation) -> bool {
        let (Some(&a), Some(&b)) = (self.index.get(&relation.src), self.index.get(&relation.dst))
        else {
            return false;
        };
        self.graph.add_edge(a, b, relation.predicate.clone());
        true
    }

    fn remove_edge(&mut self, relation: &Relation) -> usize {
        let (Some(&a), Some(&b)) = (self.index.get(&relation.src), self.index.get(&relation.dst))
        else {
            return 0;
        };
        let doomed: Vec<EdgeIndex<u32>> = self
            .graph
            .edges_directed(a, Direction::Outgoing)
            .filter(|edge| edge.target() == b && edge.weight() == &relation.predicate)
            .map(|edge| edge.id())
            .collect();
        for edge in &doomed {
            self.graph.remove_edge(*edge);
        }
        doomed.len()
    }

    fn edges(&self) -> Vec<Relation> {
        let mut out: Vec<Relation> = self
            .graph
            .edge_indices()
            .filter_map(|edge| self.relation_of(edge))
            .collect();
        out.sort();
        out
    }

    fn edges_from(&self, src: ElementId) -> Vec<Relation> {
        self.directed(src, Direction::Outgoing)
    }

    fn edges_into(&self, dst: ElementId) -> Vec<Relation> {
        self.directed(dst, Direction::Incoming)
    }

    fn clear(&mut self) {
        self.graph.clear();
        self.index.clear();
    }

    fn node_count(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: &str) -> NodeRecord {
        NodeRecord {
            kind: kind.into(),
            label: String::new(),
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn test_remove_node_drops_incident_edges() {
        let mut store = MemoryGraphStore::new();
        store.upsert_node(ElementId(0), record("Scene"));
        store.upsert_node(ElementId(1), record("Box"));
        store.upsert_node(ElementId(2), record("Box"));
        assert!(store.add_edge(&Relation::new(ElementId(0), "contain", ElementId(1))));
        assert!(store.add_edge(&Relation::new(ElementId(1), "fitsIn", ElementId(2))));

        store.remove_node(ElementId(1));
        assert!(store.edges().is_empty());
        assert_eq!(store.node_ids(), vec![ElementId(0), ElementId(2)]);
    }

    #[test]
    fn test_parallel_edges_removed_together() {
        let mut store = MemoryGraphStore::new();
        store.upsert_node(ElementId(0), record("A"));
        store.upsert_node(ElementId(1), record("B"));
        let rel = Relation::new(ElementId(0), "near", ElementId(1));
        store.add_edge(&rel);
        store.add_edge(&rel);
        store.add_edge(&Relation::new(ElementId(0), "far", ElementId(1)));

        assert_eq!(store.remove_edge(&rel), 2);
        assert_eq!(store.edges_from(ElementId(0)).len(), 1);
    }

    #[test]
    fn test_add_edge_requires_endpoints() {
        let mut store = MemoryGraphStore::new();
        store.upsert_node(ElementId(0), record("A"));
        assert!(!store.add_edge(&Relation::new(ElementId(0), "contain", ElementId(9))));
    }
}
