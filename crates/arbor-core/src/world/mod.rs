//! World model
//!
//! A labelled, directed multigraph of [`Element`] nodes. The model owns id
//! assignment, the `contain` tree invariant, relation queries with
//! predicate sub-typing, template matching and the constraint-join
//! resolver (see [`resolver`]).

mod element;
mod graph;
mod ontology;
mod reasoner;
pub mod resolver;

pub use element::{Element, ElementId, RelationEnd, RelationTemplate};
pub use graph::{GraphStore, MemoryGraphStore, NodeRecord, Relation};
pub use ontology::{StaticTypeHierarchy, TypeHierarchy};
pub use reasoner::RelationReasoner;
pub use resolver::ResolvedGroup;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Predicate forming the containment tree.
pub const CONTAIN: &str = "contain";

/// Type of the element created by [`WorldModel::reset`].
pub const SCENE_TYPE: &str = "Scene";

/// Default bound on overlap merges performed by the resolver.
pub const DEFAULT_MAX_OVERLAP_MERGES: usize = 32;

/// World model shared between visitors and running capabilities.
pub type SharedWorldModel = Arc<RwLock<WorldModel>>;

/// World model errors
#[derive(Debug, Error)]
pub enum WorldModelError {
    #[error("element not found: {0}")]
    ElementNotFound(ElementId),
    #[error("parent element not found: {0}")]
    ParentNotFound(ElementId),
    #[error("element id already in use: {0}")]
    DuplicateElement(ElementId),
    #[error("constraint join over {keys:?} did not converge within {merges} merges")]
    ResolverOverlapOverflow { keys: Vec<String>, merges: usize },
}

/// Value dump of the graph, comparable for equality.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldSnapshot {
    pub nodes: BTreeMap<ElementId, NodeRecord>,
    pub edges: Vec<Relation>,
}

/// A removed element together with every edge that touched it.
#[derive(Debug, Clone, PartialEq)]
pub struct DetachedElement {
    pub element: Element,
    pub edges: Vec<Relation>,
}

pub struct WorldModel {
    store: Box<dyn GraphStore>,
    types: Arc<dyn TypeHierarchy>,
    reasoners: Vec<Arc<dyn RelationReasoner>>,
    max_overlap_merges: usize,
}

impl WorldModel {
    /// Create an empty model on the in-memory backend.
    pub fn new(types: Arc<dyn TypeHierarchy>) -> Self {
        Self::with_store(Box::new(MemoryGraphStore::new()), types)
    }

    pub fn with_store(store: Box<dyn GraphStore>, types: Arc<dyn TypeHierarchy>) -> Self {
        Self {
            store,
            types,
            reasoners: Vec::new(),
            max_overlap_merges: DEFAULT_MAX_OVERLAP_MERGES,
        }
    }

    pub fn with_max_overlap_merges(mut self, merges: usize) -> Self {
        self.max_overlap_merges = merges;
        self
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn RelationReasoner>) -> Self {
        self.register_reasoner(reasoner);
        self
    }

    pub fn register_reasoner(&mut self, reasoner: Arc<dyn RelationReasoner>) {
        debug!(reasoner = %reasoner.name(), "relation reasoner registered");
        self.reasoners.push(reasoner);
    }

    pub fn into_shared(self) -> SharedWorldModel {
        Arc::new(RwLock::new(self))
    }

    pub fn types(&self) -> &Arc<dyn TypeHierarchy> {
        &self.types
    }

    pub fn max_overlap_merges(&self) -> usize {
        self.max_overlap_merges
    }

    /// Drop every node and edge and create the scene root with id 0.
    pub fn reset(&mut self, scene_name: &str) {
        self.store.clear();
        self.store.upsert_node(
            Self::root_id(),
            NodeRecord::from_element(&Element::labeled(SCENE_TYPE, scene_name)),
        );
    }

    pub fn root_id() -> ElementId {
        ElementId(0)
    }

    pub fn len(&self) -> usize {
        self.store.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.store.node_count() == 0
    }

    pub fn contains(&self, id: ElementId) -> bool {
        id.is_grounded() && self.store.contains(id)
    }

    // ============ CRUD ============

    /// Insert `element` under `parent`, linked by `predicate`.
    ///
    /// An ungrounded element receives the smallest unused id. A grounded
    /// one keeps its id when free, otherwise the next free id above it.
    pub fn add_element(
        &mut self,
        element: &Element,
        parent: ElementId,
        predicate: &str,
    ) -> Result<ElementId, WorldModelError> {
        if !self.contains(parent) {
            warn!(parent = %parent, element = %element, "add element: parent not found");
            return Err(WorldModelError::ParentNotFound(parent));
        }
        let id = self.allocate_id(element.id);
        self.store.upsert_node(id, NodeRecord::from_element(element));
        self.set_relation(parent, predicate, id, true)?;
        debug!(id = %id, parent = %parent, predicate = %predicate, "element added");
        Ok(id)
    }

    fn allocate_id(&self, desired: ElementId) -> ElementId {
        let mut next = if desired.is_grounded() { desired.0 } else { 0 };
        while self.store.contains(ElementId(next)) {
            next += 1;
        }
        ElementId(next)
    }

    pub fn remove_element(&mut self, id: ElementId) -> Result<Element, WorldModelError> {
        self.store
            .remove_node(id)
            .map(|record| record.to_element(id))
            .ok_or(WorldModelError::ElementNotFound(id))
    }

    /// Remove an element, returning everything needed to put it back.
    pub fn detach_element(&mut self, id: ElementId) -> Result<DetachedElement, WorldModelError> {
        let mut edges = self.store.edges_from(id);
        edges.extend(self.store.edges_into(id));
        edges.sort();
        edges.dedup_by(|a, b| a == b && a.src == a.dst);
        let element = self.remove_element(id)?;
        Ok(DetachedElement { element, edges })
    }

    /// Exact inverse of [`WorldModel::detach_element`].
    pub fn restore_element(&mut self, detached: &DetachedElement) -> Result<(), WorldModelError> {
        let id = detached.element.id;
        if self.store.contains(id) {
            return Err(WorldModelError::DuplicateElement(id));
        }
        self.store
            .upsert_node(id, NodeRecord::from_element(&detached.element));
        for edge in &detached.edges {
            if !self.store.add_edge(edge) {
                warn!(src = %edge.src, dst = %edge.dst, predicate = %edge.predicate, "restore: dangling edge skipped");
            }
        }
        Ok(())
    }

    /// Overwrite the payload of an existing node.
    pub fn update_element(&mut self, element: &Element) -> Result<(), WorldModelError> {
        if !self.contains(element.id) {
            return Err(WorldModelError::ElementNotFound(element.id));
        }
        self.store
            .upsert_node(element.id, NodeRecord::from_element(element));
        Ok(())
    }

    pub fn get_element(&self, id: ElementId) -> Option<Element> {
        if !id.is_grounded() {
            return None;
        }
        self.store.node(id).map(|record| record.to_element(id))
    }

    pub fn element(&self, id: ElementId) -> Result<Element, WorldModelError> {
        self.get_element(id)
            .ok_or(WorldModelError::ElementNotFound(id))
    }

    pub fn elements(&self) -> Vec<Element> {
        self.store
            .node_ids()
            .into_iter()
            .filter_map(|id| self.get_element(id))
            .collect()
    }

    /// Insert (`state = true`) or remove matching edges.
    ///
    /// Inserting a `contain` edge first removes the target's current
    /// container edge.
    pub fn set_relation(
        &mut self,
        src: ElementId,
        predicate: &str,
        dst: ElementId,
        state: bool,
    ) -> Result<(), WorldModelError> {
        for id in [src, dst] {
            if !self.contains(id) {
                return Err(WorldModelError::ElementNotFound(id));
            }
        }
        let relation = Relation::new(src, predicate, dst);
        if !state {
            self.store.remove_edge(&relation);
            return Ok(());
        }
        if predicate == CONTAIN {
            for old in self.store.edges_into(dst) {
                if old.predicate == CONTAIN {
                    self.store.remove_edge(&old);
                }
            }
        } else if self.store.edges_from(src).contains(&relation) {
            return Ok(());
        }
        self.store.add_edge(&relation);
        Ok(())
    }

    // ============ Queries ============

    /// Edges matching the pattern. Ungrounded ids and an empty predicate
    /// are wildcards; a predicate also matches its sub-predicates.
    pub fn get_relations(&self, src: ElementId, predicate: &str, dst: ElementId) -> Vec<Relation> {
        let pool = if src.is_grounded() {
            self.store.edges_from(src)
        } else if dst.is_grounded() {
            self.store.edges_into(dst)
        } else {
            self.store.edges()
        };
        let mut out: Vec<Relation> = pool
            .into_iter()
            .filter(|edge| !src.is_grounded() || edge.src == src)
            .filter(|edge| !dst.is_grounded() || edge.dst == dst)
            .filter(|edge| self.predicate_matches(&edge.predicate, predicate))
            .collect();

        if src.is_grounded() && dst.is_grounded() && !predicate.is_empty() {
            for reasoner in self.reasoners.iter().filter(|r| r.handles(predicate)) {
                let (Some(subject), Some(object)) = (self.get_element(src), self.get_element(dst))
                else {
                    break;
                };
                let derived = Relation::new(src, predicate, dst);
                if !out.contains(&derived) && reasoner.derive(&subject, predicate, &object) {
                    out.push(derived);
                }
            }
        }
        out
    }

    pub fn has_relation(&self, src: ElementId, predicate: &str, dst: ElementId) -> bool {
        !self.get_relations(src, predicate, dst).is_empty()
    }

    /// Every stored edge ending in `dst`.
    pub fn relations_into(&self, dst: ElementId) -> Vec<Relation> {
        self.store.edges_into(dst)
    }

    /// Replace the stored edges ending in `dst` with `edges`.
    pub fn replace_relations_into(&mut self, dst: ElementId, edges: &[Relation]) {
        let mut current = self.store.edges_into(dst);
        current.dedup();
        for edge in &current {
            self.store.remove_edge(edge);
        }
        for edge in edges {
            self.store.add_edge(edge);
        }
    }

    pub fn get_parent(&self, id: ElementId) -> Option<Element> {
        self.store
            .edges_into(id)
            .into_iter()
            .find(|edge| edge.predicate == CONTAIN)
            .and_then(|edge| self.get_element(edge.src))
    }

    pub fn get_children(&self, id: ElementId) -> Vec<Element> {
        self.store
            .edges_from(id)
            .into_iter()
            .filter(|edge| edge.predicate == CONTAIN)
            .filter_map(|edge| self.get_element(edge.dst))
            .collect()
    }

    fn predicate_matches(&self, predicate: &str, query: &str) -> bool {
        query.is_empty() || predicate == query || self.types.is_subpredicate_of(predicate, query)
    }

    fn type_matches(&self, kind: &str, query: &str) -> bool {
        query.is_empty() || kind == query || self.types.is_subtype_of(kind, query)
    }

    pub fn is_of_type(&self, element: &Element, type_name: &str) -> bool {
        self.type_matches(&element.kind, type_name)
    }

    fn matches_template(&self, record: &Element, template: &Element) -> bool {
        if !self.type_matches(&record.kind, &template.kind) {
            return false;
        }
        if !template.has_wildcard_label() && record.label != template.label {
            return false;
        }
        template.properties.iter().all(|(key, values)| {
            record.has_property(key)
                && values
                    .iter()
                    .all(|value| record.has_property_value(key, value))
        })
    }

    /// Every node matching the template's type, label and properties.
    pub fn resolve_element(&self, template: &Element) -> Vec<Element> {
        self.elements()
            .into_iter()
            .filter(|candidate| self.matches_template(candidate, template))
            .collect()
    }

    /// Whether a grounded `candidate` satisfies `template`, including the
    /// template's positive relation constraints.
    pub fn is_instance(&self, candidate: &Element, template: &Element) -> bool {
        if !candidate.is_grounded() {
            return false;
        }
        let current = self.get_element(candidate.id);
        let record = current.as_ref().unwrap_or(candidate);
        if !self.matches_template(record, template) {
            return false;
        }
        template
            .relations
            .iter()
            .filter(|r| r.state)
            .all(|r| match (&r.src, &r.dst) {
                (RelationEnd::This, _) => {
                    self.has_relation(candidate.id, &r.predicate, ElementId::UNBOUND)
                }
                (_, RelationEnd::This) => {
                    self.has_relation(ElementId::UNBOUND, &r.predicate, candidate.id)
                }
                _ => true,
            })
    }

    // ============ Diagnostics ============

    pub fn snapshot(&self) -> WorldSnapshot {
        let nodes = self
            .store
            .node_ids()
            .into_iter()
            .filter_map(|id| self.store.node(id).map(|record| (id, record.clone())))
            .collect();
        WorldSnapshot {
            nodes,
            edges: self.store.edges(),
        }
    }

    /// Indented dump of the `contain` tree plus the other edges.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(root) = self.get_element(Self::root_id()) {
            self.render_branch(&root, 0, &mut out);
        }
        for edge in self.store.edges() {
            if edge.predicate != CONTAIN {
                let _ = writeln!(out, "{} -{}-> {}", edge.src, edge.predicate, edge.dst);
            }
        }
        out
    }

    fn render_branch(&self, element: &Element, depth: usize, out: &mut String) {
        let _ = writeln!(out, "{}{}", "  ".repeat(depth), element);
        for child in self.get_children(element.id) {
            self.render_branch(&child, depth + 1, out);
        }
    }
}

impl std::fmt::Debug for WorldModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldModel")
            .field("nodes", &self.store.node_count())
            .field("reasoners", &self.reasoners.len())
            .finish_non_exhaustive()
    }
}
