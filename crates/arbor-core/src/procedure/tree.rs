//! Arena of procedure nodes.
//!
//! Nodes refer to each other by [`NodeId`]. A subtree can be split off
//! into its own arena (to be visited on another task) and absorbed back.
//! Split arenas share the id allocator, so nodes created on either side
//! never collide.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::node::{NodeBody, Procedure};
use super::signal::{NodeHandle, NodeState};
use super::{Composite, NodeId, TreeError};
use crate::error::EngineError;
use crate::registry::NodeInstanciator;
use crate::skill::{ExpandContext, Skill};

#[derive(Debug, Clone)]
pub struct ProcedureTree {
    nodes: HashMap<NodeId, Procedure>,
    root: Option<NodeId>,
    ids: Arc<AtomicU64>,
}

impl Default for ProcedureTree {
    fn default() -> Self {
        Self::empty()
    }
}

impl ProcedureTree {
    pub fn empty() -> Self {
        Self {
            nodes: HashMap::new(),
            root: None,
            ids: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn new(root: Procedure) -> Self {
        let mut tree = Self::empty();
        tree.set_root(root);
        tree
    }

    fn next_id(&self) -> NodeId {
        NodeId(self.ids.fetch_add(1, Ordering::Relaxed))
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Insert `node` and make it the root. A previous root stays in the
    /// arena, unlinked.
    pub fn set_root(&mut self, mut node: Procedure) -> NodeId {
        let id = self.next_id();
        node.parent = None;
        self.nodes.insert(id, node);
        self.root = Some(id);
        id
    }

    /// Insert a node with no parent and no children.
    pub fn insert_detached(&mut self, mut node: Procedure) -> NodeId {
        let id = self.next_id();
        node.parent = None;
        node.children.clear();
        self.nodes.insert(id, node);
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Procedure> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Procedure> {
        self.nodes.get_mut(&id)
    }

    pub fn node(&self, id: NodeId) -> Result<&Procedure, TreeError> {
        self.nodes.get(&id).ok_or(TreeError::NodeNotFound(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Procedure, TreeError> {
        self.nodes.get_mut(&id).ok_or(TreeError::NodeNotFound(id))
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.get(id).map(|n| n.children.clone()).unwrap_or_default()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|n| n.parent)
    }

    // ============ Structure ============

    /// Append `child` under `parent`, inheriting the parent's remaps.
    ///
    /// With `latch`, the previous sibling's postconditions become
    /// preconditions of the new child, along with any params they need.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        mut child: Procedure,
        latch: bool,
    ) -> Result<NodeId, TreeError> {
        let parent_node = self.node(parent)?;
        for (from, to) in parent_node.remaps() {
            child.remap(from, to)?;
        }
        if latch {
            if let Some(previous) = parent_node.children.last() {
                let previous = self.node(*previous)?;
                for condition in &previous.post {
                    for key in condition.keys() {
                        if child.params.contains(key) {
                            continue;
                        }
                        if let Some(param) = previous.params.get(key) {
                            child.params.insert(param.clone());
                        }
                    }
                    child.pre.push(condition.clone());
                }
            }
        }
        let id = self.next_id();
        child.parent = Some(parent);
        child.children.clear();
        self.nodes.insert(id, child);
        self.node_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Link an existing detached node as the last child of `parent`.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<(), TreeError> {
        if self.node(child)?.parent.is_some() {
            return Err(TreeError::AlreadyAttached(child));
        }
        self.node_mut(parent)?.children.push(child);
        self.node_mut(child)?.parent = Some(parent);
        Ok(())
    }

    /// Unlink the last child of `parent`. The node stays in the arena.
    pub fn pop_child(&mut self, parent: NodeId) -> Result<Option<NodeId>, TreeError> {
        let child = self.node_mut(parent)?.children.pop();
        if let Some(child) = child {
            if let Some(node) = self.get_mut(child) {
                node.parent = None;
            }
        }
        Ok(child)
    }

    /// Remove `id` and all its descendants.
    pub fn remove_subtree(&mut self, id: NodeId) -> Result<(), TreeError> {
        let parent = self.node(id)?.parent;
        if let Some(parent) = parent {
            if let Some(node) = self.get_mut(parent) {
                node.children.retain(|c| *c != id);
            }
        }
        for node in self.descendants(id) {
            self.nodes.remove(&node);
        }
        if self.root == Some(id) {
            self.root = None;
        }
        Ok(())
    }

    /// `id` followed by its descendants, depth first.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(node) = self.get(next) else {
                continue;
            };
            out.push(next);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Whether `node` is a strict descendant of `ancestor`.
    pub fn in_subtree_of(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = self.parent(node);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.parent(current);
        }
        false
    }

    /// Move `id` and its descendants into a new arena rooted at `id`.
    ///
    /// The parent keeps `id` in its children list; [`ProcedureTree::absorb`]
    /// restores the link.
    pub fn split_off(&mut self, id: NodeId) -> Result<ProcedureTree, TreeError> {
        self.node(id)?;
        let mut subtree = ProcedureTree {
            nodes: HashMap::new(),
            root: Some(id),
            ids: Arc::clone(&self.ids),
        };
        for node in self.descendants(id) {
            if let Some(procedure) = self.nodes.remove(&node) {
                subtree.nodes.insert(node, procedure);
            }
        }
        Ok(subtree)
    }

    pub fn absorb(&mut self, other: ProcedureTree) {
        self.nodes.extend(other.nodes);
    }

    /// Add a composite node under `parent`, or as root when `parent` is `None`.
    pub fn add_sequence(
        &mut self,
        parent: Option<NodeId>,
        label: &str,
        composite: Composite,
    ) -> Result<NodeId, TreeError> {
        let node = Procedure::composite(label, composite);
        match parent {
            Some(parent) => self.add_child(parent, node, false),
            None => Ok(self.set_root(node)),
        }
    }

    // ============ Params ============

    /// Remap `from` to `to` on `id` and every descendant.
    pub fn remap(&mut self, id: NodeId, from: &str, to: &str) -> Result<(), TreeError> {
        for node in self.descendants(id) {
            self.node_mut(node)?.remap(from, to)?;
        }
        Ok(())
    }

    /// Reload the node from its description, dropping its children.
    pub fn reset_description(&mut self, id: NodeId) -> Result<(), TreeError> {
        let children = self.node(id)?.children.clone();
        for child in children {
            self.remove_subtree(child)?;
        }
        let node = self.node_mut(id)?;
        node.reset_description();
        node.reapply_remaps()
    }

    /// Bind `skill` to the node and let the skill expand it.
    pub fn set_instance(
        &mut self,
        id: NodeId,
        skill: Arc<dyn Skill>,
        registry: &NodeInstanciator,
    ) -> Result<(), EngineError> {
        if self.node(id)?.has_instance() {
            self.reset_description(id)?;
        }
        if self.node(id)?.description().is_none() {
            let description = registry
                .description(skill.type_name())
                .unwrap_or_else(|| registry.create_skill_description(skill.as_ref()));
            let node = self.node_mut(id)?;
            node.set_description(description);
            node.reapply_remaps()?;
        }
        let node = self.node_mut(id)?;
        node.label = skill.label().to_string();
        node.body = NodeBody::Skill(Some(Arc::clone(&skill)));
        node.set_state(NodeState::Idle);

        let mut ctx = ExpandContext::new(self, id, registry);
        skill.expand(&mut ctx)
    }

    // ============ Signals ============

    /// Preempt `id` and its active descendants.
    pub fn preempt(&self, id: NodeId) {
        let Some(node) = self.get(id) else {
            return;
        };
        if node.request_preempt() {
            for child in &node.children {
                self.preempt(*child);
            }
        }
    }

    pub fn handle(&self, id: NodeId) -> Result<NodeHandle, TreeError> {
        Ok(self.node(id)?.handle())
    }

    pub fn set_state(&self, id: NodeId, state: NodeState) -> Result<(), TreeError> {
        self.node(id)?.set_state(state);
        Ok(())
    }

    // ============ Diagnostics ============

    /// One line per node, indented by depth.
    pub fn render(&self, verbose: bool) -> String {
        let mut out = String::new();
        if let Some(root) = self.root {
            self.render_node(root, 0, verbose, &mut out);
        }
        out
    }

    fn render_node(&self, id: NodeId, depth: usize, verbose: bool, out: &mut String) {
        let Some(node) = self.get(id) else {
            return;
        };
        let _ = writeln!(out, "{}{}", "  ".repeat(depth), node.render(verbose));
        for child in &node.children {
            self.render_node(*child, depth + 1, verbose, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::Condition;
    use crate::params::ParamType;
    use crate::procedure::ProcedureDescription;
    use crate::world::Element;

    fn place() -> Procedure {
        Procedure::from_description(
            Arc::new(
                ProcedureDescription::new("Place")
                    .with_param("Object", Element::new("Box"), ParamType::Online, &[])
                    .with_post(Condition::is_specified("placed", "Object", false)),
            ),
            "place",
        )
    }

    #[test]
    fn test_children_inherit_parent_remaps() {
        let mut tree = ProcedureTree::new(Procedure::root("task"));
        let root = tree.root().unwrap();
        let seq = tree.add_sequence(Some(root), "seq", Composite::Serial).unwrap();
        tree.node_mut(seq).unwrap().remap("Object", "Cube").unwrap();

        let child = tree.add_child(seq, place(), false).unwrap();
        assert!(tree.node(child).unwrap().params.contains("Cube"));
        assert!(tree.in_subtree_of(child, root));
        assert!(!tree.in_subtree_of(root, child));
        assert!(!tree.in_subtree_of(child, child));
    }

    #[test]
    fn test_latch_copies_previous_postconditions() {
        let mut tree = ProcedureTree::new(Procedure::root("task"));
        let root = tree.root().unwrap();
        tree.add_child(root, place(), false).unwrap();
        let second = tree
            .add_child(root, Procedure::composite("after", Composite::Serial), true)
            .unwrap();

        let node = tree.node(second).unwrap();
        assert_eq!(node.pre.len(), 1);
        assert!(node.params.contains("Object"));
    }

    #[test]
    fn test_split_and_absorb_keep_ids_unique() {
        let mut tree = ProcedureTree::new(Procedure::root("task"));
        let root = tree.root().unwrap();
        let a = tree.add_sequence(Some(root), "a", Composite::Serial).unwrap();
        let a1 = tree.add_child(a, place(), false).unwrap();

        let mut subtree = tree.split_off(a).unwrap();
        assert!(!tree.contains(a1));
        assert_eq!(subtree.root(), Some(a));
        let extra = subtree.add_child(a, place(), false).unwrap();
        let sibling = tree.add_sequence(Some(root), "b", Composite::Serial).unwrap();
        assert_ne!(extra, sibling);

        tree.absorb(subtree);
        assert_eq!(tree.children(a), vec![a1, extra]);
        assert_eq!(tree.descendants(root).len(), 5);
    }

    #[test]
    fn test_pop_child_and_remove_subtree() {
        let mut tree = ProcedureTree::new(Procedure::root("task"));
        let root = tree.root().unwrap();
        let a = tree.add_sequence(Some(root), "a", Composite::Serial).unwrap();
        tree.add_child(a, place(), false).unwrap();

        assert_eq!(tree.pop_child(root).unwrap(), Some(a));
        assert!(tree.parent(a).is_none());
        tree.attach(root, a).unwrap();
        tree.remove_subtree(a).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.children(root).is_empty());
    }

    #[test]
    fn test_render_indents_by_depth() {
        let mut tree = ProcedureTree::new(Procedure::root("task"));
        let root = tree.root().unwrap();
        tree.add_sequence(Some(root), "a", Composite::Parallel).unwrap();
        let text = tree.render(false);
        assert_eq!(text, "Root:task\n  Procedure:a\n");
    }
}
