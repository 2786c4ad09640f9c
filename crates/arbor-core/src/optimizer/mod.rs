//! Execution order optimizer
//!
//! Simulates the tree node by node. Each node is moved back through the
//! transaction log as far as its preconditions and conflicts allow, and
//! nodes that can follow each other in any order are grouped under a
//! parallel composite. The reordered plan is the simulator's shadow tree.
//!
//! Rules checked when moving a node `p1` before an executed node `p2`:
//! 1. the preconditions of `p1` hold
//! 2. no postcondition of `p1` conflicts with one of `p2`, and no hold
//!    condition of `p1` conflicts with a precondition of `p2`
//! 3. when `p1` leaves the subtree of `p2`, it takes along the
//!    preconditions of `p2` over its own params
//!
//! A fourth rule is enforced on the way up: a node must not break the
//! transactions that follow it. Those that no longer replay are deferred
//! until after the blocking node.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::conditions::Condition;
use crate::error::EngineError;
use crate::procedure::{Composite, NodeId, NodeState, PreemptFlag, ProcedureTree};
use crate::registry::NodeInstanciator;
use crate::simulator::{ReversibleSimulator, Transaction, TransactionTag};
use crate::visitor::Visitor;
use crate::world::SharedWorldModel;

#[derive(Debug)]
pub struct OptimizerVisitor {
    sim: ReversibleSimulator,
    state: NodeState,
    verbose: bool,
    /// Nodes whose effects already hold
    skipped: HashSet<NodeId>,
    execution: ProcedureTree,
    sequence: Vec<Transaction>,
}

impl OptimizerVisitor {
    pub fn new(world: SharedWorldModel, registry: Arc<NodeInstanciator>) -> Self {
        Self::from_simulator(ReversibleSimulator::new(world, registry))
    }

    pub fn from_simulator(sim: ReversibleSimulator) -> Self {
        Self {
            sim,
            state: NodeState::Idle,
            verbose: false,
            skipped: HashSet::new(),
            execution: ProcedureTree::empty(),
            sequence: Vec::new(),
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Optimized plan of the last traversal.
    pub fn execution_tree(&self) -> &ProcedureTree {
        &self.execution
    }

    /// Transactions of the last traversal in optimized order.
    pub fn execution_sequence(&self) -> &[Transaction] {
        &self.sequence
    }

    pub fn simulator(&self) -> &ReversibleSimulator {
        &self.sim
    }

    async fn check_rules(&self, tree: &mut ProcedureTree, p1: NodeId, p2: NodeId) -> Result<(), EngineError> {
        {
            let world = Arc::clone(self.sim.executor().world());
            let wm = world.read().await;
            let node = tree.node(p1)?;
            let invalid = node.check_pre(&wm, self.verbose);
            if !invalid.is_empty() {
                return Err(EngineError::PreconditionViolation(invalid));
            }
        }

        let node = tree.node(p1)?;
        let other = tree.node(p2)?;
        for c1 in &node.post {
            for c2 in &other.post {
                if c1.has_conflict(&node.params, c2, &other.params) {
                    return Err(EngineError::ConstraintConflict(format!("{c1} conflicts with {c2}")));
                }
            }
        }
        for c1 in &node.hold {
            for c2 in &other.pre {
                if c1.has_conflict(&node.params, c2, &other.params) {
                    return Err(EngineError::ConstraintConflict(format!("{c1} conflicts with {c2}")));
                }
            }
        }

        if tree.in_subtree_of(p1, p2) {
            let inherited: Vec<Condition> = other
                .pre
                .iter()
                .filter(|c2| node.params.keys().any(|k| c2.references(k)))
                .filter(|c2| !node.pre.iter().any(|c1| c1.is_equal(c2)))
                .cloned()
                .collect();
            let params: Vec<_> = inherited
                .iter()
                .flat_map(|c| c.keys())
                .filter(|k| !node.params.contains(k))
                .filter_map(|k| other.params.get(k).cloned())
                .collect();
            let label = node.label.clone();
            let node = tree.node_mut(p1)?;
            for param in params {
                node.params.insert(param);
            }
            for condition in inherited {
                if self.verbose {
                    info!(node = %label, condition = %condition, "inheriting precondition");
                }
                node.add_pre_condition(condition);
            }
        }
        Ok(())
    }

    /// Redo one unit starting at the back top: an execute through its
    /// post execute, or a lone post execute. `Ok(false)` when its first
    /// transaction does not replay.
    async fn redo_unit(&mut self, tree: &mut ProcedureTree) -> Result<bool, EngineError> {
        let Some((head, tag)) = self.sim.back_top() else {
            return Ok(false);
        };
        if !self.sim.redo(tree, None).await? {
            return Ok(false);
        }
        if tag == TransactionTag::PostExecute {
            return Ok(true);
        }
        while let Some((id, tag)) = self.sim.back_top() {
            if !self.sim.redo(tree, None).await? {
                return Err(EngineError::InconsistentLog(format!("cannot redo {tag} of {id}")));
            }
            if id == head && tag == TransactionTag::PostExecute {
                return Ok(true);
            }
        }
        Err(EngineError::InconsistentLog(format!("post execute of {head} is missing")))
    }

    /// Move the unit of `candidate` after the unit of `blocked`, which no
    /// longer replays once `candidate` has run.
    async fn defer(&mut self, tree: &mut ProcedureTree, candidate: NodeId, blocked: NodeId) -> Result<(), EngineError> {
        debug!(candidate = %candidate, blocked = %blocked, "deferring node");
        loop {
            let Some(top) = self.sim.forward_top() else {
                return Err(EngineError::InconsistentLog(format!("execute of {candidate} is missing")));
            };
            self.sim.undo(tree).await?;
            if top == (candidate, TransactionTag::Execute) {
                break;
            }
        }
        let mut stash = self.take_unit(candidate)?;

        loop {
            let Some(top) = self.sim.back_top() else {
                return Err(EngineError::InconsistentLog(format!("{blocked} is missing from the log")));
            };
            if !self.sim.redo(tree, None).await? {
                return Err(EngineError::InconsistentLog(format!(
                    "cannot redo {} of {}",
                    top.1, top.0
                )));
            }
            if top == (blocked, TransactionTag::PostExecute) || self.sim.back_top().is_none() {
                break;
            }
        }

        loop {
            self.sim.restore_back(&stash);
            if self.redo_unit(tree).await? {
                return Ok(());
            }
            stash = self.take_unit(candidate)?;
            if !self.redo_unit(tree).await? {
                return Err(EngineError::InconsistentLog(format!(
                    "no position found for {candidate}"
                )));
            }
        }
    }

    /// Pop the transactions of `candidate`'s unit from the back log.
    fn take_unit(&mut self, candidate: NodeId) -> Result<Vec<Transaction>, EngineError> {
        let mut unit = Vec::new();
        while let Some(transaction) = self.sim.take_back() {
            unit.push(transaction);
            if transaction == (candidate, TransactionTag::PostExecute) {
                return Ok(unit);
            }
        }
        Err(EngineError::InconsistentLog(format!(
            "post execute of {candidate} is missing"
        )))
    }
}

#[async_trait]
impl Visitor for OptimizerVisitor {
    fn preempt_flag(&self) -> &PreemptFlag {
        self.sim.executor().preempt_flag()
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    async fn on_start(&mut self, _tree: &mut ProcedureTree, _root: NodeId) -> Result<(), EngineError> {
        self.skipped.clear();
        self.sequence.clear();
        Ok(())
    }

    async fn process_node(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        if !self.sim.execute(tree, id, false, Some(Composite::Serial)).await? {
            error!(node = %tree.node(id)?.label, params = %tree.node(id)?.params, "cannot ground node");
            return Ok(false);
        }
        tree.node_mut(id)?.release_input();

        let redundant = {
            let world = Arc::clone(self.sim.executor().world());
            let wm = world.read().await;
            let node = tree.node(id)?;
            node.has_post() && node.check_post(&wm, false).is_empty()
        };
        if redundant {
            info!(node = %tree.node(id)?.label, "effects already hold, skipping");
            self.skipped.insert(id);
            return Ok(true);
        }

        let mut processor = None;
        if tree.node(id)?.has_pre() {
            while self.sim.undo(tree).await? {
                let Some((previous, _)) = self.sim.back_top() else {
                    break;
                };
                let mut input = self.sim.blackboard().clone();
                tree.node_mut(id)?.apply_input(&mut input);
                if let Err(reason) = self.check_rules(tree, id, previous).await {
                    if self.verbose {
                        info!(node = %tree.node(id)?.label, before = %tree.node(previous)?.label, reason = %reason, "cannot move further back");
                    }
                    if !self.sim.redo(tree, None).await? {
                        return Err(EngineError::InconsistentLog(format!(
                            "cannot redo {previous} after probing"
                        )));
                    }
                    processor = Some(Composite::Serial);
                    break;
                }
            }
        }

        while let Some((top, tag)) = self.sim.back_top() {
            if !tree.in_subtree_of(id, top) && tag != TransactionTag::PostExecute {
                break;
            }
            if !self.sim.redo(tree, None).await? {
                return Err(EngineError::InconsistentLog(format!("cannot redo {tag} of {top}")));
            }
            processor = None;
        }

        if !self.sim.execute(tree, id, true, processor).await? {
            error!(node = %tree.node(id)?.label, "cannot execute at the chosen position");
            return Ok(false);
        }
        Ok(true)
    }

    /// Always in order; the reordering happens in the log.
    async fn process_children(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        let children = tree.node(id)?.children().to_vec();
        Composite::Serial.process(self, tree, id, children).await
    }

    async fn post_process_node(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        if self.skipped.remove(&id) {
            return Ok(true);
        }
        if !self.sim.post_execute(tree, id).await? {
            return Err(EngineError::InconsistentLog(format!(
                "cannot commit effects of {}",
                tree.node(id)?.label
            )));
        }
        let mut first = true;
        while let Some((next, _)) = self.sim.back_top() {
            let processor = first.then_some(Composite::Parallel);
            if self.sim.redo(tree, processor).await? {
                first = false;
                continue;
            }
            self.defer(tree, id, next).await?;
            first = true;
        }
        Ok(true)
    }

    async fn processing_done(&mut self, tree: &mut ProcedureTree, _root: NodeId) -> Result<bool, EngineError> {
        self.sim.freeze();
        self.execution = self.sim.execution_tree().clone();
        self.sequence = self.sim.forward_log().to_vec();
        self.sim.undo_all(tree).await?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(tree = %self.execution.render(true), "optimized execution tree");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;
    use crate::testing::{self, inspect_description, pick_description, place_description, ScriptedSkill};
    use crate::visitor::traverse;
    use crate::world::Element;

    #[tokio::test]
    async fn test_independent_nodes_are_grouped_in_parallel() {
        let scene = testing::scene();
        let registry = testing::registry(vec![ScriptedSkill::new("inspect", inspect_description())]);
        let (mut tree, ids) = testing::plan(
            &registry,
            Composite::Serial,
            &[("Inspect", "inspect"), ("Inspect", "inspect")],
        );
        for (id, (label, element)) in ids.iter().zip([("a", scene.box_a), ("b", scene.box_b)]) {
            tree.node_mut(*id)
                .unwrap()
                .specify("Object", vec![ParamValue::Element(Element::labeled("Box", label).with_id(element))])
                .unwrap();
        }
        let before = scene.world.read().await.snapshot();
        let mut optimizer = OptimizerVisitor::new(Arc::clone(&scene.world), registry);

        assert!(traverse(&mut optimizer, &mut tree).await.unwrap());
        assert_eq!(scene.world.read().await.snapshot(), before);

        let plan = optimizer.execution_tree();
        let root = plan.root().unwrap();
        let groups = plan.children(root);
        assert_eq!(groups.len(), 1);
        assert_eq!(plan.node(groups[0]).unwrap().composite, Composite::Parallel);
        assert_eq!(plan.children(groups[0]).len(), 2);
    }

    #[tokio::test]
    async fn test_dependent_nodes_keep_their_order() {
        let scene = testing::scene();
        let registry = testing::registry(vec![
            ScriptedSkill::new("pick", pick_description()),
            ScriptedSkill::new("place", place_description()),
        ]);
        let (mut tree, _) =
            testing::plan(&registry, Composite::Serial, &[("Pick", "pick"), ("Place", "place")]);
        let mut optimizer = OptimizerVisitor::new(Arc::clone(&scene.world), registry);

        assert!(traverse(&mut optimizer, &mut tree).await.unwrap());
        let plan = optimizer.execution_tree();
        let root = plan.root().unwrap();
        let steps: Vec<String> = plan
            .children(root)
            .into_iter()
            .map(|id| plan.node(id).unwrap().type_name.clone())
            .collect();
        assert_eq!(steps, vec!["Pick".to_string(), "Place".to_string()]);
        assert_eq!(plan.node(root).unwrap().composite, Composite::Serial);
        assert_eq!(optimizer.execution_sequence().len(), 6);
    }

    #[tokio::test]
    async fn test_node_with_satisfied_effects_is_skipped() {
        let scene = testing::scene();
        {
            let mut wm = scene.world.write().await;
            let mut record = wm.element(scene.box_a).unwrap();
            record.add_property_value("Inspected", serde_json::json!("Yes"));
            wm.update_element(&record).unwrap();
        }
        let registry = testing::registry(vec![ScriptedSkill::new("inspect", inspect_description())]);
        let (mut tree, ids) = testing::plan(&registry, Composite::Serial, &[("Inspect", "inspect")]);
        tree.node_mut(ids[0])
            .unwrap()
            .specify("Object", vec![ParamValue::Element(Element::labeled("Box", "a").with_id(scene.box_a))])
            .unwrap();
        let mut optimizer = OptimizerVisitor::new(Arc::clone(&scene.world), registry);

        assert!(traverse(&mut optimizer, &mut tree).await.unwrap());
        assert_eq!(optimizer.execution_tree().len(), 1);
    }
}
