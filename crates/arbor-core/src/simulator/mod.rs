//! Reversible simulation
//!
//! Nodes are executed by committing their conditions to the world model.
//! Every step is recorded in a transaction log and can be undone and
//! redone. Executed nodes are mirrored into a shadow tree that follows
//! the order in which they ran, so reordering the log reshapes the tree.

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::executor::NodeExecutor;
use crate::params::ParamHandler;
use crate::procedure::{Composite, NodeId, NodeState, Procedure, ProcedureTree, TreeError};
use crate::registry::NodeInstanciator;
use crate::world::SharedWorldModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionTag {
    Execute,
    PostExecute,
}

impl fmt::Display for TransactionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionTag::Execute => f.write_str("execute"),
            TransactionTag::PostExecute => f.write_str("post_execute"),
        }
    }
}

pub type Transaction = (NodeId, TransactionTag);

/// Shadow tree of executed nodes.
///
/// The execution branch is the path of nodes currently open. Closed nodes
/// move to the forget branch until the builder is frozen, so the last
/// closed sibling can still be found and wrapped.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    shadow: ProcedureTree,
    execution_branch: Vec<NodeId>,
    forget_branch: Vec<NodeId>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self {
            shadow: ProcedureTree::empty(),
            execution_branch: Vec::new(),
            forget_branch: Vec::new(),
        }
    }

    pub fn is_branch_empty(&self) -> bool {
        self.execution_branch.is_empty()
    }

    /// Open a copy of `node` under the innermost open node.
    pub fn add_execution_node(&mut self, node: &Procedure) -> Result<NodeId, TreeError> {
        let copy = node.detached_copy();
        let id = match self.execution_branch.last() {
            Some(&parent) => {
                let id = self.shadow.insert_detached(copy);
                self.shadow.attach(parent, id)?;
                id
            }
            None => self.shadow.set_root(copy),
        };
        self.execution_branch.push(id);
        Ok(id)
    }

    /// Drop the innermost open node.
    pub fn remove_execution_node(&mut self) -> Result<(), TreeError> {
        match self.execution_branch.pop() {
            Some(id) => self.shadow.remove_subtree(id),
            None => Ok(()),
        }
    }

    /// Close the innermost open node.
    pub fn pop_execution_node(&mut self) {
        if let Some(id) = self.execution_branch.pop() {
            self.forget_branch.push(id);
        }
    }

    /// Reopen the last closed node.
    pub fn restore_execution_node(&mut self) {
        if let Some(id) = self.forget_branch.pop() {
            self.execution_branch.push(id);
        }
    }

    /// Whether the last closed node is a child of the innermost open node
    /// and that node does not process its children with `processor`.
    pub fn previous_parent_is_same_with_wrong_processor(&self, processor: &Composite) -> bool {
        let (Some(&parent), Some(&previous)) =
            (self.execution_branch.last(), self.forget_branch.last())
        else {
            return false;
        };
        if self.shadow.parent(previous) != Some(parent) {
            return false;
        }
        self.shadow
            .get(parent)
            .is_some_and(|node| node.composite != *processor)
    }

    pub fn freeze(&mut self) {
        self.forget_branch.clear();
    }

    pub fn tree(&self) -> &ProcedureTree {
        &self.shadow
    }

    pub fn take_tree(&mut self) -> ProcedureTree {
        self.execution_branch.clear();
        self.forget_branch.clear();
        std::mem::take(&mut self.shadow)
    }
}

/// Simulating executor with an undo/redo log.
///
/// `forward` holds committed transactions, `back` the undone ones in redo
/// order (last is next).
#[derive(Debug)]
pub struct ReversibleSimulator {
    executor: NodeExecutor,
    forward: Vec<Transaction>,
    back: Vec<Transaction>,
    builder: TreeBuilder,
    /// Node whose execution opened a wrapper, and that wrapper
    bound: HashMap<NodeId, NodeId>,
}

impl ReversibleSimulator {
    pub fn new(world: SharedWorldModel, registry: Arc<NodeInstanciator>) -> Self {
        Self::from_executor(NodeExecutor::new(world, registry))
    }

    pub fn from_executor(executor: NodeExecutor) -> Self {
        Self {
            executor: executor.with_simulate(true),
            forward: Vec::new(),
            back: Vec::new(),
            builder: TreeBuilder::new(),
            bound: HashMap::new(),
        }
    }

    pub fn executor(&self) -> &NodeExecutor {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut NodeExecutor {
        &mut self.executor
    }

    pub fn blackboard(&self) -> &ParamHandler {
        &self.executor.blackboard
    }

    pub fn forward_log(&self) -> &[Transaction] {
        &self.forward
    }

    pub fn back_log(&self) -> &[Transaction] {
        &self.back
    }

    /// Next transaction [`ReversibleSimulator::redo`] would replay.
    pub fn back_top(&self) -> Option<Transaction> {
        self.back.last().copied()
    }

    pub fn forward_top(&self) -> Option<Transaction> {
        self.forward.last().copied()
    }

    /// Remove the next undone transaction without replaying it.
    pub(crate) fn take_back(&mut self) -> Option<Transaction> {
        self.back.pop()
    }

    /// Put back transactions taken with [`ReversibleSimulator::take_back`],
    /// given in the order they were taken.
    pub(crate) fn restore_back(&mut self, taken: &[Transaction]) {
        self.back.extend(taken.iter().rev().copied());
    }

    pub fn builder(&self) -> &TreeBuilder {
        &self.builder
    }

    pub fn execution_tree(&self) -> &ProcedureTree {
        self.builder.tree()
    }

    pub fn take_execution_tree(&mut self) -> ProcedureTree {
        self.builder.take_tree()
    }

    /// Stop considering already closed nodes for wrapping.
    pub fn freeze(&mut self) {
        self.builder.freeze();
    }

    /// Ground and hold the node.
    ///
    /// With `remember` the step is logged and mirrored into the shadow
    /// tree. With a `processor`, a node following a closed sibling under a
    /// parent with another composite is grouped with that sibling under a
    /// new `processor` node.
    pub fn execute<'a>(
        &'a mut self,
        tree: &'a mut ProcedureTree,
        id: NodeId,
        remember: bool,
        processor: Option<Composite>,
    ) -> BoxFuture<'a, Result<bool, EngineError>> {
        async move {
            self.executor.init(tree, id)?;
            tree.node_mut(id)?.set_input(&mut self.executor.blackboard);
            if !self.executor.parametrize(tree, id).await? {
                self.executor.restore_input(tree, id)?;
                tree.set_state(id, NodeState::Error)?;
                return Ok(false);
            }
            if !remember {
                return Ok(true);
            }
            self.add_in_execution_tree(tree, id, processor).await?;
            {
                let world = Arc::clone(self.executor.world());
                let mut wm = world.write().await;
                if !tree.node_mut(id)?.hold(&mut wm) {
                    warn!(node = %tree.node(id)?.label, "hold failed during simulation");
                }
            }
            self.executor.merge(tree.node(id)?);
            self.forward.push((id, TransactionTag::Execute));
            debug!(node = %id, "simulated execute");
            Ok(true)
        }
        .boxed()
    }

    async fn add_in_execution_tree(
        &mut self,
        tree: &mut ProcedureTree,
        id: NodeId,
        processor: Option<Composite>,
    ) -> Result<(), EngineError> {
        match processor {
            Some(processor)
                if !self.builder.is_branch_empty()
                    && self
                        .builder
                        .previous_parent_is_same_with_wrong_processor(&processor) =>
            {
                self.wrap_with_previous(tree, id, processor).await
            }
            _ => {
                self.builder.add_execution_node(tree.node(id)?)?;
                Ok(())
            }
        }
    }

    /// Undo the previous sibling, open a `processor` node in its place,
    /// replay the sibling inside it, then add `id` next to it.
    async fn wrap_with_previous(
        &mut self,
        tree: &mut ProcedureTree,
        id: NodeId,
        processor: Composite,
    ) -> Result<(), EngineError> {
        self.executor.restore_input(tree, id)?;
        self.undo_previous(tree).await?;

        let wrapper = tree.insert_detached(Procedure::composite(processor.symbol(), processor));
        if !self.execute(tree, wrapper, true, None).await? {
            return Err(EngineError::InconsistentLog(format!(
                "cannot open wrapper for {}",
                tree.node(id)?.label
            )));
        }
        self.redo_previous(tree).await?;

        tree.node_mut(id)?.set_input(&mut self.executor.blackboard);
        if !self.executor.parametrize(tree, id).await? {
            return Err(EngineError::InconsistentLog(format!(
                "{} no longer grounds after regrouping",
                tree.node(id)?.label
            )));
        }
        self.builder.add_execution_node(tree.node(id)?)?;
        self.bound.insert(id, wrapper);
        info!(node = %tree.node(id)?.label, wrapper = %wrapper, "grouped with previous sibling");
        Ok(())
    }

    /// Commit the node's postconditions. Closes the wrapper the node
    /// opened, if any.
    pub fn post_execute<'a>(
        &'a mut self,
        tree: &'a mut ProcedureTree,
        id: NodeId,
    ) -> BoxFuture<'a, Result<bool, EngineError>> {
        async move {
            tree.node_mut(id)?.set_input(&mut self.executor.blackboard);
            let committed = {
                let world = Arc::clone(self.executor.world());
                let mut wm = world.write().await;
                tree.node_mut(id)?.simulate(&mut wm)
            };
            if !committed {
                self.executor.restore_input(tree, id)?;
                return Ok(false);
            }
            tree.set_state(id, NodeState::Completed)?;
            self.executor.merge(tree.node(id)?);
            self.forward.push((id, TransactionTag::PostExecute));
            self.builder.pop_execution_node();
            debug!(node = %id, "simulated post execute");

            if let Some(wrapper) = self.bound.remove(&id) {
                if !self.post_execute(tree, wrapper).await? {
                    return Err(EngineError::InconsistentLog(format!(
                        "cannot close wrapper {wrapper}"
                    )));
                }
            }
            Ok(true)
        }
        .boxed()
    }

    /// Revert the last committed transaction. `Ok(false)` when there is
    /// none.
    pub async fn undo(&mut self, tree: &mut ProcedureTree) -> Result<bool, EngineError> {
        let Some((id, tag)) = self.forward.pop() else {
            return Ok(false);
        };
        let world = Arc::clone(self.executor.world());
        match tag {
            TransactionTag::Execute => {
                {
                    let mut wm = world.write().await;
                    tree.node_mut(id)?.revert_hold(&mut wm);
                }
                self.executor.restore_input(tree, id)?;
                self.builder.remove_execution_node()?;
            }
            TransactionTag::PostExecute => {
                let reverted = {
                    let mut wm = world.write().await;
                    tree.node_mut(id)?.revert_simulation(&mut wm)
                };
                if !reverted {
                    self.forward.push((id, tag));
                    return Err(EngineError::RevertWithoutCommit(tree.node(id)?.label.clone()));
                }
                self.executor.restore_input(tree, id)?;
                self.builder.restore_execution_node();
            }
        }
        debug!(node = %id, tag = %tag, "undone");
        self.back.push((id, tag));
        Ok(true)
    }

    /// Replay the next undone transaction. It stays on the back log when
    /// it does not succeed.
    pub async fn redo(
        &mut self,
        tree: &mut ProcedureTree,
        processor: Option<Composite>,
    ) -> Result<bool, EngineError> {
        let Some((id, tag)) = self.back_top() else {
            return Ok(false);
        };
        let ok = match tag {
            TransactionTag::Execute => self.execute(tree, id, true, processor).await?,
            TransactionTag::PostExecute => self.post_execute(tree, id).await?,
        };
        if ok {
            self.back.pop();
            debug!(node = %id, tag = %tag, "redone");
        }
        Ok(ok)
    }

    /// Undo the last transaction and forget it, along with any wrapper
    /// binding its execute opened.
    pub async fn erase(&mut self, tree: &mut ProcedureTree) -> Result<bool, EngineError> {
        if !self.undo(tree).await? {
            return Ok(false);
        }
        if let Some((id, TransactionTag::Execute)) = self.back.pop() {
            if let Some(wrapper) = self.bound.remove(&id) {
                debug!(node = %id, wrapper = %wrapper, "wrapper binding dropped");
            }
            self.bound.retain(|_, wrapper| *wrapper != id);
        }
        Ok(true)
    }

    pub async fn undo_all(&mut self, tree: &mut ProcedureTree) -> Result<(), EngineError> {
        while self.undo(tree).await? {}
        Ok(())
    }

    pub async fn redo_all(&mut self, tree: &mut ProcedureTree) -> Result<(), EngineError> {
        while let Some((id, tag)) = self.back_top() {
            if !self.redo(tree, None).await? {
                return Err(EngineError::InconsistentLog(format!("cannot redo {tag} of {id}")));
            }
        }
        Ok(())
    }

    /// Undo the last closed node, back to and including its execute.
    async fn undo_previous(&mut self, tree: &mut ProcedureTree) -> Result<(), EngineError> {
        let Some((previous, TransactionTag::PostExecute)) = self.forward_top() else {
            return Err(EngineError::InconsistentLog(
                "previous sibling is not closed".to_string(),
            ));
        };
        while let Some((id, tag)) = self.forward_top() {
            self.undo(tree).await?;
            if id == previous && tag == TransactionTag::Execute {
                return Ok(());
            }
        }
        Err(EngineError::InconsistentLog(format!(
            "execute of {previous} is missing from the log"
        )))
    }

    /// Redo the unit undone by [`ReversibleSimulator::undo_previous`].
    async fn redo_previous(&mut self, tree: &mut ProcedureTree) -> Result<(), EngineError> {
        let Some((previous, _)) = self.back_top() else {
            return Err(EngineError::InconsistentLog("nothing to redo".to_string()));
        };
        while let Some((id, tag)) = self.back_top() {
            if !self.redo(tree, None).await? {
                return Err(EngineError::InconsistentLog(format!("cannot redo {tag} of {id}")));
            }
            if id == previous && tag == TransactionTag::PostExecute {
                return Ok(());
            }
        }
        Err(EngineError::InconsistentLog(format!(
            "post execute of {previous} is missing from the log"
        )))
    }
}
