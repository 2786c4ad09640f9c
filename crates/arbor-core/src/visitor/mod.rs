//! Tree visitors
//!
//! A visitor walks a procedure tree depth first. For every node it runs
//! `process_node`, then the node's composite over the children, then
//! `post_process_node`. Preemption is checked between the three steps.

mod execution;
mod printer;
mod simulation;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use tracing::info;

use crate::error::EngineError;
use crate::procedure::{NodeId, NodeState, PreemptFlag, ProcedureTree, TreeError};

pub use execution::ExecutionVisitor;
pub use printer::PrintVisitor;
pub use simulation::SimulationVisitor;

#[async_trait]
pub trait Visitor: Send + Sized + 'static {
    /// Flag raised by [`Visitor::preempt`].
    fn preempt_flag(&self) -> &PreemptFlag;

    fn state(&self) -> NodeState;

    fn set_state(&mut self, state: NodeState);

    async fn on_start(&mut self, _tree: &mut ProcedureTree, _root: NodeId) -> Result<(), EngineError> {
        Ok(())
    }

    async fn process_node(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError>;

    /// Visit the children with the node's own composite.
    async fn process_children(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        let (composite, children) = {
            let node = tree.node(id)?;
            (node.composite.clone(), node.children().to_vec())
        };
        composite.process(self, tree, id, children).await
    }

    async fn post_process_node(&mut self, _tree: &mut ProcedureTree, _id: NodeId) -> Result<bool, EngineError> {
        Ok(true)
    }

    /// Runs once after the traversal, whatever its outcome.
    async fn processing_done(&mut self, _tree: &mut ProcedureTree, _root: NodeId) -> Result<bool, EngineError> {
        Ok(true)
    }

    /// Visitor for a parallel branch. `None` visits parallel children in
    /// order.
    fn fork(&self) -> Option<Self> {
        None
    }

    /// Take back a finished branch.
    fn join(&mut self, _branch: Self) {}

    /// Ask the traversal to stop at the next check.
    fn preempt(&self) {
        self.preempt_flag().request();
    }
}

/// Visit `id` and its subtree.
pub fn visit<'a, V: Visitor>(
    visitor: &'a mut V,
    tree: &'a mut ProcedureTree,
    id: NodeId,
) -> BoxFuture<'a, Result<bool, EngineError>> {
    async move {
        let result = visit_node(visitor, tree, id).await;
        if let Some(node) = tree.get(id) {
            match &result {
                Ok(true) => node.set_state(NodeState::Completed),
                Ok(false) => node.set_state(NodeState::Error),
                Err(err) if err.is_preempted() => node.set_state(NodeState::Preempted),
                Err(_) => node.set_state(NodeState::Error),
            }
        }
        result
    }
    .boxed()
}

async fn visit_node<V: Visitor>(
    visitor: &mut V,
    tree: &mut ProcedureTree,
    id: NodeId,
) -> Result<bool, EngineError> {
    check_preempt(visitor, tree, id)?;
    if !visitor.process_node(tree, id).await? {
        visitor.set_state(NodeState::Error);
        return Ok(false);
    }
    check_preempt(visitor, tree, id)?;
    if !visitor.process_children(tree, id).await? {
        visitor.set_state(NodeState::Error);
        return Ok(false);
    }
    check_preempt(visitor, tree, id)?;
    if !visitor.post_process_node(tree, id).await? {
        visitor.set_state(NodeState::Error);
        return Ok(false);
    }
    Ok(true)
}

fn check_preempt<V: Visitor>(visitor: &mut V, tree: &ProcedureTree, id: NodeId) -> Result<(), EngineError> {
    if !visitor.preempt_flag().take() {
        return Ok(());
    }
    tree.preempt(id);
    visitor.set_state(NodeState::Preempted);
    let label = tree.node(id)?.label.clone();
    Err(EngineError::Preempted(label))
}

/// Visit the whole tree.
///
/// Returns `Ok(false)` when a node fails or the traversal is preempted;
/// the visitor's state tells which.
pub async fn traverse<V: Visitor>(visitor: &mut V, tree: &mut ProcedureTree) -> Result<bool, EngineError> {
    let root = tree.root().ok_or(TreeError::NoRoot)?;
    visitor.on_start(tree, root).await?;
    visitor.set_state(NodeState::Active);
    let result = visit(visitor, tree, root).await;
    let done = visitor.processing_done(tree, root).await;
    match result {
        Err(EngineError::Preempted(label)) => {
            visitor.preempt_flag().take();
            visitor.set_state(NodeState::Preempted);
            info!(node = %label, "traversal preempted");
            done?;
            Ok(false)
        }
        Err(err) => {
            visitor.set_state(NodeState::Error);
            Err(err)
        }
        Ok(ok) => {
            let ok = ok && done?;
            visitor.set_state(if ok { NodeState::Completed } else { NodeState::Error });
            Ok(ok)
        }
    }
}
