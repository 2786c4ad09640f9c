use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use super::Visitor;
use crate::error::EngineError;
use crate::executor::NodeExecutor;
use crate::params::ParamHandler;
use crate::procedure::{NodeId, NodeState, PreemptFlag, ProcedureTree};
use crate::registry::NodeInstanciator;
use crate::world::SharedWorldModel;

/// Runs the tree for real: every node is grounded, its skill started on
/// the way down and ended on the way up.
#[derive(Debug)]
pub struct ExecutionVisitor {
    executor: NodeExecutor,
    state: NodeState,
    depth: usize,
}

impl ExecutionVisitor {
    pub fn new(world: SharedWorldModel, registry: Arc<NodeInstanciator>) -> Self {
        Self::from_executor(NodeExecutor::new(world, registry))
    }

    pub fn from_executor(executor: NodeExecutor) -> Self {
        Self {
            executor,
            state: NodeState::Idle,
            depth: 0,
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
}

#[async_trait]
impl Visitor for ExecutionVisitor {
    fn preempt_flag(&self) -> &PreemptFlag {
        self.executor.preempt_flag()
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    async fn process_node(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        let ok = self.executor.execute(tree, id).await?;
        let node = tree.node(id)?;
        if !ok {
            error!(node = %node.label, depth = self.depth, "execution failed");
            return Ok(false);
        }
        if self.executor.is_verbose() {
            info!("{}{}", "  ".repeat(self.depth), node.render(true));
        }
        self.depth += 1;
        Ok(true)
    }

    async fn post_process_node(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        self.depth = self.depth.saturating_sub(1);
        self.executor.post_execute(tree, id).await
    }

    fn fork(&self) -> Option<Self> {
        Some(Self {
            executor: self.executor.fork(),
            state: NodeState::Active,
            depth: self.depth,
        })
    }

    fn join(&mut self, branch: Self) {
        self.executor.join(branch.executor);
    }
}
