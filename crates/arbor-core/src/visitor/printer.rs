use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;

use super::Visitor;
use crate::error::EngineError;
use crate::executor::NodeExecutor;
use crate::procedure::{Composite, NodeId, NodeState, PreemptFlag, ProcedureTree};
use crate::registry::NodeInstanciator;
use crate::world::SharedWorldModel;

/// Renders the tree, binding abstract nodes to instances on the way so
/// their expansions show up.
#[derive(Debug)]
pub struct PrintVisitor {
    executor: NodeExecutor,
    state: NodeState,
    verbose: bool,
    depth: usize,
    out: String,
}

impl PrintVisitor {
    pub fn new(world: SharedWorldModel, registry: Arc<NodeInstanciator>) -> Self {
        Self {
            executor: NodeExecutor::new(world, registry),
            state: NodeState::Idle,
            verbose: false,
            depth: 0,
            out: String::new(),
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn output(&self) -> &str {
        &self.out
    }
}

#[async_trait]
impl Visitor for PrintVisitor {
    fn preempt_flag(&self) -> &PreemptFlag {
        self.executor.preempt_flag()
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    async fn on_start(&mut self, _tree: &mut ProcedureTree, _root: NodeId) -> Result<(), EngineError> {
        self.out.clear();
        self.depth = 0;
        Ok(())
    }

    async fn process_node(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        self.executor.init(tree, id)?;
        let line = tree.node(id)?.render(self.verbose);
        let _ = writeln!(self.out, "{}{}", "  ".repeat(self.depth), line);
        self.depth += 1;
        Ok(true)
    }

    /// Always in order, whatever the node's composite.
    async fn process_children(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        let children = tree.node(id)?.children().to_vec();
        Composite::Serial.process(self, tree, id, children).await
    }

    async fn post_process_node(&mut self, _tree: &mut ProcedureTree, _id: NodeId) -> Result<bool, EngineError> {
        self.depth = self.depth.saturating_sub(1);
        Ok(true)
    }
}
