use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::Visitor;
use crate::error::EngineError;
use crate::procedure::{NodeId, NodeState, PreemptFlag, ProcedureTree};
use crate::registry::NodeInstanciator;
use crate::simulator::ReversibleSimulator;
use crate::world::SharedWorldModel;

/// Dry run of the tree. Effects are committed while visiting and undone
/// once the traversal is over, leaving the world model as it was.
#[derive(Debug)]
pub struct SimulationVisitor {
    sim: ReversibleSimulator,
    state: NodeState,
    execution: ProcedureTree,
}

impl SimulationVisitor {
    pub fn new(world: SharedWorldModel, registry: Arc<NodeInstanciator>) -> Self {
        Self::from_simulator(ReversibleSimulator::new(world, registry))
    }

    pub fn from_simulator(sim: ReversibleSimulator) -> Self {
        Self {
            sim,
            state: NodeState::Idle,
            execution: ProcedureTree::empty(),
        }
    }

    pub fn simulator(&self) -> &ReversibleSimulator {
        &self.sim
    }

    pub fn simulator_mut(&mut self) -> &mut ReversibleSimulator {
        &mut self.sim
    }

    /// Nodes in the order they were simulated, as of the end of the
    /// last traversal.
    pub fn execution_tree(&self) -> &ProcedureTree {
        &self.execution
    }
}

#[async_trait]
impl Visitor for SimulationVisitor {
    fn preempt_flag(&self) -> &PreemptFlag {
        self.sim.executor().preempt_flag()
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    async fn process_node(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        self.sim.execute(tree, id, true, None).await
    }

    async fn post_process_node(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        if !self.sim.post_execute(tree, id).await? {
            return Ok(false);
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(tree = %self.sim.execution_tree().render(false), "execution tree");
        }
        Ok(true)
    }

    async fn processing_done(&mut self, tree: &mut ProcedureTree, _root: NodeId) -> Result<bool, EngineError> {
        self.sim.freeze();
        self.execution = self.sim.execution_tree().clone();
        self.sim.undo_all(tree).await?;
        Ok(true)
    }
}
