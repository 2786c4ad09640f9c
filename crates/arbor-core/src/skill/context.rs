//! Contexts handed to skills

use tokio_util::sync::CancellationToken;

use crate::conditions::Condition;
use crate::error::EngineError;
use crate::params::ParamValue;
use crate::procedure::{Composite, NodeId, Operator, Procedure, ProcedureTree};
use crate::registry::NodeInstanciator;
use crate::world::SharedWorldModel;

/// Execution context for skills
///
/// Provides access to:
/// - The label of the executing node
/// - The shared world model
/// - A CancellationToken, cancelled when the node is preempted
#[derive(Clone)]
pub struct SkillContext {
    pub node_label: String,
    /// Runtime ID of this execution, distinct on every run of the node
    pub execution_id: String,
    pub world: SharedWorldModel,
    /// Skills should check this periodically and return early when cancelled
    pub cancellation_token: CancellationToken,
}

impl SkillContext {
    pub fn new(
        node_label: impl Into<String>,
        world: SharedWorldModel,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            node_label: node_label.into(),
            execution_id: Self::new_execution_id(),
            world,
            cancellation_token,
        }
    }

    pub fn new_execution_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Completes when the node is preempted
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }

    pub fn child_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }
}

impl std::fmt::Debug for SkillContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillContext")
            .field("node_label", &self.node_label)
            .field("execution_id", &self.execution_id)
            .finish_non_exhaustive()
    }
}

/// Mutable view of the node a skill is expanding, with access to the
/// registry for creating children.
pub struct ExpandContext<'a> {
    tree: &'a mut ProcedureTree,
    node: NodeId,
    registry: &'a NodeInstanciator,
}

impl<'a> ExpandContext<'a> {
    pub fn new(tree: &'a mut ProcedureTree, node: NodeId, registry: &'a NodeInstanciator) -> Self {
        Self {
            tree,
            node,
            registry,
        }
    }

    /// The node being expanded.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn tree(&mut self) -> &mut ProcedureTree {
        &mut *self.tree
    }

    pub fn registry(&self) -> &NodeInstanciator {
        self.registry
    }

    pub fn procedure(&mut self, id: NodeId) -> Result<&mut Procedure, EngineError> {
        Ok(self.tree.node_mut(id)?)
    }

    /// Append an abstract node of `type_name` under the expanded node.
    pub fn add_child(&mut self, type_name: &str, label: &str, latch: bool) -> Result<NodeId, EngineError> {
        self.add_child_to(self.node, type_name, label, latch)
    }

    pub fn add_child_to(
        &mut self,
        parent: NodeId,
        type_name: &str,
        label: &str,
        latch: bool,
    ) -> Result<NodeId, EngineError> {
        let child = self.registry.procedure(type_name, label)?;
        Ok(self.tree.add_child(parent, child, latch)?)
    }

    pub fn add_sequence(&mut self, label: &str, composite: Composite) -> Result<NodeId, EngineError> {
        Ok(self.tree.add_sequence(Some(self.node), label, composite)?)
    }

    pub fn add_operator(&mut self, operator: Operator, latch: bool) -> Result<NodeId, EngineError> {
        Ok(self
            .tree
            .add_child(self.node, Procedure::operator(operator), latch)?)
    }

    /// Remap a key on `id` and its subtree.
    pub fn remap(&mut self, id: NodeId, from: &str, to: &str) -> Result<(), EngineError> {
        Ok(self.tree.remap(id, from, to)?)
    }

    pub fn specify(&mut self, id: NodeId, key: &str, value: impl Into<ParamValue>) -> Result<(), EngineError> {
        Ok(self.procedure(id)?.specify(key, vec![value.into()])?)
    }

    pub fn set_composite(&mut self, composite: Composite) -> Result<(), EngineError> {
        let node = self.node;
        self.procedure(node)?.composite = composite;
        Ok(())
    }

    pub fn add_pre_condition(&mut self, id: NodeId, condition: Condition) -> Result<(), EngineError> {
        self.procedure(id)?.add_pre_condition(condition);
        Ok(())
    }

    pub fn add_post_condition(&mut self, id: NodeId, condition: Condition) -> Result<(), EngineError> {
        self.procedure(id)?.add_post_condition(condition);
        Ok(())
    }
}
