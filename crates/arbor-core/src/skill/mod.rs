//! Skill abstraction module
//!
//! This module defines the Skill trait and related types:
//! - Skill: a registered implementation of a procedure type
//! - SkillContext: execution context with access to the world model
//! - ExpandContext: tree access while a skill expands its node
//! - SkillOutcome: execution result

mod context;

use async_trait::async_trait;

pub use context::{ExpandContext, SkillContext};

pub use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::params::ParamHandler;
use crate::procedure::ProcedureDescription;

/// Result of running a skill
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkillOutcome {
    Success,
    Failure(String),
}

impl SkillOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        SkillOutcome::Failure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SkillOutcome::Success)
    }
}

impl From<bool> for SkillOutcome {
    fn from(ok: bool) -> Self {
        if ok {
            SkillOutcome::Success
        } else {
            SkillOutcome::Failure("skill returned false".to_string())
        }
    }
}

/// Skill trait - an executable instance of a procedure type
///
/// Skills are black boxes to the executor. They can:
/// - Expand their node into a subtree of other procedures
/// - Read and write their params while executing
/// - React to preemption through the context's cancellation token
#[async_trait]
pub trait Skill: Send + Sync {
    /// Procedure type this skill implements
    fn type_name(&self) -> &str;

    /// Instance label (unique within the type)
    fn label(&self) -> &str;

    /// Declared params and conditions of the type
    fn description(&self) -> ProcedureDescription;

    /// Add children to the node this skill is bound to.
    fn expand(&self, _ctx: &mut ExpandContext<'_>) -> Result<(), EngineError> {
        Ok(())
    }

    async fn execute(&self, params: &mut ParamHandler, ctx: &SkillContext) -> SkillOutcome;

    /// Runs after the children have been processed.
    async fn post_execute(&self, _params: &mut ParamHandler, _ctx: &SkillContext) -> SkillOutcome {
        SkillOutcome::Success
    }

    /// Called synchronously when the node is preempted while active.
    fn on_preempt(&self) {}
}
