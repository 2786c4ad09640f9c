//! Engine error type

use thiserror::Error;

use crate::params::ParamError;
use crate::procedure::TreeError;
use crate::registry::RegistryError;
use crate::world::WorldModelError;

/// Errors surfaced by executors, simulators and visitors.
///
/// Ordinary failures (a precondition that does not hold, a skill that
/// returns failure) are reported as `Ok(false)`. These variants cover
/// interrupted runs and broken invariants.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot ground params of '{0}'")]
    Grounding(String),

    #[error("preconditions do not hold for keys {0:?}")]
    PreconditionViolation(Vec<String>),

    #[error("revert of '{0}' without a matching commit")]
    RevertWithoutCommit(String),

    #[error("'{0}' was preempted")]
    Preempted(String),

    #[error("conflicting constraints: {0}")]
    ConstraintConflict(String),

    #[error("transaction log is inconsistent: {0}")]
    InconsistentLog(String),

    #[error("parallel branch failed to join: {0}")]
    Join(String),

    #[error(transparent)]
    WorldModel(#[from] WorldModelError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Param(#[from] ParamError),
}

impl EngineError {
    pub fn is_preempted(&self) -> bool {
        matches!(self, EngineError::Preempted(_))
    }
}
