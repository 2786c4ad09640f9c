//! Procedure trees
//!
//! A procedure tree is the unit of work: composite nodes group children,
//! skill nodes bind to registered skill instances, operator nodes shuffle
//! params. Nodes live in a [`ProcedureTree`] arena and are addressed by
//! [`NodeId`].

mod composite;
mod description;
mod node;
mod operator;
mod signal;
mod tree;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::params::ParamError;

pub use composite::Composite;
pub use description::{ParamOption, ProcedureDescription, AGENT_TYPE, ROBOT_PARAM};
pub use node::{NodeBody, Procedure, PROCEDURE_TYPE, ROOT_TYPE};
pub use operator::{Operator, OPERATOR_TYPE};
pub use signal::{NodeHandle, NodeSignals, NodeState, PreemptFlag};
pub use tree::ProcedureTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("node {0} is not in the tree")]
    NodeNotFound(NodeId),
    #[error("remapping '{from}' to '{to}' would create a cycle")]
    RemapCycle { from: String, to: String },
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error("node {0} already has a parent")]
    AlreadyAttached(NodeId),
    #[error("tree has no root")]
    NoRoot,
}
