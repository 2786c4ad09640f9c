//! # Arbor Core
//!
//! Core abstractions and deterministic logic for the Arbor skill engine.
//!
//! This crate contains:
//! - World model: a typed, relational graph of scene elements
//! - Params, conditions and skill descriptions
//! - Procedure trees with composite processors and preemption
//! - Executors, reversible simulation and execution order optimization
//!
//! This crate does NOT care about:
//! - Where skill implementations come from
//! - How scenes and plans are configured
//! - How the runtime is hosted

pub mod conditions;
pub mod error;
pub mod executor;
pub mod optimizer;
pub mod params;
pub mod procedure;
pub mod registry;
pub mod simulator;
pub mod skill;
pub mod visitor;
pub mod world;

#[cfg(test)]
pub(crate) mod testing;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::conditions::{Condition, ConditionKind};
    pub use crate::error::EngineError;
    pub use crate::executor::NodeExecutor;
    pub use crate::optimizer::OptimizerVisitor;
    pub use crate::params::{Param, ParamHandler, ParamType, ParamValue, ValueType};
    pub use crate::procedure::{
        Composite, NodeHandle, NodeId, NodeState, Operator, ParamOption, Procedure,
        ProcedureDescription, ProcedureTree,
    };
    pub use crate::registry::NodeInstanciator;
    pub use crate::simulator::{ReversibleSimulator, TransactionTag};
    pub use crate::skill::{CancellationToken, ExpandContext, Skill, SkillContext, SkillOutcome};
    pub use crate::visitor::{
        traverse, ExecutionVisitor, PrintVisitor, SimulationVisitor, Visitor,
    };
    pub use crate::world::{
        Element, ElementId, SharedWorldModel, StaticTypeHierarchy, WorldModel, CONTAIN,
    };
}

// Re-export key types at crate root
pub use error::EngineError;
pub use executor::NodeExecutor;
pub use optimizer::OptimizerVisitor;
pub use procedure::{Composite, NodeId, NodeState, Procedure, ProcedureTree};
pub use registry::NodeInstanciator;
pub use simulator::ReversibleSimulator;
pub use skill::{Skill, SkillContext, SkillOutcome};
pub use visitor::{traverse, ExecutionVisitor, PrintVisitor, SimulationVisitor, Visitor};
pub use world::{Element, SharedWorldModel, WorldModel};
