//! # Arbor Runtime
//!
//! Builds a ready-to-use engine from `arbor.yaml`: tracing, the type
//! hierarchy, the world model with its initial scene, the registry of
//! declared skills and the configured plan.

pub mod bootstrap;
mod runtime;
mod skill;

pub use bootstrap::{init_tracing_if_needed, BootstrapError};
pub use runtime::{EngineRuntime, OptimizedPlan, SimulationReport};
pub use skill::DeclaredSkill;
