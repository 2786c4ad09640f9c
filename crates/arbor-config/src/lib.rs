//! # Arbor Config
//!
//! Single-file configuration for Arbor.
//! One `arbor.yaml` configures the engine bounds, the ontology, the
//! initial scene, declarative skills, an optional plan and observability.

mod loader;
mod plan;
mod scene;
mod skills;

pub use loader::{load_config, validate_config, ConfigError};
pub use plan::PlanNodeSpec;
pub use scene::{
    ElementSpec, OntologyConfig, PredicateSpec, RelationSpec, SceneConfig, TypeSpec, ROOT_KEY,
};
pub use skills::{ChildSpec, ConditionSpec, ConditionSpecKind, ParamSpec, ParamValueKind, SkillSpec};

use serde::Deserialize;

/// Top-level configuration schema for Arbor.
#[derive(Debug, Clone, Deserialize)]
pub struct ArborConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub grounding: GroundingConfig,
    #[serde(default)]
    pub ontology: OntologyConfig,
    #[serde(default)]
    pub scene: SceneConfig,
    #[serde(default)]
    pub skills: Vec<SkillSpec>,
    /// Tree to run when none is built in code.
    #[serde(default)]
    pub plan: Option<PlanNodeSpec>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for ArborConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
            engine: EngineConfig::default(),
            resolver: ResolverConfig::default(),
            grounding: GroundingConfig::default(),
            ontology: OntologyConfig::default(),
            scene: SceneConfig::default(),
            skills: Vec::new(),
            plan: None,
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ArborConfig {
    pub fn skill(&self, type_name: &str) -> Option<&SkillSpec> {
        self.skills.iter().find(|s| s.type_name == type_name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_env(),
        }
    }
}

fn default_app_name() -> String {
    "arbor".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Skip leaf skill execution and only apply effects.
    #[serde(default)]
    pub simulate: bool,
    /// Log every failing condition at info level.
    #[serde(default)]
    pub verbose: bool,
    /// Inputs remembered per node for revert.
    #[serde(default = "default_max_input_cache")]
    pub max_input_cache: usize,
    /// Commit the postconditions of skills that completed for real.
    #[serde(default = "default_mirror_effects")]
    pub mirror_effects: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            simulate: false,
            verbose: false,
            max_input_cache: default_max_input_cache(),
            mirror_effects: default_mirror_effects(),
        }
    }
}

fn default_max_input_cache() -> usize {
    2
}

fn default_mirror_effects() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_max_overlap_merges")]
    pub max_overlap_merges: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_overlap_merges: default_max_overlap_merges(),
        }
    }
}

fn default_max_overlap_merges() -> usize {
    arbor_core::world::DEFAULT_MAX_OVERLAP_MERGES
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroundingConfig {
    /// Upper bound on blackboard assignments tried per node.
    #[serde(default = "default_max_blackboard_assignments")]
    pub max_blackboard_assignments: usize,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            max_blackboard_assignments: default_max_blackboard_assignments(),
        }
    }
}

fn default_max_blackboard_assignments() -> usize {
    arbor_core::executor::DEFAULT_MAX_BLACKBOARD_ASSIGNMENTS
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config: ArborConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.app.name, "arbor");
        assert!(!config.engine.simulate);
        assert_eq!(config.engine.max_input_cache, 2);
        assert!(config.engine.mirror_effects);
        assert_eq!(config.resolver.max_overlap_merges, 32);
        assert_eq!(config.grounding.max_blackboard_assignments, 4096);
        assert_eq!(config.observability.log_level, "info");
        assert!(config.skills.is_empty());
        assert!(config.plan.is_none());
    }

    #[test]
    fn test_engine_section_overrides() {
        let yaml = r#"
engine:
  simulate: true
  verbose: true
grounding:
  max_blackboard_assignments: 16
observability:
  log_level: debug
  log_file: /tmp/arbor.log
"#;
        let config: ArborConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.engine.simulate);
        assert!(config.engine.verbose);
        assert_eq!(config.engine.max_input_cache, 2);
        assert_eq!(config.grounding.max_blackboard_assignments, 16);
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(config.observability.log_file.as_deref(), Some("/tmp/arbor.log"));
    }
}
