//! Configuration loading and validation.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::{ArborConfig, PlanNodeSpec, SceneConfig, SkillSpec, ROOT_KEY};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Load the full Arbor configuration from a YAML file.
///
/// An empty file yields the default configuration.
pub fn load_config(path: &Path) -> Result<ArborConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = if content.trim().is_empty() {
        ArborConfig::default()
    } else {
        serde_yaml::from_str(&content)?
    };
    validate_config(&config)?;
    debug!(
        path = %path.display(),
        elements = config.scene.elements.len(),
        skills = config.skills.len(),
        "config loaded"
    );
    Ok(config)
}

pub fn validate_config(config: &ArborConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }

    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }

    if config.engine.max_input_cache == 0 {
        return Err(ConfigError::Invalid(
            "engine.max_input_cache must be > 0".to_string(),
        ));
    }

    if config.resolver.max_overlap_merges == 0 {
        return Err(ConfigError::Invalid(
            "resolver.max_overlap_merges must be > 0".to_string(),
        ));
    }

    if config.grounding.max_blackboard_assignments == 0 {
        return Err(ConfigError::Invalid(
            "grounding.max_blackboard_assignments must be > 0".to_string(),
        ));
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "observability.log_level '{}' is not one of {:?}",
            config.observability.log_level, LOG_LEVELS
        )));
    }

    validate_scene(&config.scene)?;
    validate_skills(&config.skills)?;
    if let Some(plan) = &config.plan {
        validate_plan(plan, &config.scene)?;
    }

    Ok(())
}

fn validate_scene(scene: &SceneConfig) -> Result<(), ConfigError> {
    if scene.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "scene.name must not be empty".to_string(),
        ));
    }

    // Parents must be declared before their children.
    let mut seen: HashSet<&str> = HashSet::from([ROOT_KEY]);
    for element in &scene.elements {
        if element.key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "scene.elements[].key must not be empty".to_string(),
            ));
        }
        if element.type_name.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "scene.elements[{}].type must not be empty",
                element.key
            )));
        }
        if !seen.contains(element.parent.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "scene.elements[{}].parent '{}' is not declared before it",
                element.key, element.parent
            )));
        }
        if !seen.insert(element.key.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "scene.elements key '{}' is declared twice",
                element.key
            )));
        }
    }

    for relation in &scene.relations {
        for end in [&relation.src, &relation.dst] {
            if !scene.is_declared(end) {
                return Err(ConfigError::Invalid(format!(
                    "scene.relations[{} {} {}] names undeclared element '{}'",
                    relation.src, relation.predicate, relation.dst, end
                )));
            }
        }
        if relation.predicate.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "scene.relations[].predicate must not be empty".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_skills(skills: &[SkillSpec]) -> Result<(), ConfigError> {
    let mut types = HashSet::new();
    for skill in skills {
        if skill.type_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "skills[].type must not be empty".to_string(),
            ));
        }
        if !types.insert(skill.type_name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "skill type '{}' is declared twice",
                skill.type_name
            )));
        }

        let mut keys = HashSet::new();
        for param in &skill.params {
            if !keys.insert(param.key.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "skills[{}].params key '{}' is declared twice",
                    skill.type_name, param.key
                )));
            }
        }

        for condition in skill.conditions() {
            if let Some(field) = condition.missing_field() {
                return Err(ConfigError::Invalid(format!(
                    "skills[{}] condition '{}' needs '{}'",
                    skill.type_name,
                    condition.label(),
                    field
                )));
            }
        }

        let mut labels = HashSet::new();
        for label in skill.instance_labels() {
            if !labels.insert(label.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "skills[{}] instance '{}' is declared twice",
                    skill.type_name, label
                )));
            }
        }

        if skill.children.iter().any(|c| c.type_name == skill.type_name) {
            return Err(ConfigError::Invalid(format!(
                "skills[{}] expands into itself",
                skill.type_name
            )));
        }
    }
    Ok(())
}

fn validate_plan(plan: &PlanNodeSpec, scene: &SceneConfig) -> Result<(), ConfigError> {
    for node in plan.walk() {
        if !node.is_group() && !node.children.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "plan node '{}' is a skill and gets its children from its instance",
                node.label()
            )));
        }
        if node.is_group() && !node.specify.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "plan node '{}' has no type and cannot specify params",
                node.label()
            )));
        }
        for (key, element) in &node.specify {
            if !scene.is_declared(element) {
                return Err(ConfigError::Invalid(format!(
                    "plan node '{}' specifies {} as undeclared element '{}'",
                    node.label(), key, element
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("arbor-config-{}-{}", name, uuid::Uuid::new_v4()))
    }

    fn parse(yaml: &str) -> ArborConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_validate_config_accepts_defaults() {
        let config = ArborConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_config_rejects_zero_bounds() {
        let mut config = ArborConfig::default();
        config.grounding.max_blackboard_assignments = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = ArborConfig::default();
        config.version = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_config_rejects_unknown_log_level() {
        let config = parse("observability: { log_level: loud }");
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(msg)) if msg.contains("loud")
        ));
    }

    #[test]
    fn test_validate_scene_keys() {
        let duplicate = parse(
            "scene: { elements: [{ key: a, type: Box }, { key: a, type: Box }] }",
        );
        assert!(matches!(
            validate_config(&duplicate),
            Err(ConfigError::Invalid(msg)) if msg.contains("twice")
        ));

        let forward_parent = parse(
            "scene: { elements: [{ key: a, type: Box, parent: b }, { key: b, type: Box }] }",
        );
        assert!(validate_config(&forward_parent).is_err());

        let dangling = parse(
            "scene: { elements: [{ key: a, type: Box }], relations: [{ src: a, predicate: on, dst: shelf }] }",
        );
        assert!(matches!(
            validate_config(&dangling),
            Err(ConfigError::Invalid(msg)) if msg.contains("shelf")
        ));

        let to_root = parse(
            "scene: { elements: [{ key: a, type: Box }], relations: [{ src: root, predicate: on, dst: a }] }",
        );
        assert!(validate_config(&to_root).is_ok());
    }

    #[test]
    fn test_validate_skill_params_unique() {
        let config = parse(
            r#"
skills:
  - type: Pick
    params: [{ key: Object }, { key: Object }]
"#,
        );
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(msg)) if msg.contains("Object")
        ));
    }

    #[test]
    fn test_validate_skill_conditions_complete() {
        let config = parse(
            r#"
skills:
  - type: Pick
    params: [{ key: Object }]
    post: [{ kind: property, subject: Object, predicate: Inspected }]
"#,
        );
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(msg)) if msg.contains("value")
        ));
    }

    #[test]
    fn test_validate_plan_specify_targets() {
        let config = parse(
            r#"
scene: { elements: [{ key: box_a, type: Box }] }
plan:
  children:
    - { type: Inspect, specify: { Object: box_z } }
"#,
        );
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(msg)) if msg.contains("box_z")
        ));

        let config = parse(
            r#"
plan:
  type: Survey
  children: [{ type: Inspect }]
"#,
        );
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let path = temp_path("load");
        fs::write(
            &path,
            r#"
version: 1
app: { name: lab }
scene:
  name: bench
  elements:
    - { key: box_a, type: Box }
skills:
  - type: Inspect
    params: [{ key: Object, element_type: Box }]
"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(config.app.name, "lab");
        assert_eq!(config.scene.name, "bench");
        assert!(config.skill("Inspect").is_some());
    }

    #[test]
    fn test_load_empty_file_yields_defaults() {
        let path = temp_path("empty");
        fs::write(&path, "").unwrap();
        let config = load_config(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(config.app.name, "arbor");
    }

    #[test]
    fn test_load_missing_file() {
        let path = temp_path("missing");
        assert!(matches!(load_config(&path), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_malformed_yaml() {
        let path = temp_path("malformed");
        fs::write(&path, "skills: [ {type: Pick").unwrap();
        let result = load_config(&path);
        fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
