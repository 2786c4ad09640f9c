//! Bootstrap helpers for building an Arbor engine from a single YAML config.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{debug, info};

use arbor_config::{ArborConfig, ConfigError, ObservabilityConfig, ParamValueKind, ROOT_KEY};
use arbor_core::procedure::{TreeError, AGENT_TYPE};
use arbor_core::registry::{NodeInstanciator, RegistryError};
use arbor_core::skill::Skill;
use arbor_core::world::{
    Element, ElementId, StaticTypeHierarchy, TypeHierarchy, WorldModel, WorldModelError,
};

use crate::skill::DeclaredSkill;

/// Root of the type hierarchy. Undeclared types derive from it.
pub const THING_TYPE: &str = "Thing";
/// Label of the agent added to scenes that declare none.
pub const DEFAULT_AGENT_LABEL: &str = "robot";

/// Runtime bootstrap errors.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("world model error: {0}")]
    WorldModel(#[from] WorldModelError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("plan error: {0}")]
    Tree(#[from] TreeError),
    #[error("invalid skill declaration: {0}")]
    InvalidSkill(String),
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once per process.
///
/// `RUST_LOG` wins over the configured level. `ARBOR_LOG_FILE` wins over
/// the configured log file.
pub fn init_tracing_if_needed(observability: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let log_file_path = std::env::var("ARBOR_LOG_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| observability.log_file.clone());
        let file_writer = log_file_path.as_deref().and_then(create_log_writer);
        let fallback_level = match observability.log_level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };

        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback_level))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        match file_writer {
            Some(writer) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer)
                    .try_init();
            }
            None => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .try_init();
            }
        }

        tracing::info!(
            log_level = %observability.log_level,
            log_file = log_file_path.as_deref().unwrap_or("(stdout)"),
            "tracing initialized"
        );
    });
}

fn create_log_writer(path: &str) -> Option<SharedFileMakeWriter> {
    use std::fs::{create_dir_all, OpenOptions};
    use std::path::Path;

    let file_path = Path::new(path);
    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = create_dir_all(parent) {
                eprintln!(
                    "failed to create log directory '{}': {}",
                    parent.display(),
                    err
                );
                return None;
            }
        }
    }
    let file = match OpenOptions::new().create(true).append(true).open(file_path) {
        Ok(f) => f,
        Err(err) => {
            eprintln!("failed to open log file '{}': {}", file_path.display(), err);
            return None;
        }
    };
    Some(SharedFileMakeWriter::new(file))
}

#[derive(Clone)]
struct SharedFileMakeWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl SharedFileMakeWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

struct SharedFileWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedFileMakeWriter {
    type Writer = SharedFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileWriter {
            file: self.file.clone(),
        }
    }
}

impl std::io::Write for SharedFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("log file mutex poisoned"))?;
        std::io::Write::write(&mut *file, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("log file mutex poisoned"))?;
        std::io::Write::flush(&mut *file)
    }
}

/// Ontology of the config, plus every type the scene or the skills name
/// without declaring, placed directly under [`THING_TYPE`].
pub fn build_type_hierarchy(config: &ArborConfig) -> StaticTypeHierarchy {
    let mut types = StaticTypeHierarchy::new();
    let mut declared = BTreeSet::from([THING_TYPE.to_string()]);
    for ty in &config.ontology.types {
        types.add_type(&ty.name, &ty.parent);
        declared.insert(ty.name.clone());
    }
    for predicate in &config.ontology.predicates {
        types.add_predicate(&predicate.name, &predicate.parent);
    }

    let mut referenced: BTreeSet<String> = BTreeSet::from([AGENT_TYPE.to_string()]);
    referenced.extend(config.ontology.types.iter().map(|t| t.parent.clone()));
    referenced.extend(config.scene.elements.iter().map(|e| e.type_name.clone()));
    for skill in &config.skills {
        referenced.extend(
            skill
                .params
                .iter()
                .filter(|p| p.value_kind == ParamValueKind::Element)
                .filter_map(|p| p.element_type.clone()),
        );
        referenced.extend(skill.conditions().filter_map(|c| c.type_name.clone()));
    }
    for ty in referenced.difference(&declared) {
        debug!(type_name = %ty, parent = THING_TYPE, "implicit type");
        types.add_type(ty, THING_TYPE);
    }
    types
}

/// Reset a world model to the configured scene.
///
/// Returns the model and the id of every scene key. A scene without an
/// agent gets one labelled [`DEFAULT_AGENT_LABEL`].
pub fn build_world_model(
    config: &ArborConfig,
    types: Arc<dyn TypeHierarchy>,
) -> Result<(WorldModel, HashMap<String, ElementId>), BootstrapError> {
    let scene = &config.scene;
    let mut wm = WorldModel::new(Arc::clone(&types))
        .with_max_overlap_merges(config.resolver.max_overlap_merges);
    wm.reset(&scene.name);

    let mut ids = HashMap::from([(ROOT_KEY.to_string(), WorldModel::root_id())]);
    for spec in &scene.elements {
        let parent = ids
            .get(&spec.parent)
            .copied()
            .ok_or_else(|| ConfigError::Invalid(format!("unknown parent '{}'", spec.parent)))?;
        let mut element = Element::labeled(&spec.type_name, spec.label());
        for (key, values) in &spec.properties {
            for value in values {
                element.add_property_value(key, value.clone());
            }
        }
        let id = wm.add_element(&element, parent, &spec.predicate)?;
        ids.insert(spec.key.clone(), id);
    }

    for relation in &scene.relations {
        let endpoint = |key: &str| {
            ids.get(key)
                .copied()
                .ok_or_else(|| ConfigError::Invalid(format!("unknown relation endpoint '{key}'")))
        };
        wm.set_relation(endpoint(&relation.src)?, &relation.predicate, endpoint(&relation.dst)?, true)?;
    }

    let has_agent = scene
        .elements
        .iter()
        .any(|e| types.is_subtype_of(&e.type_name, AGENT_TYPE));
    if !has_agent {
        let id = wm.add_element(
            &Element::labeled(AGENT_TYPE, DEFAULT_AGENT_LABEL),
            WorldModel::root_id(),
            arbor_core::world::CONTAIN,
        )?;
        ids.entry(DEFAULT_AGENT_LABEL.to_string()).or_insert(id);
        info!(id = %id, "scene has no agent, added default");
    }

    info!(
        scene = %scene.name,
        elements = wm.len(),
        relations = scene.relations.len(),
        "world model ready"
    );
    Ok((wm, ids))
}

/// Registry holding every declared skill instance, then `extra`.
pub fn build_registry(
    config: &ArborConfig,
    extra: Vec<Arc<dyn Skill>>,
) -> Result<NodeInstanciator, BootstrapError> {
    let mut registry = NodeInstanciator::new();
    for spec in &config.skills {
        for skill in DeclaredSkill::instances(spec)? {
            registry.add_instance(skill);
        }
    }
    for skill in extra {
        registry.add_instance(skill);
    }
    for spec in &config.skills {
        for child in &spec.children {
            if registry.description(&child.type_name).is_none() {
                return Err(BootstrapError::InvalidSkill(format!(
                    "{} expands into unknown type '{}'",
                    spec.type_name, child.type_name
                )));
            }
        }
    }
    Ok(registry)
}
