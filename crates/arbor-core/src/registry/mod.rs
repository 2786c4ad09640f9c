//! Registry of procedure descriptions and skill instances
//!
//! Descriptions are keyed by procedure type, instances by type then label.
//! Abstract tree nodes are created from descriptions and later bound to an
//! instance of their type.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::procedure::{NodeId, Procedure, ProcedureDescription, ProcedureTree};
use crate::skill::Skill;

pub type DescriptionFactory = Arc<dyn Fn() -> ProcedureDescription + Send + Sync>;
pub type SkillFactory = Arc<dyn Fn() -> Arc<dyn Skill> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no description registered for type '{0}'")]
    UnknownType(String),
    #[error("no instance available for type '{0}'")]
    NoInstance(String),
    #[error("no skill factory registered under '{0}'")]
    UnknownInstance(String),
}

#[derive(Default)]
pub struct NodeInstanciator {
    description_factories: BTreeMap<String, DescriptionFactory>,
    skill_factories: BTreeMap<String, SkillFactory>,
    descriptions: BTreeMap<String, Arc<ProcedureDescription>>,
    instances: BTreeMap<String, Vec<Arc<dyn Skill>>>,
}

impl NodeInstanciator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_description(&mut self, type_name: impl Into<String>, factory: DescriptionFactory) {
        self.description_factories.insert(type_name.into(), factory);
    }

    pub fn register_skill(&mut self, label: impl Into<String>, factory: SkillFactory) {
        self.skill_factories.insert(label.into(), factory);
    }

    /// Build, finalize and store the description of `type_name`.
    pub fn create_description(&mut self, type_name: &str) -> Result<Arc<ProcedureDescription>, RegistryError> {
        let factory = self
            .description_factories
            .get(type_name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownType(type_name.to_string()))?;
        let description = self.add_description(factory());
        Ok(description)
    }

    /// Store a description, finalized. Replaces any previous one.
    pub fn add_description(&mut self, mut description: ProcedureDescription) -> Arc<ProcedureDescription> {
        description.finalize();
        let description = Arc::new(description);
        debug!(procedure_type = %description.type_name, "registered description");
        self.descriptions
            .insert(description.type_name.clone(), Arc::clone(&description));
        description
    }

    /// Build the skill registered under `label` and add it to the instances
    /// of its type.
    pub fn create_instance(&mut self, label: &str) -> Result<Arc<dyn Skill>, RegistryError> {
        let factory = self
            .skill_factories
            .get(label)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownInstance(label.to_string()))?;
        let skill = factory();
        self.add_instance(Arc::clone(&skill));
        Ok(skill)
    }

    /// Add a skill instance. Its own description is used for the type when
    /// none is registered yet.
    pub fn add_instance(&mut self, skill: Arc<dyn Skill>) {
        let type_name = skill.type_name().to_string();
        if !self.descriptions.contains_key(&type_name) {
            self.add_description(skill.description());
        }
        info!(procedure_type = %type_name, label = %skill.label(), "registered skill instance");
        self.instances.entry(type_name).or_default().push(skill);
    }

    /// Build every registered description, then every registered skill.
    pub fn create_all(&mut self) -> Result<(), RegistryError> {
        let types: Vec<String> = self.description_factories.keys().cloned().collect();
        for type_name in types {
            self.create_description(&type_name)?;
        }
        let labels: Vec<String> = self.skill_factories.keys().cloned().collect();
        for label in labels {
            self.create_instance(&label)?;
        }
        Ok(())
    }

    pub fn description(&self, type_name: &str) -> Option<Arc<ProcedureDescription>> {
        self.descriptions.get(type_name).cloned()
    }

    /// Finalized description of a skill, without registering it.
    pub fn create_skill_description(&self, skill: &dyn Skill) -> Arc<ProcedureDescription> {
        let mut description = skill.description();
        description.finalize();
        Arc::new(description)
    }

    pub fn get_instances(&self, type_name: &str) -> &[Arc<dyn Skill>] {
        self.instances
            .get(type_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn types(&self) -> impl Iterator<Item = &String> {
        self.descriptions.keys()
    }

    /// Abstract node of `type_name`.
    pub fn procedure(&self, type_name: &str, label: &str) -> Result<Procedure, RegistryError> {
        let description = self
            .description(type_name)
            .ok_or_else(|| RegistryError::UnknownType(type_name.to_string()))?;
        Ok(Procedure::from_description(description, label))
    }

    /// Bind the node to the instance with its label, or to the first
    /// instance of its type.
    pub fn assign_instance(&self, tree: &mut ProcedureTree, id: NodeId) -> Result<(), EngineError> {
        let node = tree.node(id)?;
        let instances = self.get_instances(&node.type_name);
        let skill = instances
            .iter()
            .rev()
            .find(|s| s.label() == node.label)
            .or_else(|| instances.first())
            .cloned()
            .ok_or_else(|| RegistryError::NoInstance(node.type_name.clone()))?;
        debug!(node = %node.label, instance = %skill.label(), "assigning instance");
        tree.set_instance(id, skill, self)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (type_name, description) in &self.descriptions {
            let labels: Vec<&str> = self
                .get_instances(type_name)
                .iter()
                .map(|s| s.label())
                .collect();
            let _ = writeln!(
                out,
                "{} [{}] params: {}",
                type_name,
                labels.join(", "),
                description.params.keys().cloned().collect::<Vec<_>>().join(", ")
            );
        }
        out
    }
}

impl std::fmt::Debug for NodeInstanciator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeInstanciator")
            .field("descriptions", &self.descriptions.keys().collect::<Vec<_>>())
            .field(
                "instances",
                &self
                    .instances
                    .iter()
                    .map(|(t, v)| (t, v.len()))
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParamHandler, ParamType};
    use crate::procedure::{NodeBody, ROBOT_PARAM};
    use crate::skill::{ExpandContext, SkillContext, SkillOutcome};
    use crate::world::Element;
    use async_trait::async_trait;

    struct Labeled {
        type_name: &'static str,
        label: &'static str,
    }

    #[async_trait]
    impl Skill for Labeled {
        fn type_name(&self) -> &str {
            self.type_name
        }
        fn label(&self) -> &str {
            self.label
        }
        fn description(&self) -> ProcedureDescription {
            ProcedureDescription::new(self.type_name).with_param(
                "Object",
                Element::new("Box"),
                ParamType::Online,
                &[],
            )
        }
        fn expand(&self, ctx: &mut ExpandContext<'_>) -> Result<(), EngineError> {
            if self.type_name == "PickAndPlace" {
                let pick = ctx.add_child("Pick", "pick_fast", false)?;
                ctx.remap(pick, "Object", "Item")?;
            }
            Ok(())
        }
        async fn execute(&self, _params: &mut ParamHandler, _ctx: &SkillContext) -> SkillOutcome {
            SkillOutcome::Success
        }
    }

    fn registry() -> NodeInstanciator {
        let mut registry = NodeInstanciator::new();
        for (type_name, label) in [
            ("Pick", "pick_slow"),
            ("Pick", "pick_fast"),
            ("PickAndPlace", "pick_and_place"),
        ] {
            registry.register_skill(
                label,
                Arc::new(move || Arc::new(Labeled { type_name, label }) as Arc<dyn Skill>),
            );
        }
        registry.create_all().unwrap();
        registry
    }

    #[test]
    fn test_instances_register_their_description() {
        let registry = registry();
        assert_eq!(registry.get_instances("Pick").len(), 2);
        let description = registry.description("Pick").unwrap();
        assert!(description.params.contains(ROBOT_PARAM));
        assert!(matches!(
            registry.procedure("Drive", "d"),
            Err(RegistryError::UnknownType(_))
        ));
    }

    #[test]
    fn test_assign_prefers_matching_label() {
        let registry = registry();
        let mut tree = ProcedureTree::new(registry.procedure("Pick", "pick_slow").unwrap());
        let root = tree.root().unwrap();
        registry.assign_instance(&mut tree, root).unwrap();
        assert_eq!(tree.node(root).unwrap().label, "pick_slow");

        let mut tree = ProcedureTree::new(registry.procedure("Pick", "other").unwrap());
        let root = tree.root().unwrap();
        registry.assign_instance(&mut tree, root).unwrap();
        assert!(matches!(
            &tree.node(root).unwrap().body,
            NodeBody::Skill(Some(skill)) if skill.label() == "pick_fast"
        ));
    }

    #[test]
    fn test_assign_expands_and_reassign_resets_children() {
        let registry = registry();
        let mut tree =
            ProcedureTree::new(registry.procedure("PickAndPlace", "pick_and_place").unwrap());
        let root = tree.root().unwrap();
        registry.assign_instance(&mut tree, root).unwrap();
        let children = tree.children(root);
        assert_eq!(children.len(), 1);
        assert!(tree.node(children[0]).unwrap().params.contains("Item"));

        registry.assign_instance(&mut tree, root).unwrap();
        assert_eq!(tree.children(root).len(), 1);
        assert_eq!(tree.len(), 2);
    }
}
