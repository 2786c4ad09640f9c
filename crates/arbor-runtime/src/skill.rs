//! Skills declared in `arbor.yaml`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use arbor_config::{ChildSpec, ConditionSpec, ConditionSpecKind, ParamValueKind, SkillSpec};
use arbor_core::conditions::Condition;
use arbor_core::error::EngineError;
use arbor_core::params::ParamHandler;
use arbor_core::procedure::{Composite, ProcedureDescription};
use arbor_core::skill::{ExpandContext, Skill, SkillContext, SkillOutcome};
use arbor_core::world::Element;

use crate::bootstrap::{BootstrapError, THING_TYPE};

/// Instance of a YAML-declared procedure type.
///
/// Execution always succeeds unless the node is preempted first. Children
/// listed in the declaration are added when the instance is bound.
#[derive(Debug, Clone)]
pub struct DeclaredSkill {
    type_name: String,
    label: String,
    description: ProcedureDescription,
    composite: Composite,
    children: Arc<Vec<ChildSpec>>,
}

impl DeclaredSkill {
    pub fn new(spec: &SkillSpec, label: impl Into<String>) -> Result<Self, BootstrapError> {
        Ok(Self {
            type_name: spec.type_name.clone(),
            label: label.into(),
            description: skill_description(spec)?,
            composite: spec.composite.clone(),
            children: Arc::new(spec.children.clone()),
        })
    }

    /// One instance per declared label.
    pub fn instances(spec: &SkillSpec) -> Result<Vec<Arc<dyn Skill>>, BootstrapError> {
        spec.instance_labels()
            .into_iter()
            .map(|label| Ok(Arc::new(Self::new(spec, label)?) as Arc<dyn Skill>))
            .collect()
    }
}

#[async_trait]
impl Skill for DeclaredSkill {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn description(&self) -> ProcedureDescription {
        self.description.clone()
    }

    fn expand(&self, ctx: &mut ExpandContext<'_>) -> Result<(), EngineError> {
        if self.children.is_empty() {
            return Ok(());
        }
        ctx.set_composite(self.composite.clone())?;
        for child in self.children.iter() {
            let id = ctx.add_child(&child.type_name, &child.label(), child.latch)?;
            for (from, to) in &child.remap {
                ctx.remap(id, from, to)?;
            }
        }
        Ok(())
    }

    async fn execute(&self, params: &mut ParamHandler, ctx: &SkillContext) -> SkillOutcome {
        if ctx.is_cancelled() {
            return SkillOutcome::failure("cancelled before start");
        }
        debug!(
            skill = %self.type_name,
            label = %self.label,
            execution_id = %ctx.execution_id,
            params = params.len(),
            "declared skill executed"
        );
        SkillOutcome::Success
    }
}

fn skill_description(spec: &SkillSpec) -> Result<ProcedureDescription, BootstrapError> {
    let mut description = ProcedureDescription::new(&spec.type_name);
    for param in &spec.params {
        match param.value_kind {
            ParamValueKind::Element => {
                let element = Element::labeled(
                    param.element_type.as_deref().unwrap_or(THING_TYPE),
                    param.label.clone().unwrap_or_default(),
                );
                description.add_param(&param.key, element, param.param_type, &param.options);
            }
            ParamValueKind::Data => {
                let value = param.default.clone().unwrap_or(serde_json::Value::Null);
                description.add_param(&param.key, value, param.param_type, &param.options);
            }
        }
    }
    for condition in &spec.pre {
        description.pre.push(condition_from_spec(&spec.type_name, condition)?);
    }
    for condition in &spec.hold {
        description.hold.push(condition_from_spec(&spec.type_name, condition)?);
    }
    for condition in &spec.post {
        description.post.push(condition_from_spec(&spec.type_name, condition)?);
    }
    Ok(description)
}

fn condition_from_spec(skill: &str, spec: &ConditionSpec) -> Result<Condition, BootstrapError> {
    let missing = |field: &str| {
        BootstrapError::InvalidSkill(format!(
            "{}: condition '{}' needs '{}'",
            skill,
            spec.label(),
            field
        ))
    };
    let label = spec.label();
    let predicate = || spec.predicate.clone().ok_or_else(|| missing("predicate"));
    let condition = match spec.kind {
        ConditionSpecKind::Property => Condition::property(
            label,
            spec.subject.as_str(),
            predicate()?,
            spec.value.clone().ok_or_else(|| missing("value"))?,
            spec.desired,
        ),
        ConditionSpecKind::Relation => Condition::relation(
            label,
            spec.subject.as_str(),
            predicate()?,
            spec.object.clone().ok_or_else(|| missing("object"))?,
            spec.desired,
        ),
        ConditionSpecKind::HasProperty => {
            Condition::has_property(label, spec.subject.as_str(), predicate()?, spec.desired)
        }
        ConditionSpecKind::IsSpecified => {
            Condition::is_specified(label, spec.subject.as_str(), spec.desired)
        }
        ConditionSpecKind::Generate => Condition::generate(label, spec.subject.as_str(), spec.desired),
        ConditionSpecKind::OnType => Condition::on_type(
            label,
            spec.subject.as_str(),
            spec.type_name.clone().ok_or_else(|| missing("type"))?,
        ),
    };
    Ok(condition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::params::ParamType;
    use arbor_core::procedure::ParamOption;

    fn pick_spec() -> SkillSpec {
        serde_yaml::from_str(
            r#"
type: Pick
params:
  - { key: Object, element_type: Box }
  - { key: Gripper, element_type: Gripper, options: [lock] }
  - { key: Speed, type: data, default: 0.5, param_type: config }
pre:
  - { kind: property, label: EmptyHanded, subject: Gripper, predicate: ContainerState, value: Empty }
post:
  - { kind: relation, label: Holding, subject: Gripper, predicate: contain, object: Object }
instances: [pick_fast, pick_slow]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_description_from_declaration() {
        let spec = pick_spec();
        let skill = DeclaredSkill::new(&spec, "pick_fast").unwrap();
        let description = skill.description();
        assert_eq!(description.type_name, "Pick");
        assert_eq!(description.params.param_type("Speed"), Some(ParamType::Config));
        assert_eq!(description.params.template("Object").unwrap().kind, "Box");
        // Lock adds an idle pre, a busy hold and an idle post on the gripper.
        assert_eq!(description.pre.len(), 2);
        assert_eq!(description.hold.len(), 1);
        assert_eq!(description.post.len(), 2);
        assert_eq!(spec.params[1].options, vec![ParamOption::Lock]);
    }

    #[test]
    fn test_one_instance_per_label() {
        let instances = DeclaredSkill::instances(&pick_spec()).unwrap();
        let labels: Vec<&str> = instances.iter().map(|s| s.label()).collect();
        assert_eq!(labels, vec!["pick_fast", "pick_slow"]);
    }
}
