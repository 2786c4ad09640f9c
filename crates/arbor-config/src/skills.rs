//! Declarative skills.
//!
//! These types describe procedure types in YAML: their params and
//! conditions, the named instances to register, and an optional fixed
//! expansion into child procedures.

use arbor_core::procedure::{Composite, ParamOption};
use arbor_core::params::ParamType;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct SkillSpec {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub pre: Vec<ConditionSpec>,
    #[serde(default)]
    pub hold: Vec<ConditionSpec>,
    #[serde(default)]
    pub post: Vec<ConditionSpec>,
    /// Instance labels. One instance named after the type when empty.
    #[serde(default)]
    pub instances: Vec<String>,
    /// Processor for `children`.
    #[serde(default)]
    pub composite: Composite,
    #[serde(default)]
    pub children: Vec<ChildSpec>,
}

impl SkillSpec {
    pub fn instance_labels(&self) -> Vec<String> {
        if self.instances.is_empty() {
            vec![self.type_name.to_lowercase()]
        } else {
            self.instances.clone()
        }
    }

    pub fn conditions(&self) -> impl Iterator<Item = &ConditionSpec> {
        self.pre.iter().chain(&self.hold).chain(&self.post)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ParamValueKind {
    #[default]
    #[serde(alias = "element")]
    Element,
    #[serde(alias = "data")]
    Data,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParamSpec {
    pub key: String,
    #[serde(rename = "type", default)]
    pub value_kind: ParamValueKind,
    /// Type of the template element. Defaults to `Thing`.
    #[serde(default)]
    pub element_type: Option<String>,
    /// Label of the template element. Empty matches any label.
    #[serde(default)]
    pub label: Option<String>,
    /// Default for data params.
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub options: Vec<ParamOption>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSpecKind {
    Property,
    Relation,
    HasProperty,
    IsSpecified,
    Generate,
    OnType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionSpec {
    pub kind: ConditionSpecKind,
    /// Defaults to the subject followed by the predicate.
    #[serde(default)]
    pub label: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub predicate: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default, rename = "type")]
    pub type_name: Option<String>,
    #[serde(default = "default_desired")]
    pub desired: bool,
}

fn default_desired() -> bool {
    true
}

impl ConditionSpec {
    pub fn label(&self) -> String {
        match (&self.label, &self.predicate) {
            (Some(label), _) => label.clone(),
            (None, Some(predicate)) => format!("{}{}", self.subject, predicate),
            (None, None) => self.subject.clone(),
        }
    }

    /// First field the kind needs that is absent.
    pub fn missing_field(&self) -> Option<&'static str> {
        match self.kind {
            ConditionSpecKind::Property => {
                if self.predicate.is_none() {
                    Some("predicate")
                } else if self.value.is_none() {
                    Some("value")
                } else {
                    None
                }
            }
            ConditionSpecKind::Relation => {
                if self.predicate.is_none() {
                    Some("predicate")
                } else if self.object.is_none() {
                    Some("object")
                } else {
                    None
                }
            }
            ConditionSpecKind::HasProperty => self.predicate.is_none().then_some("predicate"),
            ConditionSpecKind::OnType => self.type_name.is_none().then_some("type"),
            ConditionSpecKind::IsSpecified | ConditionSpecKind::Generate => None,
        }
    }

    /// Param keys the condition refers to.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys = vec![self.subject.as_str()];
        if self.kind == ConditionSpecKind::Relation {
            if let Some(object) = &self.object {
                keys.push(object);
            }
        }
        keys
    }
}

/// Child procedure added when an instance of the skill expands.
#[derive(Debug, Clone, Deserialize)]
pub struct ChildSpec {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Chain the previous sibling's postconditions as preconditions.
    #[serde(default)]
    pub latch: bool,
    /// Child key to parent key.
    #[serde(default)]
    pub remap: BTreeMap<String, String>,
}

impl ChildSpec {
    pub fn label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.type_name.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PICK: &str = r#"
type: Pick
params:
  - { key: Object, type: Element, element_type: Box }
  - { key: Gripper, element_type: Gripper, param_type: offline, options: [lock] }
  - { key: Speed, type: data, default: 0.5, param_type: config }
pre:
  - { kind: property, subject: Gripper, predicate: ContainerState, value: Empty }
post:
  - { kind: relation, label: Holding, subject: Gripper, predicate: contain, object: Object }
  - { kind: property, subject: Gripper, predicate: ContainerState, value: Empty, desired: false }
instances: [pick_fast, pick_slow]
"#;

    #[test]
    fn test_parse_skill() {
        let skill: SkillSpec = serde_yaml::from_str(PICK).unwrap();
        assert_eq!(skill.type_name, "Pick");
        assert_eq!(skill.params.len(), 3);
        assert_eq!(skill.params[0].value_kind, ParamValueKind::Element);
        assert_eq!(skill.params[0].param_type, ParamType::Online);
        assert_eq!(skill.params[1].param_type, ParamType::Offline);
        assert_eq!(skill.params[1].options, vec![ParamOption::Lock]);
        assert_eq!(skill.params[2].value_kind, ParamValueKind::Data);
        assert_eq!(skill.params[2].default, Some(Value::from(0.5)));
        assert!(skill.pre[0].desired);
        assert!(!skill.post[1].desired);
        assert_eq!(skill.pre[0].label(), "GripperContainerState");
        assert_eq!(skill.post[0].label(), "Holding");
        assert_eq!(skill.post[0].keys(), vec!["Gripper", "Object"]);
        assert_eq!(skill.instance_labels(), vec!["pick_fast", "pick_slow"]);
        assert_eq!(skill.composite, Composite::Serial);
        assert_eq!(skill.conditions().count(), 3);
    }

    #[test]
    fn test_missing_condition_fields() {
        let spec: ConditionSpec =
            serde_yaml::from_str("{ kind: relation, subject: Gripper, predicate: contain }").unwrap();
        assert_eq!(spec.missing_field(), Some("object"));
        let spec: ConditionSpec =
            serde_yaml::from_str("{ kind: on_type, subject: Object, type: Box }").unwrap();
        assert_eq!(spec.missing_field(), None);
        let spec: ConditionSpec = serde_yaml::from_str("{ kind: generate, subject: Object }").unwrap();
        assert_eq!(spec.missing_field(), None);
    }

    #[test]
    fn test_expanding_skill_defaults() {
        let yaml = r#"
type: PickAndPlace
composite: parallel
children:
  - { type: Pick, remap: { Object: Item } }
  - { type: Place, label: place_it, latch: true }
"#;
        let skill: SkillSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(skill.composite, Composite::Parallel);
        assert_eq!(skill.instance_labels(), vec!["pickandplace"]);
        assert_eq!(skill.children[0].label(), "pick");
        assert_eq!(skill.children[0].remap["Object"], "Item");
        assert!(skill.children[1].latch);
        assert_eq!(skill.children[1].label(), "place_it");
    }
}
