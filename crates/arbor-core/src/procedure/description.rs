//! Skill descriptions: the declared interface of a procedure type.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::conditions::Condition;
use crate::params::{ParamHandler, ParamType, ParamValue, ValueType};
use crate::world::Element;

/// Key of the parameter every skill receives for the executing agent.
pub const ROBOT_PARAM: &str = "Robot";
pub const AGENT_TYPE: &str = "Agent";
const DEVICE_STATE: &str = "deviceState";
const IDLE: &str = "Idle";

/// Extra semantics attached to an element parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamOption {
    /// The skill deletes the element
    Consume,
    /// The skill unsets the parameter
    Unspecify,
    /// The element is busy while the skill runs
    Lock,
}

#[derive(Debug, Clone, Default)]
pub struct ProcedureDescription {
    pub type_name: String,
    pub params: ParamHandler,
    pub pre: Vec<Condition>,
    pub hold: Vec<Condition>,
    pub post: Vec<Condition>,
}

impl ProcedureDescription {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    /// Declare a parameter. Options only apply to element parameters.
    pub fn add_param(
        &mut self,
        key: &str,
        value: impl Into<ParamValue>,
        param_type: ParamType,
        options: &[ParamOption],
    ) {
        let value = value.into();
        let is_element = value.value_type() == ValueType::Element;
        self.params.add_param(key, value, param_type);
        if !is_element {
            return;
        }
        for option in options {
            match option {
                ParamOption::Consume => {
                    self.post
                        .push(Condition::generate(format!("Consume{key}"), key, false));
                }
                ParamOption::Unspecify => {
                    self.post
                        .push(Condition::is_specified(format!("Unset{key}"), key, false));
                }
                ParamOption::Lock => {
                    let idle = Condition::property(format!("{key}Idle"), key, DEVICE_STATE, IDLE, true);
                    self.pre.push(idle.clone());
                    self.hold.push(Condition::property(
                        format!("{key}Busy"),
                        key,
                        DEVICE_STATE,
                        IDLE,
                        false,
                    ));
                    self.post.push(idle);
                }
            }
        }
    }

    pub fn with_param(
        mut self,
        key: &str,
        value: impl Into<ParamValue>,
        param_type: ParamType,
        options: &[ParamOption],
    ) -> Self {
        self.add_param(key, value, param_type, options);
        self
    }

    pub fn with_pre(mut self, condition: Condition) -> Self {
        self.pre.push(condition);
        self
    }

    pub fn with_hold(mut self, condition: Condition) -> Self {
        self.hold.push(condition);
        self
    }

    pub fn with_post(mut self, condition: Condition) -> Self {
        self.post.push(condition);
        self
    }

    /// Add the implicit `Robot` param and the default conditions.
    ///
    /// Every online/offline element param gets a `Has<key>` specified
    /// precondition. Every optional element param gets a `Has<key>`
    /// generate postcondition, placed first.
    pub fn finalize(&mut self) {
        if !self.params.contains(ROBOT_PARAM) {
            self.params.add_param(
                ROBOT_PARAM,
                Element::new(AGENT_TYPE).into(),
                ParamType::System,
            );
        }

        let mut required = Vec::new();
        let mut optional = Vec::new();
        for (key, param) in self.params.iter() {
            if !param.is_element() {
                continue;
            }
            match param.param_type {
                ParamType::Online | ParamType::Offline => required.push(key.clone()),
                ParamType::Optional => optional.push(key.clone()),
                _ => {}
            }
        }

        for key in required {
            let condition = Condition::is_specified(format!("Has{key}"), key.as_str(), true);
            if !self.pre.iter().any(|c| c.is_equal(&condition)) {
                self.pre.push(condition);
            }
        }
        for key in optional {
            let condition = Condition::generate(format!("Has{key}"), key.as_str(), true);
            let skip = self.post.iter().any(|c| {
                c.is_equal(&condition) || condition.has_conflict(&self.params, c, &self.params)
            });
            if !skip {
                self.post.insert(0, condition);
            }
        }
    }

    /// Keys touched by the postconditions.
    pub fn modified_params(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .post
            .iter()
            .flat_map(|c| c.keys().into_iter().map(str::to_string))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn render(&self, verbose: bool) -> String {
        let mut out = format!("{}\n", self.type_name);
        if verbose {
            out.push_str(&format!("{}\n", json!(self.params)));
            out.push_str("PreConditions:\n");
            for c in &self.pre {
                out.push_str(&format!("{c}\n"));
            }
            out.push_str("PostConditions:\n");
            for c in &self.post {
                out.push_str(&format!("{c}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::ConditionKind;

    #[test]
    fn test_finalize_adds_default_conditions() {
        let mut description = ProcedureDescription::new("Pick")
            .with_param("Object", Element::new("Box"), ParamType::Online, &[])
            .with_param("Result", Element::new("Box"), ParamType::Optional, &[]);
        description.finalize();
        description.finalize();

        assert!(description.params.contains(ROBOT_PARAM));
        let has_object: Vec<_> = description
            .pre
            .iter()
            .filter(|c| c.label == "HasObject")
            .collect();
        assert_eq!(has_object.len(), 1);
        assert!(matches!(
            description.post[0].kind,
            ConditionKind::Generate { ref subject } if subject == "Result"
        ));
        assert_eq!(description.post.len(), 1);
    }

    #[test]
    fn test_lock_option_brackets_device_state() {
        let description = ProcedureDescription::new("Drill").with_param(
            "Tool",
            Element::new("Drill"),
            ParamType::Online,
            &[ParamOption::Lock, ParamOption::Consume],
        );
        assert_eq!(description.pre.len(), 1);
        assert_eq!(description.hold.len(), 1);
        assert!(!description.hold[0].desired);
        assert_eq!(description.post.len(), 2);
        assert_eq!(description.modified_params(), vec!["Tool".to_string()]);
    }

    #[test]
    fn test_options_ignored_for_data_params() {
        let description = ProcedureDescription::new("Wait").with_param(
            "Seconds",
            json!(2),
            ParamType::Config,
            &[ParamOption::Consume],
        );
        assert!(description.post.is_empty());
    }
}
