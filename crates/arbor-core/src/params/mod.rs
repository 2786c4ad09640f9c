//! Parameter layer
//!
//! A [`Param`] is a typed, possibly multi-valued named slot. Its
//! [`ParamType`] decides how a value may be supplied, overwritten or
//! defaulted when inputs are merged into a node.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::world::Element;

/// How a parameter is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// Specified in input at run time
    #[default]
    Online,
    /// Specified in input a priori
    Offline,
    /// Specified in input at run time by a device
    Hardware,
    /// Like offline, but constant
    Config,
    /// Not mandatory in input, specified in output
    Optional,
    /// Added automatically
    System,
    Discrete,
}

impl ParamType {
    /// Types whose values survive an input merge with `keep_offline`.
    pub fn is_preserved_on_merge(self) -> bool {
        matches!(self, ParamType::Offline | ParamType::Config | ParamType::System)
    }
}

/// A parameter value: a world element or plain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Element(Element),
    Data(Value),
}

impl ParamValue {
    pub fn as_element(&self) -> Option<&Element> {
        match self {
            ParamValue::Element(e) => Some(e),
            ParamValue::Data(_) => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut Element> {
        match self {
            ParamValue::Element(e) => Some(e),
            ParamValue::Data(_) => None,
        }
    }

    pub fn as_data(&self) -> Option<&Value> {
        match self {
            ParamValue::Data(v) => Some(v),
            ParamValue::Element(_) => None,
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            ParamValue::Element(_) => ValueType::Element,
            ParamValue::Data(Value::Bool(_)) => ValueType::Boolean,
            ParamValue::Data(Value::Number(_)) => ValueType::Number,
            ParamValue::Data(Value::String(_)) => ValueType::Text,
            ParamValue::Data(_) => ValueType::Structured,
        }
    }
}

impl From<Element> for ParamValue {
    fn from(value: Element) -> Self {
        ParamValue::Element(value)
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        ParamValue::Data(value)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Element(e) => e.fmt(f),
            ParamValue::Data(v) => v.fmt(f),
        }
    }
}

/// Declared value type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Element,
    Boolean,
    Number,
    Text,
    Structured,
}

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("param '{0}' is not in the map")]
    MissingKey(String),
    #[error("remapping '{from}' onto '{to}' would shadow an existing param")]
    Shadowing { from: String, to: String },
    #[error("param '{key}' expects {expected:?}, got {found:?}")]
    TypeMismatch {
        key: String,
        expected: ValueType,
        found: ValueType,
    },
    #[error("param '{0}' cannot be set to an empty value list")]
    EmptyValues(String),
}

/// A named, typed, multi-valued slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    #[serde(default)]
    pub description: String,
    pub value_type: ValueType,
    pub param_type: ParamType,
    values: Vec<ParamValue>,
    default: Vec<ParamValue>,
}

impl Param {
    pub fn new(key: impl Into<String>, value: ParamValue, param_type: ParamType) -> Self {
        Self {
            key: key.into(),
            description: String::new(),
            value_type: value.value_type(),
            param_type,
            values: vec![value.clone()],
            default: vec![value],
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn value(&self) -> Option<&ParamValue> {
        self.values.first()
    }

    pub fn values(&self) -> &[ParamValue] {
        &self.values
    }

    pub fn default_values(&self) -> &[ParamValue] {
        &self.default
    }

    /// First value as an element, if this is an element parameter.
    pub fn element(&self) -> Option<&Element> {
        self.value().and_then(ParamValue::as_element)
    }

    pub fn element_mut(&mut self) -> Option<&mut Element> {
        self.values.first_mut().and_then(ParamValue::as_element_mut)
    }

    pub fn is_element(&self) -> bool {
        self.value_type == ValueType::Element
    }

    /// An element parameter is specified once grounded; data always is.
    pub fn is_specified(&self) -> bool {
        match self.value() {
            Some(ParamValue::Element(e)) => e.is_grounded(),
            Some(ParamValue::Data(_)) => true,
            None => false,
        }
    }

    pub fn set_values(&mut self, values: Vec<ParamValue>) -> Result<(), ParamError> {
        if values.is_empty() {
            return Err(ParamError::EmptyValues(self.key.clone()));
        }
        if let Some(bad) = values.iter().find(|v| !self.accepts(v)) {
            return Err(ParamError::TypeMismatch {
                key: self.key.clone(),
                expected: self.value_type,
                found: bad.value_type(),
            });
        }
        self.values = values;
        Ok(())
    }

    fn accepts(&self, value: &ParamValue) -> bool {
        let found = value.value_type();
        found == self.value_type
            || (self.value_type == ValueType::Structured && found != ValueType::Element)
    }

    pub fn make_default(&mut self) {
        self.default = self.values.clone();
    }

    pub fn reset_to_default(&mut self) {
        self.values = self.default.clone();
    }

    pub fn has_default_values(&self) -> bool {
        self.values == self.default
    }
}

/// Ordered key -> [`Param`] map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamHandler {
    params: BTreeMap<String, Param>,
}

impl ParamHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a parameter. An existing key is replaced.
    pub fn add_param(&mut self, key: impl Into<String>, value: ParamValue, param_type: ParamType) {
        let key = key.into();
        self.params
            .insert(key.clone(), Param::new(key, value, param_type));
    }

    pub fn insert(&mut self, param: Param) {
        self.params.insert(param.key.clone(), param);
    }

    pub fn remove(&mut self, key: &str) -> Option<Param> {
        self.params.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Param> {
        self.params.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Param> {
        self.params.get_mut(key)
    }

    pub fn param(&self, key: &str) -> Result<&Param, ParamError> {
        self.get(key)
            .ok_or_else(|| ParamError::MissingKey(key.to_string()))
    }

    pub fn param_type(&self, key: &str) -> Option<ParamType> {
        self.get(key).map(|p| p.param_type)
    }

    pub fn value(&self, key: &str) -> Option<&ParamValue> {
        self.get(key).and_then(Param::value)
    }

    /// Element value of `key`, if any.
    pub fn template(&self, key: &str) -> Option<&Element> {
        self.get(key).and_then(Param::element)
    }

    pub fn element(&self, key: &str) -> Result<&Element, ParamError> {
        let param = self.param(key)?;
        param.element().ok_or_else(|| ParamError::TypeMismatch {
            key: key.to_string(),
            expected: ValueType::Element,
            found: param.value_type,
        })
    }

    pub fn is_specified(&self, key: &str) -> bool {
        self.get(key).map(Param::is_specified).unwrap_or(false)
    }

    /// Replace the values of `key` with a single value.
    pub fn specify(&mut self, key: &str, value: impl Into<ParamValue>) -> Result<(), ParamError> {
        self.specify_values(key, vec![value.into()])
    }

    pub fn specify_values(&mut self, key: &str, values: Vec<ParamValue>) -> Result<(), ParamError> {
        self.params
            .get_mut(key)
            .ok_or_else(|| ParamError::MissingKey(key.to_string()))?
            .set_values(values)
    }

    /// Set values and make them the default.
    pub fn specify_default(&mut self, key: &str, values: Vec<ParamValue>) -> Result<(), ParamError> {
        self.specify_values(key, values)?;
        if let Some(param) = self.params.get_mut(key) {
            param.make_default();
        }
        Ok(())
    }

    /// Reset the listed keys to their default values.
    pub fn set_default<S: AsRef<str>>(&mut self, keys: &[S]) -> Result<(), ParamError> {
        for key in keys {
            let key = key.as_ref();
            self.params
                .get_mut(key)
                .ok_or_else(|| ParamError::MissingKey(key.to_string()))?
                .reset_to_default();
        }
        Ok(())
    }

    /// Input merge policy.
    ///
    /// Overwrites the values of keys present in both handlers. With
    /// `keep_offline`, Offline, Config and System params keep their values.
    /// Keys only in `other` are ignored.
    pub fn set_params(&mut self, other: &ParamHandler, keep_offline: bool) {
        for (key, incoming) in &other.params {
            let Some(target) = self.params.get_mut(key) else {
                continue;
            };
            if keep_offline && target.param_type.is_preserved_on_merge() {
                continue;
            }
            if let Err(err) = target.set_values(incoming.values.clone()) {
                tracing::debug!(key = %key, error = %err, "merge skipped value");
            }
        }
    }

    /// Union with `other`, right-biased on keys present in both.
    pub fn merge_from(&mut self, other: &ParamHandler) {
        for (key, incoming) in &other.params {
            match self.params.get_mut(key) {
                Some(target) => {
                    if let Err(err) = target.set_values(incoming.values.clone()) {
                        tracing::debug!(key = %key, error = %err, "merge skipped value");
                    }
                }
                None => {
                    self.params.insert(key.clone(), incoming.clone());
                }
            }
        }
    }

    pub fn merged(&self, other: &ParamHandler) -> ParamHandler {
        let mut out = self.clone();
        out.merge_from(other);
        out
    }

    /// Rename `from` to `to`. A missing `from` is a no-op.
    pub fn remap(&mut self, from: &str, to: &str) -> Result<(), ParamError> {
        if from == to || !self.params.contains_key(from) {
            return Ok(());
        }
        if self.params.contains_key(to) {
            return Err(ParamError::Shadowing {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if let Some(mut param) = self.params.remove(from) {
            param.key = to.to_string();
            self.params.insert(to.to_string(), param);
        }
        Ok(())
    }

    pub fn filter_by_type(&self, types: &[ParamType]) -> ParamHandler {
        ParamHandler {
            params: self
                .params
                .iter()
                .filter(|(_, p)| types.contains(&p.param_type))
                .map(|(k, p)| (k.clone(), p.clone()))
                .collect(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.params.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Param)> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl fmt::Display for ParamHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, param) in &self.params {
            if param.param_type != ParamType::Online {
                continue;
            }
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{key}:")?;
            for value in &param.values {
                write!(f, "{value}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn element(kind: &str, id: i64) -> ParamValue {
        ParamValue::Element(Element::new(kind).with_id(id))
    }

    #[test]
    fn test_specify_checks_value_type() {
        let mut ph = ParamHandler::new();
        ph.add_param("Object", element("Box", -1), ParamType::Online);
        ph.add_param("Speed", json!(0.5).into(), ParamType::Config);

        assert!(ph.specify("Object", element("Box", 3)).is_ok());
        assert!(matches!(
            ph.specify("Speed", element("Box", 3)),
            Err(ParamError::TypeMismatch { .. })
        ));
        assert!(matches!(
            ph.specify("Missing", json!(1)),
            Err(ParamError::MissingKey(_))
        ));
        assert!(ph.is_specified("Object"));
    }

    #[test]
    fn test_set_params_keeps_offline_values() {
        let mut node = ParamHandler::new();
        node.add_param("Object", element("Box", -1), ParamType::Online);
        node.add_param("Place", element("Table", 7), ParamType::Offline);

        let mut input = ParamHandler::new();
        input.add_param("Object", element("Box", 2), ParamType::Online);
        input.add_param("Place", element("Table", 9), ParamType::Online);
        input.add_param("Other", element("Cup", 4), ParamType::Online);

        node.set_params(&input, true);
        assert_eq!(node.element("Object").unwrap().id.0, 2);
        assert_eq!(node.element("Place").unwrap().id.0, 7);
        assert!(!node.contains("Other"));

        node.set_params(&input, false);
        assert_eq!(node.element("Place").unwrap().id.0, 9);
    }

    #[test]
    fn test_remap_refuses_to_shadow() {
        let mut ph = ParamHandler::new();
        ph.add_param("Arm", element("Arm", -1), ParamType::Online);
        ph.add_param("Gripper", element("Gripper", -1), ParamType::Online);

        assert_eq!(
            ph.remap("Arm", "Gripper"),
            Err(ParamError::Shadowing {
                from: "Arm".into(),
                to: "Gripper".into()
            })
        );
        ph.remap("Arm", "LeftArm").unwrap();
        assert!(ph.contains("LeftArm"));
        assert_eq!(ph.get("LeftArm").unwrap().key, "LeftArm");
    }

    #[test]
    fn test_default_round_trip() {
        let mut ph = ParamHandler::new();
        ph.add_param("Object", element("Box", -1), ParamType::Online);
        ph.specify("Object", element("Box", 5)).unwrap();
        assert!(!ph.get("Object").unwrap().has_default_values());

        ph.set_default(&["Object"]).unwrap();
        assert!(!ph.is_specified("Object"));

        ph.specify_default("Object", vec![element("Box", 6)]).unwrap();
        ph.specify("Object", element("Box", 1)).unwrap();
        ph.set_default(&["Object"]).unwrap();
        assert_eq!(ph.element("Object").unwrap().id.0, 6);
    }

    #[test]
    fn test_merge_is_right_biased() {
        let mut left = ParamHandler::new();
        left.add_param("A", json!(1).into(), ParamType::Online);
        let mut right = ParamHandler::new();
        right.add_param("A", json!(2).into(), ParamType::Online);
        right.add_param("B", json!(3).into(), ParamType::Online);

        let merged = left.merged(&right);
        assert_eq!(merged.value("A"), Some(&ParamValue::Data(json!(2))));
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.filter_by_type(&[ParamType::Offline]).len(), 0);
    }
}
