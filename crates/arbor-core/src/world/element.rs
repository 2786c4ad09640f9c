//! Element type definitions
//!
//! An Element is either a world-model node (grounded, `id >= 0`) or a
//! template describing the node a parameter expects (ungrounded).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Strongly-typed element ID. Negative means "not grounded".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub i64);

impl ElementId {
    /// Sentinel for an element not bound to any world-model node.
    pub const UNBOUND: ElementId = ElementId(-1);

    pub fn is_grounded(self) -> bool {
        self.0 >= 0
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl Default for ElementId {
    fn default() -> Self {
        Self::UNBOUND
    }
}

impl From<i64> for ElementId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One end of a relation template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationEnd {
    /// The element carrying the template.
    This,
    /// The element bound to another parameter key.
    Param(String),
}

/// Relation constraint attached to a template element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationTemplate {
    pub src: RelationEnd,
    pub predicate: String,
    pub dst: RelationEnd,
    pub state: bool,
}

impl RelationTemplate {
    /// The parameter key on the far side of the template, if any.
    pub fn other_key(&self) -> Option<&str> {
        match (&self.src, &self.dst) {
            (RelationEnd::This, RelationEnd::Param(key))
            | (RelationEnd::Param(key), RelationEnd::This) => Some(key),
            _ => None,
        }
    }
}

/// A typed, optionally grounded entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub id: ElementId,
    #[serde(default)]
    pub properties: BTreeMap<String, Vec<Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<RelationTemplate>,
}

impl Element {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn labeled(kind: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(kind).with_label(label)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<ElementId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add_property_value(key, value.into());
        self
    }

    pub fn is_grounded(&self) -> bool {
        self.id.is_grounded()
    }

    /// Empty or "Unknown" labels match any label.
    pub fn has_wildcard_label(&self) -> bool {
        self.label.is_empty() || self.label == "Unknown"
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn has_property_value(&self, key: &str, value: &Value) -> bool {
        self.properties
            .get(key)
            .map(|values| values.contains(value))
            .unwrap_or(false)
    }

    pub fn property_values(&self, key: &str) -> &[Value] {
        self.properties
            .get(key)
            .map(|values| values.as_slice())
            .unwrap_or(&[])
    }

    /// Append a value unless already present.
    pub fn add_property_value(&mut self, key: impl Into<String>, value: Value) {
        let values = self.properties.entry(key.into()).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Ensure the property exists, without constraining its value.
    pub fn touch_property(&mut self, key: impl Into<String>) {
        self.properties.entry(key.into()).or_default();
    }

    /// Remove every occurrence of `value`. The key stays, possibly empty.
    pub fn remove_property_value(&mut self, key: &str, value: &Value) {
        if let Some(values) = self.properties.get_mut(key) {
            values.retain(|v| v != value);
        }
    }

    pub fn remove_property(&mut self, key: &str) {
        self.properties.remove(key);
    }

    pub fn add_relation(&mut self, template: RelationTemplate) {
        if !self.relations.contains(&template) {
            self.relations.push(template);
        }
    }

    pub fn remove_relation(&mut self, template: &RelationTemplate) {
        self.relations.retain(|r| r != template);
    }

    /// Copy of this element detached from any world-model node.
    pub fn unbound(&self) -> Self {
        let mut copy = self.clone();
        copy.id = ElementId::UNBOUND;
        copy
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_empty() {
            write!(f, "{}#{}", self.kind, self.id)
        } else {
            write!(f, "{}:{}#{}", self.kind, self.label, self.id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_property_values_are_deduplicated() {
        let mut e = Element::labeled("Gripper", "rq3");
        e.add_property_value("ContainerState", json!("Empty"));
        e.add_property_value("ContainerState", json!("Empty"));
        assert_eq!(e.property_values("ContainerState").len(), 1);

        e.remove_property_value("ContainerState", &json!("Empty"));
        assert!(e.has_property("ContainerState"));
        assert!(!e.has_property_value("ContainerState", &json!("Empty")));
    }

    #[test]
    fn test_wildcard_labels() {
        assert!(Element::new("Box").has_wildcard_label());
        assert!(Element::labeled("Box", "Unknown").has_wildcard_label());
        assert!(!Element::labeled("Box", "box_a").has_wildcard_label());
    }

    #[test]
    fn test_relation_template_other_key() {
        let t = RelationTemplate {
            src: RelationEnd::This,
            predicate: "fitsIn".into(),
            dst: RelationEnd::Param("Container".into()),
            state: true,
        };
        assert_eq!(t.other_key(), Some("Container"));
    }
}
