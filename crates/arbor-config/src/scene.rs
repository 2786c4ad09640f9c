//! Ontology and initial scene.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Type and predicate hierarchies handed to the world model.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OntologyConfig {
    #[serde(default)]
    pub types: Vec<TypeSpec>,
    #[serde(default)]
    pub predicates: Vec<PredicateSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeSpec {
    pub name: String,
    #[serde(default = "default_type_parent")]
    pub parent: String,
}

fn default_type_parent() -> String {
    "Thing".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredicateSpec {
    pub name: String,
    #[serde(default = "default_predicate_parent")]
    pub parent: String,
}

fn default_predicate_parent() -> String {
    "relation".to_string()
}

/// Elements and relations loaded into a freshly reset world model.
#[derive(Debug, Clone, Deserialize)]
pub struct SceneConfig {
    #[serde(default = "default_scene_name")]
    pub name: String,
    #[serde(default)]
    pub elements: Vec<ElementSpec>,
    #[serde(default)]
    pub relations: Vec<RelationSpec>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            name: default_scene_name(),
            elements: Vec::new(),
            relations: Vec::new(),
        }
    }
}

fn default_scene_name() -> String {
    "scene".to_string()
}

impl SceneConfig {
    pub fn element(&self, key: &str) -> Option<&ElementSpec> {
        self.elements.iter().find(|e| e.key == key)
    }

    /// True when `key` names the scene root or a declared element.
    pub fn is_declared(&self, key: &str) -> bool {
        key == ROOT_KEY || self.element(key).is_some()
    }
}

/// Key of the scene root element in `parent` and relation endpoints.
pub const ROOT_KEY: &str = "root";

#[derive(Debug, Clone, Deserialize)]
pub struct ElementSpec {
    /// Name other scene entries refer to this element by.
    pub key: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Defaults to the key.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_parent")]
    pub parent: String,
    #[serde(default = "default_contain")]
    pub predicate: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Vec<Value>>,
}

impl ElementSpec {
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.key)
    }
}

fn default_parent() -> String {
    ROOT_KEY.to_string()
}

fn default_contain() -> String {
    arbor_core::world::CONTAIN.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationSpec {
    pub src: String,
    pub predicate: String,
    pub dst: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_defaults_and_label_fallback() {
        let yaml = r#"
name: lab
elements:
  - { key: box_a, type: Box, properties: { ContainerState: [Empty] } }
  - { key: tray, type: Location, label: tray_1, parent: box_a, predicate: on }
relations:
  - { src: box_a, predicate: fitsIn, dst: tray }
"#;
        let scene: SceneConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(scene.name, "lab");
        let box_a = scene.element("box_a").unwrap();
        assert_eq!(box_a.label(), "box_a");
        assert_eq!(box_a.parent, ROOT_KEY);
        assert_eq!(box_a.predicate, "contain");
        assert_eq!(box_a.properties["ContainerState"], vec![Value::from("Empty")]);
        assert_eq!(scene.element("tray").unwrap().label(), "tray_1");
        assert!(scene.is_declared("root"));
        assert!(!scene.is_declared("shelf"));
    }

    #[test]
    fn test_ontology_parents_default() {
        let yaml = "types: [{ name: Box }]\npredicates: [{ name: fitsIn, parent: spatiallyRelated }]";
        let ontology: OntologyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ontology.types[0].parent, "Thing");
        assert_eq!(ontology.predicates[0].parent, "spatiallyRelated");
    }
}
