//! Plan tree declared in YAML.

use arbor_core::procedure::Composite;
use serde::Deserialize;
use std::collections::BTreeMap;

/// One node of the plan. Without a `type` the node is a plain group that
/// runs its children with `composite`.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanNodeSpec {
    #[serde(rename = "type", default)]
    pub type_name: Option<String>,
    /// Defaults to `plan` for groups and the lowercased type otherwise.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub composite: Composite,
    #[serde(default)]
    pub latch: bool,
    /// Param key to scene element key.
    #[serde(default)]
    pub specify: BTreeMap<String, String>,
    #[serde(default)]
    pub remap: BTreeMap<String, String>,
    #[serde(default)]
    pub children: Vec<PlanNodeSpec>,
}

impl PlanNodeSpec {
    pub fn is_group(&self) -> bool {
        self.type_name.is_none()
    }

    pub fn label(&self) -> String {
        match (&self.label, &self.type_name) {
            (Some(label), _) => label.clone(),
            (None, Some(type_name)) => type_name.to_lowercase(),
            (None, None) => "plan".to_string(),
        }
    }

    /// This node followed by its descendants, level by level.
    pub fn walk(&self) -> Vec<&PlanNodeSpec> {
        let mut out = vec![self];
        let mut i = 0;
        while i < out.len() {
            let node = out[i];
            out.extend(node.children.iter());
            i += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan() {
        let yaml = r#"
composite: parallel
children:
  - { type: Inspect, label: check_a, specify: { Object: box_a } }
  - label: move
    children:
      - { type: Pick, specify: { Object: box_b } }
      - { type: Place, latch: true }
"#;
        let plan: PlanNodeSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(plan.is_group());
        assert_eq!(plan.label(), "plan");
        assert_eq!(plan.children[0].label(), "check_a");
        assert_eq!(plan.children[1].children[0].label(), "pick");
        assert_eq!(plan.composite, Composite::Parallel);
        assert_eq!(plan.children[0].specify["Object"], "box_a");
        assert_eq!(plan.children[1].composite, Composite::Serial);
        assert!(plan.children[1].children[1].latch);
        assert_eq!(plan.walk().len(), 5);
    }
}
