//! Condition taxonomy
//!
//! Conditions are reusable templates over parameter keys. They are bound
//! to concrete elements through a [`ParamHandler`] at evaluation time and
//! never store element ids themselves.
//!
//! Every mutating call (`set_true`) caches the state it overwrites so that
//! `revert` is its exact inverse. A `revert` without a cached snapshot
//! returns false.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::warn;

use crate::params::{ParamHandler, ParamType, ParamValue};
use crate::world::{
    DetachedElement, Element, ElementId, Relation, RelationEnd, RelationTemplate, WorldModel,
    CONTAIN,
};

/// Label given to elements created by a `Generate` condition when the
/// template has none.
pub const GENERATED_LABEL: &str = "generated";

/// What a condition talks about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionKind {
    /// `subject` has `predicate = value`
    Property {
        subject: String,
        predicate: String,
        value: Value,
    },
    /// `subject --predicate--> object`
    Relation {
        subject: String,
        predicate: String,
        object: String,
    },
    /// `subject` has `predicate` with any value
    HasProperty { subject: String, predicate: String },
    /// `subject` is bound to a world-model node
    IsSpecified { subject: String },
    /// `subject` exists as a world-model node
    Generate { subject: String },
    /// `subject` is of `type_name`
    OnType { subject: String, type_name: String },
}

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("param '{0}' is not an element parameter")]
    NotAnElement(String),
    #[error("subject '{0}' is not grounded")]
    Ungrounded(String),
    #[error("condition {0} does not hold")]
    Unsatisfied(String),
}

#[derive(Debug, Clone, PartialEq)]
enum RevertSnapshot {
    /// Param values and world record of a property change.
    Record {
        values: Vec<ParamValue>,
        record: Element,
    },
    /// Edges ending in `object` before a relation change.
    Edges {
        object: ElementId,
        edges: Vec<Relation>,
    },
    /// Param values before a (un)binding.
    Binding { values: Vec<ParamValue> },
    /// Param values plus the node created or removed.
    Generated {
        values: Vec<ParamValue>,
        created: Option<ElementId>,
        removed: Option<DetachedElement>,
    },
    Marker,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub label: String,
    pub kind: ConditionKind,
    pub desired: bool,
    cache: Option<RevertSnapshot>,
}

impl Condition {
    pub fn new(label: impl Into<String>, kind: ConditionKind, desired: bool) -> Self {
        Self {
            label: label.into(),
            kind,
            desired,
            cache: None,
        }
    }

    pub fn property(
        label: impl Into<String>,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        value: impl Into<Value>,
        desired: bool,
    ) -> Self {
        Self::new(
            label,
            ConditionKind::Property {
                subject: subject.into(),
                predicate: predicate.into(),
                value: value.into(),
            },
            desired,
        )
    }

    pub fn relation(
        label: impl Into<String>,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
        desired: bool,
    ) -> Self {
        Self::new(
            label,
            ConditionKind::Relation {
                subject: subject.into(),
                predicate: predicate.into(),
                object: object.into(),
            },
            desired,
        )
    }

    pub fn has_property(
        label: impl Into<String>,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        desired: bool,
    ) -> Self {
        Self::new(
            label,
            ConditionKind::HasProperty {
                subject: subject.into(),
                predicate: predicate.into(),
            },
            desired,
        )
    }

    pub fn is_specified(label: impl Into<String>, subject: impl Into<String>, desired: bool) -> Self {
        Self::new(
            label,
            ConditionKind::IsSpecified {
                subject: subject.into(),
            },
            desired,
        )
    }

    pub fn generate(label: impl Into<String>, subject: impl Into<String>, desired: bool) -> Self {
        Self::new(
            label,
            ConditionKind::Generate {
                subject: subject.into(),
            },
            desired,
        )
    }

    /// Type filter. Always desired true.
    pub fn on_type(
        label: impl Into<String>,
        subject: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self::new(
            label,
            ConditionKind::OnType {
                subject: subject.into(),
                type_name: type_name.into(),
            },
            true,
        )
    }

    pub fn subject(&self) -> &str {
        match &self.kind {
            ConditionKind::Property { subject, .. }
            | ConditionKind::Relation { subject, .. }
            | ConditionKind::HasProperty { subject, .. }
            | ConditionKind::IsSpecified { subject }
            | ConditionKind::Generate { subject }
            | ConditionKind::OnType { subject, .. } => subject,
        }
    }

    /// Parameter keys this condition reads.
    pub fn keys(&self) -> Vec<&str> {
        match &self.kind {
            ConditionKind::Relation {
                subject, object, ..
            } => vec![subject.as_str(), object.as_str()],
            _ => vec![self.subject()],
        }
    }

    pub fn references(&self, key: &str) -> bool {
        self.keys().contains(&key)
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    pub fn description(&self) -> String {
        match &self.kind {
            ConditionKind::Property {
                subject,
                predicate,
                value,
            } => format!(
                "[{}] {}-{}-{} ({})",
                self.label, subject, predicate, value, self.desired
            ),
            ConditionKind::Relation {
                subject,
                predicate,
                object,
            } => format!(
                "[{}] {}-{}-{} ({})",
                self.label, subject, predicate, object, self.desired
            ),
            ConditionKind::HasProperty { subject, predicate } => {
                format!("[{}] {}-{} ({})", self.label, subject, predicate, self.desired)
            }
            ConditionKind::IsSpecified { subject } | ConditionKind::Generate { subject } => {
                format!("[{}] {} ({})", self.label, subject, self.desired)
            }
            ConditionKind::OnType { subject, type_name } => {
                format!("[{}] {}-{}", self.label, subject, type_name)
            }
        }
    }

    /// Same template and desired state. Labels and caches are ignored.
    pub fn is_equal(&self, other: &Condition) -> bool {
        self.kind == other.kind && self.desired == other.desired
    }

    /// Rename a parameter key.
    pub fn remap(&mut self, from: &str, to: &str) {
        match &mut self.kind {
            ConditionKind::Relation {
                subject, object, ..
            } => {
                if subject == from {
                    *subject = to.to_string();
                } else if object == from {
                    *object = to.to_string();
                }
            }
            ConditionKind::Property { subject, .. }
            | ConditionKind::HasProperty { subject, .. }
            | ConditionKind::IsSpecified { subject }
            | ConditionKind::Generate { subject }
            | ConditionKind::OnType { subject, .. } => {
                if subject == from {
                    *subject = to.to_string();
                }
            }
        }
    }

    // ============ Evaluation ============

    pub fn evaluate(&self, params: &ParamHandler, wm: &WorldModel) -> bool {
        self.diagnose(params, wm).is_ok()
    }

    /// Like [`Condition::evaluate`], reporting why the condition fails.
    pub fn diagnose(&self, params: &ParamHandler, wm: &WorldModel) -> Result<(), ConditionError> {
        let key = self.subject();
        let subject = current(params, wm, key)?;
        let holds = match &self.kind {
            ConditionKind::Property {
                predicate, value, ..
            } => {
                if !subject.is_grounded() {
                    return optional_or_ungrounded(params, key);
                }
                subject.has_property_value(predicate, value) == self.desired
            }
            ConditionKind::Relation {
                predicate, object, ..
            } => {
                let target = current(params, wm, object)?;
                if !subject.is_grounded() || !target.is_grounded() {
                    let optional = (!subject.is_grounded() && is_optional(params, key))
                        || (!target.is_grounded() && is_optional(params, object));
                    if optional {
                        return Ok(());
                    }
                    let missing = if subject.is_grounded() {
                        object.as_str()
                    } else {
                        key
                    };
                    return Err(ConditionError::Ungrounded(missing.to_string()));
                }
                wm.has_relation(subject.id, predicate, target.id) == self.desired
            }
            ConditionKind::HasProperty { predicate, .. } => {
                if !subject.is_grounded() {
                    return optional_or_ungrounded(params, key);
                }
                subject.has_property(predicate) == self.desired
            }
            ConditionKind::IsSpecified { .. } => subject.is_grounded() == self.desired,
            ConditionKind::Generate { .. } => {
                let exists = subject.is_grounded() && wm.contains(subject.id);
                exists == self.desired
            }
            ConditionKind::OnType { type_name, .. } => wm.is_of_type(&subject, type_name),
        };
        if holds {
            Ok(())
        } else {
            Err(ConditionError::Unsatisfied(self.description()))
        }
    }

    // ============ Effects ============

    /// Mutate world model and params so the condition holds.
    pub fn set_true(&mut self, params: &mut ParamHandler, wm: &mut WorldModel) -> bool {
        let key = self.subject().to_string();
        let Ok(subject) = current(params, wm, &key) else {
            return false;
        };
        let Some(values) = params.get(&key).map(|p| p.values().to_vec()) else {
            return false;
        };
        let desired = self.desired;

        let snapshot = match &self.kind {
            ConditionKind::Property {
                predicate, value, ..
            } => {
                if !subject.is_grounded() || !wm.contains(subject.id) {
                    return false;
                }
                let mut updated = subject.clone();
                if desired {
                    updated.add_property_value(predicate.clone(), value.clone());
                } else {
                    updated.remove_property_value(predicate, value);
                }
                if !commit_record(params, wm, &key, updated) {
                    return false;
                }
                RevertSnapshot::Record {
                    values,
                    record: subject,
                }
            }
            ConditionKind::HasProperty { predicate, .. } => {
                if !subject.is_grounded() || !wm.contains(subject.id) {
                    return false;
                }
                let mut updated = subject.clone();
                if desired {
                    updated.touch_property(predicate.clone());
                } else {
                    updated.remove_property(predicate);
                }
                if !commit_record(params, wm, &key, updated) {
                    return false;
                }
                RevertSnapshot::Record {
                    values,
                    record: subject,
                }
            }
            ConditionKind::Relation {
                predicate, object, ..
            } => {
                let Ok(target) = current(params, wm, object) else {
                    return false;
                };
                if !subject.is_grounded() || !target.is_grounded() {
                    return false;
                }
                let edges = wm.relations_into(target.id);
                if wm
                    .set_relation(subject.id, predicate, target.id, desired)
                    .is_err()
                {
                    return false;
                }
                RevertSnapshot::Edges {
                    object: target.id,
                    edges,
                }
            }
            ConditionKind::IsSpecified { .. } => {
                if subject.is_grounded() != desired {
                    if desired {
                        return false;
                    }
                    if params.specify(&key, subject.unbound()).is_err() {
                        return false;
                    }
                }
                RevertSnapshot::Binding { values }
            }
            ConditionKind::Generate { .. } => {
                let exists = subject.is_grounded() && wm.contains(subject.id);
                if desired && !exists {
                    let mut fresh = subject.unbound();
                    fresh.relations.clear();
                    if fresh.has_wildcard_label() {
                        fresh.label = GENERATED_LABEL.to_string();
                    }
                    let Ok(id) = wm.add_element(&fresh, WorldModel::root_id(), CONTAIN) else {
                        return false;
                    };
                    if params.specify(&key, fresh.with_id(id)).is_err() {
                        if let Err(err) = wm.remove_element(id) {
                            warn!(condition = %self.description(), error = %err, "rollback could not remove generated element");
                        }
                        return false;
                    }
                    RevertSnapshot::Generated {
                        values,
                        created: Some(id),
                        removed: None,
                    }
                } else if !desired && subject.is_grounded() {
                    let removed = if exists {
                        match wm.detach_element(subject.id) {
                            Ok(detached) => Some(detached),
                            Err(_) => return false,
                        }
                    } else {
                        None
                    };
                    if params.specify(&key, subject.unbound()).is_err() {
                        if let Some(detached) = &removed {
                            if let Err(err) = wm.restore_element(detached) {
                                warn!(condition = %self.description(), error = %err, "rollback could not restore element");
                            }
                        }
                        return false;
                    }
                    RevertSnapshot::Generated {
                        values,
                        created: None,
                        removed,
                    }
                } else {
                    RevertSnapshot::Generated {
                        values,
                        created: None,
                        removed: None,
                    }
                }
            }
            ConditionKind::OnType { .. } => RevertSnapshot::Marker,
        };
        self.cache = Some(snapshot);
        true
    }

    /// Restore the state cached by the last `set_true`.
    pub fn revert(&mut self, params: &mut ParamHandler, wm: &mut WorldModel) -> bool {
        let Some(snapshot) = self.cache.take() else {
            warn!(condition = %self.description(), "revert without commit");
            return false;
        };
        let key = self.subject().to_string();
        match snapshot {
            RevertSnapshot::Record { values, record } => {
                restore_values(params, &key, values);
                if let Err(err) = wm.update_element(&record) {
                    warn!(condition = %self.description(), error = %err, "revert could not restore record");
                }
            }
            RevertSnapshot::Edges { object, edges } => {
                wm.replace_relations_into(object, &edges);
            }
            RevertSnapshot::Binding { values } => {
                restore_values(params, &key, values);
            }
            RevertSnapshot::Generated {
                values,
                created,
                removed,
            } => {
                if let Some(id) = created {
                    if let Err(err) = wm.remove_element(id) {
                        warn!(condition = %self.description(), error = %err, "revert could not remove generated element");
                    }
                }
                if let Some(detached) = removed {
                    if let Err(err) = wm.restore_element(&detached) {
                        warn!(condition = %self.description(), error = %err, "revert could not restore element");
                    }
                }
                restore_values(params, &key, values);
            }
            RevertSnapshot::Marker => {}
        }
        true
    }

    /// Encode the requirement on an ungrounded template so the resolver
    /// can use it.
    pub fn set_desired_state(&self, params: &mut ParamHandler) {
        let desired = self.desired;
        match &self.kind {
            ConditionKind::Property {
                subject,
                predicate,
                value,
            } => {
                if let Some(e) = unbound_template(params, subject) {
                    if desired {
                        e.add_property_value(predicate.clone(), value.clone());
                    } else {
                        e.remove_property_value(predicate, value);
                    }
                }
            }
            ConditionKind::HasProperty { subject, predicate } => {
                if let Some(e) = unbound_template(params, subject) {
                    if desired {
                        e.touch_property(predicate.clone());
                    } else {
                        e.remove_property(predicate);
                    }
                }
            }
            ConditionKind::Relation {
                subject,
                predicate,
                object,
            } => {
                if let Some(e) = unbound_template(params, subject) {
                    e.add_relation(RelationTemplate {
                        src: RelationEnd::This,
                        predicate: predicate.clone(),
                        dst: RelationEnd::Param(object.clone()),
                        state: desired,
                    });
                }
                if let Some(e) = unbound_template(params, object) {
                    e.add_relation(RelationTemplate {
                        src: RelationEnd::Param(subject.clone()),
                        predicate: predicate.clone(),
                        dst: RelationEnd::This,
                        state: desired,
                    });
                }
            }
            ConditionKind::OnType { subject, type_name } => {
                if let Some(e) = unbound_template(params, subject) {
                    e.kind = type_name.clone();
                }
            }
            ConditionKind::IsSpecified { .. } | ConditionKind::Generate { .. } => {}
        }
    }

    /// Opposite desired states over the same subject (and predicate,
    /// value or object where the variant has one).
    pub fn has_conflict(
        &self,
        own_params: &ParamHandler,
        other: &Condition,
        other_params: &ParamHandler,
    ) -> bool {
        if self.desired == other.desired {
            return false;
        }
        let same = |a: &str, b: &str| same_subject(own_params, a, other_params, b);
        match (&self.kind, &other.kind) {
            (
                ConditionKind::Property {
                    subject: s1,
                    predicate: p1,
                    value: v1,
                },
                ConditionKind::Property {
                    subject: s2,
                    predicate: p2,
                    value: v2,
                },
            ) => p1 == p2 && v1 == v2 && same(s1, s2),
            (
                ConditionKind::Relation {
                    subject: s1,
                    predicate: p1,
                    object: o1,
                },
                ConditionKind::Relation {
                    subject: s2,
                    predicate: p2,
                    object: o2,
                },
            ) => p1 == p2 && same(s1, s2) && same(o1, o2),
            (
                ConditionKind::HasProperty {
                    subject: s1,
                    predicate: p1,
                },
                ConditionKind::HasProperty {
                    subject: s2,
                    predicate: p2,
                },
            ) => p1 == p2 && same(s1, s2),
            (
                ConditionKind::IsSpecified { subject: s1 },
                ConditionKind::IsSpecified { subject: s2 },
            )
            | (ConditionKind::Generate { subject: s1 }, ConditionKind::Generate { subject: s2 }) => {
                same(s1, s2)
            }
            _ => false,
        }
    }
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// The subject bound to `key`, refreshed from the world model when grounded.
fn current(params: &ParamHandler, wm: &WorldModel, key: &str) -> Result<Element, ConditionError> {
    let template = params
        .template(key)
        .ok_or_else(|| ConditionError::NotAnElement(key.to_string()))?;
    if template.is_grounded() {
        if let Some(record) = wm.get_element(template.id) {
            return Ok(record);
        }
    }
    Ok(template.clone())
}

fn is_optional(params: &ParamHandler, key: &str) -> bool {
    params.param_type(key) == Some(ParamType::Optional)
}

fn optional_or_ungrounded(params: &ParamHandler, key: &str) -> Result<(), ConditionError> {
    if is_optional(params, key) {
        Ok(())
    } else {
        Err(ConditionError::Ungrounded(key.to_string()))
    }
}

/// Both grounded to the same node, or the same key when either is not.
fn same_subject(a_params: &ParamHandler, a: &str, b_params: &ParamHandler, b: &str) -> bool {
    let a_id = a_params.template(a).map(|e| e.id).unwrap_or_default();
    let b_id = b_params.template(b).map(|e| e.id).unwrap_or_default();
    if a_id.is_grounded() && b_id.is_grounded() {
        a_id == b_id
    } else {
        a == b
    }
}

fn unbound_template<'a>(params: &'a mut ParamHandler, key: &str) -> Option<&'a mut Element> {
    params
        .get_mut(key)
        .and_then(|p| p.element_mut())
        .filter(|e| !e.is_grounded())
}

fn commit_record(params: &mut ParamHandler, wm: &mut WorldModel, key: &str, record: Element) -> bool {
    if params.specify(key, record.clone()).is_err() {
        return false;
    }
    wm.update_element(&record).is_ok()
}

fn restore_values(params: &mut ParamHandler, key: &str, values: Vec<ParamValue>) {
    if let Err(err) = params.specify_values(key, values) {
        warn!(key = %key, error = %err, "revert could not restore param");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::StaticTypeHierarchy;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        wm: WorldModel,
        params: ParamHandler,
        gripper: ElementId,
        box_a: ElementId,
    }

    fn fixture() -> Fixture {
        let types = StaticTypeHierarchy::new().with_type("Box", "Container");
        let mut wm = WorldModel::new(Arc::new(types));
        wm.reset("test");
        let gripper = wm
            .add_element(
                &Element::labeled("Gripper", "rq3").with_property("ContainerState", json!("Empty")),
                ElementId(0),
                CONTAIN,
            )
            .unwrap();
        let box_a = wm
            .add_element(&Element::labeled("Box", "a"), ElementId(0), CONTAIN)
            .unwrap();
        let mut params = ParamHandler::new();
        params.add_param(
            "Gripper",
            ParamValue::Element(Element::new("Gripper").with_id(gripper)),
            ParamType::Online,
        );
        params.add_param(
            "Object",
            ParamValue::Element(Element::new("Box").with_id(box_a)),
            ParamType::Online,
        );
        params.add_param(
            "Target",
            ParamValue::Element(Element::new("Box")),
            ParamType::Optional,
        );
        Fixture {
            wm,
            params,
            gripper,
            box_a,
        }
    }

    fn round_trip(mut condition: Condition) {
        let mut f = fixture();
        let world_before = f.wm.snapshot();
        let params_before = f.params.clone();

        assert!(condition.set_true(&mut f.params, &mut f.wm));
        assert!(condition.evaluate(&f.params, &f.wm), "{condition}");
        assert!(condition.revert(&mut f.params, &mut f.wm));

        assert_eq!(f.wm.snapshot(), world_before, "{condition}");
        assert_eq!(f.params, params_before, "{condition}");
        assert!(!condition.revert(&mut f.params, &mut f.wm));
    }

    #[test]
    fn test_property_round_trip() {
        round_trip(Condition::property("full", "Gripper", "ContainerState", "Full", true));
        round_trip(Condition::property("empty", "Gripper", "ContainerState", "Empty", false));
    }

    #[test]
    fn test_relation_round_trip_restores_container() {
        round_trip(Condition::relation("grasp", "Gripper", CONTAIN, "Object", true));
        round_trip(Condition::relation("fits", "Object", "fitsIn", "Gripper", true));
    }

    #[test]
    fn test_has_property_and_specified_round_trip() {
        round_trip(Condition::has_property("state", "Object", "ContainerState", true));
        round_trip(Condition::has_property("state", "Gripper", "ContainerState", false));
        round_trip(Condition::is_specified("unset", "Object", false));
    }

    #[test]
    fn test_generate_round_trip() {
        round_trip(Condition::generate("consume", "Object", false));
        round_trip(Condition::generate("make", "Target", true));
    }

    #[test]
    fn test_generate_creates_under_root() {
        let mut f = fixture();
        let mut make = Condition::generate("make", "Target", true);
        assert!(make.set_true(&mut f.params, &mut f.wm));

        let id = f.params.element("Target").unwrap().id;
        let created = f.wm.get_element(id).unwrap();
        assert_eq!(created.label, GENERATED_LABEL);
        assert_eq!(f.wm.get_parent(id).map(|p| p.id), Some(WorldModel::root_id()));
    }

    #[test]
    fn test_revert_generate_after_external_removal() {
        let mut f = fixture();
        let params_before = f.params.clone();
        let mut make = Condition::generate("make", "Target", true);
        assert!(make.set_true(&mut f.params, &mut f.wm));
        let id = f.params.element("Target").unwrap().id;
        f.wm.remove_element(id).unwrap();

        assert!(make.revert(&mut f.params, &mut f.wm));
        assert!(!f.wm.contains(id));
        assert_eq!(f.params, params_before);
    }

    #[test]
    fn test_ungrounded_subjects() {
        let f = fixture();
        let optional = Condition::property("p", "Target", "ContainerState", "Empty", true);
        assert!(optional.evaluate(&f.params, &f.wm));

        let mut params = f.params.clone();
        params.add_param("Other", ParamValue::Element(Element::new("Box")), ParamType::Online);
        let mut mandatory = Condition::property("p", "Other", "ContainerState", "Empty", true);
        let mut wm = f.wm;
        assert!(!mandatory.evaluate(&params, &wm));
        assert!(!mandatory.set_true(&mut params, &mut wm));
        assert!(!mandatory.has_cache());
    }

    #[test]
    fn test_on_type_uses_hierarchy() {
        let f = fixture();
        assert!(Condition::on_type("t", "Object", "Container").evaluate(&f.params, &f.wm));
        assert!(!Condition::on_type("t", "Gripper", "Container").evaluate(&f.params, &f.wm));
    }

    #[test]
    fn test_relation_conflict_requires_opposite_states() {
        let f = fixture();
        let held = Condition::relation("held", "Gripper", CONTAIN, "Object", true);
        let released = Condition::relation("released", "Gripper", CONTAIN, "Object", false);

        assert!(held.has_conflict(&f.params, &released, &f.params));
        assert!(!held.has_conflict(&f.params, &held.clone(), &f.params));

        let mut other = ParamHandler::new();
        other.add_param(
            "Hand",
            ParamValue::Element(Element::new("Gripper").with_id(f.gripper)),
            ParamType::Online,
        );
        other.add_param(
            "Thing",
            ParamValue::Element(Element::new("Box").with_id(f.box_a)),
            ParamType::Online,
        );
        let renamed = Condition::relation("released", "Hand", CONTAIN, "Thing", false);
        assert!(held.has_conflict(&f.params, &renamed, &other));
    }

    #[test]
    fn test_set_desired_state_builds_relation_templates() {
        let mut params = ParamHandler::new();
        params.add_param("x", ParamValue::Element(Element::new("Box")), ParamType::Online);
        params.add_param("y", ParamValue::Element(Element::new("Box")), ParamType::Online);

        Condition::relation("fits", "x", "fitsIn", "y", true).set_desired_state(&mut params);
        Condition::property("empty", "y", "ContainerState", "Empty", true)
            .set_desired_state(&mut params);

        let x = params.element("x").unwrap();
        let y = params.element("y").unwrap();
        assert_eq!(x.relations[0].other_key(), Some("y"));
        assert_eq!(y.relations[0].other_key(), Some("x"));
        assert!(y.has_property_value("ContainerState", &json!("Empty")));
    }
}
