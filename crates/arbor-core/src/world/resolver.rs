//! Constraint-join resolver
//!
//! Every requested key first gets its independent candidate set from
//! [`WorldModel::resolve_element`]. Each relation template attached to a
//! parameter template then becomes a pair table holding only the
//! `(subject, object)` combinations for which the edge actually exists
//! (or is absent, for negative templates). Tables sharing a key are
//! natural-joined until no two tables overlap.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use super::element::{Element, ElementId, RelationEnd};
use super::{WorldModel, WorldModelError};
use crate::params::{ParamHandler, ParamType};

/// Jointly resolved keys and their valid bindings, one row per binding.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedGroup {
    pub keys: Vec<String>,
    pub rows: Vec<Vec<Element>>,
}

impl ResolvedGroup {
    fn single(key: &str, candidates: Vec<Element>) -> Self {
        Self {
            keys: vec![key.to_string()],
            rows: candidates.into_iter().map(|e| vec![e]).collect(),
        }
    }

    pub fn column(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// `(key, element)` pairs of one row.
    pub fn bindings(&self, row: usize) -> Vec<(&str, &Element)> {
        match self.rows.get(row) {
            Some(values) => self
                .keys
                .iter()
                .map(String::as_str)
                .zip(values.iter())
                .collect(),
            None => Vec::new(),
        }
    }

    fn shares_key(&self, other: &ResolvedGroup) -> bool {
        self.keys.iter().any(|k| other.keys.contains(k))
    }

    /// Natural join on the shared keys, matching by element id.
    fn join(&self, other: &ResolvedGroup) -> ResolvedGroup {
        let shared: Vec<(usize, usize)> = self
            .keys
            .iter()
            .enumerate()
            .filter_map(|(i, k)| other.column(k).map(|j| (i, j)))
            .collect();
        let extra: Vec<usize> = (0..other.keys.len())
            .filter(|j| !shared.iter().any(|(_, s)| s == j))
            .collect();

        let mut keys = self.keys.clone();
        keys.extend(extra.iter().map(|&j| other.keys[j].clone()));

        let mut rows = Vec::new();
        for left in &self.rows {
            for right in &other.rows {
                if shared.iter().all(|&(i, j)| left[i].id == right[j].id) {
                    let mut row = left.clone();
                    row.extend(extra.iter().map(|&j| right[j].clone()));
                    rows.push(row);
                }
            }
        }
        ResolvedGroup { keys, rows }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PairConstraint {
    subject: String,
    predicate: String,
    object: String,
    state: bool,
}

/// Relation templates of every parameter, each counted once even when
/// mirrored on both ends.
fn collect_constraints(params: &ParamHandler) -> Vec<PairConstraint> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (key, param) in params.iter() {
        let Some(template) = param.element() else {
            continue;
        };
        for relation in &template.relations {
            let (subject, object) = match (&relation.src, &relation.dst) {
                (RelationEnd::This, RelationEnd::Param(other)) => (key.clone(), other.clone()),
                (RelationEnd::Param(other), RelationEnd::This) => (other.clone(), key.clone()),
                _ => continue,
            };
            if subject == object {
                continue;
            }
            let constraint = PairConstraint {
                subject,
                predicate: relation.predicate.clone(),
                object,
                state: relation.state,
            };
            if seen.insert(constraint.clone()) {
                out.push(constraint);
            }
        }
    }
    out
}

impl WorldModel {
    /// Resolve `keys` jointly against the graph.
    ///
    /// Optional keys that resolve to nothing are left out of the result.
    /// Any other key without candidates is reported as an empty group.
    pub fn resolve_elements(
        &self,
        keys: &[String],
        params: &ParamHandler,
    ) -> Result<Vec<ResolvedGroup>, WorldModelError> {
        let mut candidates: BTreeMap<String, Vec<Element>> = BTreeMap::new();
        for key in keys {
            match params.template(key) {
                Some(template) => {
                    candidates.insert(key.clone(), self.resolve_element(template));
                }
                None => warn!(key = %key, "resolve: key is not an element parameter"),
            }
        }

        let mut groups: Vec<ResolvedGroup> = Vec::new();
        for constraint in collect_constraints(params) {
            let (Some(subject), Some(object)) = (
                params.template(&constraint.subject),
                params.template(&constraint.object),
            ) else {
                continue;
            };
            if subject.is_grounded() && object.is_grounded() {
                continue;
            }
            let Some(left) = self.side(&constraint.subject, params, &mut candidates) else {
                continue;
            };
            let Some(right) = self.side(&constraint.object, params, &mut candidates) else {
                continue;
            };
            let mut rows = Vec::new();
            for a in &left {
                let targets = self.targets(a.id, &constraint.predicate);
                for b in &right {
                    if a.id == b.id {
                        continue;
                    }
                    let related = match &targets {
                        Some(targets) => targets.contains(&b.id),
                        None => self.has_relation(a.id, &constraint.predicate, b.id),
                    };
                    if related == constraint.state {
                        rows.push(vec![a.clone(), b.clone()]);
                    }
                }
            }
            debug!(
                subject = %constraint.subject,
                predicate = %constraint.predicate,
                object = %constraint.object,
                pairs = rows.len(),
                "resolve: relation pairs"
            );
            groups.push(ResolvedGroup {
                keys: vec![constraint.subject, constraint.object],
                rows,
            });
        }

        let mut passes = 0;
        while let Some((i, _)) = first_overlap(&groups) {
            passes += 1;
            if passes > self.max_overlap_merges() {
                return Err(WorldModelError::ResolverOverlapOverflow {
                    keys: groups[i].keys.clone(),
                    merges: self.max_overlap_merges(),
                });
            }
            merge_pass(&mut groups);
        }

        let mut out: Vec<ResolvedGroup> = groups
            .into_iter()
            .filter(|g| g.keys.iter().any(|k| keys.contains(k)))
            .collect();
        for key in keys {
            if out.iter().any(|g| g.column(key).is_some()) {
                continue;
            }
            let Some(found) = candidates.remove(key) else {
                continue;
            };
            if found.is_empty() && params.param_type(key) == Some(ParamType::Optional) {
                continue;
            }
            out.push(ResolvedGroup::single(key, found));
        }
        Ok(out)
    }

    /// Ids reached from `src` over stored `predicate` edges. `None` when a
    /// reasoner derives the predicate and pairs must be checked one by one.
    fn targets(&self, src: ElementId, predicate: &str) -> Option<HashSet<ElementId>> {
        if self.reasoners.iter().any(|r| r.handles(predicate)) {
            return None;
        }
        Some(
            self.get_relations(src, predicate, ElementId::UNBOUND)
                .into_iter()
                .map(|edge| edge.dst)
                .collect(),
        )
    }

    /// Candidate list for one end of a pair constraint. `None` skips the
    /// constraint.
    fn side(
        &self,
        key: &str,
        params: &ParamHandler,
        candidates: &mut BTreeMap<String, Vec<Element>>,
    ) -> Option<Vec<Element>> {
        let template = params.template(key)?;
        if template.is_grounded() {
            let current = self
                .get_element(template.id)
                .unwrap_or_else(|| template.clone());
            return Some(vec![current]);
        }
        if params.param_type(key) == Some(ParamType::Optional) {
            return None;
        }
        let found = candidates
            .entry(key.to_string())
            .or_insert_with(|| self.resolve_element(template));
        Some(found.clone())
    }
}

/// Join every group into the first earlier group it overlaps with.
fn merge_pass(groups: &mut Vec<ResolvedGroup>) {
    let mut i = 0;
    while i < groups.len() {
        let mut j = i + 1;
        while j < groups.len() {
            if groups[i].shares_key(&groups[j]) {
                let right = groups.remove(j);
                groups[i] = groups[i].join(&right);
                debug!(keys = ?groups[i].keys, rows = groups[i].rows.len(), "resolve: merged overlap");
            } else {
                j += 1;
            }
        }
        i += 1;
    }
}

fn first_overlap(groups: &[ResolvedGroup]) -> Option<(usize, usize)> {
    for i in 0..groups.len() {
        for j in (i + 1)..groups.len() {
            if groups[i].shares_key(&groups[j]) {
                return Some((i, j));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;
    use crate::world::{ElementId, RelationTemplate, StaticTypeHierarchy, CONTAIN};
    use std::sync::Arc;

    fn world() -> (WorldModel, ElementId, ElementId) {
        let mut wm = WorldModel::new(Arc::new(StaticTypeHierarchy::new()));
        wm.reset("test");
        let a = wm
            .add_element(&Element::labeled("Box", "a"), ElementId(0), CONTAIN)
            .unwrap();
        let b = wm
            .add_element(&Element::labeled("Box", "b"), ElementId(0), CONTAIN)
            .unwrap();
        wm.set_relation(a, "fitsIn", b, true).unwrap();
        (wm, a, b)
    }

    fn fits_in(x_is_subject: bool, other: &str) -> RelationTemplate {
        if x_is_subject {
            RelationTemplate {
                src: RelationEnd::This,
                predicate: "fitsIn".into(),
                dst: RelationEnd::Param(other.into()),
                state: true,
            }
        } else {
            RelationTemplate {
                src: RelationEnd::Param(other.into()),
                predicate: "fitsIn".into(),
                dst: RelationEnd::This,
                state: true,
            }
        }
    }

    fn handler() -> ParamHandler {
        let mut x = Element::new("Box");
        x.add_relation(fits_in(true, "y"));
        let mut y = Element::new("Box");
        y.add_relation(fits_in(false, "x"));
        let mut ph = ParamHandler::new();
        ph.add_param("x", ParamValue::Element(x), ParamType::Online);
        ph.add_param("y", ParamValue::Element(y), ParamType::Online);
        ph
    }

    #[test]
    fn test_relation_constraint_yields_only_existing_pair() {
        let (wm, a, b) = world();
        let keys = vec!["x".to_string(), "y".to_string()];

        let groups = wm.resolve_elements(&keys, &handler()).unwrap();

        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.rows.len(), 1);
        let x = group.column("x").unwrap();
        let y = group.column("y").unwrap();
        assert_eq!(group.rows[0][x].id, a);
        assert_eq!(group.rows[0][y].id, b);
    }

    #[test]
    fn test_unconstrained_keys_keep_independent_candidates() {
        let (wm, _, _) = world();
        let mut ph = ParamHandler::new();
        ph.add_param("x", ParamValue::Element(Element::new("Box")), ParamType::Online);
        ph.add_param(
            "tool",
            ParamValue::Element(Element::new("Gripper")),
            ParamType::Optional,
        );

        let groups = wm
            .resolve_elements(&["x".to_string(), "tool".to_string()], &ph)
            .unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].keys, vec!["x".to_string()]);
        assert_eq!(groups[0].rows.len(), 2);
    }

    #[test]
    fn test_overlapping_constraints_are_joined() {
        let (mut wm, a, b) = world();
        let c = wm
            .add_element(&Element::labeled("Box", "c"), ElementId(0), CONTAIN)
            .unwrap();
        wm.set_relation(b, "fitsIn", c, true).unwrap();

        let mut x = Element::new("Box");
        x.add_relation(fits_in(true, "y"));
        let mut y = Element::new("Box");
        y.add_relation(fits_in(true, "z"));
        let mut ph = handler();
        ph.add_param("x", ParamValue::Element(x), ParamType::Online);
        ph.add_param("y", ParamValue::Element(y), ParamType::Online);
        ph.add_param("z", ParamValue::Element(Element::new("Box")), ParamType::Online);
        let keys = vec!["x".to_string(), "y".to_string(), "z".to_string()];

        let groups = wm.resolve_elements(&keys, &ph).unwrap();

        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.rows.len(), 1);
        let ids: Vec<ElementId> = ["x", "y", "z"]
            .iter()
            .map(|k| group.rows[0][group.column(k).unwrap()].id)
            .collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[test]
    fn test_long_constraint_chain_within_bound() {
        let (wm, _, _) = world();
        let wm = wm.with_max_overlap_merges(2);
        let keys: Vec<String> = (0..12).map(|i| format!("k{i:02}")).collect();
        let mut ph = ParamHandler::new();
        for (i, key) in keys.iter().enumerate() {
            let mut element = Element::new("Box");
            if let Some(next) = keys.get(i + 1) {
                element.add_relation(fits_in(true, next));
            }
            ph.add_param(key, ParamValue::Element(element), ParamType::Online);
        }

        let groups = wm.resolve_elements(&keys, &ph).unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].keys.len(), keys.len());
        assert!(groups[0].rows.is_empty());
    }

    #[test]
    fn test_negative_constraint_keeps_unrelated_pairs() {
        let (wm, a, b) = world();
        let mut x = Element::new("Box");
        x.add_relation(RelationTemplate {
            state: false,
            ..fits_in(true, "y")
        });
        let mut ph = ParamHandler::new();
        ph.add_param("x", ParamValue::Element(x), ParamType::Online);
        ph.add_param("y", ParamValue::Element(Element::new("Box")), ParamType::Online);

        let groups = wm
            .resolve_elements(&["x".to_string(), "y".to_string()], &ph)
            .unwrap();

        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        let pairs: Vec<(ElementId, ElementId)> = group
            .rows
            .iter()
            .map(|row| (row[group.column("x").unwrap()].id, row[group.column("y").unwrap()].id))
            .collect();
        assert_eq!(pairs, vec![(b, a)]);
    }

    #[test]
    fn test_overlap_bound_is_enforced() {
        let (wm, _, _) = world();
        let wm = wm.with_max_overlap_merges(0);
        let mut x = Element::new("Box");
        x.add_relation(fits_in(true, "y"));
        let mut y = Element::new("Box");
        y.add_relation(fits_in(true, "z"));
        let mut ph = ParamHandler::new();
        ph.add_param("x", ParamValue::Element(x), ParamType::Online);
        ph.add_param("y", ParamValue::Element(y), ParamType::Online);
        ph.add_param("z", ParamValue::Element(Element::new("Box")), ParamType::Online);

        let err = wm.resolve_elements(&["x".to_string()], &ph);
        assert!(matches!(
            err,
            Err(WorldModelError::ResolverOverlapOverflow { .. })
        ));
    }
}
