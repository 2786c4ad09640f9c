//! Type hierarchy oracle
//!
//! The world model never loads an ontology itself. It is handed a
//! `TypeHierarchy` at construction and asks it subclass/subproperty
//! questions during matching.

use std::collections::{HashMap, HashSet};

/// Subclass / subproperty queries backing type and predicate matching.
pub trait TypeHierarchy: Send + Sync {
    /// True when `ty` equals `ancestor` or is (transitively) derived from it.
    fn is_subtype_of(&self, ty: &str, ancestor: &str) -> bool;

    /// True when `predicate` equals `ancestor` or specializes it.
    fn is_subpredicate_of(&self, predicate: &str, ancestor: &str) -> bool;
}

/// In-memory hierarchy built from explicit parent declarations.
#[derive(Debug, Clone, Default)]
pub struct StaticTypeHierarchy {
    type_parents: HashMap<String, Vec<String>>,
    predicate_parents: HashMap<String, Vec<String>>,
}

impl StaticTypeHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&mut self, ty: impl Into<String>, parent: impl Into<String>) -> &mut Self {
        push_unique(&mut self.type_parents, ty.into(), parent.into());
        self
    }

    pub fn add_predicate(
        &mut self,
        predicate: impl Into<String>,
        parent: impl Into<String>,
    ) -> &mut Self {
        push_unique(&mut self.predicate_parents, predicate.into(), parent.into());
        self
    }

    pub fn with_type(mut self, ty: impl Into<String>, parent: impl Into<String>) -> Self {
        self.add_type(ty, parent);
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        self.add_predicate(predicate, parent);
        self
    }

    pub fn type_count(&self) -> usize {
        self.type_parents.len()
    }
}

fn push_unique(map: &mut HashMap<String, Vec<String>>, child: String, parent: String) {
    let parents = map.entry(child).or_default();
    if !parents.contains(&parent) {
        parents.push(parent);
    }
}

fn derives_from(parents: &HashMap<String, Vec<String>>, start: &str, ancestor: &str) -> bool {
    if start == ancestor {
        return true;
    }
    let mut seen = HashSet::new();
    let mut stack = vec![start];
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        for parent in parents.get(current).into_iter().flatten() {
            if parent == ancestor {
                return true;
            }
            stack.push(parent);
        }
    }
    false
}

impl TypeHierarchy for StaticTypeHierarchy {
    fn is_subtype_of(&self, ty: &str, ancestor: &str) -> bool {
        derives_from(&self.type_parents, ty, ancestor)
    }

    fn is_subpredicate_of(&self, predicate: &str, ancestor: &str) -> bool {
        derives_from(&self.predicate_parents, predicate, ancestor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitive_subtypes() {
        let h = StaticTypeHierarchy::new()
            .with_type("Gripper", "Device")
            .with_type("Device", "Thing");
        assert!(h.is_subtype_of("Gripper", "Thing"));
        assert!(h.is_subtype_of("Gripper", "Gripper"));
        assert!(!h.is_subtype_of("Thing", "Gripper"));
    }

    #[test]
    fn test_cyclic_declarations_terminate() {
        let h = StaticTypeHierarchy::new()
            .with_predicate("a", "b")
            .with_predicate("b", "a");
        assert!(h.is_subpredicate_of("a", "b"));
        assert!(!h.is_subpredicate_of("a", "c"));
    }
}
