//! Derived relations
//!
//! A reasoner computes relations that are not stored as edges (spatial
//! fits, reachability, ...). Reasoners are registered explicitly on the
//! world model and only consulted when both ends of a query are grounded.

use super::element::Element;

pub trait RelationReasoner: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this reasoner computes `predicate`.
    fn handles(&self, predicate: &str) -> bool;

    /// Decide whether `subject --predicate--> object` holds.
    fn derive(&self, subject: &Element, predicate: &str, object: &Element) -> bool;
}
