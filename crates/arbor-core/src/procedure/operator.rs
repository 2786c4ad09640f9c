//! Built-in parameter operators.
//!
//! Operators act only on the node's own params. They are remapped onto
//! the parent's keys like any other node, so `execute` receives a resolver
//! from declared key to current key.

use tracing::warn;

use crate::params::{ParamHandler, ParamType, ParamValue};
use crate::world::Element;

pub const OPERATOR_TYPE: &str = "Function";

#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    /// Exchange the values of `Left` and `Right`
    Swap,
    /// Overwrite `To` with the values of `From`
    Copy { previous: Option<Vec<ParamValue>> },
}

impl Operator {
    pub fn swap() -> Self {
        Operator::Swap
    }

    pub fn copy() -> Self {
        Operator::Copy { previous: None }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Operator::Swap => "swap",
            Operator::Copy { .. } => "copy",
        }
    }

    pub fn keys(&self) -> (&'static str, &'static str) {
        match self {
            Operator::Swap => ("Left", "Right"),
            Operator::Copy { .. } => ("From", "To"),
        }
    }

    /// Params every operator node starts with.
    pub fn declare(&self) -> ParamHandler {
        let (first, second) = self.keys();
        let mut params = ParamHandler::new();
        for key in [first, second] {
            params.add_param(key, Element::new("Thing").into(), ParamType::Online);
        }
        params
    }

    pub fn execute(&mut self, params: &mut ParamHandler, resolve: impl Fn(&str) -> String) -> bool {
        let (first, second) = self.keys();
        let (first, second) = (resolve(first), resolve(second));
        let (Some(a), Some(b)) = (values(params, &first), values(params, &second)) else {
            warn!(operator = self.label(), "operator keys are not in the param map");
            return false;
        };
        match self {
            Operator::Swap => {
                params.specify_values(&first, b).is_ok() && params.specify_values(&second, a).is_ok()
            }
            Operator::Copy { previous } => {
                if params.specify_values(&second, a).is_err() {
                    return false;
                }
                *previous = Some(b);
                true
            }
        }
    }

    pub fn revert_execute(
        &mut self,
        params: &mut ParamHandler,
        resolve: impl Fn(&str) -> String,
    ) -> bool {
        match self {
            Operator::Swap => self.execute(params, resolve),
            Operator::Copy { previous } => {
                let Some(old) = previous.take() else {
                    warn!(operator = "copy", "revert without execute");
                    return false;
                };
                let to = resolve("To");
                params.specify_values(&to, old).is_ok()
            }
        }
    }
}

fn values(params: &ParamHandler, key: &str) -> Option<Vec<ParamValue>> {
    params.get(key).map(|p| p.values().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParamHandler {
        let mut params = ParamHandler::new();
        params.add_param("Hand", Element::new("Gripper").with_id(1).into(), ParamType::Online);
        params.add_param("Tool", Element::new("Gripper").with_id(2).into(), ParamType::Online);
        params
    }

    fn remapped(key: &str) -> String {
        match key {
            "Left" | "From" => "Hand".to_string(),
            "Right" | "To" => "Tool".to_string(),
            other => other.to_string(),
        }
    }

    #[test]
    fn test_swap_is_its_own_inverse() {
        let mut ph = params();
        let mut op = Operator::swap();
        assert!(op.execute(&mut ph, remapped));
        assert_eq!(ph.element("Hand").unwrap().id.0, 2);
        assert!(op.revert_execute(&mut ph, remapped));
        assert_eq!(ph, params());
    }

    #[test]
    fn test_copy_restores_previous_values() {
        let mut ph = params();
        let mut op = Operator::copy();
        assert!(op.execute(&mut ph, remapped));
        assert_eq!(ph.element("Tool").unwrap().id.0, 1);
        assert!(op.revert_execute(&mut ph, remapped));
        assert_eq!(ph, params());
        assert!(!op.revert_execute(&mut ph, remapped));
    }
}
