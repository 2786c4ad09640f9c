//! Procedure node: params, conditions and execution caches of one tree node.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::description::ProcedureDescription;
use super::operator::{Operator, OPERATOR_TYPE};
use super::signal::{NodeHandle, NodeSignals, NodeState, PreemptFlag};
use super::{Composite, NodeId, TreeError};
use crate::conditions::Condition;
use crate::params::{ParamHandler, ParamValue};
use crate::skill::Skill;
use crate::world::WorldModel;

pub const PROCEDURE_TYPE: &str = "Procedure";
pub const ROOT_TYPE: &str = "Root";
const DEFAULT_MAX_CACHE: usize = 2;

/// What runs when the node is executed.
#[derive(Clone)]
pub enum NodeBody {
    /// Pure grouping node
    Composite,
    /// Skill node, `None` until an instance is assigned
    Skill(Option<Arc<dyn Skill>>),
    Operator(Operator),
}

impl fmt::Debug for NodeBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeBody::Composite => f.write_str("Composite"),
            NodeBody::Skill(Some(skill)) => write!(f, "Skill({})", skill.label()),
            NodeBody::Skill(None) => f.write_str("Skill(<abstract>)"),
            NodeBody::Operator(op) => write!(f, "Operator({})", op.label()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Procedure {
    pub type_name: String,
    pub label: String,
    pub body: NodeBody,
    pub params: ParamHandler,
    pub pre: Vec<Condition>,
    pub hold: Vec<Condition>,
    pub post: Vec<Condition>,
    pub composite: Composite,
    remaps: Vec<(String, String)>,
    /// Remaps applied while an input was cached: (cache depth, from, to)
    remap_cache: Vec<(usize, String, String)>,
    signals: NodeSignals,
    active_token: Option<CancellationToken>,
    params_cache: VecDeque<ParamHandler>,
    input_cache: VecDeque<ParamHandler>,
    max_cache: usize,
    was_simulated: bool,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    description: Option<Arc<ProcedureDescription>>,
}

impl Procedure {
    fn blank(type_name: &str, label: &str, body: NodeBody) -> Self {
        Self {
            type_name: type_name.to_string(),
            label: label.to_string(),
            body,
            params: ParamHandler::new(),
            pre: Vec::new(),
            hold: Vec::new(),
            post: Vec::new(),
            composite: Composite::Serial,
            remaps: Vec::new(),
            remap_cache: Vec::new(),
            signals: NodeSignals::new(),
            active_token: None,
            params_cache: VecDeque::new(),
            input_cache: VecDeque::new(),
            max_cache: DEFAULT_MAX_CACHE,
            was_simulated: false,
            parent: None,
            children: Vec::new(),
            description: None,
        }
    }

    /// Grouping node processing its children with `composite`.
    pub fn composite(label: impl Into<String>, composite: Composite) -> Self {
        let mut node = Self::blank(PROCEDURE_TYPE, &label.into(), NodeBody::Composite);
        node.composite = composite;
        node
    }

    pub fn root(label: impl Into<String>) -> Self {
        Self::blank(ROOT_TYPE, &label.into(), NodeBody::Composite)
    }

    /// Abstract skill node of the described type.
    pub fn from_description(description: Arc<ProcedureDescription>, label: impl Into<String>) -> Self {
        let mut node = Self::blank(
            &description.type_name,
            &label.into(),
            NodeBody::Skill(None),
        );
        node.description = Some(description);
        node.reset_description();
        node
    }

    pub fn operator(operator: Operator) -> Self {
        let label = operator.label();
        let params = operator.declare();
        let mut node = Self::blank(OPERATOR_TYPE, label, NodeBody::Operator(operator));
        node.params = params;
        node
    }

    pub fn with_max_cache(mut self, max_cache: usize) -> Self {
        self.max_cache = max_cache.max(1);
        self
    }

    pub fn description(&self) -> Option<&Arc<ProcedureDescription>> {
        self.description.as_ref()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn has_instance(&self) -> bool {
        !matches!(self.body, NodeBody::Skill(None))
    }

    pub fn skill(&self) -> Option<&Arc<dyn Skill>> {
        match &self.body {
            NodeBody::Skill(skill) => skill.as_ref(),
            _ => None,
        }
    }

    /// Reload params and conditions from the description. Remaps are kept
    /// on record but must be re-applied by the caller.
    pub(crate) fn reset_description(&mut self) {
        if let Some(description) = &self.description {
            self.params = description.params.clone();
            self.pre = description.pre.clone();
            self.hold = description.hold.clone();
            self.post = description.post.clone();
        }
        self.was_simulated = false;
    }

    pub(crate) fn set_description(&mut self, description: Arc<ProcedureDescription>) {
        self.type_name = description.type_name.clone();
        self.description = Some(description);
        self.reset_description();
    }

    /// Copy without tree links or execution caches, for shadow trees.
    pub fn detached_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.parent = None;
        copy.children.clear();
        copy.params_cache.clear();
        copy.input_cache.clear();
        copy.remap_cache.clear();
        copy.active_token = None;
        copy
    }

    // ============ State ============

    pub fn state(&self) -> NodeState {
        self.signals.state()
    }

    pub fn set_state(&self, state: NodeState) {
        self.signals.set_state(state);
    }

    pub fn handle(&self) -> NodeHandle {
        self.signals.handle()
    }

    pub fn preempt_flag(&self) -> &PreemptFlag {
        self.signals.preempt_flag()
    }

    pub(crate) fn begin_activity(&mut self) -> CancellationToken {
        let token = CancellationToken::new();
        self.active_token = Some(token.clone());
        token
    }

    pub(crate) fn end_activity(&mut self) {
        self.active_token = None;
    }

    /// Signal preemption to a running node.
    pub(crate) fn request_preempt(&self) -> bool {
        if self.state() != NodeState::Active {
            return false;
        }
        self.preempt_flag().request();
        if let Some(token) = &self.active_token {
            token.cancel();
        }
        if let Some(skill) = self.skill() {
            skill.on_preempt();
        }
        true
    }

    pub fn was_simulated(&self) -> bool {
        self.was_simulated
    }

    // ============ Remapping ============

    pub fn remaps(&self) -> &[(String, String)] {
        &self.remaps
    }

    /// Rename a parameter key across params and conditions.
    pub fn remap(&mut self, from: &str, to: &str) -> Result<(), TreeError> {
        if from == to {
            return Ok(());
        }
        let mut cursor = to.to_string();
        let mut steps = 0;
        while let Some(next) = self.remap_target(&cursor) {
            if next == from || steps > self.remaps.len() {
                return Err(TreeError::RemapCycle {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            cursor = next.to_string();
            steps += 1;
        }

        self.params.remap(from, to)?;
        for c in self
            .pre
            .iter_mut()
            .chain(self.hold.iter_mut())
            .chain(self.post.iter_mut())
        {
            c.remap(from, to);
        }
        match self.remaps.iter_mut().find(|(f, _)| f == from) {
            Some(entry) => entry.1 = to.to_string(),
            None => self.remaps.push((from.to_string(), to.to_string())),
        }
        if !self.input_cache.is_empty() {
            self.remap_cache
                .push((self.params_cache.len(), from.to_string(), to.to_string()));
        }
        Ok(())
    }

    /// Apply the recorded remaps again, after a description reset.
    pub(crate) fn reapply_remaps(&mut self) -> Result<(), TreeError> {
        for (from, to) in self.remaps.clone() {
            self.params.remap(&from, &to)?;
            for c in self
                .pre
                .iter_mut()
                .chain(self.hold.iter_mut())
                .chain(self.post.iter_mut())
            {
                c.remap(&from, &to);
            }
        }
        Ok(())
    }

    fn remap_target(&self, key: &str) -> Option<&str> {
        self.remaps
            .iter()
            .find(|(from, _)| from == key)
            .map(|(_, to)| to.as_str())
    }

    /// Current key of a declared key, following the remap chain.
    pub fn resolve_key(&self, key: &str) -> String {
        let mut current = key.to_string();
        for _ in 0..=self.remaps.len() {
            match self.remap_target(&current) {
                Some(next) if next != current => current = next.to_string(),
                _ => break,
            }
        }
        current
    }

    fn remap_condition(&self, mut condition: Condition) -> Condition {
        for (from, to) in &self.remaps {
            condition.remap(from, to);
        }
        condition
    }

    pub fn add_pre_condition(&mut self, condition: Condition) {
        let condition = self.remap_condition(condition);
        self.pre.push(condition);
    }

    pub fn add_hold_condition(&mut self, condition: Condition) {
        let condition = self.remap_condition(condition);
        self.hold.push(condition);
    }

    pub fn add_post_condition(&mut self, condition: Condition) {
        let condition = self.remap_condition(condition);
        self.post.push(condition);
    }

    // ============ Input ============

    /// Set a value and make it the default.
    pub fn specify(&mut self, key: &str, values: Vec<ParamValue>) -> Result<(), TreeError> {
        self.params.specify_default(key, values)?;
        Ok(())
    }

    /// Like [`Procedure::specify`], also patching the last cached input.
    pub fn specify_input(&mut self, key: &str, values: Vec<ParamValue>) -> Result<(), TreeError> {
        self.specify(key, values.clone())?;
        if let Some(input) = self.input_cache.back_mut() {
            if input.contains(key) {
                input.specify_values(key, values)?;
            }
        }
        Ok(())
    }

    /// Cache params and input, then merge the input into the params.
    ///
    /// Grounded defaults win over a different input binding, and are
    /// written back into the input.
    pub fn set_input(&mut self, input: &mut ParamHandler) {
        self.params_cache.push_back(self.params.clone());
        self.input_cache.push_back(input.clone());
        self.apply_input(input);
        while self.params_cache.len() > self.max_cache {
            self.params_cache.pop_front();
            self.input_cache.pop_front();
            self.remap_cache.retain(|(depth, _, _)| *depth > 1);
            for entry in self.remap_cache.iter_mut() {
                entry.0 -= 1;
            }
        }
    }

    /// Merge without caching. Used to test a node against another input.
    pub fn apply_input(&mut self, input: &mut ParamHandler) {
        for (key, param) in self.params.iter() {
            let Some(default) = param.default_values().first().and_then(ParamValue::as_element) else {
                continue;
            };
            if !default.is_grounded() {
                continue;
            }
            let Some(incoming) = input.template(key) else {
                continue;
            };
            let current = param.element().map(|e| e.id).unwrap_or_default();
            if current != incoming.id {
                if let Err(err) = input.specify(key, default.clone()) {
                    warn!(node = %self.label, key = %key, error = %err, "could not keep default binding");
                }
            }
        }
        self.params.set_params(input, true);
    }

    /// Restore the params cached by the last `set_input` and return the
    /// input cached with them.
    pub fn revert_input(&mut self) -> Option<ParamHandler> {
        let (Some(params), Some(input)) = (self.params_cache.pop_back(), self.input_cache.pop_back())
        else {
            warn!(node = %self.label, "no cache available, can't revert input");
            return None;
        };
        let depth = self.params_cache.len();
        while let Some((d, from, to)) = self.remap_cache.last().cloned() {
            if d <= depth {
                break;
            }
            self.remap_cache.pop();
            for c in self
                .pre
                .iter_mut()
                .chain(self.hold.iter_mut())
                .chain(self.post.iter_mut())
            {
                c.remap(&to, &from);
            }
            self.remaps.retain(|(f, _)| f != &from);
        }
        self.params = params;
        Some(input)
    }

    /// Drop the last cached input without restoring it.
    pub fn release_input(&mut self) {
        if self.params_cache.pop_back().is_none() {
            return;
        }
        self.input_cache.pop_back();
        let depth = self.params_cache.len();
        self.remap_cache.retain(|(d, _, _)| *d <= depth);
    }

    pub fn cached_inputs(&self) -> usize {
        self.params_cache.len()
    }

    // ============ Conditions ============

    pub fn has_pre(&self) -> bool {
        !self.pre.is_empty()
    }

    pub fn has_post(&self) -> bool {
        !self.post.is_empty()
    }

    /// Keys of failing preconditions. Empty when all hold.
    pub fn check_pre(&self, wm: &WorldModel, verbose: bool) -> Vec<String> {
        failing_keys(&self.label, &self.pre, &self.params, wm, verbose)
    }

    pub fn check_post(&self, wm: &WorldModel, verbose: bool) -> Vec<String> {
        failing_keys(&self.label, &self.post, &self.params, wm, verbose)
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

    /// Apply the hold conditions. All or nothing.
    pub fn hold(&mut self, wm: &mut WorldModel) -> bool {
        for i in 0..self.hold.len() {
            if !self.hold[i].set_true(&mut self.params, wm) {
                error!(node = %self.label, condition = %self.hold[i], "hold failed");
                for c in self.hold[..i].iter_mut().rev() {
                    c.revert(&mut self.params, wm);
                }
                return false;
            }
        }
        true
    }

    pub fn revert_hold(&mut self, wm: &mut WorldModel) -> bool {
        let mut ok = true;
        for c in self.hold.iter_mut().rev() {
            if !c.revert(&mut self.params, wm) {
                error!(node = %self.label, condition = %c, "revert hold failed");
                ok = false;
            }
        }
        self.was_simulated = false;
        ok
    }

    /// Commit the postconditions (or run the operator). All or nothing.
    pub fn simulate(&mut self, wm: &mut WorldModel) -> bool {
        if let NodeBody::Operator(op) = &mut self.body {
            let remaps = self.remaps.clone();
            let ok = op.execute(&mut self.params, |key| resolve_in(&remaps, key));
            self.was_simulated = ok;
            return ok;
        }
        for i in 0..self.post.len() {
            if !self.post[i].set_true(&mut self.params, wm) {
                error!(node = %self.label, condition = %self.post[i], "simulation failed");
                for c in self.post[..i].iter_mut().rev() {
                    c.revert(&mut self.params, wm);
                }
                return false;
            }
        }
        self.was_simulated = true;
        true
    }

    pub fn revert_simulation(&mut self, wm: &mut WorldModel) -> bool {
        if !self.was_simulated {
            warn!(node = %self.label, "no simulation was made, can't revert");
            return false;
        }
        if let NodeBody::Operator(op) = &mut self.body {
            let remaps = self.remaps.clone();
            let ok = op.revert_execute(&mut self.params, |key| resolve_in(&remaps, key));
            self.was_simulated = !ok;
            return ok;
        }
        let mut ok = true;
        for c in self.post.iter_mut().rev() {
            if !c.revert(&mut self.params, wm) {
                error!(node = %self.label, condition = %c, "revert failed");
                ok = false;
            }
        }
        self.was_simulated = false;
        ok
    }

    /// `type:label` line, with composite and state when verbose.
    pub fn render(&self, verbose: bool) -> String {
        let mut out = format!("{}:{}", self.type_name, self.label);
        if verbose {
            if !self.has_instance() {
                out.push_str("(abstract)");
            } else if !self.children.is_empty() {
                out.push_str(&format!("({})", self.composite.symbol()));
            }
            out.push_str(&format!("[{}]", self.state()));
        }
        out
    }
}

fn resolve_in(remaps: &[(String, String)], key: &str) -> String {
    let mut current = key.to_string();
    for _ in 0..=remaps.len() {
        match remaps.iter().find(|(from, _)| *from == current) {
            Some((_, to)) if *to != current => current = to.clone(),
            _ => break,
        }
    }
    current
}

fn failing_keys(
    label: &str,
    conditions: &[Condition],
    params: &ParamHandler,
    wm: &WorldModel,
    verbose: bool,
) -> Vec<String> {
    let mut keys = Vec::new();
    for c in conditions {
        if let Err(err) = c.diagnose(params, wm) {
            if verbose {
                info!(node = %label, condition = %c, reason = %err, "condition check failed");
            }
            for key in c.keys() {
                if !keys.iter().any(|k: &String| k == key) {
                    keys.push(key.to_string());
                }
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamType;
    use crate::world::{Element, ElementId, StaticTypeHierarchy, CONTAIN};
    use serde_json::json;

    fn world() -> (WorldModel, ElementId) {
        let mut wm = WorldModel::new(Arc::new(StaticTypeHierarchy::new()));
        wm.reset("test");
        let cup = wm
            .add_element(
                &Element::labeled("Cup", "blue").with_property("Filled", json!(false)),
                WorldModel::root_id(),
                CONTAIN,
            )
            .unwrap();
        (wm, cup)
    }

    fn fill_description() -> Arc<ProcedureDescription> {
        Arc::new(
            ProcedureDescription::new("Fill")
                .with_param("Cup", Element::new("Cup"), ParamType::Online, &[])
                .with_pre(Condition::property("empty", "Cup", "Filled", false, true))
                .with_post(Condition::property("full", "Cup", "Filled", true, true))
                .with_post(Condition::property("notEmpty", "Cup", "Filled", false, false)),
        )
    }

    fn input(cup: ElementId) -> ParamHandler {
        let mut input = ParamHandler::new();
        input.add_param("Cup", Element::new("Cup").with_id(cup).into(), ParamType::Online);
        input
    }

    #[test]
    fn test_simulate_and_revert_restore_world() {
        let (mut wm, cup) = world();
        let mut node = Procedure::from_description(fill_description(), "fill");
        node.set_input(&mut input(cup));
        assert!(node.check_pre(&wm, false).is_empty());

        let before = wm.snapshot();
        assert!(node.simulate(&mut wm));
        assert!(node.check_post(&wm, false).is_empty());
        assert!(!node.check_pre(&wm, false).is_empty());

        assert!(node.revert_simulation(&mut wm));
        assert_eq!(wm.snapshot(), before);
        assert!(!node.revert_simulation(&mut wm));
    }

    #[test]
    fn test_input_cache_is_bounded() {
        let (_, cup) = world();
        let mut node = Procedure::from_description(fill_description(), "fill");
        for _ in 0..5 {
            node.set_input(&mut input(cup));
        }
        assert_eq!(node.cached_inputs(), DEFAULT_MAX_CACHE);
        assert!(node.revert_input().is_some());
        assert!(node.revert_input().is_some());
        assert!(node.revert_input().is_none());
    }

    #[test]
    fn test_revert_input_restores_params() {
        let (_, cup) = world();
        let mut node = Procedure::from_description(fill_description(), "fill");
        let before = node.params.clone();
        let mut bb = input(cup);
        node.set_input(&mut bb);
        assert!(node.params.is_specified("Cup"));

        let returned = node.revert_input().unwrap();
        assert_eq!(node.params, before);
        assert_eq!(returned, input(cup));
    }

    #[test]
    fn test_grounded_default_wins_over_input() {
        let (mut wm, cup) = world();
        let other = wm
            .add_element(&Element::labeled("Cup", "red"), WorldModel::root_id(), CONTAIN)
            .unwrap();
        let mut node = Procedure::from_description(fill_description(), "fill");
        node.specify("Cup", vec![Element::new("Cup").with_id(other).into()])
            .unwrap();

        let mut bb = input(cup);
        node.set_input(&mut bb);
        assert_eq!(node.params.element("Cup").unwrap().id, other);
        assert_eq!(bb.element("Cup").unwrap().id, other);
    }

    #[test]
    fn test_remap_rejects_cycles() {
        let mut node = Procedure::from_description(fill_description(), "fill");
        node.remap("Cup", "Mug").unwrap();
        assert_eq!(node.resolve_key("Cup"), "Mug");
        assert!(node.params.contains("Mug"));
        assert_eq!(node.pre[0].subject(), "Mug");
        assert!(matches!(
            node.remap("Mug", "Cup"),
            Err(TreeError::RemapCycle { .. })
        ));
        node.remap("Cup", "Cup").unwrap();
    }

    #[test]
    fn test_remap_during_input_is_undone_with_it() {
        let (_, cup) = world();
        let mut node = Procedure::from_description(fill_description(), "fill");
        node.set_input(&mut input(cup));
        node.remap("Cup", "Mug").unwrap();
        node.revert_input();
        assert!(node.params.contains("Cup"));
        assert_eq!(node.pre[0].subject(), "Cup");
        assert!(node.remaps().is_empty());
    }

    #[test]
    fn test_operator_node_simulates_by_running() {
        let (mut wm, _) = world();
        let mut node = Procedure::operator(Operator::swap());
        node.params
            .specify("Left", Element::new("Thing").with_id(1))
            .unwrap();
        assert!(node.simulate(&mut wm));
        assert_eq!(node.params.element("Right").unwrap().id.0, 1);
        assert!(node.revert_simulation(&mut wm));
        assert_eq!(node.params.element("Left").unwrap().id.0, 1);
    }
}
