//! Executor module
//!
//! The NodeExecutor is responsible for:
//! - Binding abstract nodes to skill instances
//! - Grounding node params from the blackboard and the world model
//! - Holding, starting and ending nodes
//! - Keeping the blackboard of values shared between nodes

mod odometer;

use std::sync::Arc;

use crate::error::EngineError;
use crate::params::{ParamHandler, ParamType, ParamValue};
use crate::procedure::{NodeBody, NodeId, NodeState, PreemptFlag, Procedure, ProcedureTree};
use crate::registry::{NodeInstanciator, RegistryError};
use crate::skill::{Skill, SkillContext, SkillOutcome};
use crate::world::{ResolvedGroup, SharedWorldModel, WorldModel};

pub(crate) use odometer::Odometer;

/// Upper bound on blackboard assignments tried while grounding one node.
pub const DEFAULT_MAX_BLACKBOARD_ASSIGNMENTS: usize = 4096;

const MAX_LOG_TEXT_CHARS: usize = 2_000;

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}

pub struct NodeExecutor {
    world: SharedWorldModel,
    registry: Arc<NodeInstanciator>,
    /// Values produced by executed nodes, keyed by param key
    pub blackboard: ParamHandler,
    simulate: bool,
    verbose: bool,
    mirror_effects: bool,
    max_assignments: usize,
    preempt: PreemptFlag,
    tracked: Vec<String>,
}

impl NodeExecutor {
    pub fn new(world: SharedWorldModel, registry: Arc<NodeInstanciator>) -> Self {
        Self {
            world,
            registry,
            blackboard: ParamHandler::new(),
            simulate: false,
            verbose: false,
            mirror_effects: false,
            max_assignments: DEFAULT_MAX_BLACKBOARD_ASSIGNMENTS,
            preempt: PreemptFlag::new(),
            tracked: Vec::new(),
        }
    }

    /// Apply postconditions instead of running skills.
    pub fn with_simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Also commit the postconditions of skills that completed for real.
    pub fn with_mirror_effects(mut self, mirror_effects: bool) -> Self {
        self.mirror_effects = mirror_effects;
        self
    }

    pub fn with_max_assignments(mut self, max_assignments: usize) -> Self {
        self.max_assignments = max_assignments.max(1);
        self
    }

    pub fn with_blackboard(mut self, blackboard: ParamHandler) -> Self {
        self.blackboard = blackboard;
        self
    }

    pub fn world(&self) -> &SharedWorldModel {
        &self.world
    }

    pub fn registry(&self) -> &Arc<NodeInstanciator> {
        &self.registry
    }

    pub fn is_simulating(&self) -> bool {
        self.simulate
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn preempt_flag(&self) -> &PreemptFlag {
        &self.preempt
    }

    /// Log every change of `key` on the blackboard.
    pub fn track_param(&mut self, key: impl Into<String>) {
        self.tracked.push(key.into());
    }

    /// Executor for a parallel branch: same world and registry, its own
    /// blackboard copy and preempt flag.
    pub fn fork(&self) -> Self {
        Self {
            world: Arc::clone(&self.world),
            registry: Arc::clone(&self.registry),
            blackboard: self.blackboard.clone(),
            simulate: self.simulate,
            verbose: self.verbose,
            mirror_effects: self.mirror_effects,
            max_assignments: self.max_assignments,
            preempt: PreemptFlag::new(),
            tracked: self.tracked.clone(),
        }
    }

    /// Take back the blackboard of a finished branch.
    pub fn join(&mut self, branch: NodeExecutor) {
        self.blackboard.merge_from(&branch.blackboard);
    }

    /// Bind the node to an instance if it has none yet.
    pub fn init(&self, tree: &mut ProcedureTree, id: NodeId) -> Result<(), EngineError> {
        if tree.node(id)?.has_instance() {
            tree.set_state(id, NodeState::Idle)?;
            return Ok(());
        }
        self.registry.assign_instance(tree, id)
    }

    /// Ground, hold and start the node.
    ///
    /// Returns `Ok(false)` when the node cannot be grounded or fails to
    /// start. The input and the hold are then reverted.
    pub async fn execute(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        self.init(tree, id)?;
        let label = {
            let node = tree.node_mut(id)?;
            node.set_input(&mut self.blackboard);
            node.label.clone()
        };
        if self.verbose {
            tracing::info!(
                node = %label,
                blackboard = %truncate_for_log(&self.blackboard.to_string(), MAX_LOG_TEXT_CHARS),
                "execute"
            );
        }

        if !self.parametrize(tree, id).await? {
            tracing::warn!(node = %label, "cannot ground node params");
            self.abort(tree, id, false).await?;
            return Ok(false);
        }

        let held = {
            let mut wm = self.world.write().await;
            tree.node_mut(id)?.hold(&mut wm)
        };
        if !held {
            self.abort(tree, id, false).await?;
            return Ok(false);
        }

        if !self.simulate {
            match self.start(tree, id).await {
                Ok(true) => {}
                Ok(false) => {
                    self.abort(tree, id, true).await?;
                    return Ok(false);
                }
                Err(err) => {
                    let state = tree.node(id)?.state();
                    self.abort(tree, id, true).await?;
                    tree.set_state(id, state)?;
                    return Err(err);
                }
            }
        }

        self.merge(tree.node(id)?);
        Ok(true)
    }

    /// Commit the node's effects: postconditions when simulating,
    /// otherwise the skill's post execution.
    pub async fn post_execute(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        let label = {
            let node = tree.node_mut(id)?;
            node.set_input(&mut self.blackboard);
            node.label.clone()
        };
        let ok = if self.simulate {
            let mut wm = self.world.write().await;
            tree.node_mut(id)?.simulate(&mut wm)
        } else {
            match self.end(tree, id).await {
                Ok(ok) => ok,
                Err(err) => {
                    self.restore_input(tree, id)?;
                    return Err(err);
                }
            }
        };
        if !ok {
            tracing::warn!(node = %label, "post execution failed");
            self.restore_input(tree, id)?;
            return Ok(false);
        }
        if self.verbose {
            tracing::info!(node = %label, "post execute");
        }
        self.merge(tree.node(id)?);
        Ok(true)
    }

    // ============ Grounding ============

    /// Ground the node, switching to another instance of its type when the
    /// current one cannot be grounded.
    pub(crate) async fn parametrize(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        let grounded = {
            let wm = self.world.read().await;
            self.ground(tree.node_mut(id)?, &wm)?
        };
        if grounded {
            return Ok(true);
        }
        self.try_other(tree, id).await
    }

    /// Bind every required element param and check the preconditions.
    pub(crate) fn ground(&self, node: &mut Procedure, wm: &WorldModel) -> Result<bool, EngineError> {
        let mut bound = self.match_blackboard(node, wm)?;
        let invalid = node.check_pre(wm, false);
        if !invalid.is_empty() {
            let keys: Vec<String> = invalid
                .into_iter()
                .filter(|k| node.params.contains(k))
                .collect();
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(node = %node.label, keys = ?keys, "resetting invalid params");
            }
            node.params.set_default(&keys)?;
            bound = self.match_blackboard(node, wm)?;
        }
        if !bound {
            tracing::debug!(
                node = %node.label,
                keys = ?unbound_keys(&node.params),
                "required params left unbound"
            );
            return Ok(false);
        }
        let invalid = node.check_pre(wm, self.verbose);
        if !invalid.is_empty() {
            tracing::debug!(node = %node.label, keys = ?invalid, "preconditions do not hold");
            return Ok(false);
        }
        Ok(true)
    }

    /// Try blackboard values for the unbound params, then ground what is
    /// left from the world model.
    fn match_blackboard(&self, node: &mut Procedure, wm: &WorldModel) -> Result<bool, EngineError> {
        let to_resolve = unbound_keys(&node.params);
        if to_resolve.is_empty() {
            return Ok(true);
        }
        let template = desired_template(node);

        let mut matched: Vec<String> = Vec::new();
        let mut candidates: Vec<Vec<String>> = Vec::new();
        for key in &to_resolve {
            let Some(wanted) = template.template(key) else {
                continue;
            };
            let keys: Vec<String> = self
                .blackboard
                .iter()
                .filter(|(_, p)| p.element().is_some_and(|e| wm.is_instance(e, wanted)))
                .map(|(k, _)| k.clone())
                .collect();
            if !keys.is_empty() {
                matched.push(key.clone());
                candidates.push(keys);
            }
        }

        if !matched.is_empty() {
            let saved: Vec<(String, Vec<ParamValue>)> = matched
                .iter()
                .filter_map(|k| node.params.get(k).map(|p| (k.clone(), p.values().to_vec())))
                .collect();
            let mut found = false;
            let odometer = Odometer::new(candidates.iter().map(Vec::len).collect());
            for (tried, digits) in odometer.enumerate() {
                if tried >= self.max_assignments {
                    tracing::warn!(
                        node = %node.label,
                        limit = self.max_assignments,
                        "blackboard assignment limit reached"
                    );
                    break;
                }
                for (i, key) in matched.iter().enumerate() {
                    let source = &candidates[i][digits[i]];
                    if let Some(param) = self.blackboard.get(source) {
                        node.params.specify_values(key, param.values().to_vec())?;
                    }
                }
                let invalid = node.check_pre(wm, false);
                if !invalid.iter().any(|k| matched.contains(k)) {
                    found = true;
                    break;
                }
            }
            if found {
                if self.verbose {
                    let bindings: Vec<String> = matched
                        .iter()
                        .filter_map(|k| node.params.element(k).ok().map(|e| format!("{k}={e}")))
                        .collect();
                    tracing::info!(node = %node.label, bindings = ?bindings, "matched params from blackboard");
                }
            } else {
                for (key, values) in saved {
                    node.params.specify_values(&key, values)?;
                }
            }
        }

        let remaining = unbound_keys(&node.params);
        if remaining.is_empty() {
            return Ok(true);
        }
        let template = desired_template(node);
        self.match_world(node, &remaining, &template, wm)
    }

    /// Bind `keys` from the world model. Prefers rows under which the
    /// preconditions hold, else the first row of every group.
    fn match_world(
        &self,
        node: &mut Procedure,
        keys: &[String],
        template: &ParamHandler,
        wm: &WorldModel,
    ) -> Result<bool, EngineError> {
        let groups = wm.resolve_elements(keys, template)?;
        if let Some(empty) = groups.iter().find(|g| g.is_empty()) {
            tracing::warn!(node = %node.label, keys = ?empty.keys, "no world element matches");
            return Ok(false);
        }
        let mut chosen = None;
        let odometer = Odometer::new(groups.iter().map(ResolvedGroup::len).collect());
        for (tried, digits) in odometer.enumerate() {
            if tried >= self.max_assignments {
                break;
            }
            bind_rows(node, &groups, &digits)?;
            if node.check_pre(wm, false).is_empty() {
                chosen = Some(digits);
                break;
            }
        }
        if chosen.is_none() {
            bind_rows(node, &groups, &vec![0; groups.len()])?;
        }
        if self.verbose {
            tracing::info!(node = %node.label, keys = ?keys, "grounded params from world model");
        }
        Ok(true)
    }

    /// Rebind the node to the other instances of its type until one
    /// grounds. Already bound values survive the switch.
    async fn try_other(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        let (type_name, label, saved) = {
            let node = tree.node(id)?;
            (node.type_name.clone(), node.label.clone(), node.params.clone())
        };
        let alternatives: Vec<Arc<dyn Skill>> = self
            .registry
            .get_instances(&type_name)
            .iter()
            .filter(|s| s.label() != label)
            .cloned()
            .collect();
        let mut tried = vec![label.clone()];
        for skill in alternatives {
            if tried.iter().any(|l| l == skill.label()) {
                continue;
            }
            tried.push(skill.label().to_string());
            tracing::info!(node = %label, alternative = %skill.label(), "trying another instance");
            tree.set_instance(id, skill, &self.registry)?;
            let node = tree.node_mut(id)?;
            for (key, param) in saved.iter() {
                if node.params.contains(key) {
                    node.params.insert(param.clone());
                }
            }
            let wm = self.world.read().await;
            if self.ground(tree.node_mut(id)?, &wm)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ============ Running ============

    /// Run the node's skill until it finishes or is preempted.
    async fn start(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        let node = tree.node_mut(id)?;
        let skill = match &node.body {
            NodeBody::Skill(Some(skill)) => Some(Arc::clone(skill)),
            NodeBody::Skill(None) => {
                return Err(RegistryError::NoInstance(node.type_name.clone()).into());
            }
            NodeBody::Composite | NodeBody::Operator(_) => None,
        };
        let Some(skill) = skill else {
            node.set_state(NodeState::Active);
            let mut wm = self.world.write().await;
            // composites have no postconditions, operators run in place
            let ok = matches!(node.body, NodeBody::Composite) || node.simulate(&mut wm);
            if !ok {
                node.set_state(NodeState::Error);
            }
            return Ok(ok);
        };

        let label = node.label.clone();
        let token = node.begin_activity();
        node.set_state(NodeState::Active);
        let node_flag = node.preempt_flag().clone();
        let mut params = node.params.clone();
        let ctx = SkillContext::new(label.clone(), Arc::clone(&self.world), token.clone());
        tracing::info!(node = %label, execution_id = %ctx.execution_id, "skill started");

        let visitor_flag = self.preempt.clone();
        let mut preempted = false;
        let outcome = {
            let run = skill.execute(&mut params, &ctx);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    _ = node_flag.requested(), if !preempted => {
                        preempted = true;
                        if !token.is_cancelled() {
                            token.cancel();
                            skill.on_preempt();
                        }
                    }
                    _ = visitor_flag.requested(), if !preempted => {
                        preempted = true;
                        if !token.is_cancelled() {
                            token.cancel();
                            skill.on_preempt();
                        }
                    }
                }
            }
        };

        let node = tree.node_mut(id)?;
        node.end_activity();
        let flagged = node.preempt_flag().take();
        if preempted || flagged {
            node.set_state(NodeState::Preempted);
            tracing::warn!(node = %label, "skill preempted");
            return Err(EngineError::Preempted(label));
        }
        node.params.set_params(&params, true);
        match outcome {
            SkillOutcome::Success => {
                tracing::info!(node = %label, execution_id = %ctx.execution_id, "skill finished");
                Ok(true)
            }
            SkillOutcome::Failure(reason) => {
                node.set_state(NodeState::Error);
                tracing::warn!(node = %label, reason = %reason, "skill failed");
                Ok(false)
            }
        }
    }

    /// Run the skill's post execution and mark the node completed.
    async fn end(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<bool, EngineError> {
        let node = tree.node_mut(id)?;
        let label = node.label.clone();
        if node.preempt_flag().take() {
            node.set_state(NodeState::Preempted);
            return Err(EngineError::Preempted(label));
        }
        let ok = match node.skill().cloned() {
            Some(skill) => {
                let token = node.begin_activity();
                let mut params = node.params.clone();
                let ctx = SkillContext::new(label.clone(), Arc::clone(&self.world), token);
                let outcome = skill.post_execute(&mut params, &ctx).await;
                let node = tree.node_mut(id)?;
                node.end_activity();
                node.params.set_params(&params, true);
                match outcome {
                    SkillOutcome::Success => true,
                    SkillOutcome::Failure(reason) => {
                        tracing::warn!(node = %label, reason = %reason, "post execution failed");
                        false
                    }
                }
            }
            None => true,
        };

        let node = tree.node_mut(id)?;
        if !ok {
            node.set_state(NodeState::Error);
            return Ok(false);
        }
        node.set_state(NodeState::Completed);
        if self.mirror_effects && node.skill().is_some() {
            let mut wm = self.world.write().await;
            if !node.simulate(&mut wm) {
                tracing::warn!(node = %label, "could not mirror effects into the world model");
            }
        }
        Ok(true)
    }

    // ============ Helpers ============

    async fn abort(&mut self, tree: &mut ProcedureTree, id: NodeId, held: bool) -> Result<(), EngineError> {
        if held {
            let mut wm = self.world.write().await;
            tree.node_mut(id)?.revert_hold(&mut wm);
        }
        self.restore_input(tree, id)?;
        tree.set_state(id, NodeState::Error)?;
        Ok(())
    }

    pub(crate) fn restore_input(&mut self, tree: &mut ProcedureTree, id: NodeId) -> Result<(), EngineError> {
        if let Some(input) = tree.node_mut(id)?.revert_input() {
            self.blackboard = input;
        }
        Ok(())
    }

    pub(crate) fn merge(&mut self, node: &Procedure) {
        self.blackboard.merge_from(&node.params);
        for key in &self.tracked {
            if let Some(param) = self.blackboard.get(key) {
                tracing::debug!(node = %node.label, key = %key, value = ?param.values(), "tracked param");
            }
        }
    }
}

impl std::fmt::Debug for NodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutor")
            .field("simulate", &self.simulate)
            .field("blackboard", &self.blackboard.len())
            .finish_non_exhaustive()
    }
}

/// Required element params that are not bound to a world element.
fn unbound_keys(params: &ParamHandler) -> Vec<String> {
    params
        .iter()
        .filter(|(_, p)| p.param_type != ParamType::Optional)
        .filter(|(_, p)| p.element().is_some_and(|e| !e.is_grounded()))
        .map(|(k, _)| k.clone())
        .collect()
}

/// Node params with the state required by its preconditions.
fn desired_template(node: &Procedure) -> ParamHandler {
    let mut template = node.params.clone();
    for condition in &node.pre {
        condition.set_desired_state(&mut template);
    }
    template
}

fn bind_rows(node: &mut Procedure, groups: &[ResolvedGroup], rows: &[usize]) -> Result<(), EngineError> {
    for (group, row) in groups.iter().zip(rows) {
        for (key, element) in group.bindings(*row) {
            if node.params.contains(key) {
                node.params.specify(key, element.clone())?;
            }
        }
    }
    Ok(())
}
