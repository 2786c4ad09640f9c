//! Fixtures shared by unit tests: a small pick-and-place world and
//! scripted skills.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::conditions::Condition;
use crate::error::EngineError;
use crate::params::{ParamHandler, ParamType};
use crate::procedure::{Composite, NodeId, ProcedureDescription, ProcedureTree, AGENT_TYPE};
use crate::registry::NodeInstanciator;
use crate::skill::{ExpandContext, Skill, SkillContext, SkillOutcome};
use crate::world::{Element, ElementId, SharedWorldModel, StaticTypeHierarchy, WorldModel, CONTAIN};

pub(crate) struct Scene {
    pub world: SharedWorldModel,
    pub gripper: ElementId,
    pub box_a: ElementId,
    pub box_b: ElementId,
    pub table: ElementId,
}

/// Robot, one empty gripper, two boxes and a table under the scene root.
pub(crate) fn scene() -> Scene {
    let types = StaticTypeHierarchy::new()
        .with_type("Box", "Thing")
        .with_type("Gripper", "Thing")
        .with_type("Location", "Thing")
        .with_type(AGENT_TYPE, "Thing");
    let mut wm = WorldModel::new(Arc::new(types));
    wm.reset("test");
    let root = WorldModel::root_id();
    wm.add_element(&Element::labeled(AGENT_TYPE, "robot"), root, CONTAIN)
        .unwrap();
    let gripper = wm
        .add_element(
            &Element::labeled("Gripper", "rq3").with_property("ContainerState", json!("Empty")),
            root,
            CONTAIN,
        )
        .unwrap();
    let box_a = wm
        .add_element(&Element::labeled("Box", "a"), root, CONTAIN)
        .unwrap();
    let box_b = wm
        .add_element(&Element::labeled("Box", "b"), root, CONTAIN)
        .unwrap();
    let table = wm
        .add_element(&Element::labeled("Location", "table"), root, CONTAIN)
        .unwrap();
    Scene {
        world: wm.into_shared(),
        gripper,
        box_a,
        box_b,
        table,
    }
}

pub(crate) fn pick_description() -> ProcedureDescription {
    ProcedureDescription::new("Pick")
        .with_param("Object", Element::new("Box"), ParamType::Online, &[])
        .with_param("Gripper", Element::new("Gripper"), ParamType::Online, &[])
        .with_pre(Condition::property("EmptyHanded", "Gripper", "ContainerState", "Empty", true))
        .with_post(Condition::relation("Holding", "Gripper", CONTAIN, "Object", true))
        .with_post(Condition::property("EmptyHanded", "Gripper", "ContainerState", "Empty", false))
}

pub(crate) fn place_description() -> ProcedureDescription {
    ProcedureDescription::new("Place")
        .with_param("Object", Element::new("Box"), ParamType::Online, &[])
        .with_param("Gripper", Element::new("Gripper"), ParamType::Online, &[])
        .with_param("Location", Element::new("Location"), ParamType::Online, &[])
        .with_pre(Condition::relation("Holding", "Gripper", CONTAIN, "Object", true))
        .with_post(Condition::relation("Placed", "Location", CONTAIN, "Object", true))
        .with_post(Condition::relation("Holding", "Gripper", CONTAIN, "Object", false))
        .with_post(Condition::property("EmptyHanded", "Gripper", "ContainerState", "Empty", true))
}

pub(crate) fn inspect_description() -> ProcedureDescription {
    ProcedureDescription::new("Inspect")
        .with_param("Object", Element::new("Box"), ParamType::Online, &[])
        .with_post(Condition::property("Inspected", "Object", "Inspected", "Yes", true))
}

/// Skill with a fixed outcome that counts its executions.
pub(crate) struct ScriptedSkill {
    pub type_name: String,
    pub label: String,
    pub description: ProcedureDescription,
    pub succeed: bool,
    pub succeed_times: Option<usize>,
    pub wait_for_cancel: bool,
    pub panics: bool,
    pub children: Vec<(String, String)>,
    pub composite: Composite,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedSkill {
    pub fn new(label: &str, description: ProcedureDescription) -> Self {
        Self {
            type_name: description.type_name.clone(),
            label: label.to_string(),
            description,
            succeed: true,
            succeed_times: None,
            wait_for_cancel: false,
            panics: false,
            children: Vec::new(),
            composite: Composite::Serial,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(mut self) -> Self {
        self.succeed = false;
        self
    }

    /// Succeed for the first `times` calls, then fail.
    pub fn failing_after(mut self, times: usize) -> Self {
        self.succeed_times = Some(times);
        self
    }

    pub fn blocking(mut self) -> Self {
        self.wait_for_cancel = true;
        self
    }

    /// Abort the task running the skill.
    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn with_child(mut self, type_name: &str, label: &str) -> Self {
        self.children.push((type_name.to_string(), label.to_string()));
        self
    }

    pub fn with_composite(mut self, composite: Composite) -> Self {
        self.composite = composite;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Skill for ScriptedSkill {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn description(&self) -> ProcedureDescription {
        self.description.clone()
    }

    fn expand(&self, ctx: &mut ExpandContext<'_>) -> Result<(), EngineError> {
        ctx.set_composite(self.composite.clone())?;
        for (type_name, label) in &self.children {
            ctx.add_child(type_name, label, false)?;
        }
        Ok(())
    }

    async fn execute(&self, _params: &mut ParamHandler, ctx: &SkillContext) -> SkillOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("scripted skill {} panicked", self.label);
        }
        if self.wait_for_cancel {
            ctx.cancelled().await;
            return SkillOutcome::failure("cancelled");
        }
        match self.succeed_times {
            Some(times) => (call < times).into(),
            None => self.succeed.into(),
        }
    }
}

/// Registry holding the given skills.
pub(crate) fn registry(skills: Vec<ScriptedSkill>) -> Arc<NodeInstanciator> {
    let mut registry = NodeInstanciator::new();
    for skill in skills {
        registry.add_instance(Arc::new(skill));
    }
    Arc::new(registry)
}

/// Root composite with one abstract child per `(type, label)`.
pub(crate) fn plan(
    registry: &NodeInstanciator,
    composite: Composite,
    steps: &[(&str, &str)],
) -> (ProcedureTree, Vec<NodeId>) {
    let mut tree = ProcedureTree::empty();
    let root = tree.add_sequence(None, "plan", composite).unwrap();
    let ids = steps
        .iter()
        .map(|(type_name, label)| {
            let node = registry.procedure(type_name, label).unwrap();
            tree.add_child(root, node, false).unwrap()
        })
        .collect();
    (tree, ids)
}
