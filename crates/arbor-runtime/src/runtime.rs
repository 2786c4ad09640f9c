//! Engine facade over a configured world model and registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use arbor_config::{load_config, validate_config, ArborConfig, PlanNodeSpec};
use arbor_core::error::EngineError;
use arbor_core::executor::NodeExecutor;
use arbor_core::optimizer::OptimizerVisitor;
use arbor_core::params::ParamValue;
use arbor_core::procedure::{NodeId, Procedure, ProcedureTree};
use arbor_core::registry::NodeInstanciator;
use arbor_core::simulator::{ReversibleSimulator, Transaction};
use arbor_core::skill::Skill;
use arbor_core::visitor::{traverse, ExecutionVisitor, PrintVisitor, SimulationVisitor};
use arbor_core::world::{Element, ElementId, SharedWorldModel, WorldModel};

use crate::bootstrap::{
    build_registry, build_type_hierarchy, build_world_model, init_tracing_if_needed,
    BootstrapError,
};

/// Outcome of a dry run.
#[derive(Debug)]
pub struct SimulationReport {
    pub success: bool,
    /// Nodes in the order they were simulated.
    pub execution: ProcedureTree,
}

/// Outcome of an optimization pass.
#[derive(Debug)]
pub struct OptimizedPlan {
    pub success: bool,
    pub tree: ProcedureTree,
    pub sequence: Vec<Transaction>,
}

/// World model, registry and engine settings built from one config.
pub struct EngineRuntime {
    config: ArborConfig,
    world: SharedWorldModel,
    registry: Arc<NodeInstanciator>,
    scene: HashMap<String, ElementId>,
}

impl EngineRuntime {
    /// Create an engine from a single `arbor.yaml`.
    pub fn from_config_path(path: impl AsRef<Path>) -> Result<Self, BootstrapError> {
        let config = load_config(path.as_ref())?;
        Self::from_config(config)
    }

    pub fn from_config(config: ArborConfig) -> Result<Self, BootstrapError> {
        Self::with_skills(config, Vec::new())
    }

    /// Create an engine, registering `skills` next to the declared ones.
    pub fn with_skills(
        config: ArborConfig,
        skills: Vec<Arc<dyn Skill>>,
    ) -> Result<Self, BootstrapError> {
        validate_config(&config)?;
        init_tracing_if_needed(&config.observability);
        let types = Arc::new(build_type_hierarchy(&config));
        let (wm, scene) = build_world_model(&config, types)?;
        let registry = build_registry(&config, skills)?;
        info!(
            app = %config.app.name,
            environment = %config.app.environment,
            types = registry.types().count(),
            simulate = config.engine.simulate,
            "engine runtime ready"
        );
        Ok(Self {
            config,
            world: wm.into_shared(),
            registry: Arc::new(registry),
            scene,
        })
    }

    pub fn config(&self) -> &ArborConfig {
        &self.config
    }

    pub fn world(&self) -> &SharedWorldModel {
        &self.world
    }

    pub fn registry(&self) -> &Arc<NodeInstanciator> {
        &self.registry
    }

    /// World model id of a scene key.
    pub fn element_id(&self, key: &str) -> Option<ElementId> {
        self.scene.get(key).copied()
    }

    /// Executor carrying the engine settings.
    pub fn executor(&self) -> NodeExecutor {
        let engine = &self.config.engine;
        NodeExecutor::new(Arc::clone(&self.world), Arc::clone(&self.registry))
            .with_simulate(engine.simulate)
            .with_verbose(engine.verbose)
            .with_mirror_effects(engine.mirror_effects)
            .with_max_assignments(self.config.grounding.max_blackboard_assignments)
    }

    fn simulator(&self) -> ReversibleSimulator {
        ReversibleSimulator::from_executor(self.executor())
    }

    /// Visitor for [`EngineRuntime::execute`]. Build it directly to keep
    /// its blackboard or preempt it from another task.
    pub fn execution_visitor(&self) -> ExecutionVisitor {
        ExecutionVisitor::from_executor(self.executor())
    }

    /// Tree of the configured plan.
    pub async fn plan(&self) -> Result<ProcedureTree, BootstrapError> {
        let spec = self
            .config
            .plan
            .as_ref()
            .ok_or_else(|| BootstrapError::InvalidPlan("config declares no plan".to_string()))?;
        self.build_plan(spec).await
    }

    pub async fn build_plan(&self, spec: &PlanNodeSpec) -> Result<ProcedureTree, BootstrapError> {
        let wm = self.world.read().await;
        let mut tree = ProcedureTree::empty();
        let root = tree.set_root(self.plan_node(spec, &wm)?);
        apply_remaps(&mut tree, root, spec)?;

        let mut pending: Vec<(NodeId, &PlanNodeSpec)> = vec![(root, spec)];
        while let Some((parent, spec)) = pending.pop() {
            for child in &spec.children {
                let id = tree.add_child(parent, self.plan_node(child, &wm)?, child.latch)?;
                apply_remaps(&mut tree, id, child)?;
                pending.push((id, child));
            }
        }
        info!(nodes = tree.len(), "plan built");
        Ok(tree)
    }

    fn plan_node(&self, spec: &PlanNodeSpec, wm: &WorldModel) -> Result<Procedure, BootstrapError> {
        let label = spec.label();
        let node = match &spec.type_name {
            None => Procedure::composite(label, spec.composite.clone()),
            Some(type_name) => {
                let mut node = self.registry.procedure(type_name, &label)?;
                for (key, element_key) in &spec.specify {
                    let element = self.scene_element(element_key, wm)?;
                    node.specify(key, vec![ParamValue::Element(element)])?;
                }
                node
            }
        };
        Ok(node.with_max_cache(self.config.engine.max_input_cache))
    }

    fn scene_element(&self, key: &str, wm: &WorldModel) -> Result<Element, BootstrapError> {
        let id = self
            .element_id(key)
            .ok_or_else(|| BootstrapError::InvalidPlan(format!("unknown scene element '{key}'")))?;
        Ok(wm.element(id)?)
    }

    /// Run the tree for real.
    pub async fn execute(&self, tree: &mut ProcedureTree) -> Result<bool, EngineError> {
        let mut visitor = self.execution_visitor();
        traverse(&mut visitor, tree).await
    }

    /// Simulate the tree and unwind every effect afterwards.
    pub async fn simulate(&self, tree: &mut ProcedureTree) -> Result<SimulationReport, EngineError> {
        let mut visitor = SimulationVisitor::from_simulator(self.simulator());
        let success = traverse(&mut visitor, tree).await?;
        Ok(SimulationReport {
            success,
            execution: visitor.execution_tree().clone(),
        })
    }

    /// Reorder the tree into its optimized execution plan.
    pub async fn optimize(&self, tree: &mut ProcedureTree) -> Result<OptimizedPlan, EngineError> {
        let mut visitor = OptimizerVisitor::from_simulator(self.simulator())
            .with_verbose(self.config.engine.verbose);
        let success = traverse(&mut visitor, tree).await?;
        Ok(OptimizedPlan {
            success,
            tree: visitor.execution_tree().clone(),
            sequence: visitor.execution_sequence().to_vec(),
        })
    }

    /// Indented dump of the tree with abstract nodes expanded.
    pub async fn render(&self, tree: &mut ProcedureTree) -> Result<String, EngineError> {
        let mut visitor = PrintVisitor::new(Arc::clone(&self.world), Arc::clone(&self.registry))
            .with_verbose(self.config.engine.verbose);
        traverse(&mut visitor, tree).await?;
        Ok(visitor.output().to_string())
    }
}

fn apply_remaps(
    tree: &mut ProcedureTree,
    id: NodeId,
    spec: &PlanNodeSpec,
) -> Result<(), BootstrapError> {
    for (from, to) in &spec.remap {
        tree.remap(id, from, to)?;
    }
    Ok(())
}

impl std::fmt::Debug for EngineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntime")
            .field("app", &self.config.app.name)
            .field("registry", &self.registry)
            .field("scene", &self.scene)
            .finish_non_exhaustive()
    }
}
