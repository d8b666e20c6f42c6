//! The module planning layer: one lifecycle phase of the cluster.
//!
//! A module owns an ordered sequence of tasks and composes their fragments
//! sequentially: every entry node of task *k+1* gains a dependency on every
//! exit node of task *k*. Tasks are therefore sequential with respect to
//! each other while nodes inside a task keep whatever parallelism their own
//! dependency structure allows — phase B starts only after phase A is fully
//! done.

use anyhow::{Context, Result};
use tracing::debug;

use crate::context::ModuleContext;
use crate::error::KubeforgeError;
use crate::graph::ExecutionFragment;
use crate::task::Task;

/// A lifecycle phase owning an ordered sequence of tasks.
pub trait Module: Send + Sync {
    /// Stable module name; stamped onto every node the module composes.
    fn name(&self) -> &str;

    /// Whether this phase applies to the given spec at all.
    fn is_required(&self, _ctx: &ModuleContext) -> Result<bool> {
        Ok(true)
    }

    /// The tasks of this phase, in execution order.
    fn tasks(&self) -> Vec<Box<dyn Task>>;

    /// Produces the module's fragment via sequential task composition.
    fn plan(&self, ctx: &ModuleContext) -> Result<ExecutionFragment> {
        compose_tasks(self.name(), self.tasks(), ctx)
    }
}

/// The default module composer.
///
/// Iterates tasks in declared order, skips those that report not required
/// or plan an empty fragment, merges the rest, and links each fragment's
/// entries to the previous fragment's exits.
pub fn compose_tasks(
    module_name: &str,
    tasks: Vec<Box<dyn Task>>,
    ctx: &ModuleContext,
) -> Result<ExecutionFragment> {
    let mut composed = ExecutionFragment::new(module_name);
    let mut prev_exits = Vec::new();

    for task in tasks {
        let task_ctx = ctx.task(task.name());
        let required = task
            .is_required(&task_ctx)
            .with_context(|| format!("failed to evaluate whether task {} is required", task.name()))?;
        if !required {
            debug!(module = module_name, task = task.name(), "task not required, skipping");
            continue;
        }

        let mut fragment = task
            .plan(&task_ctx)
            .with_context(|| format!("failed to plan task {}", task.name()))?;
        if fragment.is_empty() {
            debug!(module = module_name, task = task.name(), "task planned no work");
            continue;
        }

        for node in fragment.nodes_mut().values_mut() {
            node.scope.module = module_name.to_string();
        }

        let entries = fragment.entry_nodes().to_vec();
        let exits = fragment.exit_nodes().to_vec();
        composed.merge(fragment).map_err(KubeforgeError::Plan)?;
        if !prev_exits.is_empty() {
            composed
                .link(&prev_exits, &entries)
                .map_err(KubeforgeError::Plan)?;
        }
        prev_exits = exits;
    }

    composed.calculate_entry_and_exit_nodes();
    Ok(composed)
}
