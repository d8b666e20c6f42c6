//! The pipeline planning layer: a run intent over ordered modules.
//!
//! A pipeline concatenates its modules' fragments with the same exit→entry
//! linking rule modules use for tasks, producing the final
//! [`ExecutionGraph`]. Planning errors abort before any execution starts;
//! an empty graph short-circuits to an immediate success result.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::context::PipelineContext;
use crate::error::KubeforgeError;
use crate::graph::{ExecutionFragment, ExecutionGraph};
use crate::module::Module;
use crate::result::GraphExecutionResult;

/// Top-level planner: a run intent and its ordered modules.
pub struct Pipeline {
    name: String,
    modules: Vec<Box<dyn Module>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, modules: Vec<Box<dyn Module>>) -> Self {
        Self {
            name: name.into(),
            modules,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Concatenates module fragments into the final graph.
    #[tracing::instrument(skip(self, ctx), fields(pipeline = %self.name))]
    pub fn plan(&self, ctx: &PipelineContext) -> Result<ExecutionGraph> {
        let mut composed = ExecutionFragment::new(&self.name);
        let mut prev_exits = Vec::new();

        for module in &self.modules {
            let module_ctx = ctx.module(module.name());
            let required = module.is_required(&module_ctx).with_context(|| {
                format!("failed to evaluate whether module {} is required", module.name())
            })?;
            if !required {
                debug!(module = module.name(), "module not required, skipping");
                continue;
            }

            let fragment = module
                .plan(&module_ctx)
                .with_context(|| format!("failed to plan module {}", module.name()))?;
            if fragment.is_empty() {
                debug!(module = module.name(), "module planned no work");
                continue;
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

        let graph = composed.into_graph(&self.name);
        graph.validate().map_err(KubeforgeError::Plan)?;
        info!(pipeline = %self.name, nodes = graph.len(), "planning complete");
        Ok(graph)
    }

    /// Plans (unless a graph is supplied) and executes.
    ///
    /// An empty graph returns a success result with no node results and
    /// never reaches the engine.
    pub async fn run(
        &self,
        ctx: &PipelineContext,
        graph: Option<ExecutionGraph>,
        dry_run: bool,
    ) -> Result<GraphExecutionResult> {
        let graph = match graph {
            Some(graph) => graph,
            None => self.plan(ctx)?,
        };

        if graph.is_empty() {
            info!(pipeline = %self.name, "nothing to do");
            return Ok(GraphExecutionResult::empty_success(graph.name()));
        }

        let result = ctx.engine().execute(ctx, &graph, dry_run).await?;
        Ok(result)
    }
}
