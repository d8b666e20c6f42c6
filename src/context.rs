//! Run state and the scoped context facades.
//!
//! One concrete [`RunContext`] is constructed at process start and carries
//! everything a run needs: the immutable cluster spec, the inventory, the
//! engine, the cache hierarchy, and the cancellation token. The planning and
//! execution layers never see it directly; they receive one of four facades
//! — [`PipelineContext`], [`ModuleContext`], [`TaskContext`],
//! [`StepContext`] — each exposing exactly the capability set its layer is
//! allowed to use. The facades are capability views over the same run state,
//! not an inheritance hierarchy.

use std::sync::Arc;

use anyhow::Result;
use camino::Utf8Path;
use tokio_util::sync::CancellationToken;

use crate::cache::{Cache, CacheSet};
use crate::config::ClusterSpec;
use crate::connector::{CommandSpec, Connector, ExecOutput};
use crate::engine::Engine;
use crate::graph::NodeScope;
use crate::host::{Facts, Host, Inventory, Role};

/// The concrete state of one orchestrator run.
pub struct RunContext {
    spec: Arc<ClusterSpec>,
    inventory: Inventory,
    engine: Engine,
    caches: CacheSet,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(spec: Arc<ClusterSpec>, inventory: Inventory, engine: Engine) -> Arc<Self> {
        Self::with_cancellation(spec, inventory, engine, CancellationToken::new())
    }

    /// Builds the run state around an externally owned cancellation token
    /// (e.g. one wired to a ctrl-c handler).
    pub fn with_cancellation(
        spec: Arc<ClusterSpec>,
        inventory: Inventory,
        engine: Engine,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            spec,
            inventory,
            engine,
            caches: CacheSet::new(),
            cancel,
        })
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn caches(&self) -> &CacheSet {
        &self.caches
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Capability view for pipeline-level planning and orchestration.
#[derive(Clone)]
pub struct PipelineContext {
    run: Arc<RunContext>,
}

impl PipelineContext {
    pub fn new(run: Arc<RunContext>) -> Self {
        Self { run }
    }

    pub fn spec(&self) -> &ClusterSpec {
        self.run.spec()
    }

    pub fn workdir(&self) -> &Utf8Path {
        &self.run.spec().workdir
    }

    pub fn engine(&self) -> &Engine {
        self.run.engine()
    }

    pub fn control_node(&self) -> &Host {
        self.run.inventory().control_node()
    }

    pub fn pipeline_cache(&self) -> Cache {
        self.run.caches().pipeline()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.run.cancellation()
    }

    /// Narrows to the named module's view.
    pub fn module(&self, name: &str) -> ModuleContext {
        ModuleContext {
            run: Arc::clone(&self.run),
            module: name.to_string(),
        }
    }

    pub(crate) fn run_state(&self) -> &Arc<RunContext> {
        &self.run
    }
}

/// Capability view for module-level planning.
#[derive(Clone)]
pub struct ModuleContext {
    run: Arc<RunContext>,
    module: String,
}

impl ModuleContext {
    pub fn module_name(&self) -> &str {
        &self.module
    }

    pub fn spec(&self) -> &ClusterSpec {
        self.run.spec()
    }

    pub fn workdir(&self) -> &Utf8Path {
        &self.run.spec().workdir
    }

    pub fn control_node(&self) -> &Host {
        self.run.inventory().control_node()
    }

    pub fn pipeline_cache(&self) -> Cache {
        self.run.caches().pipeline()
    }

    pub fn module_cache(&self) -> Cache {
        self.run.caches().module(&self.module)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.run.cancellation()
    }

    /// All cluster hosts in declaration order, control node included.
    pub fn all_hosts(&self) -> &[Host] {
        self.run.inventory().all_hosts()
    }

    /// Hosts tagged with `role`, preserving declaration order.
    pub fn hosts_with_role(&self, role: Role) -> Vec<Host> {
        self.run.inventory().hosts_with_role(role)
    }

    /// Narrows to the named task's view.
    pub fn task(&self, name: &str) -> TaskContext {
        TaskContext {
            run: Arc::clone(&self.run),
            module: self.module.clone(),
            task: name.to_string(),
        }
    }
}

/// Capability view for task-level planning.
#[derive(Clone)]
pub struct TaskContext {
    run: Arc<RunContext>,
    module: String,
    task: String,
}

impl TaskContext {
    pub fn module_name(&self) -> &str {
        &self.module
    }

    pub fn task_name(&self) -> &str {
        &self.task
    }

    pub fn spec(&self) -> &ClusterSpec {
        self.run.spec()
    }

    pub fn workdir(&self) -> &Utf8Path {
        &self.run.spec().workdir
    }

    pub fn control_node(&self) -> &Host {
        self.run.inventory().control_node()
    }

    pub fn pipeline_cache(&self) -> Cache {
        self.run.caches().pipeline()
    }

    pub fn module_cache(&self) -> Cache {
        self.run.caches().module(&self.module)
    }

    pub fn task_cache(&self) -> Cache {
        self.run.caches().task(&self.task)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.run.cancellation()
    }

    pub fn all_hosts(&self) -> &[Host] {
        self.run.inventory().all_hosts()
    }

    pub fn hosts_with_role(&self, role: Role) -> Vec<Host> {
        self.run.inventory().hosts_with_role(role)
    }

    pub fn first_master(&self) -> Option<Host> {
        self.run.inventory().first_master()
    }

    /// Facts for the named host, when gathering ran.
    pub fn host_facts(&self, name: &str) -> Option<Facts> {
        self.run
            .inventory()
            .find(name)
            .and_then(|h| h.facts().cloned())
    }
}

/// Capability view handed to one step invocation on one host.
///
/// Owns the invocation-scoped step cache; the module and task caches it
/// exposes belong to the scopes that planned the node.
pub struct StepContext {
    run: Arc<RunContext>,
    scope: NodeScope,
    host: Host,
    step_cache: Cache,
}

impl StepContext {
    pub(crate) fn new(run: Arc<RunContext>, scope: NodeScope, host: Host) -> Self {
        Self {
            run,
            scope,
            host,
            step_cache: Cache::new(),
        }
    }

    pub fn spec(&self) -> &ClusterSpec {
        self.run.spec()
    }

    pub fn workdir(&self) -> &Utf8Path {
        &self.run.spec().workdir
    }

    /// The host this invocation targets.
    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        self.host.connector()
    }

    pub fn pipeline_cache(&self) -> Cache {
        self.run.caches().pipeline()
    }

    /// Cache of the module that planned this node.
    pub fn module_cache(&self) -> Cache {
        self.run.caches().module(&self.scope.module)
    }

    /// Cache of the task that planned this node.
    pub fn task_cache(&self) -> Cache {
        self.run.caches().task(&self.scope.task)
    }

    /// Cache private to this node-host invocation.
    pub fn step_cache(&self) -> Cache {
        self.step_cache.clone()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.run.cancellation()
    }

    /// Runs a command on the invocation's host, applying the host's resolved
    /// privilege method when `privileged` is set.
    pub async fn run_command(&self, spec: CommandSpec, privileged: bool) -> Result<ExecOutput> {
        let spec = if privileged {
            spec.with_sudo(self.host.privilege())
        } else {
            spec
        };
        self.connector().exec(&spec).await
    }
}
