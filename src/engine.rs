//! DAG execution engine.
//!
//! The engine consumes a validated [`ExecutionGraph`] and produces a
//! [`GraphExecutionResult`]. Scheduling is in-degree driven: nodes become
//! ready when every dependency has reached a terminal state, a bounded
//! worker pool executes ready nodes concurrently, and each node fans out
//! across its hosts up to a per-node host-concurrency cap.
//!
//! A node failure does not stop the run; only the failed node's transitive
//! dependents are skipped (recorded with an upstream-failed reason). Steps
//! whose meta sets `ignore_failure` gate downstream as success while still
//! recording the failure. Cancellation stops new scheduling, aborts
//! in-flight step invocations, and finalizes with a cancellation cause.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::{PipelineContext, RunContext, StepContext};
use crate::error::{KubeforgeError, is_transport_error};
use crate::graph::{ExecutionGraph, ExecutionNode, NodeId, NodeScope};
use crate::host::Host;
use crate::result::{
    GraphExecutionResult, HostInvocation, HostStatus, NodeResult, NodeStatus, RunStatus,
};
use crate::step::Step;

/// Upper bound on the node worker pool regardless of host or CPU count.
const MAX_WORKERS: usize = 32;

/// Default cap on concurrent per-host invocations within one node.
const DEFAULT_HOST_CONCURRENCY: usize = 8;

/// The graph scheduler.
#[derive(Debug, Clone)]
pub struct Engine {
    concurrency: usize,
    host_concurrency: usize,
    deadline: Option<Duration>,
}

impl Engine {
    /// Creates an engine with an explicit worker-pool size.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.clamp(1, MAX_WORKERS),
            host_concurrency: DEFAULT_HOST_CONCURRENCY,
            deadline: None,
        }
    }

    /// Derives the worker-pool size from host count and CPU count, capped.
    pub fn with_defaults(host_count: usize) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(host_count.max(2).min(cpus * 2))
    }

    /// Caps concurrent per-host invocations within one node.
    #[must_use]
    pub fn with_host_concurrency(mut self, host_concurrency: usize) -> Self {
        self.host_concurrency = host_concurrency.max(1);
        self
    }

    /// Sets a graph-level deadline; the run is cancelled when it elapses.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Executes the graph and aggregates per-node, per-host outcomes.
    ///
    /// Only graph invalidity is an `Err`; step failures are recorded in the
    /// returned result.
    pub async fn execute(
        &self,
        ctx: &PipelineContext,
        graph: &ExecutionGraph,
        dry_run: bool,
    ) -> Result<GraphExecutionResult, KubeforgeError> {
        graph.validate()?;

        if graph.is_empty() {
            return Ok(GraphExecutionResult::empty_success(graph.name()));
        }

        let started_at = SystemTime::now();
        let run_id = Uuid::new_v4();
        info!(
            graph = graph.name(),
            nodes = graph.len(),
            concurrency = self.concurrency,
            dry_run,
            "executing graph"
        );

        let cancel = ctx.cancellation().child_token();
        let deadline_guard = self.deadline.map(|limit| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(?limit, "graph deadline reached, cancelling run");
                cancel.cancel();
            })
        });

        let mut indegree: BTreeMap<NodeId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for (id, node) in graph.nodes() {
            indegree.insert(id.clone(), node.deps.len());
            for dep in &node.deps {
                dependents.entry(dep.clone()).or_default().push(id.clone());
            }
        }

        let mut ready: VecDeque<NodeId> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let pool = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<(NodeId, NodeResult)> = JoinSet::new();
        let mut results: BTreeMap<NodeId, NodeResult> = BTreeMap::new();
        // Nodes whose terminal state gates downstream nodes as failed.
        let mut poisoned: BTreeSet<NodeId> = BTreeSet::new();
        // Terminal nodes whose dependents still need in-degree updates.
        let mut settled: VecDeque<NodeId> = VecDeque::new();
        let mut first_failure: Option<String> = None;

        loop {
            // Propagate terminal states to dependents.
            while let Some(done) = settled.pop_front() {
                let Some(deps) = dependents.get(&done) else {
                    continue;
                };
                for dep_id in deps.clone() {
                    let degree = indegree
                        .get_mut(&dep_id)
                        .expect("dependent is a graph node");
                    *degree -= 1;
                    if *degree != 0 {
                        continue;
                    }
                    let node = graph.node(&dep_id).expect("dependent is a graph node");
                    if cancel.is_cancelled() {
                        results.insert(
                            dep_id.clone(),
                            NodeResult::skipped(
                                dep_id.clone(),
                                node.name.clone(),
                                "cancelled before start".to_string(),
                            ),
                        );
                        settled.push_back(dep_id);
                    } else if let Some(bad) = node.deps.iter().find(|dep| poisoned.contains(*dep)) {
                        debug!(node = %dep_id, upstream = %bad, "skipping node, upstream failed");
                        results.insert(
                            dep_id.clone(),
                            NodeResult::skipped(
                                dep_id.clone(),
                                node.name.clone(),
                                format!("upstream node failed: {}", bad),
                            ),
                        );
                        poisoned.insert(dep_id.clone());
                        settled.push_back(dep_id);
                    } else {
                        ready.push_back(dep_id);
                    }
                }
            }

            // Schedule everything that is ready.
            while let Some(id) = ready.pop_front() {
                if cancel.is_cancelled() {
                    let node = graph.node(&id).expect("ready node is a graph node");
                    results.insert(
                        id.clone(),
                        NodeResult::skipped(
                            id.clone(),
                            node.name.clone(),
                            "cancelled before start".to_string(),
                        ),
                    );
                    settled.push_back(id);
                    continue;
                }
                let node = graph.node(&id).expect("ready node is a graph node").clone();
                join_set.spawn(Self::execute_node(
                    Arc::clone(ctx.run_state()),
                    node,
                    dry_run,
                    Arc::clone(&pool),
                    self.host_concurrency,
                    cancel.clone(),
                ));
            }

            if !settled.is_empty() {
                continue;
            }

            // Wait for the next node to finish.
            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok((id, node_result)) => {
                    let ignore = graph
                        .node(&id)
                        .map(|n| n.step.meta().ignore_failure)
                        .unwrap_or(false);
                    if node_result.status == NodeStatus::Failed {
                        if let Some(invocation) = node_result.first_failure()
                            && first_failure.is_none()
                        {
                            first_failure = invocation.error.clone();
                        }
                        if ignore {
                            warn!(node = %id, "node failed but is marked ignore-on-failure");
                        } else {
                            poisoned.insert(id.clone());
                        }
                    }
                    results.insert(id.clone(), node_result);
                    settled.push_back(id);
                }
                Err(join_error) => {
                    error!(error = %join_error, "node execution task aborted");
                    cancel.cancel();
                }
            }
        }

        if let Some(guard) = deadline_guard {
            guard.abort();
        }

        // Any node without a result was unreachable: either scheduling
        // stopped on cancellation or an upstream never settled.
        let cancelled = cancel.is_cancelled();
        for (id, node) in graph.nodes() {
            if !results.contains_key(id) {
                let reason = if cancelled {
                    "cancelled before start"
                } else {
                    "not scheduled"
                };
                results.insert(
                    id.clone(),
                    NodeResult::skipped(id.clone(), node.name.clone(), reason.to_string()),
                );
            }
        }

        let any_failed = results.values().any(|r| r.status == NodeStatus::Failed);
        let incomplete = results.values().any(|r| {
            r.skip_reason
                .as_deref()
                .is_some_and(|reason| reason.starts_with("cancelled"))
        });
        let status = if any_failed || (cancelled && incomplete) {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        let failure = first_failure.or_else(|| {
            (cancelled && incomplete).then(|| KubeforgeError::Cancelled.to_string())
        });

        info!(graph = graph.name(), status = %status, "graph execution finished");
        Ok(GraphExecutionResult {
            graph_name: graph.name().to_string(),
            run_id,
            status,
            cancelled: cancelled && incomplete,
            failure,
            nodes: results,
            started_at,
            ended_at: SystemTime::now(),
        })
    }

    /// Runs every host invocation of one node and aggregates its status.
    async fn execute_node(
        run: Arc<RunContext>,
        node: ExecutionNode,
        dry_run: bool,
        pool: Arc<Semaphore>,
        host_concurrency: usize,
        cancel: CancellationToken,
    ) -> (NodeId, NodeResult) {
        let permit = pool
            .acquire_owned()
            .await
            .expect("worker pool semaphore is never closed");
        let started_at = SystemTime::now();
        debug!(node = %node.id, hosts = node.hosts.len(), "node started");

        let mut invocations = Vec::with_capacity(node.hosts.len());
        if dry_run {
            for host in &node.hosts {
                invocations.push(HostInvocation::success(
                    host.name(),
                    Some("dry-run".to_string()),
                    SystemTime::now(),
                ));
            }
        } else {
            let host_pool = Arc::new(Semaphore::new(host_concurrency));
            let mut host_set = JoinSet::new();
            for host in node.hosts.clone() {
                host_set.spawn(Self::run_host_invocation(
                    Arc::clone(&run),
                    Arc::clone(&node.step),
                    node.scope.clone(),
                    host,
                    Arc::clone(&host_pool),
                    cancel.clone(),
                ));
            }
            while let Some(joined) = host_set.join_next().await {
                match joined {
                    Ok(invocation) => invocations.push(invocation),
                    Err(join_error) => {
                        error!(node = %node.id, error = %join_error, "host invocation task aborted");
                        invocations.push(HostInvocation::failed(
                            "<unknown>",
                            format!("step panicked: {}", join_error),
                            started_at,
                        ));
                    }
                }
            }
            invocations.sort_by(|a, b| a.host.cmp(&b.host));
        }
        drop(permit);

        let status = if invocations.iter().any(|i| i.status == HostStatus::Failed) {
            NodeStatus::Failed
        } else {
            NodeStatus::Success
        };
        match status {
            NodeStatus::Failed => warn!(node = %node.id, "node failed"),
            _ => debug!(node = %node.id, "node finished"),
        }

        let result = NodeResult {
            node_id: node.id.clone(),
            name: node.name.clone(),
            status,
            skip_reason: None,
            hosts: invocations,
            started_at: Some(started_at),
            ended_at: Some(SystemTime::now()),
        };
        (node.id, result)
    }

    /// Drives the step contract for one host: precheck, then run with the
    /// step's retry policy for transport failures.
    async fn run_host_invocation(
        run: Arc<RunContext>,
        step: Arc<dyn Step>,
        scope: NodeScope,
        host: Host,
        host_pool: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> HostInvocation {
        let started_at = SystemTime::now();
        let host_name = host.name().to_string();

        let _permit = tokio::select! {
            permit = host_pool.acquire_owned() => {
                permit.expect("host semaphore is never closed")
            }
            _ = cancel.cancelled() => {
                return HostInvocation::failed(
                    &host_name,
                    KubeforgeError::Cancelled.to_string(),
                    started_at,
                );
            }
        };

        let meta = step.meta().clone();
        let ctx = StepContext::new(run, scope, host);

        let precheck = tokio::select! {
            result = step.precheck(&ctx) => result,
            _ = cancel.cancelled() => {
                return HostInvocation::failed(
                    &host_name,
                    KubeforgeError::Cancelled.to_string(),
                    started_at,
                );
            }
        };
        match precheck {
            Err(e) => {
                let err = KubeforgeError::Precheck {
                    step: meta.name.clone(),
                    host: host_name.clone(),
                    reason: format!("{:#}", e),
                };
                warn!(step = %meta.name, host = %host_name, "precheck failed");
                return HostInvocation::failed(&host_name, err.to_string(), started_at);
            }
            Ok(true) => {
                debug!(step = %meta.name, host = %host_name, "already converged, skipping");
                return HostInvocation::skipped(&host_name, "already converged", started_at);
            }
            Ok(false) => {}
        }

        let max_attempts = meta.retry.as_ref().map(|r| r.attempts.max(1)).unwrap_or(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                result = step.run(&ctx) => result,
                _ = cancel.cancelled() => {
                    return HostInvocation::failed(
                        &host_name,
                        KubeforgeError::Cancelled.to_string(),
                        started_at,
                    );
                }
            };
            match outcome {
                Ok(()) => {
                    let message =
                        (attempt > 1).then(|| format!("succeeded after {} attempts", attempt));
                    debug!(step = %meta.name, host = %host_name, "step succeeded");
                    return HostInvocation::success(&host_name, message, started_at);
                }
                Err(e) if is_transport_error(&e) && attempt < max_attempts => {
                    let policy = meta.retry.as_ref().expect("retry policy present");
                    let delay = policy.delay_for(attempt);
                    warn!(
                        step = %meta.name,
                        host = %host_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transport error, retrying after delay"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return HostInvocation::failed(
                                &host_name,
                                KubeforgeError::Cancelled.to_string(),
                                started_at,
                            );
                        }
                    }
                }
                Err(e) => {
                    let err = KubeforgeError::Run {
                        step: meta.name.clone(),
                        host: host_name.clone(),
                        reason: format!("{:#}", e),
                    };
                    error!(step = %meta.name, host = %host_name, error = %err, "step failed");
                    return HostInvocation::failed(&host_name, err.to_string(), started_at);
                }
            }
        }
    }

    /// Best-effort rollback pass over a failed result.
    ///
    /// Walks nodes that ran (any non-skipped host invocation) in reverse
    /// dependency order and invokes each step's rollback on those hosts.
    /// Rollback errors are logged and do not abort the pass.
    pub async fn rollback(
        &self,
        ctx: &PipelineContext,
        graph: &ExecutionGraph,
        result: &GraphExecutionResult,
    ) -> Result<(), KubeforgeError> {
        graph.validate()?;

        let mut order = topological_order(graph);
        order.reverse();

        for id in order {
            let Some(node) = graph.node(&id) else {
                continue;
            };
            let Some(node_result) = result.nodes.get(&id) else {
                continue;
            };
            let ran_hosts: BTreeSet<&str> = node_result
                .hosts
                .iter()
                .filter(|i| i.status != HostStatus::Skipped)
                .map(|i| i.host.as_str())
                .collect();
            if ran_hosts.is_empty() {
                continue;
            }
            for host in node.hosts.iter().filter(|h| ran_hosts.contains(h.name())) {
                info!(node = %id, host = host.name(), "rolling back");
                let step_ctx =
                    StepContext::new(Arc::clone(ctx.run_state()), node.scope.clone(), host.clone());
                if let Err(e) = node.step.rollback(&step_ctx).await {
                    warn!(node = %id, host = host.name(), error = %format!("{:#}", e), "rollback failed");
                }
            }
        }
        Ok(())
    }
}

/// Kahn's algorithm over the dependency relation; ties resolve in id order.
fn topological_order(graph: &ExecutionGraph) -> Vec<NodeId> {
    let mut indegree: BTreeMap<&NodeId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
    for (id, node) in graph.nodes() {
        indegree.insert(id, node.deps.len());
        for dep in &node.deps {
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut ready: VecDeque<&NodeId> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(graph.len());
    while let Some(id) = ready.pop_front() {
        order.push(id.clone());
        for dep_id in dependents.get(id).cloned().unwrap_or_default() {
            let degree = indegree.get_mut(dep_id).expect("dependent is a graph node");
            *degree -= 1;
            if *degree == 0 {
                ready.push_back(dep_id);
            }
        }
    }
    order
}
