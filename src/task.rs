//! The task planning layer and its fragment-building helpers.
//!
//! A task is one coherent goal on a selected host set. It is queried with
//! [`Task::is_required`] before [`Task::plan`]; a non-required task is
//! logically absent from its module's composition. Tasks select hosts
//! through the context's role-indexed view, name their nodes as a pure
//! function of task name, logical step name, and host name, and declare
//! dependencies only between nodes they create — [`FragmentBuilder`]
//! enforces all three conventions.

use std::sync::Arc;

use anyhow::Result;

use crate::context::TaskContext;
use crate::error::KubeforgeError;
use crate::graph::{ExecutionFragment, ExecutionNode, NodeId, NodeScope};
use crate::host::Host;
use crate::step::Step;

/// A goal producing an [`ExecutionFragment`].
pub trait Task: Send + Sync {
    /// Stable task name; prefixes every node id this task creates.
    fn name(&self) -> &str;

    /// Whether this task contributes work for the given spec and state.
    fn is_required(&self, _ctx: &TaskContext) -> Result<bool> {
        Ok(true)
    }

    /// Produces the task's subgraph.
    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment>;
}

/// Deduplicates a union of role host groups by host name, preserving first
/// occurrence order.
pub fn union_hosts(groups: &[Vec<Host>]) -> Vec<Host> {
    let mut seen = std::collections::BTreeSet::new();
    let mut result = Vec::new();
    for group in groups {
        for host in group {
            if seen.insert(host.name().to_string()) {
                result.push(host.clone());
            }
        }
    }
    result
}

/// Builds a task's fragment with deterministic node naming.
///
/// Node ids are `<task>/<step>` for single nodes and `<task>/<step>@<host>`
/// for per-host nodes. [`FragmentBuilder::build`] recomputes the entry/exit
/// sets and validates the fragment, so a task can only ever hand its module
/// a well-formed subgraph.
pub struct FragmentBuilder {
    task: String,
    fragment: ExecutionFragment,
}

impl FragmentBuilder {
    pub fn new(task_name: &str) -> Self {
        Self {
            task: task_name.to_string(),
            fragment: ExecutionFragment::new(task_name),
        }
    }

    fn scope(&self) -> NodeScope {
        NodeScope {
            module: String::new(),
            task: self.task.clone(),
        }
    }

    /// Id of a single (non-per-host) node.
    pub fn node_id(&self, step_key: &str) -> NodeId {
        NodeId::new(format!("{}/{}", self.task, step_key))
    }

    /// Id of a per-host node.
    pub fn host_node_id(&self, step_key: &str, host: &Host) -> NodeId {
        NodeId::new(format!("{}/{}@{}", self.task, step_key, host.name()))
    }

    /// Adds one node running `step` across `hosts`.
    pub fn add_node(
        &mut self,
        step_key: &str,
        step: Arc<dyn Step>,
        hosts: Vec<Host>,
    ) -> Result<NodeId> {
        let id = self.node_id(step_key);
        let name = format!("{} [{}]", id, step.meta().name);
        let node = ExecutionNode::new(id.clone(), name, step, hosts).with_scope(self.scope());
        self.fragment.add_node(node).map_err(KubeforgeError::Plan)?;
        Ok(id)
    }

    /// Adds one node pinned to a single host, id-suffixed with the host name.
    pub fn add_host_node(
        &mut self,
        step_key: &str,
        step: Arc<dyn Step>,
        host: &Host,
    ) -> Result<NodeId> {
        let id = self.host_node_id(step_key, host);
        let name = format!("{} [{}]", id, step.meta().name);
        let node =
            ExecutionNode::new(id.clone(), name, step, vec![host.clone()]).with_scope(self.scope());
        self.fragment.add_node(node).map_err(KubeforgeError::Plan)?;
        Ok(id)
    }

    /// Declares that `node` depends on `on`. Both must belong to this task.
    pub fn depend(&mut self, node: &NodeId, on: &NodeId) -> Result<()> {
        if self.fragment.node(on).is_none() {
            return Err(KubeforgeError::Plan(crate::graph::GraphError::UnknownNode(on.clone())).into());
        }
        let target = self
            .fragment
            .nodes_mut()
            .get_mut(node)
            .ok_or_else(|| {
                KubeforgeError::Plan(crate::graph::GraphError::UnknownNode(node.clone()))
            })?;
        target.deps.insert(on.clone());
        Ok(())
    }

    /// Per-host fan-out: one node per host, all parallel.
    pub fn fan_out(
        &mut self,
        step_key: &str,
        step: Arc<dyn Step>,
        hosts: &[Host],
    ) -> Result<Vec<NodeId>> {
        let mut ids = Vec::with_capacity(hosts.len());
        for host in hosts {
            ids.push(self.add_host_node(step_key, Arc::clone(&step), host)?);
        }
        Ok(ids)
    }

    /// Staged per-host: for each host a sequential chain of the given
    /// stages. Returns the first-stage ids (entries) and last-stage ids
    /// (exits).
    pub fn staged_per_host(
        &mut self,
        stages: &[(&str, Arc<dyn Step>)],
        hosts: &[Host],
    ) -> Result<(Vec<NodeId>, Vec<NodeId>)> {
        let mut entries = Vec::with_capacity(hosts.len());
        let mut exits = Vec::with_capacity(hosts.len());
        for host in hosts {
            let mut previous: Option<NodeId> = None;
            for (step_key, step) in stages {
                let id = self.add_host_node(step_key, Arc::clone(step), host)?;
                if let Some(prev) = &previous {
                    self.depend(&id, prev)?;
                } else {
                    entries.push(id.clone());
                }
                previous = Some(id);
            }
            if let Some(last) = previous {
                exits.push(last);
            }
        }
        Ok((entries, exits))
    }

    /// One node per host, chained host-to-host in the given order.
    ///
    /// Used where hosts must converge one at a time, e.g. rolling control
    /// plane upgrades.
    pub fn sequential_hosts(
        &mut self,
        step_key: &str,
        step: Arc<dyn Step>,
        hosts: &[Host],
    ) -> Result<Vec<NodeId>> {
        let mut ids: Vec<NodeId> = Vec::with_capacity(hosts.len());
        for host in hosts {
            let id = self.add_host_node(step_key, Arc::clone(&step), host)?;
            if let Some(prev) = ids.last() {
                let prev = prev.clone();
                self.depend(&id, &prev)?;
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Finalizes the fragment: recomputes entry/exit sets and validates.
    pub fn build(mut self) -> Result<ExecutionFragment> {
        self.fragment.calculate_entry_and_exit_nodes();
        self.fragment.validate().map_err(KubeforgeError::Plan)?;
        Ok(self.fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{CommandSpec, Connector, ExecOutput, FileStat, TransferSource};
    use crate::context::StepContext;
    use crate::step::StepMeta;
    use async_trait::async_trait;
    use camino::Utf8Path;

    struct NullConnector;

    #[async_trait]
    impl Connector for NullConnector {
        async fn exec(&self, _spec: &CommandSpec) -> Result<ExecOutput> {
            Ok(ExecOutput::default())
        }

        async fn put(
            &self,
            _source: &TransferSource,
            _dest: &Utf8Path,
            _mode: u32,
        ) -> Result<()> {
            Ok(())
        }

        async fn fetch(&self, _path: &Utf8Path) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn stat(&self, _path: &Utf8Path) -> Result<Option<FileStat>> {
            Ok(None)
        }
    }

    struct NoopStep {
        meta: StepMeta,
    }

    impl NoopStep {
        fn new() -> Arc<dyn Step> {
            Arc::new(Self {
                meta: StepMeta::new("noop", "does nothing"),
            })
        }
    }

    #[async_trait]
    impl Step for NoopStep {
        fn meta(&self) -> &StepMeta {
            &self.meta
        }

        async fn precheck(&self, _ctx: &StepContext) -> Result<bool> {
            Ok(false)
        }

        async fn run(&self, _ctx: &StepContext) -> Result<()> {
            Ok(())
        }
    }

    fn host(name: &str) -> Host {
        Host::builder(name, Arc::new(NullConnector)).build()
    }

    #[test]
    fn node_ids_are_pure_functions_of_names() {
        let builder = FragmentBuilder::new("etcd-pki");
        assert_eq!(builder.node_id("generate").as_str(), "etcd-pki/generate");
        assert_eq!(
            builder.host_node_id("distribute", &host("m1")).as_str(),
            "etcd-pki/distribute@m1"
        );
    }

    #[test]
    fn fan_out_is_fully_parallel() {
        let hosts = [host("a"), host("b"), host("c")];
        let mut builder = FragmentBuilder::new("deploy");
        builder.fan_out("unit", NoopStep::new(), &hosts).unwrap();
        let fragment = builder.build().unwrap();

        assert_eq!(fragment.len(), 3);
        assert_eq!(fragment.entry_nodes().len(), 3);
        assert_eq!(fragment.exit_nodes().len(), 3);
    }

    #[test]
    fn staged_per_host_chains_within_host_only() {
        let hosts = [host("a"), host("b")];
        let mut builder = FragmentBuilder::new("runtime");
        let (entries, exits) = builder
            .staged_per_host(
                &[("install", NoopStep::new()), ("enable", NoopStep::new())],
                &hosts,
            )
            .unwrap();
        let fragment = builder.build().unwrap();

        assert_eq!(fragment.len(), 4);
        assert_eq!(entries.len(), 2);
        assert_eq!(exits.len(), 2);
        assert_eq!(fragment.entry_nodes(), entries.as_slice());

        let enable_a = NodeId::from("runtime/enable@a");
        let deps = &fragment.node(&enable_a).unwrap().deps;
        assert_eq!(deps.len(), 1);
        assert!(deps.contains(&NodeId::from("runtime/install@a")));
    }

    #[test]
    fn sequential_hosts_chain_in_order() {
        let hosts = [host("m1"), host("m2"), host("m3")];
        let mut builder = FragmentBuilder::new("upgrade");
        let ids = builder
            .sequential_hosts("apply", NoopStep::new(), &hosts)
            .unwrap();
        let fragment = builder.build().unwrap();

        assert_eq!(fragment.entry_nodes(), &ids[..1]);
        assert_eq!(fragment.exit_nodes(), &ids[2..]);
        assert!(fragment.node(&ids[2]).unwrap().deps.contains(&ids[1]));
    }

    #[test]
    fn depend_rejects_foreign_ids() {
        let mut builder = FragmentBuilder::new("t");
        let id = builder.add_node("only", NoopStep::new(), vec![host("a")]).unwrap();
        let err = builder.depend(&id, &NodeId::from("other-task/node")).unwrap_err();
        assert!(err.to_string().contains("unknown node"));
    }

    #[test]
    fn union_hosts_deduplicates_by_name() {
        let masters = vec![host("m1"), host("m2")];
        let workers = vec![host("m2"), host("w1")];
        let all = union_hosts(&[masters, workers]);
        let names: Vec<&str> = all.iter().map(Host::name).collect();
        assert_eq!(names, vec!["m1", "m2", "w1"]);
    }
}
