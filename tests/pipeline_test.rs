//! Pipeline composition tests: module sequencing, skip semantics, planning
//! determinism, and plan-time failure handling.

mod helpers;

use std::sync::Arc;

use anyhow::Result;
use kubeforge::config::ClusterSpec;
use kubeforge::connector::LocalConnectorFactory;
use kubeforge::context::{ModuleContext, PipelineContext, RunContext, TaskContext};
use kubeforge::engine::Engine;
use kubeforge::graph::{ExecutionFragment, ExecutionGraph, NodeId};
use kubeforge::host::Inventory;
use kubeforge::module::Module;
use kubeforge::modules::PreflightModule;
use kubeforge::pipeline::Pipeline;
use kubeforge::pipelines::create_pipeline;
use kubeforge::result::RunStatus;
use kubeforge::task::{FragmentBuilder, Task};

use helpers::MockStep;

fn spec_from(yaml: &str) -> ClusterSpec {
    let spec: ClusterSpec = serde_yaml::from_str(yaml).expect("spec parses");
    spec.validate().expect("spec validates");
    spec
}

fn ctx_for(spec: ClusterSpec) -> PipelineContext {
    let inventory =
        Inventory::from_spec(&spec, &LocalConnectorFactory).expect("inventory builds");
    PipelineContext::new(RunContext::new(Arc::new(spec), inventory, Engine::new(4)))
}

fn ha_cluster_ctx() -> PipelineContext {
    let yaml = yaml! {
        r#"
        name: demo
        hosts:
          - name: m1
            address: 10.0.0.10
            roles: [master, etcd]
          - name: m2
            address: 10.0.0.11
            roles: [master, etcd]
          - name: w1
            address: 10.0.0.20
            roles: [worker]
        defaults:
          privilege:
            method: sudo
        versions:
          kubernetes: v1.29.3
        high_availability:
          type: kube-vip
          vip: 10.0.0.100
          interface: eth0
        cni:
          type: calico
        addons:
          - metrics-server
        "#
    };
    ctx_for(spec_from(&yaml))
}

/// One control-node node per task, for composition tests.
struct OneNodeTask {
    task_name: String,
    step: Arc<MockStep>,
}

impl OneNodeTask {
    fn new(task_name: &str) -> Self {
        Self {
            task_name: task_name.to_string(),
            step: Arc::new(MockStep::new(task_name)),
        }
    }
}

impl Task for OneNodeTask {
    fn name(&self) -> &str {
        &self.task_name
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let mut builder = FragmentBuilder::new(self.name());
        builder.add_node("work", self.step.clone(), vec![ctx.control_node().clone()])?;
        builder.build()
    }
}

struct OneTaskModule {
    module_name: String,
    task_names: Vec<String>,
}

impl OneTaskModule {
    fn new(module_name: &str, task_names: &[&str]) -> Self {
        Self {
            module_name: module_name.to_string(),
            task_names: task_names.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Module for OneTaskModule {
    fn name(&self) -> &str {
        &self.module_name
    }

    fn tasks(&self) -> Vec<Box<dyn Task>> {
        self.task_names
            .iter()
            .map(|name| Box::new(OneNodeTask::new(name)) as Box<dyn Task>)
            .collect()
    }
}

/// Flattened shape of a graph for equality assertions.
fn shape(graph: &ExecutionGraph) -> (Vec<(String, Vec<String>)>, Vec<String>, Vec<String>) {
    let nodes = graph
        .nodes()
        .iter()
        .map(|(id, node)| {
            (
                id.to_string(),
                node.deps.iter().map(NodeId::to_string).collect(),
            )
        })
        .collect();
    let entries = graph.entry_nodes().iter().map(NodeId::to_string).collect();
    let exits = graph.exit_nodes().iter().map(NodeId::to_string).collect();
    (nodes, entries, exits)
}

#[tokio::test]
async fn disabled_preflight_yields_empty_successful_run() {
    let yaml = yaml! {
        r#"
        name: trivial
        skip_preflight: true
        hosts:
          - name: m1
            address: 10.0.0.10
            roles: [master, etcd]
        versions:
          kubernetes: v1.29.3
        cni:
          type: calico
        "#
    };
    let ctx = ctx_for(spec_from(&yaml));
    let pipeline = Pipeline::new("create-cluster", vec![Box::new(PreflightModule)]);

    let result = pipeline.run(&ctx, None, false).await.unwrap();
    assert_eq!(result.status, RunStatus::Success);
    assert!(result.nodes.is_empty(), "a fully skipped pipeline plans no nodes");
}

#[tokio::test]
async fn modules_are_sequenced_by_exit_to_entry_links() {
    let ctx = ha_cluster_ctx();
    let pipeline = Pipeline::new(
        "two-phases",
        vec![
            Box::new(OneTaskModule::new("phase-a", &["one"])),
            Box::new(OneTaskModule::new("phase-b", &["two"])),
        ],
    );

    let graph = pipeline.plan(&ctx).unwrap();
    assert_eq!(graph.len(), 2);
    assert_eq!(graph.entry_nodes(), &[NodeId::from("one/work")]);
    assert_eq!(graph.exit_nodes(), &[NodeId::from("two/work")]);
    let second = graph.node(&NodeId::from("two/work")).unwrap();
    assert!(second.deps.contains(&NodeId::from("one/work")));

    let result = pipeline.run(&ctx, Some(graph), false).await.unwrap();
    assert_eq!(result.status, RunStatus::Success);
}

#[test]
fn tasks_within_a_module_are_sequential() {
    let ctx = ha_cluster_ctx();
    let module = OneTaskModule::new("phase", &["first", "second", "third"]);
    let module_ctx: ModuleContext = ctx.module(module.name());

    let fragment = module.plan(&module_ctx).unwrap();
    assert_eq!(fragment.len(), 3);
    assert_eq!(fragment.entry_nodes(), &[NodeId::from("first/work")]);
    assert_eq!(fragment.exit_nodes(), &[NodeId::from("third/work")]);
    let third = fragment.node(&NodeId::from("third/work")).unwrap();
    assert!(third.deps.contains(&NodeId::from("second/work")));
}

#[test]
fn planning_is_deterministic() {
    let ctx = ha_cluster_ctx();
    let first = create_pipeline().plan(&ctx).unwrap();
    let second = create_pipeline().plan(&ctx).unwrap();
    assert_eq!(shape(&first), shape(&second));
}

#[test]
fn create_plan_wires_phases_across_modules() {
    let ctx = ha_cluster_ctx();
    let graph = create_pipeline().plan(&ctx).unwrap();
    graph.validate().unwrap();

    // Spot checks across the phase boundary: the etcd PKI pre-stage starts
    // only after the container runtime is up everywhere.
    let generate = graph.node(&NodeId::from("etcd-pki/generate")).unwrap();
    for host in ["m1", "m2", "w1"] {
        let exit = NodeId::from(format!("container-runtime/enable@{}", host).as_str());
        assert!(
            generate.deps.contains(&exit),
            "etcd PKI must wait for the runtime on {}",
            host
        );
    }

    // The single init node exists and the CNI apply chain hangs off the
    // control plane.
    assert!(graph.node(&NodeId::from("init-control-plane/kubeadm-init")).is_some());
    let fetch = graph.node(&NodeId::from("apply-cni/fetch")).unwrap();
    assert!(
        fetch.deps.iter().any(|d| d.as_str().starts_with("join-")),
        "network phase must wait for the control plane joins"
    );

    // kube-vip topology plans manifests on both masters and nothing for
    // the other HA variants.
    assert!(graph.node(&NodeId::from("kube-vip-manifest/manifest@m1")).is_some());
    assert!(graph.node(&NodeId::from("kube-vip-manifest/manifest@m2")).is_some());
    assert!(graph.node(&NodeId::from("probe-external-lb/probe")).is_none());

    // The addon list contributed exactly one apply node.
    assert!(graph.node(&NodeId::from("apply-addons/metrics-server")).is_some());
}

#[tokio::test]
async fn duplicate_node_ids_abort_planning_before_execution() {
    let ctx = ha_cluster_ctx();
    let pipeline = Pipeline::new(
        "broken",
        vec![Box::new(OneTaskModule::new("phase", &["dup", "dup"]))],
    );

    let err = pipeline.run(&ctx, None, false).await.unwrap_err();
    assert!(err.to_string().contains("failed to plan module phase"));
    let root = format!("{:#}", err);
    assert!(root.contains("duplicate node id"), "got: {}", root);
}

#[tokio::test]
async fn pipeline_without_modules_runs_to_empty_success() {
    let ctx = ha_cluster_ctx();
    let pipeline = Pipeline::new("noop", Vec::new());
    let result = pipeline.run(&ctx, None, true).await.unwrap();
    assert_eq!(result.status, RunStatus::Success);
    assert!(result.nodes.is_empty());
}

#[tokio::test]
async fn dry_run_of_full_create_pipeline_succeeds() {
    let ctx = ha_cluster_ctx();
    let result = create_pipeline().run(&ctx, None, true).await.unwrap();
    assert_eq!(result.status, RunStatus::Success);
    assert!(!result.nodes.is_empty());
    for node in result.nodes.values() {
        assert!(node.hosts.iter().all(|i| i.message.as_deref() == Some("dry-run")));
    }
}
