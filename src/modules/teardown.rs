//! Teardown phase for the delete pipeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::context::TaskContext;
use crate::graph::ExecutionFragment;
use crate::host::Role;
use crate::module::Module;
use crate::step::Step;
use crate::steps::CommandStep;
use crate::task::{FragmentBuilder, Task, union_hosts};

/// Resets every node and removes cluster state from the control node.
pub struct TeardownModule;

impl Module for TeardownModule {
    fn name(&self) -> &str {
        "teardown"
    }

    fn tasks(&self) -> Vec<Box<dyn Task>> {
        vec![Box::new(ResetNodesTask), Box::new(CleanupControlNodeTask)]
    }
}

/// Per host: stop workloads, `kubeadm reset`, wipe state directories.
///
/// The drain is best-effort — on a half-broken cluster it routinely fails,
/// and that must not stop the reset from running.
struct ResetNodesTask;

impl Task for ResetNodesTask {
    fn name(&self) -> &str {
        "reset-nodes"
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let hosts = union_hosts(&[
            ctx.hosts_with_role(Role::Master),
            ctx.hosts_with_role(Role::Worker),
            ctx.hosts_with_role(Role::Etcd),
        ]);
        if hosts.is_empty() {
            return Ok(ExecutionFragment::new(self.name()));
        }

        let stop: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "stop-services",
                "stop kubelet and etcd services",
                "systemctl stop kubelet etcd 2>/dev/null || true",
            )
            .privileged()
            .ignore_failure()
            .with_timeout(Duration::from_secs(120)),
        );
        let reset: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "kubeadm-reset",
                "reset kubeadm state",
                "kubeadm reset -f",
            )
            .with_guard_shell("test ! -f /etc/kubernetes/kubelet.conf")
            .privileged()
            .ignore_failure()
            .with_timeout(Duration::from_secs(300)),
        );
        let cleanup: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "wipe-state",
                "remove cluster state directories",
                "rm -rf /etc/kubernetes /var/lib/etcd /etc/etcd /etc/haproxy",
            )
            .privileged()
            .with_timeout(Duration::from_secs(120)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        builder.staged_per_host(
            &[("stop", stop), ("reset", reset), ("cleanup", cleanup)],
            &hosts,
        )?;
        builder.build()
    }
}

/// Removes this cluster's PKI and rendered files from the control node.
///
/// The shared download cache is deliberately left in place.
struct CleanupControlNodeTask;

impl Task for CleanupControlNodeTask {
    fn name(&self) -> &str {
        "cleanup-control-node"
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let spec = ctx.spec();
        let step: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "remove-cluster-state",
                "remove the cluster's PKI and rendered manifests",
                format!("rm -rf {} {}", spec.pki_dir(), spec.rendered_dir()),
            )
            .with_timeout(Duration::from_secs(60)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        builder.add_node("remove", step, vec![ctx.control_node().clone()])?;
        builder.build()
    }
}
