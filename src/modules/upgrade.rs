//! Upgrade phases: control plane first, then workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::context::TaskContext;
use crate::graph::ExecutionFragment;
use crate::host::Role;
use crate::module::Module;
use crate::step::Step;
use crate::steps::CommandStep;
use crate::task::{FragmentBuilder, Task};

/// Upgrades the control plane, one master at a time.
pub struct UpgradeControlPlaneModule;

impl Module for UpgradeControlPlaneModule {
    fn name(&self) -> &str {
        "upgrade-control-plane"
    }

    fn tasks(&self) -> Vec<Box<dyn Task>> {
        vec![Box::new(UpgradeFirstMasterTask), Box::new(UpgradeOtherMastersTask)]
    }
}

/// Guard shared by the upgrade steps: converged once the kubelet already
/// reports the target version.
fn kubelet_at_version_guard(version: &str) -> String {
    format!("kubelet --version 2>/dev/null | grep -q {}", version)
}

/// `kubeadm upgrade apply` on the first master.
struct UpgradeFirstMasterTask;

impl Task for UpgradeFirstMasterTask {
    fn name(&self) -> &str {
        "upgrade-first-master"
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let Some(first_master) = ctx.first_master() else {
            bail!("no host carries the master role");
        };
        let version = &ctx.spec().versions.kubernetes;

        let step: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "kubeadm-upgrade-apply",
                "upgrade the first control plane node",
                format!(
                    "kubeadm upgrade apply {v} -y && systemctl restart kubelet",
                    v = version
                ),
            )
            .with_guard_shell(kubelet_at_version_guard(version))
            .privileged()
            .with_timeout(Duration::from_secs(900)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        builder.add_node("apply", step, vec![first_master])?;
        builder.build()
    }
}

/// `kubeadm upgrade node` on the remaining masters, strictly one at a time
/// to keep the control plane quorate throughout.
struct UpgradeOtherMastersTask;

impl Task for UpgradeOtherMastersTask {
    fn name(&self) -> &str {
        "upgrade-other-masters"
    }

    fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(ctx.hosts_with_role(Role::Master).len() > 1)
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let masters = ctx.hosts_with_role(Role::Master);
        let Some((_, rest)) = masters.split_first() else {
            return Ok(ExecutionFragment::new(self.name()));
        };
        let version = &ctx.spec().versions.kubernetes;

        let step: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "kubeadm-upgrade-node",
                "upgrade an additional control plane node",
                "kubeadm upgrade node && systemctl restart kubelet",
            )
            .with_guard_shell(kubelet_at_version_guard(version))
            .privileged()
            .with_timeout(Duration::from_secs(900)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        builder.sequential_hosts("node", step, rest)?;
        builder.build()
    }
}

/// Upgrades worker nodes with per-host staged drains and restarts.
pub struct UpgradeWorkersModule;

impl Module for UpgradeWorkersModule {
    fn name(&self) -> &str {
        "upgrade-workers"
    }

    fn tasks(&self) -> Vec<Box<dyn Task>> {
        vec![Box::new(UpgradeWorkersTask)]
    }
}

struct UpgradeWorkersTask;

impl Task for UpgradeWorkersTask {
    fn name(&self) -> &str {
        "upgrade-workers"
    }

    fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        let workers = ctx.hosts_with_role(Role::Worker);
        Ok(workers.iter().any(|w| !w.has_role(Role::Master)))
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let workers: Vec<_> = ctx
            .hosts_with_role(Role::Worker)
            .into_iter()
            .filter(|w| !w.has_role(Role::Master))
            .collect();
        if workers.is_empty() {
            return Ok(ExecutionFragment::new(self.name()));
        }
        let version = &ctx.spec().versions.kubernetes;

        let upgrade: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "kubeadm-upgrade-node",
                "upgrade the worker's kubelet configuration",
                "kubeadm upgrade node",
            )
            .with_guard_shell(kubelet_at_version_guard(version))
            .privileged()
            .with_timeout(Duration::from_secs(600)),
        );
        let restart: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "restart-kubelet",
                "restart the kubelet after upgrade",
                "systemctl restart kubelet",
            )
            .privileged()
            .with_timeout(Duration::from_secs(120)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        builder.staged_per_host(&[("upgrade", upgrade), ("restart", restart)], &workers)?;
        builder.build()
    }
}
