//! Preflight phase: verify hosts are fit to join a cluster.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::context::{ModuleContext, TaskContext};
use crate::graph::ExecutionFragment;
use crate::host::Role;
use crate::module::Module;
use crate::steps::CommandStep;
use crate::task::{FragmentBuilder, Task, union_hosts};

/// Preflight checks across all cluster hosts.
///
/// Disabled entirely by the spec's `skip_preflight` flag.
pub struct PreflightModule;

impl Module for PreflightModule {
    fn name(&self) -> &str {
        "preflight"
    }

    fn is_required(&self, ctx: &ModuleContext) -> Result<bool> {
        Ok(!ctx.spec().skip_preflight)
    }

    fn tasks(&self) -> Vec<Box<dyn Task>> {
        vec![Box::new(SystemChecksTask), Box::new(DisableSwapTask)]
    }
}

/// Verifies base tooling and kernel on every host, in parallel.
struct SystemChecksTask;

impl Task for SystemChecksTask {
    fn name(&self) -> &str {
        "system-checks"
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let step = Arc::new(
            CommandStep::shell(
                "system-checks",
                "verify kernel and required tools are present",
                "uname -sr && command -v systemctl >/dev/null && command -v tar >/dev/null",
            )
            .with_timeout(Duration::from_secs(30)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        builder.fan_out("verify", step, ctx.all_hosts())?;
        builder.build()
    }
}

/// Turns swap off on every node that will run a kubelet.
struct DisableSwapTask;

impl Task for DisableSwapTask {
    fn name(&self) -> &str {
        "disable-swap"
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let hosts = union_hosts(&[
            ctx.hosts_with_role(Role::Master),
            ctx.hosts_with_role(Role::Worker),
        ]);
        if hosts.is_empty() {
            return Ok(ExecutionFragment::new(self.name()));
        }

        let step = Arc::new(
            CommandStep::shell(
                "disable-swap",
                "disable swap for kubelet",
                "swapoff -a && sed -i.bak '/\\sswap\\s/d' /etc/fstab",
            )
            .with_guard_shell("test -z \"$(swapon --noheadings 2>/dev/null)\"")
            .privileged()
            .with_timeout(Duration::from_secs(30)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        builder.fan_out("swapoff", step, &hosts)?;
        builder.build()
    }
}
