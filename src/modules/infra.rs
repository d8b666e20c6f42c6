//! Infrastructure phase: workdir layout, artifact downloads, container
//! runtime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::connector::TransferSource;
use crate::context::TaskContext;
use crate::graph::ExecutionFragment;
use crate::host::Role;
use crate::module::Module;
use crate::step::{RetryPolicy, Step};
use crate::steps::{CommandStep, EnsureDirStep, UploadStep};
use crate::task::{FragmentBuilder, Task, union_hosts};

/// Pipeline-cache key under which the PKI directory path is handed to later
/// modules.
pub const PKI_DIR_KEY: &str = "infra/pki-dir";

/// Prepares the control node and every cluster host for component installs.
pub struct InfraModule;

impl Module for InfraModule {
    fn name(&self) -> &str {
        "infrastructure"
    }

    fn tasks(&self) -> Vec<Box<dyn Task>> {
        vec![
            Box::new(WorkdirLayoutTask),
            Box::new(DownloadArtifactsTask),
            Box::new(ContainerRuntimeTask),
        ]
    }
}

/// Creates the workdir layout on the control node.
struct WorkdirLayoutTask;

impl Task for WorkdirLayoutTask {
    fn name(&self) -> &str {
        "workdir-layout"
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let spec = ctx.spec();
        let paths = vec![
            spec.pki_dir(),
            spec.downloads_dir(),
            spec.extract_dir(),
            spec.rendered_dir(),
        ];

        // Handoff for later modules that distribute PKI material.
        ctx.pipeline_cache().insert(PKI_DIR_KEY, spec.pki_dir());

        let step = Arc::new(EnsureDirStep::new(
            "workdir-layout",
            "create the workdir directory layout",
            paths,
        ));

        let mut builder = FragmentBuilder::new(self.name());
        builder.add_node("create", step, vec![ctx.control_node().clone()])?;
        builder.build()
    }
}

/// Downloads component artifacts into the control-node download cache.
///
/// One node per component, all parallel; each node's guard makes re-runs a
/// no-op once the artifact is present.
struct DownloadArtifactsTask;

impl DownloadArtifactsTask {
    fn download_step(component: &str, version: &str, url: String, dest: Utf8PathBuf) -> Arc<dyn Step> {
        Arc::new(
            CommandStep::shell(
                &format!("download-{}", component),
                &format!("download {} {}", component, version),
                format!("curl -fsSL -o {} {}", dest, url),
            )
            .with_guard_shell(format!("test -s {}", dest))
            .with_retry(RetryPolicy::new(3, Duration::from_secs(2)))
            .with_timeout(Duration::from_secs(600)),
        )
    }
}

impl Task for DownloadArtifactsTask {
    fn name(&self) -> &str {
        "download-artifacts"
    }

    fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(!ctx.spec().offline)
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let spec = ctx.spec();
        let downloads = spec.downloads_dir();
        let control = ctx.control_node().clone();
        let kube = &spec.versions.kubernetes;
        let etcd = &spec.versions.etcd;
        let containerd = &spec.versions.containerd;

        let artifacts = [
            (
                "kubernetes",
                kube.as_str(),
                format!("https://dl.k8s.io/{}/kubernetes-node-linux-amd64.tar.gz", kube),
                downloads.join(format!("kubernetes-{}.tar.gz", kube)),
            ),
            (
                "etcd",
                etcd.as_str(),
                format!(
                    "https://github.com/etcd-io/etcd/releases/download/{v}/etcd-{v}-linux-amd64.tar.gz",
                    v = etcd
                ),
                downloads.join(format!("etcd-{}.tar.gz", etcd)),
            ),
            (
                "containerd",
                containerd.as_str(),
                format!(
                    "https://github.com/containerd/containerd/releases/download/{v}/containerd-{stripped}-linux-amd64.tar.gz",
                    v = containerd,
                    stripped = containerd.trim_start_matches('v')
                ),
                downloads.join(format!("containerd-{}.tar.gz", containerd)),
            ),
        ];

        let mut builder = FragmentBuilder::new(self.name());
        for (component, version, url, dest) in artifacts {
            let step = Self::download_step(component, version, url, dest);
            builder.add_node(component, step, vec![control.clone()])?;
        }
        builder.build()
    }
}

/// Installs and enables containerd on every node that runs workloads.
///
/// Staged per host: distribute the tarball, unpack it, enable the service.
struct ContainerRuntimeTask;

impl Task for ContainerRuntimeTask {
    fn name(&self) -> &str {
        "container-runtime"
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let hosts = union_hosts(&[
            ctx.hosts_with_role(Role::Master),
            ctx.hosts_with_role(Role::Worker),
        ]);
        if hosts.is_empty() {
            return Ok(ExecutionFragment::new(self.name()));
        }

        let spec = ctx.spec();
        let version = &spec.versions.containerd;
        let tarball = spec
            .downloads_dir()
            .join(format!("containerd-{}.tar.gz", version));
        let staged = Utf8PathBuf::from(format!("/tmp/containerd-{}.tar.gz", version));

        let distribute: Arc<dyn Step> = Arc::new(UploadStep::new(
            "distribute-containerd",
            "stage the containerd tarball on the host",
            TransferSource::File(tarball),
            staged.clone(),
            0o644,
        ));
        let install: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "install-containerd",
                "unpack containerd into /usr/local",
                format!("tar -C /usr/local -xzf {}", staged),
            )
            .with_guard_shell("command -v /usr/local/bin/containerd >/dev/null")
            .privileged()
            .with_timeout(Duration::from_secs(300)),
        );
        let enable: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "enable-containerd",
                "enable and start the containerd service",
                "systemctl daemon-reload && systemctl enable --now containerd",
            )
            .with_guard_shell("systemctl is-active --quiet containerd")
            .privileged()
            .with_timeout(Duration::from_secs(120)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        builder.staged_per_host(
            &[
                ("distribute", distribute),
                ("install", install),
                ("enable", enable),
            ],
            &hosts,
        )?;
        builder.build()
    }
}
