//! Network phase: fetch and apply the CNI manifest.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use camino::Utf8PathBuf;

use crate::connector::TransferSource;
use crate::context::TaskContext;
use crate::graph::ExecutionFragment;
use crate::module::Module;
use crate::modules::ADMIN_KUBECONFIG;
use crate::step::{RetryPolicy, Step};
use crate::steps::{CommandStep, UploadStep};
use crate::task::{FragmentBuilder, Task};

/// Installs the selected CNI plugin.
pub struct NetworkModule;

impl Module for NetworkModule {
    fn name(&self) -> &str {
        "network"
    }

    fn tasks(&self) -> Vec<Box<dyn Task>> {
        vec![Box::new(ApplyCniTask)]
    }
}

/// Control-node pre-stage feeding the first master: fetch (or copy) the
/// manifest into the rendered directory, push it to the first master, apply.
struct ApplyCniTask;

impl Task for ApplyCniTask {
    fn name(&self) -> &str {
        "apply-cni"
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let Some(first_master) = ctx.first_master() else {
            bail!("no host carries the master role");
        };
        let spec = ctx.spec();
        let cni = &spec.cni;
        let rendered = spec.rendered_dir().join(format!("cni-{}.yaml", cni.name()));

        let fetch_script = if spec.offline {
            // Offline bundles place CNI manifests under the extract dir.
            format!(
                "cp {}/cni/{}-{}.yaml {}",
                spec.extract_dir(),
                cni.name(),
                cni.version(),
                rendered
            )
        } else {
            format!("curl -fsSL -o {} {}", rendered, cni.manifest_url())
        };
        let fetch: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "fetch-cni-manifest",
                "stage the CNI manifest in the rendered directory",
                fetch_script,
            )
            .with_guard_shell(format!("test -s {}", rendered))
            .with_retry(RetryPolicy::new(3, Duration::from_secs(2)))
            .with_timeout(Duration::from_secs(120)),
        );

        let remote_manifest = Utf8PathBuf::from(format!("/tmp/cni-{}.yaml", cni.name()));
        let push: Arc<dyn Step> = Arc::new(UploadStep::new(
            "push-cni-manifest",
            "stage the CNI manifest on the first master",
            TransferSource::File(rendered),
            remote_manifest.clone(),
            0o644,
        ));
        let apply: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "apply-cni-manifest",
                "apply the CNI manifest",
                format!(
                    "kubectl --kubeconfig {} apply -f {}",
                    ADMIN_KUBECONFIG, remote_manifest
                ),
            )
            .privileged()
            .with_timeout(Duration::from_secs(300)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        let fetch_id = builder.add_node("fetch", fetch, vec![ctx.control_node().clone()])?;
        let push_id = builder.add_host_node("push", push, &first_master)?;
        builder.depend(&push_id, &fetch_id)?;
        let apply_id = builder.add_host_node("apply", apply, &first_master)?;
        builder.depend(&apply_id, &push_id)?;
        builder.build()
    }
}
