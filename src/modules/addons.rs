//! Addons phase: apply the spec's addon manifests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::context::{ModuleContext, TaskContext};
use crate::graph::ExecutionFragment;
use crate::module::Module;
use crate::modules::ADMIN_KUBECONFIG;
use crate::step::Step;
use crate::steps::CommandStep;
use crate::task::{FragmentBuilder, Task};

/// Applies each configured addon manifest on the first master.
pub struct AddonsModule;

impl Module for AddonsModule {
    fn name(&self) -> &str {
        "addons"
    }

    fn is_required(&self, ctx: &ModuleContext) -> Result<bool> {
        Ok(!ctx.spec().addons.is_empty())
    }

    fn tasks(&self) -> Vec<Box<dyn Task>> {
        vec![Box::new(ApplyAddonsTask)]
    }
}

/// One node per addon, all parallel — addons are independent of each other.
///
/// Addon manifests come from the extract directory, which the offline
/// bundle (or a prior download step) populates as
/// `extract/addons/<name>.yaml` on the first master's workdir mirror.
struct ApplyAddonsTask;

impl Task for ApplyAddonsTask {
    fn name(&self) -> &str {
        "apply-addons"
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let Some(first_master) = ctx.first_master() else {
            bail!("no host carries the master role");
        };
        let spec = ctx.spec();

        let mut builder = FragmentBuilder::new(self.name());
        for addon in &spec.addons {
            let manifest = spec.extract_dir().join("addons").join(format!("{}.yaml", addon));
            let step: Arc<dyn Step> = Arc::new(
                CommandStep::shell(
                    &format!("apply-{}", addon),
                    &format!("apply the {} addon", addon),
                    format!("kubectl --kubeconfig {} apply -f {}", ADMIN_KUBECONFIG, manifest),
                )
                .privileged()
                .with_timeout(Duration::from_secs(300)),
            );
            builder.add_node(addon, step, vec![first_master.clone()])?;
        }
        builder.build()
    }
}
