//! Directory layout step.

use anyhow::{Result, bail};
use async_trait::async_trait;
use camino::Utf8PathBuf;

use crate::connector::CommandSpec;
use crate::context::StepContext;
use crate::step::{Step, StepMeta};

/// Ensures a set of directories exists on the host.
///
/// Precheck stats every path; the step is converged when all of them exist
/// as directories.
pub struct EnsureDirStep {
    meta: StepMeta,
    paths: Vec<Utf8PathBuf>,
    privileged: bool,
}

impl EnsureDirStep {
    pub fn new(name: &str, description: &str, paths: Vec<Utf8PathBuf>) -> Self {
        Self {
            meta: StepMeta::new(name, description),
            paths,
            privileged: false,
        }
    }

    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

#[async_trait]
impl Step for EnsureDirStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn precheck(&self, ctx: &StepContext) -> Result<bool> {
        let connector = ctx.connector();
        for path in &self.paths {
            match connector.stat(path).await? {
                Some(stat) if stat.is_dir => {}
                Some(_) => bail!("{} exists but is not a directory", path),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let mut args = vec!["-p".to_string()];
        args.extend(self.paths.iter().map(|p| p.to_string()));
        let output = ctx
            .run_command(CommandSpec::new("mkdir", args), self.privileged)
            .await?;
        if !output.success() {
            bail!(
                "failed to create directories {:?}: {}",
                self.paths,
                output.status_display()
            );
        }
        Ok(())
    }
}
