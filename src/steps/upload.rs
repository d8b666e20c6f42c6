//! File upload step.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use camino::Utf8PathBuf;

use crate::connector::{CommandSpec, TransferSource};
use crate::context::StepContext;
use crate::step::{Step, StepMeta};

/// Pushes local content (bytes or a control-node file) to a path on the host.
///
/// Precheck compares the destination size to the source length; a matching
/// size counts as converged. Content-equality verification is left to
/// step authors who need it (e.g. via a guarded checksum command).
pub struct UploadStep {
    meta: StepMeta,
    source: TransferSource,
    dest: Utf8PathBuf,
    mode: u32,
}

impl UploadStep {
    pub fn new(
        name: &str,
        description: &str,
        source: TransferSource,
        dest: Utf8PathBuf,
        mode: u32,
    ) -> Self {
        Self {
            meta: StepMeta::new(name, description),
            source,
            dest,
            mode,
        }
    }

    async fn source_len(&self) -> Result<Option<u64>> {
        match &self.source {
            TransferSource::Bytes(bytes) => Ok(Some(bytes.len() as u64)),
            TransferSource::File(path) => match tokio::fs::metadata(path).await {
                Ok(metadata) => Ok(Some(metadata.len())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e).with_context(|| format!("failed to stat source {}", path)),
            },
        }
    }
}

#[async_trait]
impl Step for UploadStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn precheck(&self, ctx: &StepContext) -> Result<bool> {
        let Some(expected) = self.source_len().await? else {
            // Source missing entirely; let run fail with a useful error.
            return Ok(false);
        };
        let Some(stat) = ctx.connector().stat(&self.dest).await? else {
            return Ok(false);
        };
        Ok(!stat.is_dir && stat.size == expected)
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        if let TransferSource::File(path) = &self.source
            && self.source_len().await?.is_none()
        {
            bail!("upload source {} does not exist", path);
        }
        ctx.connector()
            .put(&self.source, &self.dest, self.mode)
            .await
            .with_context(|| format!("failed to upload to {}", self.dest))
    }

    async fn rollback(&self, ctx: &StepContext) -> Result<()> {
        let output = ctx
            .run_command(
                CommandSpec::new("rm", vec!["-f".to_string(), self.dest.to_string()]),
                true,
            )
            .await?;
        if !output.success() {
            bail!("failed to remove {}: {}", self.dest, output.status_display());
        }
        Ok(())
    }
}
