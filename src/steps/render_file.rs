//! Rendered-content step.

use anyhow::{Context, Result};
use async_trait::async_trait;
use camino::Utf8PathBuf;

use crate::connector::TransferSource;
use crate::context::StepContext;
use crate::step::{Step, StepMeta};

/// Writes content generated at plan time (a systemd unit, a static-pod
/// manifest, an haproxy.cfg) to a path on the host.
///
/// Precheck compares the destination size to the content length.
pub struct RenderFileStep {
    meta: StepMeta,
    content: String,
    dest: Utf8PathBuf,
    mode: u32,
}

impl RenderFileStep {
    pub fn new(
        name: &str,
        description: &str,
        content: impl Into<String>,
        dest: Utf8PathBuf,
    ) -> Self {
        Self {
            meta: StepMeta::new(name, description),
            content: content.into(),
            dest,
            mode: 0o644,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

#[async_trait]
impl Step for RenderFileStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn precheck(&self, ctx: &StepContext) -> Result<bool> {
        let Some(stat) = ctx.connector().stat(&self.dest).await? else {
            return Ok(false);
        };
        Ok(!stat.is_dir && stat.size == self.content.len() as u64)
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        ctx.connector()
            .put(
                &TransferSource::Bytes(self.content.clone().into_bytes()),
                &self.dest,
                self.mode,
            )
            .await
            .with_context(|| format!("failed to render {}", self.dest))
    }
}
