//! Command execution step with an optional convergence guard.

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::connector::CommandSpec;
use crate::context::StepContext;
use crate::step::{RetryPolicy, Step, StepMeta};

/// Runs a command on the host through its connector.
///
/// The optional guard command implements the precheck: when the guard exits
/// zero the host is considered already converged and the main command never
/// runs. Guards must be observationally pure; they are the step author's
/// statement of "what done looks like".
pub struct CommandStep {
    meta: StepMeta,
    command: CommandSpec,
    guard: Option<CommandSpec>,
    rollback: Option<CommandSpec>,
    privileged: bool,
}

impl CommandStep {
    pub fn new(name: &str, description: &str, command: CommandSpec) -> Self {
        Self {
            meta: StepMeta::new(name, description),
            command,
            guard: None,
            rollback: None,
            privileged: false,
        }
    }

    /// Convenience constructor for `sh -c` one-liners.
    pub fn shell(name: &str, description: &str, script: impl Into<String>) -> Self {
        Self::new(name, description, CommandSpec::shell(script))
    }

    /// Sets the guard command; exit zero means "already converged".
    #[must_use]
    pub fn with_guard(mut self, guard: CommandSpec) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Guard variant for `sh -c` one-liners.
    #[must_use]
    pub fn with_guard_shell(self, script: impl Into<String>) -> Self {
        self.with_guard(CommandSpec::shell(script))
    }

    /// Sets the command run by an explicit rollback pass.
    #[must_use]
    pub fn with_rollback(mut self, rollback: CommandSpec) -> Self {
        self.rollback = Some(rollback);
        self
    }

    /// Runs the command (and guard/rollback) under the host's privilege method.
    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    #[must_use]
    pub fn ignore_failure(mut self) -> Self {
        self.meta = self.meta.ignore_failure();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.meta = self.meta.with_retry(retry);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.meta = self.meta.with_timeout(timeout);
        self
    }

    /// Applies the meta timeout to a spec that does not carry its own.
    fn effective(&self, spec: &CommandSpec) -> CommandSpec {
        let mut spec = spec.clone();
        if spec.timeout.is_none() {
            spec.timeout = self.meta.timeout;
        }
        spec
    }
}

#[async_trait]
impl Step for CommandStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn precheck(&self, ctx: &StepContext) -> Result<bool> {
        let Some(guard) = &self.guard else {
            return Ok(false);
        };
        let output = ctx.run_command(self.effective(guard), self.privileged).await?;
        Ok(output.success())
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        let spec = self.effective(&self.command);
        let output = ctx.run_command(spec, self.privileged).await?;
        if !output.success() {
            let stderr = output.stderr_text();
            if stderr.is_empty() {
                bail!(
                    "command `{}` failed: {}",
                    self.command.display_line(),
                    output.status_display()
                );
            }
            bail!(
                "command `{}` failed: {}: {}",
                self.command.display_line(),
                output.status_display(),
                stderr
            );
        }
        Ok(())
    }

    async fn rollback(&self, ctx: &StepContext) -> Result<()> {
        let Some(rollback) = &self.rollback else {
            return Ok(());
        };
        let output = ctx.run_command(self.effective(rollback), self.privileged).await?;
        if !output.success() {
            bail!(
                "rollback command `{}` failed: {}",
                rollback.display_line(),
                output.status_display()
            );
        }
        Ok(())
    }
}
