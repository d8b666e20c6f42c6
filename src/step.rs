//! The step contract: the leaf unit of work in an execution graph.
//!
//! A step is a plan element, not a function call. It must be cheap to
//! construct, safely re-entrant for `precheck`, and idempotent for `run`
//! against a host whose state may already be partially converged. The engine
//! drives exactly this sequence per host: `precheck` — if it reports done,
//! the invocation is recorded as skipped and `run` is never called;
//! otherwise `run` converges the host toward the target state. `rollback`
//! only runs when a rollback pass is explicitly requested for a failed
//! graph, never as part of normal completion.
//!
//! Retry and ignore-on-failure policies live on [`StepMeta`], not on nodes:
//! two nodes sharing a step share policy, and the engine consults the meta
//! as the single source of truth.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::context::StepContext;

/// Retry policy for transport-category failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt.
    pub delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            multiplier: 2.0,
        }
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.delay.mul_f64(factor)
    }
}

/// Descriptive and policy metadata of a step.
#[derive(Debug, Clone)]
pub struct StepMeta {
    /// Short step name used in node ids, logs, and results.
    pub name: String,
    /// One-line description for the result table.
    pub description: String,
    /// When true, a failure of this step is recorded but gates downstream
    /// nodes as if it had succeeded.
    pub ignore_failure: bool,
    /// Retry policy for transport failures. Absent means no retries.
    pub retry: Option<RetryPolicy>,
    /// Advisory per-invocation timeout, enforced by the step itself when it
    /// performs I/O through the connector.
    pub timeout: Option<Duration>,
}

impl StepMeta {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ignore_failure: false,
            retry: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn ignore_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An idempotent capability executed on one host at a time.
#[async_trait]
pub trait Step: Send + Sync {
    /// Descriptive and policy metadata. Stable for the life of the step.
    fn meta(&self) -> &StepMeta;

    /// Inspects host state and reports whether the step is already done.
    ///
    /// Must be observationally pure: it may query the host but must not
    /// mutate it. Errors are fatal for the invocation and prevent `run`.
    async fn precheck(&self, ctx: &StepContext) -> Result<bool>;

    /// Converges the host toward the target state.
    ///
    /// May assume `precheck` observed "not done"; running twice on an
    /// already-converged host must not corrupt it.
    async fn run(&self, ctx: &StepContext) -> Result<()>;

    /// Undoes the step's effect where possible. Only invoked by an explicit
    /// rollback pass over a failed graph.
    async fn rollback(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_with_multiplier() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_flat_with_unit_multiplier() {
        let policy = RetryPolicy::new(3, Duration::from_millis(50)).with_multiplier(1.0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(3), Duration::from_millis(50));
    }

    #[test]
    fn meta_builder_sets_policies() {
        let meta = StepMeta::new("drain-node", "drain workloads before reset")
            .ignore_failure()
            .with_retry(RetryPolicy::new(3, Duration::from_secs(1)))
            .with_timeout(Duration::from_secs(120));
        assert!(meta.ignore_failure);
        assert_eq!(meta.retry.as_ref().unwrap().attempts, 3);
        assert_eq!(meta.timeout, Some(Duration::from_secs(120)));
    }
}
