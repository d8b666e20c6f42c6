#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use camino::Utf8Path;
use kubeforge::KubeforgeError;
use kubeforge::config::ClusterSpec;
use kubeforge::connector::{CommandSpec, Connector, ExecOutput, FileStat, TransferSource};
use kubeforge::context::{PipelineContext, RunContext, StepContext};
use kubeforge::engine::Engine;
use kubeforge::host::{Host, Inventory, Role};
use kubeforge::step::{RetryPolicy, Step, StepMeta};

#[macro_export]
macro_rules! yaml {
    ($content:literal) => {
        $crate::helpers::dedent($content)
    };
}

pub fn dedent(input: &str) -> String {
    let mut lines: Vec<&str> = input.lines().collect();
    while matches!(lines.first(), Some(line) if line.trim().is_empty()) {
        lines.remove(0);
    }
    while matches!(lines.last(), Some(line) if line.trim().is_empty()) {
        lines.pop();
    }

    let min_indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.as_bytes()
                .iter()
                .take_while(|ch| **ch == b' ' || **ch == b'\t')
                .count()
        })
        .min()
        .unwrap_or(0);

    let mut out = String::new();
    for line in &lines {
        if line.len() >= min_indent {
            out.push_str(&line[min_indent..]);
        }
        out.push('\n');
    }
    out
}

/// Connector that records exec'd command lines and answers from in-memory
/// state.
#[derive(Default)]
pub struct MockConnector {
    pub execs: Mutex<Vec<String>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    /// Commands containing this substring exit non-zero.
    pub fail_substring: Option<String>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_on(substring: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_substring: Some(substring.to_string()),
            ..Self::default()
        })
    }

    pub fn exec_lines(&self) -> Vec<String> {
        self.execs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn exec(&self, spec: &CommandSpec) -> Result<ExecOutput> {
        let line = spec.display_line();
        self.execs.lock().unwrap().push(line.clone());
        let failed = self
            .fail_substring
            .as_deref()
            .is_some_and(|s| line.contains(s));
        Ok(ExecOutput {
            status: Some(if failed { 1 } else { 0 }),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    async fn put(&self, source: &TransferSource, dest: &Utf8Path, _mode: u32) -> Result<()> {
        let content = match source {
            TransferSource::Bytes(bytes) => bytes.clone(),
            TransferSource::File(path) => std::fs::read(path)?,
        };
        self.files.lock().unwrap().insert(dest.to_string(), content);
        Ok(())
    }

    async fn fetch(&self, path: &Utf8Path) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path.as_str())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such file: {}", path))
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Option<FileStat>> {
        Ok(self.files.lock().unwrap().get(path.as_str()).map(|c| FileStat {
            size: c.len() as u64,
            mode: 0o644,
            is_dir: false,
        }))
    }
}

/// Scriptable step for engine tests.
///
/// Records every precheck/run invocation; failure and convergence behavior
/// is configured per host or globally.
pub struct MockStep {
    meta: StepMeta,
    delay: Duration,
    precheck_done: bool,
    fail_hosts: HashSet<String>,
    transport_failures: AtomicUsize,
    pub runs: Mutex<Vec<String>>,
    pub prechecks: Mutex<Vec<String>>,
    pub rollbacks: Mutex<Vec<String>>,
}

impl MockStep {
    pub fn new(name: &str) -> Self {
        Self {
            meta: StepMeta::new(name, "mock step"),
            delay: Duration::ZERO,
            precheck_done: false,
            fail_hosts: HashSet::new(),
            transport_failures: AtomicUsize::new(0),
            runs: Mutex::new(Vec::new()),
            prechecks: Mutex::new(Vec::new()),
            rollbacks: Mutex::new(Vec::new()),
        }
    }

    /// Makes run sleep before returning, for overlap and cancellation tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Precheck reports "already converged" on every host.
    pub fn already_converged(mut self) -> Self {
        self.precheck_done = true;
        self
    }

    /// Run fails on the given host.
    pub fn failing_on(mut self, host: &str) -> Self {
        self.fail_hosts.insert(host.to_string());
        self
    }

    /// The first `n` runs fail with a transport-category error.
    pub fn with_transport_failures(mut self, n: usize, retry: RetryPolicy) -> Self {
        self.transport_failures.store(n, Ordering::SeqCst);
        self.meta = self.meta.with_retry(retry);
        self
    }

    pub fn ignore_failure(mut self) -> Self {
        self.meta = self.meta.ignore_failure();
        self
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[async_trait]
impl Step for MockStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn precheck(&self, ctx: &StepContext) -> Result<bool> {
        self.prechecks
            .lock()
            .unwrap()
            .push(ctx.host().name().to_string());
        Ok(self.precheck_done)
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.runs.lock().unwrap().push(ctx.host().name().to_string());

        let remaining = self.transport_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transport_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(KubeforgeError::Transport {
                host: ctx.host().name().to_string(),
                reason: "simulated connection reset".to_string(),
            }
            .into());
        }

        if self.fail_hosts.contains(ctx.host().name()) {
            anyhow::bail!("simulated failure on {}", ctx.host().name());
        }
        Ok(())
    }

    async fn rollback(&self, ctx: &StepContext) -> Result<()> {
        self.rollbacks
            .lock()
            .unwrap()
            .push(ctx.host().name().to_string());
        Ok(())
    }
}

/// A host backed by a mock connector, carrying the given roles.
pub fn mock_host(name: &str, roles: &[Role]) -> Host {
    Host::builder(name, MockConnector::new())
        .address(format!("10.0.0.{}", name.len()))
        .roles(roles.iter().copied())
        .build()
}

/// The control-node host used by run contexts in tests.
pub fn mock_control_node() -> Host {
    Host::builder("ctl", MockConnector::new()).control_node().build()
}

/// A minimal valid cluster spec for tests that only exercise the engine.
pub fn minimal_spec() -> ClusterSpec {
    let yaml = yaml! {
        r#"
        name: demo
        hosts:
          - name: m1
            address: 10.0.0.10
            roles: [master, etcd]
        versions:
          kubernetes: v1.29.3
        cni:
          type: calico
        "#
    };
    serde_yaml::from_str(&yaml).expect("minimal spec parses")
}

/// Builds a run context over the given hosts (control node appended) with
/// the given engine.
pub fn run_context(mut hosts: Vec<Host>, engine: Engine) -> Arc<RunContext> {
    hosts.push(mock_control_node());
    let inventory = Inventory::new(hosts).expect("inventory has a control node");
    RunContext::new(Arc::new(minimal_spec()), inventory, engine)
}

pub fn pipeline_ctx(run: Arc<RunContext>) -> PipelineContext {
    PipelineContext::new(run)
}
