//! Host connector boundary.
//!
//! This module defines the transport contract the core plans against: given
//! a host, a [`Connector`] runs commands, uploads and downloads files, and
//! answers `stat` queries. The engine and the shipped steps only ever talk
//! to hosts through this trait, so transports can be swapped without
//! touching planning or scheduling code.
//!
//! Only a [`LocalConnector`] is provided; it drives the process-local
//! machine through `tokio::process`. Remote transports plug in behind the
//! same trait.

pub mod facts;
pub mod local;

pub use local::LocalConnector;

use anyhow::Result;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::time::Duration;

use crate::config::HostSpec;
use crate::privilege::PrivilegeMethod;

/// Specification for a command to be executed on a host.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// The command to execute (e.g., "kubeadm").
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Environment variables to set (in addition to the inherited environment).
    pub env: Vec<(String, String)>,
    /// Working directory (optional).
    pub cwd: Option<Utf8PathBuf>,
    /// Privilege escalation to wrap the command with.
    pub sudo: Option<PrivilegeMethod>,
    /// Upper bound on execution time; the connector aborts the command when exceeded.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Creates a new CommandSpec with command and args.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: Vec::new(),
            cwd: None,
            sudo: None,
            timeout: None,
        }
    }

    /// Creates a CommandSpec that runs a shell snippet via `sh -c`.
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh", vec!["-c".to_string(), script.into()])
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: Utf8PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    /// Wraps the command with the given privilege escalation method.
    #[must_use]
    pub fn with_sudo(mut self, method: Option<PrivilegeMethod>) -> Self {
        self.sudo = method;
        self
    }

    /// Bounds the execution time.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns a compact display form for logs and error messages.
    pub fn display_line(&self) -> String {
        let mut line = self.command.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Result of command execution on a host.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit code of the command (None if the process was killed by a signal).
    pub status: Option<i32>,
    /// Standard output captured from the command, bounded by the connector.
    pub stdout: Vec<u8>,
    /// Standard error captured from the command, bounded by the connector.
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Returns true if the command exited with status zero.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Returns stdout as lossily-decoded trimmed text.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    /// Returns stderr as lossily-decoded trimmed text.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Human-readable exit status for error messages.
    pub fn status_display(&self) -> String {
        match self.status {
            Some(code) => format!("exit status: {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Source material for a file transfer to a host.
#[derive(Debug, Clone)]
pub enum TransferSource {
    /// In-memory content generated at plan time.
    Bytes(Vec<u8>),
    /// A file on the control node.
    File(Utf8PathBuf),
}

/// Metadata answered by [`Connector::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes.
    pub size: u64,
    /// Unix permission bits.
    pub mode: u32,
    /// Whether the path is a directory.
    pub is_dir: bool,
}

/// Transport contract for running work on a host.
///
/// Implementations must be safe for concurrent use across distinct hosts;
/// per-host serialization, if a transport needs it, is the transport's own
/// responsibility.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Executes a command on the host.
    ///
    /// A non-zero exit status is not an error; callers inspect the returned
    /// [`ExecOutput`]. Errors represent transport-level failures (spawn,
    /// connection, timeout).
    async fn exec(&self, spec: &CommandSpec) -> Result<ExecOutput>;

    /// Transfers content to a path on the host, creating parent directories.
    async fn put(&self, source: &TransferSource, dest: &Utf8Path, mode: u32) -> Result<()>;

    /// Reads a file from the host.
    async fn fetch(&self, path: &Utf8Path) -> Result<Vec<u8>>;

    /// Stats a path on the host. Returns `None` when the path does not exist.
    async fn stat(&self, path: &Utf8Path) -> Result<Option<FileStat>>;
}

/// Produces connectors for the hosts of a cluster spec.
///
/// The inventory calls this once per host at startup. Implementations decide
/// which transport fits each host; the shipped [`LocalConnectorFactory`]
/// only wires up the process-local machine.
pub trait ConnectorFactory: Send + Sync {
    /// Returns a connector for the given host spec.
    fn connect(&self, host: &HostSpec, control_node: bool) -> Result<std::sync::Arc<dyn Connector>>;
}

/// Connector factory for single-machine and development use.
///
/// Hands out a [`LocalConnector`] for the control node and for hosts whose
/// address is loopback. Remote hosts receive an [`UnconfiguredConnector`]
/// so planning and dry runs work on any spec; actual I/O against such a
/// host surfaces a transport error.
pub struct LocalConnectorFactory;

impl ConnectorFactory for LocalConnectorFactory {
    fn connect(
        &self,
        host: &HostSpec,
        control_node: bool,
    ) -> Result<std::sync::Arc<dyn Connector>> {
        if control_node || host.is_loopback() {
            Ok(std::sync::Arc::new(LocalConnector::new()))
        } else {
            Ok(std::sync::Arc::new(UnconfiguredConnector {
                host: host.name.clone(),
            }))
        }
    }
}

/// Placeholder connector for hosts without a configured transport.
///
/// Every operation fails with a transport-category error naming the host.
pub struct UnconfiguredConnector {
    host: String,
}

impl UnconfiguredConnector {
    fn error(&self) -> anyhow::Error {
        crate::error::KubeforgeError::Transport {
            host: self.host.clone(),
            reason: "no transport configured for this host; \
                only the local connector is available"
                .to_string(),
        }
        .into()
    }
}

#[async_trait]
impl Connector for UnconfiguredConnector {
    async fn exec(&self, _spec: &CommandSpec) -> Result<ExecOutput> {
        Err(self.error())
    }

    async fn put(&self, _source: &TransferSource, _dest: &Utf8Path, _mode: u32) -> Result<()> {
        Err(self.error())
    }

    async fn fetch(&self, _path: &Utf8Path) -> Result<Vec<u8>> {
        Err(self.error())
    }

    async fn stat(&self, _path: &Utf8Path) -> Result<Option<FileStat>> {
        Err(self.error())
    }
}
