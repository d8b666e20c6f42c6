//! Local connector driving the process-local machine.
//!
//! Commands run through `tokio::process` with stdout/stderr streamed to the
//! log in real time while a bounded ring buffer keeps the most recent output
//! for error reporting. File operations use `tokio::fs` directly.

use std::collections::VecDeque;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use camino::Utf8Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use which::which;

use super::{CommandSpec, Connector, ExecOutput, FileStat, TransferSource};
use crate::error::KubeforgeError;
use crate::privilege::PrivilegeMethod;

/// Maximum size of captured output per stream in bytes (64KB).
///
/// Bounds memory growth when capturing output from long-running commands
/// while keeping enough tail output for useful error messages.
pub const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// A FIFO ring buffer that stores output lines up to a maximum total size.
///
/// When the buffer exceeds `max_size`, the oldest lines are removed to make
/// room, so the most recent output (including error messages at the end of a
/// command) is preserved.
struct RingLineBuffer {
    lines: VecDeque<Vec<u8>>,
    total_size: usize,
    max_size: usize,
}

impl RingLineBuffer {
    fn new(max_size: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            total_size: 0,
            max_size,
        }
    }

    /// Adds a line to the buffer, evicting old lines as needed.
    ///
    /// A single line longer than `max_size` is truncated to its tail.
    fn push_line(&mut self, line: Vec<u8>) {
        let line = if line.len() > self.max_size {
            line[line.len() - self.max_size..].to_vec()
        } else {
            line
        };

        let line_size = line.len();
        while self.total_size + line_size > self.max_size && !self.lines.is_empty() {
            if let Some(old_line) = self.lines.pop_front() {
                self.total_size -= old_line.len();
            }
        }

        self.total_size += line_size;
        self.lines.push_back(line);
    }

    /// Concatenates buffered lines oldest-to-newest.
    fn into_vec(self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.total_size);
        for line in self.lines {
            result.extend(line);
        }
        result
    }
}

/// Output stream identity for logging.
#[derive(Clone, Copy)]
enum StreamType {
    Stdout,
    Stderr,
}

impl StreamType {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Reads a pipe to EOF, streaming each line to the log and keeping the tail
/// in a ring buffer.
///
/// Binary data is logged lossily; the original bytes are preserved in the
/// returned buffer. Trailing CR is trimmed for log readability only.
async fn read_pipe_to_buffer<R>(pipe: Option<R>, stream_type: StreamType) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Vec::new();
    };

    let mut reader = BufReader::new(pipe);
    let mut ring_buffer = RingLineBuffer::new(MAX_OUTPUT_SIZE);
    let mut line_buf = Vec::new();

    loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf).await {
            Ok(0) => break,
            Ok(_) => {
                let content = line_buf.strip_suffix(b"\n").unwrap_or(&line_buf);
                let text = String::from_utf8_lossy(content);
                let trimmed = text.trim_end_matches('\r');
                match stream_type {
                    StreamType::Stdout => {
                        tracing::debug!(stream = stream_type.as_str(), "{}", trimmed)
                    }
                    StreamType::Stderr => {
                        tracing::warn!(stream = stream_type.as_str(), "{}", trimmed)
                    }
                }
                ring_buffer.push_line(std::mem::take(&mut line_buf));
            }
            Err(e) => {
                tracing::warn!(
                    stream = stream_type.as_str(),
                    error = %e,
                    "I/O error, stopping read"
                );
                break;
            }
        }
    }

    ring_buffer.into_vec()
}

/// Connector for the process-local machine.
#[derive(Debug, Default)]
pub struct LocalConnector;

impl LocalConnector {
    pub fn new() -> Self {
        Self
    }

    fn transport_error(reason: impl Into<String>) -> anyhow::Error {
        KubeforgeError::Transport {
            host: "localhost".to_string(),
            reason: reason.into(),
        }
        .into()
    }

    /// Resolves the effective program and argument list, applying privilege
    /// escalation when requested.
    fn effective_command(spec: &CommandSpec) -> (String, Vec<String>) {
        match spec.sudo {
            Some(PrivilegeMethod::Sudo) => {
                let mut args = vec!["-E".to_string(), spec.command.clone()];
                args.extend(spec.args.iter().cloned());
                ("sudo".to_string(), args)
            }
            Some(PrivilegeMethod::Doas) => {
                let mut args = vec![spec.command.clone()];
                args.extend(spec.args.iter().cloned());
                ("doas".to_string(), args)
            }
            None => (spec.command.clone(), spec.args.clone()),
        }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn exec(&self, spec: &CommandSpec) -> Result<ExecOutput> {
        let (program, args) = Self::effective_command(spec);

        let resolved = which(&program)
            .map_err(|e| Self::transport_error(format!("command not found: {}: {}", program, e)))?;
        tracing::trace!(command = %program, path = %resolved.display(), "command resolved");

        let mut command = tokio::process::Command::new(resolved);
        command.args(&args);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Self::transport_error(format!(
                "failed to spawn command `{}`: {}",
                spec.display_line(),
                e
            ))
        })?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_pipe_to_buffer(stdout_pipe, StreamType::Stdout));
        let stderr_task = tokio::spawn(read_pipe_to_buffer(stderr_pipe, StreamType::Stderr));

        let status = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    let _ = child.kill().await;
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                    return Err(Self::transport_error(format!(
                        "command `{}` timed out after {:?}",
                        spec.display_line(),
                        limit
                    )));
                }
            },
            None => child.wait().await,
        }
        .map_err(|e| {
            Self::transport_error(format!(
                "failed to wait for command `{}`: {}",
                spec.display_line(),
                e
            ))
        })?;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        tracing::trace!(
            command = %spec.display_line(),
            success = status.success(),
            "command finished"
        );

        Ok(ExecOutput {
            status: status.code(),
            stdout,
            stderr,
        })
    }

    async fn put(&self, source: &TransferSource, dest: &Utf8Path, mode: u32) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KubeforgeError::io(parent.to_string(), e))?;
        }

        match source {
            TransferSource::Bytes(bytes) => {
                tokio::fs::write(dest, bytes)
                    .await
                    .map_err(|e| KubeforgeError::io(dest.to_string(), e))?;
            }
            TransferSource::File(local) => {
                tokio::fs::copy(local, dest)
                    .await
                    .map_err(|e| KubeforgeError::io(format!("{} -> {}", local, dest), e))?;
            }
        }

        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(dest, Permissions::from_mode(mode))
                .await
                .with_context(|| format!("failed to set mode {:o} on {}", mode, dest))?;
        }

        Ok(())
    }

    async fn fetch(&self, path: &Utf8Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|e| KubeforgeError::io(path.to_string(), e).into())
    }

    async fn stat(&self, path: &Utf8Path) -> Result<Option<FileStat>> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => {
                #[cfg(unix)]
                let mode = {
                    use std::os::unix::fs::PermissionsExt;
                    metadata.permissions().mode() & 0o7777
                };
                #[cfg(not(unix))]
                let mode = 0;

                Ok(Some(FileStat {
                    size: metadata.len(),
                    mode,
                    is_dir: metadata.is_dir(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KubeforgeError::io(path.to_string(), e).into()),
        }
    }
}
