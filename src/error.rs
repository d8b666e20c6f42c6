//! Domain-specific error types for kubeforge.
//!
//! This module defines `KubeforgeError`, a `thiserror`-based enum that
//! provides typed error variants for the failure categories the rest of the
//! system cares about. Public API functions return
//! `Result<T, KubeforgeError>` where the category matters programmatically
//! (exit-code mapping, engine retry decisions), while trait boundaries use
//! `anyhow::Result`.
//!
//! `KubeforgeError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at trait boundaries that return `anyhow::Result`.

use std::io;

use crate::graph::GraphError;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent, user-friendly messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)"). For unrecognized
/// error kinds, falls back to including the OS-level error message directly.
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Domain-specific error type for kubeforge.
///
/// Variants map one-to-one to the failure categories surfaced to users:
/// spec problems abort before planning, plan problems abort before execution,
/// precheck/run/transport problems fail a single per-host invocation, and
/// `Cancelled` marks a run interrupted by the user or a deadline.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KubeforgeError {
    /// The cluster spec is inconsistent or incomplete.
    #[error("cluster spec error: {0}")]
    Spec(String),

    /// Planning produced an invalid fragment or graph.
    #[error("planning error: {0}")]
    Plan(#[from] GraphError),

    /// A step's precheck returned an error for one host.
    #[error("precheck of step '{step}' failed on host '{host}': {reason}")]
    Precheck {
        /// Step name from its meta.
        step: String,
        /// Host the invocation targeted.
        host: String,
        /// Human-readable failure description.
        reason: String,
    },

    /// A step's run returned an error for one host.
    #[error("step '{step}' failed on host '{host}': {reason}")]
    Run {
        /// Step name from its meta.
        step: String,
        /// Host the invocation targeted.
        host: String,
        /// Human-readable failure description.
        reason: String,
    },

    /// The connector failed to reach or operate on a host.
    ///
    /// The engine retries this category when the step's meta opts in.
    #[error("transport error on host '{host}': {reason}")]
    Transport {
        /// Host the connector was talking to.
        host: String,
        /// Human-readable failure description.
        reason: String,
    },

    /// The run was cancelled before completing.
    #[error("execution cancelled")]
    Cancelled,

    /// An I/O operation on the control node failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred, usually a path.
        context: String,
        /// Human-readable description derived from [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error, preserved for programmatic inspection.
        #[source]
        source: std::io::Error,
    },
}

impl KubeforgeError {
    /// Creates an `Io` variant with the `message` field automatically derived
    /// from the `source` via [`io_error_kind_message`].
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Returns true if this error is in the transport category.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Returns true if an `anyhow::Error` wraps a transport-category error
/// anywhere in its chain.
///
/// The engine uses this to decide whether a step failure is eligible for
/// retry under the step's retry policy.
pub fn is_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<KubeforgeError>()
            .is_some_and(KubeforgeError::is_transport)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_display() {
        let err = KubeforgeError::Spec("no host carries the master role".to_string());
        assert_eq!(err.to_string(), "cluster spec error: no host carries the master role");
    }

    #[test]
    fn test_run_display() {
        let err = KubeforgeError::Run {
            step: "install-containerd".to_string(),
            host: "w1".to_string(),
            reason: "exit status: 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "step 'install-containerd' failed on host 'w1': exit status: 1"
        );
    }

    #[test]
    fn test_transport_display() {
        let err = KubeforgeError::Transport {
            host: "m1".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "transport error on host 'm1': connection refused");
        assert!(err.is_transport());
    }

    #[test]
    fn test_io_display() {
        let source = io::Error::new(io::ErrorKind::NotFound, "entity not found");
        let err = KubeforgeError::io("/etc/kubeforge/cluster.yaml", source);
        assert_eq!(err.to_string(), "/etc/kubeforge/cluster.yaml: I/O error: not found");
    }

    #[test]
    fn test_io_source_preserved() {
        let source = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = KubeforgeError::io("/var/lib/kubeforge", source);
        match &err {
            KubeforgeError::Io { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_io_error_kind_messages() {
        let err = io::Error::new(io::ErrorKind::NotFound, "not found");
        assert_eq!(io_error_kind_message(&err), "I/O error: not found");

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(io_error_kind_message(&err), "I/O error: permission denied");

        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        assert!(io_error_kind_message(&err).starts_with("I/O error: "));
    }

    #[test]
    fn test_is_transport_error_through_anyhow_chain() {
        let inner = KubeforgeError::Transport {
            host: "m1".to_string(),
            reason: "timed out".to_string(),
        };
        let err = anyhow::Error::from(inner).context("uploading etcd certificates");
        assert!(is_transport_error(&err));

        let plain = anyhow::anyhow!("unrelated failure");
        assert!(!is_transport_error(&plain));
    }

    #[test]
    fn test_into_anyhow_error() {
        let err = KubeforgeError::Spec("test".to_string());
        let anyhow_err: anyhow::Error = err.into();
        let downcast = anyhow_err.downcast_ref::<KubeforgeError>();
        assert!(matches!(downcast, Some(KubeforgeError::Spec(_))));
    }
}
