//! Execution result model and the human-facing summary table.
//!
//! The engine records one [`NodeResult`] per graph node and one
//! [`HostInvocation`] per node-host pair, with wall-clock timestamps at both
//! levels. The CLI printer consumes [`GraphExecutionResult`] as-is; this
//! schema is the stable boundary between the engine and its callers.

use std::collections::BTreeMap;
use std::time::SystemTime;

use strum::Display;
use uuid::Uuid;

use crate::graph::NodeId;

/// Lifecycle state of a node. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    /// True for states that gate downstream nodes as satisfied.
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

/// Outcome of one per-host invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum HostStatus {
    Success,
    Failed,
    Skipped,
}

/// One execution of a node's step on one of its hosts.
#[derive(Debug, Clone)]
pub struct HostInvocation {
    pub host: String,
    pub status: HostStatus,
    /// Context for non-failure outcomes, e.g. "already converged" or "dry-run".
    pub message: Option<String>,
    /// Error text when the invocation failed.
    pub error: Option<String>,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
}

impl HostInvocation {
    pub fn success(host: &str, message: Option<String>, started_at: SystemTime) -> Self {
        Self {
            host: host.to_string(),
            status: HostStatus::Success,
            message,
            error: None,
            started_at,
            ended_at: SystemTime::now(),
        }
    }

    pub fn skipped(host: &str, message: impl Into<String>, started_at: SystemTime) -> Self {
        Self {
            host: host.to_string(),
            status: HostStatus::Skipped,
            message: Some(message.into()),
            error: None,
            started_at,
            ended_at: SystemTime::now(),
        }
    }

    pub fn failed(host: &str, error: impl Into<String>, started_at: SystemTime) -> Self {
        Self {
            host: host.to_string(),
            status: HostStatus::Failed,
            message: None,
            error: Some(error.into()),
            started_at,
            ended_at: SystemTime::now(),
        }
    }
}

/// Aggregated outcome of one node.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub name: String,
    pub status: NodeStatus,
    /// Why the node was skipped without running, when it was.
    pub skip_reason: Option<String>,
    pub hosts: Vec<HostInvocation>,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
}

impl NodeResult {
    /// A node skipped before any host invocation started.
    pub fn skipped(node_id: NodeId, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node_id,
            name: name.into(),
            status: NodeStatus::Skipped,
            skip_reason: Some(reason.into()),
            hosts: Vec::new(),
            started_at: None,
            ended_at: None,
        }
    }

    /// First failed host invocation, when any.
    pub fn first_failure(&self) -> Option<&HostInvocation> {
        self.hosts.iter().find(|h| h.status == HostStatus::Failed)
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Aggregated result of executing one graph.
#[derive(Debug, Clone)]
pub struct GraphExecutionResult {
    pub graph_name: String,
    pub run_id: Uuid,
    pub status: RunStatus,
    /// True when the run ended because cancellation was signaled.
    pub cancelled: bool,
    /// First failure cause, for the one-line summary.
    pub failure: Option<String>,
    pub nodes: BTreeMap<NodeId, NodeResult>,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
}

impl GraphExecutionResult {
    /// Result for a graph with no work: immediate success, no node results.
    pub fn empty_success(graph_name: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            graph_name: graph_name.into(),
            run_id: Uuid::new_v4(),
            status: RunStatus::Success,
            cancelled: false,
            failure: None,
            nodes: BTreeMap::new(),
            started_at: now,
            ended_at: now,
        }
    }

    pub fn success(&self) -> bool {
        self.status == RunStatus::Success
    }

    fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    /// Renders the node-by-node summary table with a one-line footer.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();

        if self.nodes.is_empty() {
            out.push_str(&format!("graph '{}': nothing to do\n", self.graph_name));
            return out;
        }

        let id_width = self
            .nodes
            .keys()
            .map(|id| id.as_str().len())
            .max()
            .unwrap_or(4)
            .max("NODE".len());

        out.push_str(&format!("{:<id_width$}  {:<8}  {}\n", "NODE", "STATUS", "DETAIL"));
        for result in self.nodes.values() {
            let detail = Self::node_detail(result);
            out.push_str(&format!(
                "{:<id_width$}  {:<8}  {}\n",
                result.node_id.as_str(),
                result.status.to_string(),
                detail
            ));
        }

        out.push_str(&format!(
            "graph '{}': {} — {} success, {} failed, {} skipped\n",
            self.graph_name,
            self.status,
            self.count(NodeStatus::Success),
            self.count(NodeStatus::Failed),
            self.count(NodeStatus::Skipped),
        ));
        if self.cancelled {
            out.push_str("run was cancelled before completion\n");
        } else if let Some(failure) = &self.failure {
            out.push_str(&format!("first failure: {}\n", snippet(failure)));
        }
        out
    }

    fn node_detail(result: &NodeResult) -> String {
        if let Some(reason) = &result.skip_reason {
            return reason.clone();
        }
        if let Some(failed) = result.first_failure() {
            let error = failed.error.as_deref().unwrap_or("unknown error");
            return format!("{}: {}", failed.host, snippet(error));
        }
        let skipped = result
            .hosts
            .iter()
            .filter(|h| h.status == HostStatus::Skipped)
            .count();
        if skipped == result.hosts.len() && skipped > 0 {
            return "all hosts already converged".to_string();
        }
        let hosts: Vec<&str> = result.hosts.iter().map(|h| h.host.as_str()).collect();
        hosts.join(",")
    }
}

/// Truncates an error message to a table-friendly single line.
fn snippet(text: &str) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.len() > 80 {
        format!("{}…", &line[..line.char_indices().take(79).last().map_or(0, |(i, c)| i + c.len_utf8())])
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(host: &str, status: HostStatus) -> HostInvocation {
        let now = SystemTime::now();
        match status {
            HostStatus::Success => HostInvocation::success(host, None, now),
            HostStatus::Skipped => HostInvocation::skipped(host, "already converged", now),
            HostStatus::Failed => HostInvocation::failed(host, "exit status: 1", now),
        }
    }

    fn node(id: &str, status: NodeStatus, hosts: Vec<HostInvocation>) -> NodeResult {
        NodeResult {
            node_id: NodeId::from(id),
            name: id.to_string(),
            status,
            skip_reason: None,
            hosts,
            started_at: Some(SystemTime::now()),
            ended_at: Some(SystemTime::now()),
        }
    }

    #[test]
    fn node_status_classification() {
        assert!(NodeStatus::Success.is_terminal());
        assert!(NodeStatus::Skipped.is_successful());
        assert!(!NodeStatus::Failed.is_successful());
        assert!(!NodeStatus::Running.is_terminal());
    }

    #[test]
    fn empty_result_renders_nothing_to_do() {
        let result = GraphExecutionResult::empty_success("create-cluster");
        assert!(result.success());
        let summary = result.render_summary();
        assert!(summary.contains("nothing to do"));
    }

    #[test]
    fn summary_lists_failure_detail() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            NodeId::from("cp/init"),
            node(
                "cp/init",
                NodeStatus::Failed,
                vec![invocation("m1", HostStatus::Failed)],
            ),
        );
        nodes.insert(
            NodeId::from("net/apply"),
            NodeResult::skipped(NodeId::from("net/apply"), "net/apply", "upstream node failed: cp/init"),
        );

        let result = GraphExecutionResult {
            graph_name: "create-cluster".to_string(),
            run_id: Uuid::new_v4(),
            status: RunStatus::Failed,
            cancelled: false,
            failure: Some("step 'kubeadm-init' failed on host 'm1': exit status: 1".to_string()),
            nodes,
            started_at: SystemTime::now(),
            ended_at: SystemTime::now(),
        };

        let summary = result.render_summary();
        assert!(summary.contains("cp/init"));
        assert!(summary.contains("m1: exit status: 1"));
        assert!(summary.contains("upstream node failed: cp/init"));
        assert!(summary.contains("0 success, 1 failed, 1 skipped"));
        assert!(summary.contains("first failure:"));
    }

    #[test]
    fn snippet_truncates_long_lines() {
        let long = "x".repeat(200);
        let result = snippet(&long);
        assert!(result.chars().count() <= 80);
        assert!(result.ends_with('…'));
    }

    #[test]
    fn all_hosts_converged_detail() {
        let n = node(
            "deploy",
            NodeStatus::Success,
            vec![
                invocation("a", HostStatus::Skipped),
                invocation("b", HostStatus::Skipped),
            ],
        );
        assert_eq!(GraphExecutionResult::node_detail(&n), "all hosts already converged");
    }
}
