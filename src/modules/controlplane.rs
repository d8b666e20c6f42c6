//! Control plane phase: init the first master, join the rest, join workers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::config::EtcdConfig;
use crate::context::TaskContext;
use crate::graph::ExecutionFragment;
use crate::host::Role;
use crate::module::Module;
use crate::step::Step;
use crate::steps::CommandStep;
use crate::task::{FragmentBuilder, Task};

/// Pipeline-cache key carrying the bootstrap token to the join tasks.
pub const BOOTSTRAP_TOKEN_KEY: &str = "control-plane/bootstrap-token";

/// Brings up the Kubernetes control plane and joins all nodes.
pub struct ControlPlaneModule;

impl Module for ControlPlaneModule {
    fn name(&self) -> &str {
        "control-plane"
    }

    fn tasks(&self) -> Vec<Box<dyn Task>> {
        vec![
            Box::new(InitFirstMasterTask),
            Box::new(JoinMastersTask),
            Box::new(JoinWorkersTask),
        ]
    }
}

/// Derives a stable bootstrap token from the cluster name.
///
/// Replanning the same spec must produce the same graph, so the token is a
/// hash of the cluster identity rather than a random draw. Token format:
/// six dot sixteen lowercase hex characters, as kubeadm requires.
pub(crate) fn bootstrap_token(cluster_name: &str) -> String {
    let mut hasher = DefaultHasher::new();
    cluster_name.hash(&mut hasher);
    let head = hasher.finish();
    "kubeforge-token".hash(&mut hasher);
    let tail = hasher.finish();
    format!("{:06x}.{:016x}", head & 0xff_ffff, tail)
}

/// External etcd flags for kubeadm, when the spec uses one.
fn external_etcd_args(etcd: &EtcdConfig) -> String {
    match etcd {
        EtcdConfig::Managed => String::new(),
        EtcdConfig::External {
            endpoints,
            ca_file,
            cert_file,
            key_file,
        } => {
            let mut args = format!(
                " --etcd-endpoints {}",
                endpoints
                    .iter()
                    .map(|e| e.as_str().trim_end_matches('/').to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            if let Some(ca) = ca_file {
                args.push_str(&format!(" --etcd-cafile {}", ca));
            }
            if let Some(cert) = cert_file {
                args.push_str(&format!(" --etcd-certfile {}", cert));
            }
            if let Some(key) = key_file {
                args.push_str(&format!(" --etcd-keyfile {}", key));
            }
            args
        }
    }
}

/// Runs `kubeadm init` on the first master.
struct InitFirstMasterTask;

impl Task for InitFirstMasterTask {
    fn name(&self) -> &str {
        "init-control-plane"
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let Some(first_master) = ctx.first_master() else {
            bail!("no host carries the master role");
        };
        let spec = ctx.spec();
        let token = bootstrap_token(&spec.name);
        ctx.pipeline_cache().insert(BOOTSTRAP_TOKEN_KEY, token.clone());

        let endpoint = spec.control_plane_endpoint(first_master.address());
        let script = format!(
            "kubeadm init --kubernetes-version {version} \
             --control-plane-endpoint {endpoint} --token {token} \
             --upload-certs{etcd}",
            version = spec.versions.kubernetes,
            endpoint = endpoint,
            token = token,
            etcd = external_etcd_args(&spec.etcd),
        );
        let step: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "kubeadm-init",
                "initialize the first control plane node",
                script,
            )
            .with_guard_shell("test -f /etc/kubernetes/admin.conf")
            .privileged()
            .with_timeout(Duration::from_secs(600)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        builder.add_node("kubeadm-init", step, vec![first_master])?;
        builder.build()
    }
}

/// Joins the remaining masters, in parallel.
struct JoinMastersTask;

impl Task for JoinMastersTask {
    fn name(&self) -> &str {
        "join-masters"
    }

    fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(ctx.hosts_with_role(Role::Master).len() > 1)
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let masters = ctx.hosts_with_role(Role::Master);
        let Some((first, rest)) = masters.split_first() else {
            return Ok(ExecutionFragment::new(self.name()));
        };
        let spec = ctx.spec();
        let token = bootstrap_token(&spec.name);
        let endpoint = spec.control_plane_endpoint(first.address());

        let step: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "kubeadm-join-master",
                "join an additional control plane node",
                format!(
                    "kubeadm join {endpoint} --token {token} \
                     --discovery-token-unsafe-skip-ca-verification --control-plane",
                    endpoint = endpoint,
                    token = token,
                ),
            )
            .with_guard_shell("test -f /etc/kubernetes/kubelet.conf")
            .privileged()
            .with_timeout(Duration::from_secs(600)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        builder.fan_out("join", step, rest)?;
        builder.build()
    }
}

/// Joins the worker nodes, in parallel.
struct JoinWorkersTask;

impl Task for JoinWorkersTask {
    fn name(&self) -> &str {
        "join-workers"
    }

    fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        let workers = ctx.hosts_with_role(Role::Worker);
        Ok(workers.iter().any(|w| !w.has_role(Role::Master)))
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        // Hosts carrying both roles already joined as masters.
        let workers: Vec<_> = ctx
            .hosts_with_role(Role::Worker)
            .into_iter()
            .filter(|w| !w.has_role(Role::Master))
            .collect();
        if workers.is_empty() {
            return Ok(ExecutionFragment::new(self.name()));
        }
        let Some(first_master) = ctx.first_master() else {
            bail!("no host carries the master role");
        };
        let spec = ctx.spec();
        let token = bootstrap_token(&spec.name);
        let endpoint = spec.control_plane_endpoint(first_master.address());

        let step: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "kubeadm-join-worker",
                "join a worker node",
                format!(
                    "kubeadm join {endpoint} --token {token} \
                     --discovery-token-unsafe-skip-ca-verification",
                    endpoint = endpoint,
                    token = token,
                ),
            )
            .with_guard_shell("test -f /etc/kubernetes/kubelet.conf")
            .privileged()
            .with_timeout(Duration::from_secs(600)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        builder.fan_out("join", step, &workers)?;
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_token_is_deterministic() {
        assert_eq!(bootstrap_token("demo"), bootstrap_token("demo"));
        assert_ne!(bootstrap_token("demo"), bootstrap_token("other"));
    }

    #[test]
    fn bootstrap_token_matches_kubeadm_format() {
        let token = bootstrap_token("demo");
        let (head, tail) = token.split_once('.').unwrap();
        assert_eq!(head.len(), 6);
        assert_eq!(tail.len(), 16);
        assert!(head.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(tail.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn external_etcd_args_include_cert_flags() {
        let etcd = EtcdConfig::External {
            endpoints: vec!["https://10.0.0.5:2379".parse().unwrap()],
            ca_file: Some("/etc/etcd/ca.pem".into()),
            cert_file: Some("/etc/etcd/client.pem".into()),
            key_file: Some("/etc/etcd/client-key.pem".into()),
        };
        let args = external_etcd_args(&etcd);
        assert!(args.contains("--etcd-endpoints https://10.0.0.5:2379"));
        assert!(args.contains("--etcd-certfile /etc/etcd/client.pem"));
        assert!(external_etcd_args(&EtcdConfig::Managed).is_empty());
    }
}
