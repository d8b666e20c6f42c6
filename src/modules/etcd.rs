//! Etcd phase: PKI material and the etcd cluster itself.
//!
//! For managed etcd both tasks plan work; for an external etcd only client
//! PKI distribution is planned, and only when the operator did not supply
//! certificate files of their own.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::config::EtcdConfig;
use crate::connector::TransferSource;
use crate::context::TaskContext;
use crate::graph::ExecutionFragment;
use crate::host::{Host, Role};
use crate::module::Module;
use crate::step::Step;
use crate::steps::{CommandStep, RenderFileStep, UploadStep};
use crate::task::{FragmentBuilder, Task, union_hosts};

const REMOTE_PKI_DIR: &str = "/etc/etcd/pki";

/// Provisions etcd PKI and, for managed mode, the etcd members.
pub struct EtcdModule;

impl Module for EtcdModule {
    fn name(&self) -> &str {
        "etcd"
    }

    fn tasks(&self) -> Vec<Box<dyn Task>> {
        vec![Box::new(EtcdPkiTask), Box::new(InstallEtcdTask)]
    }
}

/// Generates the etcd CA and certificates on the control node, then
/// distributes the bundle to every host that needs it.
struct EtcdPkiTask;

impl EtcdPkiTask {
    /// Hosts that receive PKI material: members and masters for managed
    /// etcd, masters only for external etcd.
    fn targets(&self, ctx: &TaskContext) -> Vec<Host> {
        match ctx.spec().etcd {
            EtcdConfig::Managed => union_hosts(&[
                ctx.hosts_with_role(Role::Etcd),
                ctx.hosts_with_role(Role::Master),
            ]),
            EtcdConfig::External { .. } => ctx.hosts_with_role(Role::Master),
        }
    }
}

impl Task for EtcdPkiTask {
    fn name(&self) -> &str {
        "etcd-pki"
    }

    fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        match &ctx.spec().etcd {
            EtcdConfig::Managed => Ok(true),
            // Operator-supplied certificates mean there is nothing to plan.
            EtcdConfig::External { cert_file, .. } => Ok(cert_file.is_none()),
        }
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let pki = ctx.spec().pki_dir();
        let bundle = pki.join("etcd-pki.tar.gz");
        ctx.task_cache().insert("bundle-path", bundle.clone());

        let generate_script = format!(
            "openssl genrsa -out {pki}/ca-key.pem 2048 && \
             openssl req -x509 -new -key {pki}/ca-key.pem \
             -subj /CN=etcd-ca -days 3650 -out {pki}/ca.pem && \
             openssl genrsa -out {pki}/server-key.pem 2048 && \
             openssl req -new -key {pki}/server-key.pem -subj /CN=etcd-server | \
             openssl x509 -req -CA {pki}/ca.pem -CAkey {pki}/ca-key.pem -CAcreateserial \
             -days 3650 -out {pki}/server.pem && \
             openssl genrsa -out {pki}/client-key.pem 2048 && \
             openssl req -new -key {pki}/client-key.pem -subj /CN=etcd-client | \
             openssl x509 -req -CA {pki}/ca.pem -CAkey {pki}/ca-key.pem -CAcreateserial \
             -days 3650 -out {pki}/client.pem && \
             tar -czf {bundle} -C {pki} ca.pem server.pem server-key.pem client.pem client-key.pem",
            pki = pki,
            bundle = bundle
        );
        let generate: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "generate-etcd-pki",
                "generate the etcd CA and certificates",
                generate_script,
            )
            .with_guard_shell(format!("test -f {}", bundle))
            .with_timeout(Duration::from_secs(120)),
        );

        let staged_bundle = Utf8PathBuf::from("/tmp/etcd-pki.tar.gz");
        let upload: Arc<dyn Step> = Arc::new(UploadStep::new(
            "upload-etcd-pki",
            "stage the etcd PKI bundle on the host",
            TransferSource::File(bundle),
            staged_bundle.clone(),
            0o600,
        ));
        let unpack: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "unpack-etcd-pki",
                "install the etcd PKI bundle",
                format!("mkdir -p {dir} && tar -xzf {staged} -C {dir}", dir = REMOTE_PKI_DIR, staged = staged_bundle),
            )
            .with_guard_shell(format!("test -f {}/ca.pem", REMOTE_PKI_DIR))
            .privileged()
            .with_timeout(Duration::from_secs(60)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        let generate_id =
            builder.add_node("generate", generate, vec![ctx.control_node().clone()])?;
        let (entries, _exits) = builder.staged_per_host(
            &[("upload", upload), ("unpack", unpack)],
            &self.targets(ctx),
        )?;
        for entry in &entries {
            builder.depend(entry, &generate_id)?;
        }
        builder.build()
    }
}

/// Installs etcd members: binary, per-member systemd unit, service.
struct InstallEtcdTask;

impl InstallEtcdTask {
    fn unit_content(host: &Host, initial_cluster: &str) -> String {
        format!(
            "[Unit]\n\
             Description=etcd key-value store\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=notify\n\
             ExecStart=/usr/local/bin/etcd \\\n\
             \x20 --name {name} \\\n\
             \x20 --data-dir /var/lib/etcd \\\n\
             \x20 --listen-client-urls https://{addr}:2379,https://127.0.0.1:2379 \\\n\
             \x20 --advertise-client-urls https://{addr}:2379 \\\n\
             \x20 --listen-peer-urls https://{addr}:2380 \\\n\
             \x20 --initial-advertise-peer-urls https://{addr}:2380 \\\n\
             \x20 --initial-cluster {cluster} \\\n\
             \x20 --initial-cluster-state new \\\n\
             \x20 --cert-file {pki}/server.pem \\\n\
             \x20 --key-file {pki}/server-key.pem \\\n\
             \x20 --trusted-ca-file {pki}/ca.pem \\\n\
             \x20 --client-cert-auth\n\
             Restart=on-failure\n\
             RestartSec=5\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            name = host.name(),
            addr = host.address(),
            cluster = initial_cluster,
            pki = REMOTE_PKI_DIR,
        )
    }
}

impl Task for InstallEtcdTask {
    fn name(&self) -> &str {
        "install-etcd"
    }

    fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(ctx.spec().etcd.is_managed())
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let members = ctx.hosts_with_role(Role::Etcd);
        if members.is_empty() {
            return Ok(ExecutionFragment::new(self.name()));
        }

        let spec = ctx.spec();
        let version = &spec.versions.etcd;
        let tarball = spec.downloads_dir().join(format!("etcd-{}.tar.gz", version));
        let staged = Utf8PathBuf::from(format!("/tmp/etcd-{}.tar.gz", version));
        let initial_cluster = members
            .iter()
            .map(|h| format!("{}=https://{}:2380", h.name(), h.address()))
            .collect::<Vec<_>>()
            .join(",");

        let distribute: Arc<dyn Step> = Arc::new(UploadStep::new(
            "distribute-etcd",
            "stage the etcd tarball on the member",
            TransferSource::File(tarball),
            staged.clone(),
            0o644,
        ));
        let install: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "install-etcd",
                "unpack the etcd binaries into /usr/local/bin",
                format!(
                    "tar -xzf {staged} -C /usr/local/bin --strip-components=1 \
                     --wildcards 'etcd-*/etcd' 'etcd-*/etcdctl'",
                    staged = staged
                ),
            )
            .with_guard_shell("test -x /usr/local/bin/etcd")
            .privileged()
            .with_timeout(Duration::from_secs(120)),
        );
        let enable: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "enable-etcd",
                "enable and start the etcd service",
                "systemctl daemon-reload && systemctl enable --now etcd",
            )
            .with_guard_shell("systemctl is-active --quiet etcd")
            .privileged()
            .with_timeout(Duration::from_secs(120)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        for member in &members {
            let distribute_id =
                builder.add_host_node("distribute", Arc::clone(&distribute), member)?;
            let install_id = builder.add_host_node("install", Arc::clone(&install), member)?;
            builder.depend(&install_id, &distribute_id)?;

            let unit: Arc<dyn Step> = Arc::new(RenderFileStep::new(
                "render-etcd-unit",
                "write the etcd systemd unit",
                Self::unit_content(member, &initial_cluster),
                Utf8PathBuf::from("/etc/systemd/system/etcd.service"),
            ));
            let unit_id = builder.add_host_node("unit", unit, member)?;
            builder.depend(&unit_id, &install_id)?;

            let enable_id = builder.add_host_node("enable", Arc::clone(&enable), member)?;
            builder.depend(&enable_id, &unit_id)?;
        }
        builder.build()
    }
}
