//! Cluster spec ingestion for kubeforge.
//!
//! This module provides the data structures and loading function for the
//! YAML cluster specification: hosts and their roles, component versions,
//! the HA topology, CNI and addon choices, and run-wide settings such as the
//! working directory and offline mode.
//!
//! Every discriminator is a closed tagged enum, so unknown role names, HA
//! types, or CNI choices fail at spec validation rather than silently at
//! task planning. The spec is immutable for the duration of a run; the core
//! never mutates it.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::host::Role;
use crate::privilege::{Privilege, PrivilegeDefaults};

/// Component version strings must look like `v<major>.<minor>.<patch>`.
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v\d+\.\d+\.\d+$").expect("version regex is valid"));

fn default_workdir() -> Utf8PathBuf {
    Utf8PathBuf::from("/var/lib/kubeforge")
}

fn default_ssh_port() -> u16 {
    22
}

fn default_lb_port() -> u16 {
    6443
}

fn default_vip_interface() -> String {
    "eth0".to_string()
}

fn default_etcd_version() -> String {
    "v3.5.13".to_string()
}

fn default_containerd_version() -> String {
    "v1.7.16".to_string()
}

fn default_calico_version() -> String {
    "v3.27.3".to_string()
}

fn default_flannel_version() -> String {
    "v0.25.1".to_string()
}

fn default_cilium_version() -> String {
    "v1.15.4".to_string()
}

/// Represents a full cluster specification.
///
/// Loaded once at process start via [`load_spec`] and treated as read-only
/// for the rest of the run.
#[derive(Debug, Deserialize)]
pub struct ClusterSpec {
    /// Cluster name; used for the PKI directory and result reporting.
    pub name: String,
    /// Global working directory on the control node.
    #[serde(default = "default_workdir")]
    pub workdir: Utf8PathBuf,
    /// Skip artifact downloads; all artifacts must already be present.
    #[serde(default)]
    pub offline: bool,
    /// Disable the preflight module entirely.
    #[serde(default)]
    pub skip_preflight: bool,
    /// Cluster hosts in declaration order.
    pub hosts: Vec<HostSpec>,
    /// Spec-wide defaults inherited by hosts.
    #[serde(default)]
    pub defaults: SpecDefaults,
    /// Component version selections.
    pub versions: Versions,
    /// High-availability topology for the control plane endpoint.
    #[serde(default)]
    pub high_availability: HighAvailability,
    /// CNI plugin choice.
    pub cni: CniConfig,
    /// Etcd deployment mode.
    #[serde(default)]
    pub etcd: EtcdConfig,
    /// Addon manifests to apply after the cluster is up.
    #[serde(default)]
    pub addons: Vec<String>,
    /// Private image registry, if any.
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
}

/// One host entry of the cluster spec.
#[derive(Debug, Deserialize)]
pub struct HostSpec {
    /// Unique host name.
    pub name: String,
    /// Address the connector dials.
    pub address: String,
    /// SSH port for remote transports.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user for remote transports.
    #[serde(default)]
    pub user: Option<String>,
    /// Roles this host carries.
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Privilege escalation setting, inheriting from `defaults.privilege`.
    #[serde(default)]
    pub privilege: Privilege,
}

impl HostSpec {
    /// True when the address targets the process-local machine.
    pub fn is_loopback(&self) -> bool {
        matches!(self.address.as_str(), "127.0.0.1" | "localhost" | "::1")
    }

    /// The synthesized control-node entry used when the spec declares no
    /// loopback host.
    pub fn local_control_node() -> Self {
        Self {
            name: "localhost".to_string(),
            address: "127.0.0.1".to_string(),
            port: default_ssh_port(),
            user: None,
            roles: Vec::new(),
            privilege: Privilege::Disabled,
        }
    }
}

/// Spec-wide defaults inherited by hosts.
#[derive(Debug, Default, Deserialize)]
pub struct SpecDefaults {
    /// Default privilege escalation settings.
    #[serde(default)]
    pub privilege: Option<PrivilegeDefaults>,
}

/// Component version selections.
#[derive(Debug, Deserialize)]
pub struct Versions {
    /// Kubernetes version, e.g. `v1.29.3`.
    pub kubernetes: String,
    /// Etcd version for managed etcd.
    #[serde(default = "default_etcd_version")]
    pub etcd: String,
    /// Container runtime version.
    #[serde(default = "default_containerd_version")]
    pub containerd: String,
}

impl Versions {
    fn validate(&self) -> Result<()> {
        for (component, version) in [
            ("kubernetes", &self.kubernetes),
            ("etcd", &self.etcd),
            ("containerd", &self.containerd),
        ] {
            if !VERSION_RE.is_match(version) {
                bail!(
                    "invalid {} version '{}': expected v<major>.<minor>.<patch>",
                    component,
                    version
                );
            }
        }
        Ok(())
    }
}

/// High-availability topology for the control plane endpoint.
///
/// The `type` field in YAML determines which variant is used; planning code
/// matches exhaustively, so there is no separate enabled flag to fall out of
/// sync with the topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HighAvailability {
    /// Single control plane endpoint on the first master.
    #[default]
    None,
    /// Operator-managed VIP and load balancer in front of the masters.
    ExternalLb {
        /// Virtual IP the cluster endpoint resolves to.
        vip: String,
        #[serde(default = "default_lb_port")]
        port: u16,
    },
    /// kubeforge-managed haproxy static pod on every worker.
    InternalLb {
        #[serde(default = "default_lb_port")]
        port: u16,
    },
    /// kube-vip static pods on the masters advertise the VIP.
    KubeVip {
        /// Virtual IP the cluster endpoint resolves to.
        vip: String,
        #[serde(default = "default_vip_interface")]
        interface: String,
    },
}

impl HighAvailability {
    /// Virtual IP of the topology, when one exists.
    pub fn vip(&self) -> Option<&str> {
        match self {
            Self::ExternalLb { vip, .. } | Self::KubeVip { vip, .. } => Some(vip),
            Self::None | Self::InternalLb { .. } => None,
        }
    }
}

/// CNI plugin choice.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CniConfig {
    Calico {
        #[serde(default = "default_calico_version")]
        version: String,
    },
    Flannel {
        #[serde(default = "default_flannel_version")]
        version: String,
    },
    Cilium {
        #[serde(default = "default_cilium_version")]
        version: String,
    },
}

impl CniConfig {
    /// Returns the plugin name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Calico { .. } => "calico",
            Self::Flannel { .. } => "flannel",
            Self::Cilium { .. } => "cilium",
        }
    }

    /// Returns the selected plugin version.
    pub fn version(&self) -> &str {
        match self {
            Self::Calico { version } | Self::Flannel { version } | Self::Cilium { version } => {
                version
            }
        }
    }

    /// Upstream manifest location for online installs.
    pub fn manifest_url(&self) -> String {
        match self {
            Self::Calico { version } => format!(
                "https://raw.githubusercontent.com/projectcalico/calico/{}/manifests/calico.yaml",
                version
            ),
            Self::Flannel { version } => format!(
                "https://raw.githubusercontent.com/flannel-io/flannel/{}/Documentation/kube-flannel.yml",
                version
            ),
            Self::Cilium { version } => format!(
                "https://raw.githubusercontent.com/cilium/cilium/{}/install/kubernetes/quick-install.yaml",
                version
            ),
        }
    }

    fn validate(&self) -> Result<()> {
        if !VERSION_RE.is_match(self.version()) {
            bail!(
                "invalid {} version '{}': expected v<major>.<minor>.<patch>",
                self.name(),
                self.version()
            );
        }
        Ok(())
    }
}

/// Etcd deployment mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EtcdConfig {
    /// kubeforge installs and manages etcd on the hosts tagged `etcd`.
    #[default]
    Managed,
    /// The cluster uses an operator-managed etcd; kubeforge only wires
    /// clients up to it.
    External {
        /// Client endpoints of the external cluster.
        endpoints: Vec<Url>,
        /// CA certificate for the external cluster, if already provisioned.
        #[serde(default)]
        ca_file: Option<Utf8PathBuf>,
        /// Client certificate, if already provisioned.
        #[serde(default)]
        cert_file: Option<Utf8PathBuf>,
        /// Client key, if already provisioned.
        #[serde(default)]
        key_file: Option<Utf8PathBuf>,
    },
}

impl EtcdConfig {
    /// True when kubeforge installs etcd itself.
    pub fn is_managed(&self) -> bool {
        matches!(self, Self::Managed)
    }
}

/// Private image registry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Registry base URL.
    pub url: Url,
    /// Skip TLS verification when pulling from the registry.
    #[serde(default)]
    pub insecure: bool,
}

impl ClusterSpec {
    /// PKI directory for this cluster under the workdir.
    pub fn pki_dir(&self) -> Utf8PathBuf {
        self.workdir.join("pki").join(&self.name)
    }

    /// Download cache directory under the workdir.
    pub fn downloads_dir(&self) -> Utf8PathBuf {
        self.workdir.join("downloads")
    }

    /// Archive extraction directory under the workdir.
    pub fn extract_dir(&self) -> Utf8PathBuf {
        self.workdir.join("extract")
    }

    /// Rendered-manifest directory under the workdir.
    pub fn rendered_dir(&self) -> Utf8PathBuf {
        self.workdir.join("rendered")
    }

    /// The address:port clients use to reach the control plane, given the
    /// address of the first master.
    pub fn control_plane_endpoint(&self, first_master_address: &str) -> String {
        match &self.high_availability {
            HighAvailability::None => format!("{}:6443", first_master_address),
            HighAvailability::ExternalLb { vip, port } => format!("{}:{}", vip, port),
            HighAvailability::InternalLb { port } => format!("127.0.0.1:{}", port),
            HighAvailability::KubeVip { vip, .. } => format!("{}:6443", vip),
        }
    }

    /// Validate spec semantics beyond basic deserialization.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("cluster name must not be empty");
        }
        if self.hosts.is_empty() {
            bail!("cluster spec declares no hosts");
        }

        let mut seen = BTreeSet::new();
        for host in &self.hosts {
            if host.name.is_empty() {
                bail!("host with address {} has an empty name", host.address);
            }
            if !seen.insert(host.name.as_str()) {
                bail!("duplicate host name: {}", host.name);
            }
            if host.address.is_empty() {
                bail!("host {} has an empty address", host.name);
            }
            // Resolution errors (privilege: true without defaults) surface here
            // rather than at inventory construction.
            host.privilege
                .resolve(self.defaults.privilege.as_ref())
                .with_context(|| format!("host {} privilege setting is invalid", host.name))?;
        }

        let masters: Vec<&HostSpec> = self
            .hosts
            .iter()
            .filter(|h| h.roles.contains(&Role::Master))
            .collect();
        if masters.is_empty() {
            bail!("no host carries the master role");
        }

        let etcd_hosts = self
            .hosts
            .iter()
            .filter(|h| h.roles.contains(&Role::Etcd))
            .count();
        match &self.etcd {
            EtcdConfig::Managed => {
                if etcd_hosts == 0 {
                    bail!("managed etcd requires at least one host with the etcd role");
                }
            }
            EtcdConfig::External {
                endpoints,
                cert_file,
                key_file,
                ..
            } => {
                if endpoints.is_empty() {
                    bail!("external etcd requires at least one endpoint");
                }
                if cert_file.is_some() != key_file.is_some() {
                    bail!("external etcd cert_file and key_file must be provided together");
                }
            }
        }

        match &self.high_availability {
            HighAvailability::None => {}
            HighAvailability::ExternalLb { vip, .. } | HighAvailability::KubeVip { vip, .. } => {
                vip.parse::<std::net::IpAddr>()
                    .map_err(|_| anyhow::anyhow!("high_availability vip '{}' is not an IP address", vip))?;
                if masters.len() < 2 {
                    bail!(
                        "high_availability type '{}' requires at least two masters",
                        match self.high_availability {
                            HighAvailability::ExternalLb { .. } => "external-lb",
                            _ => "kube-vip",
                        }
                    );
                }
            }
            HighAvailability::InternalLb { port } => {
                if *port == 6443 {
                    bail!("internal-lb port must differ from the apiserver port 6443");
                }
                if masters.len() < 2 {
                    bail!("high_availability type 'internal-lb' requires at least two masters");
                }
            }
        }

        self.versions.validate()?;
        self.cni.validate()?;

        for addon in &self.addons {
            if addon.trim().is_empty() {
                bail!("addon names must not be empty");
            }
        }

        Ok(())
    }
}

/// Loads a cluster spec from a YAML file.
///
/// # Examples
///
/// ```no_run
/// use camino::Utf8Path;
/// use kubeforge::config;
///
/// let spec = config::load_spec(Utf8Path::new("./cluster.yaml")).unwrap();
/// println!("cluster: {}", spec.name);
/// ```
#[tracing::instrument]
pub fn load_spec(path: &Utf8Path) -> Result<ClusterSpec> {
    let file = File::open(path).with_context(|| format!("failed to load file: {}", path))?;
    let reader = BufReader::new(file);
    let spec: ClusterSpec = serde_yaml::from_reader(reader)
        .with_context(|| format!("failed to parse yaml: {}", path))?;
    debug!("loaded cluster spec:\n{:#?}", spec);
    Ok(spec)
}
