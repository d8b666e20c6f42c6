//! Host model: roles, facts, and the inventory derived from a cluster spec.
//!
//! A [`Host`] is a cheap-to-clone handle carrying everything the planner and
//! engine need to know about one endpoint: name, address, role set, resolved
//! privilege method, its connector, and the facts gathered at startup. The
//! [`Inventory`] owns the full host list and answers the role-indexed
//! queries tasks are required to plan against.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::connector::{Connector, ConnectorFactory};
use crate::config::ClusterSpec;
use crate::error::KubeforgeError;
use crate::privilege::PrivilegeMethod;

/// Cluster role a host can carry.
///
/// Roles are a closed set; unknown role names in YAML fail spec validation
/// instead of silently producing unplannable hosts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// Control-plane node.
    Master,
    /// Workload node.
    Worker,
    /// Etcd member.
    Etcd,
    /// Private image registry host.
    Registry,
}

/// Package manager family detected on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Apk,
    Unknown,
}

/// Facts gathered once per host before the first step touches it.
#[derive(Debug, Clone)]
pub struct Facts {
    /// Kernel name (`uname -s`), e.g. "Linux".
    pub os: String,
    /// Machine architecture (`uname -m`), e.g. "x86_64".
    pub arch: String,
    /// Kernel release (`uname -r`).
    pub kernel: String,
    /// Detected package manager family.
    pub package_manager: PackageManager,
}

struct HostData {
    name: String,
    address: String,
    port: u16,
    user: Option<String>,
    roles: BTreeSet<Role>,
    control_node: bool,
    privilege: Option<PrivilegeMethod>,
    connector: Arc<dyn Connector>,
    facts: OnceLock<Facts>,
}

/// A named endpoint participating in the cluster.
///
/// Cloning is cheap (one `Arc`); equality and hashing are by host name,
/// which the spec validator guarantees to be unique.
#[derive(Clone)]
pub struct Host {
    data: Arc<HostData>,
}

impl Host {
    /// Starts building a host around its connector.
    pub fn builder(name: impl Into<String>, connector: Arc<dyn Connector>) -> HostBuilder {
        HostBuilder {
            name: name.into(),
            address: "127.0.0.1".to_string(),
            port: 22,
            user: None,
            roles: BTreeSet::new(),
            control_node: false,
            privilege: None,
            connector,
        }
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn address(&self) -> &str {
        &self.data.address
    }

    pub fn port(&self) -> u16 {
        self.data.port
    }

    pub fn user(&self) -> Option<&str> {
        self.data.user.as_deref()
    }

    pub fn roles(&self) -> &BTreeSet<Role> {
        &self.data.roles
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.data.roles.contains(&role)
    }

    /// True for the distinguished process-local host.
    pub fn is_control_node(&self) -> bool {
        self.data.control_node
    }

    /// Resolved privilege escalation method for commands on this host.
    pub fn privilege(&self) -> Option<PrivilegeMethod> {
        self.data.privilege
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.data.connector)
    }

    /// Facts gathered at startup; `None` until gathering ran (e.g. dry runs).
    pub fn facts(&self) -> Option<&Facts> {
        self.data.facts.get()
    }

    /// Records gathered facts. Later calls for the same host are ignored.
    pub fn set_facts(&self, facts: Facts) {
        let _ = self.data.facts.set(facts);
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.data.name)
            .field("address", &self.data.address)
            .field("roles", &self.data.roles)
            .field("control_node", &self.data.control_node)
            .finish()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.data.name)
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.data.name == other.data.name
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.name.hash(state);
    }
}

/// Builder for [`Host`].
pub struct HostBuilder {
    name: String,
    address: String,
    port: u16,
    user: Option<String>,
    roles: BTreeSet<Role>,
    control_node: bool,
    privilege: Option<PrivilegeMethod>,
    connector: Arc<dyn Connector>,
}

impl HostBuilder {
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    #[must_use]
    pub fn roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.roles.extend(roles);
        self
    }

    #[must_use]
    pub fn control_node(mut self) -> Self {
        self.control_node = true;
        self
    }

    #[must_use]
    pub fn privilege(mut self, method: Option<PrivilegeMethod>) -> Self {
        self.privilege = method;
        self
    }

    pub fn build(self) -> Host {
        Host {
            data: Arc::new(HostData {
                name: self.name,
                address: self.address,
                port: self.port,
                user: self.user,
                roles: self.roles,
                control_node: self.control_node,
                privilege: self.privilege,
                connector: self.connector,
                facts: OnceLock::new(),
            }),
        }
    }
}

/// The resolved host list of one run.
///
/// Hosts keep their spec declaration order; the control node is always
/// present, synthesized as the process-local machine when the spec does not
/// declare a loopback host.
pub struct Inventory {
    hosts: Vec<Host>,
    control_node: Host,
}

impl Inventory {
    /// Builds the inventory from a validated cluster spec.
    ///
    /// Per-host privilege settings are resolved against the spec defaults
    /// here, and each host receives its connector from the factory.
    pub fn from_spec(spec: &ClusterSpec, factory: &dyn ConnectorFactory) -> anyhow::Result<Self> {
        let mut hosts = Vec::with_capacity(spec.hosts.len() + 1);
        let mut control_node = None;

        for host_spec in &spec.hosts {
            let is_control = control_node.is_none() && host_spec.is_loopback();
            let privilege = host_spec
                .privilege
                .resolve(spec.defaults.privilege.as_ref())?;
            let connector = factory.connect(host_spec, is_control)?;

            let mut builder = Host::builder(&host_spec.name, connector)
                .address(&host_spec.address)
                .port(host_spec.port)
                .roles(host_spec.roles.iter().copied())
                .privilege(privilege);
            if let Some(user) = &host_spec.user {
                builder = builder.user(user);
            }
            if is_control {
                builder = builder.control_node();
            }

            let host = builder.build();
            if is_control {
                control_node = Some(host.clone());
            }
            hosts.push(host);
        }

        let control_node = match control_node {
            Some(host) => host,
            None => {
                let host_spec = crate::config::HostSpec::local_control_node();
                let connector = factory.connect(&host_spec, true)?;
                let host = Host::builder(&host_spec.name, connector)
                    .address(&host_spec.address)
                    .control_node()
                    .build();
                hosts.push(host.clone());
                host
            }
        };

        Ok(Self {
            hosts,
            control_node,
        })
    }

    /// Assembles an inventory from already-built hosts.
    ///
    /// The control node must be part of `hosts`.
    pub fn new(hosts: Vec<Host>) -> Result<Self, KubeforgeError> {
        let control_node = hosts
            .iter()
            .find(|h| h.is_control_node())
            .cloned()
            .ok_or_else(|| KubeforgeError::Spec("inventory has no control node".to_string()))?;
        Ok(Self {
            hosts,
            control_node,
        })
    }

    /// All cluster hosts in declaration order, control node included.
    pub fn all_hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Hosts tagged with `role`, preserving declaration order.
    pub fn hosts_with_role(&self, role: Role) -> Vec<Host> {
        self.hosts
            .iter()
            .filter(|h| h.has_role(role))
            .cloned()
            .collect()
    }

    /// The distinguished process-local host.
    pub fn control_node(&self) -> &Host {
        &self.control_node
    }

    /// First declared master, when any.
    pub fn first_master(&self) -> Option<Host> {
        self.hosts.iter().find(|h| h.has_role(Role::Master)).cloned()
    }

    pub fn find(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{CommandSpec, ExecOutput, FileStat, TransferSource};
    use async_trait::async_trait;
    use camino::Utf8Path;

    struct NullConnector;

    #[async_trait]
    impl Connector for NullConnector {
        async fn exec(&self, _spec: &CommandSpec) -> anyhow::Result<ExecOutput> {
            Ok(ExecOutput::default())
        }

        async fn put(
            &self,
            _source: &TransferSource,
            _dest: &Utf8Path,
            _mode: u32,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn fetch(&self, _path: &Utf8Path) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn stat(&self, _path: &Utf8Path) -> anyhow::Result<Option<FileStat>> {
            Ok(None)
        }
    }

    fn host(name: &str, roles: &[Role]) -> Host {
        Host::builder(name, Arc::new(NullConnector))
            .roles(roles.iter().copied())
            .build()
    }

    fn control(name: &str) -> Host {
        Host::builder(name, Arc::new(NullConnector))
            .control_node()
            .build()
    }

    #[test]
    fn role_display_is_lowercase() {
        assert_eq!(Role::Master.to_string(), "master");
        assert_eq!(Role::Etcd.to_string(), "etcd");
    }

    #[test]
    fn role_rejects_unknown_yaml_value() {
        let result: Result<Role, _> = serde_yaml::from_str("gateway");
        assert!(result.is_err(), "unknown role must fail to parse");
    }

    #[test]
    fn host_equality_is_by_name() {
        let a = host("m1", &[Role::Master]);
        let b = host("m1", &[Role::Worker]);
        assert_eq!(a, b);
    }

    #[test]
    fn hosts_with_role_preserves_declaration_order() {
        let inventory = Inventory::new(vec![
            host("w2", &[Role::Worker]),
            host("m1", &[Role::Master, Role::Etcd]),
            host("w1", &[Role::Worker]),
            control("ctl"),
        ])
        .unwrap();

        let workers: Vec<String> = inventory
            .hosts_with_role(Role::Worker)
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(workers, vec!["w2", "w1"]);
        assert_eq!(inventory.first_master().unwrap().name(), "m1");
    }

    #[test]
    fn inventory_requires_control_node() {
        let result = Inventory::new(vec![host("m1", &[Role::Master])]);
        assert!(matches!(result, Err(KubeforgeError::Spec(_))));
    }

    #[test]
    fn facts_are_write_once() {
        let h = host("m1", &[]);
        assert!(h.facts().is_none());
        h.set_facts(Facts {
            os: "Linux".to_string(),
            arch: "x86_64".to_string(),
            kernel: "6.8.0".to_string(),
            package_manager: PackageManager::Apt,
        });
        h.set_facts(Facts {
            os: "Darwin".to_string(),
            arch: "arm64".to_string(),
            kernel: "23.0".to_string(),
            package_manager: PackageManager::Unknown,
        });
        assert_eq!(h.facts().unwrap().os, "Linux");
    }
}
