//! Cluster spec ingestion tests over YAML fixtures on disk.

mod helpers;

use std::io::Write;

use camino::Utf8Path;
use kubeforge::config::{self, ClusterSpec, EtcdConfig, HighAvailability};
use kubeforge::host::Role;
use kubeforge::privilege::{Privilege, PrivilegeMethod};
use tempfile::NamedTempFile;

fn write_spec(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp spec");
    file.write_all(yaml.as_bytes()).expect("write temp spec");
    file
}

fn load(yaml: &str) -> anyhow::Result<ClusterSpec> {
    let file = write_spec(yaml);
    config::load_spec(Utf8Path::from_path(file.path()).unwrap())
}

#[test]
fn full_featured_spec_loads() {
    let yaml = yaml! {
        r#"
        name: production
        workdir: /srv/kubeforge
        offline: true
        hosts:
          - name: m1
            address: 10.1.0.10
            roles: [master, etcd]
            user: ops
          - name: m2
            address: 10.1.0.11
            port: 2222
            roles: [master, etcd]
            privilege:
              method: doas
          - name: w1
            address: 10.1.0.20
            roles: [worker]
            privilege: false
        defaults:
          privilege:
            method: sudo
        versions:
          kubernetes: v1.29.3
          etcd: v3.5.13
          containerd: v1.7.16
        high_availability:
          type: external-lb
          vip: 10.1.0.100
          port: 8443
        cni:
          type: cilium
          version: v1.15.4
        etcd:
          type: external
          endpoints:
            - https://10.1.0.5:2379
          ca_file: /etc/ssl/etcd/ca.pem
        addons:
          - metrics-server
          - ingress-nginx
        registry:
          url: https://registry.internal:5000
          insecure: true
        "#
    };

    let spec = load(&yaml).unwrap();
    spec.validate().unwrap();

    assert_eq!(spec.name, "production");
    assert!(spec.offline);
    assert_eq!(spec.workdir.as_str(), "/srv/kubeforge");
    assert_eq!(spec.hosts.len(), 3);
    assert_eq!(spec.hosts[0].user.as_deref(), Some("ops"));
    assert_eq!(spec.hosts[1].port, 2222);
    assert!(spec.hosts[0].roles.contains(&Role::Etcd));
    assert_eq!(
        spec.hosts[1].privilege,
        Privilege::Method(PrivilegeMethod::Doas)
    );
    assert_eq!(spec.hosts[2].privilege, Privilege::Disabled);

    assert_eq!(
        spec.high_availability,
        HighAvailability::ExternalLb {
            vip: "10.1.0.100".to_string(),
            port: 8443
        }
    );
    assert!(matches!(spec.etcd, EtcdConfig::External { .. }));
    assert_eq!(spec.cni.name(), "cilium");
    assert_eq!(spec.addons, vec!["metrics-server", "ingress-nginx"]);
    let registry = spec.registry.as_ref().unwrap();
    assert!(registry.insecure);
    assert_eq!(registry.url.as_str(), "https://registry.internal:5000/");

    // Host privilege resolution against the defaults.
    let defaults = spec.defaults.privilege.as_ref();
    assert_eq!(
        spec.hosts[0].privilege.resolve(defaults).unwrap(),
        Some(PrivilegeMethod::Sudo)
    );
    assert_eq!(spec.hosts[2].privilege.resolve(defaults).unwrap(), None);
}

#[test]
fn missing_file_is_an_error() {
    let result = config::load_spec(Utf8Path::new("/nonexistent/cluster.yaml"));
    let err = result.unwrap_err();
    assert!(err.to_string().contains("failed to load file"));
}

#[test]
fn malformed_yaml_is_an_error() {
    let err = load("name: [unterminated").unwrap_err();
    assert!(format!("{:#}", err).contains("failed to parse yaml"));
}

#[test]
fn unknown_cni_type_is_rejected() {
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
          type: weave
        "#
    };
    assert!(load(&yaml).is_err(), "unknown CNI type must fail to parse");
}

#[test]
fn unknown_etcd_mode_is_rejected() {
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
        etcd:
          type: embedded
        "#
    };
    assert!(load(&yaml).is_err(), "unknown etcd mode must fail to parse");
}

#[test]
fn privilege_true_without_defaults_fails_validation() {
    let yaml = yaml! {
        r#"
        name: demo
        hosts:
          - name: m1
            address: 10.0.0.10
            roles: [master, etcd]
            privilege: true
        versions:
          kubernetes: v1.29.3
        cni:
          type: calico
        "#
    };
    let spec = load(&yaml).unwrap();
    let err = spec.validate().unwrap_err();
    assert!(format!("{:#}", err).contains("defaults.privilege.method"));
}

#[test]
fn kube_vip_requires_two_masters() {
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
        high_availability:
          type: kube-vip
          vip: 10.0.0.100
        "#
    };
    let spec = load(&yaml).unwrap();
    let err = spec.validate().unwrap_err();
    assert!(err.to_string().contains("at least two masters"));
}
