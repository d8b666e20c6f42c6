//! Lifecycle-phase planning modules.
//!
//! Each module here is one phase of a pipeline: it owns its tasks, decides
//! whether the spec requires it at all, and composes its tasks' fragments
//! through the default sequential composer. All host selection goes through
//! the context's role-indexed view.

pub mod addons;
pub mod controlplane;
pub mod etcd;
pub mod infra;
pub mod loadbalancer;
pub mod network;
pub mod preflight;
pub mod teardown;
pub mod upgrade;

pub use addons::AddonsModule;
pub use controlplane::ControlPlaneModule;
pub use etcd::EtcdModule;
pub use infra::InfraModule;
pub use loadbalancer::LoadBalancerModule;
pub use network::NetworkModule;
pub use preflight::PreflightModule;
pub use teardown::TeardownModule;
pub use upgrade::{UpgradeControlPlaneModule, UpgradeWorkersModule};

/// Kubeconfig the control-plane steps pass to kubectl.
pub(crate) const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";
