//! Load balancer phase: the control plane endpoint topology.
//!
//! Exactly one of the tasks plans work, selected by exhaustive matching on
//! the spec's HA variant; the module as a whole is skipped when no HA
//! topology is configured.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::config::HighAvailability;
use crate::context::{ModuleContext, TaskContext};
use crate::graph::ExecutionFragment;
use crate::host::{Host, Role};
use crate::module::Module;
use crate::step::Step;
use crate::steps::{CommandStep, RenderFileStep};
use crate::task::{FragmentBuilder, Task};

/// Plans the HA endpoint: probe, haproxy static pods, or kube-vip.
pub struct LoadBalancerModule;

impl Module for LoadBalancerModule {
    fn name(&self) -> &str {
        "load-balancer"
    }

    fn is_required(&self, ctx: &ModuleContext) -> Result<bool> {
        Ok(ctx.spec().high_availability != HighAvailability::None)
    }

    fn tasks(&self) -> Vec<Box<dyn Task>> {
        vec![
            Box::new(ProbeExternalLbTask),
            Box::new(HaproxyStaticPodTask),
            Box::new(KubeVipManifestTask),
        ]
    }
}

/// For an operator-managed LB, verify the VIP actually answers before any
/// master points at it.
struct ProbeExternalLbTask;

impl Task for ProbeExternalLbTask {
    fn name(&self) -> &str {
        "probe-external-lb"
    }

    fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(matches!(
            ctx.spec().high_availability,
            HighAvailability::ExternalLb { .. }
        ))
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let HighAvailability::ExternalLb { vip, port } = &ctx.spec().high_availability else {
            return Ok(ExecutionFragment::new(self.name()));
        };

        let step: Arc<dyn Step> = Arc::new(
            CommandStep::shell(
                "probe-lb-endpoint",
                "verify the external load balancer endpoint is reachable",
                format!("nc -z -w 5 {} {}", vip, port),
            )
            .with_timeout(Duration::from_secs(30)),
        );

        let mut builder = FragmentBuilder::new(self.name());
        builder.add_node("probe", step, vec![ctx.control_node().clone()])?;
        builder.build()
    }
}

/// Renders an haproxy static pod on every worker for the internal LB
/// topology: workers reach the apiserver through localhost.
struct HaproxyStaticPodTask;

impl HaproxyStaticPodTask {
    fn haproxy_cfg(port: u16, masters: &[Host]) -> String {
        let mut cfg = format!(
            "defaults\n\
             \x20 mode tcp\n\
             \x20 timeout connect 5s\n\
             \x20 timeout client 30s\n\
             \x20 timeout server 30s\n\
             \n\
             frontend apiserver\n\
             \x20 bind 127.0.0.1:{}\n\
             \x20 default_backend masters\n\
             \n\
             backend masters\n\
             \x20 balance roundrobin\n",
            port
        );
        for master in masters {
            cfg.push_str(&format!(
                "  server {} {}:6443 check\n",
                master.name(),
                master.address()
            ));
        }
        cfg
    }

    fn static_pod() -> String {
        "apiVersion: v1\n\
         kind: Pod\n\
         metadata:\n\
         \x20 name: haproxy\n\
         \x20 namespace: kube-system\n\
         spec:\n\
         \x20 hostNetwork: true\n\
         \x20 containers:\n\
         \x20 - name: haproxy\n\
         \x20\x20\x20 image: haproxy:2.9\n\
         \x20\x20\x20 volumeMounts:\n\
         \x20\x20\x20 - name: config\n\
         \x20\x20\x20\x20\x20 mountPath: /usr/local/etc/haproxy/haproxy.cfg\n\
         \x20\x20\x20\x20\x20 readOnly: true\n\
         \x20 volumes:\n\
         \x20 - name: config\n\
         \x20\x20\x20 hostPath:\n\
         \x20\x20\x20\x20\x20 path: /etc/haproxy/haproxy.cfg\n\
         \x20\x20\x20\x20\x20 type: File\n"
            .to_string()
    }
}

impl Task for HaproxyStaticPodTask {
    fn name(&self) -> &str {
        "haproxy-static-pod"
    }

    fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(matches!(
            ctx.spec().high_availability,
            HighAvailability::InternalLb { .. }
        ))
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let HighAvailability::InternalLb { port } = ctx.spec().high_availability else {
            return Ok(ExecutionFragment::new(self.name()));
        };
        let workers = ctx.hosts_with_role(Role::Worker);
        if workers.is_empty() {
            return Ok(ExecutionFragment::new(self.name()));
        }
        let masters = ctx.hosts_with_role(Role::Master);

        let config: Arc<dyn Step> = Arc::new(RenderFileStep::new(
            "render-haproxy-cfg",
            "write the haproxy configuration",
            Self::haproxy_cfg(port, &masters),
            Utf8PathBuf::from("/etc/haproxy/haproxy.cfg"),
        ));
        let manifest: Arc<dyn Step> = Arc::new(RenderFileStep::new(
            "render-haproxy-pod",
            "write the haproxy static pod manifest",
            Self::static_pod(),
            Utf8PathBuf::from("/etc/kubernetes/manifests/haproxy.yaml"),
        ));

        let mut builder = FragmentBuilder::new(self.name());
        builder.staged_per_host(&[("config", config), ("manifest", manifest)], &workers)?;
        builder.build()
    }
}

/// Renders kube-vip static pods on the masters to advertise the VIP.
struct KubeVipManifestTask;

impl KubeVipManifestTask {
    fn manifest(vip: &str, interface: &str) -> String {
        format!(
            "apiVersion: v1\n\
             kind: Pod\n\
             metadata:\n\
             \x20 name: kube-vip\n\
             \x20 namespace: kube-system\n\
             spec:\n\
             \x20 hostNetwork: true\n\
             \x20 containers:\n\
             \x20 - name: kube-vip\n\
             \x20\x20\x20 image: ghcr.io/kube-vip/kube-vip:v0.7.2\n\
             \x20\x20\x20 args: [manager]\n\
             \x20\x20\x20 env:\n\
             \x20\x20\x20 - name: address\n\
             \x20\x20\x20\x20\x20 value: \"{vip}\"\n\
             \x20\x20\x20 - name: vip_interface\n\
             \x20\x20\x20\x20\x20 value: \"{interface}\"\n\
             \x20\x20\x20 - name: vip_leaderelection\n\
             \x20\x20\x20\x20\x20 value: \"true\"\n\
             \x20\x20\x20 securityContext:\n\
             \x20\x20\x20\x20\x20 capabilities:\n\
             \x20\x20\x20\x20\x20\x20\x20 add: [NET_ADMIN, NET_RAW]\n",
            vip = vip,
            interface = interface
        )
    }
}

impl Task for KubeVipManifestTask {
    fn name(&self) -> &str {
        "kube-vip-manifest"
    }

    fn is_required(&self, ctx: &TaskContext) -> Result<bool> {
        Ok(matches!(
            ctx.spec().high_availability,
            HighAvailability::KubeVip { .. }
        ))
    }

    fn plan(&self, ctx: &TaskContext) -> Result<ExecutionFragment> {
        let HighAvailability::KubeVip { vip, interface } = &ctx.spec().high_availability else {
            return Ok(ExecutionFragment::new(self.name()));
        };
        let masters = ctx.hosts_with_role(Role::Master);

        let step: Arc<dyn Step> = Arc::new(RenderFileStep::new(
            "render-kube-vip-pod",
            "write the kube-vip static pod manifest",
            Self::manifest(vip, interface),
            Utf8PathBuf::from("/etc/kubernetes/manifests/kube-vip.yaml"),
        ));

        let mut builder = FragmentBuilder::new(self.name());
        builder.fan_out("manifest", step, &masters)?;
        builder.build()
    }
}
