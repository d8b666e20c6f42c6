//! Pipeline constructors by run intent.
//!
//! Each constructor returns a [`Pipeline`] with its module list already
//! assembled; module- and task-level `is_required` checks trim the plan to
//! what the spec actually calls for.

use crate::modules::{
    AddonsModule, ControlPlaneModule, EtcdModule, InfraModule, LoadBalancerModule, NetworkModule,
    PreflightModule, TeardownModule, UpgradeControlPlaneModule, UpgradeWorkersModule,
};
use crate::pipeline::Pipeline;

/// Bare hosts to a ready cluster.
pub fn create_pipeline() -> Pipeline {
    Pipeline::new(
        "create-cluster",
        vec![
            Box::new(PreflightModule),
            Box::new(InfraModule),
            Box::new(EtcdModule),
            Box::new(LoadBalancerModule),
            Box::new(ControlPlaneModule),
            Box::new(NetworkModule),
            Box::new(AddonsModule),
        ],
    )
}

/// Tear the cluster down and remove its state.
pub fn delete_pipeline() -> Pipeline {
    Pipeline::new("delete-cluster", vec![Box::new(TeardownModule)])
}

/// Roll the cluster to the spec's component versions.
pub fn upgrade_pipeline() -> Pipeline {
    Pipeline::new(
        "upgrade-cluster",
        vec![
            Box::new(PreflightModule),
            Box::new(UpgradeControlPlaneModule),
            Box::new(UpgradeWorkersModule),
        ],
    )
}
