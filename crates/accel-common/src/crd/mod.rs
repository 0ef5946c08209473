//! Custom Resource Definitions for the accelerator operator
//!
//! This module contains the ClusterPolicy CRD and the types it is built from.

mod cluster_policy;
mod types;

pub use cluster_policy::{
    ClusterPolicy, ClusterPolicySpec, ClusterPolicyStatus, ComponentSpec, DriverSpec,
    OperatorSpec, SandboxWorkloadsSpec, ToggleSpec, UpgradePolicySpec,
};
pub use types::{ComponentKind, ImageSpec, IntOrPercent, ReconciliationStatus, Runtime};
