//! ClusterPolicy and driver upgrade controllers
//!
//! The policy controller labels accelerator nodes and deploys the operand
//! stages; the upgrade controller hands driver upgrade state to an
//! [`upgrade::UpgradeStateManager`].

#![deny(missing_docs)]

pub mod controller;
pub mod namespace;
pub mod probe;
pub mod stages;
pub mod toolkit;
pub mod upgrade;
pub mod watch;

pub use controller::{
    error_policy, reconcile, Context, ContextBuilder, FatalChannel, KubeClient, KubeClientImpl,
    OperatorConfig,
};
pub use stages::{load_stages, Stage, StageKind};
pub use watch::NodeTracker;

pub use accel_common::{Error, Result};
