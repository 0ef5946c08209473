//! Node classification for the accelerator operator
//!
//! Everything in this crate is a pure function of node labels, annotations
//! and status strings. The policy controller feeds it the node inventory and
//! writes back whatever delta it computes.

pub mod facts;
pub mod labels;
pub mod mig;
pub mod namespace;
pub mod reconcile;
pub mod runtime;
pub mod toolkit;
pub mod upgrade;
pub mod version;
pub mod watch;
pub mod workload;

pub use facts::NodeFacts;
pub use reconcile::{reconcile_labels, LabelOutcome};
pub use runtime::{classify_runtime, detect_runtime};
pub use toolkit::{CompatibilityIndex, DriverToolkitState};
pub use workload::WorkloadConfig;

/// Label map type used throughout the crate
pub type Labels = std::collections::BTreeMap<String, String>;
