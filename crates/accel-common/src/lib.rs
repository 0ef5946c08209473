//! Common types for the accelerator operator: CRDs, errors, events and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply and patch issued by the operator
pub const FIELD_MANAGER: &str = "accel-operator";

/// Namespace the operator bundle suggests installing into
///
/// Follows the xdxct label domain used by every managed label.
///
/// Namespace monitoring is only enabled when the operator runs here, since other
/// namespaces may be shared with untrusted workloads.
pub const SUGGESTED_NAMESPACE: &str = "xdxct-gpu-operator";

/// Environment variable carrying the namespace the operator runs in
pub const OPERATOR_NAMESPACE_ENV: &str = "OPERATOR_NAMESPACE";

/// Environment variable carrying the operator pod's name, set via the downward API
pub const POD_NAME_ENV: &str = "POD_NAME";
