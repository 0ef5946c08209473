//! Labels the operator maintains on its own namespace

use accel_common::SUGGESTED_NAMESPACE;

use crate::Labels;

/// Pod security admission modes set to `privileged`
pub const POD_SECURITY_MODES: [&str; 3] = ["enforce", "audit", "warn"];

const POD_SECURITY_PREFIX: &str = "pod-security.kubernetes.io/";
const PRIVILEGED: &str = "privileged";

/// OpenShift cluster monitoring opt-in label
pub const MONITORING_LABEL: &str = "openshift.io/cluster-monitoring";

/// Pod security labels that are missing or wrong on the namespace
///
/// Returns an empty map when the namespace is already privileged in every mode.
pub fn pod_security_patch(current: &Labels) -> Labels {
    POD_SECURITY_MODES
        .iter()
        .map(|mode| format!("{POD_SECURITY_PREFIX}{mode}"))
        .filter(|key| current.get(key).map(String::as_str) != Some(PRIVILEGED))
        .map(|key| (key, PRIVILEGED.to_string()))
        .collect()
}

/// Whether the operator may opt `namespace` into cluster monitoring
///
/// Only the suggested namespace qualifies; any other may be shared with
/// workloads that must not be scraped.
pub fn monitoring_allowed(namespace: &str) -> bool {
    namespace == SUGGESTED_NAMESPACE
}

/// Outcome of the namespace monitoring check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitoringDecision {
    /// Label already set by someone; its value is respected
    AlreadySet(String),
    /// Add the label with value `true`
    Enable,
}

/// Decide whether to add the monitoring label to an allowed namespace
pub fn monitoring_decision(current: &Labels) -> MonitoringDecision {
    match current.get(MONITORING_LABEL) {
        Some(value) => MonitoringDecision::AlreadySet(value.clone()),
        None => MonitoringDecision::Enable,
    }
}
