//! Labels maintained on the operator's own namespace

use tracing::{debug, info, warn};

use accel_common::Error;
use accel_node::namespace::{
    monitoring_allowed, monitoring_decision, pod_security_patch, MonitoringDecision,
    MONITORING_LABEL,
};
use accel_node::Labels;

use crate::controller::KubeClient;

/// Mark the namespace privileged for every pod security admission mode
pub async fn ensure_pod_security(kube: &dyn KubeClient, namespace: &str) -> Result<(), Error> {
    let current = kube.get_namespace_labels(namespace).await?;
    let patch = pod_security_patch(&current);
    if patch.is_empty() {
        debug!(namespace, "pod security labels already present");
        return Ok(());
    }
    info!(namespace, labels = patch.len(), "adding pod security labels to operator namespace");
    kube.patch_namespace_labels(namespace, &patch).await
}

/// Opt the operator namespace into cluster monitoring when it is safe to
pub async fn ensure_monitoring(kube: &dyn KubeClient, namespace: &str) -> Result<(), Error> {
    if !monitoring_allowed(namespace) {
        info!(namespace, "operator not in the suggested namespace, skipping monitoring label");
        return Ok(());
    }
    let current = kube.get_namespace_labels(namespace).await?;
    match monitoring_decision(&current) {
        MonitoringDecision::AlreadySet(value) if value == "true" => {
            debug!(namespace, "cluster monitoring enabled on operator namespace");
            Ok(())
        }
        MonitoringDecision::AlreadySet(value) => {
            warn!(namespace, label = MONITORING_LABEL, %value, "cluster monitoring disabled on user request");
            Ok(())
        }
        MonitoringDecision::Enable => {
            info!(
                namespace,
                "enabling cluster monitoring; set {MONITORING_LABEL}=false on the namespace to disable"
            );
            let patch = Labels::from([(MONITORING_LABEL.to_string(), "true".to_string())]);
            kube.patch_namespace_labels(namespace, &patch).await
        }
    }
}
