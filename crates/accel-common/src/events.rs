//! Kubernetes Events announcing ClusterPolicy state changes
//!
//! Status transitions and stage failures are reported as Events on the
//! ClusterPolicy, visible via `kubectl describe clusterpolicy`. Publishing is
//! fire-and-forget: a failed event is logged and never fails a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::crd::ReconciliationStatus;
use crate::POD_NAME_ENV;

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// Another ClusterPolicy is already effective
    pub const IGNORED: &str = "Ignored";
    /// At least one stage is still converging
    pub const NOT_READY: &str = "NotReady";
    /// Every enabled stage is ready
    pub const READY: &str = "Ready";
    /// A stage operation failed
    pub const STAGE_FAILED: &str = "StageFailed";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    /// Persisting the aggregate state
    pub const RECONCILE: &str = "Reconcile";
    /// Deploying a stage's operands
    pub const DEPLOY: &str = "Deploy";
}

/// Something worth telling the owner of a ClusterPolicy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    /// The persisted state changed
    StateChanged(ReconciliationStatus),
    /// The stage walk failed with the given error
    StageFailed(String),
}

impl PolicyEvent {
    /// The Kubernetes Event to record, `None` for states that are not announced
    pub fn to_event(&self) -> Option<Event> {
        let (type_, reason, action, note) = match self {
            Self::StateChanged(ReconciliationStatus::Ready) => (
                EventType::Normal,
                reasons::READY,
                actions::RECONCILE,
                "all enabled stages are ready".to_string(),
            ),
            Self::StateChanged(ReconciliationStatus::NotReady) => (
                EventType::Warning,
                reasons::NOT_READY,
                actions::RECONCILE,
                "waiting for operands to become ready".to_string(),
            ),
            Self::StateChanged(ReconciliationStatus::Ignored) => (
                EventType::Warning,
                reasons::IGNORED,
                actions::RECONCILE,
                "another ClusterPolicy is already active".to_string(),
            ),
            Self::StateChanged(ReconciliationStatus::Disabled) => return None,
            Self::StageFailed(error) => (
                EventType::Warning,
                reasons::STAGE_FAILED,
                actions::DEPLOY,
                error.clone(),
            ),
        };
        Some(Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        })
    }
}

/// Sink for ClusterPolicy events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` on the policy behind `policy`
    async fn publish(&self, policy: &ObjectReference, event: PolicyEvent);
}

/// Publishes through `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, with the pod name as instance when known
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var(POD_NAME_ENV).ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, policy: &ObjectReference, event: PolicyEvent) {
        let Some(recorded) = event.to_event() else {
            return;
        };
        if let Err(e) = self.recorder.publish(&recorded, policy).await {
            warn!(
                reason = %recorded.reason,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _policy: &ObjectReference, _event: PolicyEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_is_normal_everything_else_warns() {
        let ready = PolicyEvent::StateChanged(ReconciliationStatus::Ready)
            .to_event()
            .unwrap();
        assert_eq!(ready.type_, EventType::Normal);
        assert_eq!(ready.reason, reasons::READY);
        assert_eq!(ready.action, actions::RECONCILE);

        for state in [ReconciliationStatus::NotReady, ReconciliationStatus::Ignored] {
            let event = PolicyEvent::StateChanged(state).to_event().unwrap();
            assert_eq!(event.type_, EventType::Warning, "{state}");
        }
    }

    #[test]
    fn disabled_is_not_announced() {
        assert!(PolicyEvent::StateChanged(ReconciliationStatus::Disabled)
            .to_event()
            .is_none());
    }

    #[test]
    fn stage_failure_carries_the_error() {
        let event = PolicyEvent::StageFailed("stage state-driver failed: boom".to_string())
            .to_event()
            .unwrap();
        assert_eq!(event.reason, reasons::STAGE_FAILED);
        assert_eq!(event.action, actions::DEPLOY);
        assert_eq!(
            event.note.as_deref(),
            Some("stage state-driver failed: boom")
        );
    }
}
