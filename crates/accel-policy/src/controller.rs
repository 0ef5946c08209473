//! ClusterPolicy controller implementation
//!
//! Each pass labels the accelerator nodes, walks the deployment stages once
//! and records the aggregate readiness on the policy status. Only the first
//! ClusterPolicy seen by the process is acted on; any later one is marked
//! Ignored.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{Api, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::discovery::{ApiResource, Discovery};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use accel_common::crd::{ClusterPolicy, ClusterPolicyStatus, ReconciliationStatus};
use accel_common::events::{EventPublisher, KubeEventPublisher, PolicyEvent};
use accel_common::metrics::{self, ReconcileOutcome, RECONCILIATION_TOTAL};
use accel_common::{Error, FIELD_MANAGER, OPERATOR_NAMESPACE_ENV};
use accel_node::version::is_valid_semver;
use accel_node::Labels;

use crate::namespace::{ensure_monitoring, ensure_pod_security};
use crate::probe::{label_nodes, sync_upgrade_annotations};
use crate::stages::{walk, Stage, StageInput};
use crate::toolkit;
use crate::upgrade::{ObservingUpgradeManager, UpgradeStateManager};

/// Reporting component on events emitted by this controller
pub const CONTROLLER_NAME: &str = "clusterpolicy-controller";

/// API group whose presence identifies an OpenShift cluster
pub const OPENSHIFT_CONFIG_GROUP: &str = "config.openshift.io";

/// Requeue interval for NotReady policies and failed passes
pub const NOT_READY_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue interval while no node carries feature discovery labels
pub const NO_NFD_REQUEUE: Duration = Duration::from_secs(45);

/// Label or annotation merge patch; `None` removes the key
pub type LabelPatch = BTreeMap<String, Option<String>>;

/// Trait abstracting Kubernetes client operations for ClusterPolicy
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// List every node in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// Merge-patch node labels
    async fn patch_node_labels(&self, name: &str, patch: &LabelPatch) -> Result<(), Error>;

    /// Merge-patch node annotations
    async fn patch_node_annotations(&self, name: &str, patch: &LabelPatch) -> Result<(), Error>;

    /// List pods in `namespace` matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// Patch the ClusterPolicy status subresource
    async fn patch_policy_status(
        &self,
        name: &str,
        status: &ClusterPolicyStatus,
    ) -> Result<(), Error>;

    /// Labels of a namespace
    async fn get_namespace_labels(&self, name: &str) -> Result<Labels, Error>;

    /// Merge `labels` into a namespace
    async fn patch_namespace_labels(&self, name: &str, labels: &Labels) -> Result<(), Error>;

    /// Get a DaemonSet, `None` if it does not exist
    async fn get_daemonset(&self, namespace: &str, name: &str)
        -> Result<Option<DaemonSet>, Error>;

    /// Get an OpenShift ImageStream as raw JSON, `None` if it does not exist
    async fn get_image_stream(&self, namespace: &str, name: &str)
        -> Result<Option<Value>, Error>;

    /// API server git version, e.g. `v1.31.2`
    async fn server_version(&self) -> Result<String, Error>;

    /// Whether the API server serves `group`
    async fn has_api_group(&self, group: &str) -> Result<bool, Error>;

    /// Server-side apply a manifest
    async fn apply_manifest(&self, manifest: &Value) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn parse_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_node_labels(&self, name: &str, patch: &LabelPatch) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let body = serde_json::json!({ "metadata": { "labels": patch } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&body))
            .await?;
        Ok(())
    }

    async fn patch_node_annotations(&self, name: &str, patch: &LabelPatch) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let body = serde_json::json!({ "metadata": { "annotations": patch } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&body))
            .await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn patch_policy_status(
        &self,
        name: &str,
        status: &ClusterPolicyStatus,
    ) -> Result<(), Error> {
        let api: Api<ClusterPolicy> = Api::all(self.client.clone());

        let status_patch = serde_json::json!({
            "status": status
        });

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }

    async fn get_namespace_labels(&self, name: &str) -> Result<Labels, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = api.get(name).await?;
        Ok(ns.metadata.labels.unwrap_or_default())
    }

    async fn patch_namespace_labels(&self, name: &str, labels: &Labels) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let body = serde_json::json!({ "metadata": { "labels": labels } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&body))
            .await?;
        Ok(())
    }

    async fn get_daemonset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DaemonSet>, Error> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(ds) => Ok(Some(ds)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_image_stream(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, Error> {
        let gvk = GroupVersionKind::gvk("image.openshift.io", "v1", "ImageStream");
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let Some(stream) = api.get_opt(name).await? else {
            return Ok(None);
        };
        serde_json::to_value(stream)
            .map(Some)
            .map_err(|e| Error::serialization_for_kind("ImageStream", e.to_string()))
    }

    async fn server_version(&self) -> Result<String, Error> {
        Ok(self.client.apiserver_version().await?.git_version)
    }

    async fn has_api_group(&self, group: &str) -> Result<bool, Error> {
        let discovery = Discovery::new(self.client.clone())
            .filter(&[group])
            .run()
            .await?;
        Ok(discovery.has_group(group))
    }

    async fn apply_manifest(&self, manifest: &Value) -> Result<(), Error> {
        let field = |pointer: &str| {
            manifest
                .pointer(pointer)
                .and_then(Value::as_str)
                .ok_or_else(|| Error::serialization(format!("manifest missing {pointer}")))
        };
        let (group, version) = parse_api_version(field("/apiVersion")?);
        let kind = field("/kind")?;
        let name = field("/metadata/name")?;

        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
        let api: Api<DynamicObject> = match manifest.pointer("/metadata/namespace").and_then(Value::as_str) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(manifest),
        )
        .await?;
        debug!(kind, name, "applied manifest");
        Ok(())
    }
}

/// Operator settings taken from the command line and environment
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace the operands are deployed into
    pub namespace: Option<String>,
    /// Directory holding one manifest directory per stage
    pub assets_dir: PathBuf,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            assets_dir: PathBuf::from("/opt/gpu-operator"),
        }
    }
}

/// Facts about the cluster gathered once per process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    /// API server version
    pub kubernetes_version: String,
    /// The cluster is OpenShift
    pub openshift: bool,
}

/// Channel for reporting errors the process cannot recover from
pub type FatalChannel = tokio::sync::mpsc::Sender<String>;

/// Shared context for the ClusterPolicy and upgrade controllers
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .stages(stages)
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Event publisher for the ClusterPolicy
    pub events: Arc<dyn EventPublisher>,
    /// Driver upgrade orchestration
    pub upgrades: Arc<dyn UpgradeStateManager>,
    /// Operator settings
    pub config: OperatorConfig,
    /// Deployment stages, in order
    pub stages: Vec<Stage>,
    /// Where fatal errors are reported; None in tests
    pub fatal_tx: Option<FatalChannel>,
    singleton: OnceLock<String>,
    cluster: OnceCell<ClusterInfo>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom mock clients
    ///
    /// The namespace is preset and cluster facts are pinned to a plain
    /// (non-OpenShift) cluster so no discovery call is made.
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        upgrades: Arc<dyn UpgradeStateManager>,
        stages: Vec<Stage>,
    ) -> Self {
        Self {
            kube,
            events: Arc::new(accel_common::events::NoopEventPublisher),
            upgrades,
            config: OperatorConfig {
                namespace: Some(accel_common::SUGGESTED_NAMESPACE.to_string()),
                ..OperatorConfig::default()
            },
            stages,
            fatal_tx: None,
            singleton: OnceLock::new(),
            cluster: OnceCell::from(ClusterInfo {
                kubernetes_version: "v1.31.0".to_string(),
                openshift: false,
            }),
        }
    }

    /// Namespace the operands run in
    pub fn operator_namespace(&self) -> Result<&str, Error> {
        self.config
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| {
                Error::configuration(OPERATOR_NAMESPACE_ENV, "operator namespace is not set")
            })
    }

    /// Latch the first policy name seen; true when `name` holds the latch
    pub fn claim_singleton(&self, name: &str) -> bool {
        self.singleton.get_or_init(|| name.to_string()) == name
    }

    /// Probe the API server once and cache the result
    pub async fn cluster_info(&self) -> Result<&ClusterInfo, Error> {
        self.cluster
            .get_or_try_init(|| async {
                let version = self.kube.server_version().await?;
                if !is_valid_semver(&version) {
                    return Err(Error::configuration(
                        "kubernetesVersion",
                        format!("API server reports invalid version {version:?}"),
                    ));
                }
                let openshift = self.kube.has_api_group(OPENSHIFT_CONFIG_GROUP).await?;
                info!(kubernetes_version = %version, openshift, "detected cluster");
                Ok(ClusterInfo {
                    kubernetes_version: version,
                    openshift,
                })
            })
            .await
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    upgrades: Option<Arc<dyn UpgradeStateManager>>,
    config: OperatorConfig,
    stages: Vec<Stage>,
    fatal_tx: Option<FatalChannel>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            events: None,
            upgrades: None,
            config: OperatorConfig::default(),
            stages: Vec::new(),
            fatal_tx: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the upgrade state manager
    pub fn upgrade_manager(mut self, upgrades: Arc<dyn UpgradeStateManager>) -> Self {
        self.upgrades = Some(upgrades);
        self
    }

    /// Set the operator settings
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the deployment stages
    pub fn stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    /// Set the channel fatal errors are reported on
    pub fn fatal_channel(mut self, tx: FatalChannel) -> Self {
        self.fatal_tx = Some(tx);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        Context {
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            upgrades: self
                .upgrades
                .unwrap_or_else(|| Arc::new(ObservingUpgradeManager::new(kube.clone()))),
            kube,
            config: self.config,
            stages: self.stages,
            fatal_tx: self.fatal_tx,
            singleton: OnceLock::new(),
            cluster: OnceCell::new(),
        }
    }
}

/// Requeue interval for a finished pass
///
/// NotReady retries quickly. A Ready cluster without feature discovery
/// labels is polled since no node event will announce them.
pub fn requeue_after(status: ReconciliationStatus, has_nfd_labels: bool) -> Option<Duration> {
    match status {
        ReconciliationStatus::Ready if has_nfd_labels => None,
        ReconciliationStatus::Ready => Some(NO_NFD_REQUEUE),
        _ => Some(NOT_READY_REQUEUE),
    }
}

/// Reconcile a ClusterPolicy resource
#[instrument(skip(policy, ctx), fields(policy = %policy.name_any()))]
pub async fn reconcile(policy: Arc<ClusterPolicy>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = policy.name_any();
    let namespace = ctx.operator_namespace()?;

    if !ctx.claim_singleton(&name) {
        warn!("another ClusterPolicy is already active, ignoring");
        return match update_status(&policy, &ctx, ReconciliationStatus::Ignored, namespace).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(Action::await_change()),
        };
    }
    RECONCILIATION_TOTAL.add(1, &[]);

    let cluster = ctx.cluster_info().await?;
    policy.spec.validate()?;

    if policy.spec.pod_security_enabled() {
        ensure_pod_security(ctx.kube.as_ref(), namespace).await?;
    }

    let pass = label_nodes(ctx.kube.as_ref(), &policy.spec).await?;
    metrics::record_node_facts(pass.has_nfd_labels, pass.gpu_nodes.len());
    if !pass.has_nfd_labels {
        warn!("no node carries feature discovery labels, is node feature discovery running?");
    }

    let wanted = policy.spec.auto_upgrade_enabled() && !policy.spec.sandbox_enabled();
    sync_upgrade_annotations(ctx.kube.as_ref(), &pass.gpu_nodes, wanted).await?;

    let runtime = pass.runtime(policy.spec.operator.default_runtime);
    let toolkit = toolkit::evaluate(ctx.kube.as_ref(), &policy.spec, cluster.openshift, &pass).await?;
    if cluster.openshift {
        ensure_monitoring(ctx.kube.as_ref(), namespace).await?;
    }

    let input = StageInput {
        kube: ctx.kube.as_ref(),
        policy: policy.as_ref(),
        namespace,
        runtime,
        toolkit: &toolkit,
    };
    let summary = match walk(&ctx.stages, &input).await {
        Ok(summary) => summary,
        Err(e) => {
            metrics::set_reconcile_outcome(ReconcileOutcome::NotReady);
            metrics::record_reconcile_failed();
            ctx.events
                .publish(&policy.object_ref(&()), PolicyEvent::StageFailed(e.to_string()))
                .await;
            update_status(&policy, &ctx, ReconciliationStatus::NotReady, namespace).await?;
            return Err(e);
        }
    };

    let status = summary.status();
    match status {
        ReconciliationStatus::Ready if pass.has_nfd_labels => metrics::record_reconcile_success(),
        ReconciliationStatus::Ready => metrics::set_reconcile_outcome(ReconcileOutcome::Ready),
        _ => {
            let pending: Vec<String> = summary.not_ready().map(|k| k.to_string()).collect();
            info!(?pending, "ClusterPolicy not ready");
            metrics::set_reconcile_outcome(ReconcileOutcome::NotReady);
            metrics::record_reconcile_failed();
        }
    }

    if let Err(e) = update_status(&policy, &ctx, status, namespace).await {
        if e.is_not_found() {
            metrics::set_reconcile_outcome(ReconcileOutcome::Unavailable);
            info!("ClusterPolicy deleted during reconciliation");
            return Ok(Action::await_change());
        }
        return Err(e);
    }

    Ok(match requeue_after(status, pass.has_nfd_labels) {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

/// Persist `state` unless the policy already records it, and announce the change
async fn update_status(
    policy: &ClusterPolicy,
    ctx: &Context,
    state: ReconciliationStatus,
    namespace: &str,
) -> Result<(), Error> {
    if policy.status_matches(state, namespace) {
        debug!(%state, "status unchanged");
        return Ok(());
    }

    let status = ClusterPolicyStatus::new(state, namespace);
    ctx.kube
        .patch_policy_status(&policy.name_any(), &status)
        .await?;
    info!(%state, previous = ?policy.state(), "ClusterPolicy status updated");

    ctx.events
        .publish(&policy.object_ref(&()), PolicyEvent::StateChanged(state))
        .await;
    Ok(())
}

/// Error policy for the controller
///
/// Configuration errors cannot heal by retrying and are reported on the
/// fatal channel; everything else is retried after a short delay.
pub fn error_policy(policy: Arc<ClusterPolicy>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        policy = %policy.name_any(),
        "reconciliation failed"
    );

    if error.is_fatal() {
        if let Some(tx) = &ctx.fatal_tx {
            if let Err(e) = tx.try_send(error.to_string()) {
                warn!(error = %e, "could not report fatal error");
            }
        }
    }

    Action::requeue(NOT_READY_REQUEUE)
}
