//! Ordered deployment stages for the ClusterPolicy controller.
//!
//! A stage is a named group of idempotent operations applied together.
//! The stage list is fixed at startup and walked front to back on every
//! reconciliation; the walk never resumes from where a previous one stopped.

mod manifest;

pub use manifest::{daemonset_ready, load_stage, load_stages, ManifestOperation};

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, error, info};

use accel_common::crd::{ClusterPolicy, ComponentKind, ReconciliationStatus, Runtime};
use accel_common::Error;
use accel_node::DriverToolkitState;

use crate::controller::KubeClient;

/// The fixed stage list, in deployment order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Namespaced RBAC, runtime class and other shared prerequisites
    PreRequisites,
    /// Accelerator kernel driver
    Driver,
    /// Container runtime toolkit
    ContainerToolkit,
    /// Operator validation workloads
    OperatorValidation,
    /// Device plugin
    DevicePlugin,
    /// Feature discovery
    FeatureDiscovery,
    /// Node status exporter
    NodeStatusExporter,
}

impl StageKind {
    /// Every stage in deployment order
    pub const ALL: [StageKind; 7] = [
        Self::PreRequisites,
        Self::Driver,
        Self::ContainerToolkit,
        Self::OperatorValidation,
        Self::DevicePlugin,
        Self::FeatureDiscovery,
        Self::NodeStatusExporter,
    ];

    /// Stage name, also the asset directory holding its manifests
    pub fn name(&self) -> &'static str {
        match self {
            Self::PreRequisites => "pre-requisites",
            Self::Driver => "state-driver",
            Self::ContainerToolkit => "state-container-toolkit",
            Self::OperatorValidation => "state-operator-validation",
            Self::DevicePlugin => "state-device-plugin",
            Self::FeatureDiscovery => "gpu-feature-discovery",
            Self::NodeStatusExporter => "state-node-status-exporter",
        }
    }

    /// Component whose image the stage's workloads run
    pub fn component(&self) -> Option<ComponentKind> {
        match self {
            Self::PreRequisites => None,
            Self::Driver => Some(ComponentKind::Driver),
            Self::ContainerToolkit => Some(ComponentKind::Toolkit),
            Self::OperatorValidation => Some(ComponentKind::Validator),
            Self::DevicePlugin => Some(ComponentKind::DevicePlugin),
            Self::FeatureDiscovery => Some(ComponentKind::FeatureDiscovery),
            Self::NodeStatusExporter => Some(ComponentKind::NodeStatusExporter),
        }
    }

    /// Component used for init containers that leave their image empty
    pub fn init_component(&self) -> ComponentKind {
        match self {
            Self::Driver => ComponentKind::DriverManager,
            _ => ComponentKind::InitContainer,
        }
    }

    /// Whether the policy asks for this stage
    pub fn is_enabled(&self, policy: &ClusterPolicy) -> bool {
        match self {
            Self::PreRequisites | Self::OperatorValidation => true,
            Self::Driver => policy.spec.is_enabled(ComponentKind::Driver),
            Self::ContainerToolkit => policy.spec.is_enabled(ComponentKind::Toolkit),
            Self::DevicePlugin => policy.spec.is_enabled(ComponentKind::DevicePlugin),
            Self::FeatureDiscovery => policy.spec.is_enabled(ComponentKind::FeatureDiscovery),
            Self::NodeStatusExporter => policy.spec.is_enabled(ComponentKind::NodeStatusExporter),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything an operation may read while running
pub struct StageInput<'a> {
    /// Cluster access
    pub kube: &'a dyn KubeClient,
    /// The effective ClusterPolicy
    pub policy: &'a ClusterPolicy,
    /// Namespace the operands are deployed into
    pub namespace: &'a str,
    /// Container runtime detected on accelerator nodes
    pub runtime: Runtime,
    /// Driver toolkit decision; when enabled the driver DaemonSet is split per OS build
    pub toolkit: &'a DriverToolkitState,
}

/// One idempotent unit of work inside a stage
#[async_trait]
pub trait StageOperation: Send + Sync {
    /// Short description for logs, e.g. `DaemonSet/device-plugin`
    fn describe(&self) -> String;

    /// Apply the operation and report whether its result is ready
    async fn run(&self, input: &StageInput<'_>) -> Result<ReconciliationStatus, Error>;
}

/// A named stage and its operations
pub struct Stage {
    /// Which stage this is
    pub kind: StageKind,
    /// Operations, run in order
    pub operations: Vec<Box<dyn StageOperation>>,
}

impl Stage {
    /// Create a stage
    pub fn new(kind: StageKind, operations: Vec<Box<dyn StageOperation>>) -> Self {
        Self { kind, operations }
    }
}

/// Cursor over the stage list for one reconciliation
pub struct StageStepper<'s> {
    stages: &'s [Stage],
    idx: usize,
}

impl<'s> StageStepper<'s> {
    /// Start at the first stage
    pub fn new(stages: &'s [Stage]) -> Self {
        Self { stages, idx: 0 }
    }

    /// True once every stage has been stepped through
    pub fn last(&self) -> bool {
        self.idx >= self.stages.len()
    }

    /// Stage the next `step` will run
    pub fn current(&self) -> Option<StageKind> {
        self.stages.get(self.idx).map(|s| s.kind)
    }

    /// Run every operation of the pending stage and advance the cursor
    ///
    /// The stage is NotReady when any operation is; later operations still
    /// run. An operation error is returned at once and leaves the cursor in
    /// place. Stages the policy disables report Disabled without running.
    pub async fn step(&mut self, input: &StageInput<'_>) -> Result<ReconciliationStatus, Error> {
        let Some(stage) = self.stages.get(self.idx) else {
            return Err(Error::internal("step called past the last stage"));
        };

        if !stage.kind.is_enabled(input.policy) {
            debug!(stage = %stage.kind, "stage disabled by ClusterPolicy");
            self.idx += 1;
            return Ok(ReconciliationStatus::Disabled);
        }

        let mut result = ReconciliationStatus::Ready;
        for op in &stage.operations {
            let status = op.run(input).await?;
            if status != ReconciliationStatus::Ready {
                debug!(stage = %stage.kind, operation = %op.describe(), %status, "operation not ready");
                result = status;
            }
        }

        self.idx += 1;
        Ok(result)
    }
}

/// Per-stage results of one walk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkSummary {
    /// Stages in the order they were visited
    pub stages: Vec<(StageKind, ReconciliationStatus)>,
}

impl WalkSummary {
    /// Ready only when every enabled stage is Ready
    pub fn status(&self) -> ReconciliationStatus {
        if self.not_ready().next().is_some() {
            ReconciliationStatus::NotReady
        } else {
            ReconciliationStatus::Ready
        }
    }

    /// Enabled stages that are not Ready
    pub fn not_ready(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.stages
            .iter()
            .filter(|(_, s)| !matches!(s, ReconciliationStatus::Ready | ReconciliationStatus::Disabled))
            .map(|(k, _)| *k)
    }
}

/// Walk every stage once, stopping at the first operation error
pub async fn walk(stages: &[Stage], input: &StageInput<'_>) -> Result<WalkSummary, Error> {
    let mut stepper = StageStepper::new(stages);
    let mut summary = WalkSummary::default();

    while let Some(kind) = stepper.current() {
        let status = stepper
            .step(input)
            .await
            .inspect_err(|e| error!(stage = %kind, error = %e, "stage failed"))?;
        info!(stage = %kind, %status, "ClusterPolicy step completed");
        summary.stages.push((kind, status));
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use accel_common::crd::{ClusterPolicySpec, ComponentSpec};

    use crate::controller::MockKubeClient;

    struct Fixed {
        status: ReconciliationStatus,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StageOperation for Fixed {
        fn describe(&self) -> String {
            format!("fixed/{}", self.status)
        }

        async fn run(&self, _input: &StageInput<'_>) -> Result<ReconciliationStatus, Error> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(self.status)
        }
    }

    struct Failing;

    #[async_trait]
    impl StageOperation for Failing {
        fn describe(&self) -> String {
            "failing".to_string()
        }

        async fn run(&self, _input: &StageInput<'_>) -> Result<ReconciliationStatus, Error> {
            Err(Error::stage("test", "apply rejected"))
        }
    }

    fn fixed(status: ReconciliationStatus, runs: &Arc<AtomicUsize>) -> Box<dyn StageOperation> {
        Box::new(Fixed {
            status,
            runs: runs.clone(),
        })
    }

    fn policy() -> ClusterPolicy {
        ClusterPolicy::new("cluster-policy", ClusterPolicySpec::default())
    }

    async fn run_walk(stages: &[Stage], policy: &ClusterPolicy) -> Result<WalkSummary, Error> {
        let kube = MockKubeClient::new();
        let toolkit = DriverToolkitState::default();
        let input = StageInput {
            kube: &kube,
            policy,
            namespace: "xdxct-gpu-operator",
            runtime: Runtime::Containerd,
            toolkit: &toolkit,
        };
        walk(stages, &input).await
    }

    /// Story: one lagging stage makes the whole policy NotReady
    #[tokio::test]
    async fn story_not_ready_stage_is_reported_by_name() {
        let runs = Arc::new(AtomicUsize::new(0));
        let stages = vec![
            Stage::new(StageKind::PreRequisites, vec![fixed(ReconciliationStatus::Ready, &runs)]),
            Stage::new(
                StageKind::OperatorValidation,
                vec![fixed(ReconciliationStatus::NotReady, &runs)],
            ),
            Stage::new(StageKind::DevicePlugin, vec![fixed(ReconciliationStatus::Ready, &runs)]),
        ];

        let summary = run_walk(&stages, &policy()).await.unwrap();

        assert_eq!(summary.status(), ReconciliationStatus::NotReady);
        assert_eq!(
            summary.not_ready().collect::<Vec<_>>(),
            vec![StageKind::OperatorValidation]
        );
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn all_ready_stages_are_ready() {
        let runs = Arc::new(AtomicUsize::new(0));
        let stages = vec![
            Stage::new(StageKind::PreRequisites, vec![fixed(ReconciliationStatus::Ready, &runs)]),
            Stage::new(StageKind::DevicePlugin, vec![]),
        ];
        let summary = run_walk(&stages, &policy()).await.unwrap();
        assert_eq!(summary.status(), ReconciliationStatus::Ready);
    }

    #[tokio::test]
    async fn not_ready_operation_does_not_stop_the_stage() {
        let runs = Arc::new(AtomicUsize::new(0));
        let stages = vec![Stage::new(
            StageKind::PreRequisites,
            vec![
                fixed(ReconciliationStatus::NotReady, &runs),
                fixed(ReconciliationStatus::Ready, &runs),
            ],
        )];
        let summary = run_walk(&stages, &policy()).await.unwrap();
        assert_eq!(summary.status(), ReconciliationStatus::NotReady);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    /// Story: a disabled component is skipped and does not hold back readiness
    #[tokio::test]
    async fn story_disabled_stage_is_skipped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let stages = vec![
            Stage::new(
                StageKind::NodeStatusExporter,
                vec![fixed(ReconciliationStatus::NotReady, &runs)],
            ),
            Stage::new(StageKind::PreRequisites, vec![fixed(ReconciliationStatus::Ready, &runs)]),
        ];

        let summary = run_walk(&stages, &policy()).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            summary.stages[0],
            (StageKind::NodeStatusExporter, ReconciliationStatus::Disabled)
        );
        assert_eq!(summary.status(), ReconciliationStatus::Ready);

        let mut enabled = policy();
        enabled.spec.node_status_exporter = ComponentSpec {
            enabled: Some(true),
            ..Default::default()
        };
        let summary = run_walk(&stages, &enabled).await.unwrap();
        assert_eq!(summary.status(), ReconciliationStatus::NotReady);
    }

    #[tokio::test]
    async fn operation_error_aborts_the_walk() {
        let runs = Arc::new(AtomicUsize::new(0));
        let stages = vec![
            Stage::new(StageKind::PreRequisites, vec![Box::new(Failing)]),
            Stage::new(StageKind::DevicePlugin, vec![fixed(ReconciliationStatus::Ready, &runs)]),
        ];
        let err = run_walk(&stages, &policy()).await.unwrap_err();
        assert!(err.to_string().contains("apply rejected"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stepper_reports_last_after_final_stage() {
        let stages = vec![Stage::new(StageKind::PreRequisites, vec![])];
        let kube = MockKubeClient::new();
        let policy = policy();
        let toolkit = DriverToolkitState::default();
        let input = StageInput {
            kube: &kube,
            policy: &policy,
            namespace: "ns",
            runtime: Runtime::Containerd,
            toolkit: &toolkit,
        };

        let mut stepper = StageStepper::new(&stages);
        assert!(!stepper.last());
        assert_eq!(stepper.step(&input).await.unwrap(), ReconciliationStatus::Ready);
        assert!(stepper.last());
        assert!(stepper.step(&input).await.is_err());
    }

    #[test]
    fn stage_predicates_follow_the_policy() {
        let policy = policy();
        let enabled: Vec<_> = StageKind::ALL
            .iter()
            .filter(|k| k.is_enabled(&policy))
            .map(|k| k.name())
            .collect();
        assert_eq!(
            enabled,
            vec![
                "pre-requisites",
                "state-driver",
                "state-container-toolkit",
                "state-operator-validation",
                "state-device-plugin",
                "gpu-feature-discovery",
            ]
        );
    }
}
