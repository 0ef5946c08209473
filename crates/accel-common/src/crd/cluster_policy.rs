//! ClusterPolicy Custom Resource Definition
//!
//! The ClusterPolicy CRD is the single cluster-wide declaration of which
//! accelerator operands run on the fleet and how they are configured. Only
//! one instance is ever effective; any later instance is marked ignored.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ComponentKind, ImageSpec, IntOrPercent, ReconciliationStatus, Runtime};
use crate::Error;

/// Specification for a ClusterPolicy
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "xdxct.com",
    version = "v1",
    kind = "ClusterPolicy",
    plural = "clusterpolicies",
    status = "ClusterPolicyStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPolicySpec {
    /// Operator-wide settings
    #[serde(default)]
    pub operator: OperatorSpec,

    /// Kernel driver operand
    #[serde(default)]
    pub driver: DriverSpec,

    /// Container runtime toolkit operand
    #[serde(default)]
    pub toolkit: ComponentSpec,

    /// Device plugin operand
    #[serde(default)]
    pub device_plugin: ComponentSpec,

    /// Feature discovery operand
    #[serde(default)]
    pub gfd: ComponentSpec,

    /// Node status exporter operand (disabled unless requested)
    #[serde(default)]
    pub node_status_exporter: ComponentSpec,

    /// Operator validator operand
    #[serde(default)]
    pub validator: ComponentSpec,

    /// Pod security policies for operand pods
    #[serde(default)]
    pub psp: ToggleSpec,

    /// Pod security admission labels on the operator namespace
    #[serde(default)]
    pub psa: ToggleSpec,

    /// Sandboxed (VM) workload support
    #[serde(default)]
    pub sandbox_workloads: SandboxWorkloadsSpec,
}

/// Operator-wide settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSpec {
    /// Runtime assumed when no accelerator node reports a recognized one
    #[serde(default)]
    pub default_runtime: Runtime,

    /// RuntimeClass name used by operand pods
    #[serde(default = "default_runtime_class")]
    pub runtime_class: String,

    /// Build drivers with the OpenShift driver toolkit when available
    #[serde(default)]
    pub use_openshift_driver_toolkit: bool,

    /// Init container image shared by the operands
    #[serde(default)]
    pub init_container: ImageSpec,
}

fn default_runtime_class() -> String {
    "xdxct".to_string()
}

impl Default for OperatorSpec {
    fn default() -> Self {
        Self {
            default_runtime: Runtime::default(),
            runtime_class: default_runtime_class(),
            use_openshift_driver_toolkit: false,
            init_container: ImageSpec::default(),
        }
    }
}

/// Kernel driver operand
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverSpec {
    /// Deploy the driver (default true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Use precompiled kernel modules instead of building on the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_precompiled: Option<bool>,

    /// Rolling driver upgrade settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_policy: Option<UpgradePolicySpec>,

    /// Driver image
    #[serde(flatten)]
    pub image: ImageSpec,

    /// Driver manager sidecar image
    #[serde(default)]
    pub manager: ImageSpec,
}

impl DriverSpec {
    /// True unless explicitly disabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// True when precompiled modules were requested
    pub fn use_precompiled(&self) -> bool {
        self.use_precompiled.unwrap_or(false)
    }
}

/// Rolling driver upgrade settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePolicySpec {
    /// Let the operator roll driver upgrades across nodes
    #[serde(default)]
    pub auto_upgrade: bool,

    /// Upper bound on nodes upgrading at the same time (0 means unlimited)
    #[serde(default)]
    pub max_parallel_upgrades: i32,

    /// Upper bound on unavailable nodes, as a count or a percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrPercent>,
}

/// A switchable operand with an image
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Deploy this operand; the default depends on the operand
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Operand image
    #[serde(flatten)]
    pub image: ImageSpec,
}

impl ComponentSpec {
    /// Explicit setting, or `default` when unset
    pub fn is_enabled_or(&self, default: bool) -> bool {
        self.enabled.unwrap_or(default)
    }
}

/// A feature flag that defaults to off
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ToggleSpec {
    /// Enable the feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl ToggleSpec {
    /// True only when explicitly enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }
}

/// Sandboxed (VM) workload support
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxWorkloadsSpec {
    /// Allow nodes to run vm-passthrough or vm-vgpu workloads
    #[serde(default)]
    pub enabled: bool,

    /// Workload mode for nodes without an explicit workload label
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_workload: String,
}

/// Status for a ClusterPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPolicyStatus {
    /// Aggregate readiness
    pub state: ReconciliationStatus,

    /// Namespace the operands are deployed into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ClusterPolicyStatus {
    /// Create a status with the given state and namespace
    pub fn new(state: ReconciliationStatus, namespace: impl Into<String>) -> Self {
        Self {
            state,
            namespace: Some(namespace.into()),
        }
    }
}

impl ClusterPolicySpec {
    /// Whether the operand for `kind` should be deployed
    pub fn is_enabled(&self, kind: ComponentKind) -> bool {
        match kind {
            ComponentKind::Driver | ComponentKind::DriverManager => self.driver.is_enabled(),
            ComponentKind::Toolkit => self.toolkit.is_enabled_or(true),
            ComponentKind::DevicePlugin => self.device_plugin.is_enabled_or(true),
            ComponentKind::FeatureDiscovery => self.gfd.is_enabled_or(true),
            ComponentKind::NodeStatusExporter => self.node_status_exporter.is_enabled_or(false),
            ComponentKind::Validator => self.validator.is_enabled_or(true),
            ComponentKind::InitContainer => true,
        }
    }

    /// Image coordinates configured for `kind`
    pub fn image_spec(&self, kind: ComponentKind) -> &ImageSpec {
        match kind {
            ComponentKind::Driver => &self.driver.image,
            ComponentKind::Toolkit => &self.toolkit.image,
            ComponentKind::DevicePlugin => &self.device_plugin.image,
            ComponentKind::NodeStatusExporter => &self.node_status_exporter.image,
            ComponentKind::FeatureDiscovery => &self.gfd.image,
            ComponentKind::Validator => &self.validator.image,
            ComponentKind::InitContainer => &self.operator.init_container,
            ComponentKind::DriverManager => &self.driver.manager,
        }
    }

    /// Resolve the image for `kind` using the process environment as fallback
    pub fn image_path(&self, kind: ComponentKind) -> Result<String, Error> {
        self.image_path_with(kind, |key| std::env::var(key).ok())
    }

    /// Resolve the image for `kind`: spec fields, then `lookup(env_key)`, then error
    pub fn image_path_with<F>(&self, kind: ComponentKind, lookup: F) -> Result<String, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(reference) = self.image_spec(kind).reference() {
            return Ok(reference);
        }
        let key = kind.env_key();
        lookup(key).filter(|v| !v.is_empty()).ok_or_else(|| {
            Error::validation(format!(
                "empty image path for {} in both ClusterPolicy and env {}",
                kind.as_str(),
                key
            ))
        })
    }

    /// Whether sandboxed workloads are allowed
    pub fn sandbox_enabled(&self) -> bool {
        self.sandbox_workloads.enabled
    }

    /// Whether the operator should roll driver upgrades itself
    pub fn auto_upgrade_enabled(&self) -> bool {
        self.driver
            .upgrade_policy
            .as_ref()
            .is_some_and(|p| p.auto_upgrade)
    }

    /// Whether pod security labels belong on the operator namespace
    pub fn pod_security_enabled(&self) -> bool {
        self.psp.is_enabled() || self.psa.is_enabled()
    }

    /// Validate the policy specification
    pub fn validate(&self) -> Result<(), Error> {
        if self.operator.runtime_class.is_empty() {
            return Err(Error::validation_for_field(
                crate::error::UNKNOWN_CONTEXT,
                "spec.operator.runtimeClass",
                "runtimeClass cannot be empty",
            ));
        }
        if let Some(max) = self
            .driver
            .upgrade_policy
            .as_ref()
            .and_then(|p| p.max_unavailable.as_ref())
        {
            max.scaled(100, true).map_err(|e| {
                Error::validation_for_field(
                    crate::error::UNKNOWN_CONTEXT,
                    "spec.driver.upgradePolicy.maxUnavailable",
                    e.to_string(),
                )
            })?;
        }
        Ok(())
    }
}

impl ClusterPolicy {
    /// Current persisted state, if any
    pub fn state(&self) -> Option<ReconciliationStatus> {
        self.status.as_ref().map(|s| s.state)
    }

    /// True when the persisted status already equals `state` in `namespace`
    pub fn status_matches(&self, state: ReconciliationStatus, namespace: &str) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.state == state && s.namespace.as_deref() == Some(namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(yaml: &str) -> ClusterPolicySpec {
        serde_yaml::from_str(yaml).expect("ClusterPolicy spec YAML should parse")
    }

    // =========================================================================
    // Defaulting Stories
    // =========================================================================

    /// Story: An empty ClusterPolicy deploys the standard container stack
    ///
    /// Administrators can create `spec: {}` and get driver, toolkit, device
    /// plugin, feature discovery and validator; the exporter stays off.
    #[test]
    fn story_empty_spec_enables_standard_operands() {
        let spec = parse("{}");

        assert!(spec.is_enabled(ComponentKind::Driver));
        assert!(spec.is_enabled(ComponentKind::Toolkit));
        assert!(spec.is_enabled(ComponentKind::DevicePlugin));
        assert!(spec.is_enabled(ComponentKind::FeatureDiscovery));
        assert!(spec.is_enabled(ComponentKind::Validator));
        assert!(!spec.is_enabled(ComponentKind::NodeStatusExporter));
        assert!(!spec.sandbox_enabled());
        assert!(!spec.pod_security_enabled());
        assert!(!spec.auto_upgrade_enabled());
        assert_eq!(spec.operator.default_runtime, Runtime::Containerd);
        assert_eq!(spec.operator.runtime_class, "xdxct");
    }

    /// Story: Switching operands on and off from YAML
    #[test]
    fn story_yaml_toggles_operands() {
        let spec = parse(
            r#"
operator:
  defaultRuntime: crio
  useOpenshiftDriverToolkit: true
driver:
  enabled: false
  usePrecompiled: true
  upgradePolicy:
    autoUpgrade: true
    maxParallelUpgrades: 2
    maxUnavailable: "25%"
nodeStatusExporter:
  enabled: true
psa:
  enabled: true
sandboxWorkloads:
  enabled: true
  defaultWorkload: vm-passthrough
"#,
        );

        assert!(!spec.is_enabled(ComponentKind::Driver));
        assert!(!spec.is_enabled(ComponentKind::DriverManager));
        assert!(spec.driver.use_precompiled());
        assert!(spec.is_enabled(ComponentKind::NodeStatusExporter));
        assert!(spec.pod_security_enabled());
        assert!(spec.auto_upgrade_enabled());
        assert!(spec.sandbox_enabled());
        assert_eq!(spec.sandbox_workloads.default_workload, "vm-passthrough");
        assert_eq!(spec.operator.default_runtime, Runtime::Crio);
        assert!(spec.operator.use_openshift_driver_toolkit);
        let policy = spec.driver.upgrade_policy.as_ref().unwrap();
        assert_eq!(policy.max_parallel_upgrades, 2);
        assert_eq!(
            policy.max_unavailable,
            Some(IntOrPercent::Percent("25%".to_string()))
        );
    }

    // =========================================================================
    // Image Resolution Stories
    // =========================================================================

    /// Story: Images set on the ClusterPolicy win over the environment
    #[test]
    fn story_spec_image_wins_over_env() {
        let spec = parse(
            r#"
devicePlugin:
  repository: registry.example.com/xdxct
  image: device-plugin
  version: v0.14.0
"#,
        );
        let env: HashMap<&str, &str> = HashMap::from([("DEVICE_PLUGIN_IMAGE", "env/dp:1")]);

        let path = spec
            .image_path_with(ComponentKind::DevicePlugin, |k| {
                env.get(k).map(|v| v.to_string())
            })
            .unwrap();
        assert_eq!(path, "registry.example.com/xdxct/device-plugin:v0.14.0");
    }

    /// Story: OLM bundles inject images through the operator environment
    #[test]
    fn story_env_image_used_when_spec_is_empty() {
        let spec = ClusterPolicySpec::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("VALIDATOR_IMAGE", "env/validator:2"),
            ("DRIVER_MANAGER_IMAGE", "env/manager:3"),
        ]);
        let lookup = |k: &str| env.get(k).map(|v| v.to_string());

        assert_eq!(
            spec.image_path_with(ComponentKind::NodeStatusExporter, lookup)
                .unwrap(),
            "env/validator:2"
        );
        assert_eq!(
            spec.image_path_with(ComponentKind::DriverManager, lookup)
                .unwrap(),
            "env/manager:3"
        );
    }

    /// Story: Without any image source the operand cannot be deployed
    #[test]
    fn story_missing_image_is_an_error() {
        let spec = ClusterPolicySpec::default();
        let err = spec
            .image_path_with(ComponentKind::Driver, |_| None)
            .unwrap_err();
        assert!(err.to_string().contains("DRIVER_IMAGE"));

        let err = spec
            .image_path_with(ComponentKind::Toolkit, |_| Some(String::new()))
            .unwrap_err();
        assert!(err.to_string().contains("CONTAINER_TOOLKIT_IMAGE"));
    }

    #[test]
    fn init_container_image_comes_from_operator_section() {
        let spec = parse(
            r#"
operator:
  initContainer:
    image: base@sha256:00
"#,
        );
        assert_eq!(
            spec.image_path_with(ComponentKind::InitContainer, |_| None)
                .unwrap(),
            "base@sha256:00"
        );
    }

    // =========================================================================
    // Validation and Status
    // =========================================================================

    #[test]
    fn invalid_max_unavailable_fails_validation() {
        let spec = parse(
            r#"
driver:
  upgradePolicy:
    autoUpgrade: true
    maxUnavailable: "lots"
"#,
        );
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("lots"));
        assert!(ClusterPolicySpec::default().validate().is_ok());
    }

    #[test]
    fn status_matches_compares_state_and_namespace() {
        let mut policy = ClusterPolicy::new("cluster-policy", ClusterPolicySpec::default());
        assert!(policy.state().is_none());
        assert!(!policy.status_matches(ReconciliationStatus::Ready, "ns"));

        policy.status = Some(ClusterPolicyStatus::new(ReconciliationStatus::Ready, "ns"));
        assert!(policy.status_matches(ReconciliationStatus::Ready, "ns"));
        assert!(!policy.status_matches(ReconciliationStatus::NotReady, "ns"));
        assert!(!policy.status_matches(ReconciliationStatus::Ready, "other"));
        assert_eq!(policy.state(), Some(ReconciliationStatus::Ready));
    }

    #[test]
    fn status_serializes_in_camel_case() {
        let status = ClusterPolicyStatus::new(ReconciliationStatus::NotReady, "xdxct-gpu-operator");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "notReady");
        assert_eq!(json["namespace"], "xdxct-gpu-operator");
    }
}
