//! Shared types used by the ClusterPolicy CRD

use std::fmt;

use schemars::gen::SchemaGenerator;
use schemars::schema::{Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Container runtime used on the accelerator nodes
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// Docker engine
    Docker,
    /// CRI-O
    Crio,
    /// containerd
    #[default]
    Containerd,
}

impl Runtime {
    /// Label value used in manifests and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Crio => "crio",
            Self::Containerd => "containerd",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate readiness of a ClusterPolicy
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReconciliationStatus {
    /// Every enabled stage reported ready
    Ready,
    /// At least one enabled stage is still converging
    #[default]
    NotReady,
    /// Another ClusterPolicy is already the effective one
    Ignored,
    /// The stage was switched off in the spec
    Disabled,
}

impl ReconciliationStatus {
    /// Value as it appears in the status subresource
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::NotReady => "notReady",
            Self::Ignored => "ignored",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image coordinates of a single operand
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Registry and path prefix (e.g., "registry.example.com/xdxct")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,

    /// Image name, or a fully resolved reference when repository and version are empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Tag, or a `sha256:` digest
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Pull policy: Always, Never or IfNotPresent
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_pull_policy: String,

    /// Names of secrets used to pull the image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
}

impl ImageSpec {
    /// Image reference built from the spec fields alone
    ///
    /// Returns `None` when nothing usable is set, so the caller can fall
    /// back to the environment.
    pub fn reference(&self) -> Option<String> {
        if self.repository.is_empty() && self.version.is_empty() {
            return (!self.image.is_empty()).then(|| self.image.clone());
        }
        let separator = if self.version.starts_with("sha256:") {
            '@'
        } else {
            ':'
        };
        Some(format!(
            "{}/{}{}{}",
            self.repository, self.image, separator, self.version
        ))
    }

    /// Normalized pull policy, defaulting to IfNotPresent
    pub fn pull_policy(&self) -> &'static str {
        match self.image_pull_policy.as_str() {
            "Always" => "Always",
            "Never" => "Never",
            _ => "IfNotPresent",
        }
    }
}

/// Operand whose image can be resolved from the ClusterPolicy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// Kernel driver container
    Driver,
    /// Container runtime toolkit
    Toolkit,
    /// Device plugin
    DevicePlugin,
    /// Node status exporter
    NodeStatusExporter,
    /// Feature discovery
    FeatureDiscovery,
    /// Operator validator
    Validator,
    /// Init container shared by the operands
    InitContainer,
    /// Driver manager sidecar
    DriverManager,
}

impl ComponentKind {
    /// All component kinds in declaration order
    pub const ALL: [ComponentKind; 8] = [
        Self::Driver,
        Self::Toolkit,
        Self::DevicePlugin,
        Self::NodeStatusExporter,
        Self::FeatureDiscovery,
        Self::Validator,
        Self::InitContainer,
        Self::DriverManager,
    ];

    /// Environment variable consulted when the ClusterPolicy leaves the image unset
    pub fn env_key(&self) -> &'static str {
        match self {
            Self::Driver => "DRIVER_IMAGE",
            Self::Toolkit => "CONTAINER_TOOLKIT_IMAGE",
            Self::DevicePlugin => "DEVICE_PLUGIN_IMAGE",
            Self::NodeStatusExporter => "VALIDATOR_IMAGE",
            Self::FeatureDiscovery => "GFD_IMAGE",
            Self::Validator => "VALIDATOR_IMAGE",
            Self::InitContainer => "CUDA_BASE_IMAGE",
            Self::DriverManager => "DRIVER_MANAGER_IMAGE",
        }
    }

    /// Short name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Driver => "driver",
            Self::Toolkit => "toolkit",
            Self::DevicePlugin => "device-plugin",
            Self::NodeStatusExporter => "node-status-exporter",
            Self::FeatureDiscovery => "gpu-feature-discovery",
            Self::Validator => "validator",
            Self::InitContainer => "init-container",
            Self::DriverManager => "driver-manager",
        }
    }
}

/// Integer or percentage string, as used by `maxUnavailable`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum IntOrPercent {
    /// Absolute count
    Int(i32),
    /// Percentage such as "25%"
    Percent(String),
}

impl IntOrPercent {
    /// Resolve against `total`, rounding percentages up or down
    pub fn scaled(&self, total: i32, round_up: bool) -> Result<i32, Error> {
        match self {
            Self::Int(v) => Ok(*v),
            Self::Percent(s) => {
                let pct: i64 = s
                    .strip_suffix('%')
                    .and_then(|n| n.trim().parse().ok())
                    .ok_or_else(|| {
                        Error::validation(format!("invalid value for IntOrString: {s:?}"))
                    })?;
                if !(0..=100).contains(&pct) {
                    return Err(Error::validation(format!(
                        "percentage must be between 0% and 100%: {s:?}"
                    )));
                }
                let product = pct.checked_mul(i64::from(total)).ok_or_else(|| {
                    Error::validation(format!("scaled value out of range: {s}"))
                })?;
                let scaled = if round_up {
                    product
                        .checked_add(99)
                        .ok_or_else(|| {
                            Error::validation(format!("scaled value out of range: {s}"))
                        })?
                        .div_euclid(100)
                } else {
                    product.div_euclid(100)
                };
                i32::try_from(scaled)
                    .map_err(|_| Error::validation(format!("scaled value out of range: {s}")))
            }
        }
    }
}

impl JsonSchema for IntOrPercent {
    fn schema_name() -> String {
        "IntOrPercent".to_string()
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        let mut schema = SchemaObject::default();
        schema.extensions.insert(
            "x-kubernetes-int-or-string".to_string(),
            serde_json::Value::Bool(true),
        );
        Schema::Object(schema)
    }
}
