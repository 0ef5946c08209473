//! Error types for the accelerator operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Configuration errors are the only ones that crash the pod; everything
//! else is retried by requeueing.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for ClusterPolicy specs
    #[error("validation error for {policy}: {message}")]
    Validation {
        /// Name of the ClusterPolicy with invalid configuration
        policy: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.driver.upgradePolicy.maxUnavailable")
        field: Option<String>,
    },

    /// Startup configuration error
    ///
    /// The operator cannot run half-initialized, so these terminate the process.
    #[error("configuration error [{setting}]: {message}")]
    Configuration {
        /// Name of the setting that is missing or malformed
        setting: String,
        /// Description of what's wrong
        message: String,
    },

    /// A stage operation failed while walking the deployment stages
    #[error("stage {stage} failed: {message}")]
    Stage {
        /// Name of the stage being processed
        stage: String,
        /// Description of what failed
        message: String,
    },

    /// A stage manifest could not be loaded or stamped
    #[error("manifest error in {source_file}: {message}")]
    Manifest {
        /// File the manifest was read from
        source_file: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error: {message}")]
    Internal {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            policy: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with policy context and field path
    pub fn validation_for_field(
        policy: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            policy: policy.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error for the named setting
    pub fn configuration(setting: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            setting: setting.into(),
            message: msg.into(),
        }
    }

    /// Create a stage error
    pub fn stage(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create a manifest error for the given source file
    pub fn manifest(source_file: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            source_file: source_file.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
        }
    }

    /// True when the API server answered 404 for the requested object
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }

    /// True for errors that must terminate the process instead of requeueing
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    /// Story: a missing ClusterPolicy ends the invocation without a requeue
    #[test]
    fn story_not_found_is_detected_on_kube_errors_only() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
        assert!(!Error::internal("404").is_not_found());
    }

    #[test]
    fn test_configuration_errors_are_fatal() {
        let err = Error::configuration("OPERATOR_NAMESPACE", "not set");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("[OPERATOR_NAMESPACE]"));
        assert!(!api_error(500).is_fatal());
    }

    #[test]
    fn test_stage_error_carries_stage_name() {
        let err = Error::stage("state-device-plugin", "apply failed");
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("state-device-plugin"));
    }

    #[test]
    fn test_validation_with_field() {
        let err = Error::validation_for_field(
            "cluster-policy",
            "spec.driver.upgradePolicy.maxUnavailable",
            "invalid percentage",
        );
        match &err {
            Error::Validation { field, policy, .. } => {
                assert_eq!(policy, "cluster-policy");
                assert_eq!(
                    field.as_deref(),
                    Some("spec.driver.upgradePolicy.maxUnavailable")
                );
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_default_policy_context() {
        match Error::validation("x") {
            Error::Validation { policy, field, .. } => {
                assert_eq!(policy, UNKNOWN_CONTEXT);
                assert!(field.is_none());
            }
            _ => panic!("Expected Validation variant"),
        }
        assert_eq!(
            Error::internal("unexpected state").to_string(),
            "internal error: unexpected state"
        );
    }

    #[test]
    fn test_manifest_errors_name_the_file() {
        let err = Error::manifest("a.yaml", "missing kind");
        assert_eq!(err.to_string(), "manifest error in a.yaml: missing kind");
        let err = Error::serialization_for_kind("DaemonSet", "bad");
        assert!(matches!(err, Error::Serialization { kind: Some(ref k), .. } if k == "DaemonSet"));
    }
}
