//! Workload mode selection per node

use std::fmt;
use std::str::FromStr;

use crate::labels::{self, WORKLOAD_CONFIG};
use crate::Labels;

/// How accelerators on a node are exposed to workloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WorkloadConfig {
    /// Containers use the devices directly
    #[default]
    Container,
    /// Devices are passed through to VMs
    VmPassthrough,
    /// VMs receive virtual GPUs
    VmVgpu,
}

impl WorkloadConfig {
    /// All modes
    pub const ALL: [WorkloadConfig; 3] = [Self::Container, Self::VmPassthrough, Self::VmVgpu];

    /// Label value for this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::VmPassthrough => "vm-passthrough",
            Self::VmVgpu => "vm-vgpu",
        }
    }

    /// Deployment labels a node in this mode must carry
    pub fn family(&self) -> &'static [&'static str] {
        match self {
            Self::Container => &labels::CONTAINER_FAMILY,
            Self::VmPassthrough => &labels::VM_PASSTHROUGH_FAMILY,
            Self::VmVgpu => &labels::VM_VGPU_FAMILY,
        }
    }

    /// Resolve the mode for a node
    ///
    /// With sandboxing off every node is a container node. Otherwise the
    /// node's workload label decides; when it is missing or unrecognized the
    /// `fallback` is used and a warning is returned for the caller to log.
    pub fn resolve(
        labels: &Labels,
        sandbox_enabled: bool,
        fallback: WorkloadConfig,
    ) -> (WorkloadConfig, Option<String>) {
        if !sandbox_enabled {
            return (Self::Container, None);
        }
        match labels.get(WORKLOAD_CONFIG) {
            Some(value) => match value.parse() {
                Ok(config) => (config, None),
                Err(_) => (
                    fallback,
                    Some(format!("invalid GPU workload config: {value}")),
                ),
            },
            None => (fallback, Some("no GPU workload config found".to_string())),
        }
    }
}

impl FromStr for WorkloadConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown workload config: {s}"))
    }
}

impl fmt::Display for WorkloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
