//! Container runtime detection across accelerator nodes

use accel_common::crd::Runtime;
use tracing::{info, warn};

/// Classify a `<runtime>://<version>` string reported by the kubelet
pub fn classify_runtime(version: &str) -> Option<Runtime> {
    let name = version.split("://").next().unwrap_or_default();
    if name.starts_with("docker") {
        Some(Runtime::Docker)
    } else if name.starts_with("containerd") {
        Some(Runtime::Containerd)
    } else if name.starts_with("cri-o") {
        Some(Runtime::Crio)
    } else {
        None
    }
}

/// Pick the cluster-wide runtime from `(node, runtime version)` samples
///
/// Any containerd node settles it. Otherwise the last recognized sample
/// wins, and `fallback` is used when nothing is recognized.
pub fn detect_runtime<'a, I>(samples: I, fallback: Runtime) -> Runtime
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut detected = None;
    for (node, version) in samples {
        match classify_runtime(version) {
            Some(Runtime::Containerd) => return Runtime::Containerd,
            Some(runtime) => detected = Some(runtime),
            None => warn!(node, version, "Unable to get runtime info for node"),
        }
    }
    detected.unwrap_or_else(|| {
        info!(%fallback, "Unable to get runtime info from the cluster, using default runtime");
        fallback
    })
}
