//! Driver auto-upgrade node markers

use crate::labels::TRUE;
use crate::Labels;

/// Annotation opting an accelerator node into driver auto-upgrade
pub const AUTO_UPGRADE_ANNOTATION: &str = "xdxct.com/gpu-driver-upgrade-enabled";

/// Label selecting the driver DaemonSet pods tracked by the upgrade state manager
///
/// Uses the xdxct vendor prefix, matching the driver stage manifests.
pub const DRIVER_APP_LABEL: (&str, &str) = ("app", "xdxct-driver-daemonset");

/// Change needed on a node's auto-upgrade annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationChange {
    /// Already correct
    None,
    /// Set the annotation to `true`
    Set,
    /// Remove the annotation
    Remove,
}

/// Compute the annotation change for one accelerator node
pub fn annotation_change(annotations: &Labels, wanted: bool) -> AnnotationChange {
    let current = annotations.get(AUTO_UPGRADE_ANNOTATION);
    match (wanted, current) {
        (true, Some(v)) if v == TRUE => AnnotationChange::None,
        (true, _) => AnnotationChange::Set,
        (false, Some(_)) => AnnotationChange::Remove,
        (false, None) => AnnotationChange::None,
    }
}
