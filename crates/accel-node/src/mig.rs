//! MIG capability detection

use crate::labels::{GPU_PRODUCT, MIG_CAPABLE, TRUE, VGPU_HOST_DRIVER_VERSION};
use crate::Labels;

/// Product name fragments of MIG-capable accelerators
const MIG_PRODUCTS: [&str; 3] = ["h100", "a100", "a30"];

/// Whether the node's accelerators support MIG partitioning
///
/// vGPU hosts never qualify. An explicit `mig.capable` label is authoritative;
/// without it the product name is matched case-insensitively.
pub fn is_mig_capable(labels: &Labels) -> bool {
    if labels
        .get(VGPU_HOST_DRIVER_VERSION)
        .is_some_and(|v| !v.is_empty())
    {
        return false;
    }
    if let Some(value) = labels.get(MIG_CAPABLE) {
        return value == TRUE;
    }
    labels.get(GPU_PRODUCT).is_some_and(|product| {
        let product = product.to_lowercase();
        MIG_PRODUCTS.iter().any(|p| product.contains(p))
    })
}
