//! Accelerator operator: controller wiring for the ClusterPolicy and driver upgrade controllers

#![deny(missing_docs)]

/// Controller construction
pub mod controller_runner;
