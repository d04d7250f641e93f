//! Per-VM convergence for VM import plans
//!
//! [`ConvergenceEngine`] creates, adopts and tears down every target object
//! one VM import needs: namespace, credential secret, config payload, import
//! or populator volumes, the target VM and the guest conversion pod. Each
//! operation is a single idempotent pass; a dependency that is not ready yet
//! ends the pass and the caller re-invokes it later.
//!
//! Objects are found through the ownership labels of [`ferry_common::labels`],
//! never by their generated names, so passes for different VMs of the same
//! plan can run concurrently on one engine.

#![deny(missing_docs)]

pub mod conversion;
mod engine;
mod ensure;
pub mod naming;
pub mod ovf;
mod synthesis;
pub mod teardown;
pub mod template;
pub mod vm;

pub use conversion::{
    conversion_state, ControlError, ConversionControl, ConversionState, HttpConversionControl,
};
pub use engine::ConvergenceEngine;
pub use teardown::TeardownReport;
pub use vm::{ExtendedDataVolume, ImportedVm};
