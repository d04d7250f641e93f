//! Common types for ferry: errors, ownership labels, the resource store,
//! target resource kinds, the plan data model and settings

#![deny(missing_docs)]

pub mod error;
pub mod kubevirt;
pub mod labels;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod plan;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use error::Error;
pub use labels::{OwnershipIndex, OwnershipKey, OwnershipLabels};
pub use settings::Settings;
pub use store::{Propagation, ResourceStore, TypedStore};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length of a DNS-1123 label (object and VM names)
pub const NAME_MAX_LENGTH: usize = 63;
