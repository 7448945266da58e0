//! Common identifiers, record types, protocol definitions, and errors shared
//! across `tenant-vault` crates.

pub mod error;
pub mod ids;
pub mod model;
pub mod protocol;

pub use error::ServiceError;
pub use ids::{CorrelationId, TaskId, TenantContext, TenantId};
