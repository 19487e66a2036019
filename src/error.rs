//! Error types for address space allocation

use ipnet::IpNet;
use thiserror::Error;

use crate::models::AddressFamily;

/// Result type for allocator and store operations
pub type Result<T> = std::result::Result<T, AllocError>;

/// Allocation errors. None of these are retried by the allocator.
#[derive(Debug, Error)]
pub enum AllocError {
    /// No free block or address of the requested size is left
    #[error("no free {family} /{prefix_length} available in {scope}")]
    Exhaustion {
        family: AddressFamily,
        prefix_length: u8,
        scope: String,
    },

    /// A subdivision layout does not fit inside its parent
    #[error("requested {requested} addresses do not fit in {parent} (capacity {capacity})")]
    Size {
        parent: IpNet,
        requested: u128,
        capacity: u128,
    },

    #[error("{requested} overlaps existing block {existing}")]
    Overlap { requested: IpNet, existing: IpNet },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("malformed stored block: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl AllocError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        AllocError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn is_exhaustion(&self) -> bool {
        matches!(self, AllocError::Exhaustion { .. })
    }

    pub fn is_size(&self) -> bool {
        matches!(self, AllocError::Size { .. })
    }
}
