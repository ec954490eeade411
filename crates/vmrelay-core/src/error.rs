//! Error taxonomy for coordinator operations

use thiserror::Error;
use vmrelay_db::StoreError;

/// Errors surfaced by allocation and reconciliation operations
///
/// Config or firewall failures that occur after a record was persisted are
/// reported to the caller but the persisted state is not unwound; retrying
/// the same operation is idempotent against the already-applied proxy entry
/// or firewall rule.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// No free value left in a resource pool
    #[error("no available {0} in the configured range")]
    PoolExhausted(&'static str),

    /// A name, IP, or port uniqueness constraint would be violated
    #[error("{0}")]
    Conflict(String),

    /// Unknown VM or rule
    #[error("{0}")]
    NotFound(String),

    /// The VM exists but does not belong to the caller (or does not exist;
    /// indistinguishable to the caller)
    #[error("{0}")]
    Forbidden(String),

    /// The tunnel config file does not match the expected marker structure;
    /// requires operator intervention
    #[error("tunnel config is corrupt: {0}")]
    ConfigCorrupt(String),

    /// The provisioning tool or firewall API failed
    #[error("external tool failure: {0}")]
    ExternalTool(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(message) => Self::NotFound(message),
            StoreError::Conflict(message) => Self::Conflict(message),
            other => Self::Store(other),
        }
    }
}
