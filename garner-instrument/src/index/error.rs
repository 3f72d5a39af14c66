use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents all possible errors that can occur when searching for indexes in an
/// [`IndexedSecurities`](super::IndexedSecurities) collection.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Error)]
pub enum IndexError {
    /// Indicates a failure to find a [`SecurityIndex`](crate::security::SecurityIndex) for a
    /// given security identifier.
    ///
    /// Contains a description of the failed lookup attempt.
    #[error("SecurityIndex not found: {0}")]
    SecurityIndex(String),

    /// Indicates a failure to resolve an external identifier (ISIN, CUSIP, etc.) to exactly
    /// one security.
    ///
    /// Contains a description of the failed lookup attempt.
    #[error("external identifier unresolved: {0}")]
    ExternalIdentifier(String),
}
