//! Error taxonomy shared by every feature store.

use thiserror::Error;

/// Kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// A feature.
    Feature,
    /// A feature set.
    FeatureSet,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Feature => f.write_str("feature"),
            Self::FeatureSet => f.write_str("feature set"),
        }
    }
}

/// Errors returned by [`crate::FeatureDataStore`] operations.
///
/// Cursor exhaustion is not an error: cursors simply stop yielding rows.
#[derive(Debug, Error)]
pub enum FeatureStoreError {
    /// The requested entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of the missing entity.
        kind: EntityKind,
        /// Identifier that was looked up.
        id: u64,
    },
    /// An identifier is already in use.
    #[error("{kind} {id} already exists")]
    Conflict {
        /// Kind of the conflicting entity.
        kind: EntityKind,
        /// Identifier that collided.
        id: u64,
    },
    /// Caller input was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The store does not support the operation.
    #[error("{operation} is not supported by this store")]
    Unsupported {
        /// Name of the rejected operation.
        operation: &'static str,
    },
    /// An internal invariant was violated.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// The store cannot currently service requests.
    #[error("feature store is unavailable")]
    Unavailable,
    /// Failure raised by the storage backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl FeatureStoreError {
    /// Shorthand for a missing feature.
    #[must_use]
    pub const fn feature_not_found(id: u64) -> Self {
        Self::NotFound {
            kind: EntityKind::Feature,
            id,
        }
    }

    /// Shorthand for a missing feature set.
    #[must_use]
    pub const fn feature_set_not_found(id: u64) -> Self {
        Self::NotFound {
            kind: EntityKind::FeatureSet,
            id,
        }
    }

    /// Whether the error reports a missing entity.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
