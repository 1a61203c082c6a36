//! Facade crate for the Meridian feature data store.
//!
//! This crate re-exports the feature store contract, the bundled stores and
//! the client/cache proxy. The SQLite store sits behind the `store-sqlite`
//! feature.

#![forbid(unsafe_code)]

pub use meridian_core::{
    AltitudeMode, AttributeValue, Attributes, BulkModification, EntityKind, Feature,
    FeatureCursor, FeatureDataStore, FeatureDefinition, FeatureId, FeatureOrder, FeatureQuery,
    FeatureSet, FeatureSetCursor, FeatureSetDefinition, FeatureSetId, FeatureSetQuery,
    FeatureSetUpdate, FeatureStoreError, FeatureUpdate, MemoryFeatureStore, SpatialFilter, Style,
    envelope_contains, whole_globe,
};

#[cfg(feature = "store-sqlite")]
pub use meridian_core::{SqliteFeatureStore, SqliteFeatureStoreError};

pub use meridian_proxy::{
    CacheId, ClientCacheProxy, ClientId, ClientRequestTask, Clock, FeatureIdMap, FeatureSetIdMap,
    ManualClock, ProxyConfig, SystemClock,
};
