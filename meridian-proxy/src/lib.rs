//! Client/cache proxy feature store for the Meridian engine.
//!
//! [`ClientCacheProxy`] sits in front of a slow, possibly remote client
//! store and a fast local cache. Reads are always answered from the cache,
//! translated into the client's identifier space, while a small pool of
//! background workers pulls fresher data from the client.
//!
//! The building blocks are public for hosts that assemble their own
//! synchronisation: [`FeatureIdMap`] and [`FeatureSetIdMap`] translate
//! identifiers, [`ClientRequestTask`] describes a unit of background work,
//! and [`Clock`] decouples staleness from wall-clock time.

#![forbid(unsafe_code)]

mod clock;
mod config;
mod id_map;
mod pool;
mod proxy;
mod staleness;
mod sync;
mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DEFAULT_MAX_CACHE_ITEMS, DEFAULT_MAX_CLIENT_REQUEST_THREADS, DEFAULT_SECONDS_UNTIL_STALE,
    ProxyConfig,
};
pub use id_map::{CacheId, ClientId, FeatureIdMap, FeatureSetIdMap, IdMap, IdMapError};
pub use proxy::ClientCacheProxy;
pub use task::ClientRequestTask;
