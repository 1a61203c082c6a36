//! Bidirectional translation between client and cache identifiers.
//!
//! Every entry exists in both directions or in neither. All operations take
//! the map's single mutex for a constant-time critical section, except
//! [`IdMap::client_ids`], which copies the whole forward map.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use log::warn;
use meridian_core::{EntityKind, FeatureStoreError};
use thiserror::Error;

/// Client identifier, as produced by the upstream store.
pub type ClientId = u64;

/// Cache identifier, as produced by the local store.
pub type CacheId = u64;

/// Failures raised by [`IdMap`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdMapError {
    /// One side of the requested entry is already mapped.
    #[error("{kind} mapping {client_id} -> {cache_id} conflicts with an existing entry")]
    Conflict {
        /// Kind of entity the map translates.
        kind: EntityKind,
        /// Client side of the rejected entry.
        client_id: ClientId,
        /// Cache side of the rejected entry.
        cache_id: CacheId,
    },
    /// No entry exists for the identifier.
    #[error("{kind} {id} has no mapping")]
    NotFound {
        /// Kind of entity the map translates.
        kind: EntityKind,
        /// Identifier that was looked up.
        id: u64,
    },
}

impl From<IdMapError> for FeatureStoreError {
    fn from(err: IdMapError) -> Self {
        match err {
            IdMapError::Conflict {
                kind, client_id, ..
            } => Self::Conflict {
                kind,
                id: client_id,
            },
            IdMapError::NotFound { kind, id } => Self::NotFound { kind, id },
        }
    }
}

#[derive(Debug)]
struct Entries<M> {
    to_cache: BTreeMap<ClientId, CacheId>,
    to_client: BTreeMap<CacheId, (ClientId, M)>,
}

/// Thread-safe bidirectional map carrying per-entry metadata `M`.
///
/// Use [`FeatureIdMap`] or [`FeatureSetIdMap`] rather than naming this type
/// directly.
#[derive(Debug)]
pub struct IdMap<M> {
    kind: EntityKind,
    entries: Mutex<Entries<M>>,
}

/// Feature map; each entry records when its cached copy goes stale.
pub type FeatureIdMap = IdMap<SystemTime>;

/// Feature-set map; feature sets never go stale.
pub type FeatureSetIdMap = IdMap<()>;

impl<M: Copy> IdMap<M> {
    const fn with_kind(kind: EntityKind) -> Self {
        Self {
            kind,
            entries: Mutex::new(Entries {
                to_cache: BTreeMap::new(),
                to_client: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries<M>> {
        // Entries are only ever written as complete pairs, so a poisoned
        // guard still holds a consistent map.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    const fn conflict(&self, client_id: ClientId, cache_id: CacheId) -> IdMapError {
        IdMapError::Conflict {
            kind: self.kind,
            client_id,
            cache_id,
        }
    }

    const fn not_found(&self, id: u64) -> IdMapError {
        IdMapError::NotFound {
            kind: self.kind,
            id,
        }
    }

    fn insert(&self, client_id: ClientId, cache_id: CacheId, meta: M) -> Result<(), IdMapError> {
        let mut entries = self.lock();
        if entries.to_cache.contains_key(&client_id) || entries.to_client.contains_key(&cache_id) {
            return Err(self.conflict(client_id, cache_id));
        }
        entries.to_cache.insert(client_id, cache_id);
        entries.to_client.insert(cache_id, (client_id, meta));
        Ok(())
    }

    fn repoint(
        &self,
        client_id: ClientId,
        old_cache_id: CacheId,
        new_cache_id: CacheId,
        meta: M,
    ) -> Result<(), IdMapError> {
        let mut entries = self.lock();
        if entries.to_cache.get(&client_id) != Some(&old_cache_id) {
            return Err(self.not_found(client_id));
        }
        if new_cache_id != old_cache_id && entries.to_client.contains_key(&new_cache_id) {
            return Err(self.conflict(client_id, new_cache_id));
        }
        entries.to_client.remove(&old_cache_id);
        entries.to_cache.insert(client_id, new_cache_id);
        entries.to_client.insert(new_cache_id, (client_id, meta));
        Ok(())
    }

    /// Cache id mapped to `client_id`.
    ///
    /// # Errors
    /// [`IdMapError::NotFound`] when the client id is unmapped.
    pub fn cache_id(&self, client_id: ClientId) -> Result<CacheId, IdMapError> {
        self.lock()
            .to_cache
            .get(&client_id)
            .copied()
            .ok_or_else(|| self.not_found(client_id))
    }

    /// Client id mapped to `cache_id`.
    ///
    /// # Errors
    /// [`IdMapError::NotFound`] when the cache id is unmapped.
    pub fn client_id(&self, cache_id: CacheId) -> Result<ClientId, IdMapError> {
        self.lock()
            .to_client
            .get(&cache_id)
            .map(|(client_id, _)| *client_id)
            .ok_or_else(|| self.not_found(cache_id))
    }

    /// Point-in-time copy of the client-to-cache direction.
    #[must_use]
    pub fn client_ids(&self) -> BTreeMap<ClientId, CacheId> {
        self.lock().to_cache.clone()
    }

    /// Remove the entry for `client_id`, returning its cache id.
    ///
    /// A missing reverse entry is logged and otherwise ignored.
    pub fn remove_client_id(&self, client_id: ClientId) -> Option<CacheId> {
        let mut entries = self.lock();
        let cache_id = entries.to_cache.remove(&client_id)?;
        match entries.to_client.remove(&cache_id) {
            Some((mapped, _)) if mapped == client_id => {}
            Some((mapped, meta)) => {
                warn!(
                    "{} map inconsistent: cache id {cache_id} pointed at client id {mapped}, expected {client_id}",
                    self.kind
                );
                entries.to_client.insert(cache_id, (mapped, meta));
            }
            None => warn!(
                "{} map inconsistent: client id {client_id} had no reverse entry for cache id {cache_id}",
                self.kind
            ),
        }
        Some(cache_id)
    }

    /// Remove the entry for `cache_id`, returning its client id.
    ///
    /// A missing reverse entry is logged and otherwise ignored.
    pub fn remove_cache_id(&self, cache_id: CacheId) -> Option<ClientId> {
        let mut entries = self.lock();
        let (client_id, _) = entries.to_client.remove(&cache_id)?;
        match entries.to_cache.remove(&client_id) {
            Some(mapped) if mapped == cache_id => {}
            Some(mapped) => {
                warn!(
                    "{} map inconsistent: client id {client_id} pointed at cache id {mapped}, expected {cache_id}",
                    self.kind
                );
                entries.to_cache.insert(client_id, mapped);
            }
            None => warn!(
                "{} map inconsistent: cache id {cache_id} had no forward entry for client id {client_id}",
                self.kind
            ),
        }
        Some(client_id)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.to_cache.clear();
        entries.to_client.clear();
    }

    /// Number of mapped pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().to_cache.len()
    }

    /// Whether the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().to_cache.is_empty()
    }
}

impl IdMap<SystemTime> {
    /// Empty feature map.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_kind(EntityKind::Feature)
    }

    /// Map `client_id` to `cache_id`, fresh until `stale_time`.
    ///
    /// # Errors
    /// [`IdMapError::Conflict`] when either id is already mapped.
    ///
    /// # Examples
    /// ```
    /// use std::time::SystemTime;
    /// use meridian_proxy::FeatureIdMap;
    ///
    /// let map = FeatureIdMap::new();
    /// map.add(7, 1001, SystemTime::UNIX_EPOCH).expect("fresh ids");
    /// assert_eq!(map.cache_id(7), Ok(1001));
    /// assert_eq!(map.client_id(1001), Ok(7));
    /// assert!(map.add(7, 1002, SystemTime::UNIX_EPOCH).is_err());
    /// ```
    pub fn add(
        &self,
        client_id: ClientId,
        cache_id: CacheId,
        stale_time: SystemTime,
    ) -> Result<(), IdMapError> {
        self.insert(client_id, cache_id, stale_time)
    }

    /// Repoint `client_id` from `old_cache_id` to `new_cache_id`.
    ///
    /// # Errors
    /// [`IdMapError::NotFound`] when `client_id` is not mapped to
    /// `old_cache_id`, and [`IdMapError::Conflict`] when `new_cache_id`
    /// already belongs to another entry.
    pub fn update(
        &self,
        client_id: ClientId,
        old_cache_id: CacheId,
        new_cache_id: CacheId,
        stale_time: SystemTime,
    ) -> Result<(), IdMapError> {
        self.repoint(client_id, old_cache_id, new_cache_id, stale_time)
    }

    /// Time at which the cached copy behind `cache_id` goes stale.
    ///
    /// # Errors
    /// [`IdMapError::NotFound`] when the cache id is unmapped.
    pub fn cache_stale_time(&self, cache_id: CacheId) -> Result<SystemTime, IdMapError> {
        self.lock()
            .to_client
            .get(&cache_id)
            .map(|(_, stale_time)| *stale_time)
            .ok_or_else(|| self.not_found(cache_id))
    }
}

impl Default for IdMap<SystemTime> {
    fn default() -> Self {
        Self::new()
    }
}

impl IdMap<()> {
    /// Empty feature-set map.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_kind(EntityKind::FeatureSet)
    }

    /// Map `client_id` to `cache_id`.
    ///
    /// # Errors
    /// [`IdMapError::Conflict`] when either id is already mapped.
    pub fn add(&self, client_id: ClientId, cache_id: CacheId) -> Result<(), IdMapError> {
        self.insert(client_id, cache_id, ())
    }

    /// Repoint `client_id` from `old_cache_id` to `new_cache_id`.
    ///
    /// # Errors
    /// As for [`FeatureIdMap::update`].
    pub fn update(
        &self,
        client_id: ClientId,
        old_cache_id: CacheId,
        new_cache_id: CacheId,
    ) -> Result<(), IdMapError> {
        self.repoint(client_id, old_cache_id, new_cache_id, ())
    }
}

impl Default for IdMap<()> {
    fn default() -> Self {
        Self::new()
    }
}
