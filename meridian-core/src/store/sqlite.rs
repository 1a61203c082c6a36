//! SQLite-backed feature store.
//!
//! Content is stored as JSON alongside envelope columns that let SQLite
//! prefilter bounding-box queries. Exact spatial matching happens in Rust.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use super::{FeatureCursor, FeatureDataStore, FeatureSetCursor};
use crate::{
    Feature, FeatureDefinition, FeatureId, FeatureQuery, FeatureSet, FeatureSetDefinition,
    FeatureSetId, FeatureSetQuery, FeatureSetUpdate, FeatureStoreError, FeatureUpdate,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS feature_sets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider TEXT NOT NULL,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    min_resolution REAL NOT NULL,
    max_resolution REAL NOT NULL,
    version INTEGER NOT NULL,
    visible INTEGER NOT NULL DEFAULT 1,
    read_only INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS features (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    feature_set_id INTEGER NOT NULL REFERENCES feature_sets(id),
    version INTEGER NOT NULL,
    body TEXT NOT NULL,
    min_x REAL,
    min_y REAL,
    max_x REAL,
    max_y REAL,
    visible INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS features_by_set ON features (feature_set_id);
CREATE INDEX IF NOT EXISTS features_by_envelope ON features (min_x, max_x, min_y, max_y);
";

const SELECT_FEATURES: &str = "SELECT f.id, f.feature_set_id, f.version, f.body, \
     f.visible AND s.visible FROM features f JOIN feature_sets s ON s.id = f.feature_set_id";

const SELECT_FEATURE_SETS: &str = "SELECT id, provider, kind, name, min_resolution, \
     max_resolution, version, visible FROM feature_sets";

/// Error raised by the SQLite backend.
#[derive(Debug, Error)]
pub enum SqliteFeatureStoreError {
    /// Opening the SQLite database failed.
    #[error("failed to open SQLite database at {path}: {source}")]
    OpenDatabase {
        /// Location of the SQLite database on disk.
        path: Utf8PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// Serialising feature content failed.
    #[error("failed to encode feature content: {source}")]
    Encode {
        /// JSON encoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// The stored content of a feature was not valid JSON.
    #[error("failed to decode content of feature {id}: {source}")]
    Decode {
        /// Identifier of the feature whose content failed to parse.
        id: FeatureId,
        /// JSON decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// Generic SQLite error.
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
}

impl From<SqliteFeatureStoreError> for FeatureStoreError {
    fn from(err: SqliteFeatureStoreError) -> Self {
        Self::Backend(Box::new(err))
    }
}

fn database(err: rusqlite::Error) -> FeatureStoreError {
    SqliteFeatureStoreError::Database(err).into()
}

fn encode(definition: &FeatureDefinition) -> Result<String, FeatureStoreError> {
    serde_json::to_string(definition)
        .map_err(|source| SqliteFeatureStoreError::Encode { source }.into())
}

struct SqliteState {
    connection: Connection,
    bulk_depth: usize,
}

/// Persistent [`FeatureDataStore`] backed by a single SQLite database.
pub struct SqliteFeatureStore {
    uri: String,
    state: Mutex<SqliteState>,
}

impl fmt::Debug for SqliteFeatureStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteFeatureStore")
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

struct FeatureRow {
    feature: Feature,
    visible: bool,
}

fn read_feature_row(
    row: &Row<'_>,
) -> rusqlite::Result<(FeatureId, FeatureSetId, u64, String, bool)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_feature_row(
    (id, feature_set_id, version, body, visible): (FeatureId, FeatureSetId, u64, String, bool),
) -> Result<FeatureRow, FeatureStoreError> {
    let definition: FeatureDefinition = serde_json::from_str(&body)
        .map_err(|source| SqliteFeatureStoreError::Decode { id, source })?;
    Ok(FeatureRow {
        feature: definition.into_feature(id, feature_set_id, version),
        visible,
    })
}

fn read_feature_set_row(row: &Row<'_>) -> rusqlite::Result<(FeatureSet, bool)> {
    let set = FeatureSet {
        id: row.get(0)?,
        provider: row.get(1)?,
        kind: row.get(2)?,
        name: row.get(3)?,
        min_resolution: row.get(4)?,
        max_resolution: row.get(5)?,
        version: row.get(6)?,
    };
    Ok((set, row.get(7)?))
}

impl SqliteFeatureStore {
    /// Open (creating if needed) a store in the database at `path`.
    ///
    /// # Errors
    /// Returns [`SqliteFeatureStoreError::OpenDatabase`] when the file cannot
    /// be opened, or a database error if the schema cannot be created.
    pub fn open(path: &Utf8Path) -> Result<Self, SqliteFeatureStoreError> {
        let connection =
            Connection::open(path.as_std_path()).map_err(|source| {
                SqliteFeatureStoreError::OpenDatabase {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
        Self::with_connection(format!("sqlite://{path}"), connection)
    }

    /// Create a transient store held entirely in memory.
    ///
    /// # Errors
    /// Returns a database error if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, SqliteFeatureStoreError> {
        let connection = Connection::open_in_memory()?;
        Self::with_connection("sqlite::memory:".to_owned(), connection)
    }

    fn with_connection(
        uri: String,
        connection: Connection,
    ) -> Result<Self, SqliteFeatureStoreError> {
        connection.execute_batch(SCHEMA)?;
        Ok(Self {
            uri,
            state: Mutex::new(SqliteState {
                connection,
                bulk_depth: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SqliteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_features(
        &self,
        query: &FeatureQuery,
    ) -> Result<(Vec<Feature>, Vec<FeatureStoreError>), FeatureStoreError> {
        let state = self.lock();
        let raw = match &query.spatial_filter {
            Some(filter) => {
                let sql = format!(
                    "{SELECT_FEATURES} WHERE f.max_x >= ?1 AND f.min_x <= ?2 \
                     AND f.max_y >= ?3 AND f.min_y <= ?4"
                );
                let mut statement = state.connection.prepare_cached(&sql).map_err(database)?;
                let rows = statement
                    .query_map(
                        params![
                            filter.envelope.min().x,
                            filter.envelope.max().x,
                            filter.envelope.min().y,
                            filter.envelope.max().y
                        ],
                        read_feature_row,
                    )
                    .map_err(database)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(database)?
            }
            None => {
                let mut statement = state
                    .connection
                    .prepare_cached(SELECT_FEATURES)
                    .map_err(database)?;
                let rows = statement.query_map([], read_feature_row).map_err(database)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(database)?
            }
        };
        drop(state);

        let mut matching = Vec::new();
        let mut failures = Vec::new();
        for decoded in raw.into_iter().map(decode_feature_row) {
            match decoded {
                Ok(row) if query.matches(&row.feature, row.visible) => matching.push(row.feature),
                Ok(_) => {}
                Err(err) => failures.push(err),
            }
        }
        Ok((query.finish(matching), failures))
    }

    fn load_feature_sets(
        &self,
        query: &FeatureSetQuery,
    ) -> Result<Vec<FeatureSet>, FeatureStoreError> {
        let state = self.lock();
        let mut statement = state
            .connection
            .prepare_cached(SELECT_FEATURE_SETS)
            .map_err(database)?;
        let rows = statement
            .query_map([], read_feature_set_row)
            .map_err(database)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(database)?;
        let matching = rows
            .into_iter()
            .filter(|(set, visible)| query.matches(set, *visible))
            .map(|(set, _)| set)
            .collect();
        Ok(query.finish(matching))
    }

    fn execute_for_feature(
        &self,
        sql: &str,
        id: FeatureId,
        value: bool,
    ) -> Result<(), FeatureStoreError> {
        let changed = self
            .lock()
            .connection
            .execute(sql, params![value, id])
            .map_err(database)?;
        if changed == 0 {
            return Err(FeatureStoreError::feature_not_found(id));
        }
        Ok(())
    }

    fn execute_for_feature_set(
        &self,
        sql: &str,
        id: FeatureSetId,
        value: bool,
    ) -> Result<(), FeatureStoreError> {
        let changed = self
            .lock()
            .connection
            .execute(sql, params![value, id])
            .map_err(database)?;
        if changed == 0 {
            return Err(FeatureStoreError::feature_set_not_found(id));
        }
        Ok(())
    }

    fn feature_set_flag(&self, column: &str, id: FeatureSetId) -> Result<bool, FeatureStoreError> {
        let sql = format!("SELECT {column} FROM feature_sets WHERE id = ?1");
        self.lock()
            .connection
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()
            .map_err(database)?
            .ok_or(FeatureStoreError::feature_set_not_found(id))
    }

    fn write_feature(&self, feature: &Feature) -> Result<(), FeatureStoreError> {
        let body = encode(&feature.to_definition())?;
        let envelope = feature.envelope();
        let changed = self
            .lock()
            .connection
            .execute(
                "UPDATE features SET version = ?1, body = ?2, min_x = ?3, min_y = ?4, \
                 max_x = ?5, max_y = ?6 WHERE id = ?7",
                params![
                    feature.version,
                    body,
                    envelope.map(|e| e.min().x),
                    envelope.map(|e| e.min().y),
                    envelope.map(|e| e.max().x),
                    envelope.map(|e| e.max().y),
                    feature.id
                ],
            )
            .map_err(database)?;
        if changed == 0 {
            return Err(FeatureStoreError::feature_not_found(feature.id));
        }
        Ok(())
    }
}

impl FeatureDataStore for SqliteFeatureStore {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn is_available(&self) -> bool {
        true
    }

    fn get_feature(&self, id: FeatureId) -> Result<Feature, FeatureStoreError> {
        let sql = format!("{SELECT_FEATURES} WHERE f.id = ?1");
        let raw = self
            .lock()
            .connection
            .query_row(&sql, params![id], read_feature_row)
            .optional()
            .map_err(database)?
            .ok_or(FeatureStoreError::feature_not_found(id))?;
        decode_feature_row(raw).map(|row| row.feature)
    }

    fn query_features(&self, query: &FeatureQuery) -> Result<FeatureCursor<'_>, FeatureStoreError> {
        let (features, failures) = self.load_features(query)?;
        Ok(Box::new(
            failures
                .into_iter()
                .map(Err)
                .chain(features.into_iter().map(Ok)),
        ))
    }

    fn query_features_count(&self, query: &FeatureQuery) -> Result<usize, FeatureStoreError> {
        if query.selects_all() {
            let rows: i64 = self
                .lock()
                .connection
                .query_row("SELECT COUNT(*) FROM features", [], |row| row.get(0))
                .map_err(database)?;
            return usize::try_from(rows).map_err(|_| {
                FeatureStoreError::IllegalState(format!("negative feature count {rows}"))
            });
        }
        self.load_features(query).map(|(features, _)| features.len())
    }

    fn get_feature_set(&self, id: FeatureSetId) -> Result<FeatureSet, FeatureStoreError> {
        let sql = format!("{SELECT_FEATURE_SETS} WHERE id = ?1");
        self.lock()
            .connection
            .query_row(&sql, params![id], read_feature_set_row)
            .optional()
            .map_err(database)?
            .map(|(set, _)| set)
            .ok_or(FeatureStoreError::feature_set_not_found(id))
    }

    fn query_feature_sets(
        &self,
        query: &FeatureSetQuery,
    ) -> Result<FeatureSetCursor<'_>, FeatureStoreError> {
        let sets = self.load_feature_sets(query)?;
        Ok(Box::new(sets.into_iter().map(Ok)))
    }

    fn query_feature_sets_count(
        &self,
        query: &FeatureSetQuery,
    ) -> Result<usize, FeatureStoreError> {
        self.load_feature_sets(query).map(|sets| sets.len())
    }

    fn insert_feature_set(
        &self,
        definition: &FeatureSetDefinition,
    ) -> Result<FeatureSet, FeatureStoreError> {
        let state = self.lock();
        state
            .connection
            .execute(
                "INSERT INTO feature_sets (provider, kind, name, min_resolution, max_resolution, version) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                params![
                    definition.provider,
                    definition.kind,
                    definition.name,
                    definition.min_resolution,
                    definition.max_resolution
                ],
            )
            .map_err(database)?;
        let id = u64::try_from(state.connection.last_insert_rowid()).map_err(|_| {
            FeatureStoreError::IllegalState("SQLite assigned a negative feature set id".to_owned())
        })?;
        Ok(definition.clone().into_feature_set(id, 1))
    }

    fn update_feature_set(
        &self,
        id: FeatureSetId,
        update: &FeatureSetUpdate,
    ) -> Result<(), FeatureStoreError> {
        let next = update.apply(&self.get_feature_set(id)?);
        self.lock()
            .connection
            .execute(
                "UPDATE feature_sets SET name = ?1, min_resolution = ?2, max_resolution = ?3, \
                 version = ?4 WHERE id = ?5",
                params![next.name, next.min_resolution, next.max_resolution, next.version, id],
            )
            .map_err(database)?;
        Ok(())
    }

    fn delete_feature_set(&self, id: FeatureSetId) -> Result<(), FeatureStoreError> {
        let state = self.lock();
        let changed = state
            .connection
            .execute("DELETE FROM feature_sets WHERE id = ?1", params![id])
            .map_err(database)?;
        if changed == 0 {
            return Err(FeatureStoreError::feature_set_not_found(id));
        }
        state
            .connection
            .execute("DELETE FROM features WHERE feature_set_id = ?1", params![id])
            .map_err(database)?;
        Ok(())
    }

    fn delete_all_feature_sets(&self) -> Result<(), FeatureStoreError> {
        self.lock()
            .connection
            .execute_batch("DELETE FROM features; DELETE FROM feature_sets;")
            .map_err(database)
    }

    fn insert_feature(
        &self,
        feature_set_id: FeatureSetId,
        definition: &FeatureDefinition,
    ) -> Result<Feature, FeatureStoreError> {
        self.get_feature_set(feature_set_id)?;
        let body = encode(definition)?;
        let feature = definition.clone().into_feature(0, feature_set_id, 1);
        let envelope = feature.envelope();
        let state = self.lock();
        state
            .connection
            .execute(
                "INSERT INTO features (feature_set_id, version, body, min_x, min_y, max_x, max_y) \
                 VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    feature_set_id,
                    body,
                    envelope.map(|e| e.min().x),
                    envelope.map(|e| e.min().y),
                    envelope.map(|e| e.max().x),
                    envelope.map(|e| e.max().y)
                ],
            )
            .map_err(database)?;
        let id = u64::try_from(state.connection.last_insert_rowid()).map_err(|_| {
            FeatureStoreError::IllegalState("SQLite assigned a negative feature id".to_owned())
        })?;
        Ok(Feature { id, ..feature })
    }

    fn update_feature(
        &self,
        id: FeatureId,
        update: &FeatureUpdate,
    ) -> Result<(), FeatureStoreError> {
        let next = update.apply(&self.get_feature(id)?);
        self.write_feature(&next)
    }

    fn delete_feature(&self, id: FeatureId) -> Result<(), FeatureStoreError> {
        let changed = self
            .lock()
            .connection
            .execute("DELETE FROM features WHERE id = ?1", params![id])
            .map_err(database)?;
        if changed == 0 {
            return Err(FeatureStoreError::feature_not_found(id));
        }
        Ok(())
    }

    fn delete_all_features(&self, feature_set_id: FeatureSetId) -> Result<(), FeatureStoreError> {
        self.get_feature_set(feature_set_id)?;
        self.lock()
            .connection
            .execute(
                "DELETE FROM features WHERE feature_set_id = ?1",
                params![feature_set_id],
            )
            .map_err(database)?;
        Ok(())
    }

    fn is_feature_visible(&self, id: FeatureId) -> Result<bool, FeatureStoreError> {
        let sql = format!("{SELECT_FEATURES} WHERE f.id = ?1");
        self.lock()
            .connection
            .query_row(&sql, params![id], |row| row.get(4))
            .optional()
            .map_err(database)?
            .ok_or(FeatureStoreError::feature_not_found(id))
    }

    fn set_feature_visible(&self, id: FeatureId, visible: bool) -> Result<(), FeatureStoreError> {
        self.execute_for_feature("UPDATE features SET visible = ?1 WHERE id = ?2", id, visible)
    }

    fn set_features_visible(
        &self,
        query: &FeatureQuery,
        visible: bool,
    ) -> Result<(), FeatureStoreError> {
        let (features, _) = self.load_features(query)?;
        for feature in features {
            self.set_feature_visible(feature.id, visible)?;
        }
        Ok(())
    }

    fn is_feature_set_visible(&self, id: FeatureSetId) -> Result<bool, FeatureStoreError> {
        self.feature_set_flag("visible", id)
    }

    fn set_feature_set_visible(
        &self,
        id: FeatureSetId,
        visible: bool,
    ) -> Result<(), FeatureStoreError> {
        self.execute_for_feature_set(
            "UPDATE feature_sets SET visible = ?1 WHERE id = ?2",
            id,
            visible,
        )
    }

    fn set_feature_sets_visible(
        &self,
        query: &FeatureSetQuery,
        visible: bool,
    ) -> Result<(), FeatureStoreError> {
        for set in self.load_feature_sets(query)? {
            self.set_feature_set_visible(set.id, visible)?;
        }
        Ok(())
    }

    fn is_feature_set_read_only(&self, id: FeatureSetId) -> Result<bool, FeatureStoreError> {
        self.feature_set_flag("read_only", id)
    }

    fn set_feature_set_read_only(
        &self,
        id: FeatureSetId,
        read_only: bool,
    ) -> Result<(), FeatureStoreError> {
        self.execute_for_feature_set(
            "UPDATE feature_sets SET read_only = ?1 WHERE id = ?2",
            id,
            read_only,
        )
    }

    fn set_feature_sets_read_only(
        &self,
        query: &FeatureSetQuery,
        read_only: bool,
    ) -> Result<(), FeatureStoreError> {
        for set in self.load_feature_sets(query)? {
            self.set_feature_set_read_only(set.id, read_only)?;
        }
        Ok(())
    }

    fn begin_bulk_modification(&self) -> Result<(), FeatureStoreError> {
        let mut state = self.lock();
        if state.bulk_depth == 0 {
            state
                .connection
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(database)?;
        }
        state.bulk_depth = state.bulk_depth.saturating_add(1);
        Ok(())
    }

    fn end_bulk_modification(&self, successful: bool) -> Result<(), FeatureStoreError> {
        let mut state = self.lock();
        if state.bulk_depth == 0 {
            return Err(FeatureStoreError::IllegalState(
                "bulk modification ended without a matching begin".to_owned(),
            ));
        }
        state.bulk_depth -= 1;
        if state.bulk_depth > 0 {
            return Ok(());
        }
        let statement = if successful { "COMMIT" } else { "ROLLBACK" };
        state.connection.execute_batch(statement).map_err(database)
    }

    fn is_in_bulk_modification(&self) -> bool {
        self.lock().bulk_depth > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AttributeValue, Attributes, Style};
    use geo::{Coord, Geometry, Point, Rect};
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    fn point(name: &str, x: f64, y: f64) -> FeatureDefinition {
        FeatureDefinition::new(name, Geometry::Point(Point::new(x, y)))
    }

    #[fixture]
    fn store() -> SqliteFeatureStore {
        SqliteFeatureStore::open_in_memory().expect("open in-memory store")
    }

    #[rstest]
    fn content_survives_storage(store: SqliteFeatureStore) {
        let set = store
            .insert_feature_set(&FeatureSetDefinition::new("test", "points", "harbour"))
            .expect("insert set");
        let attributes = Attributes::new()
            .with("depth", AttributeValue::Double(4.5))
            .with("tags", AttributeValue::List(vec![AttributeValue::Text("buoy".into())]));
        let inserted = store
            .insert_feature(
                set.id,
                &point("buoy", 1.0, 2.0)
                    .with_attributes(attributes)
                    .with_style(Style::new("SYMBOL(id:buoy)")),
            )
            .expect("insert feature");
        assert_eq!(store.get_feature(inserted.id).expect("get"), inserted);
    }

    #[rstest]
    fn bounding_box_query(store: SqliteFeatureStore) {
        let set = store
            .insert_feature_set(&FeatureSetDefinition::new("test", "points", "harbour"))
            .expect("insert set");
        let near = store.insert_feature(set.id, &point("near", 0.5, 0.5)).expect("insert");
        store.insert_feature(set.id, &point("far", 8.0, 8.0)).expect("insert");
        let area = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 });
        let found: Vec<_> = store
            .query_features(&FeatureQuery::in_envelope(area))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows");
        assert_eq!(found, vec![near]);
    }

    #[rstest]
    fn rolled_back_scope_discards_rows(store: SqliteFeatureStore) {
        store.begin_bulk_modification().expect("begin");
        store
            .insert_feature_set(&FeatureSetDefinition::new("test", "points", "temp"))
            .expect("insert set");
        store.end_bulk_modification(false).expect("rollback");
        assert_eq!(
            store
                .query_feature_sets_count(&FeatureSetQuery::default())
                .expect("count"),
            0
        );
    }

    #[rstest]
    fn deleting_set_removes_features(store: SqliteFeatureStore) {
        let set = store
            .insert_feature_set(&FeatureSetDefinition::new("test", "points", "harbour"))
            .expect("insert set");
        let feature = store.insert_feature(set.id, &point("a", 0.0, 0.0)).expect("insert");
        store.delete_feature_set(set.id).expect("delete");
        assert!(store.get_feature(feature.id).expect_err("gone").is_not_found());
    }

    #[rstest]
    fn corrupt_rows_surface_per_row(store: SqliteFeatureStore) {
        let set = store
            .insert_feature_set(&FeatureSetDefinition::new("test", "points", "harbour"))
            .expect("insert set");
        store.insert_feature(set.id, &point("ok", 0.0, 0.0)).expect("insert");
        store
            .lock()
            .connection
            .execute(
                "INSERT INTO features (feature_set_id, version, body) VALUES (?1, 1, 'not-json')",
                params![set.id],
            )
            .expect("insert corrupt row");
        let rows: Vec<_> = store
            .query_features(&FeatureQuery::default())
            .expect("query")
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|row| row.is_ok()).count(), 1);
    }

    #[rstest]
    fn unfiltered_count_reads_the_row_count_without_decoding(store: SqliteFeatureStore) {
        let set = store
            .insert_feature_set(&FeatureSetDefinition::new("test", "points", "harbour"))
            .expect("insert set");
        store.insert_feature(set.id, &point("ok", 0.0, 0.0)).expect("insert");
        store.insert_feature(set.id, &point("far", 50.0, 50.0)).expect("insert");
        store
            .lock()
            .connection
            .execute(
                "INSERT INTO features (feature_set_id, version, body) VALUES (?1, 1, 'not-json')",
                params![set.id],
            )
            .expect("insert corrupt row");

        // The corrupt body is never decoded on the unfiltered path.
        assert_eq!(
            store
                .query_features_count(&FeatureQuery::default())
                .expect("count all"),
            3
        );
        let near = FeatureQuery::in_envelope(Rect::new(
            Coord { x: -1.0, y: -1.0 },
            Coord { x: 1.0, y: 1.0 },
        ));
        assert_eq!(store.query_features_count(&near).expect("count near"), 1);
    }

    #[rstest]
    fn reopening_preserves_data() {
        let dir = TempDir::new().expect("create temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("cache.db")).expect("utf-8 path");
        {
            let store = SqliteFeatureStore::open(&path).expect("open");
            store
                .insert_feature_set(&FeatureSetDefinition::new("test", "points", "kept"))
                .expect("insert set");
        }
        let reopened = SqliteFeatureStore::open(&path).expect("reopen");
        assert_eq!(
            reopened
                .query_feature_sets_count(&FeatureSetQuery::default())
                .expect("count"),
            1
        );
    }
}
