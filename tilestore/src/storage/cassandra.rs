//! Cassandra metatile storage.
//!
//! Each style gets its own keyspace, named by the configured prefix plus
//! the style (`tiles_osm`). Metatiles live in that keyspace's `tiles` table:
//!
//! ```text
//! CREATE TABLE "tiles_osm".tiles (key text PRIMARY KEY, tile blob);
//! ```
//!
//! Reads and writes use consistency `ONE`. Every write carries a
//! client-side timestamp in milliseconds, so concurrent writers resolve by
//! last write wins. Keyspaces and tables are not created by this backend.
//!
//! Cassandra has no cheap way to mark a row stale, so [`expire`] does
//! nothing and reports success.
//!
//! # Configuration
//!
//! | key               | default     |
//! |-------------------|-------------|
//! | `server`          | `127.0.0.1` |
//! | `port`            | `9042`      |
//! | `keyspace_prefix` | `tiles_`    |
//!
//! [`expire`]: TileStorage::expire

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use super::traits::{BoxFuture, TileStorage};
use crate::metatile::{LayoutReader, MetatileReader};
use crate::request::TileRequest;

/// Registry name.
pub const NAME: &str = "cassandra";

pub const DEFAULT_SERVER: &str = "127.0.0.1";

/// CQL native protocol port.
pub const DEFAULT_PORT: u16 = 9042;

pub const DEFAULT_KEYSPACE_PREFIX: &str = "tiles_";

/// Table holding the metatiles in every keyspace.
pub const TABLE: &str = "tiles";

/// Errors reported by a Cassandra session.
#[derive(Debug, Clone, Error)]
pub enum CassandraError {
    #[error("Cassandra query failed: {0}")]
    Query(String),

    #[error("Unexpected Cassandra row: {0}")]
    Row(String),
}

/// Async Cassandra operations used by [`CassandraStorage`].
pub trait CassandraSession: Send + Sync {
    /// Reads the blob stored under `key`, `None` if there is no row.
    fn fetch<'a>(
        &'a self,
        keyspace: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, CassandraError>>;

    /// Writes the blob under `key` with the given write timestamp.
    fn insert<'a>(
        &'a self,
        keyspace: &'a str,
        key: &'a str,
        value: Bytes,
        timestamp_ms: i64,
    ) -> BoxFuture<'a, Result<(), CassandraError>>;
}

/// Quotes a keyspace name for use in CQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Session backed by the scylla driver.
#[cfg(feature = "cassandra")]
pub struct ScyllaSession {
    session: scylla::Session,
}

#[cfg(feature = "cassandra")]
impl ScyllaSession {
    /// Connects to a single contact point.
    pub async fn connect(server: &str, port: u16) -> Result<Self, CassandraError> {
        let session = scylla::SessionBuilder::new()
            .known_node(format!("{}:{}", server, port))
            .build()
            .await
            .map_err(|e| CassandraError::Query(e.to_string()))?;
        Ok(Self { session })
    }

    fn statement(cql: String) -> scylla::query::Query {
        let mut query = scylla::query::Query::new(cql);
        query.set_consistency(scylla::statement::Consistency::One);
        query
    }
}

#[cfg(feature = "cassandra")]
impl CassandraSession for ScyllaSession {
    fn fetch<'a>(
        &'a self,
        keyspace: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, CassandraError>> {
        Box::pin(async move {
            let query = Self::statement(format!(
                "SELECT tile FROM {}.{} WHERE key = ?",
                quote_identifier(keyspace),
                TABLE
            ));
            let result = self
                .session
                .query(query, (key.to_string(),))
                .await
                .map_err(|e| CassandraError::Query(e.to_string()))?;
            let row = result
                .maybe_first_row_typed::<(Vec<u8>,)>()
                .map_err(|e| CassandraError::Row(e.to_string()))?;
            Ok(row.map(|(tile,)| tile))
        })
    }

    fn insert<'a>(
        &'a self,
        keyspace: &'a str,
        key: &'a str,
        value: Bytes,
        timestamp_ms: i64,
    ) -> BoxFuture<'a, Result<(), CassandraError>> {
        Box::pin(async move {
            let mut query = Self::statement(format!(
                "INSERT INTO {}.{} (key, tile) VALUES (?, ?)",
                quote_identifier(keyspace),
                TABLE
            ));
            query.set_timestamp(Some(timestamp_ms));
            self.session
                .query(query, (key.to_string(), value.to_vec()))
                .await
                .map_err(|e| CassandraError::Query(e.to_string()))?;
            Ok(())
        })
    }
}

/// Metatile storage in Cassandra.
pub struct CassandraStorage {
    session: Arc<dyn CassandraSession>,
    keyspace_prefix: String,
    reader: Arc<dyn MetatileReader>,
}

impl CassandraStorage {
    pub fn new(session: Arc<dyn CassandraSession>, keyspace_prefix: impl Into<String>) -> Self {
        Self {
            session,
            keyspace_prefix: keyspace_prefix.into(),
            reader: Arc::new(LayoutReader),
        }
    }

    /// Replace the metatile reader.
    pub fn with_reader(mut self, reader: Arc<dyn MetatileReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Keyspace holding the request's style.
    pub fn keyspace(&self, request: &TileRequest) -> String {
        format!("{}{}", self.keyspace_prefix, request.style)
    }
}

impl TileStorage for CassandraStorage {
    fn name(&self) -> &str {
        NAME
    }

    fn reader(&self) -> &Arc<dyn MetatileReader> {
        &self.reader
    }

    fn get_meta<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let keyspace = self.keyspace(request);
            let key = request.storage_key();
            match self.session.fetch(&keyspace, &key).await {
                Ok(Some(blob)) => Some(Bytes::from(blob)),
                Ok(None) => {
                    debug!(keyspace = %keyspace, key = %key, "Metatile not in Cassandra");
                    None
                }
                Err(e) => {
                    warn!(keyspace = %keyspace, key = %key, error = %e, "Cassandra read failed");
                    None
                }
            }
        })
    }

    fn put_meta<'a>(&'a self, request: &'a TileRequest, blob: Bytes) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let keyspace = self.keyspace(request);
            let key = request.storage_key();
            let timestamp_ms = Utc::now().timestamp_millis();
            match self
                .session
                .insert(&keyspace, &key, blob, timestamp_ms)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    warn!(keyspace = %keyspace, key = %key, error = %e, "Cassandra write failed");
                    false
                }
            }
        })
    }

    fn expire<'a>(&'a self, _request: &'a TileRequest) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }
}

/// Registry constructor.
#[cfg(feature = "cassandra")]
pub fn create(
    config: &crate::config::StorageConfig,
    _context: Option<&super::registry::StorageContext>,
) -> BoxFuture<'static, Result<Arc<dyn TileStorage>, super::StorageError>> {
    use super::StorageError;

    let server = config.get_or("server", DEFAULT_SERVER).to_string();
    let prefix = config
        .get_or("keyspace_prefix", DEFAULT_KEYSPACE_PREFIX)
        .to_string();
    let port = config.parse_or("port", DEFAULT_PORT);

    Box::pin(async move {
        let port = port?;
        let session = ScyllaSession::connect(&server, port)
            .await
            .map_err(|e| StorageError::Connection {
                backend: NAME.to_string(),
                reason: e.to_string(),
            })?;
        debug!(server = %server, port, "Connected to Cassandra");
        Ok::<_, StorageError>(
            Arc::new(CassandraStorage::new(Arc::new(session), prefix)) as Arc<dyn TileStorage>,
        )
    })
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::metatile::{MetatileWriter, TileFormat};
    use crate::request::TileCommand;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory stand-in for a Cassandra cluster, with timestamp-based
    /// conflict resolution.
    #[derive(Default)]
    pub struct MockSession {
        pub rows: Mutex<HashMap<(String, String), (Vec<u8>, i64)>>,
        pub offline: AtomicBool,
    }

    impl MockSession {
        fn check(&self) -> Result<(), CassandraError> {
            if self.offline.load(Ordering::SeqCst) {
                Err(CassandraError::Query("no hosts available".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl CassandraSession for MockSession {
        fn fetch<'a>(
            &'a self,
            keyspace: &'a str,
            key: &'a str,
        ) -> BoxFuture<'a, Result<Option<Vec<u8>>, CassandraError>> {
            Box::pin(async move {
                self.check()?;
                let rows = self.rows.lock();
                Ok(rows
                    .get(&(keyspace.to_string(), key.to_string()))
                    .map(|(tile, _)| tile.clone()))
            })
        }

        fn insert<'a>(
            &'a self,
            keyspace: &'a str,
            key: &'a str,
            value: Bytes,
            timestamp_ms: i64,
        ) -> BoxFuture<'a, Result<(), CassandraError>> {
            Box::pin(async move {
                self.check()?;
                let mut rows = self.rows.lock();
                let row = rows
                    .entry((keyspace.to_string(), key.to_string()))
                    .or_insert_with(|| (Vec::new(), i64::MIN));
                if timestamp_ms >= row.1 {
                    *row = (value.to_vec(), timestamp_ms);
                }
                Ok(())
            })
        }
    }

    fn request(style: &str, x: i32, y: i32) -> TileRequest {
        TileRequest::new(TileCommand::Render, x, y, 12, 1, style, TileFormat::PNG)
    }

    fn storage() -> (Arc<MockSession>, CassandraStorage) {
        let session = Arc::new(MockSession::default());
        let storage = CassandraStorage::new(session.clone(), DEFAULT_KEYSPACE_PREFIX);
        (session, storage)
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("tiles_osm"), "\"tiles_osm\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[tokio::test]
    async fn test_rows_keyed_by_style_keyspace() {
        let (session, storage) = storage();
        assert_eq!(storage.keyspace(&request("osm", 0, 0)), "tiles_osm");

        assert!(storage.put_meta(&request("osm", 2051, 1363), Bytes::from_static(b"blob")).await);

        let rows = session.rows.lock();
        let (tile, timestamp) = rows
            .get(&("tiles_osm".to_string(), "/osm/12/2048/1360.png".to_string()))
            .unwrap();
        assert_eq!(tile, b"blob");
        assert!(*timestamp > 0);
    }

    #[tokio::test]
    async fn test_get_extracts_tile() {
        let (_session, storage) = storage();
        let mut writer = MetatileWriter::new(5, 5, 12);
        writer
            .add_tile(TileFormat::PNG, 5, 5, b"tile".to_vec())
            .unwrap();
        storage
            .put_meta(&request("osm", 5, 5), Bytes::from(writer.finish()))
            .await;

        let handle = storage.get(&request("osm", 5, 5)).await;
        assert!(handle.exists);
        assert!(!handle.expired);
        assert_eq!(handle.payload, Bytes::from_static(b"tile"));

        // Another style is another keyspace
        assert!(!storage.get(&request("hyb", 5, 5)).await.exists);
    }

    #[tokio::test]
    async fn test_expire_is_noop() {
        let (session, storage) = storage();
        storage
            .put_meta(&request("osm", 0, 0), Bytes::from_static(b"blob"))
            .await;

        assert!(storage.expire(&request("osm", 0, 0)).await);
        assert!(storage.expire(&request("osm", 800, 800)).await);
        assert_eq!(session.rows.lock().len(), 1);
        assert!(storage.get_meta(&request("osm", 0, 0)).await.is_some());
    }

    #[tokio::test]
    async fn test_older_write_loses() {
        let (session, storage) = storage();
        storage
            .put_meta(&request("osm", 0, 0), Bytes::from_static(b"current"))
            .await;

        let keyspace = storage.keyspace(&request("osm", 0, 0));
        let key = request("osm", 0, 0).storage_key();
        session
            .insert(&keyspace, &key, Bytes::from_static(b"stale"), 1)
            .await
            .unwrap();

        assert_eq!(
            storage.get_meta(&request("osm", 0, 0)).await,
            Some(Bytes::from_static(b"current"))
        );
    }

    #[tokio::test]
    async fn test_session_failure_collapses_to_absent() {
        let (session, storage) = storage();
        session.offline.store(true, Ordering::SeqCst);

        assert_eq!(storage.get_meta(&request("osm", 0, 0)).await, None);
        assert!(!storage.get(&request("osm", 0, 0)).await.exists);
        assert!(!storage.put_meta(&request("osm", 0, 0), Bytes::from_static(b"x")).await);
    }
}
