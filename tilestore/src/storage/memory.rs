//! In-process metatile storage using moka.
//!
//! Keeps metatiles in a size-bounded `moka::future::Cache`, weighted by blob
//! size. Entries are evicted when the cache is full and, if `expire` is set,
//! after that many minutes. Nothing survives a restart, which makes this
//! backend useful for tests and for a single process fronting a slower
//! store.
//!
//! # Configuration
//!
//! | key        | default     |
//! |------------|-------------|
//! | `max_size` | `268435456` |
//! | `expire`   | `0` (never) |

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use moka::future::Cache as MokaCache;
use tracing::{debug, warn};

use super::registry::StorageContext;
use super::traits::{BoxFuture, StorageError, TileStorage};
use crate::config::StorageConfig;
use crate::metatile::{LayoutReader, MetatileReader};
use crate::request::TileRequest;

/// Registry name.
pub const NAME: &str = "memory";

/// Default capacity in bytes (256 MiB).
pub const DEFAULT_MAX_SIZE: u64 = 256 * 1024 * 1024;

/// Metatile storage held in process memory.
pub struct MemoryStorage {
    cache: MokaCache<String, Bytes>,
    max_size: u64,
    reader: Arc<dyn MetatileReader>,
}

impl MemoryStorage {
    /// Create a store holding at most `max_size_bytes` of blobs.
    ///
    /// # Arguments
    ///
    /// * `max_size_bytes` - Maximum total blob size
    /// * `ttl` - Optional time-to-live for entries
    pub fn new(max_size_bytes: u64, ttl: Option<Duration>) -> Self {
        let mut builder = MokaCache::builder()
            // moka weights are u32, cap very large blobs
            .weigher(|_key: &String, value: &Bytes| -> u32 {
                value.len().min(u32::MAX as usize) as u32
            })
            .max_capacity(max_size_bytes);

        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }

        Self {
            cache: builder.build(),
            max_size: max_size_bytes,
            reader: Arc::new(LayoutReader),
        }
    }

    /// Build from configuration.
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let max_size = config.parse_or("max_size", DEFAULT_MAX_SIZE)?;
        let ttl = match config.expire_minutes()? {
            0 => None,
            minutes => Some(Duration::from_secs(u64::from(minutes) * 60)),
        };
        Ok(Self::new(max_size, ttl))
    }

    /// Replace the metatile reader.
    pub fn with_reader(mut self, reader: Arc<dyn MetatileReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Capacity in bytes.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Whether a blob of `len` bytes can be held at all.
    ///
    /// moka accepts an entry heavier than the whole cache and evicts it on
    /// the next maintenance pass.
    fn fits(&self, len: usize) -> bool {
        len as u64 <= self.max_size && len <= u32::MAX as usize
    }

    /// Number of stored metatiles.
    ///
    /// moka updates its counters lazily, so this may lag recent writes.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl TileStorage for MemoryStorage {
    fn name(&self) -> &str {
        NAME
    }

    fn reader(&self) -> &Arc<dyn MetatileReader> {
        &self.reader
    }

    fn get_meta<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let key = request.storage_key();
            let blob = self.cache.get(&key).await;
            if blob.is_none() {
                debug!(key = %key, "Metatile not in memory store");
            }
            blob
        })
    }

    fn put_meta<'a>(&'a self, request: &'a TileRequest, blob: Bytes) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let key = request.storage_key();
            if !self.fits(blob.len()) {
                warn!(
                    key = %key,
                    size = blob.len(),
                    max_size = self.max_size,
                    "Metatile larger than memory store"
                );
                return false;
            }
            self.cache.insert(key, blob).await;
            true
        })
    }

    fn expire<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.cache.remove(&request.storage_key()).await.is_some() })
    }
}

/// Registry constructor.
pub fn create(
    config: &StorageConfig,
    _context: Option<&StorageContext>,
) -> BoxFuture<'static, Result<Arc<dyn TileStorage>, StorageError>> {
    let storage =
        MemoryStorage::from_config(config).map(|s| Arc::new(s) as Arc<dyn TileStorage>);
    Box::pin(async move { storage })
}
