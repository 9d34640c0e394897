//! Filesystem metatile storage.
//!
//! Each metatile is one file under the configured directory, at the path
//! given by its storage key:
//!
//! ```text
//! <directory>/osm/12/2048/1360.png
//! ```
//!
//! # Expiry
//!
//! Expiring a metatile does not delete it. The file's modification time is
//! set to the Unix epoch instead, so the stale tile can still be served
//! while a fresh one is rendered; [`TileStorage::get`] reports such tiles
//! with `expired = true`. The next `put_meta` writes a new file and clears
//! the mark.
//!
//! # Concurrency
//!
//! File operations run on tokio's blocking pool, bounded by a semaphore.
//! When a [`StorageContext`] is given its shared limiter is used, so all
//! disk backends in a process share one budget.
//!
//! Writes go to a temporary file in the target directory and are renamed
//! into place, so readers never see a partial blob.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::handle::{extract_tile, StorageHandle};
use super::registry::{StorageContext, DEFAULT_IO_CONCURRENCY};
use super::traits::{BoxFuture, StorageError, TileStorage};
use crate::config::StorageConfig;
use crate::metatile::{LayoutReader, MetatileReader};
use crate::request::TileRequest;

/// Registry name.
pub const NAME: &str = "disk";

/// Default storage directory (`<cache dir>/tilestore`).
pub fn default_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tilestore")
}

/// Metatile storage in a local directory tree.
pub struct DiskStorage {
    root: PathBuf,
    io_limiter: Arc<Semaphore>,
    reader: Arc<dyn MetatileReader>,
    tmp_counter: AtomicU64,
}

impl DiskStorage {
    /// Creates a disk store rooted at `root` with its own I/O limiter.
    ///
    /// The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>, max_concurrent_io: usize) -> Self {
        Self::with_shared_limiter(root, Arc::new(Semaphore::new(max_concurrent_io.max(1))))
    }

    /// Creates a disk store that takes permits from a shared limiter.
    pub fn with_shared_limiter(root: impl Into<PathBuf>, limiter: Arc<Semaphore>) -> Self {
        Self {
            root: root.into(),
            io_limiter: limiter,
            reader: Arc::new(LayoutReader),
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Build from configuration, preferring the context's limiter.
    pub fn from_config(
        config: &StorageConfig,
        context: Option<&StorageContext>,
    ) -> Result<Self, StorageError> {
        let root = config
            .get("directory")
            .map(PathBuf::from)
            .unwrap_or_else(default_directory);
        let concurrency = config.parse_or("concurrency", DEFAULT_IO_CONCURRENCY)?;

        Ok(match context {
            Some(context) => Self::with_shared_limiter(root, context.io_limiter()),
            None => Self::new(root, concurrency),
        })
    }

    /// Replace the metatile reader.
    pub fn with_reader(mut self, reader: Arc<dyn MetatileReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path for a request's metatile.
    ///
    /// Returns `None` for keys that would escape the root directory.
    pub fn path_for(&self, request: &TileRequest) -> Option<PathBuf> {
        let key = request.storage_key();
        let relative = Path::new(key.trim_start_matches('/'));
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || relative.components().count() != 4 {
            warn!(key = %key, "Storage key is not a safe relative path");
            return None;
        }
        Some(self.root.join(relative))
    }

    /// Runs a blocking file operation under an I/O permit.
    async fn run_blocking<T, F>(&self, op: F) -> io::Result<T>
    where
        F: FnOnce() -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .io_limiter
            .acquire()
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;

        tokio::task::spawn_blocking(op)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }

    fn temp_path(&self, path: &Path) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".tmp.{}.{}", std::process::id(), n));
        path.with_file_name(name)
    }
}

/// Reads a blob and its mtime through one open handle, so a rename or an
/// expire racing with the read cannot pair bytes and mtime of different
/// files.
fn read_blob(path: &Path) -> io::Result<(Vec<u8>, SystemTime)> {
    let mut file = File::open(path)?;
    let metadata = file.metadata()?;
    let mut data = Vec::with_capacity(metadata.len() as usize);
    file.read_to_end(&mut data)?;
    Ok((data, metadata.modified()?))
}

fn write_atomic(path: &Path, tmp: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Err(e) = fs::write(tmp, data).and_then(|_| fs::rename(tmp, path)) {
        let _ = fs::remove_file(tmp);
        return Err(e);
    }
    Ok(())
}

fn mark_expired(path: &Path) -> io::Result<()> {
    File::options().write(true).open(path)?.set_modified(UNIX_EPOCH)
}

fn log_failure(op: &str, path: &Path, error: &io::Error) {
    if error.kind() == io::ErrorKind::NotFound {
        debug!(op, path = %path.display(), "Metatile not on disk");
    } else {
        warn!(op, path = %path.display(), error = %error, "Disk storage operation failed");
    }
}

impl TileStorage for DiskStorage {
    fn name(&self) -> &str {
        NAME
    }

    fn reader(&self) -> &Arc<dyn MetatileReader> {
        &self.reader
    }

    fn get_meta<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let Some(path) = self.path_for(request) else {
                return None;
            };
            let target = path.clone();
            match self.run_blocking(move || fs::read(&target)).await {
                Ok(data) => Some(Bytes::from(data)),
                Err(e) => {
                    log_failure("get_meta", &path, &e);
                    None
                }
            }
        })
    }

    fn get<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, StorageHandle> {
        Box::pin(async move {
            let Some(path) = self.path_for(request) else {
                return StorageHandle::not_found();
            };
            let target = path.clone();
            match self.run_blocking(move || read_blob(&target)).await {
                Ok((data, modified)) => extract_tile(
                    self.reader.as_ref(),
                    request,
                    Bytes::from(data),
                    Some(DateTime::<Utc>::from(modified)),
                    modified == UNIX_EPOCH,
                ),
                Err(e) => {
                    log_failure("get", &path, &e);
                    StorageHandle::not_found()
                }
            }
        })
    }

    fn put_meta<'a>(&'a self, request: &'a TileRequest, blob: Bytes) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let Some(path) = self.path_for(request) else {
                return false;
            };
            let tmp = self.temp_path(&path);
            let target = path.clone();
            match self
                .run_blocking(move || write_atomic(&target, &tmp, &blob))
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to write metatile");
                    false
                }
            }
        })
    }

    fn expire<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let Some(path) = self.path_for(request) else {
                return false;
            };
            let target = path.clone();
            match self.run_blocking(move || mark_expired(&target)).await {
                Ok(()) => true,
                Err(e) => {
                    log_failure("expire", &path, &e);
                    false
                }
            }
        })
    }
}

/// Registry constructor.
pub fn create(
    config: &StorageConfig,
    context: Option<&StorageContext>,
) -> BoxFuture<'static, Result<Arc<dyn TileStorage>, StorageError>> {
    let storage = DiskStorage::from_config(config, context);
    Box::pin(async move {
        let storage = storage?;
        tokio::fs::create_dir_all(storage.root()).await?;
        debug!(root = %storage.root().display(), "Disk storage opened");
        Ok::<_, StorageError>(Arc::new(storage) as Arc<dyn TileStorage>)
    })
}
