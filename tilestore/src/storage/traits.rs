//! Core traits for tile storage backends.
//!
//! The `TileStorage` trait is the one interface the rest of the system uses
//! to read and write metatiles. Every backend (memory, disk, memcached,
//! cassandra) implements it and is used as `Arc<dyn TileStorage>`, chosen at
//! startup from configuration.
//!
//! # Failure Model
//!
//! Operations never return errors. Transport failures, missing entries and
//! corrupt data all surface as `None`, `false` or a not-found handle, and
//! the reason is logged by the backend. Callers treat every such result as
//! "not available right now" and carry on, typically by asking a worker to
//! render the tile.
//!
//! Construction is the exception: a backend that cannot be built returns a
//! [`StorageError`], which is fatal at startup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use super::handle::{extract_tile, StorageHandle};
use crate::config::ConfigError;
use crate::metatile::MetatileReader;
use crate::request::TileRequest;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from constructing a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The configuration does not name a backend type.
    #[error("Storage configuration has no 'type'")]
    MissingType,

    /// No backend is registered under the configured type.
    #[error("Unknown storage backend '{0}'")]
    UnknownBackend(String),

    /// A backend with this name is already registered.
    #[error("Storage backend '{0}' is already registered")]
    DuplicateBackend(String),

    /// A configuration value is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Local I/O failed while setting up the backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend could not reach its server.
    #[error("Failed to connect to {backend}: {reason}")]
    Connection { backend: String, reason: String },
}

/// Metatile storage interface.
///
/// Implementations must be `Send + Sync`; a single instance is shared by
/// every task of a process. Calls are single attempts: no retries happen
/// inside a backend.
///
/// # Dyn Compatibility
///
/// Async methods return [`BoxFuture`] so the trait can be used as a trait
/// object.
pub trait TileStorage: Send + Sync {
    /// Registry name of the backend, used in logs.
    fn name(&self) -> &str;

    /// Reader used by [`get`](Self::get) to extract single tiles.
    fn reader(&self) -> &Arc<dyn MetatileReader>;

    /// Fetch the stored metatile blob for the request's metatile.
    ///
    /// Returns `None` if the blob is absent or the backend failed.
    fn get_meta<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, Option<Bytes>>;

    /// Store a metatile blob, replacing any previous one.
    ///
    /// Returns `true` if the store accepted the write.
    fn put_meta<'a>(&'a self, request: &'a TileRequest, blob: Bytes) -> BoxFuture<'a, bool>;

    /// Mark the metatile stale so it is re-rendered.
    ///
    /// What "stale" means depends on the backend: some delete the entry,
    /// some flag it, some cannot expire at all and report success anyway.
    fn expire<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, bool>;

    /// Fetch a single tile.
    ///
    /// Loads the metatile and extracts the requested tile with
    /// [`reader`](Self::reader). Any failure along the way, including a
    /// corrupt blob, yields [`StorageHandle::not_found`].
    fn get<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, StorageHandle> {
        Box::pin(async move {
            match self.get_meta(request).await {
                Some(blob) => extract_tile(self.reader().as_ref(), request, blob, None, false),
                None => StorageHandle::not_found(),
            }
        })
    }
}
