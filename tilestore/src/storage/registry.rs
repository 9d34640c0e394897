//! Backend registry.
//!
//! Maps backend names to constructor functions so the storage used by a
//! process can be chosen from configuration at startup:
//!
//! ```ignore
//! use tilestore::config::StorageConfig;
//! use tilestore::storage::registry;
//!
//! registry::register_builtin_backends()?;
//! let storage = registry::create_storage(&StorageConfig::for_type("memory"), None).await?;
//! ```
//!
//! Nothing registers itself when the library is loaded. A process either
//! builds its own [`StorageRegistry`] or populates the global one with
//! [`register_builtin_backends`] before first use.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::traits::{BoxFuture, StorageError, TileStorage};
use crate::config::StorageConfig;

/// Default number of concurrent I/O operations in a [`StorageContext`].
pub const DEFAULT_IO_CONCURRENCY: usize = 64;

/// Constructor for a storage backend.
pub type StorageCreator = fn(
    &StorageConfig,
    Option<&StorageContext>,
) -> BoxFuture<'static, Result<Arc<dyn TileStorage>, StorageError>>;

/// Shared process resources handed to backend constructors.
///
/// Backends that do local I/O take their permits from the shared limiter
/// when a context is given, so several backends in one process do not
/// overwhelm the filesystem together.
#[derive(Debug, Clone)]
pub struct StorageContext {
    io_limiter: Arc<Semaphore>,
}

impl StorageContext {
    /// Creates a context allowing `io_concurrency` concurrent I/O operations.
    pub fn new(io_concurrency: usize) -> Self {
        Self {
            io_limiter: Arc::new(Semaphore::new(io_concurrency.max(1))),
        }
    }

    /// The shared I/O limiter.
    pub fn io_limiter(&self) -> Arc<Semaphore> {
        Arc::clone(&self.io_limiter)
    }
}

impl Default for StorageContext {
    fn default() -> Self {
        Self::new(DEFAULT_IO_CONCURRENCY)
    }
}

/// Name to constructor mapping.
#[derive(Default, Clone)]
pub struct StorageRegistry {
    creators: BTreeMap<String, StorageCreator>,
}

impl fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

impl StorageRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every backend compiled into this build.
    pub fn with_builtin_backends() -> Self {
        let mut registry = Self::new();
        for (name, creator) in builtin_backends() {
            // Names in the builtin table are distinct
            let _ = registry.register(name, creator);
        }
        registry
    }

    /// Registers a backend constructor.
    ///
    /// Registering a name twice fails and keeps the first constructor.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        creator: StorageCreator,
    ) -> Result<(), StorageError> {
        let name = name.into();
        if self.creators.contains_key(&name) {
            return Err(StorageError::DuplicateBackend(name));
        }
        debug!(backend = %name, "Registered storage backend");
        self.creators.insert(name, creator);
        Ok(())
    }

    /// Removes a backend, returning whether it was registered.
    pub fn remove(&mut self, name: &str) -> bool {
        self.creators.remove(name).is_some()
    }

    /// Whether a backend is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.creators.contains_key(name)
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.creators.keys().cloned().collect()
    }

    /// Looks up the constructor for the configuration's `type`.
    pub fn creator_for(&self, config: &StorageConfig) -> Result<StorageCreator, StorageError> {
        let backend = config.backend_type().ok_or(StorageError::MissingType)?;
        self.creators
            .get(backend)
            .copied()
            .ok_or_else(|| StorageError::UnknownBackend(backend.to_string()))
    }

    /// Builds the backend named by the configuration's `type`.
    pub async fn create(
        &self,
        config: &StorageConfig,
        context: Option<&StorageContext>,
    ) -> Result<Arc<dyn TileStorage>, StorageError> {
        let creator = self.creator_for(config)?;
        let storage = creator(config, context).await?;
        info!(backend = storage.name(), "Storage backend ready");
        Ok(storage)
    }
}

#[allow(unused_mut)]
fn builtin_backends() -> Vec<(&'static str, StorageCreator)> {
    let mut backends: Vec<(&'static str, StorageCreator)> = vec![
        (super::memory::NAME, super::memory::create as StorageCreator),
        (super::disk::NAME, super::disk::create as StorageCreator),
    ];
    #[cfg(feature = "memcached")]
    backends.push((super::memcached::NAME, super::memcached::create as StorageCreator));
    #[cfg(feature = "cassandra")]
    backends.push((super::cassandra::NAME, super::cassandra::create as StorageCreator));
    #[cfg(feature = "http")]
    backends.push((super::http::NAME, super::http::create as StorageCreator));
    backends
}

/// The process-wide registry, empty until populated.
pub fn global() -> &'static RwLock<StorageRegistry> {
    static GLOBAL: OnceLock<RwLock<StorageRegistry>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(StorageRegistry::new()))
}

/// Adds every compiled-in backend to the global registry.
///
/// Fails if any of them is already registered; backends registered before
/// the duplicate are kept.
pub fn register_builtin_backends() -> Result<(), StorageError> {
    let mut registry = global().write();
    for (name, creator) in builtin_backends() {
        registry.register(name, creator)?;
    }
    Ok(())
}

/// Builds a backend from the global registry.
pub async fn create_storage(
    config: &StorageConfig,
    context: Option<&StorageContext>,
) -> Result<Arc<dyn TileStorage>, StorageError> {
    // Do not hold the lock across the constructor's await
    let creator = global().read().creator_for(config)?;
    let storage = creator(config, context).await?;
    info!(backend = storage.name(), "Storage backend ready");
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn failing(
        _: &StorageConfig,
        _: Option<&StorageContext>,
    ) -> BoxFuture<'static, Result<Arc<dyn TileStorage>, StorageError>> {
        Box::pin(async {
            Err(StorageError::Connection {
                backend: "failing".to_string(),
                reason: "refused".to_string(),
            })
        })
    }

    fn fixed(
        _: &StorageConfig,
        _: Option<&StorageContext>,
    ) -> BoxFuture<'static, Result<Arc<dyn TileStorage>, StorageError>> {
        Box::pin(async { Ok(Arc::new(MemoryStorage::new(1024, None)) as Arc<dyn TileStorage>) })
    }

    #[test]
    fn test_builtin_names() {
        let registry = StorageRegistry::with_builtin_backends();
        assert!(registry.contains("memory"));
        assert!(registry.contains("disk"));
        assert_eq!(registry.contains("memcached"), cfg!(feature = "memcached"));
        assert_eq!(registry.contains("cassandra"), cfg!(feature = "cassandra"));
        assert_eq!(registry.contains("simple_http"), cfg!(feature = "http"));
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let mut registry = StorageRegistry::new();
        registry.register("test", fixed).unwrap();

        let err = registry.register("test", failing).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateBackend(ref n) if n == "test"));
        assert_eq!(registry.names(), vec!["test".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_does_not_replace_constructor() {
        let mut registry = StorageRegistry::new();
        registry.register("test", fixed).unwrap();
        let _ = registry.register("test", failing);

        let storage = registry
            .create(&StorageConfig::for_type("test"), None)
            .await
            .unwrap();
        assert_eq!(storage.name(), "memory");
    }

    #[tokio::test]
    async fn test_missing_type() {
        let registry = StorageRegistry::with_builtin_backends();
        let result = registry.create(&StorageConfig::new(), None).await;
        assert!(matches!(result, Err(StorageError::MissingType)));
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let registry = StorageRegistry::with_builtin_backends();
        let result = registry
            .create(&StorageConfig::for_type("riak"), None)
            .await;
        assert!(matches!(result, Err(StorageError::UnknownBackend(ref n)) if n == "riak"));
    }

    #[tokio::test]
    async fn test_constructor_failure_propagates() {
        let mut registry = StorageRegistry::new();
        registry.register("failing", failing).unwrap();
        let result = registry
            .create(&StorageConfig::for_type("failing"), None)
            .await;
        assert!(matches!(result, Err(StorageError::Connection { .. })));
    }

    #[test]
    fn test_remove() {
        let mut registry = StorageRegistry::with_builtin_backends();
        assert!(registry.remove("memory"));
        assert!(!registry.remove("memory"));
        assert!(!registry.contains("memory"));
        registry.register("memory", fixed).unwrap();
    }

    #[test]
    fn test_context_shares_limiter() {
        let context = StorageContext::new(3);
        let a = context.io_limiter();
        let b = context.clone().io_limiter();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.available_permits(), 3);
        assert_eq!(StorageContext::new(0).io_limiter().available_permits(), 1);
    }
}
