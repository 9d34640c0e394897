//! Metatile storage backends.
//!
//! Every backend implements [`TileStorage`] and is used through
//! `Arc<dyn TileStorage>`. Which backend a process uses is decided at
//! startup from a [`StorageConfig`](crate::config::StorageConfig) and the
//! [`registry`]:
//!
//! | name          | module        | notes                                   |
//! |---------------|---------------|-----------------------------------------|
//! | `memory`      | [`memory`]    | moka cache, lost on restart             |
//! | `disk`        | [`disk`]      | one file per metatile, expiry by mtime  |
//! | `memcached`   | [`memcached`] | feature `memcached` (default)           |
//! | `cassandra`   | [`cassandra`] | feature `cassandra`, expiry is a no-op  |
//! | `simple_http` | [`http`]      | feature `http` (default), object store  |
//!
//! All backends store the same blob under the same
//! [`storage key`](crate::metatile::storage_key), so a metatile written by
//! one process can be read by any other pointed at the same store.

pub mod cassandra;
pub mod disk;
mod handle;
pub mod http;
pub mod memcached;
pub mod memory;
pub mod registry;
mod traits;

pub use disk::DiskStorage;
pub use handle::StorageHandle;
pub use memory::MemoryStorage;
pub use registry::{
    create_storage, register_builtin_backends, StorageContext, StorageCreator, StorageRegistry,
};
pub use traits::{BoxFuture, StorageError, TileStorage};
