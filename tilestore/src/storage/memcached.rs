//! memcached metatile storage.
//!
//! Stores each metatile blob as one memcached item under its storage key.
//! memcached gives no durability guarantee, so this backend suits caching
//! in front of a renderer rather than long-term storage.
//!
//! # Configuration
//!
//! | key       | default              |
//! |-----------|----------------------|
//! | `options` | `--SERVER=localhost` |
//! | `expire`  | `0` (never)          |
//!
//! `options` uses libmemcached's syntax. Only `--SERVER=host[:port]` entries
//! are read; the port defaults to 11211 and other flags are ignored:
//!
//! ```text
//! options = --SERVER=cache1:11211 --SERVER=cache2 --BINARY-PROTOCOL
//! ```
//!
//! The client is blocking, so every call runs on tokio's blocking pool.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use super::traits::{BoxFuture, StorageError, TileStorage};
#[cfg(feature = "memcached")]
use crate::config::StorageConfig;
use crate::metatile::{LayoutReader, MetatileReader};
use crate::request::TileRequest;

/// Registry name.
pub const NAME: &str = "memcached";

/// Server list used when `options` is unset.
pub const DEFAULT_OPTIONS: &str = "--SERVER=localhost";

/// memcached's standard port.
pub const DEFAULT_PORT: u16 = 11211;

/// Errors reported by a memcached client.
#[derive(Debug, Clone, Error)]
pub enum MemcachedError {
    /// The server could not be reached or returned an error.
    #[error("memcached request failed: {0}")]
    Client(String),

    /// The blocking task running the request failed.
    #[error("memcached task failed: {0}")]
    Task(String),
}

/// One memcached server from the `options` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    /// Connection URL understood by the client library.
    pub fn url(&self) -> String {
        format!("memcache://{}:{}", self.host, self.port)
    }
}

fn server_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // host, optional port, optional libmemcached weight suffix
        Regex::new(r"^--SERVER=([^\s:/?]+)(?::(\d+))?(?:/\?\d+)?$").unwrap()
    })
}

/// Parses the server entries of a libmemcached options string.
///
/// Returns an error if a `--SERVER` entry is malformed or no server is
/// named at all.
pub fn parse_servers(options: &str) -> Result<Vec<ServerAddress>, StorageError> {
    let invalid = |reason: &str| {
        StorageError::Config(crate::config::ConfigError::InvalidValue {
            key: "options".to_string(),
            value: options.to_string(),
            reason: reason.to_string(),
        })
    };

    let mut servers = Vec::new();
    for token in options.split_whitespace() {
        if !token.starts_with("--SERVER=") {
            debug!(option = token, "Ignoring memcached option");
            continue;
        }
        let captures = server_pattern()
            .captures(token)
            .ok_or_else(|| invalid("malformed --SERVER entry"))?;
        let port = match captures.get(2) {
            Some(port) => port
                .as_str()
                .parse()
                .map_err(|_| invalid("port out of range"))?,
            None => DEFAULT_PORT,
        };
        servers.push(ServerAddress {
            host: captures[1].to_string(),
            port,
        });
    }

    if servers.is_empty() {
        return Err(invalid("no --SERVER entry"));
    }
    Ok(servers)
}

/// Blocking memcached operations used by [`MemcachedStorage`].
///
/// Abstracted so the storage logic can be tested without a server.
pub trait MemcachedClient: Send + Sync + 'static {
    /// Fetches an item, `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MemcachedError>;

    /// Stores an item. `expire_secs` of `0` means never expire.
    fn set(&self, key: &str, value: &[u8], expire_secs: u32) -> Result<(), MemcachedError>;

    /// Deletes an item, returning whether it existed.
    fn delete(&self, key: &str) -> Result<bool, MemcachedError>;
}

/// Client backed by the `memcache` crate's pooled connections.
#[cfg(feature = "memcached")]
pub struct RemoteMemcached {
    client: memcache::Client,
}

#[cfg(feature = "memcached")]
impl RemoteMemcached {
    /// Connects to every server. Blocks while the connections are opened.
    pub fn connect(servers: &[ServerAddress]) -> Result<Self, MemcachedError> {
        let urls: Vec<String> = servers.iter().map(ServerAddress::url).collect();
        let client =
            memcache::Client::connect(urls).map_err(|e| MemcachedError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "memcached")]
impl MemcachedClient for RemoteMemcached {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MemcachedError> {
        self.client
            .get::<Vec<u8>>(key)
            .map_err(|e| MemcachedError::Client(e.to_string()))
    }

    fn set(&self, key: &str, value: &[u8], expire_secs: u32) -> Result<(), MemcachedError> {
        self.client
            .set(key, value, expire_secs)
            .map_err(|e| MemcachedError::Client(e.to_string()))
    }

    fn delete(&self, key: &str) -> Result<bool, MemcachedError> {
        self.client
            .delete(key)
            .map_err(|e| MemcachedError::Client(e.to_string()))
    }
}

/// Metatile storage in memcached.
pub struct MemcachedStorage {
    client: Arc<dyn MemcachedClient>,
    expire_secs: u32,
    reader: Arc<dyn MetatileReader>,
}

impl MemcachedStorage {
    /// Wraps a connected client.
    pub fn new(client: Arc<dyn MemcachedClient>, expire_minutes: u32) -> Self {
        Self {
            client,
            expire_secs: expire_minutes.saturating_mul(60),
            reader: Arc::new(LayoutReader),
        }
    }

    /// Replace the metatile reader.
    pub fn with_reader(mut self, reader: Arc<dyn MetatileReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Item lifetime in seconds, `0` for never.
    pub fn expire_secs(&self) -> u32 {
        self.expire_secs
    }

    async fn call<T, F>(&self, op: F) -> Result<T, MemcachedError>
    where
        F: FnOnce(&dyn MemcachedClient) -> Result<T, MemcachedError> + Send + 'static,
        T: Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || op(client.as_ref()))
            .await
            .map_err(|e| MemcachedError::Task(e.to_string()))?
    }
}

impl TileStorage for MemcachedStorage {
    fn name(&self) -> &str {
        NAME
    }

    fn reader(&self) -> &Arc<dyn MetatileReader> {
        &self.reader
    }

    fn get_meta<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let key = request.storage_key();
            let lookup = key.clone();
            match self.call(move |client| client.get(&lookup)).await {
                Ok(Some(blob)) => Some(Bytes::from(blob)),
                Ok(None) => {
                    debug!(key = %key, "Metatile not in memcached");
                    None
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "memcached get failed");
                    None
                }
            }
        })
    }

    fn put_meta<'a>(&'a self, request: &'a TileRequest, blob: Bytes) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let key = request.storage_key();
            let target = key.clone();
            let expire_secs = self.expire_secs;
            match self
                .call(move |client| client.set(&target, &blob, expire_secs))
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    warn!(key = %key, error = %e, "memcached set failed");
                    false
                }
            }
        })
    }

    fn expire<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let key = request.storage_key();
            let target = key.clone();
            match self.call(move |client| client.delete(&target)).await {
                Ok(existed) => existed,
                Err(e) => {
                    warn!(key = %key, error = %e, "memcached delete failed");
                    false
                }
            }
        })
    }
}

/// Registry constructor.
#[cfg(feature = "memcached")]
pub fn create(
    config: &StorageConfig,
    _context: Option<&super::registry::StorageContext>,
) -> BoxFuture<'static, Result<Arc<dyn TileStorage>, StorageError>> {
    let settings = parse_servers(config.get_or("options", DEFAULT_OPTIONS))
        .and_then(|servers| Ok((servers, config.expire_minutes()?)));

    Box::pin(async move {
        let (servers, expire_minutes) = settings?;
        let connected = tokio::task::spawn_blocking(move || RemoteMemcached::connect(&servers))
            .await
            .map_err(|e| MemcachedError::Task(e.to_string()))
            .and_then(|result| result);

        let client = connected.map_err(|e| StorageError::Connection {
            backend: NAME.to_string(),
            reason: e.to_string(),
        })?;
        Ok::<_, StorageError>(
            Arc::new(MemcachedStorage::new(Arc::new(client), expire_minutes)) as Arc<dyn TileStorage>,
        )
    })
}
