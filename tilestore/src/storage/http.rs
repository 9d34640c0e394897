//! HTTP object-store metatile storage.
//!
//! Metatiles are objects on an HTTP server that accepts `GET`, `PUT` and
//! `DELETE`, addressed by appending the storage key to a base URL:
//!
//! ```text
//! url = http://tiles.internal/meta
//! GET http://tiles.internal/meta/osm/12/2048/1360.png
//! ```
//!
//! Writes send a `Last-Modified` header and the server is expected to return
//! it on reads. [`TileStorage::get`] takes the handle's `last_modified` from
//! that header, and an object served without one is reported as expired.
//! Only a `200` response counts as found.
//!
//! Expiring a metatile deletes the object.
//!
//! # Configuration
//!
//! | key           | default  |
//! |---------------|----------|
//! | `url`         | required |
//! | `timeout`     | `30` s   |
//! | `concurrency` | `16`     |
//!
//! Requests are bounded by a semaphore; the [`StorageContext`] limiter is
//! used instead when one is given.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::handle::{extract_tile, StorageHandle};
#[cfg(feature = "http")]
use super::registry::StorageContext;
#[cfg(feature = "http")]
use super::traits::StorageError;
use super::traits::{BoxFuture, TileStorage};
#[cfg(feature = "http")]
use crate::config::{ConfigError, StorageConfig};
use crate::metatile::{LayoutReader, MetatileReader};
use crate::request::TileRequest;

/// Registry name.
pub const NAME: &str = "simple_http";

/// Request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Concurrent requests per backend without a shared context.
pub const DEFAULT_CONCURRENCY: usize = 16;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Errors from the HTTP transport. Status codes are not errors.
#[derive(Debug, Clone, Error)]
pub enum HttpStoreError {
    #[error("Failed to create HTTP client: {0}")]
    Client(String),

    #[error("HTTP request failed: {0}")]
    Request(String),
}

/// Response to a `GET`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpObject {
    pub status: u16,
    pub body: Bytes,
    /// Parsed `Last-Modified` header, `None` if absent or unreadable.
    pub last_modified: Option<DateTime<Utc>>,
}

impl HttpObject {
    pub fn is_found(&self) -> bool {
        self.status == 200
    }
}

/// HTTP operations used by [`HttpStorage`].
///
/// Abstracted so the storage logic can be tested without a server.
pub trait HttpStoreClient: Send + Sync {
    /// Fetches the object at `url`.
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<HttpObject, HttpStoreError>>;

    /// Uploads `body` to `url`, returning the response status.
    fn put<'a>(
        &'a self,
        url: &'a str,
        body: Bytes,
        last_modified: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<u16, HttpStoreError>>;

    /// Deletes the object at `url`, returning the response status.
    fn delete<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<u16, HttpStoreError>>;
}

/// Formats a timestamp as an HTTP date (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn format_http_date(when: DateTime<Utc>) -> String {
    when.format(HTTP_DATE_FORMAT).to_string()
}

/// Parses an HTTP date header value.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|when| when.with_timezone(&Utc))
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Client backed by reqwest.
#[cfg(feature = "http")]
pub struct ReqwestStoreClient {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl ReqwestStoreClient {
    /// Creates a client with the given request timeout.
    pub fn with_timeout(timeout_secs: u64) -> Result<Self, HttpStoreError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| HttpStoreError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
impl HttpStoreClient for ReqwestStoreClient {
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<HttpObject, HttpStoreError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| HttpStoreError::Request(e.to_string()))?;

            let status = response.status().as_u16();
            let last_modified = response
                .headers()
                .get(reqwest::header::LAST_MODIFIED)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_http_date);
            let body = response
                .bytes()
                .await
                .map_err(|e| HttpStoreError::Request(e.to_string()))?;

            Ok(HttpObject {
                status,
                body,
                last_modified,
            })
        })
    }

    fn put<'a>(
        &'a self,
        url: &'a str,
        body: Bytes,
        last_modified: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<u16, HttpStoreError>> {
        Box::pin(async move {
            let response = self
                .client
                .put(url)
                .header(reqwest::header::LAST_MODIFIED, format_http_date(last_modified))
                .body(body)
                .send()
                .await
                .map_err(|e| HttpStoreError::Request(e.to_string()))?;
            Ok(response.status().as_u16())
        })
    }

    fn delete<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<u16, HttpStoreError>> {
        Box::pin(async move {
            let response = self
                .client
                .delete(url)
                .send()
                .await
                .map_err(|e| HttpStoreError::Request(e.to_string()))?;
            Ok(response.status().as_u16())
        })
    }
}

/// Metatile storage on an HTTP object store.
pub struct HttpStorage {
    client: Arc<dyn HttpStoreClient>,
    base_url: String,
    limiter: Arc<Semaphore>,
    reader: Arc<dyn MetatileReader>,
}

impl HttpStorage {
    /// Wraps a client talking to the server at `base_url`.
    pub fn new(client: Arc<dyn HttpStoreClient>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            reader: Arc::new(LayoutReader),
        }
    }

    /// Build from configuration with a reqwest client.
    #[cfg(feature = "http")]
    pub fn from_config(
        config: &StorageConfig,
        context: Option<&StorageContext>,
    ) -> Result<Self, StorageError> {
        let url = config.require("url")?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "url".to_string(),
                value: url.to_string(),
                reason: "expected an http:// or https:// URL".to_string(),
            }
            .into());
        }
        let timeout = config.parse_or("timeout", DEFAULT_TIMEOUT_SECS)?;
        let concurrency = config.parse_or("concurrency", DEFAULT_CONCURRENCY)?;

        let client =
            ReqwestStoreClient::with_timeout(timeout).map_err(|e| StorageError::Connection {
                backend: NAME.to_string(),
                reason: e.to_string(),
            })?;
        let storage = Self::new(Arc::new(client), url);
        Ok(match context {
            Some(context) => storage.with_limiter(context.io_limiter()),
            None => storage.with_limiter(Arc::new(Semaphore::new(concurrency.max(1)))),
        })
    }

    /// Share a request limiter with other backends.
    pub fn with_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Replace the metatile reader.
    pub fn with_reader(mut self, reader: Arc<dyn MetatileReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Object URL for the metatile containing the request.
    pub fn url_for(&self, request: &TileRequest) -> String {
        format!("{}{}", self.base_url, request.storage_key())
    }

    async fn fetch(&self, request: &TileRequest) -> Option<HttpObject> {
        let url = self.url_for(request);
        let Ok(_permit) = self.limiter.acquire().await else {
            return None;
        };
        match self.client.get(&url).await {
            Ok(object) if object.is_found() => Some(object),
            Ok(object) if object.status == 404 => {
                debug!(url = %url, "Metatile not on HTTP store");
                None
            }
            Ok(object) => {
                warn!(url = %url, status = object.status, "HTTP store GET failed");
                None
            }
            Err(e) => {
                warn!(url = %url, error = %e, "HTTP store GET failed");
                None
            }
        }
    }
}

impl TileStorage for HttpStorage {
    fn name(&self) -> &str {
        NAME
    }

    fn reader(&self) -> &Arc<dyn MetatileReader> {
        &self.reader
    }

    fn get_meta<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, Option<Bytes>> {
        Box::pin(async move { self.fetch(request).await.map(|object| object.body) })
    }

    fn get<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, StorageHandle> {
        Box::pin(async move {
            match self.fetch(request).await {
                Some(object) => extract_tile(
                    self.reader.as_ref(),
                    request,
                    object.body,
                    object.last_modified,
                    object.last_modified.is_none(),
                ),
                None => StorageHandle::not_found(),
            }
        })
    }

    fn put_meta<'a>(&'a self, request: &'a TileRequest, blob: Bytes) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let url = self.url_for(request);
            let Ok(_permit) = self.limiter.acquire().await else {
                return false;
            };
            match self.client.put(&url, blob, Utc::now()).await {
                Ok(status) if is_success(status) => true,
                Ok(status) => {
                    warn!(url = %url, status, "HTTP store PUT rejected");
                    false
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "HTTP store PUT failed");
                    false
                }
            }
        })
    }

    fn expire<'a>(&'a self, request: &'a TileRequest) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let url = self.url_for(request);
            let Ok(_permit) = self.limiter.acquire().await else {
                return false;
            };
            match self.client.delete(&url).await {
                Ok(status) if is_success(status) => true,
                Ok(404) => {
                    debug!(url = %url, "Nothing to expire on HTTP store");
                    false
                }
                Ok(status) => {
                    warn!(url = %url, status, "HTTP store DELETE rejected");
                    false
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "HTTP store DELETE failed");
                    false
                }
            }
        })
    }
}

/// Registry constructor.
#[cfg(feature = "http")]
pub fn create(
    config: &StorageConfig,
    context: Option<&StorageContext>,
) -> BoxFuture<'static, Result<Arc<dyn TileStorage>, StorageError>> {
    let storage =
        HttpStorage::from_config(config, context).map(|s| Arc::new(s) as Arc<dyn TileStorage>);
    Box::pin(async move { storage })
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::metatile::{MetatileWriter, TileFormat};
    use crate::request::TileCommand;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory stand-in for an HTTP object store.
    #[derive(Default)]
    pub struct MockHttpStore {
        pub objects: Mutex<HashMap<String, (Bytes, Option<DateTime<Utc>>)>>,
        pub offline: AtomicBool,
        pub read_only: AtomicBool,
    }

    impl MockHttpStore {
        fn check(&self) -> Result<(), HttpStoreError> {
            if self.offline.load(Ordering::SeqCst) {
                Err(HttpStoreError::Request("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl HttpStoreClient for MockHttpStore {
        fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<HttpObject, HttpStoreError>> {
            Box::pin(async move {
                self.check()?;
                Ok(match self.objects.lock().get(url) {
                    Some((body, last_modified)) => HttpObject {
                        status: 200,
                        body: body.clone(),
                        last_modified: *last_modified,
                    },
                    None => HttpObject {
                        status: 404,
                        body: Bytes::from_static(b"Not Found"),
                        last_modified: None,
                    },
                })
            })
        }

        fn put<'a>(
            &'a self,
            url: &'a str,
            body: Bytes,
            last_modified: DateTime<Utc>,
        ) -> BoxFuture<'a, Result<u16, HttpStoreError>> {
            Box::pin(async move {
                self.check()?;
                if self.read_only.load(Ordering::SeqCst) {
                    return Ok(405);
                }
                // The header travels at one-second resolution
                let header = format_http_date(last_modified);
                self.objects
                    .lock()
                    .insert(url.to_string(), (body, parse_http_date(&header)));
                Ok(201)
            })
        }

        fn delete<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<u16, HttpStoreError>> {
            Box::pin(async move {
                self.check()?;
                Ok(match self.objects.lock().remove(url) {
                    Some(_) => 204,
                    None => 404,
                })
            })
        }
    }

    fn request(x: i32, y: i32) -> TileRequest {
        TileRequest::new(TileCommand::Render, x, y, 12, 1, "osm", TileFormat::PNG)
    }

    fn blob(x: i32, y: i32, data: &[u8]) -> Bytes {
        let mut writer = MetatileWriter::new(x, y, 12);
        writer.add_tile(TileFormat::PNG, x, y, data.to_vec()).unwrap();
        Bytes::from(writer.finish())
    }

    fn storage() -> (Arc<MockHttpStore>, HttpStorage) {
        let mock = Arc::new(MockHttpStore::default());
        let storage = HttpStorage::new(mock.clone(), "http://tiles.local/meta/");
        (mock, storage)
    }

    #[test]
    fn test_url_for_appends_storage_key() {
        let (_mock, storage) = storage();
        assert_eq!(
            storage.url_for(&request(2051, 1363)),
            "http://tiles.local/meta/osm/12/2048/1360.png"
        );
    }

    #[test]
    fn test_http_date_roundtrip() {
        let when = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(format_http_date(when), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"), Some(when));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[tokio::test]
    async fn test_put_then_get_meta() {
        let (mock, storage) = storage();
        let blob = blob(2051, 1363, b"tile");

        assert!(storage.put_meta(&request(2051, 1363), blob.clone()).await);
        assert!(mock
            .objects
            .lock()
            .contains_key("http://tiles.local/meta/osm/12/2048/1360.png"));
        assert_eq!(storage.get_meta(&request(2048, 1360)).await, Some(blob));
    }

    #[tokio::test]
    async fn test_get_reports_last_modified() {
        let (_mock, storage) = storage();
        let before = Utc::now().timestamp();
        storage
            .put_meta(&request(5, 5), blob(5, 5, b"tile"))
            .await;

        let handle = storage.get(&request(5, 5)).await;
        assert!(handle.exists);
        assert!(!handle.expired);
        assert_eq!(handle.payload, Bytes::from_static(b"tile"));
        let modified = handle.last_modified.unwrap().timestamp();
        assert!(modified >= before - 1);
    }

    #[tokio::test]
    async fn test_missing_last_modified_is_expired() {
        let (mock, storage) = storage();
        mock.objects.lock().insert(
            storage.url_for(&request(5, 5)),
            (blob(5, 5, b"tile"), None),
        );

        let handle = storage.get(&request(5, 5)).await;
        assert!(handle.exists);
        assert!(handle.expired);
        assert_eq!(handle.last_modified, None);
        assert_eq!(handle.payload, Bytes::from_static(b"tile"));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let (_mock, storage) = storage();
        assert_eq!(storage.get_meta(&request(0, 0)).await, None);
        assert_eq!(storage.get(&request(0, 0)).await, StorageHandle::not_found());
    }

    #[tokio::test]
    async fn test_expire_deletes() {
        let (mock, storage) = storage();
        storage.put_meta(&request(0, 0), blob(0, 0, b"tile")).await;

        assert!(storage.expire(&request(1, 1)).await);
        assert!(mock.objects.lock().is_empty());
        assert_eq!(storage.get_meta(&request(0, 0)).await, None);
        assert!(!storage.expire(&request(0, 0)).await);
    }

    #[tokio::test]
    async fn test_rejected_put_is_failure() {
        let (mock, storage) = storage();
        mock.read_only.store(true, Ordering::SeqCst);

        assert!(!storage.put_meta(&request(0, 0), blob(0, 0, b"tile")).await);
        assert_eq!(storage.get_meta(&request(0, 0)).await, None);
    }

    #[tokio::test]
    async fn test_server_failure_collapses_to_absent() {
        let (mock, storage) = storage();
        storage.put_meta(&request(0, 0), blob(0, 0, b"tile")).await;
        mock.offline.store(true, Ordering::SeqCst);

        assert_eq!(storage.get_meta(&request(0, 0)).await, None);
        assert!(!storage.get(&request(0, 0)).await.exists);
        assert!(!storage.put_meta(&request(0, 0), blob(0, 0, b"new")).await);
        assert!(!storage.expire(&request(0, 0)).await);
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_from_config() {
        use crate::config::{ConfigError, StorageConfig};

        let config = StorageConfig::for_type(NAME).with("url", "https://tiles.local/meta");
        let storage = HttpStorage::from_config(&config, None).unwrap();
        assert_eq!(storage.name(), NAME);
        assert_eq!(
            storage.url_for(&request(0, 0)),
            "https://tiles.local/meta/osm/12/0/0.png"
        );

        let context = StorageContext::new(3);
        let shared = HttpStorage::from_config(&config, Some(&context)).unwrap();
        assert!(Arc::ptr_eq(&shared.limiter, &context.io_limiter()));

        assert!(matches!(
            HttpStorage::from_config(&StorageConfig::for_type(NAME), None),
            Err(StorageError::Config(ConfigError::MissingKey(_)))
        ));
        assert!(matches!(
            HttpStorage::from_config(
                &StorageConfig::for_type(NAME).with("url", "ftp://tiles.local"),
                None
            ),
            Err(StorageError::Config(ConfigError::InvalidValue { .. }))
        ));
    }
}
