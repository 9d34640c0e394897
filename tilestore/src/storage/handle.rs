//! Result of fetching a single tile.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::error;

use crate::metatile::MetatileReader;
use crate::request::TileRequest;

/// One tile as returned by [`TileStorage::get`](super::TileStorage::get).
///
/// The payload is a zero-copy slice of the metatile blob it came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StorageHandle {
    /// Whether the tile was found.
    pub exists: bool,
    /// When the metatile was last written, if the backend knows.
    pub last_modified: Option<DateTime<Utc>>,
    /// Whether the metatile has been marked for re-rendering.
    pub expired: bool,
    /// Tile bytes; empty when not found.
    pub payload: Bytes,
}

impl StorageHandle {
    /// The handle returned for missing, unreadable or corrupt tiles.
    pub fn not_found() -> Self {
        Self::default()
    }

    /// Length of the tile data.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Extracts the requested tile from a metatile blob.
///
/// An empty range from the reader means the blob cannot provide the tile,
/// which is reported like a missing tile.
pub(crate) fn extract_tile(
    reader: &dyn MetatileReader,
    request: &TileRequest,
    blob: Bytes,
    last_modified: Option<DateTime<Utc>>,
    expired: bool,
) -> StorageHandle {
    let range = reader.get(&blob, request.format, request.x, request.y);
    if range.is_empty() || range.end > blob.len() {
        error!(
            style = %request.style,
            z = request.z,
            x = request.x,
            y = request.y,
            blob_len = blob.len(),
            "Tile missing from stored metatile"
        );
        return StorageHandle::not_found();
    }

    StorageHandle {
        exists: true,
        last_modified,
        expired,
        payload: blob.slice(range),
    }
}
