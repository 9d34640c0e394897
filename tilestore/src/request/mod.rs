//! Tile request types.
//!
//! Provides the `TileRequest` envelope exchanged between tile handlers,
//! brokers and render workers. Besides the tile coordinates it carries the
//! command being performed, the requesting client's id and an optional
//! payload with rendered data on responses.
//!
//! # Identity
//!
//! Three notions of "the same request" are used by different stages:
//!
//! - **Equality** (`==`) compares which tile is asked for and by whom:
//!   coordinates, id, style, parameters and format. Command and priority
//!   describe how the tile is being handled and are ignored.
//! - **Collapsing key** ([`TileRequest::collapse_key`]) identifies the unit
//!   of rendering work: style, zoom and metatile origin. Requests from
//!   different clients, for different formats or for different tiles of the
//!   same metatile all collapse together.
//! - **Storage key** ([`TileRequest::storage_key`]) addresses the stored blob.

mod wire;

pub use wire::{deserialize, serialize, WireError, MAX_MESSAGE_BYTES};

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::metatile::{metatile_origin, storage_key, TileFormat};

/// Priority of bulk renders, which nobody waits for.
pub const PRIORITY_BULK: i32 = 0;
/// Priority of re-renders triggered by expiry.
pub const PRIORITY_DIRTY: i32 = 50;
/// Priority of ordinary renders.
pub const PRIORITY_DEFAULT: i32 = 100;
/// Priority of renders a client is actively waiting for.
pub const PRIORITY_HIGH: i32 = 150;

/// What a request asks the receiving stage to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum TileCommand {
    Ignore = 0,
    /// Render with normal priority.
    Render = 1,
    /// Expire a tile and queue it for re-rendering.
    Dirty = 2,
    /// Worker reports the command completed.
    Done = 3,
    /// Worker reports the command failed.
    NotDone = 4,
    /// Render with high priority.
    RenderPrio = 5,
    /// Render with low priority; no response expected.
    RenderBulk = 6,
    /// Query the status of a tile.
    Status = 7,
}

impl TileCommand {
    /// Priority used when a request does not set one explicitly.
    pub fn default_priority(self) -> i32 {
        match self {
            TileCommand::RenderBulk => PRIORITY_BULK,
            TileCommand::Dirty => PRIORITY_DIRTY,
            TileCommand::RenderPrio => PRIORITY_HIGH,
            _ => PRIORITY_DEFAULT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TileCommand::Ignore => "cmdIgnore",
            TileCommand::Render => "cmdRender",
            TileCommand::Dirty => "cmdDirty",
            TileCommand::Done => "cmdDone",
            TileCommand::NotDone => "cmdNotDone",
            TileCommand::RenderPrio => "cmdRenderPrio",
            TileCommand::RenderBulk => "cmdRenderBulk",
            TileCommand::Status => "cmdStatus",
        }
    }
}

impl TryFrom<u8> for TileCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => TileCommand::Ignore,
            1 => TileCommand::Render,
            2 => TileCommand::Dirty,
            3 => TileCommand::Done,
            4 => TileCommand::NotDone,
            5 => TileCommand::RenderPrio,
            6 => TileCommand::RenderBulk,
            7 => TileCommand::Status,
            other => return Err(other),
        })
    }
}

/// A tile request as exchanged between processes.
///
/// Requests are plain values: each pipeline stage owns its copy.
///
/// # Example
///
/// ```
/// use tilestore::metatile::TileFormat;
/// use tilestore::request::{TileCommand, TileRequest};
///
/// let request = TileRequest::new(TileCommand::Render, 2051, 1363, 12, 7, "osm", TileFormat::PNG);
/// assert_eq!(request.storage_key(), "/osm/12/2048/1360.png");
/// assert_eq!(request.effective_priority(), 100);
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct TileRequest {
    pub command: TileCommand,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    /// Id of the requesting client.
    pub id: i64,
    pub style: String,
    /// Extra style parameters. An empty value is equivalent to an absent
    /// key once the request has crossed the wire.
    pub parameters: BTreeMap<String, String>,
    pub format: TileFormat,
    /// Seconds since the Unix epoch, `0` when unknown.
    pub last_modified: i64,
    /// Seconds since the Unix epoch, `0` when unknown.
    pub request_last_modified: i64,
    /// Explicit priority; derived from the command when `None`.
    pub priority: Option<i32>,
    /// Rendered tile or metatile data on responses.
    #[serde(skip)]
    pub payload: Bytes,
}

impl TileRequest {
    /// Create a new request with no parameters, timestamps or payload.
    pub fn new(
        command: TileCommand,
        x: i32,
        y: i32,
        z: i32,
        id: i64,
        style: impl Into<String>,
        format: TileFormat,
    ) -> Self {
        Self {
            command,
            x,
            y,
            z,
            id,
            style: style.into(),
            parameters: BTreeMap::new(),
            format,
            last_modified: 0,
            request_last_modified: 0,
            priority: None,
            payload: Bytes::new(),
        }
    }

    /// Set an explicit priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Add a style parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Attach payload data.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// The explicit priority, or the one derived from the command.
    pub fn effective_priority(&self) -> i32 {
        self.priority
            .unwrap_or_else(|| self.command.default_priority())
    }

    /// Origin of the metatile containing this tile.
    pub fn metatile_origin(&self) -> (i32, i32) {
        metatile_origin(self.x, self.y)
    }

    /// Key under which the metatile for this request is stored.
    pub fn storage_key(&self) -> String {
        storage_key(&self.style, self.z, self.x, self.y, self.format)
    }

    /// Stable key used to collapse and shard pending requests.
    ///
    /// Covers style, zoom and metatile origin only. The value is the same in
    /// every process and across builds, so independent brokers agree on it.
    /// Distinct metatiles may still collide.
    pub fn collapse_key(&self) -> u64 {
        let (mx, my) = self.metatile_origin();
        let mut hasher = Sha256::new();
        hasher.update((self.style.len() as u64).to_le_bytes());
        hasher.update(self.style.as_bytes());
        hasher.update(self.z.to_le_bytes());
        hasher.update(mx.to_le_bytes());
        hasher.update(my.to_le_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 8];
        key.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(key)
    }

    /// Whether the coordinates lie inside the world at this zoom.
    pub fn is_valid(&self, max_zoom: i32) -> bool {
        if self.z < 0 || self.z > max_zoom || self.z >= 31 {
            return false;
        }
        let limit = 1i64 << self.z;
        (0..limit).contains(&i64::from(self.x)) && (0..limit).contains(&i64::from(self.y))
    }
}

impl Default for TileRequest {
    fn default() -> Self {
        Self::new(TileCommand::RenderPrio, 0, 0, 0, 0, "", TileFormat::PNG)
    }
}

impl PartialEq for TileRequest {
    fn eq(&self, other: &Self) -> bool {
        // command, priority and payload change as the request moves through
        // the pipeline; they are not part of its identity
        self.x == other.x
            && self.y == other.y
            && self.z == other.z
            && self.id == other.id
            && self.style == other.style
            && self.parameters == other.parameters
            && self.format == other.format
    }
}

impl Eq for TileRequest {}

impl Hash for TileRequest {
    /// Hashes the collapsing identity, which is coarser than equality.
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.collapse_key());
    }
}

impl fmt::Display for TileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TILE {}:{}:{} status={} fmt={}",
            self.z,
            self.x,
            self.y,
            self.command.name(),
            self.format
        )?;
        if self.last_modified > 0 {
            write!(f, " last_modified={}", self.last_modified)?;
        }
        if self.request_last_modified > 0 {
            write!(f, " request_last_modified={}", self.request_last_modified)?;
        }
        write!(f, " id={} style={}", self.id, self.style)?;
        if !self.parameters.is_empty() {
            write!(f, " (parameters:")?;
            for (key, value) in &self.parameters {
                write!(f, " {}={}", key, value)?;
            }
            write!(f, ")")?;
        }
        write!(
            f,
            " priority={} data.len()={}",
            self.effective_priority(),
            self.payload.len()
        )
    }
}
