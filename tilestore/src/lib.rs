//! tilestore - Metatile storage and tile request identity for rendering pipelines
//!
//! This library provides the storage layer shared by tile handlers, brokers
//! and render workers:
//!
//! - [`metatile`]: rounding tile coordinates to their metatile and deriving
//!   the storage key every backend uses
//! - [`storage`]: the [`storage::TileStorage`] contract, its backends and the
//!   registry that builds one from configuration
//! - [`request`]: the [`request::TileRequest`] envelope exchanged between
//!   processes, with its collapsing hash, priority and wire codec

pub mod config;
pub mod logging;
pub mod metatile;
pub mod request;
pub mod storage;

/// Library version, taken from the crate manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
