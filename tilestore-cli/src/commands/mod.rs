//! CLI command implementations.
//!
//! - [`key`] - Storage key and metatile origin of a tile
//! - [`storage`] - get, get-meta, put-meta, expire, backends
//! - [`decode`] - Wire message inspection

pub mod common;
pub mod decode;
pub mod key;
pub mod storage;
