//! Wire encoding of tile requests.
//!
//! Requests travel between handlers, brokers and workers as opaque byte
//! strings. The encoding is bincode over a private message struct, which
//! keeps the in-memory [`TileRequest`] free to change shape.
//!
//! # Quirks
//!
//! - Parameters with an empty value are not sent, so an empty value and an
//!   absent key are indistinguishable after a round trip.
//! - Timestamps are only sent when non-zero; an absent timestamp decodes to
//!   zero.
//! - The effective priority is always sent, so receivers never need the
//!   command-to-priority rule. It decodes as an explicit priority.

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{TileCommand, TileRequest};
use crate::metatile::TileFormat;

/// Upper bound on an encoded message, including payload.
pub const MAX_MESSAGE_BYTES: u64 = 64 * 1024 * 1024;

/// Errors from encoding or decoding a request.
///
/// A decode error means the message must be dropped.
#[derive(Debug, Error)]
pub enum WireError {
    /// The bytes are not a well-formed message.
    #[error("Malformed tile message: {0}")]
    Malformed(#[from] bincode::Error),

    /// The command code is not known to this build.
    #[error("Unknown command code {0}")]
    UnknownCommand(u8),

    /// The format field has bits outside the known formats.
    #[error("Invalid format bits {0:#x}")]
    InvalidFormat(u8),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireParameter {
    key: String,
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireTile {
    command: u8,
    x: i32,
    y: i32,
    z: i32,
    id: i64,
    image: Vec<u8>,
    style: String,
    format: u8,
    priority: i32,
    last_modified: Option<i64>,
    request_last_modified: Option<i64>,
    parameters: Vec<WireParameter>,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_BYTES)
        .reject_trailing_bytes()
}

fn non_zero(timestamp: i64) -> Option<i64> {
    (timestamp != 0).then_some(timestamp)
}

/// Encodes a request for transport.
pub fn serialize(request: &TileRequest) -> Result<Vec<u8>, WireError> {
    let message = WireTile {
        command: request.command as u8,
        x: request.x,
        y: request.y,
        z: request.z,
        id: request.id,
        image: request.payload.to_vec(),
        style: request.style.clone(),
        format: request.format.bits(),
        priority: request.effective_priority(),
        last_modified: non_zero(request.last_modified),
        request_last_modified: non_zero(request.request_last_modified),
        parameters: request
            .parameters
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| WireParameter {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
    };
    Ok(options().serialize(&message)?)
}

/// Decodes a request received from another process.
pub fn deserialize(bytes: &[u8]) -> Result<TileRequest, WireError> {
    let message: WireTile = options().deserialize(bytes)?;

    let command = TileCommand::try_from(message.command).map_err(WireError::UnknownCommand)?;
    let format =
        TileFormat::from_bits(message.format).ok_or(WireError::InvalidFormat(message.format))?;

    Ok(TileRequest {
        command,
        x: message.x,
        y: message.y,
        z: message.z,
        id: message.id,
        style: message.style,
        parameters: message
            .parameters
            .into_iter()
            .map(|p| (p.key, p.value))
            .collect(),
        format,
        last_modified: message.last_modified.unwrap_or(0),
        request_last_modified: message.request_last_modified.unwrap_or(0),
        priority: Some(message.priority),
        payload: message.image.into(),
    })
}
