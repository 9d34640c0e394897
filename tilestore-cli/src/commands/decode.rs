//! Wire message inspection.

use std::fs;
use std::path::Path;

use serde_json::json;
use tilestore::request::{self, TileRequest};

use crate::error::CliError;

/// Decode a wire message from `path` and print it as JSON.
pub fn run(path: &Path) -> Result<(), CliError> {
    let bytes = fs::read(path).map_err(|error| CliError::FileRead {
        path: path.to_path_buf(),
        error,
    })?;
    let request = request::deserialize(&bytes)?;
    println!("{}", to_json(&request));
    Ok(())
}

fn to_json(request: &TileRequest) -> String {
    let value = json!({
        "request": request,
        "command": request.command.name(),
        "storage_key": request.storage_key(),
        "effective_priority": request.effective_priority(),
        "payload_bytes": request.payload.len(),
    });
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
}
