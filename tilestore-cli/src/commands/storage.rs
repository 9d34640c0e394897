//! Commands that talk to the configured storage backend.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tilestore::config::StorageConfig;
use tilestore::request::TileCommand;
use tilestore::storage::registry;
use tracing::info;

use super::common::{open_storage, runtime, TileArgs};
use crate::error::CliError;

/// Fetch one tile and write it to `output`, or stdout when unset.
pub fn get(config: &StorageConfig, tile: &TileArgs, output: Option<&Path>) -> Result<(), CliError> {
    let request = tile.to_request(TileCommand::Render)?;
    let handle = runtime()?.block_on(async {
        let storage = open_storage(config).await?;
        Ok::<_, CliError>(storage.get(&request).await)
    })?;

    if !handle.exists {
        return Err(CliError::NotFound(request.storage_key()));
    }

    eprintln!(
        "Tile {}/{}/{}/{}: {} bytes{}",
        request.style,
        request.z,
        request.x,
        request.y,
        handle.len(),
        if handle.expired { " (expired)" } else { "" }
    );
    if let Some(modified) = handle.last_modified {
        eprintln!("  Last modified: {}", modified.to_rfc3339());
    }
    write_output(output, &handle.payload)
}

/// Fetch a raw metatile blob and write it to `output`.
pub fn get_meta(config: &StorageConfig, tile: &TileArgs, output: &Path) -> Result<(), CliError> {
    let request = tile.to_request(TileCommand::Render)?;
    let blob = runtime()?.block_on(async {
        let storage = open_storage(config).await?;
        Ok::<_, CliError>(storage.get_meta(&request).await)
    })?;

    let blob = blob.ok_or_else(|| CliError::NotFound(request.storage_key()))?;
    write_output(Some(output), &blob)?;
    println!("Wrote {} bytes to {}", blob.len(), output.display());
    Ok(())
}

/// Store a metatile blob read from `input`.
pub fn put_meta(config: &StorageConfig, tile: &TileArgs, input: &Path) -> Result<(), CliError> {
    let request = tile.to_request(TileCommand::Done)?;
    let blob = fs::read(input).map_err(|error| CliError::FileRead {
        path: input.to_path_buf(),
        error,
    })?;
    let len = blob.len();

    let stored = runtime()?.block_on(async {
        let storage = open_storage(config).await?;
        Ok::<_, CliError>(storage.put_meta(&request, blob.into()).await)
    })?;

    if !stored {
        return Err(CliError::OperationFailed(format!(
            "put_meta {}",
            request.storage_key()
        )));
    }
    info!(key = %request.storage_key(), bytes = len, "Stored metatile");
    println!("Stored {} bytes at {}", len, request.storage_key());
    Ok(())
}

/// Mark a metatile for re-rendering.
pub fn expire(config: &StorageConfig, tile: &TileArgs) -> Result<(), CliError> {
    let request = tile.to_request(TileCommand::Dirty)?;
    let expired = runtime()?.block_on(async {
        let storage = open_storage(config).await?;
        Ok::<_, CliError>(storage.expire(&request).await)
    })?;

    if !expired {
        return Err(CliError::OperationFailed(format!(
            "expire {}",
            request.storage_key()
        )));
    }
    println!("Expired {}", request.storage_key());
    Ok(())
}

/// List the backends compiled into this build.
pub fn backends() -> Result<(), CliError> {
    for name in registry::global().read().names() {
        println!("{}", name);
    }
    Ok(())
}

fn write_output(output: Option<&Path>, data: &[u8]) -> Result<(), CliError> {
    match output {
        Some(path) => fs::write(path, data).map_err(|error| CliError::FileWrite {
            path: path.to_path_buf(),
            error,
        }),
        None => io::stdout()
            .lock()
            .write_all(data)
            .map_err(|error| CliError::FileWrite {
                path: PathBuf::from("<stdout>"),
                error,
            }),
    }
}
