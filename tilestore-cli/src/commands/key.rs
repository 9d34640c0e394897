//! Storage key inspection.

use tilestore::metatile::metatile_dimension;
use tilestore::request::TileCommand;

use super::common::TileArgs;
use crate::error::CliError;

/// Print the storage key, metatile origin and collapse key of a tile.
pub fn run(tile: &TileArgs) -> Result<(), CliError> {
    let request = tile.to_request(TileCommand::Render)?;
    let (mx, my) = request.metatile_origin();

    println!("{}", request.storage_key());
    println!("  Metatile origin: {},{}", mx, my);
    println!("  Metatile size:   {}", metatile_dimension(request.z));
    println!("  Collapse key:    {:016x}", request.collapse_key());
    if !request.is_valid(30) {
        println!("  Warning: tile lies outside the world at zoom {}", request.z);
    }
    Ok(())
}
