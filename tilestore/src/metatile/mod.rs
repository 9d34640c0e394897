//! Metatile addressing module
//!
//! Maps tile coordinates to the metatile that contains them and renders the
//! storage key shared by every backend.
//!
//! A metatile is a block of `METATILE × METATILE` adjacent tiles which is
//! rendered and stored as a single blob. Its origin is the top-left tile of
//! that block, and all tiles with the same style, zoom and origin resolve to
//! the same stored blob.
//!
//! # Key Format
//!
//! Keys look like the usual tile path, but carry the metatile origin rather
//! than the requested tile:
//!
//! ```
//! use tilestore::metatile::{storage_key, TileFormat};
//!
//! let key = storage_key("osm", 12, 2051, 1363, TileFormat::PNG);
//! assert_eq!(key, "/osm/12/2048/1360.png");
//! ```
//!
//! Changing this derivation invalidates everything already stored.

mod format;
mod reader;

pub use format::{FormatError, TileFormat};
pub use reader::{LayoutReader, MetaLayout, MetatileError, MetatileReader, MetatileWriter};

/// Number of tiles along each side of a metatile.
///
/// Must be a power of two; the collapsing hash and the storage key both
/// depend on it.
pub const METATILE: i32 = 8;

/// Rounds a tile coordinate down to the origin of its metatile.
///
/// Uses floor semantics, so negative coordinates round toward negative
/// infinity and stay consistent with a two's complement mask.
#[inline]
pub fn metatile_origin(x: i32, y: i32) -> (i32, i32) {
    (
        x.div_euclid(METATILE) * METATILE,
        y.div_euclid(METATILE) * METATILE,
    )
}

/// Number of tiles along each side of a metatile at the given zoom.
///
/// At low zooms the whole world is smaller than a metatile, so only
/// `2^z` tiles per side exist.
#[inline]
pub fn metatile_dimension(z: i32) -> i32 {
    if z < 0 {
        return 1;
    }
    if z >= 30 {
        return METATILE;
    }
    METATILE.min(1 << z)
}

/// Builds the storage key for the metatile containing `(x, y)`.
///
/// The key is `"/{style}/{z}/{mx}/{my}.{ext}"` where `(mx, my)` is the
/// metatile origin. Styles must not contain `/` for the key to stay
/// unambiguous.
pub fn storage_key(style: &str, z: i32, x: i32, y: i32, format: TileFormat) -> String {
    let (mx, my) = metatile_origin(x, y);
    format!("/{}/{}/{}/{}.{}", style, z, mx, my, format.extension())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_of_origin_is_itself() {
        assert_eq!(metatile_origin(0, 0), (0, 0));
        assert_eq!(metatile_origin(8, 16), (8, 16));
    }

    #[test]
    fn test_origin_rounds_down() {
        assert_eq!(metatile_origin(7, 7), (0, 0));
        assert_eq!(metatile_origin(9, 15), (8, 8));
        assert_eq!(metatile_origin(2051, 1363), (2048, 1360));
    }

    #[test]
    fn test_origin_negative_uses_floor() {
        assert_eq!(metatile_origin(-1, -8), (-8, -8));
        assert_eq!(metatile_origin(-9, -7), (-16, -8));
    }

    #[test]
    fn test_dimension_low_zoom() {
        assert_eq!(metatile_dimension(0), 1);
        assert_eq!(metatile_dimension(1), 2);
        assert_eq!(metatile_dimension(2), 4);
        assert_eq!(metatile_dimension(3), 8);
        assert_eq!(metatile_dimension(18), 8);
    }

    #[test]
    fn test_storage_key_format() {
        assert_eq!(
            storage_key("osm", 12, 2051, 1363, TileFormat::PNG),
            "/osm/12/2048/1360.png"
        );
        assert_eq!(
            storage_key("hyb", 3, 5, 2, TileFormat::JPEG),
            "/hyb/3/0/0.jpg"
        );
    }

    #[test]
    fn test_storage_key_multiple_formats() {
        let formats = TileFormat::PNG | TileFormat::JSON;
        assert_eq!(storage_key("map", 10, 1, 1, formats), "/map/10/0/0.png+json");
    }

    #[test]
    fn test_storage_key_distinguishes_style_and_format() {
        let a = storage_key("map", 10, 1, 1, TileFormat::PNG);
        let b = storage_key("sat", 10, 1, 1, TileFormat::PNG);
        let c = storage_key("map", 10, 1, 1, TileFormat::JPEG);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Every tile inside one metatile shares the key of its origin
            #[test]
            fn prop_same_origin_same_key(
                z in 3i32..20,
                mx in 0i32..4096,
                my in 0i32..4096,
                dx in 0i32..METATILE,
                dy in 0i32..METATILE
            ) {
                let ox = mx * METATILE;
                let oy = my * METATILE;
                prop_assert_eq!(
                    storage_key("osm", z, ox + dx, oy + dy, TileFormat::PNG),
                    storage_key("osm", z, ox, oy, TileFormat::PNG)
                );
            }

            /// Tiles in different metatiles never share a key
            #[test]
            fn prop_different_origin_different_key(
                x1 in 0i32..100_000,
                y1 in 0i32..100_000,
                x2 in 0i32..100_000,
                y2 in 0i32..100_000
            ) {
                prop_assume!(metatile_origin(x1, y1) != metatile_origin(x2, y2));
                prop_assert_ne!(
                    storage_key("osm", 17, x1, y1, TileFormat::PNG),
                    storage_key("osm", 17, x2, y2, TileFormat::PNG)
                );
            }

            /// The origin is aligned and no further than one metatile away
            #[test]
            fn prop_origin_aligned(x in -100_000i32..100_000, y in -100_000i32..100_000) {
                let (mx, my) = metatile_origin(x, y);
                prop_assert_eq!(mx.rem_euclid(METATILE), 0);
                prop_assert_eq!(my.rem_euclid(METATILE), 0);
                prop_assert!(x - mx >= 0 && x - mx < METATILE);
                prop_assert!(y - my >= 0 && y - my < METATILE);
            }
        }
    }
}
