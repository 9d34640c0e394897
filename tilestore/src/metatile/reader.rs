//! Metatile container reading and writing.
//!
//! Storage backends never look inside a metatile blob themselves. They hand
//! it to a [`MetatileReader`], which returns the byte range of a single tile
//! or an empty range when the blob cannot provide it.
//!
//! # Layout
//!
//! ```text
//! ┌──────────── section per format (bit order) ────────────┐
//! │ "META" │ count u32 │ x i32 │ y i32 │ z i32 │ format u32 │
//! │ count × (offset u32, size u32)                         │
//! └────────────────────────────────────────────────────────┘
//! tile data for every section, in section then index order
//! ```
//!
//! All integers are little endian, offsets are absolute within the blob, and
//! the entry index of tile `(x, y)` is `(y - my) * METATILE + (x - mx)`.

use std::collections::BTreeMap;
use std::ops::Range;

use thiserror::Error;
use tracing::debug;

use super::{metatile_origin, TileFormat, METATILE};

const MAGIC: &[u8; 4] = b"META";
const HEADER_LEN: usize = 24;
const ENTRY_LEN: usize = 8;
const TILE_COUNT: usize = (METATILE * METATILE) as usize;
const SECTION_LEN: usize = HEADER_LEN + TILE_COUNT * ENTRY_LEN;

/// Errors from parsing or building a metatile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetatileError {
    /// The blob ended inside a header or entry table.
    #[error("Metatile truncated at byte {0}")]
    Truncated(usize),

    /// A section header does not start with the magic bytes.
    #[error("Metatile has no section header")]
    BadMagic,

    /// A section declares an unexpected number of tiles.
    #[error("Metatile section declares {0} tiles")]
    BadCount(u32),

    /// The requested format is not stored in this metatile.
    #[error("Format '{0}' not present in metatile")]
    FormatMissing(TileFormat),

    /// A tile was added with a format set instead of one format.
    #[error("Expected a single format, got '{0}'")]
    NotSingleFormat(TileFormat),

    /// A tile was added outside the metatile being built.
    #[error("Tile {x},{y} is outside the metatile at {mx},{my}")]
    OutsideMetatile { x: i32, y: i32, mx: i32, my: i32 },
}

/// Extracts single tiles from a metatile blob.
///
/// Implementations must treat any corruption as an empty range; callers
/// handle that exactly like a missing tile.
pub trait MetatileReader: Send + Sync {
    /// Byte range of tile `(x, y)` in `format`, or an empty range.
    fn get(&self, blob: &[u8], format: TileFormat, x: i32, y: i32) -> Range<usize>;
}

/// Reader for the sectioned layout produced by [`MetatileWriter`].
///
/// A format set selects its lowest-bit member.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutReader;

impl MetatileReader for LayoutReader {
    fn get(&self, blob: &[u8], format: TileFormat, x: i32, y: i32) -> Range<usize> {
        let Some(format) = format.primary() else {
            return 0..0;
        };
        match MetaLayout::parse(blob, format) {
            Ok(layout) => layout.get(x, y),
            Err(e) => {
                debug!(error = %e, x, y, "Metatile layout rejected");
                0..0
            }
        }
    }
}

/// A parsed view of one format section of a metatile.
#[derive(Debug, Clone, Copy)]
pub struct MetaLayout<'a> {
    blob: &'a [u8],
    x: i32,
    y: i32,
    z: i32,
    format: TileFormat,
    entries_start: usize,
}

impl<'a> MetaLayout<'a> {
    /// Locates and validates the section for `format`.
    pub fn parse(blob: &'a [u8], format: TileFormat) -> Result<Self, MetatileError> {
        let mut pos = 0;
        let mut sections = 0;
        while blob.get(pos..pos + MAGIC.len()) == Some(MAGIC.as_slice()) {
            if blob.len() < pos + HEADER_LEN {
                return Err(MetatileError::Truncated(blob.len()));
            }
            let count = read_u32(blob, pos + 4);
            if count as usize != TILE_COUNT {
                return Err(MetatileError::BadCount(count));
            }
            if blob.len() < pos + SECTION_LEN {
                return Err(MetatileError::Truncated(blob.len()));
            }

            let section_format = read_u32(blob, pos + 20);
            if section_format == u32::from(format.bits()) {
                return Ok(Self {
                    blob,
                    x: read_i32(blob, pos + 8),
                    y: read_i32(blob, pos + 12),
                    z: read_i32(blob, pos + 16),
                    format,
                    entries_start: pos + HEADER_LEN,
                });
            }
            pos += SECTION_LEN;
            sections += 1;
        }

        if sections == 0 {
            Err(MetatileError::BadMagic)
        } else {
            Err(MetatileError::FormatMissing(format))
        }
    }

    /// Origin and zoom recorded in the header.
    pub fn origin(&self) -> (i32, i32, i32) {
        (self.x, self.y, self.z)
    }

    pub fn format(&self) -> TileFormat {
        self.format
    }

    /// Byte range of tile `(x, y)`, empty if it lies outside this metatile
    /// or its entry points outside the blob.
    pub fn get(&self, x: i32, y: i32) -> Range<usize> {
        let dx = x.wrapping_sub(self.x);
        let dy = y.wrapping_sub(self.y);
        if !(0..METATILE).contains(&dx) || !(0..METATILE).contains(&dy) {
            return 0..0;
        }
        self.entry((dy * METATILE + dx) as usize)
    }

    /// Lazily yields `(x, y, range)` for every slot of the section.
    ///
    /// Each call starts a fresh iteration.
    pub fn tiles(&self) -> impl Iterator<Item = (i32, i32, Range<usize>)> + 'a {
        let layout = *self;
        (0..TILE_COUNT).map(move |index| {
            let dx = index as i32 % METATILE;
            let dy = index as i32 / METATILE;
            (layout.x + dx, layout.y + dy, layout.entry(index))
        })
    }

    fn entry(&self, index: usize) -> Range<usize> {
        let at = self.entries_start + index * ENTRY_LEN;
        let offset = read_u32(self.blob, at) as usize;
        let size = read_u32(self.blob, at + 4) as usize;
        match offset.checked_add(size) {
            Some(end) if end <= self.blob.len() => offset..end,
            _ => 0..0,
        }
    }
}

/// Builds metatile blobs in the layout understood by [`MetaLayout`].
#[derive(Debug, Clone)]
pub struct MetatileWriter {
    x: i32,
    y: i32,
    z: i32,
    tiles: BTreeMap<(u8, usize), Vec<u8>>,
    formats: TileFormat,
}

impl MetatileWriter {
    /// Starts a metatile for the block containing `(x, y)` at zoom `z`.
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        let (mx, my) = metatile_origin(x, y);
        Self {
            x: mx,
            y: my,
            z,
            tiles: BTreeMap::new(),
            formats: TileFormat::NONE,
        }
    }

    /// Adds the data for one tile in one format, replacing earlier data.
    pub fn add_tile(
        &mut self,
        format: TileFormat,
        x: i32,
        y: i32,
        data: impl Into<Vec<u8>>,
    ) -> Result<&mut Self, MetatileError> {
        if !format.is_single() {
            return Err(MetatileError::NotSingleFormat(format));
        }
        let dx = x.wrapping_sub(self.x);
        let dy = y.wrapping_sub(self.y);
        if !(0..METATILE).contains(&dx) || !(0..METATILE).contains(&dy) {
            return Err(MetatileError::OutsideMetatile {
                x,
                y,
                mx: self.x,
                my: self.y,
            });
        }
        let index = (dy * METATILE + dx) as usize;
        self.tiles.insert((format.bits(), index), data.into());
        self.formats |= format;
        Ok(self)
    }

    /// Formats added so far.
    pub fn formats(&self) -> TileFormat {
        self.formats
    }

    /// Serializes the metatile.
    pub fn finish(&self) -> Vec<u8> {
        let sections: Vec<TileFormat> = self.formats.iter().collect();
        let data_len: usize = self.tiles.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(sections.len() * SECTION_LEN + data_len);

        let mut offset = sections.len() * SECTION_LEN;
        for format in &sections {
            out.extend_from_slice(MAGIC);
            out.extend_from_slice(&(TILE_COUNT as u32).to_le_bytes());
            out.extend_from_slice(&self.x.to_le_bytes());
            out.extend_from_slice(&self.y.to_le_bytes());
            out.extend_from_slice(&self.z.to_le_bytes());
            out.extend_from_slice(&u32::from(format.bits()).to_le_bytes());
            for index in 0..TILE_COUNT {
                let size = self
                    .tiles
                    .get(&(format.bits(), index))
                    .map_or(0, Vec::len);
                out.extend_from_slice(&(offset as u32).to_le_bytes());
                out.extend_from_slice(&(size as u32).to_le_bytes());
                offset += size;
            }
        }

        for format in &sections {
            for index in 0..TILE_COUNT {
                if let Some(data) = self.tiles.get(&(format.bits(), index)) {
                    out.extend_from_slice(data);
                }
            }
        }
        out
    }
}

fn read_u32(blob: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&blob[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_i32(blob: &[u8], at: usize) -> i32 {
    read_u32(blob, at) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut writer = MetatileWriter::new(2051, 1363, 12);
        writer
            .add_tile(TileFormat::PNG, 2048, 1360, b"origin".to_vec())
            .unwrap()
            .add_tile(TileFormat::PNG, 2051, 1363, b"png-tile".to_vec())
            .unwrap()
            .add_tile(TileFormat::JSON, 2051, 1363, b"{\"k\":1}".to_vec())
            .unwrap();
        writer.finish()
    }

    #[test]
    fn test_reader_finds_tile() {
        let blob = sample();
        let range = LayoutReader.get(&blob, TileFormat::PNG, 2051, 1363);
        assert_eq!(&blob[range], b"png-tile");

        let range = LayoutReader.get(&blob, TileFormat::JSON, 2051, 1363);
        assert_eq!(&blob[range], b"{\"k\":1}");
    }

    #[test]
    fn test_reader_missing_tile_is_empty() {
        let blob = sample();
        assert!(LayoutReader.get(&blob, TileFormat::PNG, 2050, 1363).is_empty());
    }

    #[test]
    fn test_reader_tile_outside_metatile_is_empty() {
        let blob = sample();
        assert!(LayoutReader.get(&blob, TileFormat::PNG, 2056, 1363).is_empty());
    }

    #[test]
    fn test_reader_missing_format_is_empty() {
        let blob = sample();
        assert!(LayoutReader.get(&blob, TileFormat::JPEG, 2051, 1363).is_empty());
        assert_eq!(
            MetaLayout::parse(&blob, TileFormat::JPEG).unwrap_err(),
            MetatileError::FormatMissing(TileFormat::JPEG)
        );
    }

    #[test]
    fn test_reader_format_set_uses_primary() {
        let blob = sample();
        let range = LayoutReader.get(&blob, TileFormat::PNG | TileFormat::JSON, 2051, 1363);
        assert_eq!(&blob[range], b"png-tile");
    }

    #[test]
    fn test_corrupt_magic() {
        let mut blob = sample();
        blob[0] = b'X';
        assert_eq!(
            MetaLayout::parse(&blob, TileFormat::PNG).unwrap_err(),
            MetatileError::BadMagic
        );
        assert!(LayoutReader.get(&blob, TileFormat::PNG, 2051, 1363).is_empty());
    }

    #[test]
    fn test_truncated_blob() {
        let blob = sample();
        let truncated = &blob[..HEADER_LEN + 10];
        assert!(matches!(
            MetaLayout::parse(truncated, TileFormat::PNG),
            Err(MetatileError::Truncated(_))
        ));
        assert!(LayoutReader.get(b"garbage", TileFormat::PNG, 0, 0).is_empty());
    }

    #[test]
    fn test_entry_out_of_bounds() {
        let blob = sample();
        // Drop the tile data but keep every header intact
        let headers_only = &blob[..2 * SECTION_LEN];
        assert!(LayoutReader
            .get(headers_only, TileFormat::PNG, 2051, 1363)
            .is_empty());
    }

    #[test]
    fn test_layout_origin_and_tiles() {
        let blob = sample();
        let layout = MetaLayout::parse(&blob, TileFormat::PNG).unwrap();
        assert_eq!(layout.origin(), (2048, 1360, 12));
        assert_eq!(layout.format(), TileFormat::PNG);

        let present: Vec<_> = layout
            .tiles()
            .filter(|(_, _, range)| !range.is_empty())
            .map(|(x, y, _)| (x, y))
            .collect();
        assert_eq!(present, vec![(2048, 1360), (2051, 1363)]);

        // Restartable
        assert_eq!(layout.tiles().count(), TILE_COUNT);
        assert_eq!(layout.tiles().count(), TILE_COUNT);
    }

    #[test]
    fn test_writer_rejects_bad_input() {
        let mut writer = MetatileWriter::new(0, 0, 5);
        assert_eq!(
            writer
                .add_tile(TileFormat::PNG | TileFormat::GIF, 0, 0, vec![1])
                .unwrap_err(),
            MetatileError::NotSingleFormat(TileFormat::PNG | TileFormat::GIF)
        );
        assert!(matches!(
            writer.add_tile(TileFormat::PNG, 8, 0, vec![1]),
            Err(MetatileError::OutsideMetatile { mx: 0, my: 0, .. })
        ));
        assert_eq!(writer.formats(), TileFormat::NONE);
    }

    #[test]
    fn test_empty_writer_has_no_sections() {
        let blob = MetatileWriter::new(0, 0, 1).finish();
        assert!(blob.is_empty());
        assert_eq!(
            MetaLayout::parse(&blob, TileFormat::PNG).unwrap_err(),
            MetatileError::BadMagic
        );
    }
}
