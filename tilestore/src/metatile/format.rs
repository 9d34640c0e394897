//! Tile image formats.
//!
//! A [`TileFormat`] is a bitset: a render worker produces every format a
//! style supports in one pass, so requests and metatiles may carry several
//! formats at once.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Errors from parsing format names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// The name is not one of png, jpg/jpeg, gif, json.
    #[error("Unrecognised tile format '{0}'")]
    Unrecognised(String),
}

/// Set of tile formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct TileFormat(u8);

impl TileFormat {
    pub const NONE: TileFormat = TileFormat(0);
    pub const PNG: TileFormat = TileFormat(1);
    pub const JPEG: TileFormat = TileFormat(2);
    pub const GIF: TileFormat = TileFormat(4);
    pub const JSON: TileFormat = TileFormat(8);
    pub const ALL: TileFormat = TileFormat(15);

    const SINGLE: [TileFormat; 4] = [Self::PNG, Self::JPEG, Self::GIF, Self::JSON];

    /// Builds a format set from raw bits, rejecting unknown bits.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL.0 == 0 {
            Some(TileFormat(bits))
        } else {
            None
        }
    }

    /// Raw bit representation.
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every format in `other` is also in `self`.
    pub fn contains(self, other: TileFormat) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether exactly one format is set.
    pub fn is_single(self) -> bool {
        self.0.count_ones() == 1
    }

    /// Iterates over the single formats in this set, lowest bit first.
    pub fn iter(self) -> impl Iterator<Item = TileFormat> {
        Self::SINGLE.into_iter().filter(move |f| self.contains(*f))
    }

    /// The lowest-bit format in the set, if any.
    pub fn primary(self) -> Option<TileFormat> {
        self.iter().next()
    }

    /// File extension used in storage keys.
    ///
    /// Single formats map to their usual extension; a set joins the members
    /// with `+` in bit order (`png+json`). The empty set renders as `none`.
    pub fn extension(self) -> String {
        if self.is_empty() {
            return "none".to_string();
        }
        self.iter()
            .map(|f| f.single_extension())
            .collect::<Vec<_>>()
            .join("+")
    }

    /// MIME type of a single format, `None` for sets.
    pub fn mime_type(self) -> Option<&'static str> {
        match self {
            Self::PNG => Some("image/png"),
            Self::JPEG => Some("image/jpeg"),
            Self::GIF => Some("image/gif"),
            Self::JSON => Some("application/json;charset=UTF-8"),
            _ => None,
        }
    }

    fn single_extension(self) -> &'static str {
        match self {
            Self::PNG => "png",
            Self::JPEG => "jpg",
            Self::GIF => "gif",
            Self::JSON => "json",
            _ => "none",
        }
    }

    /// Parses a comma- or space-separated list of format names.
    ///
    /// ```
    /// use tilestore::metatile::TileFormat;
    ///
    /// let formats = TileFormat::parse_list("png, JSON").unwrap();
    /// assert_eq!(formats, TileFormat::PNG | TileFormat::JSON);
    /// ```
    pub fn parse_list(s: &str) -> Result<Self, FormatError> {
        s.split([',', ' '])
            .filter(|name| !name.is_empty())
            .try_fold(TileFormat::NONE, |acc, name| Ok(acc | name.parse()?))
    }
}

impl FromStr for TileFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "png" => Ok(Self::PNG),
            "jpg" | "jpeg" => Ok(Self::JPEG),
            "gif" => Ok(Self::GIF),
            "json" => Ok(Self::JSON),
            _ => Err(FormatError::Unrecognised(s.to_string())),
        }
    }
}

impl BitOr for TileFormat {
    type Output = TileFormat;

    fn bitor(self, rhs: Self) -> Self::Output {
        TileFormat(self.0 | rhs.0)
    }
}

impl BitOrAssign for TileFormat {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.iter().map(|fmt| fmt.single_extension()).collect();
        write!(f, "{}", names.join(","))
    }
}
