//! Output formats and compressions for rendered tiles.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TileError;

/// Encoded output format of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TileFormat {
    Png,
    Jpeg,
    Gtiff,
}

impl TileFormat {
    pub const ALL: [TileFormat; 3] = [TileFormat::Png, TileFormat::Jpeg, TileFormat::Gtiff];

    /// Parse a format name as it appears in a tile path (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PNG" => Some(TileFormat::Png),
            "JPEG" | "JPG" => Some(TileFormat::Jpeg),
            "GTIFF" | "TIFF" | "TIF" => Some(TileFormat::Gtiff),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TileFormat::Png => "PNG",
            TileFormat::Jpeg => "JPEG",
            TileFormat::Gtiff => "GTIFF",
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            TileFormat::Png => "image/png",
            TileFormat::Jpeg => "image/jpeg",
            TileFormat::Gtiff => "image/tiff",
        }
    }

    /// Compressions that can be combined with this format.
    ///
    /// This is also what the bundled engine can encode, so a request that
    /// passes [`check_compression`](Self::check_compression) never fails in
    /// the encoder for its compression. J2K parses but no format accepts it.
    pub fn supported_compressions(&self) -> &'static [Compression] {
        match self {
            TileFormat::Png => &[Compression::None, Compression::Deflate],
            TileFormat::Jpeg => &[Compression::None, Compression::Jpeg],
            TileFormat::Gtiff => &[Compression::None],
        }
    }

    pub fn supports(&self, compression: Compression) -> bool {
        self.supported_compressions().contains(&compression)
    }

    /// Reject format/compression pairs that cannot be encoded.
    pub fn check_compression(&self, compression: Compression) -> Result<(), TileError> {
        if self.supports(compression) {
            Ok(())
        } else {
            Err(TileError::invalid(format!(
                "compression {} is not supported for {} tiles",
                compression, self
            )))
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compression applied inside the encoded tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Compression {
    #[default]
    None,
    Jpeg,
    J2k,
    Lzw,
    Deflate,
}

impl Compression {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "NONE" => Some(Compression::None),
            "JPEG" => Some(Compression::Jpeg),
            "J2K" => Some(Compression::J2k),
            "LZW" => Some(Compression::Lzw),
            "DEFLATE" => Some(Compression::Deflate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "NONE",
            Compression::Jpeg => "JPEG",
            Compression::J2k => "J2K",
            Compression::Lzw => "LZW",
            Compression::Deflate => "DEFLATE",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
