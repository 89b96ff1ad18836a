//! Raster engine abstraction.
//!
//! The engine turns an image on local disk into encoded tiles. Handles it
//! opens ([`TileFactory`]) are stateful and not thread-safe, so they are only
//! ever used by one caller at a time through the factory pool.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::format::{Compression, TileFormat};
use super::info::ImageInfo;
use super::matrix::{GeoBounds, PixelWindow};
use crate::error::RenderError;
use crate::viewpoint::RangeAdjustment;

/// Sample type of image bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    Byte,
    UInt16,
    Float32,
}

impl PixelType {
    /// Largest representable sample value, used to scale normalised samples.
    pub fn max_value(&self) -> f64 {
        match self {
            PixelType::Byte => f64::from(u8::MAX),
            PixelType::UInt16 => f64::from(u16::MAX),
            PixelType::Float32 => 1.0,
        }
    }
}

/// Identifies one open variant of an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactoryKey {
    pub path: Arc<str>,
    pub format: TileFormat,
    pub compression: Compression,
    /// Output pixel type override; `None` keeps the source type
    pub output_type: Option<PixelType>,
    pub range_adjustment: RangeAdjustment,
}

impl FactoryKey {
    /// Build a key, forcing 8-bit output whenever a range adjustment is requested.
    pub fn new(
        path: impl Into<Arc<str>>,
        format: TileFormat,
        compression: Compression,
        range_adjustment: RangeAdjustment,
    ) -> Self {
        let output_type = range_adjustment
            .forces_byte_output()
            .then_some(PixelType::Byte);
        Self {
            path: path.into(),
            format,
            compression,
            output_type,
            range_adjustment,
        }
    }
}

/// An open, stateful handle on one image variant.
pub trait TileFactory: Send {
    /// Render a source pixel window resampled to `output_size`.
    ///
    /// Returns `Ok(None)` when the window does not overlap the image.
    fn create_encoded_tile(
        &mut self,
        window: PixelWindow,
        output_size: (u32, u32),
    ) -> Result<Option<Bytes>, RenderError>;

    /// Render an orthophoto clipped to `bounds` at `output_size`.
    ///
    /// Returns `Ok(None)` when the image has no coverage inside `bounds`.
    fn create_orthophoto_tile(
        &mut self,
        bounds: &GeoBounds,
        output_size: (u32, u32),
    ) -> Result<Option<Bytes>, RenderError>;
}

/// Opens images and derives their descriptive information.
///
/// Both methods block on file I/O and decoding; call them from a blocking
/// thread.
pub trait RasterEngine: Send + Sync + 'static {
    fn open(&self, key: &FactoryKey) -> Result<Box<dyn TileFactory>, RenderError>;

    fn describe(&self, path: &Path) -> Result<ImageInfo, RenderError>;

    /// Forget any decoded state kept for `path`.
    fn evict(&self, _path: &str) {}
}
