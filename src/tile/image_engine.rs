//! Raster engine backed by the `image` crate.
//!
//! Every tile goes through the same steps:
//!
//! ```text
//! source window ──► crop visible part ──► resample ──► pad to tile ──► encode
//! ```
//!
//! Windows that run past the right or bottom edge are padded with zero
//! samples. MINMAX and DRA stretches are computed over the whole image at
//! open time so neighbouring tiles share one transfer function.
//!
//! Handles render from a decoded raster shared by every handle on the same
//! image and range adjustment. The engine keeps recently used rasters in an
//! LRU bounded in bytes.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{
    ColorType, DynamicImage, GenericImageView, ImageBuffer, ImageFormat, ImageReader, Pixel,
};
use lru::LruCache;
use tracing::debug;

use super::engine::{FactoryKey, PixelType, RasterEngine, TileFactory};
use super::format::{Compression, TileFormat};
use super::info::{BandStatistics, ImageInfo};
use super::matrix::{GeoBounds, PixelWindow};
use crate::error::RenderError;
use crate::viewpoint::RangeAdjustment;

/// Default JPEG quality for encoded tiles.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Lower and upper percentiles used by the DRA stretch.
const DRA_PERCENTILES: (f64, f64) = (0.02, 0.98);

/// Upper bound on samples per band used to estimate percentiles.
const MAX_PERCENTILE_SAMPLES: usize = 1 << 20;

// =============================================================================
// Engine
// =============================================================================

/// Default bound on decoded rasters retained between handle opens, in bytes.
pub const DEFAULT_RASTER_CACHE_BYTES: usize = 512 * 1024 * 1024;

/// Decoded rasters are shared per image and range adjustment; the output
/// format and compression of a handle do not change the pixels it reads.
type RasterKey = (Arc<str>, RangeAdjustment);

/// Counters describing the decoded rasters held by an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RasterCacheStats {
    /// Images decoded since the engine was created
    pub decodes: u64,
    /// Rasters retained by the LRU
    pub resident: usize,
    pub resident_bytes: usize,
}

/// Decoded rasters, retained by an LRU bounded in bytes.
///
/// `live` also tracks rasters the LRU has let go of while handles still hold
/// them, so an image is never decoded twice while a copy is alive.
struct RasterCache {
    retained: LruCache<RasterKey, Arc<DynamicImage>>,
    live: HashMap<RasterKey, Weak<DynamicImage>>,
    bytes: usize,
    capacity: usize,
    decodes: u64,
}

impl RasterCache {
    fn new(capacity: usize) -> Self {
        Self {
            retained: LruCache::unbounded(),
            live: HashMap::new(),
            bytes: 0,
            capacity,
            decodes: 0,
        }
    }

    fn get(&mut self, key: &RasterKey) -> Option<Arc<DynamicImage>> {
        if let Some(image) = self.retained.get(key) {
            return Some(image.clone());
        }
        self.live.get(key).and_then(Weak::upgrade)
    }

    fn insert(&mut self, key: RasterKey, image: Arc<DynamicImage>) {
        self.decodes += 1;
        self.live.retain(|_, raster| raster.strong_count() > 0);
        self.live.insert(key.clone(), Arc::downgrade(&image));

        let size = image.as_bytes().len();
        if size > self.capacity {
            return;
        }
        while self.bytes + size > self.capacity {
            match self.retained.pop_lru() {
                Some((_, evicted)) => self.bytes -= evicted.as_bytes().len(),
                None => break,
            }
        }
        if let Some(previous) = self.retained.put(key, image) {
            self.bytes -= previous.as_bytes().len();
        }
        self.bytes += size;
    }

    fn evict(&mut self, path: &str) -> usize {
        let keys: Vec<RasterKey> = self
            .retained
            .iter()
            .filter(|((p, _), _)| p.as_ref() == path)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            if let Some(image) = self.retained.pop(key) {
                self.bytes -= image.as_bytes().len();
            }
        }
        self.live.retain(|(p, _), _| p.as_ref() != path);
        keys.len()
    }
}

/// Engine rendering tiles from images the `image` crate can decode.
///
/// Cloning is cheap; clones share decoded rasters.
#[derive(Clone)]
pub struct ImageRasterEngine {
    jpeg_quality: u8,
    rasters: Arc<Mutex<RasterCache>>,
}

impl ImageRasterEngine {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_JPEG_QUALITY, DEFAULT_RASTER_CACHE_BYTES)
    }

    pub fn with_jpeg_quality(quality: u8) -> Self {
        Self::with_options(quality, DEFAULT_RASTER_CACHE_BYTES)
    }

    pub fn with_raster_capacity(capacity_bytes: usize) -> Self {
        Self::with_options(DEFAULT_JPEG_QUALITY, capacity_bytes)
    }

    pub fn with_options(quality: u8, raster_capacity_bytes: usize) -> Self {
        Self {
            jpeg_quality: quality.clamp(1, 100),
            rasters: Arc::new(Mutex::new(RasterCache::new(raster_capacity_bytes))),
        }
    }

    pub fn raster_stats(&self) -> RasterCacheStats {
        let rasters = lock(&self.rasters);
        RasterCacheStats {
            decodes: rasters.decodes,
            resident: rasters.retained.len(),
            resident_bytes: rasters.bytes,
        }
    }

    /// The decoded, range-adjusted pixels of `path`, shared with every
    /// other handle on the same image and adjustment.
    fn raster(
        &self,
        path: &Arc<str>,
        adjustment: RangeAdjustment,
    ) -> Result<Arc<DynamicImage>, RenderError> {
        let key = (path.clone(), adjustment);
        if let Some(image) = lock(&self.rasters).get(&key) {
            return Ok(image);
        }

        // Decode without holding the lock; a concurrent miss may decode twice
        let (image, _) = decode(Path::new(path.as_ref()))?;
        let image = match adjustment {
            RangeAdjustment::None => image,
            adjustment => stretch(&image, adjustment)?,
        };
        let image = Arc::new(image);

        debug!(
            path = %path,
            adjustment = adjustment.as_str(),
            bytes = image.as_bytes().len(),
            "Decoded raster"
        );
        lock(&self.rasters).insert(key, image.clone());
        Ok(image)
    }
}

impl Default for ImageRasterEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RasterEngine for ImageRasterEngine {
    fn open(&self, key: &FactoryKey) -> Result<Box<dyn TileFactory>, RenderError> {
        let image = self.raster(&key.path, key.range_adjustment)?;

        Ok(Box::new(ImageTileFactory {
            path: key.path.clone(),
            image,
            format: key.format,
            compression: key.compression,
            jpeg_quality: self.jpeg_quality,
        }))
    }

    fn evict(&self, path: &str) {
        let evicted = lock(&self.rasters).evict(path);
        if evicted > 0 {
            debug!(path, evicted, "Dropped decoded rasters");
        }
    }

    fn describe(&self, path: &Path) -> Result<ImageInfo, RenderError> {
        let (image, format) = decode(path)?;
        let color = image.color();
        let pixel_type = pixel_type_of(color);
        let (samples, channels) = normalized_samples(&image);
        let scale = pixel_type.max_value();

        let bands = (0..channels)
            .map(|band| {
                let mut stats = band_statistics(&samples, channels, band);
                stats.band = band as u32 + 1;
                stats.min *= scale;
                stats.max *= scale;
                stats.mean *= scale;
                stats.std_dev *= scale;
                stats
            })
            .collect();

        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("color_type".to_string(), format!("{:?}", color));
        metadata.insert(
            "bits_per_sample".to_string(),
            (color.bits_per_pixel() / u16::from(color.channel_count())).to_string(),
        );
        if let Some(format) = format {
            metadata.insert("format".to_string(), format!("{:?}", format));
        }

        Ok(ImageInfo {
            width: u64::from(image.width()),
            height: u64::from(image.height()),
            band_count: channels as u32,
            pixel_type,
            bands,
            metadata,
        })
    }
}

fn decode(path: &Path) -> Result<(DynamicImage, Option<ImageFormat>), RenderError> {
    let unreadable = |message: String| RenderError::Unreadable {
        path: path.display().to_string(),
        message,
    };

    let reader = ImageReader::open(path)
        .map_err(|e| unreadable(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| unreadable(e.to_string()))?;
    let format = reader.format();
    let image = reader.decode().map_err(|e| unreadable(e.to_string()))?;
    Ok((image, format))
}

fn pixel_type_of(color: ColorType) -> PixelType {
    match color {
        ColorType::L16 | ColorType::La16 | ColorType::Rgb16 | ColorType::Rgba16 => {
            PixelType::UInt16
        }
        ColorType::Rgb32F | ColorType::Rgba32F => PixelType::Float32,
        _ => PixelType::Byte,
    }
}

// =============================================================================
// Statistics and Stretch
// =============================================================================

/// Interleaved samples normalised to `[0, 1]` for integer types, and the
/// number of channels per pixel.
fn normalized_samples(image: &DynamicImage) -> (Vec<f32>, usize) {
    match image.color().channel_count() {
        1 => (image.to_luma32f().into_raw(), 1),
        2 => (image.to_luma_alpha32f().into_raw(), 2),
        3 => (image.to_rgb32f().into_raw(), 3),
        _ => (image.to_rgba32f().into_raw(), 4),
    }
}

fn band_statistics(samples: &[f32], channels: usize, band: usize) -> BandStatistics {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut count = 0usize;

    for &v in samples.iter().skip(band).step_by(channels) {
        let v = f64::from(v);
        min = min.min(v);
        max = max.max(v);
        sum += v;
        sum_sq += v * v;
        count += 1;
    }

    if count == 0 {
        return BandStatistics {
            band: 0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            std_dev: 0.0,
        };
    }

    let mean = sum / count as f64;
    let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
    BandStatistics {
        band: 0,
        min,
        max,
        mean,
        std_dev: variance.sqrt(),
    }
}

/// Estimate the given percentiles of one band from a strided subsample.
fn band_percentiles(samples: &[f32], channels: usize, band: usize, (lo, hi): (f64, f64)) -> (f64, f64) {
    let pixels = samples.len() / channels;
    let step = (pixels / MAX_PERCENTILE_SAMPLES).max(1);
    let mut values: Vec<f32> = samples
        .iter()
        .skip(band)
        .step_by(channels * step)
        .copied()
        .collect();
    if values.is_empty() {
        return (0.0, 0.0);
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let at = |p: f64| f64::from(values[((values.len() - 1) as f64 * p).round() as usize]);
    (at(lo), at(hi))
}

/// Linearly map every colour band into 8-bit using the image-wide range the
/// adjustment selects. Alpha is rescaled without stretching.
fn stretch(image: &DynamicImage, adjustment: RangeAdjustment) -> Result<DynamicImage, RenderError> {
    let color = image.color();
    let (samples, channels) = normalized_samples(image);
    let colour_bands = if color.has_alpha() { channels - 1 } else { channels };

    let ranges: Vec<(f64, f64)> = (0..channels)
        .map(|band| {
            if band >= colour_bands {
                return (0.0, 1.0);
            }
            match adjustment {
                RangeAdjustment::Dra => band_percentiles(&samples, channels, band, DRA_PERCENTILES),
                _ => {
                    let stats = band_statistics(&samples, channels, band);
                    (stats.min, stats.max)
                }
            }
        })
        .collect();

    let bytes: Vec<u8> = samples
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let (lo, hi) = ranges[i % channels];
            let span = hi - lo;
            let scaled = if span > f64::EPSILON {
                (f64::from(v) - lo) / span
            } else {
                0.0
            };
            (scaled.clamp(0.0, 1.0) * 255.0).round() as u8
        })
        .collect();

    let (width, height) = image.dimensions();
    let mismatch = || RenderError::Encode("stretched buffer size mismatch".to_string());
    let stretched = match channels {
        1 => DynamicImage::ImageLuma8(ImageBuffer::from_raw(width, height, bytes).ok_or_else(mismatch)?),
        2 => DynamicImage::ImageLumaA8(ImageBuffer::from_raw(width, height, bytes).ok_or_else(mismatch)?),
        3 => DynamicImage::ImageRgb8(ImageBuffer::from_raw(width, height, bytes).ok_or_else(mismatch)?),
        _ => DynamicImage::ImageRgba8(ImageBuffer::from_raw(width, height, bytes).ok_or_else(mismatch)?),
    };
    Ok(stretched)
}

// =============================================================================
// Factory
// =============================================================================

struct ImageTileFactory {
    path: Arc<str>,
    image: Arc<DynamicImage>,
    format: TileFormat,
    compression: Compression,
    jpeg_quality: u8,
}

impl ImageTileFactory {
    fn check_output(&self) -> Result<(), RenderError> {
        if self.format.supports(self.compression) {
            Ok(())
        } else {
            Err(RenderError::Unsupported(format!(
                "{} tiles with {} compression",
                self.format, self.compression
            )))
        }
    }

    fn encode(&self, tile: DynamicImage) -> Result<Bytes, RenderError> {
        let encode_err = |e: image::ImageError| RenderError::Encode(e.to_string());
        let mut buf = Vec::new();

        match self.format {
            TileFormat::Png => {
                let tile = match tile {
                    DynamicImage::ImageRgb32F(_) => DynamicImage::ImageRgb16(tile.to_rgb16()),
                    DynamicImage::ImageRgba32F(_) => DynamicImage::ImageRgba16(tile.to_rgba16()),
                    other => other,
                };
                tile.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
                    .map_err(encode_err)?;
            }
            TileFormat::Jpeg => {
                let tile = if tile.color().channel_count() >= 3 {
                    DynamicImage::ImageRgb8(tile.to_rgb8())
                } else {
                    DynamicImage::ImageLuma8(tile.to_luma8())
                };
                let encoder = JpegEncoder::new_with_quality(&mut buf, self.jpeg_quality);
                tile.write_with_encoder(encoder).map_err(encode_err)?;
            }
            TileFormat::Gtiff => {
                let tile = match tile {
                    DynamicImage::ImageLumaA8(_) => DynamicImage::ImageRgba8(tile.to_rgba8()),
                    DynamicImage::ImageLumaA16(_) => DynamicImage::ImageRgba16(tile.to_rgba16()),
                    other => other,
                };
                tile.write_to(&mut Cursor::new(&mut buf), ImageFormat::Tiff)
                    .map_err(encode_err)?;
            }
        }

        Ok(Bytes::from(buf))
    }
}

impl TileFactory for ImageTileFactory {
    fn create_encoded_tile(
        &mut self,
        window: PixelWindow,
        (out_w, out_h): (u32, u32),
    ) -> Result<Option<Bytes>, RenderError> {
        self.check_output()?;

        let (width, height) = (u64::from(self.image.width()), u64::from(self.image.height()));
        if window.width == 0 || window.height == 0 || window.x >= width || window.y >= height {
            return Ok(None);
        }

        let visible_w = window.width.min(width - window.x);
        let visible_h = window.height.min(height - window.y);

        // Both fit in u32 because they are bounded by the image dimensions
        let cropped = self.image.crop_imm(
            window.x as u32,
            window.y as u32,
            visible_w as u32,
            visible_h as u32,
        );

        let scaled_w = scaled_extent(visible_w, window.width, out_w);
        let scaled_h = scaled_extent(visible_h, window.height, out_h);
        let resized = cropped.resize_exact(scaled_w, scaled_h, FilterType::Triangle);

        let tile = if (scaled_w, scaled_h) == (out_w, out_h) {
            resized
        } else {
            pad(resized, out_w, out_h)
        };

        tracing::trace!(path = %self.path, ?window, out_w, out_h, "Rendered tile");
        self.encode(tile).map(Some)
    }

    fn create_orthophoto_tile(
        &mut self,
        _bounds: &GeoBounds,
        _output_size: (u32, u32),
    ) -> Result<Option<Bytes>, RenderError> {
        self.check_output()?;
        Ok(None)
    }
}

/// Output pixels covered by `visible` source pixels out of a `full` window.
fn scaled_extent(visible: u64, full: u64, out: u32) -> u32 {
    let scaled = (visible as f64 * f64::from(out) / full as f64).round() as u32;
    scaled.clamp(1, out)
}

/// Place `image` at the top-left of a zeroed `width` x `height` canvas of the
/// same pixel type.
fn pad(image: DynamicImage, width: u32, height: u32) -> DynamicImage {
    fn onto_canvas<P: Pixel>(
        src: &ImageBuffer<P, Vec<P::Subpixel>>,
        width: u32,
        height: u32,
    ) -> ImageBuffer<P, Vec<P::Subpixel>> {
        let mut canvas = ImageBuffer::new(width, height);
        imageops::replace(&mut canvas, src, 0, 0);
        canvas
    }

    match image {
        DynamicImage::ImageLuma8(b) => DynamicImage::ImageLuma8(onto_canvas(&b, width, height)),
        DynamicImage::ImageLumaA8(b) => DynamicImage::ImageLumaA8(onto_canvas(&b, width, height)),
        DynamicImage::ImageRgb8(b) => DynamicImage::ImageRgb8(onto_canvas(&b, width, height)),
        DynamicImage::ImageRgba8(b) => DynamicImage::ImageRgba8(onto_canvas(&b, width, height)),
        DynamicImage::ImageLuma16(b) => DynamicImage::ImageLuma16(onto_canvas(&b, width, height)),
        DynamicImage::ImageLumaA16(b) => DynamicImage::ImageLumaA16(onto_canvas(&b, width, height)),
        DynamicImage::ImageRgb16(b) => DynamicImage::ImageRgb16(onto_canvas(&b, width, height)),
        DynamicImage::ImageRgba16(b) => DynamicImage::ImageRgba16(onto_canvas(&b, width, height)),
        DynamicImage::ImageRgb32F(b) => DynamicImage::ImageRgb32F(onto_canvas(&b, width, height)),
        DynamicImage::ImageRgba32F(b) => DynamicImage::ImageRgba32F(onto_canvas(&b, width, height)),
        other => DynamicImage::ImageRgba8(onto_canvas(&other.to_rgba8(), width, height)),
    }
}
