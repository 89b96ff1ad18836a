//! Descriptive information about a fetched image and its on-disk sidecar.
//!
//! The worker derives [`ImageInfo`] once per fetch and stores it next to the
//! image as `<image>.stats.json`. Statistics, metadata, bounds and info
//! requests are answered from that file without opening the image again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::engine::PixelType;
use crate::error::IoError;

/// Suffix appended to the image path to locate its sidecar.
pub const SIDECAR_SUFFIX: &str = ".stats.json";

/// Summary statistics of one band, in native sample units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandStatistics {
    /// 1-based band index
    pub band: u32,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u64,
    pub height: u64,
    pub band_count: u32,
    pub pixel_type: PixelType,
    pub bands: Vec<BandStatistics>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ImageInfo {
    /// Pixel-space bounds as (min_x, min_y, max_x, max_y).
    pub fn bounds(&self) -> [f64; 4] {
        [0.0, 0.0, self.width as f64, self.height as f64]
    }

    /// The `image_statistics` document served to clients.
    pub fn statistics(&self) -> ImageStatistics {
        let (w, h) = (self.width as f64, self.height as f64);
        ImageStatistics {
            geo_transform: None,
            corner_coordinates: CornerCoordinates {
                upper_left: [0.0, 0.0],
                lower_left: [0.0, h],
                lower_right: [w, h],
                upper_right: [w, 0.0],
                center: [w / 2.0, h / 2.0],
            },
            size: [self.width, self.height],
            bands: self
                .bands
                .iter()
                .map(|b| BandSummary {
                    band: b.band,
                    data_type: self.pixel_type,
                    minimum: b.min,
                    maximum: b.max,
                    mean: b.mean,
                    std_dev: b.std_dev,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatistics {
    /// Always null for plain rasters
    pub geo_transform: Option<[f64; 6]>,
    pub corner_coordinates: CornerCoordinates,
    pub size: [u64; 2],
    pub bands: Vec<BandSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CornerCoordinates {
    pub upper_left: [f64; 2],
    pub lower_left: [f64; 2],
    pub lower_right: [f64; 2],
    pub upper_right: [f64; 2],
    pub center: [f64; 2],
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandSummary {
    pub band: u32,
    #[serde(rename = "type")]
    pub data_type: PixelType,
    pub minimum: f64,
    pub maximum: f64,
    pub mean: f64,
    pub std_dev: f64,
}

// =============================================================================
// Sidecar
// =============================================================================

pub fn sidecar_path(image_path: &Path) -> PathBuf {
    let mut name = image_path.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

pub async fn write_sidecar(image_path: &Path, info: &ImageInfo) -> Result<(), IoError> {
    let body = serde_json::to_vec_pretty(info).map_err(|e| IoError::Local(e.to_string()))?;
    tokio::fs::write(sidecar_path(image_path), body).await?;
    Ok(())
}

pub async fn read_sidecar(image_path: &Path) -> Result<ImageInfo, IoError> {
    let path = sidecar_path(image_path);
    let body = match tokio::fs::read(&path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IoError::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&body)
        .map_err(|e| IoError::Local(format!("{}: {}", path.display(), e)))
}
