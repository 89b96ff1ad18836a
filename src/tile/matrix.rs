//! Tile addressing: power-of-two pixel pyramids and OGC tile matrix sets.

use serde::Serialize;

use crate::error::TileError;

/// Half the width of the Web Mercator world extent in metres.
pub const WEB_MERCATOR_EXTENT: f64 = 20_037_508.342_789_244;

/// Deepest matrix or pyramid level accepted.
pub const MAX_TILE_MATRIX: i64 = 30;

/// Edge length of tiles in the built-in tile matrix sets.
pub const MAP_TILE_SIZE: u32 = 256;

// =============================================================================
// Pixel Pyramid
// =============================================================================

/// A rectangle of source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub x: u64,
    pub y: u64,
    pub width: u64,
    pub height: u64,
}

/// Resolve the source window for pyramid tile (`z`, `x`, `y`).
///
/// The window edge is `tile_size * 2^z` and its origin is the tile column
/// and row scaled by that edge. Level 0 is full resolution.
pub fn pixel_window(tile_size: u32, z: i64, x: i64, y: i64) -> Result<PixelWindow, TileError> {
    if z < 0 {
        return Err(TileError::invalid(format!(
            "Resolution Level for get tile request must be >= 0. Requested z={}",
            z
        )));
    }
    if z > MAX_TILE_MATRIX {
        return Err(TileError::invalid(format!(
            "Resolution Level must be <= {}. Requested z={}",
            MAX_TILE_MATRIX, z
        )));
    }
    if x < 0 || y < 0 {
        return Err(TileError::invalid(format!(
            "Tile coordinates must be >= 0. Requested x={}, y={}",
            x, y
        )));
    }
    if tile_size == 0 {
        return Err(TileError::invalid("tile size must be greater than 0"));
    }

    let overflow = || TileError::invalid(format!("tile {}/{}/{} is out of range", z, x, y));
    let edge = u64::from(tile_size)
        .checked_mul(1u64 << z)
        .ok_or_else(overflow)?;
    let origin_x = (x as u64).checked_mul(edge).ok_or_else(overflow)?;
    let origin_y = (y as u64).checked_mul(edge).ok_or_else(overflow)?;

    Ok(PixelWindow {
        x: origin_x,
        y: origin_y,
        width: edge,
        height: edge,
    })
}

/// Convert a row index between top-left and bottom-left origin conventions.
pub fn invert_tile_row(tile_row: i64, tile_matrix: i64) -> Result<i64, TileError> {
    if !(0..=MAX_TILE_MATRIX).contains(&tile_matrix) {
        return Err(TileError::invalid(format!(
            "tile matrix must be between 0 and {}. Requested {}",
            MAX_TILE_MATRIX, tile_matrix
        )));
    }
    Ok((1i64 << tile_matrix) - 1 - tile_row)
}

// =============================================================================
// Tile Matrix Sets
// =============================================================================

/// Geographic bounds of a map tile in the tile matrix set's CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// A resolved map tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapTile {
    pub tile_matrix: u32,
    pub tile_row: u32,
    pub tile_col: u32,
    pub bounds: GeoBounds,
    pub size: (u32, u32),
}

/// A quad-tree tile matrix set: every matrix doubles the previous one in
/// both directions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMatrixSet {
    pub id: &'static str,
    pub title: &'static str,
    pub crs: &'static str,
    /// Extent of matrix 0 as (min_x, min_y, max_x, max_y)
    pub bounding_box: [f64; 4],
    /// Columns and rows of matrix 0
    pub matrix_zero_size: (u32, u32),
    pub tile_size: u32,
}

impl TileMatrixSet {
    pub fn web_mercator_quad() -> Self {
        Self {
            id: "WebMercatorQuad",
            title: "Google Maps Compatible for the World",
            crs: "http://www.opengis.net/def/crs/EPSG/0/3857",
            bounding_box: [
                -WEB_MERCATOR_EXTENT,
                -WEB_MERCATOR_EXTENT,
                WEB_MERCATOR_EXTENT,
                WEB_MERCATOR_EXTENT,
            ],
            matrix_zero_size: (1, 1),
            tile_size: MAP_TILE_SIZE,
        }
    }

    pub fn world_crs84_quad() -> Self {
        Self {
            id: "WorldCRS84Quad",
            title: "CRS84 for the World",
            crs: "http://www.opengis.net/def/crs/OGC/1.3/CRS84",
            bounding_box: [-180.0, -90.0, 180.0, 90.0],
            matrix_zero_size: (2, 1),
            tile_size: MAP_TILE_SIZE,
        }
    }

    /// Columns and rows of `tile_matrix`.
    pub fn matrix_size(&self, tile_matrix: u32) -> (u64, u64) {
        let scale = 1u64 << tile_matrix;
        (
            u64::from(self.matrix_zero_size.0) * scale,
            u64::from(self.matrix_zero_size.1) * scale,
        )
    }

    /// Resolve the bounds and pixel size of a tile, validating its address.
    pub fn tile(&self, tile_matrix: i64, tile_row: i64, tile_col: i64) -> Result<MapTile, TileError> {
        if !(0..=MAX_TILE_MATRIX).contains(&tile_matrix) {
            return Err(TileError::invalid(format!(
                "tile matrix must be between 0 and {}. Requested {}",
                MAX_TILE_MATRIX, tile_matrix
            )));
        }
        let matrix = tile_matrix as u32;
        let (cols, rows) = self.matrix_size(matrix);
        if tile_row < 0 || tile_col < 0 || tile_row as u64 >= rows || tile_col as u64 >= cols {
            return Err(TileError::invalid(format!(
                "tile ({}, {}) is outside matrix {} of {} ({} rows, {} columns)",
                tile_row, tile_col, tile_matrix, self.id, rows, cols
            )));
        }

        let [min_x, _, _, max_y] = self.bounding_box;
        let span_x = (self.bounding_box[2] - min_x) / cols as f64;
        let span_y = (max_y - self.bounding_box[1]) / rows as f64;

        let left = min_x + tile_col as f64 * span_x;
        let top = max_y - tile_row as f64 * span_y;

        Ok(MapTile {
            tile_matrix: matrix,
            tile_row: tile_row as u32,
            tile_col: tile_col as u32,
            bounds: GeoBounds {
                min_x: left,
                min_y: top - span_y,
                max_x: left + span_x,
                max_y: top,
            },
            size: (self.tile_size, self.tile_size),
        })
    }
}

/// The tile matrix sets this server can render into.
#[derive(Debug, Clone)]
pub struct TileMatrixSetRegistry {
    sets: Vec<TileMatrixSet>,
}

impl TileMatrixSetRegistry {
    pub fn new() -> Self {
        Self {
            sets: vec![
                TileMatrixSet::web_mercator_quad(),
                TileMatrixSet::world_crs84_quad(),
            ],
        }
    }

    pub fn get(&self, id: &str) -> Result<&TileMatrixSet, TileError> {
        self.sets
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| TileError::UnknownTileMatrixSet { id: id.to_string() })
    }

    pub fn iter(&self) -> impl Iterator<Item = &TileMatrixSet> {
        self.sets.iter()
    }
}

impl Default for TileMatrixSetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
