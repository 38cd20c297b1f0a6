//! Raster Layers
//!
//! North-up regular lon/lat grids holding one environmental variable each.
//! Undefined cells (nodata, land, outside coverage) are `None` and stay
//! undefined through every transform.

use super::{BoundingBox, GeoPoint};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors raised while reading or combining rasters
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(String),

    #[error("Missing geotransform: {0}")]
    MissingGeotransform(String),

    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("Layer '{name}' has {actual} values, grid expects {expected}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Layer '{name}' is not co-registered with the stack")]
    NotCoRegistered { name: String },

    #[error("Layer '{0}' not found in raster stack")]
    MissingLayer(String),

    #[error("Crop extent {0:?} does not overlap the raster")]
    EmptyCrop(BoundingBox),

    #[error("Layer '{name}' cannot be standardized: {reason}")]
    Degenerate { name: String, reason: String },

    #[error("Invalid time axis: {0}")]
    TimeAxis(String),

    #[cfg(feature = "netcdf")]
    #[error("NetCDF error: {0}")]
    NetCdf(#[from] netcdf::Error),
}

impl From<tiff::TiffError> for RasterError {
    fn from(e: tiff::TiffError) -> Self {
        RasterError::Tiff(e.to_string())
    }
}

/// Geometry of a north-up grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    /// Western edge (longitude of column 0 left edge)
    pub west: f64,
    /// Northern edge (latitude of row 0 top edge)
    pub north: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub width: usize,
    pub height: usize,
}

impl GridSpec {
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn east(&self) -> f64 {
        self.west + self.width as f64 * self.pixel_width
    }

    pub fn south(&self) -> f64 {
        self.north - self.height as f64 * self.pixel_height
    }

    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(self.west, self.south(), self.east(), self.north)
    }

    /// Row/column of the pixel containing `point` (nearest-cell lookup)
    pub fn index_of(&self, point: &GeoPoint) -> Option<(usize, usize)> {
        if self.is_empty() || !self.bbox().contains(point) {
            return None;
        }
        let col = ((point.lon - self.west) / self.pixel_width).floor() as usize;
        let row = ((self.north - point.lat) / self.pixel_height).floor() as usize;
        // Points on the east/south edge belong to the last pixel
        Some((row.min(self.height - 1), col.min(self.width - 1)))
    }

    pub fn cell_center(&self, row: usize, col: usize) -> GeoPoint {
        GeoPoint::new(
            self.west + (col as f64 + 0.5) * self.pixel_width,
            self.north - (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Pixel window intersecting `bbox`: (row0, col0, sub-grid)
    ///
    /// A box touching the grid only along a pixel edge (or a zero-area box)
    /// still selects the pixel it touches.
    fn window(&self, bbox: &BoundingBox) -> Option<(usize, usize, GridSpec)> {
        let extent = self.bbox();
        if self.is_empty()
            || bbox.max_lon < extent.min_lon
            || bbox.min_lon > extent.max_lon
            || bbox.max_lat < extent.min_lat
            || bbox.min_lat > extent.max_lat
        {
            return None;
        }

        let col0 = (((bbox.min_lon - self.west) / self.pixel_width).floor().max(0.0) as usize)
            .min(self.width - 1);
        let col1 = (((bbox.max_lon - self.west) / self.pixel_width).ceil().max(0.0) as usize)
            .max(col0 + 1)
            .min(self.width);
        let row0 = (((self.north - bbox.max_lat) / self.pixel_height).floor().max(0.0) as usize)
            .min(self.height - 1);
        let row1 = (((self.north - bbox.min_lat) / self.pixel_height).ceil().max(0.0) as usize)
            .max(row0 + 1)
            .min(self.height);

        Some((
            row0,
            col0,
            GridSpec {
                west: self.west + col0 as f64 * self.pixel_width,
                north: self.north - row0 as f64 * self.pixel_height,
                pixel_width: self.pixel_width,
                pixel_height: self.pixel_height,
                width: col1 - col0,
                height: row1 - row0,
            },
        ))
    }

    fn same_geometry(&self, other: &GridSpec) -> bool {
        const EPS: f64 = 1e-9;
        self.width == other.width
            && self.height == other.height
            && (self.west - other.west).abs() < EPS
            && (self.north - other.north).abs() < EPS
            && (self.pixel_width - other.pixel_width).abs() < EPS
            && (self.pixel_height - other.pixel_height).abs() < EPS
    }
}

/// Mean and standard deviation of a layer over its full extent
///
/// Computed once and reapplied unchanged at prediction time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub mean: f64,
    pub sd: f64,
}

impl LayerStats {
    pub fn apply(&self, raw: f64) -> f64 {
        (raw - self.mean) / self.sd
    }

    pub fn invert(&self, standardized: f64) -> f64 {
        standardized * self.sd + self.mean
    }
}

/// Single-variable raster layer
#[derive(Debug, Clone)]
pub struct Raster {
    pub name: String,
    pub grid: GridSpec,
    values: Vec<Option<f64>>,
}

impl Raster {
    /// Build a layer from row-major values (row 0 = north)
    pub fn new(name: &str, grid: GridSpec, values: Vec<Option<f64>>) -> Result<Self, RasterError> {
        if values.len() != grid.len() {
            return Err(RasterError::ShapeMismatch {
                name: name.to_string(),
                expected: grid.len(),
                actual: values.len(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            grid,
            values,
        })
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.grid.height || col >= self.grid.width {
            return None;
        }
        self.values[row * self.grid.width + col]
    }

    /// Nearest-cell sample; `None` outside coverage or at undefined cells
    pub fn value_at(&self, point: &GeoPoint) -> Option<f64> {
        let (row, col) = self.grid.index_of(point)?;
        self.get(row, col)
    }

    pub fn defined_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Mean and sample standard deviation over all defined cells
    pub fn stats(&self) -> Result<LayerStats, RasterError> {
        let defined: Vec<f64> = self.values.iter().flatten().copied().collect();
        let degenerate = |reason: &str| RasterError::Degenerate {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if defined.len() < 2 {
            return Err(degenerate("fewer than 2 defined cells"));
        }

        let n = defined.len() as f64;
        let mean = defined.iter().sum::<f64>() / n;
        let var = defined.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let sd = var.sqrt();

        if !sd.is_finite() || sd == 0.0 {
            return Err(degenerate("zero or non-finite standard deviation"));
        }

        Ok(LayerStats { mean, sd })
    }

    /// Apply `f` to every defined cell
    pub fn map<F: Fn(f64) -> f64>(&self, f: F) -> Raster {
        Raster {
            name: self.name.clone(),
            grid: self.grid,
            values: self.values.iter().map(|v| v.map(&f)).collect(),
        }
    }

    pub fn standardize(&self, stats: &LayerStats) -> Raster {
        self.map(|v| stats.apply(v))
    }

    /// Restrict to the pixels intersecting `bbox`
    pub fn crop(&self, bbox: &BoundingBox) -> Result<Raster, RasterError> {
        let (row0, col0, grid) = self
            .grid
            .window(bbox)
            .ok_or(RasterError::EmptyCrop(*bbox))?;

        let mut values = Vec::with_capacity(grid.len());
        for row in row0..row0 + grid.height {
            let start = row * self.grid.width + col0;
            values.extend_from_slice(&self.values[start..start + grid.width]);
        }

        Ok(Raster {
            name: self.name.clone(),
            grid,
            values,
        })
    }
}

/// Co-registered set of named layers
#[derive(Debug, Clone, Default)]
pub struct RasterStack {
    layers: Vec<Raster>,
}

impl RasterStack {
    pub fn new(layers: Vec<Raster>) -> Result<Self, RasterError> {
        let mut stack = RasterStack::default();
        for layer in layers {
            stack.push(layer)?;
        }
        Ok(stack)
    }

    /// Add a layer; it must share the stack's grid
    pub fn push(&mut self, layer: Raster) -> Result<(), RasterError> {
        if let Some(first) = self.layers.first() {
            if !first.grid.same_geometry(&layer.grid) {
                return Err(RasterError::NotCoRegistered { name: layer.name });
            }
        }
        self.layers.push(layer);
        Ok(())
    }

    /// Read `<dir>/<name>.tif` for each name, in order
    pub fn load_dir(dir: &Path, names: &[String]) -> Result<Self, RasterError> {
        let mut stack = RasterStack::default();
        for name in names {
            let path = dir.join(format!("{}.tif", name));
            if !path.exists() {
                return Err(RasterError::MissingLayer(format!("{} ({})", name, path.display())));
            }
            let layer = super::geotiff::read_geotiff(&path, name)?;
            debug!(
                "Loaded layer {} ({}x{}, {} defined cells)",
                name,
                layer.grid.width,
                layer.grid.height,
                layer.defined_count()
            );
            stack.push(layer)?;
        }
        Ok(stack)
    }

    pub fn layers(&self) -> &[Raster] {
        &self.layers
    }

    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn grid(&self) -> Option<GridSpec> {
        self.layers.first().map(|l| l.grid)
    }

    pub fn get(&self, name: &str) -> Result<&Raster, RasterError> {
        self.layers
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| RasterError::MissingLayer(name.to_string()))
    }

    /// Exactly the named layers, in the given order
    pub fn select(&self, names: &[String]) -> Result<RasterStack, RasterError> {
        let layers = names
            .iter()
            .map(|n| self.get(n).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RasterStack { layers })
    }

    pub fn crop(&self, bbox: &BoundingBox) -> Result<RasterStack, RasterError> {
        let layers = self
            .layers
            .iter()
            .map(|l| l.crop(bbox))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RasterStack { layers })
    }
}
