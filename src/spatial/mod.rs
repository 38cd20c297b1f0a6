//! Spatial primitives
//!
//! Geographic points and extents, the hexagonal grid index used to bin
//! observations, and the raster layers sampled for environmental covariates.
//! - `hexgrid`: point ↔ hex cell mapping (H3, fixed resolution)
//! - `raster`: co-registered grids with nearest-cell lookup and standardization
//! - `geotiff`: GeoTIFF reader for raster layers
//! - `temporal`: per-cell summaries across a time series of slices
//! - `netcdf_series`: Copernicus NetCDF reader (feature `netcdf`)

pub mod hexgrid;
pub mod raster;
pub mod geotiff;
pub mod temporal;
#[cfg(feature = "netcdf")]
pub mod netcdf_series;

pub use hexgrid::{cell_from_u64, cell_to_point, geodesic_m, point_to_cell, IndexError};
pub use raster::{GridSpec, LayerStats, Raster, RasterError, RasterStack};

use serde::{Deserialize, Serialize};

/// Geographic point in WGS84 degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Midpoint of two positions in coordinate space (haul centre)
    pub fn midpoint(&self, other: &GeoPoint) -> GeoPoint {
        GeoPoint {
            lon: (self.lon + other.lon) / 2.0,
            lat: (self.lat + other.lat) / 2.0,
        }
    }
}

/// Longitude/latitude bounding box (inclusive edges)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.lon >= self.min_lon
            && point.lon <= self.max_lon
            && point.lat >= self.min_lat
            && point.lat <= self.max_lat
    }

    /// Smallest box covering all points, `None` for an empty iterator
    pub fn from_points<I: IntoIterator<Item = GeoPoint>>(points: I) -> Option<Self> {
        let mut bbox: Option<BoundingBox> = None;
        for p in points {
            bbox = Some(match bbox {
                None => BoundingBox::new(p.lon, p.lat, p.lon, p.lat),
                Some(b) => BoundingBox::new(
                    b.min_lon.min(p.lon),
                    b.min_lat.min(p.lat),
                    b.max_lon.max(p.lon),
                    b.max_lat.max(p.lat),
                ),
            });
        }
        bbox
    }
}
