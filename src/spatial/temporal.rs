//! Temporal layer summaries
//!
//! Derives Bio-ORACLE style layers from a time series of co-registered
//! slices (e.g. daily sea temperature): per-cell maximum, minimum and the
//! mean annual range. Undefined samples are skipped; a cell with no defined
//! sample stays undefined.
//!
//! Series arrive as a `GridCube` (flat `[time][lat][lon]` values with their
//! coordinate axes, as stored in Copernicus NetCDF products) and the derived
//! layers are written as `<var>_max.tif`, `<var>_min.tif` and
//! `<var>_range.tif` next to the other covariate rasters.

use super::geotiff::write_geotiff;
use super::raster::{GridSpec, Raster, RasterError, RasterStack};
use crate::utils::mean;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// One time slice of a variable
#[derive(Debug, Clone)]
pub struct TimeSlice {
    pub year: i32,
    pub raster: Raster,
}

fn check_slices(slices: &[&Raster]) -> Result<(), RasterError> {
    // Co-registration is enforced by the stack
    RasterStack::new(slices.iter().map(|r| (*r).clone()).collect())?;
    Ok(())
}

/// Fold defined values cell by cell
fn reduce_cells<F>(name: &str, slices: &[&Raster], fold: F) -> Result<Raster, RasterError>
where
    F: Fn(f64, f64) -> f64,
{
    let first = slices.first().ok_or_else(|| RasterError::Degenerate {
        name: name.to_string(),
        reason: "no time slices".to_string(),
    })?;
    check_slices(slices)?;

    let values = (0..first.grid.len())
        .map(|i| {
            slices
                .iter()
                .filter_map(|s| s.values()[i])
                .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| fold(a, v))))
        })
        .collect();

    Raster::new(name, first.grid, values)
}

/// Per-cell maximum across all slices
pub fn temporal_max(name: &str, slices: &[TimeSlice]) -> Result<Raster, RasterError> {
    let rasters: Vec<&Raster> = slices.iter().map(|s| &s.raster).collect();
    reduce_cells(name, &rasters, f64::max)
}

/// Per-cell minimum across all slices
pub fn temporal_min(name: &str, slices: &[TimeSlice]) -> Result<Raster, RasterError> {
    let rasters: Vec<&Raster> = slices.iter().map(|s| &s.raster).collect();
    reduce_cells(name, &rasters, f64::min)
}

/// Mean over years of |max − min| within each year
pub fn mean_annual_range(name: &str, slices: &[TimeSlice]) -> Result<Raster, RasterError> {
    let mut by_year: BTreeMap<i32, Vec<&Raster>> = BTreeMap::new();
    for s in slices {
        by_year.entry(s.year).or_default().push(&s.raster);
    }

    let mut ranges = Vec::with_capacity(by_year.len());
    for year_slices in by_year.values() {
        let max = reduce_cells(name, year_slices, f64::max)?;
        let min = reduce_cells(name, year_slices, f64::min)?;
        let values = max
            .values()
            .iter()
            .zip(min.values())
            .map(|(hi, lo)| match (hi, lo) {
                (Some(hi), Some(lo)) => Some((hi - lo).abs()),
                _ => None,
            })
            .collect();
        ranges.push(Raster::new(name, max.grid, values)?);
    }

    let refs: Vec<&Raster> = ranges.iter().collect();
    let first = refs.first().ok_or_else(|| RasterError::Degenerate {
        name: name.to_string(),
        reason: "no time slices".to_string(),
    })?;

    let values = (0..first.grid.len())
        .map(|i| {
            let per_year: Vec<Option<f64>> = refs.iter().map(|r| r.values()[i]).collect();
            mean(&per_year)
        })
        .collect();

    Raster::new(name, first.grid, values)
}

/// Calendar year of each CF time value (`<unit> since <reference>`)
pub fn cf_time_years(units: &str, values: &[f64]) -> Result<Vec<i32>, RasterError> {
    let (unit, reference) = units
        .split_once(" since ")
        .ok_or_else(|| RasterError::TimeAxis(format!("units '{}' lack 'since'", units)))?;

    let seconds_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
        "days" | "day" | "d" => 86_400.0,
        "hours" | "hour" | "h" => 3_600.0,
        "minutes" | "minute" | "min" => 60.0,
        "seconds" | "second" | "s" => 1.0,
        other => return Err(RasterError::TimeAxis(format!("unsupported time unit '{}'", other))),
    };

    let reference = reference.trim().trim_end_matches('Z');
    let origin = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(reference, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(reference, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| RasterError::TimeAxis(format!("unparsable reference date '{}'", reference)))?;

    values
        .iter()
        .map(|&v| {
            if !v.is_finite() {
                return Err(RasterError::TimeAxis(format!("non-finite time value {}", v)));
            }
            let offset = Duration::try_seconds((v * seconds_per_unit).round() as i64)
                .ok_or_else(|| RasterError::TimeAxis(format!("time value {} out of range", v)))?;
            origin
                .checked_add_signed(offset)
                .map(|t| t.year())
                .ok_or_else(|| RasterError::TimeAxis(format!("time value {} out of range", v)))
        })
        .collect()
}

/// Gridded time series as read from a NetCDF product
///
/// `values` is the flat `[time][lat][lon]` cube. Axes may run in either
/// direction; non-finite samples are undefined.
#[derive(Debug, Clone)]
pub struct GridCube {
    pub name: String,
    pub lon: Vec<f64>,
    pub lat: Vec<f64>,
    pub years: Vec<i32>,
    pub values: Vec<f64>,
}

/// Cell size of a regular axis from its end points
fn axis_step(name: &str, axis: &[f64]) -> Result<f64, RasterError> {
    let degenerate = |reason: &str| RasterError::Degenerate {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    match axis {
        [] | [_] => Err(degenerate("coordinate axis needs at least two points")),
        [first, .., last] => {
            let step = (last - first).abs() / (axis.len() - 1) as f64;
            if step.is_finite() && step > 0.0 {
                Ok(step)
            } else {
                Err(degenerate("coordinate axis is not strictly monotonic"))
            }
        }
    }
}

impl GridCube {
    /// North-up grid covering the cube's cell centres
    pub fn grid(&self) -> Result<GridSpec, RasterError> {
        let pixel_width = axis_step(&self.name, &self.lon)?;
        let pixel_height = axis_step(&self.name, &self.lat)?;
        let west = self.lon.iter().copied().fold(f64::INFINITY, f64::min) - pixel_width / 2.0;
        let north = self.lat.iter().copied().fold(f64::NEG_INFINITY, f64::max) + pixel_height / 2.0;

        Ok(GridSpec {
            west,
            north,
            pixel_width,
            pixel_height,
            width: self.lon.len(),
            height: self.lat.len(),
        })
    }

    /// Split into one north-up raster per time step
    pub fn into_slices(self) -> Result<Vec<TimeSlice>, RasterError> {
        let grid = self.grid()?;
        let plane = grid.len();
        let expected = plane * self.years.len();
        if self.values.len() != expected {
            return Err(RasterError::ShapeMismatch {
                name: self.name,
                expected,
                actual: self.values.len(),
            });
        }

        let lat_ascending = self.lat.first() < self.lat.last();
        let lon_descending = self.lon.first() > self.lon.last();

        self.years
            .iter()
            .enumerate()
            .map(|(t, &year)| {
                let step = &self.values[t * plane..(t + 1) * plane];
                let mut values = vec![None; plane];
                for j in 0..grid.height {
                    let row = if lat_ascending { grid.height - 1 - j } else { j };
                    for i in 0..grid.width {
                        let col = if lon_descending { grid.width - 1 - i } else { i };
                        let v = step[j * grid.width + i];
                        values[row * grid.width + col] = v.is_finite().then_some(v);
                    }
                }
                Ok(TimeSlice {
                    year,
                    raster: Raster::new(&self.name, grid, values)?,
                })
            })
            .collect()
    }
}

/// Write the max, min and mean annual range layers of `var`
///
/// Output names follow the covariate naming used by the raster stack, so the
/// files load with `RasterStack::load_dir(out_dir, ["<var>_max", ...])`.
pub fn derive_layers(var: &str, slices: &[TimeSlice], out_dir: &Path) -> Result<Vec<PathBuf>, RasterError> {
    fs::create_dir_all(out_dir)?;

    let layers = [
        temporal_max(&format!("{}_max", var), slices)?,
        temporal_min(&format!("{}_min", var), slices)?,
        mean_annual_range(&format!("{}_range", var), slices)?,
    ];

    let mut paths = Vec::with_capacity(layers.len());
    for layer in &layers {
        let path = out_dir.join(format!("{}.tif", layer.name));
        write_geotiff(layer, &path)?;
        info!(
            "Wrote {} ({} defined cells) to {}",
            layer.name,
            layer.defined_count(),
            path.display()
        );
        paths.push(path);
    }
    Ok(paths)
}
