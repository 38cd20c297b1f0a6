//! NetCDF time series reader
//!
//! Loads one variable of a Copernicus Marine product (daily or monthly
//! fields on a regular lon/lat grid) into a `GridCube`. Variables with an
//! extra depth dimension contribute their first level only.

use super::raster::RasterError;
use super::temporal::{cf_time_years, GridCube};
use std::path::Path;
use tracing::{debug, info};

/// Read the first coordinate variable found under any of `names`
fn read_coord(file: &netcdf::File, names: &[&str]) -> Result<Vec<f64>, RasterError> {
    for name in names {
        if let Some(var) = file.variable(name) {
            let data: Vec<f64> = var.get_values(..)?;
            return Ok(data);
        }
    }
    Err(RasterError::MissingLayer(names.join(" or ")))
}

fn numeric_attribute(var: &netcdf::Variable, name: &str) -> Option<f64> {
    var.attribute_value(name)
        .and_then(|r| r.ok())
        .and_then(|v| match v {
            netcdf::AttributeValue::Double(d) => Some(d),
            netcdf::AttributeValue::Float(f) => Some(f as f64),
            netcdf::AttributeValue::Short(s) => Some(s as f64),
            netcdf::AttributeValue::Int(i) => Some(i as f64),
            _ => None,
        })
}

/// Load `variable` with its lon/lat/time axes
///
/// Packed values are unpacked with `scale_factor`/`add_offset`; `_FillValue`
/// and `missing_value` samples become NaN (undefined cells downstream).
pub fn read_time_series(path: &Path, variable: &str) -> Result<GridCube, RasterError> {
    let file = netcdf::open(path)?;

    let lon = read_coord(&file, &["longitude", "lon"])?;
    let lat = read_coord(&file, &["latitude", "lat"])?;

    let time_var = file
        .variable("time")
        .ok_or_else(|| RasterError::MissingLayer("time".to_string()))?;
    let time: Vec<f64> = time_var.get_values(..)?;
    let units = match time_var.attribute_value("units").and_then(|r| r.ok()) {
        Some(netcdf::AttributeValue::Str(s)) => s,
        _ => return Err(RasterError::TimeAxis("time variable has no units".to_string())),
    };
    let years = cf_time_years(&units, &time)?;

    let var = file
        .variable(variable)
        .ok_or_else(|| RasterError::MissingLayer(format!("{} ({})", variable, path.display())))?;
    let dims: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
    debug!("{}: dimensions {:?}", variable, dims);

    let scale = numeric_attribute(&var, "scale_factor").unwrap_or(1.0);
    let offset = numeric_attribute(&var, "add_offset").unwrap_or(0.0);
    let fill = numeric_attribute(&var, "_FillValue");
    let missing = numeric_attribute(&var, "missing_value");

    let raw: Vec<f64> = var.get_values(..)?;

    let plane = lon.len() * lat.len();
    let n_time = years.len();
    if n_time == 0 || plane == 0 || raw.len() % (n_time * plane) != 0 {
        return Err(RasterError::ShapeMismatch {
            name: variable.to_string(),
            expected: n_time * plane,
            actual: raw.len(),
        });
    }
    // Extra (depth) levels between time and lat: keep the first
    let per_step = raw.len() / n_time;

    let is_fill = |v: f64| {
        [fill, missing]
            .iter()
            .flatten()
            .any(|f| (v - f).abs() <= f.abs() * 1e-6)
    };

    let mut values = Vec::with_capacity(n_time * plane);
    for t in 0..n_time {
        let start = t * per_step;
        values.extend(raw[start..start + plane].iter().map(|&v| {
            if !v.is_finite() || is_fill(v) {
                f64::NAN
            } else {
                v * scale + offset
            }
        }));
    }

    info!(
        "Read {} from {}: {} time steps on a {}x{} grid ({}..{})",
        variable,
        path.display(),
        n_time,
        lon.len(),
        lat.len(),
        years.first().copied().unwrap_or_default(),
        years.last().copied().unwrap_or_default()
    );

    Ok(GridCube {
        name: variable.to_string(),
        lon,
        lat,
        years,
        values,
    })
}
