//! Observation table
//!
//! Every loader normalizes its source into one row per observation with a
//! fixed set of columns, so indexing and aggregation never depend on where
//! the rows came from.

use crate::spatial::GeoPoint;
use anyhow::{Context, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// Canonical column names of the observation and aggregated tables
pub mod columns {
    pub const YEAR: &str = "year";
    pub const SPECIES_CODE: &str = "species_code";
    pub const STATION: &str = "station";
    pub const TIMESTAMP: &str = "timestamp";
    pub const LONGITUDE: &str = "longitude";
    pub const LATITUDE: &str = "latitude";
    pub const WEIGHT: &str = "weight";
    pub const WEIGHT_UNIT: &str = "weight_unit";
    pub const MEASUREMENT_TYPE: &str = "measurement_type";
    pub const DISTANCE_M: &str = "distance_m";
    pub const ABUNDANCE: &str = "abundance";

    pub const CELL: &str = "cell";
    pub const CELL_LONGITUDE: &str = "cell_longitude";
    pub const CELL_LATITUDE: &str = "cell_latitude";
    pub const MEDIAN_WEIGHT: &str = "median_weight";
    pub const MEDIAN_ABUNDANCE: &str = "median_abundance";
    pub const N_RECORDS: &str = "n_records";

    /// Columns every observation table carries
    pub const OBSERVATION: [&str; 11] = [
        YEAR,
        SPECIES_CODE,
        STATION,
        TIMESTAMP,
        LONGITUDE,
        LATITUDE,
        WEIGHT,
        WEIGHT_UNIT,
        MEASUREMENT_TYPE,
        DISTANCE_M,
        ABUNDANCE,
    ];
}

/// One survey or occurrence record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub year: i32,
    /// WoRMS AphiaID as text
    pub species_code: String,
    pub station: Option<String>,
    /// ISO 8601 when parsable, source text otherwise
    pub timestamp: Option<String>,
    pub point: GeoPoint,
    pub weight: Option<f64>,
    pub weight_unit: Option<String>,
    pub measurement_type: String,
    /// Distance covered by the haul (survey data only)
    pub distance_m: Option<f64>,
    pub abundance: Option<f64>,
}

/// Build the canonical observation table
///
/// An empty slice yields an empty table with the full schema.
pub fn observations_to_frame(observations: &[Observation]) -> Result<DataFrame> {
    let years: Vec<i32> = observations.iter().map(|o| o.year).collect();
    let species: Vec<String> = observations.iter().map(|o| o.species_code.clone()).collect();
    let stations: Vec<Option<String>> = observations.iter().map(|o| o.station.clone()).collect();
    let timestamps: Vec<Option<String>> = observations.iter().map(|o| o.timestamp.clone()).collect();
    let lons: Vec<f64> = observations.iter().map(|o| o.point.lon).collect();
    let lats: Vec<f64> = observations.iter().map(|o| o.point.lat).collect();
    let weights: Vec<Option<f64>> = observations.iter().map(|o| o.weight).collect();
    let units: Vec<Option<String>> = observations.iter().map(|o| o.weight_unit.clone()).collect();
    let types: Vec<String> = observations.iter().map(|o| o.measurement_type.clone()).collect();
    let distances: Vec<Option<f64>> = observations.iter().map(|o| o.distance_m).collect();
    let abundances: Vec<Option<f64>> = observations.iter().map(|o| o.abundance).collect();

    df![
        columns::YEAR => years,
        columns::SPECIES_CODE => species,
        columns::STATION => stations,
        columns::TIMESTAMP => timestamps,
        columns::LONGITUDE => lons,
        columns::LATITUDE => lats,
        columns::WEIGHT => weights,
        columns::WEIGHT_UNIT => units,
        columns::MEASUREMENT_TYPE => types,
        columns::DISTANCE_M => distances,
        columns::ABUNDANCE => abundances,
    ]
    .with_context(|| format!("Failed to build observation table ({} rows)", observations.len()))
}

/// Observation points in row order (nulls and NaN → None)
pub fn frame_points(df: &DataFrame) -> Result<Vec<Option<GeoPoint>>> {
    let lons = crate::utils::f64_values(df, columns::LONGITUDE, "observations")?;
    let lats = crate::utils::f64_values(df, columns::LATITUDE, "observations")?;

    Ok(lons
        .into_iter()
        .zip(lats)
        .map(|(lon, lat)| Some(GeoPoint::new(lon?, lat?)))
        .collect())
}
