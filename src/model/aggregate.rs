//! Spatial aggregation
//!
//! Bins observations into hex cells and reduces each (cell[, year]) group to
//! median weight, median abundance and record count. Undefined measurements
//! are ignored by the medians; a group with no defined value keeps a null
//! statistic so it is never mistaken for zero abundance.

use crate::data::columns;
use crate::spatial::{cell_to_point, hexgrid, point_to_cell, GeoPoint};
use crate::utils::{f64_values, require_columns};
use anyhow::{anyhow, Context, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Grouping key for aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    /// One record per cell across all years
    Cell,
    /// One record per cell and year
    #[default]
    CellYear,
}

impl GroupKey {
    fn columns(&self) -> Vec<&'static str> {
        match self {
            GroupKey::Cell => vec![columns::CELL],
            GroupKey::CellYear => vec![columns::CELL, columns::YEAR],
        }
    }
}

/// Add `cell`, `cell_longitude` and `cell_latitude` columns
///
/// Fails on the first row whose coordinates are missing or out of range.
pub fn assign_cells(df: &DataFrame, resolution: u8) -> Result<DataFrame> {
    require_columns(df, &[columns::LONGITUDE, columns::LATITUDE], "indexer")?;
    let resolution = hexgrid::resolution(resolution)?;

    let lons = f64_values(df, columns::LONGITUDE, "indexer")?;
    let lats = f64_values(df, columns::LATITUDE, "indexer")?;

    let mut cells = Vec::with_capacity(df.height());
    let mut cell_lons = Vec::with_capacity(df.height());
    let mut cell_lats = Vec::with_capacity(df.height());

    for (row, (lon, lat)) in lons.into_iter().zip(lats).enumerate() {
        let (lon, lat) = lon
            .zip(lat)
            .ok_or_else(|| anyhow!("indexer: row {} has missing coordinates", row))?;
        let cell = point_to_cell(GeoPoint::new(lon, lat), resolution)
            .with_context(|| format!("indexer: row {}", row))?;
        let centroid = cell_to_point(cell);

        cells.push(u64::from(cell));
        cell_lons.push(centroid.lon);
        cell_lats.push(centroid.lat);
    }

    let mut out = df.clone();
    out.with_column(Series::new(columns::CELL.into(), cells))?;
    out.with_column(Series::new(columns::CELL_LONGITUDE.into(), cell_lons))?;
    out.with_column(Series::new(columns::CELL_LATITUDE.into(), cell_lats))?;
    Ok(out)
}

/// Reduce indexed observations to one record per group
///
/// Output is sorted by the group key, so the same multiset of input rows
/// always gives the same table whatever its order.
pub fn aggregate(df: &DataFrame, key: GroupKey) -> Result<DataFrame> {
    require_columns(
        df,
        &[
            columns::CELL,
            columns::CELL_LONGITUDE,
            columns::CELL_LATITUDE,
            columns::YEAR,
            columns::WEIGHT,
            columns::ABUNDANCE,
        ],
        "aggregator",
    )?;

    let key_cols = key.columns();
    let key_exprs: Vec<Expr> = key_cols.iter().map(|&c| col(c)).collect();

    let aggregated = df
        .clone()
        .lazy()
        .with_columns([
            col(columns::WEIGHT).cast(DataType::Float64),
            col(columns::ABUNDANCE).cast(DataType::Float64),
        ])
        .group_by(key_exprs)
        .agg([
            col(columns::CELL_LONGITUDE).first(),
            col(columns::CELL_LATITUDE).first(),
            col(columns::WEIGHT).median().alias(columns::MEDIAN_WEIGHT),
            col(columns::ABUNDANCE).median().alias(columns::MEDIAN_ABUNDANCE),
            len().cast(DataType::UInt32).alias(columns::N_RECORDS),
        ])
        .sort(key_cols.clone(), SortMultipleOptions::default())
        .collect()
        .with_context(|| format!("aggregator: group by {:?} failed", key_cols))?;

    info!(
        "Aggregated {} observations into {} groups by {:?}",
        df.height(),
        aggregated.height(),
        key
    );

    Ok(aggregated)
}
