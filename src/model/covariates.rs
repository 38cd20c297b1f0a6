//! Covariate Extraction
//!
//! Samples standardized environmental layers at aggregated cell centroids and
//! turns the result into a training set. Standardization parameters are
//! computed once over each full layer and kept, so the surface prediction
//! transforms rasters with exactly the same mean and sd as the training data.

use crate::data::columns;
use crate::spatial::{cell_from_u64, cell_to_point, GeoPoint, LayerStats, RasterError, RasterStack};
use crate::utils::{f64_values, quantile, require_columns};
use anyhow::{Context, Result};
use ndarray::Array2;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Per-layer standardization parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    layers: BTreeMap<String, LayerStats>,
}

impl Standardization {
    /// Mean and sample sd of every layer over its full extent
    pub fn from_stack(stack: &RasterStack) -> Result<Self, RasterError> {
        let mut layers = BTreeMap::new();
        for layer in stack.layers() {
            let stats = layer.stats()?;
            info!(
                "Layer {}: mean {:.4}, sd {:.4} over {} cells",
                layer.name,
                stats.mean,
                stats.sd,
                layer.defined_count()
            );
            layers.insert(layer.name.clone(), stats);
        }
        Ok(Self { layers })
    }

    pub fn get(&self, name: &str) -> Result<LayerStats, RasterError> {
        self.layers
            .get(name)
            .copied()
            .ok_or_else(|| RasterError::MissingLayer(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(|k| k.as_str())
    }

    /// Standardize the named layers of `stack`, in the given order
    pub fn apply(&self, stack: &RasterStack, names: &[String]) -> Result<RasterStack, RasterError> {
        let layers = names
            .iter()
            .map(|name| Ok(stack.get(name)?.standardize(&self.get(name)?)))
            .collect::<Result<Vec<_>, RasterError>>()?;
        RasterStack::new(layers)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write standardization to {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read standardization from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse standardization JSON: {}", path.display()))
    }
}

/// Centroid of each aggregated record
///
/// Uses the centroid columns when present, otherwise decodes the `cell` column.
fn sample_points(aggregated: &DataFrame) -> Result<Vec<Option<GeoPoint>>> {
    if require_columns(aggregated, &[columns::CELL_LONGITUDE, columns::CELL_LATITUDE], "extractor").is_ok() {
        let lons = f64_values(aggregated, columns::CELL_LONGITUDE, "extractor")?;
        let lats = f64_values(aggregated, columns::CELL_LATITUDE, "extractor")?;
        return Ok(lons
            .into_iter()
            .zip(lats)
            .map(|(lon, lat)| Some(GeoPoint::new(lon?, lat?)))
            .collect());
    }

    let cells = aggregated
        .column(columns::CELL)
        .with_context(|| "extractor: Need cell centroids or a cell column")?
        .cast(&DataType::UInt64)?;
    let points = cells
        .u64()?
        .into_iter()
        .map(|raw| -> Result<Option<GeoPoint>> {
            raw.map(|raw| Ok(cell_to_point(cell_from_u64(raw)?))).transpose()
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(points)
}

/// Sample standardized covariates at each aggregated cell centroid
///
/// Adds one column per name. Centroids outside a layer's coverage, or on an
/// undefined pixel, get a null for that layer.
pub fn extract_covariates(
    aggregated: &DataFrame,
    stack: &RasterStack,
    standardization: &Standardization,
    names: &[String],
) -> Result<DataFrame> {
    let points = sample_points(aggregated)?;

    let mut out = aggregated.clone();
    for name in names {
        let layer = stack.get(name)?;
        let stats = standardization.get(name)?;

        let values: Vec<Option<f64>> = points
            .iter()
            .map(|p| p.and_then(|p| layer.value_at(&p)).map(|v| stats.apply(v)))
            .collect();

        let undefined = values.iter().filter(|v| v.is_none()).count();
        if undefined > 0 {
            warn!("Covariate {}: {} of {} cells undefined", name, undefined, values.len());
        }

        out.with_column(Series::new(name.as_str().into(), values))
            .with_context(|| format!("extractor: Failed to add covariate column '{}'", name))?;
    }

    Ok(out)
}

/// Exclusion of extreme abundances before fitting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierPolicy {
    /// Keep every record
    KeepAll,
    /// Drop records whose abundance is strictly above this quantile
    UpperQuantile(f64),
}

impl Default for OutlierPolicy {
    fn default() -> Self {
        OutlierPolicy::UpperQuantile(0.99)
    }
}

/// One aggregated cell ready for fitting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub cell: Option<u64>,
    pub point: Option<GeoPoint>,
    pub year: Option<i32>,
    pub abundance: f64,
    /// Standardized values, in training set covariate order
    pub covariates: Vec<f64>,
}

/// Complete-case records with their covariate names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSet {
    pub covariates: Vec<String>,
    pub records: Vec<TrainingRecord>,
}

impl TrainingSet {
    /// Build from bare covariate rows (no cell or year attached)
    pub fn from_rows(covariates: Vec<String>, rows: Vec<Vec<f64>>, abundance: Vec<f64>) -> Self {
        let records = rows
            .into_iter()
            .zip(abundance)
            .map(|(covariates, abundance)| TrainingRecord {
                cell: None,
                point: None,
                year: None,
                abundance,
                covariates,
            })
            .collect();
        Self { covariates, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Covariate matrix, one row per record
    pub fn matrix(&self) -> Array2<f64> {
        let k = self.covariates.len();
        Array2::from_shape_fn((self.records.len(), k), |(i, j)| {
            self.records[i].covariates.get(j).copied().unwrap_or(f64::NAN)
        })
    }

    pub fn abundance(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.abundance).collect()
    }

    /// Table of the fitted records, kept next to the model as its training reference
    pub fn to_frame(&self) -> Result<DataFrame> {
        let mut df = df![
            columns::CELL => self.records.iter().map(|r| r.cell).collect::<Vec<_>>(),
            columns::CELL_LONGITUDE => self.records.iter().map(|r| r.point.map(|p| p.lon)).collect::<Vec<_>>(),
            columns::CELL_LATITUDE => self.records.iter().map(|r| r.point.map(|p| p.lat)).collect::<Vec<_>>(),
            columns::YEAR => self.records.iter().map(|r| r.year).collect::<Vec<_>>(),
            columns::MEDIAN_ABUNDANCE => self.abundance(),
        ]?;
        for (j, name) in self.covariates.iter().enumerate() {
            let values: Vec<f64> = self
                .records
                .iter()
                .map(|r| r.covariates.get(j).copied().unwrap_or(f64::NAN))
                .collect();
            df.with_column(Series::new(name.as_str().into(), values))?;
        }
        Ok(df)
    }
}

/// How many aggregated records were dropped, and why
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExclusionReport {
    pub input_records: usize,
    pub missing_abundance: usize,
    pub missing_covariate: usize,
    pub outliers: usize,
    pub outlier_threshold: Option<f64>,
    pub retained: usize,
}

/// Apply the exclusion policy and collect complete-case training records
///
/// Records are dropped, in order, for an undefined abundance, for any
/// undefined covariate, and finally for an abundance above the outlier
/// quantile of the remaining records.
pub fn prepare_training_set(
    df: &DataFrame,
    names: &[String],
    policy: OutlierPolicy,
) -> Result<(TrainingSet, ExclusionReport)> {
    require_columns(df, &[columns::MEDIAN_ABUNDANCE], "training set")?;

    let n = df.height();
    let abundance = f64_values(df, columns::MEDIAN_ABUNDANCE, "training set")?;
    let covariates = names
        .iter()
        .map(|name| f64_values(df, name, "training set"))
        .collect::<Result<Vec<_>>>()?;

    let cells: Vec<Option<u64>> = match df.column(columns::CELL) {
        Ok(c) => c.cast(&DataType::UInt64)?.u64()?.into_iter().collect(),
        Err(_) => vec![None; n],
    };
    let years: Vec<Option<i32>> = match df.column(columns::YEAR) {
        Ok(c) => c.cast(&DataType::Int32)?.i32()?.into_iter().collect(),
        Err(_) => vec![None; n],
    };
    let points: Vec<Option<GeoPoint>> = match (
        f64_values(df, columns::CELL_LONGITUDE, "training set"),
        f64_values(df, columns::CELL_LATITUDE, "training set"),
    ) {
        (Ok(lons), Ok(lats)) => lons
            .into_iter()
            .zip(lats)
            .map(|(lon, lat)| Some(GeoPoint::new(lon?, lat?)))
            .collect(),
        _ => vec![None; n],
    };

    let mut report = ExclusionReport {
        input_records: n,
        ..Default::default()
    };

    let mut candidates = Vec::with_capacity(n);
    for i in 0..n {
        let Some(value) = abundance[i] else {
            report.missing_abundance += 1;
            continue;
        };
        let row: Option<Vec<f64>> = covariates.iter().map(|c| c[i]).collect();
        let Some(row) = row else {
            report.missing_covariate += 1;
            continue;
        };
        candidates.push(TrainingRecord {
            cell: cells[i],
            point: points[i],
            year: years[i],
            abundance: value,
            covariates: row,
        });
    }

    if let OutlierPolicy::UpperQuantile(p) = policy {
        let values: Vec<Option<f64>> = candidates.iter().map(|r| Some(r.abundance)).collect();
        if let Some(threshold) = quantile(&values, p) {
            let before = candidates.len();
            candidates.retain(|r| r.abundance <= threshold);
            report.outliers = before - candidates.len();
            report.outlier_threshold = Some(threshold);
        }
    }

    report.retained = candidates.len();
    info!(
        "Training set: {} of {} records kept ({} missing abundance, {} missing covariate, {} above {:?})",
        report.retained,
        report.input_records,
        report.missing_abundance,
        report.missing_covariate,
        report.outliers,
        report.outlier_threshold
    );

    Ok((
        TrainingSet {
            covariates: names.to_vec(),
            records: candidates,
        },
        report,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::{GridSpec, Raster};
    use approx::assert_relative_eq;

    fn grid() -> GridSpec {
        GridSpec {
            west: -5.0,
            north: 45.0,
            pixel_width: 1.0,
            pixel_height: 1.0,
            width: 3,
            height: 2,
        }
    }

    fn stack() -> RasterStack {
        let temp = Raster::new(
            "thetao_mean",
            grid(),
            vec![Some(10.0), Some(12.0), Some(14.0), Some(11.0), None, Some(15.0)],
        )
        .unwrap();
        let depth = Raster::new(
            "bathymetry",
            grid(),
            vec![Some(100.0), Some(200.0), Some(300.0), Some(400.0), Some(500.0), Some(600.0)],
        )
        .unwrap();
        RasterStack::new(vec![temp, depth]).unwrap()
    }

    fn names() -> Vec<String> {
        vec!["thetao_mean".to_string(), "bathymetry".to_string()]
    }

    #[test]
    fn test_standardization_round_trip() {
        let stack = stack();
        let params = Standardization::from_stack(&stack).unwrap();
        let standardized = params.apply(&stack, &names()).unwrap();

        for name in names() {
            let stats = params.get(&name).unwrap();
            let raw = stack.get(&name).unwrap();
            let scaled = standardized.get(&name).unwrap();
            for (r, s) in raw.values().iter().zip(scaled.values()) {
                match (r, s) {
                    (Some(r), Some(s)) => assert_relative_eq!(stats.invert(*s), *r, epsilon = 1e-9),
                    (None, None) => {}
                    _ => panic!("definedness changed for {}", name),
                }
            }
        }
    }

    #[test]
    fn test_standardization_json() {
        let params = Standardization::from_stack(&stack()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("standardization.json");
        params.save(&path).unwrap();
        assert_eq!(Standardization::load(&path).unwrap(), params);
    }

    #[test]
    fn test_extract_marks_uncovered_points_undefined() {
        let stack = stack();
        let params = Standardization::from_stack(&stack).unwrap();
        let aggregated = df![
            columns::CELL_LONGITUDE => &[-4.5, -3.5, 20.0],
            columns::CELL_LATITUDE => &[44.5, 43.5, 44.5],
            columns::MEDIAN_ABUNDANCE => &[1.0, 2.0, 3.0],
        ]
        .unwrap();

        let out = extract_covariates(&aggregated, &stack, &params, &names()).unwrap();
        let temp = f64_values(&out, "thetao_mean", "test").unwrap();
        let depth = f64_values(&out, "bathymetry", "test").unwrap();

        let t = params.get("thetao_mean").unwrap();
        assert_relative_eq!(temp[0].unwrap(), t.apply(10.0), epsilon = 1e-12);
        // nodata pixel
        assert_eq!(temp[1], None);
        assert!(depth[1].is_some());
        // outside coverage
        assert_eq!(temp[2], None);
        assert_eq!(depth[2], None);
    }

    #[test]
    fn test_extract_from_cell_column() {
        let stack = stack();
        let params = Standardization::from_stack(&stack).unwrap();
        let res = crate::spatial::hexgrid::resolution(7).unwrap();
        let cell = crate::spatial::point_to_cell(GeoPoint::new(-4.5, 44.5), res).unwrap();
        let aggregated = df![columns::CELL => &[u64::from(cell)]].unwrap();

        let out = extract_covariates(&aggregated, &stack, &params, &names()).unwrap();
        let depth = f64_values(&out, "bathymetry", "test").unwrap();
        let stats = params.get("bathymetry").unwrap();
        assert_relative_eq!(depth[0].unwrap(), stats.apply(100.0), epsilon = 1e-12);
    }

    #[test]
    fn test_missing_layer_is_error() {
        let stack = stack();
        let params = Standardization::from_stack(&stack).unwrap();
        let aggregated = df![
            columns::CELL_LONGITUDE => &[-4.5],
            columns::CELL_LATITUDE => &[44.5],
        ]
        .unwrap();
        let err = extract_covariates(&aggregated, &stack, &params, &["so_mean".to_string()]).unwrap_err();
        assert!(err.to_string().contains("so_mean"));
    }

    #[test]
    fn test_exclusion_report_counts_each_reason() {
        let df = df![
            columns::MEDIAN_ABUNDANCE => &[Some(1.0), None, Some(3.0), Some(4.0), Some(1000.0)],
            "thetao_mean" => &[Some(0.1), Some(0.2), None, Some(0.4), Some(0.5)],
            "bathymetry" => &[Some(1.0), Some(1.0), Some(1.0), Some(1.0), Some(1.0)],
        ]
        .unwrap();

        let (set, report) =
            prepare_training_set(&df, &names(), OutlierPolicy::UpperQuantile(0.5)).unwrap();

        assert_eq!(report.input_records, 5);
        assert_eq!(report.missing_abundance, 1);
        assert_eq!(report.missing_covariate, 1);
        // candidates [1, 4, 1000], median 4 → 1000 dropped
        assert_eq!(report.outliers, 1);
        assert_eq!(report.outlier_threshold, Some(4.0));
        assert_eq!(report.retained, 2);
        assert_eq!(set.abundance(), vec![1.0, 4.0]);
        assert_eq!(set.matrix().dim(), (2, 2));
    }

    #[test]
    fn test_upper_quantile_on_one_to_hundred() {
        let abundance: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let covariate: Vec<f64> = (1..=100).map(|v| v as f64 / 100.0).collect();
        let df = df![
            columns::MEDIAN_ABUNDANCE => abundance,
            "thetao_mean" => covariate,
        ]
        .unwrap();

        let (set, report) = prepare_training_set(
            &df,
            &["thetao_mean".to_string()],
            OutlierPolicy::default(),
        )
        .unwrap();
        assert_eq!(report.outliers, 1);
        assert_eq!(set.len(), 99);
        assert!(set.abundance().iter().all(|&a| a < 100.0));

        let (all, _) = prepare_training_set(&df, &["thetao_mean".to_string()], OutlierPolicy::KeepAll).unwrap();
        assert_eq!(all.len(), 100);

        // the excluded record moves the fit
        let spec = crate::model::ModelSpec::new(vec!["thetao_mean".to_string()], None).unwrap();
        let options = crate::model::FitOptions::default();
        let filtered = crate::model::fit_poisson(&set, &spec, &options).unwrap();
        let unfiltered = crate::model::fit_poisson(&all, &spec, &options).unwrap();
        let changed = filtered
            .coefficients
            .iter()
            .zip(&unfiltered.coefficients)
            .any(|(a, b)| (a - b).abs() > 1e-6);
        assert!(changed);
    }
}
