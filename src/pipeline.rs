//! Abundance pipeline - main coordinator
//!
//! Runs the stages in order, each consuming the previous stage's output:
//! load → index → aggregate → extract covariates → fit → partial effects and
//! spatial prediction. Every stage runs once per invocation; intermediate
//! tables and the fitted model are written to the output directory.

use crate::config::{DataSource, PipelineConfig};
use crate::data::{columns, frame_points, observations_to_frame};
use crate::dataset::{read_partitioned, write_csv, write_partitioned};
use crate::loaders::{load_survey_folder, observations_from_response};
use crate::model::{
    aggregate, assign_cells, curves_to_frame, extract_covariates, fit_poisson,
    observation_extent, partial_curves, predict_surface, prepare_training_set, surface_to_frame,
    ExclusionReport, FittedModel, Standardization,
};
use crate::spatial::geotiff::write_geotiff;
use crate::spatial::RasterStack;
use crate::utils::{filter_to_species, materialize_with_columns};
use anyhow::{Context, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Headline numbers of a fitted model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub formula: String,
    /// (term, estimate, std. error)
    pub coefficients: Vec<(String, f64, f64)>,
    pub deviance: f64,
    pub null_deviance: f64,
    pub aic: f64,
    pub iterations: usize,
    pub n_obs: usize,
}

impl From<&FittedModel> for ModelSummary {
    fn from(model: &FittedModel) -> Self {
        Self {
            formula: model.formula.clone(),
            coefficients: model.coefficient_table(),
            deviance: model.deviance,
            null_deviance: model.null_deviance,
            aic: model.aic,
            iterations: model.iterations,
            n_obs: model.n_obs,
        }
    }
}

/// What a run did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub observations: usize,
    pub outside_study_area: usize,
    pub aggregated_records: usize,
    pub exclusions: Option<ExclusionReport>,
    pub model: Option<ModelSummary>,
    pub predicted_pixels: Option<usize>,
    pub outputs: Vec<PathBuf>,
}

pub struct AbundancePipeline {
    config: PipelineConfig,
}

impl AbundancePipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Load observations from the configured source, restricted to the
    /// analysed species and the study area
    pub fn load_observations(&self) -> Result<DataFrame> {
        let config = &self.config;

        let df = match config.source {
            DataSource::IcesBiotic => {
                let observations = load_survey_folder(&config.survey_dir, config.bad_file_policy)?;
                let df = observations_to_frame(&observations)?;
                if config.write_dataset && df.height() > 0 {
                    write_partitioned(&df, &config.dataset_dir)?;
                }
                df
            }
            DataSource::Partitioned => {
                let df = read_partitioned(&config.dataset_dir, None)?;
                if df.width() == 0 {
                    observations_to_frame(&[])?
                } else {
                    materialize_with_columns(df.lazy(), &columns::OBSERVATION, "partitioned dataset")?
                }
            }
            DataSource::Obis => {
                let path = config
                    .obis_response
                    .as_deref()
                    .context("source 'obis' needs obis_response")?;
                let json = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read OBIS response {}", path.display()))?;
                let taxon = config.species_codes.first().map(String::as_str).unwrap_or_default();
                observations_to_frame(&observations_from_response(
                    &json,
                    &config.qualifying_types,
                    taxon,
                )?)?
            }
        };

        filter_to_species(&df, &config.species_codes, columns::SPECIES_CODE, "pipeline")
    }

    /// Drop rows outside the study area; rows without coordinates are kept so
    /// the indexer reports them
    fn restrict_to_study_area(&self, df: &DataFrame) -> Result<(DataFrame, usize)> {
        let area = self.config.study_area;
        let mask: BooleanChunked = frame_points(df)?
            .into_iter()
            .map(|p| p.map_or(true, |p| area.contains(&p)))
            .collect();
        let kept = df.filter(&mask)?;
        let dropped = df.height() - kept.height();
        if dropped > 0 {
            warn!("{} observations outside the study area {:?}", dropped, area);
        }
        Ok((kept, dropped))
    }

    /// Full run: load observations and rasters from disk, then model
    pub fn run(&self) -> Result<RunReport> {
        let start = Instant::now();
        let observations = self.load_observations()?;

        if observations.height() == 0 {
            info!("No observations for species {:?}; nothing to model", self.config.species_codes);
            return Ok(RunReport::default());
        }

        let stack = RasterStack::load_dir(&self.config.raster_dir, &self.config.covariates)
            .with_context(|| format!("Failed to load rasters from {}", self.config.raster_dir.display()))?;

        let report = self.run_on(&observations, &stack)?;
        info!("Pipeline finished in {:.2}s", start.elapsed().as_secs_f64());
        Ok(report)
    }

    /// Model already loaded observations against a raster stack
    pub fn run_on(&self, observations: &DataFrame, stack: &RasterStack) -> Result<RunReport> {
        let config = &self.config;
        let out_dir = &config.output_dir;
        fs::create_dir_all(out_dir)
            .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;

        let mut report = RunReport {
            observations: observations.height(),
            ..Default::default()
        };

        let (observations, outside) = self.restrict_to_study_area(observations)?;
        report.outside_study_area = outside;
        if observations.height() == 0 {
            info!("No observations inside the study area; nothing to model");
            return Ok(report);
        }

        // Index and aggregate
        let indexed = assign_cells(&observations, config.hex_resolution)?;
        let aggregated = aggregate(&indexed, config.group_key)?;
        report.aggregated_records = aggregated.height();
        report.outputs.push(self.write_table(&aggregated, "aggregated.csv")?);

        // Covariates, standardized over the full raster extent
        let standardization = Standardization::from_stack(stack)?;
        let std_path = out_dir.join("standardization.json");
        standardization.save(&std_path)?;
        report.outputs.push(std_path);

        let with_covariates =
            extract_covariates(&aggregated, stack, &standardization, &config.covariates)?;
        let (training, exclusions) =
            prepare_training_set(&with_covariates, &config.covariates, config.outlier)?;
        report.exclusions = Some(exclusions);
        report.outputs.push(self.write_table(&training.to_frame()?, "training.csv")?);

        // Fit; an empty training set ends the run here
        let spec = config.model_spec()?;
        let model = fit_poisson(&training, &spec, &config.fit)?;
        for (term, estimate, se) in model.coefficient_table() {
            info!("  {:<24} {:>12.6} ({:.6})", term, estimate, se);
        }
        let model_path = out_dir.join("model.json");
        fs::write(&model_path, serde_json::to_string_pretty(&model)?)
            .with_context(|| format!("Failed to write {}", model_path.display()))?;
        report.outputs.push(model_path);
        report.model = Some(ModelSummary::from(&model));

        // Partial effects
        let curves = partial_curves(&model, config.curve_points)?;
        let curve_table = curves_to_frame(&curves, Some(&standardization))?;
        report.outputs.push(self.write_table(&curve_table, "partial_effects.csv")?);

        // Spatial prediction over the observation extent
        if let Some(extent) = observation_extent(&observations)? {
            let surface = predict_surface(&model, stack, &standardization, &extent)?;
            report.predicted_pixels = Some(surface.defined_count());

            let tif_path = out_dir.join("prediction.tif");
            write_geotiff(&surface, &tif_path)?;
            report.outputs.push(tif_path);
            report.outputs.push(self.write_table(&surface_to_frame(&surface)?, "prediction.csv")?);
        }

        let report_path = out_dir.join("run_report.json");
        report.outputs.push(report_path.clone());
        fs::write(&report_path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write {}", report_path.display()))?;

        Ok(report)
    }

    fn write_table(&self, df: &DataFrame, name: &str) -> Result<PathBuf> {
        let path: PathBuf = Path::new(&self.config.output_dir).join(name);
        write_csv(df, &path)?;
        Ok(path)
    }
}
