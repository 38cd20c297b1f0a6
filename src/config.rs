//! Pipeline configuration
//!
//! Every analysis constant lives here with its default, so a run is fully
//! described by one JSON file. Missing keys fall back to the defaults.

use crate::loaders::ices_biotic::BadFilePolicy;
use crate::loaders::obis::DEFAULT_QUALIFYING_TYPES;
use crate::model::{FitOptions, GroupKey, ModelSpec, OutlierPolicy};
use crate::spatial::BoundingBox;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Where observations come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Year folders of ICES acoustic biotic exports under `survey_dir`
    #[default]
    IcesBiotic,
    /// Year-partitioned Parquet dataset written by an earlier run
    Partitioned,
    /// Saved OBIS occurrence response at `obis_response`
    Obis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// WoRMS AphiaIDs of the analysed species
    pub species_codes: Vec<String>,
    pub source: DataSource,
    pub survey_dir: PathBuf,
    pub dataset_dir: PathBuf,
    pub obis_response: Option<PathBuf>,
    pub qualifying_types: Vec<String>,
    pub bad_file_policy: BadFilePolicy,
    /// One `<covariate>.tif` per covariate
    pub raster_dir: PathBuf,
    pub output_dir: PathBuf,
    pub hex_resolution: u8,
    pub group_key: GroupKey,
    /// Observations outside this box are dropped before indexing
    pub study_area: BoundingBox,
    pub covariates: Vec<String>,
    pub quadratic_covariate: Option<String>,
    pub outlier: OutlierPolicy,
    pub fit: FitOptions,
    pub curve_points: usize,
    pub write_dataset: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            species_codes: vec!["126417".to_string()],
            source: DataSource::IcesBiotic,
            survey_dir: PathBuf::from("data/ices_biotic"),
            dataset_dir: PathBuf::from("data/observations"),
            obis_response: None,
            qualifying_types: DEFAULT_QUALIFYING_TYPES.iter().map(|s| s.to_string()).collect(),
            bad_file_policy: BadFilePolicy::Fail,
            raster_dir: PathBuf::from("data/rasters"),
            output_dir: PathBuf::from("output"),
            hex_resolution: 7,
            group_key: GroupKey::CellYear,
            study_area: BoundingBox::new(-19.08, 26.0, 5.08, 56.08),
            covariates: ["thetao_mean", "so_mean", "o2_mean", "bathymetry"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            quadratic_covariate: Some("thetao_mean".to_string()),
            outlier: OutlierPolicy::default(),
            fit: FitOptions::default(),
            curve_points: 100,
            write_dataset: true,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a JSON config
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {:?}", path))?;

        let config: PipelineConfig = serde_json::from_str(&contents)
            .with_context(|| "Failed to parse pipeline config JSON")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.species_codes.is_empty() {
            bail!("species_codes must not be empty");
        }
        if self.hex_resolution > 15 {
            bail!("hex_resolution {} is outside 0..=15", self.hex_resolution);
        }
        if let OutlierPolicy::UpperQuantile(p) = self.outlier {
            if !(p > 0.0 && p <= 1.0) {
                bail!("outlier quantile {} is outside (0, 1]", p);
            }
        }
        if self.curve_points < 2 {
            bail!("curve_points must be at least 2");
        }
        if self.fit.max_iterations == 0 || !(self.fit.tolerance > 0.0) {
            bail!("fit needs max_iterations > 0 and a positive tolerance");
        }
        if self.source == DataSource::Obis && self.obis_response.is_none() {
            bail!("source 'obis' needs obis_response");
        }
        self.model_spec()?;
        Ok(())
    }

    pub fn model_spec(&self) -> Result<ModelSpec> {
        Ok(ModelSpec::new(self.covariates.clone(), self.quadratic_covariate.clone())?)
    }
}
