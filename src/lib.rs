//! Species abundance distribution modelling
//!
//! Survey and occurrence records for one species are binned into hexagonal
//! cells, summarised per cell, matched with standardized environmental
//! rasters and fitted with a Poisson GLM. The fitted model yields response
//! curves and a predicted abundance surface.
//!
//! - `loaders/`: ICES acoustic biotic exports and OBIS occurrences
//! - `spatial/`: hex grid, raster layers, GeoTIFF IO
//! - `model/`: aggregation, covariates, GLM, partial effects, prediction
//! - `dataset`: year-partitioned Parquet cache
//! - `pipeline`: the end-to-end run

pub mod utils;
pub mod data;
pub mod spatial;
pub mod loaders;
pub mod model;
pub mod dataset;
pub mod config;
pub mod pipeline;

// Re-export commonly used types
pub use config::{DataSource, PipelineConfig};
pub use data::{observations_to_frame, Observation};
pub use model::{FittedModel, GlmError, ModelSpec, Standardization, TrainingSet};
pub use pipeline::{AbundancePipeline, RunReport};
pub use spatial::{BoundingBox, GeoPoint, Raster, RasterStack};
