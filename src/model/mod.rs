//! Abundance model
//!
//! From indexed observations to a fitted distribution surface:
//! - `aggregate`: hex-cell medians per cell (and year)
//! - `covariates`: standardized raster sampling and training-set exclusion
//! - `glm`: Poisson GLM with a quadratic covariate
//! - `partial_effects`: one-dimensional response curves
//! - `prediction`: model applied to the covariate rasters

pub mod aggregate;
pub mod covariates;
pub mod glm;
pub mod partial_effects;
pub mod prediction;

pub use aggregate::{aggregate, assign_cells, GroupKey};
pub use covariates::{
    extract_covariates, prepare_training_set, ExclusionReport, OutlierPolicy, Standardization,
    TrainingRecord, TrainingSet,
};
pub use glm::{
    fit_poisson, CountCoercion, CovariateSummary, FitOptions, FittedModel, GlmError, ModelSpec, Term,
};
pub use partial_effects::{curves_to_frame, partial_curves, CurvePoint, PartialCurve};
pub use prediction::{observation_extent, predict_surface, surface_to_frame};
