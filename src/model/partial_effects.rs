//! Partial-effect curves
//!
//! Each curve sweeps one covariate across its training range while every
//! other covariate is held at its training mean, and reports the predicted
//! abundance. This is a one-dimensional slice through the fitted surface,
//! not a marginal effect averaged over the joint covariate distribution.

use super::covariates::Standardization;
use super::glm::{FittedModel, GlmError};
use crate::utils::linspace;
use anyhow::Result;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CURVE_POINTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    /// Focal covariate on the standardized scale
    pub x: f64,
    pub response: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialCurve {
    pub covariate: String,
    pub points: Vec<CurvePoint>,
}

/// One curve per covariate, in model order
///
/// The squared term follows its covariate, so the quadratic covariate gets a
/// single curvilinear curve rather than a separate one for the square.
pub fn partial_curves(model: &FittedModel, n_points: usize) -> Result<Vec<PartialCurve>, GlmError> {
    let means: Vec<f64> = model.covariate_summaries.iter().map(|s| s.mean).collect();

    model
        .covariate_summaries
        .iter()
        .enumerate()
        .map(|(focal, summary)| {
            let mut x = means.clone();
            let points = linspace(summary.min, summary.max, n_points)
                .into_iter()
                .map(|value| {
                    x[focal] = value;
                    Ok(CurvePoint {
                        x: value,
                        response: model.predict_response(&x)?,
                    })
                })
                .collect::<Result<Vec<_>, GlmError>>()?;

            Ok(PartialCurve {
                covariate: summary.name.clone(),
                points,
            })
        })
        .collect()
}

/// Long-format table (covariate, x, response) for plotting
///
/// With standardization parameters an `x_original` column maps each sweep
/// value back to the layer's own units.
pub fn curves_to_frame(
    curves: &[PartialCurve],
    standardization: Option<&Standardization>,
) -> Result<DataFrame> {
    let mut names = Vec::new();
    let mut xs = Vec::new();
    let mut originals: Vec<Option<f64>> = Vec::new();
    let mut responses = Vec::new();

    for curve in curves {
        let stats = standardization.and_then(|s| s.get(&curve.covariate).ok());
        for point in &curve.points {
            names.push(curve.covariate.clone());
            xs.push(point.x);
            originals.push(stats.map(|s| s.invert(point.x)));
            responses.push(point.response);
        }
    }

    let df = df![
        "covariate" => names,
        "x" => xs,
        "x_original" => originals,
        "response" => responses,
    ]?;
    Ok(df)
}
