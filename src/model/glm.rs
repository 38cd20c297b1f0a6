//! Poisson GLM
//!
//! Log-link Poisson regression fitted by iteratively reweighted least
//! squares. Each iteration solves the weighted normal equations
//! `XᵀWX β = XᵀWz` with a Cholesky factorization (faer); a vanishing pivot means
//! the design matrix is rank deficient and the fit stops there.
//!
//! The linear predictor is
//! `log E[abundance] = β0 + β1·x1 + β2·x1² + β3·x2 + ...`
//! where the quadratic covariate enters both linearly and squared.

use super::covariates::TrainingSet;
use faer::linalg::solvers::{Llt, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// Failures of the fit; all terminal, none retried
#[derive(Debug, Error)]
pub enum GlmError {
    #[error("Cannot fit a model to an empty training set")]
    EmptyInput,

    #[error("Invalid model specification: {0}")]
    InvalidSpec(String),

    #[error("Training set covariates {actual:?} do not match model covariates {expected:?}")]
    CovariateMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Record {row}: abundance {value} is not a valid count")]
    InvalidResponse { row: usize, value: f64 },

    #[error("Rank-deficient design matrix at term {pivot}: {diagnostics}")]
    RankDeficient { pivot: usize, diagnostics: String },

    #[error("IRLS did not converge after {iterations} iterations (last deviance change {deviance_change:e})")]
    NotConverged {
        iterations: usize,
        deviance_change: f64,
    },

    #[error("Non-finite value during fit: {0}")]
    NonFinite(String),

    #[error("Expected {expected} covariate values, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// One column of the design matrix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    Intercept,
    Linear(String),
    Quadratic(String),
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Intercept => write!(f, "(Intercept)"),
            Term::Linear(name) => write!(f, "{}", name),
            Term::Quadratic(name) => write!(f, "I({}^2)", name),
        }
    }
}

/// Covariates entering the model, in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub covariates: Vec<String>,
    /// Covariate that also enters squared
    pub quadratic: Option<String>,
}

impl ModelSpec {
    pub fn new(covariates: Vec<String>, quadratic: Option<String>) -> Result<Self, GlmError> {
        let spec = Self { covariates, quadratic };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), GlmError> {
        if self.covariates.is_empty() {
            return Err(GlmError::InvalidSpec("no covariates".to_string()));
        }
        for (i, name) in self.covariates.iter().enumerate() {
            if self.covariates[..i].contains(name) {
                return Err(GlmError::InvalidSpec(format!("duplicate covariate '{}'", name)));
            }
        }
        if let Some(q) = &self.quadratic {
            if !self.covariates.contains(q) {
                return Err(GlmError::InvalidSpec(format!(
                    "quadratic covariate '{}' is not among the covariates",
                    q
                )));
            }
        }
        Ok(())
    }

    /// Design matrix columns: intercept, then each covariate with its square
    /// directly after it when it is the quadratic one
    pub fn terms(&self) -> Vec<Term> {
        let mut terms = vec![Term::Intercept];
        for name in &self.covariates {
            terms.push(Term::Linear(name.clone()));
            if self.quadratic.as_deref() == Some(name.as_str()) {
                terms.push(Term::Quadratic(name.clone()));
            }
        }
        terms
    }

    /// e.g. `abundance ~ thetao_mean + I(thetao_mean^2) + so_mean`
    pub fn formula(&self) -> String {
        let rhs: Vec<String> = self
            .terms()
            .iter()
            .skip(1)
            .map(|t| t.to_string())
            .collect();
        format!("abundance ~ {}", rhs.join(" + "))
    }

    /// Expand covariate values into a design row, in `terms()` order
    fn design_row(&self, x: &[f64]) -> Vec<f64> {
        let mut row = Vec::with_capacity(x.len() + 2);
        row.push(1.0);
        for (name, &v) in self.covariates.iter().zip(x) {
            row.push(v);
            if self.quadratic.as_deref() == Some(name.as_str()) {
                row.push(v * v);
            }
        }
        row
    }
}

/// Conversion of aggregated abundance to Poisson counts
///
/// Aggregated medians are usually fractional; the Poisson likelihood needs
/// non-negative integers, so this is an approximation either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountCoercion {
    /// Drop the fractional part
    #[default]
    Truncate,
    /// Round half away from zero
    Round,
}

impl CountCoercion {
    pub fn apply(&self, value: f64) -> f64 {
        match self {
            CountCoercion::Truncate => value.trunc(),
            CountCoercion::Round => value.round(),
        }
    }
}

/// IRLS settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub max_iterations: usize,
    /// Relative deviance change that counts as converged
    pub tolerance: f64,
    pub coercion: CountCoercion,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-8,
            coercion: CountCoercion::Truncate,
        }
    }
}

/// Training-scale summary of one covariate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateSummary {
    pub name: String,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// Result of a successful fit
///
/// Covariate values passed to the prediction methods are on the
/// standardized scale the model was trained on, in `spec.covariates` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub spec: ModelSpec,
    pub formula: String,
    pub terms: Vec<Term>,
    pub coefficients: Vec<f64>,
    pub std_errors: Vec<f64>,
    pub deviance: f64,
    pub null_deviance: f64,
    pub aic: f64,
    pub iterations: usize,
    pub n_obs: usize,
    pub coercion: CountCoercion,
    pub covariate_summaries: Vec<CovariateSummary>,
    pub fitted_values: Vec<f64>,
}

impl FittedModel {
    /// Linear predictor η = Xβ for one covariate vector
    pub fn predict_link(&self, x: &[f64]) -> Result<f64, GlmError> {
        if x.len() != self.spec.covariates.len() {
            return Err(GlmError::DimensionMismatch {
                expected: self.spec.covariates.len(),
                actual: x.len(),
            });
        }
        Ok(self
            .spec
            .design_row(x)
            .iter()
            .zip(&self.coefficients)
            .map(|(v, b)| v * b)
            .sum())
    }

    /// Expected abundance exp(η)
    pub fn predict_response(&self, x: &[f64]) -> Result<f64, GlmError> {
        Ok(self.predict_link(x)?.exp())
    }

    pub fn coefficient(&self, term: &Term) -> Option<f64> {
        let i = self.terms.iter().position(|t| t == term)?;
        self.coefficients.get(i).copied()
    }

    pub fn summary(&self, name: &str) -> Option<&CovariateSummary> {
        self.covariate_summaries.iter().find(|s| s.name == name)
    }

    /// Coefficient table in term order: (term, estimate, std. error)
    pub fn coefficient_table(&self) -> Vec<(String, f64, f64)> {
        self.terms
            .iter()
            .zip(&self.coefficients)
            .zip(&self.std_errors)
            .map(|((t, b), se)| (t.to_string(), *b, *se))
            .collect()
    }
}

/// Relative size below which a Cholesky pivot counts as zero
const PIVOT_TOLERANCE: f64 = 1e-10;

fn to_faer(a: &Array2<f64>) -> Mat<f64> {
    Mat::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

/// Index of the first pivot of `L` that is not clearly positive relative to
/// its diagonal entry of `a`
fn weak_pivot(a: MatRef<'_, f64>, l: MatRef<'_, f64>) -> Option<usize> {
    (0..a.nrows()).find(|&j| {
        let d = l[(j, j)] * l[(j, j)];
        !(d > PIVOT_TOLERANCE * a[(j, j)].abs().max(f64::MIN_POSITIVE))
    })
}

/// Cholesky factor of the weighted normal matrix
///
/// On failure returns the first term whose column is (numerically) a linear
/// combination of the earlier ones.
fn factor_normal_matrix(a: &Mat<f64>) -> Result<Llt<f64>, usize> {
    if let Ok(llt) = a.as_ref().llt(Side::Lower) {
        return match weak_pivot(a.as_ref(), llt.L()) {
            Some(j) => Err(j),
            None => Ok(llt),
        };
    }
    // Breakdown: the first failing leading block names the dependent term
    let n = a.nrows();
    for k in 1..=n {
        let block = a.as_ref().submatrix(0, 0, k, k);
        match block.llt(Side::Lower) {
            Ok(llt) if weak_pivot(block, llt.L()).is_none() => continue,
            _ => return Err(k - 1),
        }
    }
    Err(n.saturating_sub(1))
}

/// Solve `A x = b` with a Cholesky factor of `A`
fn solve_normal(llt: &Llt<f64>, b: &Array1<f64>) -> Array1<f64> {
    let rhs = Mat::from_fn(b.len(), 1, |i, _| b[i]);
    let x = llt.solve(&rhs);
    Array1::from_shape_fn(b.len(), |i| x[(i, 0)])
}

/// Diagonal of `A⁻¹`
fn inverse_diagonal(llt: &Llt<f64>, n: usize) -> Vec<f64> {
    let inv = llt.solve(&Mat::<f64>::identity(n, n));
    (0..n).map(|j| inv[(j, j)]).collect()
}

/// y·ln(y/μ) with the y = 0 limit
fn y_log_y_over_mu(y: f64, mu: f64) -> f64 {
    if y == 0.0 {
        0.0
    } else {
        y * (y / mu).ln()
    }
}

fn poisson_deviance(y: &Array1<f64>, mu: &Array1<f64>) -> f64 {
    2.0 * y
        .iter()
        .zip(mu.iter())
        .map(|(&y, &m)| y_log_y_over_mu(y, m) - (y - m))
        .sum::<f64>()
}

/// ln(n!) for a non-negative integer-valued `n`
fn ln_factorial(n: f64) -> f64 {
    if n < 2.0 {
        return 0.0;
    }
    if n < 256.0 {
        return (2..=n as u64).map(|k| (k as f64).ln()).sum();
    }
    // Stirling series
    n * n.ln() - n + 0.5 * (2.0 * std::f64::consts::PI * n).ln() + 1.0 / (12.0 * n)
        - 1.0 / (360.0 * n.powi(3))
}

fn poisson_log_likelihood(y: &Array1<f64>, mu: &Array1<f64>) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&y, &m)| {
            let y_ln_mu = if y == 0.0 { 0.0 } else { y * m.ln() };
            y_ln_mu - m - ln_factorial(y)
        })
        .sum()
}

fn check_finite(values: &Array1<f64>, what: &str, iteration: usize) -> Result<(), GlmError> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(i) => Err(GlmError::NonFinite(format!(
            "{} at record {} in iteration {}",
            what, i, iteration
        ))),
        None => Ok(()),
    }
}

/// Fit a log-link Poisson GLM to the training set
///
/// Abundances are coerced to counts with `options.coercion` first; a negative
/// or non-finite abundance is an error rather than being clamped.
pub fn fit_poisson(
    training: &TrainingSet,
    spec: &ModelSpec,
    options: &FitOptions,
) -> Result<FittedModel, GlmError> {
    spec.validate()?;
    if training.is_empty() {
        return Err(GlmError::EmptyInput);
    }
    if training.covariates != spec.covariates {
        return Err(GlmError::CovariateMismatch {
            expected: spec.covariates.clone(),
            actual: training.covariates.clone(),
        });
    }

    let terms = spec.terms();
    let n = training.len();
    let p = terms.len();

    let covariates = training.matrix();
    if covariates.iter().any(|v| !v.is_finite()) {
        return Err(GlmError::NonFinite("covariate matrix".to_string()));
    }

    let mut y = Array1::<f64>::zeros(n);
    for (i, record) in training.records.iter().enumerate() {
        let value = record.abundance;
        if !value.is_finite() || value < 0.0 {
            return Err(GlmError::InvalidResponse { row: i, value });
        }
        y[i] = options.coercion.apply(value);
    }

    let mut x = Array2::<f64>::zeros((n, p));
    for (i, mut row) in x.axis_iter_mut(Axis(0)).enumerate() {
        let values: Vec<f64> = covariates.row(i).to_vec();
        for (j, v) in spec.design_row(&values).into_iter().enumerate() {
            row[j] = v;
        }
    }

    // Start from the observed counts, shifted off zero
    let mut mu = y.mapv(|v| v + 0.1);
    let mut eta = mu.mapv(f64::ln);
    let mut deviance = poisson_deviance(&y, &mu);
    let mut beta = Array1::<f64>::zeros(p);
    let mut factor = None;
    let mut converged = false;
    let mut deviance_change = f64::INFINITY;
    let mut iterations = 0;

    for iteration in 1..=options.max_iterations {
        iterations = iteration;

        let z = &eta + &((&y - &mu) / &mu);
        let xw = &x * &mu.view().insert_axis(Axis(1));
        let xtwx = xw.t().dot(&x);
        let xtwz = xw.t().dot(&z);

        let llt = factor_normal_matrix(&to_faer(&xtwx)).map_err(|pivot| GlmError::RankDeficient {
            pivot,
            diagnostics: format!(
                "term {} is linearly dependent on earlier terms (iteration {})",
                terms[pivot], iteration
            ),
        })?;

        beta = solve_normal(&llt, &xtwz);
        check_finite(&beta, "coefficient", iteration)?;

        eta = x.dot(&beta);
        mu = eta.mapv(f64::exp);
        check_finite(&mu, "fitted mean", iteration)?;

        let new_deviance = poisson_deviance(&y, &mu);
        deviance_change = (new_deviance - deviance).abs() / (new_deviance.abs() + 0.1);
        deviance = new_deviance;
        factor = Some(llt);

        debug!("IRLS iteration {}: deviance {:.6}, change {:e}", iteration, deviance, deviance_change);

        if deviance_change < options.tolerance {
            converged = true;
            break;
        }
    }

    if !converged {
        return Err(GlmError::NotConverged {
            iterations,
            deviance_change,
        });
    }

    // Standard errors from the information matrix at the final fitted means
    let xw = &x * &mu.view().insert_axis(Axis(1));
    let std_errors = match factor_normal_matrix(&to_faer(&xw.t().dot(&x))) {
        Ok(llt) => inverse_diagonal(&llt, p),
        Err(_) => factor
            .as_ref()
            .map(|llt| inverse_diagonal(llt, p))
            .unwrap_or_default(),
    }
    .into_iter()
    .map(f64::sqrt)
    .collect();

    let y_mean = y.sum() / n as f64;
    let null_deviance = poisson_deviance(&y, &Array1::from_elem(n, y_mean));
    let aic = -2.0 * poisson_log_likelihood(&y, &mu) + 2.0 * p as f64;

    let covariate_summaries = spec
        .covariates
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let column = covariates.column(j);
            CovariateSummary {
                name: name.clone(),
                mean: column.sum() / n as f64,
                min: column.iter().copied().fold(f64::INFINITY, f64::min),
                max: column.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            }
        })
        .collect();

    info!(
        "Fitted {} on {} records in {} iterations (deviance {:.3}, null {:.3}, AIC {:.3})",
        spec.formula(),
        n,
        iterations,
        deviance,
        null_deviance,
        aic
    );

    Ok(FittedModel {
        spec: spec.clone(),
        formula: spec.formula(),
        terms,
        coefficients: beta.to_vec(),
        std_errors,
        deviance,
        null_deviance,
        aic,
        iterations,
        n_obs: n,
        coercion: options.coercion,
        covariate_summaries,
        fitted_values: mu.to_vec(),
    })
}
