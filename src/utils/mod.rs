//! Utility modules shared across pipeline stages
//!
//! - Stats: quantiles, means, linspace over optional values
//! - LazyFrame helpers: Safe materialization with column validation

pub mod lazy_helpers;
pub mod stats;

// Re-export commonly used helpers
pub use lazy_helpers::{f64_values, filter_to_species, materialize_with_columns, require_columns};
pub use stats::{linspace, mean, quantile};
