//! Column validation helpers for Polars frames
//!
//! Explicit patterns for pulling named columns out of Polars frames so a
//! missing input column stops the pipeline with a clear message instead of
//! producing silently wrong aggregates.

use polars::prelude::*;
use anyhow::{Context, Result, anyhow};
use std::collections::HashSet;

/// Collect `lazy` keeping exactly `columns`, in that order
///
/// # Arguments
/// * `lazy` - Frame to collect (e.g. a Parquet scan)
/// * `columns` - Required column names
/// * `context` - Context for error messages (e.g., "partitioned dataset")
///
/// # Errors
/// Returns error if collection fails or any required column is missing
pub fn materialize_with_columns(
    lazy: LazyFrame,
    columns: &[&str],
    context: &str,
) -> Result<DataFrame> {
    let df = lazy
        .collect()
        .with_context(|| format!("{}: Failed to collect frame", context))?;

    require_columns(&df, columns, context)?;

    df.select(columns.iter().copied())
        .with_context(|| format!("{}: Failed to select columns {:?}", context, columns))
}

/// Fail unless every named column exists in `df`
pub fn require_columns(df: &DataFrame, columns: &[&str], context: &str) -> Result<()> {
    let available: HashSet<&str> = df.get_column_names().into_iter().map(|s| s.as_str()).collect();
    for &name in columns {
        if !available.contains(name) {
            return Err(anyhow!(
                "{}: Missing required column '{}'. Available columns: {:?}",
                context, name, available
            ));
        }
    }
    Ok(())
}

/// Filter observations to the analysed species
///
/// # Arguments
/// * `df` - Observation table (must have the species column)
/// * `species_codes` - Species codes to keep (WoRMS AphiaIDs as text)
/// * `species_col` - Name of the species column
/// * `context` - Context for error messages
pub fn filter_to_species(
    df: &DataFrame,
    species_codes: &[String],
    species_col: &str,
    context: &str,
) -> Result<DataFrame> {
    let species = df.column(species_col)
        .with_context(|| format!("{}: Missing {} column", context, species_col))?
        .str()
        .with_context(|| format!("{}: Column '{}' is not string type", context, species_col))?;

    let code_set: HashSet<&str> = species_codes.iter().map(|s| s.as_str()).collect();
    let mask: BooleanChunked = species
        .into_iter()
        .map(|opt| opt.map_or(false, |s| code_set.contains(s.trim())))
        .collect();

    df.filter(&mask)
        .with_context(|| format!("{}: Failed to filter to species using column '{}'", context, species_col))
}

/// Read an f64 column into owned optional values (nulls and NaN → None)
pub fn f64_values(df: &DataFrame, name: &str, context: &str) -> Result<Vec<Option<f64>>> {
    let column = df.column(name)
        .with_context(|| format!("{}: Missing column '{}'", context, name))?
        .cast(&DataType::Float64)
        .with_context(|| format!("{}: Column '{}' is not numeric", context, name))?;

    Ok(column
        .f64()?
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_materialize_with_columns_success() {
        let df = df![
            "species_code" => &["126417", "126417"],
            "weight" => &[1.5, 2.0],
            "extra_col" => &["e1", "e2"],
        ].unwrap();

        let result = materialize_with_columns(
            df.lazy(),
            &["weight", "species_code"],
            "test",
        );

        assert!(result.is_ok());
        let materialized = result.unwrap();
        let names: Vec<&str> = materialized
            .get_column_names()
            .into_iter()
            .map(|s| s.as_str())
            .collect();
        assert_eq!(names, vec!["weight", "species_code"]);
        assert_eq!(materialized.height(), 2);
    }

    #[test]
    fn test_materialize_with_columns_missing() {
        let df = df![
            "species_code" => &["126417"],
        ].unwrap();

        let result = materialize_with_columns(
            df.lazy(),
            &["missing_column"],
            "test",
        );

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("missing_column"));
        assert!(err_msg.contains("species_code"));
    }

    #[test]
    fn test_filter_to_species_success() {
        let df = df![
            "species_code" => &["126417", "126421", " 126417 "],
            "weight" => &[1, 2, 3],
        ].unwrap();

        let codes = vec!["126417".to_string()];
        let filtered = filter_to_species(&df, &codes, "species_code", "test").unwrap();

        assert_eq!(filtered.height(), 2);
    }

    #[test]
    fn test_filter_to_species_missing_column() {
        let df = df![
            "wrong_column" => &["126417"],
        ].unwrap();

        let codes = vec!["126417".to_string()];
        let result = filter_to_species(&df, &codes, "species_code", "test");

        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("species_code"));
    }

    #[test]
    fn test_f64_values_casts_and_keeps_nulls() {
        let df = df![
            "n" => &[Some(1i64), None, Some(3)],
        ].unwrap();

        let values = f64_values(&df, "n", "test").unwrap();
        assert_eq!(values, vec![Some(1.0), None, Some(3.0)]);
    }
}
