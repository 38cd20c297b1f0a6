//! Year-partitioned Parquet dataset
//!
//! Observations are cached as `<dir>/year=YYYY/part-0.parquet` (ZSTD), one
//! partition per survey year, so later runs can re-read a subset of years
//! without reparsing the raw exports.

use crate::data::columns;
use anyhow::{bail, Context, Result};
use polars::prelude::*;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PARTITION_PREFIX: &str = "year=";
const PART_FILE: &str = "part-0.parquet";
const STAGING_DIR: &str = ".staging";

fn partition_dir(dir: &Path, year: i32) -> PathBuf {
    dir.join(format!("{}{}", PARTITION_PREFIX, year))
}

/// Existing partitions under `dir`, sorted by year
pub fn list_partitions(dir: &Path) -> Result<Vec<(i32, PathBuf)>> {
    let mut partitions = Vec::new();
    if !dir.exists() {
        return Ok(partitions);
    }

    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(year) = name
            .to_str()
            .and_then(|n| n.strip_prefix(PARTITION_PREFIX))
            .and_then(|y| y.parse::<i32>().ok())
        else {
            continue;
        };
        let file = entry.path().join(PART_FILE);
        if file.is_file() {
            partitions.push((year, file));
        }
    }

    partitions.sort_by_key(|(year, _)| *year);
    Ok(partitions)
}

/// Write one Parquet partition per year, replacing any earlier partitions
///
/// Partitions are first written under a staging directory; earlier
/// partitions are only removed once every year has been written, so a
/// failed rewrite leaves the previous dataset readable.
pub fn write_partitioned(df: &DataFrame, dir: &Path) -> Result<Vec<PathBuf>> {
    let years_col = df
        .column(columns::YEAR)
        .with_context(|| "dataset: Missing year column")?
        .cast(&DataType::Int32)?;
    let years = years_col.i32()?;

    if years.null_count() > 0 {
        bail!("dataset: {} rows have no year", years.null_count());
    }
    let distinct: BTreeSet<i32> = years.into_iter().flatten().collect();

    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let staging = dir.join(STAGING_DIR);
    if staging.is_dir() {
        // Left over from an interrupted run
        fs::remove_dir_all(&staging)
            .with_context(|| format!("Failed to clear {}", staging.display()))?;
    }
    fs::create_dir(&staging).with_context(|| format!("Failed to create {}", staging.display()))?;

    let staged = distinct
        .par_iter()
        .map(|&year| -> Result<(i32, usize)> {
            let mask: BooleanChunked = years.into_iter().map(|y| y == Some(year)).collect();
            let mut part = df.filter(&mask)?;

            let part_dir = partition_dir(&staging, year);
            fs::create_dir_all(&part_dir)
                .with_context(|| format!("Failed to create {}", part_dir.display()))?;
            let path = part_dir.join(PART_FILE);

            let file = fs::File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            ParquetWriter::new(file)
                .with_compression(ParquetCompression::Zstd(None))
                .finish(&mut part)
                .with_context(|| format!("Failed to write {}", path.display()))?;

            Ok((year, part.height()))
        })
        .collect::<Result<Vec<_>>>();

    let staged = match staged {
        Ok(staged) => staged,
        Err(e) => {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!("Failed to remove {}: {}", staging.display(), cleanup);
            }
            return Err(e);
        }
    };

    for (_, stale) in list_partitions(dir)? {
        if let Some(parent) = stale.parent() {
            fs::remove_dir_all(parent)
                .with_context(|| format!("Failed to remove partition {}", parent.display()))?;
        }
    }

    let mut paths = Vec::with_capacity(staged.len());
    for (year, rows) in staged {
        let target = partition_dir(dir, year);
        fs::rename(partition_dir(&staging, year), &target)
            .with_context(|| format!("Failed to move partition into {}", target.display()))?;
        let path = target.join(PART_FILE);
        debug!("Wrote {} rows to {}", rows, path.display());
        paths.push(path);
    }
    fs::remove_dir(&staging).with_context(|| format!("Failed to remove {}", staging.display()))?;

    info!(
        "Wrote {} rows in {} year partitions under {}",
        df.height(),
        paths.len(),
        dir.display()
    );
    Ok(paths)
}

/// Read all partitions, or only `years`, concatenated in year order
///
/// A directory without partitions reads as an empty frame.
pub fn read_partitioned(dir: &Path, years: Option<&[i32]>) -> Result<DataFrame> {
    let selected: Vec<(i32, PathBuf)> = list_partitions(dir)?
        .into_iter()
        .filter(|(year, _)| years.map_or(true, |ys| ys.contains(year)))
        .collect();

    let frames = selected
        .par_iter()
        .map(|(_, path)| {
            LazyFrame::scan_parquet(path, Default::default())
                .and_then(|lf| lf.collect())
                .with_context(|| format!("Failed to read partition {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut frames = frames.into_iter();
    let Some(mut combined) = frames.next() else {
        return Ok(DataFrame::default());
    };
    for frame in frames {
        combined
            .vstack_mut(&frame)
            .with_context(|| "dataset: Partitions have different schemas")?;
    }

    info!(
        "Read {} rows from {} partitions under {}",
        combined.height(),
        selected.len(),
        dir.display()
    );
    Ok(combined)
}

/// Write a table as CSV with a header row
pub fn write_csv(df: &DataFrame, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut df.clone())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataFrame {
        df![
            columns::YEAR => &[2021, 2019, 2021, 2020],
            columns::SPECIES_CODE => &["126417", "126417", "126417", "126417"],
            columns::ABUNDANCE => &[Some(1.0), None, Some(3.0), Some(4.0)],
        ]
        .unwrap()
    }

    #[test]
    fn test_partition_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_partitioned(&sample(), dir.path()).unwrap();
        assert_eq!(paths.len(), 3);
        assert!(dir.path().join("year=2019").join("part-0.parquet").is_file());

        let years: Vec<i32> = list_partitions(dir.path()).unwrap().iter().map(|(y, _)| *y).collect();
        assert_eq!(years, vec![2019, 2020, 2021]);
    }

    #[test]
    fn test_read_back_in_year_order() {
        let dir = tempfile::tempdir().unwrap();
        write_partitioned(&sample(), dir.path()).unwrap();

        let all = read_partitioned(dir.path(), None).unwrap();
        assert_eq!(all.height(), 4);
        let years: Vec<Option<i32>> = all.column(columns::YEAR).unwrap().i32().unwrap().into_iter().collect();
        assert_eq!(years, vec![Some(2019), Some(2020), Some(2021), Some(2021)]);
        assert_eq!(all.column(columns::ABUNDANCE).unwrap().null_count(), 1);

        let only = read_partitioned(dir.path(), Some(&[2021][..])).unwrap();
        assert_eq!(only.height(), 2);
    }

    #[test]
    fn test_rewrite_replaces_partitions() {
        let dir = tempfile::tempdir().unwrap();
        write_partitioned(&sample(), dir.path()).unwrap();

        let smaller = df![
            columns::YEAR => &[2022],
            columns::ABUNDANCE => &[7.0],
        ]
        .unwrap();
        write_partitioned(&smaller, dir.path()).unwrap();

        let all = read_partitioned(dir.path(), None).unwrap();
        assert_eq!(all.height(), 1);
    }

    #[test]
    fn test_failed_rewrite_keeps_previous_partitions() {
        let dir = tempfile::tempdir().unwrap();
        write_partitioned(&sample(), dir.path()).unwrap();
        assert!(!dir.path().join(STAGING_DIR).exists());

        // Staging area blocked by a stray file
        fs::write(dir.path().join(STAGING_DIR), b"not a directory").unwrap();
        let replacement = df![
            columns::YEAR => &[2022],
            columns::ABUNDANCE => &[7.0],
        ]
        .unwrap();
        assert!(write_partitioned(&replacement, dir.path()).is_err());

        let all = read_partitioned(dir.path(), None).unwrap();
        assert_eq!(all.height(), 4);
        let years: Vec<i32> = list_partitions(dir.path()).unwrap().iter().map(|(y, _)| *y).collect();
        assert_eq!(years, vec![2019, 2020, 2021]);
    }

    #[test]
    fn test_stale_staging_dir_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let leftover = partition_dir(&dir.path().join(STAGING_DIR), 1999);
        fs::create_dir_all(&leftover).unwrap();
        fs::write(leftover.join(PART_FILE), b"truncated").unwrap();

        write_partitioned(&sample(), dir.path()).unwrap();
        assert!(!dir.path().join(STAGING_DIR).exists());
        let years: Vec<i32> = list_partitions(dir.path()).unwrap().iter().map(|(y, _)| *y).collect();
        assert_eq!(years, vec![2019, 2020, 2021]);
    }

    #[test]
    fn test_empty_dir_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_partitioned(&dir.path().join("missing"), None).unwrap().height(), 0);
    }

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("figures").join("table.csv");
        write_csv(&sample(), &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("year,species_code,abundance"));
        assert_eq!(text.lines().count(), 5);
    }
}
