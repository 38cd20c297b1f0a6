//! ICES Acoustic Biotic Loader
//!
//! Reads biotic exports from the ICES acoustic submissions portal. Files are
//! organised as `root/<year>/.../*.csv`. Each file holds record-type blocks
//! (`Cruise`, `Haul`, `Catch`, `Biology`, ...); a block starts with a
//! `<Type>,Header,<field>,...` line naming its fields and continues with
//! `<Type>,Record,<value>,...` lines.
//!
//! Per file: catches are joined to their haul by haul number, positioned at
//! the haul centre, and dropped when the haul covered no distance. Per year:
//! rows are de-duplicated on (station, species) and abundance is catch
//! weight per metre hauled.

use crate::data::Observation;
use crate::spatial::{geodesic_m, GeoPoint};
use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDateTime;
use polars::prelude::*;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Haul fields the loader needs
const HAUL_FIELDS: [&str; 7] = [
    "HaulNumber",
    "HaulStationName",
    "HaulStartTime",
    "HaulStartLatitude",
    "HaulStartLongitude",
    "HaulStopLatitude",
    "HaulStopLongitude",
];

/// Catch fields the loader needs
const CATCH_FIELDS: [&str; 4] = [
    "HaulNumber",
    "CatchSpeciesCode",
    "CatchWeightUnit",
    "CatchSpeciesCategoryWeight",
];

/// Measurement type recorded for survey catches
pub const CATCH_WEIGHT: &str = "catch_weight";

/// What to do with a file that cannot be parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadFilePolicy {
    /// Stop the load with the file's error
    #[default]
    Fail,
    /// Log and skip the file
    Skip,
}

/// One record-type block of a biotic file
#[derive(Debug, Clone, Default)]
pub struct RecordBlock {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RecordBlock {
    /// Position of every requested field, error naming the first missing one
    fn field_positions(&self, fields: &[&str], block: &str) -> Result<Vec<usize>> {
        fields
            .iter()
            .map(|&f| {
                self.header
                    .iter()
                    .position(|h| h == f)
                    .ok_or_else(|| anyhow!("{} block: missing column '{}'", block, f))
            })
            .collect()
    }
}

/// A catch joined to its haul, before yearly de-duplication
#[derive(Debug, Clone)]
struct HaulCatch {
    haul_number: i64,
    station: Option<String>,
    timestamp: Option<String>,
    start: GeoPoint,
    stop: GeoPoint,
    distance_m: f64,
    species_code: String,
    weight_unit: Option<String>,
    weight: Option<f64>,
}

/// Discover `root/<yyyy>/**/*.csv`
///
/// Returns year → sorted CSV paths; years without CSV files are omitted.
pub fn map_year_folders(root: &Path) -> Result<BTreeMap<i32, Vec<PathBuf>>> {
    if !root.is_dir() {
        bail!("{} does not exist or is not a directory", root.display());
    }

    let mut result = BTreeMap::new();
    for entry in fs::read_dir(root).with_context(|| format!("Failed to list {}", root.display()))? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.len() != 4 || !name.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let year: i32 = name.parse()?;

        let mut files = Vec::new();
        collect_csv_files(&path, &mut files)?;
        files.sort();

        if !files.is_empty() {
            result.insert(year, files);
        }
    }

    Ok(result)
}

fn collect_csv_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_csv_files(&path, out)?;
        } else if path
            .extension()
            .map_or(false, |ext| ext.to_string_lossy().eq_ignore_ascii_case("csv"))
        {
            out.push(path);
        }
    }
    Ok(())
}

/// Split a biotic export into its record-type blocks
///
/// The file is read as headerless CSV with every column typed as String.
/// Rows are ragged (each block has its own width), so the schema is as wide
/// as the widest physical line and short rows are padded with nulls.
/// Rows that are neither `Header` nor `Record` rows are ignored.
pub fn parse_biotic_csv(text: &str) -> Result<FxHashMap<String, RecordBlock>> {
    let mut blocks: FxHashMap<String, RecordBlock> = FxHashMap::default();

    let width = text.lines().map(|l| l.matches(',').count() + 1).max().unwrap_or(0);
    if width < 2 {
        return Ok(blocks);
    }

    let schema = Schema::from_iter(
        (1..=width).map(|i| Field::new(format!("column_{}", i).into(), DataType::String)),
    );
    let df = CsvReadOptions::default()
        .with_has_header(false)
        .with_schema(Some(Arc::new(schema)))
        .with_parse_options(CsvParseOptions::default().with_truncate_ragged_lines(true))
        .into_reader_with_file_handle(Cursor::new(text.as_bytes().to_vec()))
        .finish()
        .context("Failed to read biotic CSV")?;

    let columns = df
        .get_columns()
        .iter()
        .map(|c| c.str())
        .collect::<PolarsResult<Vec<_>>>()?;

    for row in 0..df.height() {
        let cell = |c: usize| columns[c].get(row).map(str::trim).unwrap_or("");
        let record_type = cell(0).trim_start_matches('\u{feff}').to_string();
        let values: Vec<String> = (2..width).map(|c| cell(c).to_string()).collect();

        match cell(1) {
            "Header" => {
                let mut header = values;
                while header.last().map_or(false, |h| h.is_empty()) {
                    header.pop();
                }
                blocks.entry(record_type).or_default().header = header;
            }
            "Record" => {
                match blocks.get_mut(&record_type) {
                    Some(block) if !block.header.is_empty() => block.rows.push(values),
                    _ => debug!("row {}: {} record without header, ignored", row + 1, record_type),
                }
            }
            _ => {}
        }
    }

    Ok(blocks)
}

fn non_empty(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() || v.eq_ignore_ascii_case("NA") {
        None
    } else {
        Some(v.to_string())
    }
}

/// Parse a number that may use a comma decimal separator
fn parse_decimal(value: &str) -> Option<f64> {
    non_empty(value)?.replace(',', ".").parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_haul_number(value: &str) -> Option<i64> {
    let v = non_empty(value)?;
    v.parse::<i64>()
        .ok()
        .or_else(|| v.parse::<f64>().ok().filter(|f| f.fract() == 0.0).map(|f| f as i64))
}

/// Normalize haul times to ISO 8601; unknown formats are kept verbatim
fn normalize_timestamp(value: &str) -> Option<String> {
    const FORMATS: [&str; 5] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M",
    ];
    let raw = non_empty(value)?;
    let trimmed = raw.trim_end_matches('Z');
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .or(Some(raw))
}

fn field(row: &[String], pos: usize) -> &str {
    row.get(pos).map(String::as_str).unwrap_or("")
}

/// Join catches to hauls for one file
fn haul_catches(blocks: &FxHashMap<String, RecordBlock>, source: &str) -> Result<Vec<HaulCatch>> {
    let haul = blocks
        .get("Haul")
        .ok_or_else(|| anyhow!("{}: no Haul block", source))?;
    let catch = blocks
        .get("Catch")
        .ok_or_else(|| anyhow!("{}: no Catch block", source))?;

    let hp = haul.field_positions(&HAUL_FIELDS, "Haul")?;
    let cp = catch.field_positions(&CATCH_FIELDS, "Catch")?;
    // Haul number → haul row (first wins)
    let mut hauls: FxHashMap<i64, &Vec<String>> = FxHashMap::default();
    for row in &haul.rows {
        if let Some(n) = parse_haul_number(field(row, hp[0])) {
            hauls.entry(n).or_insert(row);
        }
    }

    let mut seen: FxHashSet<(i64, String)> = FxHashSet::default();
    let mut out = Vec::new();

    for row in &catch.rows {
        let Some(species_code) = non_empty(field(row, cp[1])) else {
            continue;
        };
        let Some(haul_number) = parse_haul_number(field(row, cp[0])) else {
            continue;
        };
        let Some(haul_row) = hauls.get(&haul_number) else {
            continue;
        };
        if !seen.insert((haul_number, species_code.clone())) {
            continue;
        }

        let coord = |pos: usize, what: &str| {
            parse_decimal(field(haul_row, hp[pos])).ok_or_else(|| {
                anyhow!(
                    "{}: haul {} has unparsable {} '{}'",
                    source,
                    haul_number,
                    what,
                    field(haul_row, hp[pos])
                )
            })
        };
        let start = GeoPoint::new(coord(4, "HaulStartLongitude")?, coord(3, "HaulStartLatitude")?);
        let stop = GeoPoint::new(coord(6, "HaulStopLongitude")?, coord(5, "HaulStopLatitude")?);
        let distance_m = geodesic_m(start, stop)
            .with_context(|| format!("{}: haul {}", source, haul_number))?;

        out.push(HaulCatch {
            haul_number,
            station: non_empty(field(haul_row, hp[1])),
            timestamp: normalize_timestamp(field(haul_row, hp[2])),
            start,
            stop,
            distance_m,
            species_code,
            weight_unit: non_empty(field(row, cp[2])),
            weight: parse_decimal(field(row, cp[3])),
        });
    }

    // Zero-length hauls are recording errors
    let before = out.len();
    out.retain(|c| c.distance_m != 0.0);
    if out.len() < before {
        debug!("{}: dropped {} catches on zero-distance hauls", source, before - out.len());
    }

    Ok(out)
}

/// Parse one biotic file into joined haul catches
fn load_file(path: &Path) -> Result<Vec<HaulCatch>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read biotic file: {}", path.display()))?;
    let blocks = parse_biotic_csv(&text)
        .with_context(|| format!("Failed to parse biotic file: {}", path.display()))?;
    haul_catches(&blocks, &path.display().to_string())
}

/// Load every file of one year into observations
///
/// Rows are de-duplicated on (station, species) keeping the first, then
/// abundance = catch weight / haul distance.
pub fn load_year(year: i32, files: &[PathBuf], policy: BadFilePolicy) -> Result<Vec<Observation>> {
    let mut catches = Vec::new();
    for path in files {
        match load_file(path) {
            Ok(rows) => catches.extend(rows),
            Err(e) if policy == BadFilePolicy::Skip => {
                warn!("Skipping {}: {:#}", path.display(), e);
            }
            Err(e) => return Err(e),
        }
    }

    let mut seen: FxHashSet<(Option<String>, String)> = FxHashSet::default();
    let observations: Vec<Observation> = catches
        .into_iter()
        .filter(|c| seen.insert((c.station.clone(), c.species_code.clone())))
        .map(|c| {
            debug!(
                "haul {} ({:.4},{:.4})→({:.4},{:.4})",
                c.haul_number, c.start.lon, c.start.lat, c.stop.lon, c.stop.lat
            );
            Observation {
                year,
                species_code: c.species_code,
                station: c.station,
                timestamp: c.timestamp,
                point: c.start.midpoint(&c.stop),
                abundance: c.weight.map(|w| w / c.distance_m),
                weight: c.weight,
                weight_unit: c.weight_unit,
                measurement_type: CATCH_WEIGHT.to_string(),
                distance_m: Some(c.distance_m),
            }
        })
        .collect();

    info!("Year {}: {} files → {} observations", year, files.len(), observations.len());
    Ok(observations)
}

/// Load a whole survey folder, years processed in parallel
///
/// Year partitions are disjoint, so each is read independently; the result
/// is concatenated in ascending year order.
pub fn load_survey_folder(root: &Path, policy: BadFilePolicy) -> Result<Vec<Observation>> {
    let years = map_year_folders(root)?;
    info!("Found {} survey years under {}", years.len(), root.display());

    let per_year: Vec<Vec<Observation>> = years
        .par_iter()
        .map(|(year, files)| load_year(*year, files, policy))
        .collect::<Result<Vec<_>>>()?;

    Ok(per_year.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SAMPLE: &str = "\
Header,Record,Header,Version
Header,Record,1
Cruise,Header,CruiseLocalID
Cruise,Record,JUVENA19
Haul,Header,HaulGear,HaulNumber,HaulStationName,HaulStartTime,HaulStartLatitude,HaulStartLongitude,HaulStopLatitude,HaulStopLongitude
Haul,Record,PTM,1,ST01,2019-09-12 06:30,43.50,-3.20,43.60,-3.20
Haul,Record,PTM,2,ST02,2019-09-12 09:10,44.00,-4.00,44.00,-4.00
Haul,Record,PTM,3,ST03,bad time,44.50,-5.00,44.50,-5.10
Catch,Header,CatchDataType,HaulNumber,CatchSpeciesCode,CatchWeightUnit,CatchSpeciesCategoryWeight
Catch,Record,R,1,126417,kg,\"12,5\"
Catch,Record,R,1,126417,kg,99
Catch,Record,R,1,126421,kg,3
Catch,Record,R,2,126417,kg,7
Catch,Record,R,3,126417,kg,
Catch,Record,R,3,,kg,4
";

    #[test]
    fn test_parse_blocks() {
        let blocks = parse_biotic_csv(SAMPLE).unwrap();
        assert_eq!(blocks["Haul"].rows.len(), 3);
        assert_eq!(blocks["Catch"].rows.len(), 6);
        assert_eq!(blocks["Cruise"].header, vec!["CruiseLocalID"]);
    }

    #[test]
    fn test_haul_catch_join() {
        let blocks = parse_biotic_csv(SAMPLE).unwrap();
        let catches = haul_catches(&blocks, "sample").unwrap();

        // Duplicate (1, 126417) keeps first; haul 2 has zero distance; blank species dropped
        assert_eq!(catches.len(), 3);

        let first = &catches[0];
        assert_eq!(first.haul_number, 1);
        assert_eq!(first.weight, Some(12.5));
        assert_eq!(first.timestamp.as_deref(), Some("2019-09-12T06:30:00"));
        assert_relative_eq!(first.distance_m, 11_110.346, max_relative = 1e-4);

        let missing_weight = catches.iter().find(|c| c.haul_number == 3).unwrap();
        assert_eq!(missing_weight.weight, None);
        assert_eq!(missing_weight.timestamp.as_deref(), Some("bad time"));
    }

    #[test]
    fn test_missing_column_is_error() {
        let text = "\
Haul,Header,HaulNumber,HaulStationName
Haul,Record,1,ST01
Catch,Header,HaulNumber,CatchSpeciesCode,CatchWeightUnit,CatchSpeciesCategoryWeight
Catch,Record,1,126417,kg,3
";
        let blocks = parse_biotic_csv(text).unwrap();
        let err = haul_catches(&blocks, "broken").unwrap_err();
        assert!(err.to_string().contains("HaulStartTime"));
    }

    #[test]
    fn test_unparsable_coordinates_is_error() {
        let text = SAMPLE.replace("43.50,-3.20,43.60", "north,-3.20,43.60");
        let blocks = parse_biotic_csv(&text).unwrap();
        let err = haul_catches(&blocks, "broken").unwrap_err();
        assert!(err.to_string().contains("HaulStartLatitude"));
    }

    #[test]
    fn test_load_year_dedup_and_abundance() {
        let dir = tempfile::tempdir().unwrap();
        let year_dir = dir.path().join("2019").join("leg1");
        fs::create_dir_all(&year_dir).unwrap();
        fs::write(year_dir.join("a.csv"), SAMPLE).unwrap();
        fs::write(dir.path().join("2019").join("b.CSV"), SAMPLE).unwrap();
        fs::create_dir_all(dir.path().join("notes")).unwrap();

        let years = map_year_folders(dir.path()).unwrap();
        assert_eq!(years.keys().copied().collect::<Vec<_>>(), vec![2019]);
        assert_eq!(years[&2019].len(), 2);

        let obs = load_year(2019, &years[&2019], BadFilePolicy::Fail).unwrap();
        // Second file repeats the same stations and species
        assert_eq!(obs.len(), 3);

        let st01 = obs
            .iter()
            .find(|o| o.station.as_deref() == Some("ST01") && o.species_code == "126417")
            .unwrap();
        assert_relative_eq!(st01.point.lat, 43.55, epsilon = 1e-9);
        assert_relative_eq!(
            st01.abundance.unwrap(),
            12.5 / st01.distance_m.unwrap(),
            epsilon = 1e-12
        );

        let st03 = obs.iter().find(|o| o.station.as_deref() == Some("ST03")).unwrap();
        assert_eq!(st03.abundance, None);
    }

    #[test]
    fn test_bad_file_policy() {
        let dir = tempfile::tempdir().unwrap();
        let year_dir = dir.path().join("2020");
        fs::create_dir_all(&year_dir).unwrap();
        fs::write(year_dir.join("good.csv"), SAMPLE).unwrap();
        fs::write(year_dir.join("zbad.csv"), "Haul,Header,HaulNumber\n").unwrap();

        assert!(load_survey_folder(dir.path(), BadFilePolicy::Fail).is_err());
        let obs = load_survey_folder(dir.path(), BadFilePolicy::Skip).unwrap();
        assert_eq!(obs.len(), 3);
        assert!(obs.iter().all(|o| o.year == 2020));
    }

    #[test]
    fn test_missing_root() {
        assert!(map_year_folders(Path::new("/nonexistent/ices")).is_err());
    }

    #[test]
    fn test_quoted_multiline_field() {
        let text = SAMPLE.replace(",ST01,", ",\"ST01\nnorth\",");
        let blocks = parse_biotic_csv(&text).unwrap();
        assert_eq!(blocks["Haul"].rows.len(), 3);
        assert_eq!(blocks["Catch"].rows.len(), 6);

        let catches = haul_catches(&blocks, "multiline").unwrap();
        let first = catches.iter().find(|c| c.haul_number == 1).unwrap();
        assert_eq!(first.station.as_deref(), Some("ST01\nnorth"));
        assert_eq!(first.weight, Some(12.5));
    }
}
