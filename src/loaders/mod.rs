//! Data loaders
//!
//! Each loader normalizes one source into `Observation`s:
//! - `ices_biotic`: ICES acoustic survey exports, partitioned by year folder
//! - `obis`: OBIS occurrences joined with their measurement extension

pub mod ices_biotic;
pub mod obis;

pub use ices_biotic::{load_survey_folder, load_year, map_year_folders, BadFilePolicy};
pub use obis::{join_measurements, observations_from_response, parse_occurrence_response};
