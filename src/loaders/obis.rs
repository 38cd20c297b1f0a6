//! OBIS Occurrence Loader
//!
//! Occurrence records for a taxon come from the OBIS v3 API together with
//! their measurement-or-fact extension (`mof`). Measurements are keyed by the
//! occurrence record id and joined back to the occurrence coordinates.
//!
//! A taxon with no occurrences, or no qualifying measurements, yields an
//! empty result rather than an error.

use crate::data::Observation;
use crate::spatial::GeoPoint;
use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

/// Base URL of the OBIS occurrence endpoint
pub const OBIS_OCCURRENCE_URL: &str = "https://api.obis.org/v3/occurrence";

/// Measurement types used as abundance/biomass by default
pub const DEFAULT_QUALIFYING_TYPES: [&str; 4] = ["abundance", "biomass", "count", "individualcount"];

#[derive(Debug, Deserialize)]
struct OccurrenceResponse {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    results: Vec<RawOccurrence>,
}

#[derive(Debug, Deserialize)]
struct RawOccurrence {
    id: String,
    #[serde(rename = "decimalLongitude")]
    longitude: Option<f64>,
    #[serde(rename = "decimalLatitude")]
    latitude: Option<f64>,
    #[serde(rename = "eventDate")]
    event_date: Option<String>,
    date_year: Option<i32>,
    #[serde(rename = "aphiaID")]
    aphia_id: Option<i64>,
    #[serde(default)]
    mof: Vec<RawMeasurement>,
}

#[derive(Debug, Deserialize)]
struct RawMeasurement {
    #[serde(rename = "measurementType")]
    measurement_type: Option<String>,
    #[serde(rename = "measurementValue")]
    measurement_value: Option<Value>,
    #[serde(rename = "measurementUnit")]
    measurement_unit: Option<String>,
}

/// Occurrence record (one sighting/sample)
#[derive(Debug, Clone, PartialEq)]
pub struct Occurrence {
    pub id: String,
    pub species_code: Option<String>,
    pub point: Option<GeoPoint>,
    pub year: Option<i32>,
    pub event_date: Option<String>,
}

/// Measurement-extension row keyed by occurrence id
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub record_id: String,
    pub measurement_type: String,
    pub value: Option<f64>,
    pub unit: Option<String>,
}

fn value_as_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    };
    parsed.filter(|v: &f64| v.is_finite())
}

fn year_from_date(date: &str) -> Option<i32> {
    date.get(..4)?.parse().ok()
}

/// Split an occurrence response into occurrences and measurements
pub fn parse_occurrence_response(json: &str) -> Result<(Vec<Occurrence>, Vec<Measurement>)> {
    let response: OccurrenceResponse =
        serde_json::from_str(json).with_context(|| "Failed to parse OBIS occurrence response")?;

    debug!(
        "OBIS response: {} results (total reported: {:?})",
        response.results.len(),
        response.total
    );

    let mut occurrences = Vec::with_capacity(response.results.len());
    let mut measurements = Vec::new();

    for raw in response.results {
        for m in raw.mof {
            let Some(measurement_type) = m.measurement_type else {
                continue;
            };
            measurements.push(Measurement {
                record_id: raw.id.clone(),
                measurement_type,
                value: m.measurement_value.as_ref().and_then(value_as_f64),
                unit: m.measurement_unit,
            });
        }

        let point = match (raw.longitude, raw.latitude) {
            (Some(lon), Some(lat)) => Some(GeoPoint::new(lon, lat)),
            _ => None,
        };
        let year = raw
            .date_year
            .or_else(|| raw.event_date.as_deref().and_then(year_from_date));

        occurrences.push(Occurrence {
            id: raw.id,
            species_code: raw.aphia_id.map(|a| a.to_string()),
            point,
            year,
            event_date: raw.event_date,
        });
    }

    Ok((occurrences, measurements))
}

fn is_qualifying(measurement_type: &str, qualifying: &[String]) -> bool {
    let normalized = measurement_type.to_lowercase().replace([' ', '_'], "");
    qualifying
        .iter()
        .any(|q| normalized.contains(&q.to_lowercase().replace([' ', '_'], "")))
}

/// Join qualifying measurements back to their occurrence coordinates
///
/// Biomass/weight measurements populate `weight`; all other qualifying
/// types populate `abundance`. Measurements without a numeric value, or whose
/// occurrence lacks coordinates or a year, are skipped.
pub fn join_measurements(
    occurrences: &[Occurrence],
    measurements: &[Measurement],
    qualifying: &[String],
    taxon_id: &str,
) -> Vec<Observation> {
    let by_id: FxHashMap<&str, &Occurrence> =
        occurrences.iter().map(|o| (o.id.as_str(), o)).collect();

    let mut skipped = 0usize;
    let mut observations = Vec::new();

    for m in measurements {
        if !is_qualifying(&m.measurement_type, qualifying) {
            continue;
        }
        let joined = by_id.get(m.record_id.as_str()).and_then(|occ| {
            Some((occ, occ.point?, occ.year?, m.value?))
        });
        let Some((occ, point, year, value)) = joined else {
            skipped += 1;
            continue;
        };

        let lowered = m.measurement_type.to_lowercase();
        let is_mass = lowered.contains("biomass") || lowered.contains("weight");

        observations.push(Observation {
            year,
            species_code: occ.species_code.clone().unwrap_or_else(|| taxon_id.to_string()),
            station: None,
            timestamp: occ.event_date.clone(),
            point,
            weight: if is_mass { Some(value) } else { None },
            weight_unit: if is_mass { m.unit.clone() } else { None },
            measurement_type: m.measurement_type.clone(),
            distance_m: None,
            abundance: if is_mass { None } else { Some(value) },
        });
    }

    info!(
        "OBIS taxon {}: {} occurrences, {} measurements → {} observations ({} unjoinable)",
        taxon_id,
        occurrences.len(),
        measurements.len(),
        observations.len(),
        skipped
    );

    observations
}

/// Parse a response and join its measurements in one step
pub fn observations_from_response(
    json: &str,
    qualifying: &[String],
    taxon_id: &str,
) -> Result<Vec<Observation>> {
    let (occurrences, measurements) = parse_occurrence_response(json)?;
    Ok(join_measurements(&occurrences, &measurements, qualifying, taxon_id))
}

/// Fetch occurrences with measurements for a taxon
///
/// A single blocking request, no retry.
#[cfg(feature = "obis")]
pub fn fetch_occurrences(taxon_id: &str, size: usize) -> Result<String> {
    let client = reqwest::blocking::Client::new();
    let size = size.to_string();

    info!("Fetching OBIS occurrences for taxon {}", taxon_id);
    client
        .get(OBIS_OCCURRENCE_URL)
        .query(&[("taxonid", taxon_id), ("mof", "true"), ("size", size.as_str())])
        .send()
        .with_context(|| format!("OBIS request failed for taxon {}", taxon_id))?
        .error_for_status()
        .with_context(|| format!("OBIS returned an error status for taxon {}", taxon_id))?
        .text()
        .with_context(|| "Failed to read OBIS response body")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"{
        "total": 3,
        "results": [
            {
                "id": "a1",
                "decimalLongitude": -3.5,
                "decimalLatitude": 43.7,
                "eventDate": "2012-05-01",
                "date_year": 2012,
                "aphiaID": 126417,
                "mof": [
                    {"measurementType": "Abundance", "measurementValue": "14", "measurementUnit": "individuals"},
                    {"measurementType": "Sampling depth", "measurementValue": "30"},
                    {"measurementType": "Wet weight biomass", "measurementValue": 2.5, "measurementUnit": "g"}
                ]
            },
            {
                "id": "a2",
                "decimalLongitude": -4.1,
                "decimalLatitude": 44.0,
                "eventDate": "2013-06-11T10:00:00",
                "aphiaID": 126417,
                "mof": [
                    {"measurementType": "Individual count", "measurementValue": "n/a"}
                ]
            },
            {
                "id": "a3",
                "eventDate": "2013-06-11",
                "aphiaID": 126417,
                "mof": [
                    {"measurementType": "abundance", "measurementValue": 4}
                ]
            }
        ]
    }"#;

    fn qualifying() -> Vec<String> {
        DEFAULT_QUALIFYING_TYPES.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_response() {
        let (occ, mof) = parse_occurrence_response(RESPONSE).unwrap();
        assert_eq!(occ.len(), 3);
        assert_eq!(mof.len(), 5);
        assert_eq!(occ[1].year, Some(2013)); // from eventDate
        assert_eq!(occ[2].point, None);
        assert_eq!(mof[0].value, Some(14.0));
        assert_eq!(mof[3].value, None);
    }

    #[test]
    fn test_join_keeps_qualifying_with_coordinates() {
        let obs = observations_from_response(RESPONSE, &qualifying(), "126417").unwrap();

        // a1 abundance + a1 biomass; a2 has no numeric value; a3 has no coordinates
        assert_eq!(obs.len(), 2);
        let abundance = obs.iter().find(|o| o.abundance.is_some()).unwrap();
        assert_eq!(abundance.abundance, Some(14.0));
        assert_eq!(abundance.point, GeoPoint::new(-3.5, 43.7));
        assert_eq!(abundance.year, 2012);

        let biomass = obs.iter().find(|o| o.weight.is_some()).unwrap();
        assert_eq!(biomass.weight, Some(2.5));
        assert_eq!(biomass.weight_unit.as_deref(), Some("g"));
    }

    #[test]
    fn test_empty_results_yield_empty() {
        let obs = observations_from_response(r#"{"total": 0, "results": []}"#, &qualifying(), "1").unwrap();
        assert!(obs.is_empty());
    }

    #[test]
    fn test_no_qualifying_measurements_yield_empty() {
        let only = vec!["length".to_string()];
        let obs = observations_from_response(RESPONSE, &only, "126417").unwrap();
        assert!(obs.is_empty());
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(parse_occurrence_response("{not json").is_err());
    }
}
