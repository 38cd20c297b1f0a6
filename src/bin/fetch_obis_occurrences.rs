//! Download OBIS occurrences with measurements for one taxon
//!
//! Saves the raw response so pipeline runs can use `"source": "obis"`
//! without network access.
//!
//! Usage:
//!   cargo run --features obis --bin fetch_obis_occurrences -- <aphia_id> <output.json> [size]

use abundance_sdm_rust::loaders::obis::{
    fetch_occurrences, observations_from_response, DEFAULT_QUALIFYING_TYPES,
};
use anyhow::Context;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "abundance_sdm_rust=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let taxon = args.first().context("usage: fetch_obis_occurrences <aphia_id> <output.json> [size]")?;
    let output = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("obis_{}.json", taxon)));
    let size: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10_000);

    let json = fetch_occurrences(taxon, size)?;

    let qualifying: Vec<String> = DEFAULT_QUALIFYING_TYPES.iter().map(|s| s.to_string()).collect();
    let observations = observations_from_response(&json, &qualifying, taxon)?;
    tracing::info!("{} qualifying observations in response", observations.len());

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&output, json).with_context(|| format!("Failed to write {}", output.display()))?;
    tracing::info!("Saved response to {}", output.display());

    Ok(())
}
