// Abundance pipeline entry point
//
// Usage: cargo run --release --bin run_pipeline
//
// PIPELINE_CONFIG names a JSON config; without it the defaults are used with
// inputs under DATA_DIR. OUTPUT_DIR overrides the output directory either way.

use abundance_sdm_rust::{AbundancePipeline, PipelineConfig};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "abundance_sdm_rust=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match std::env::var("PIPELINE_CONFIG") {
        Ok(path) => {
            tracing::info!("Loading config from {}", path);
            PipelineConfig::load(Path::new(&path))?
        }
        Err(_) => {
            let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));
            PipelineConfig {
                survey_dir: data_dir.join("ices_biotic"),
                dataset_dir: data_dir.join("observations"),
                raster_dir: data_dir.join("rasters"),
                ..Default::default()
            }
        }
    };

    if let Ok(output_dir) = std::env::var("OUTPUT_DIR") {
        config.output_dir = PathBuf::from(output_dir);
    }

    tracing::info!("Configuration:");
    tracing::info!("  species: {:?}", config.species_codes);
    tracing::info!("  source: {:?}", config.source);
    tracing::info!("  rasters: {}", config.raster_dir.display());
    tracing::info!("  output: {}", config.output_dir.display());

    let pipeline = AbundancePipeline::new(config)?;
    let report = pipeline.run()?;

    tracing::info!(
        "{} observations → {} aggregated records",
        report.observations,
        report.aggregated_records
    );
    if let Some(model) = &report.model {
        tracing::info!("Model: {} (AIC {:.2})", model.formula, model.aic);
    }
    for path in &report.outputs {
        tracing::info!("  wrote {}", path.display());
    }

    Ok(())
}
