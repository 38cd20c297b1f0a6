//! Derive max / min / annual-range covariate layers from a NetCDF series
//!
//! Reads one variable of a Copernicus Marine product and writes
//! `<var>_max.tif`, `<var>_min.tif` and `<var>_range.tif` into the raster
//! directory used by the pipeline.
//!
//! Usage:
//!   cargo run --release --features netcdf --bin derive_temporal_layers -- <file.nc> <variable> [raster_dir]

use abundance_sdm_rust::spatial::netcdf_series::read_time_series;
use abundance_sdm_rust::spatial::temporal::derive_layers;
use anyhow::{bail, Context};
use std::path::PathBuf;
use std::time::Instant;
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
    if args.len() < 2 {
        bail!("usage: derive_temporal_layers <file.nc> <variable> [raster_dir]");
    }
    let input = PathBuf::from(&args[0]);
    let variable = &args[1];
    let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));
    let raster_dir = args
        .get(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("rasters"));

    println!("\n{}", "=".repeat(70));
    println!("NetCDF series → temporal layers");
    println!("{}", "=".repeat(70));
    println!("  Input:    {}", input.display());
    println!("  Variable: {}", variable);
    println!("  Output:   {}\n", raster_dir.display());

    let start = Instant::now();
    let cube = read_time_series(&input, variable)
        .with_context(|| format!("Failed to read {} from {}", variable, input.display()))?;
    let slices = cube.into_slices()?;
    println!(
        "  Loaded:   {} time slices ({:.3} s)",
        slices.len(),
        start.elapsed().as_secs_f64()
    );

    let paths = derive_layers(variable, &slices, &raster_dir)?;
    for path in &paths {
        println!("    {}", path.display());
    }
    println!("  Done in {:.3} s\n", start.elapsed().as_secs_f64());

    Ok(())
}
