//! Build the year-partitioned observation dataset from ICES biotic exports
//!
//! Parses every year folder once and writes `year=YYYY/part-0.parquet`
//! partitions, so pipeline runs can use `"source": "partitioned"`.
//!
//! Usage:
//!   cargo run --release --bin build_survey_dataset -- <survey_dir> <dataset_dir> [--skip-bad-files]

use abundance_sdm_rust::dataset::write_partitioned;
use abundance_sdm_rust::loaders::{load_survey_folder, BadFilePolicy};
use abundance_sdm_rust::observations_to_frame;
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
    let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));
    let survey_dir = args
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("ices_biotic"));
    let dataset_dir = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("observations"));
    let policy = if args.iter().any(|a| a == "--skip-bad-files") {
        BadFilePolicy::Skip
    } else {
        BadFilePolicy::Fail
    };

    println!("\n{}", "=".repeat(70));
    println!("ICES biotic → partitioned Parquet");
    println!("{}", "=".repeat(70));
    println!("  Survey:  {}", survey_dir.display());
    println!("  Dataset: {}", dataset_dir.display());
    println!("  Bad files: {:?}\n", policy);

    let load_start = Instant::now();
    let observations = load_survey_folder(&survey_dir, policy)?;
    let df = observations_to_frame(&observations)?;
    println!(
        "  Loaded:  {} rows × {} columns ({:.3} s)",
        df.height(),
        df.width(),
        load_start.elapsed().as_secs_f64()
    );

    if df.height() == 0 {
        println!("  No observations found; nothing written\n");
        return Ok(());
    }

    let write_start = Instant::now();
    let paths = write_partitioned(&df, &dataset_dir)?;
    println!(
        "  Written: {} partitions ({:.3} s)",
        paths.len(),
        write_start.elapsed().as_secs_f64()
    );
    for path in &paths {
        let size = std::fs::metadata(path)?.len() as f64 / 1024.0;
        println!("    {} ({:.1} KB)", path.display(), size);
    }
    println!();

    Ok(())
}
