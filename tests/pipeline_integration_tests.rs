// End-to-end pipeline tests on synthetic survey exports and rasters
//
// Run with: cargo test --test pipeline_integration_tests

use abundance_sdm_rust::config::{DataSource, PipelineConfig};
use abundance_sdm_rust::dataset::list_partitions;
use abundance_sdm_rust::loaders::BadFilePolicy;
use abundance_sdm_rust::model::GlmError;
use abundance_sdm_rust::spatial::geotiff::write_geotiff;
use abundance_sdm_rust::spatial::{GridSpec, Raster, RasterStack};
use abundance_sdm_rust::{observations_to_frame, AbundancePipeline, GeoPoint, Observation};
use std::fs;
use std::path::{Path, PathBuf};

const WIDTH: usize = 6;
const HEIGHT: usize = 5;

fn grid() -> GridSpec {
    GridSpec {
        west: -10.0,
        north: 48.0,
        pixel_width: 1.0,
        pixel_height: 1.0,
        width: WIDTH,
        height: HEIGHT,
    }
}

fn covariates() -> Vec<String> {
    vec!["thetao_mean".to_string(), "so_mean".to_string()]
}

fn write_rasters(dir: &Path, grid: GridSpec) {
    fs::create_dir_all(dir).unwrap();
    let mut temp = Vec::new();
    let mut sal = Vec::new();
    for row in 0..grid.height {
        for col in 0..grid.width {
            temp.push(Some(8.0 + 1.5 * col as f64 + 0.4 * row as f64));
            sal.push(Some(35.5 - 0.3 * row as f64 + 0.05 * (col * col) as f64));
        }
    }
    write_geotiff(&Raster::new("thetao_mean", grid, temp).unwrap(), dir.join("thetao_mean.tif")).unwrap();
    write_geotiff(&Raster::new("so_mean", grid, sal).unwrap(), dir.join("so_mean.tif")).unwrap();
}

/// One haul per raster pixel, centred on the pixel, about 1.1 km long
fn biotic_export(year: i32) -> String {
    let mut hauls = String::from(
        "Haul,Header,HaulGear,HaulNumber,HaulStationName,HaulStartTime,HaulStartLatitude,HaulStartLongitude,HaulStopLatitude,HaulStopLongitude\n",
    );
    let mut catches = String::from(
        "Catch,Header,CatchDataType,HaulNumber,CatchSpeciesCode,CatchWeightUnit,CatchSpeciesCategoryWeight\n",
    );

    let g = grid();
    let mut n = 0;
    for row in 0..HEIGHT {
        for col in 0..WIDTH {
            n += 1;
            let centre = g.cell_center(row, col);
            hauls.push_str(&format!(
                "Haul,Record,PTM,{n},ST{n:03},{year}-09-12 06:30,{:.4},{:.4},{:.4},{:.4}\n",
                centre.lat - 0.005,
                centre.lon,
                centre.lat + 0.005,
                centre.lon,
            ));
            let k = 20 + 4 * col + (year as usize % 2) * 3 + (col * row) % 3;
            let k = k.saturating_sub(3 * row);
            catches.push_str(&format!("Catch,Record,R,{n},126417,kg,{}\n", 1000 * k));
            catches.push_str(&format!("Catch,Record,R,{n},126421,kg,5\n"));
        }
    }

    format!("Header,Record,Header,Version\nHeader,Record,1\n{hauls}{catches}")
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        for year in [2019, 2020] {
            let year_dir = root.join("ices_biotic").join(year.to_string());
            fs::create_dir_all(&year_dir).unwrap();
            fs::write(year_dir.join(format!("biotic_{year}.csv")), biotic_export(year)).unwrap();
        }
        write_rasters(&root.join("rasters"), grid());
        Self { _dir: dir, root }
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            survey_dir: self.root.join("ices_biotic"),
            dataset_dir: self.root.join("observations"),
            raster_dir: self.root.join("rasters"),
            output_dir: self.root.join("output"),
            covariates: covariates(),
            quadratic_covariate: Some("thetao_mean".to_string()),
            ..Default::default()
        }
    }
}

#[test]
fn test_end_to_end_survey_run() {
    let fixture = Fixture::new();
    let pipeline = AbundancePipeline::new(fixture.config()).unwrap();
    let report = pipeline.run().unwrap();

    // other species filtered out, one record per haul and year
    assert_eq!(report.observations, 60);
    assert_eq!(report.outside_study_area, 0);
    assert_eq!(report.aggregated_records, 60);

    let exclusions = report.exclusions.as_ref().unwrap();
    assert_eq!(exclusions.missing_abundance, 0);
    assert_eq!(exclusions.missing_covariate, 0);
    assert!(exclusions.outliers <= 1);
    assert_eq!(exclusions.retained + exclusions.outliers, 60);

    let model = report.model.as_ref().unwrap();
    assert_eq!(model.formula, "abundance ~ thetao_mean + I(thetao_mean^2) + so_mean");
    assert_eq!(model.coefficients.len(), 4);
    assert!(model.deviance <= model.null_deviance);

    assert_eq!(report.predicted_pixels, Some(WIDTH * HEIGHT));

    let out = fixture.root.join("output");
    for name in [
        "aggregated.csv",
        "standardization.json",
        "training.csv",
        "model.json",
        "partial_effects.csv",
        "prediction.tif",
        "prediction.csv",
        "run_report.json",
    ] {
        assert!(out.join(name).is_file(), "missing output {}", name);
    }

    let curves = fs::read_to_string(out.join("partial_effects.csv")).unwrap();
    // header + 100 points per covariate
    assert_eq!(curves.lines().count(), 1 + 2 * 100);
}

#[test]
fn test_partitioned_dataset_reused() {
    let fixture = Fixture::new();
    let first = AbundancePipeline::new(fixture.config()).unwrap().run().unwrap();

    let years: Vec<i32> = list_partitions(&fixture.root.join("observations"))
        .unwrap()
        .into_iter()
        .map(|(y, _)| y)
        .collect();
    assert_eq!(years, vec![2019, 2020]);

    let config = PipelineConfig {
        source: DataSource::Partitioned,
        write_dataset: false,
        output_dir: fixture.root.join("output_partitioned"),
        ..fixture.config()
    };
    let second = AbundancePipeline::new(config).unwrap().run().unwrap();

    assert_eq!(second.observations, first.observations);
    assert_eq!(second.aggregated_records, first.aggregated_records);
    let (a, b) = (first.model.unwrap(), second.model.unwrap());
    for (x, y) in a.coefficients.iter().zip(&b.coefficients) {
        assert!((x.1 - y.1).abs() < 1e-9, "{} differs: {} vs {}", x.0, x.1, y.1);
    }
}

#[test]
fn test_unknown_species_ends_gracefully() {
    let fixture = Fixture::new();
    let config = PipelineConfig {
        species_codes: vec!["999999".to_string()],
        ..fixture.config()
    };
    let report = AbundancePipeline::new(config).unwrap().run().unwrap();

    assert_eq!(report.observations, 0);
    assert!(report.model.is_none());
    assert!(report.outputs.is_empty());
}

#[test]
fn test_empty_training_set_is_terminal() {
    let fixture = Fixture::new();
    let pipeline = AbundancePipeline::new(fixture.config()).unwrap();

    let observations: Vec<Observation> = (0..5)
        .map(|i| Observation {
            year: 2020,
            species_code: "126417".to_string(),
            station: Some(format!("ST{}", i)),
            timestamp: None,
            point: GeoPoint::new(-15.0 + 0.2 * i as f64, 30.0),
            weight: Some(10.0),
            weight_unit: Some("kg".to_string()),
            measurement_type: "catch_weight".to_string(),
            distance_m: Some(1.0),
            abundance: Some(10.0),
        })
        .collect();
    let df = observations_to_frame(&observations).unwrap();

    // rasters cover -10..-4, observations sit at -15..-14
    let stack = RasterStack::load_dir(&fixture.root.join("rasters"), &covariates()).unwrap();
    let err = pipeline.run_on(&df, &stack).unwrap_err();

    assert!(matches!(err.downcast_ref::<GlmError>(), Some(GlmError::EmptyInput)));
}

#[test]
fn test_bad_file_policy() {
    let fixture = Fixture::new();
    fs::write(
        fixture.root.join("ices_biotic").join("2019").join("broken.csv"),
        "Haul,Header,HaulNumber\nHaul,Record,1\n",
    )
    .unwrap();

    assert!(AbundancePipeline::new(fixture.config()).unwrap().run().is_err());

    let config = PipelineConfig {
        bad_file_policy: BadFilePolicy::Skip,
        ..fixture.config()
    };
    let report = AbundancePipeline::new(config).unwrap().run().unwrap();
    assert_eq!(report.observations, 60);
}

#[test]
fn test_missing_raster_layer_fails() {
    let fixture = Fixture::new();
    let config = PipelineConfig {
        covariates: vec!["thetao_mean".to_string(), "o2_mean".to_string()],
        ..fixture.config()
    };
    let err = AbundancePipeline::new(config).unwrap().run().unwrap_err();
    assert!(format!("{:#}", err).contains("o2_mean"));
}
