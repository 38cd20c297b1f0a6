//! Spatial prediction
//!
//! Applies a fitted model to every pixel of the covariate rasters over the
//! observation extent. Rasters are standardized with the parameters saved at
//! extraction time and fed through `FittedModel::predict_response`, so a
//! pixel holding a training cell reproduces that cell's fitted value.

use super::covariates::Standardization;
use super::glm::FittedModel;
use crate::data::{columns, frame_points};
use crate::spatial::{BoundingBox, Raster, RasterStack};
use anyhow::{Context, Result};
use polars::prelude::*;
use tracing::info;

pub const PREDICTION_LAYER: &str = "predicted_abundance";

/// Bounding box of all observation coordinates, `None` for no observations
pub fn observation_extent(df: &DataFrame) -> Result<Option<BoundingBox>> {
    let points = frame_points(df)?;
    Ok(BoundingBox::from_points(points.into_iter().flatten()))
}

/// Expected abundance per pixel within `extent`
///
/// A pixel with any undefined covariate stays undefined.
pub fn predict_surface(
    model: &FittedModel,
    stack: &RasterStack,
    standardization: &Standardization,
    extent: &BoundingBox,
) -> Result<Raster> {
    let names = &model.spec.covariates;
    let selected = stack
        .select(names)
        .with_context(|| "predictor: Covariate rasters do not match the model")?
        .crop(extent)
        .with_context(|| format!("predictor: Cannot crop rasters to {:?}", extent))?;
    let standardized = standardization.apply(&selected, names)?;

    let layers = standardized.layers();
    let Some(grid) = standardized.grid() else {
        anyhow::bail!("predictor: No covariate layers selected");
    };

    let mut values = Vec::with_capacity(grid.len());
    let mut x = vec![0.0; layers.len()];
    for i in 0..grid.len() {
        let mut complete = true;
        for (slot, layer) in x.iter_mut().zip(layers) {
            match layer.values()[i] {
                Some(v) => *slot = v,
                None => {
                    complete = false;
                    break;
                }
            }
        }
        values.push(if complete {
            Some(model.predict_response(&x)?)
        } else {
            None
        });
    }

    let surface = Raster::new(PREDICTION_LAYER, grid, values)?;
    info!(
        "Predicted {} of {} pixels over {}x{} grid",
        surface.defined_count(),
        grid.len(),
        grid.width,
        grid.height
    );
    Ok(surface)
}

/// Pixel-centre table (longitude, latitude, value) for mapping
pub fn surface_to_frame(raster: &Raster) -> Result<DataFrame> {
    let grid = raster.grid;
    let mut lons = Vec::with_capacity(grid.len());
    let mut lats = Vec::with_capacity(grid.len());

    for row in 0..grid.height {
        for col in 0..grid.width {
            let centre = grid.cell_center(row, col);
            lons.push(centre.lon);
            lats.push(centre.lat);
        }
    }

    let df = df![
        columns::LONGITUDE => lons,
        columns::LATITUDE => lats,
        raster.name.as_str() => raster.values().to_vec(),
    ]?;
    Ok(df)
}
