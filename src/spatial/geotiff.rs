//! GeoTIFF layers
//!
//! Reads and writes single-band GeoTIFF rasters with the pure Rust `tiff`
//! crate. Geolocation comes from ModelPixelScale (tag 33550) and
//! ModelTiepoint (tag 33922); nodata from the GDAL_NODATA tag (42113).

use super::raster::{GridSpec, Raster, RasterError};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

const MODEL_PIXEL_SCALE: Tag = Tag::Unknown(33550);
const MODEL_TIEPOINT: Tag = Tag::Unknown(33922);
const GDAL_NODATA: Tag = Tag::Unknown(42113);

/// Nodata sentinel written for undefined cells
pub const NODATA: f64 = -9999.0;

/// Load a GeoTIFF as a named layer
///
/// NaN, infinite and nodata-valued pixels become undefined cells.
pub fn read_geotiff<P: AsRef<Path>>(path: P, name: &str) -> Result<Raster, RasterError> {
    let file = File::open(&path)?;
    let mut decoder = Decoder::new(file)?;

    let (width, height) = decoder.dimensions()?;

    let pixel_scale = decoder.get_tag_f64_vec(MODEL_PIXEL_SCALE).ok();
    let model_tiepoint = decoder.get_tag_f64_vec(MODEL_TIEPOINT).ok();

    let grid = match (pixel_scale, model_tiepoint) {
        // ModelTiepoint: [I, J, K, X, Y, Z], ModelPixelScale: [ScaleX, ScaleY, ScaleZ]
        (Some(scale), Some(tie)) if tie.len() >= 6 && scale.len() >= 2 => GridSpec {
            west: tie[3] - tie[0] * scale[0],
            north: tie[4] + tie[1] * scale[1],
            pixel_width: scale[0],
            pixel_height: scale[1],
            width: width as usize,
            height: height as usize,
        },
        _ => {
            return Err(RasterError::MissingGeotransform(format!(
                "{}: no ModelPixelScale/ModelTiepoint tags",
                path.as_ref().display()
            )))
        }
    };

    let nodata: Option<f64> = decoder
        .get_tag_ascii_string(GDAL_NODATA)
        .ok()
        .and_then(|s| s.trim_matches(char::from(0)).trim().parse().ok());

    let flat: Vec<f64> = match decoder.read_image()? {
        DecodingResult::U8(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U16(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U64(data) => data.into_iter().map(|v| v as f64).collect(),
        DecodingResult::F32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::F64(data) => data,
        DecodingResult::I8(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::I16(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::I32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::I64(data) => data.into_iter().map(|v| v as f64).collect(),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(RasterError::UnsupportedDataType(format!(
                "{}: unsupported sample format",
                path.as_ref().display()
            )))
        }
    };

    let values = flat
        .into_iter()
        .map(|v| {
            let is_nodata = nodata.map_or(false, |nd| (v - nd).abs() < 1e-6);
            if v.is_finite() && !is_nodata {
                Some(v)
            } else {
                None
            }
        })
        .collect();

    Raster::new(name, grid, values)
}

/// Write a layer as a 64-bit float GeoTIFF (undefined cells → `NODATA`)
pub fn write_geotiff<P: AsRef<Path>>(raster: &Raster, path: P) -> Result<(), RasterError> {
    let file = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(file)?;

    let grid = raster.grid;
    let mut image =
        encoder.new_image::<colortype::Gray64Float>(grid.width as u32, grid.height as u32)?;

    let scale = [grid.pixel_width, grid.pixel_height, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, grid.west, grid.north, 0.0];
    let nodata = format!("{}", NODATA);

    image.encoder().write_tag(MODEL_PIXEL_SCALE, &scale[..])?;
    image.encoder().write_tag(MODEL_TIEPOINT, &tiepoint[..])?;
    image.encoder().write_tag(GDAL_NODATA, nodata.as_str())?;

    let data: Vec<f64> = raster
        .values()
        .iter()
        .map(|v| v.unwrap_or(NODATA))
        .collect();
    image.write_data(&data)?;

    Ok(())
}
