//! Hexagonal Grid Index
//!
//! Maps geographic points to cells of the H3 hierarchical hexagonal grid at a
//! fixed resolution. The mapping is a pure function: same point and resolution
//! always give the same cell. The inverse returns the cell centroid, not the
//! original point.

use super::GeoPoint;
use geo::{Distance, Geodesic, Point};
use h3o::{CellIndex, LatLng, Resolution};
use thiserror::Error;

/// Errors raised while indexing points
#[derive(Debug, Error)]
pub enum IndexError {
    /// Coordinates outside WGS84 ranges or not finite
    #[error("invalid coordinate (lon={lon}, lat={lat}): {reason}")]
    InvalidCoordinate { lon: f64, lat: f64, reason: String },

    /// Grid resolution outside 0..=15
    #[error("invalid hex grid resolution: {0}")]
    InvalidResolution(u8),

    /// Raw value is not a valid cell index
    #[error("invalid cell index: {0:#x}")]
    InvalidCell(u64),
}

/// Parse a resolution level (0-15)
pub fn resolution(level: u8) -> Result<Resolution, IndexError> {
    Resolution::try_from(level).map_err(|_| IndexError::InvalidResolution(level))
}

/// Reject non-finite or out-of-range WGS84 coordinates
fn validate(point: GeoPoint) -> Result<(), IndexError> {
    let invalid = |reason: &str| IndexError::InvalidCoordinate {
        lon: point.lon,
        lat: point.lat,
        reason: reason.to_string(),
    };

    if !point.lon.is_finite() || !point.lat.is_finite() {
        return Err(invalid("not finite"));
    }
    if !(-90.0..=90.0).contains(&point.lat) {
        return Err(invalid("latitude outside [-90, 90]"));
    }
    if !(-180.0..=180.0).contains(&point.lon) {
        return Err(invalid("longitude outside [-180, 180]"));
    }
    Ok(())
}

/// Map a point to its hex cell
///
/// Fails fast on non-finite or out-of-range coordinates instead of producing
/// a degenerate cell.
pub fn point_to_cell(point: GeoPoint, resolution: Resolution) -> Result<CellIndex, IndexError> {
    validate(point)?;
    let ll = LatLng::new(point.lat, point.lon).map_err(|e| IndexError::InvalidCoordinate {
        lon: point.lon,
        lat: point.lat,
        reason: e.to_string(),
    })?;
    Ok(ll.to_cell(resolution))
}

/// Centroid of a cell
pub fn cell_to_point(cell: CellIndex) -> GeoPoint {
    let ll = LatLng::from(cell);
    GeoPoint::new(ll.lng(), ll.lat())
}

/// Rebuild a cell from its stored 64-bit representation
pub fn cell_from_u64(raw: u64) -> Result<CellIndex, IndexError> {
    CellIndex::try_from(raw).map_err(|_| IndexError::InvalidCell(raw))
}

/// Geodesic distance on the WGS84 ellipsoid, in metres
pub fn geodesic_m(a: GeoPoint, b: GeoPoint) -> Result<f64, IndexError> {
    validate(a)?;
    validate(b)?;
    Ok(Geodesic::distance(Point::new(a.lon, a.lat), Point::new(b.lon, b.lat)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_point_to_cell_deterministic() {
        let res = resolution(7).unwrap();
        let points = [
            GeoPoint::new(-3.21, 43.57),
            GeoPoint::new(-9.87, 37.02),
            GeoPoint::new(2.5, 51.2),
            GeoPoint::new(-18.9, 26.1),
        ];

        for p in points {
            let a = point_to_cell(p, res).unwrap();
            let b = point_to_cell(p, res).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.resolution(), res);
        }
    }

    #[test]
    fn test_centroid_lies_within_cell() {
        let res = resolution(7).unwrap();
        for i in 0..25 {
            let p = GeoPoint::new(-15.0 + i as f64 * 0.73, 30.0 + i as f64 * 0.91);
            let cell = point_to_cell(p, res).unwrap();
            let centroid = cell_to_point(cell);
            // The centroid maps back to the same cell
            assert_eq!(point_to_cell(centroid, res).unwrap(), cell);
        }
    }

    #[test]
    fn test_nearby_points_share_cell() {
        let res = resolution(7).unwrap();
        let cell = point_to_cell(GeoPoint::new(-3.21, 43.57), res).unwrap();
        let centroid = cell_to_point(cell);
        let nudged = GeoPoint::new(centroid.lon + 1e-6, centroid.lat - 1e-6);
        assert_eq!(point_to_cell(nudged, res).unwrap(), cell);
    }

    #[test]
    fn test_invalid_coordinates_fail_fast() {
        let res = resolution(7).unwrap();
        assert!(point_to_cell(GeoPoint::new(0.0, 91.0), res).is_err());
        assert!(point_to_cell(GeoPoint::new(181.0, 10.0), res).is_err());
        assert!(point_to_cell(GeoPoint::new(f64::NAN, 10.0), res).is_err());

        let err = point_to_cell(GeoPoint::new(0.0, -95.0), res).unwrap_err();
        assert!(err.to_string().contains("latitude"));
    }

    #[test]
    fn test_invalid_resolution() {
        assert!(resolution(16).is_err());
        assert!(resolution(15).is_ok());
    }

    #[test]
    fn test_cell_u64_roundtrip() {
        let res = resolution(7).unwrap();
        let cell = point_to_cell(GeoPoint::new(-3.21, 43.57), res).unwrap();
        assert_eq!(cell_from_u64(u64::from(cell)).unwrap(), cell);
        assert!(cell_from_u64(0).is_err());
    }

    #[test]
    fn test_geodesic_haul_distances() {
        // East-west tow at 43.5N
        let ew = geodesic_m(GeoPoint::new(-3.20, 43.5), GeoPoint::new(-3.10, 43.5)).unwrap();
        assert_relative_eq!(ew, 8_087.667, max_relative = 1e-4);

        // North-south tow along 3.2W
        let ns = geodesic_m(GeoPoint::new(-3.20, 43.50), GeoPoint::new(-3.20, 43.60)).unwrap();
        assert_relative_eq!(ns, 11_110.346, max_relative = 1e-4);

        let same = geodesic_m(GeoPoint::new(-4.0, 44.0), GeoPoint::new(-4.0, 44.0)).unwrap();
        assert_eq!(same, 0.0);
    }

    #[test]
    fn test_geodesic_rejects_invalid_points() {
        let ok = GeoPoint::new(-3.2, 43.5);
        assert!(geodesic_m(ok, GeoPoint::new(-3.2, f64::NAN)).is_err());
        assert!(geodesic_m(GeoPoint::new(200.0, 43.5), ok).is_err());
    }
}
