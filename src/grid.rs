//! Sampling points over a bounding box.

use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

const COORDINATE_PRECISION: f64 = 100.0;
const STEP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GridPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// `lat,lng` form used by the Places `location` parameter.
    pub fn as_location(&self) -> String {
        format!("{},{}", self.latitude, self.longitude)
    }
}

/// Upper bound on the cells one seed request may create.
pub const MAX_GRID_POINTS: usize = 250_000;

/// Latitude-major enumeration of the grid, both bounds inclusive of the first point.
///
/// Refuses grids larger than [`MAX_GRID_POINTS`] before allocating anything.
pub fn generate(bbox: &BoundingBox, step: f64) -> AppResult<Vec<GridPoint>> {
    let total = point_count(bbox, step)
        .filter(|total| *total <= MAX_GRID_POINTS)
        .ok_or_else(|| {
            AppError::InvalidRequest(format!(
                "step {step} yields more than {MAX_GRID_POINTS} grid points"
            ))
        })?;
    if total == 0 {
        return Ok(Vec::new());
    }

    let lats = axis(bbox.min_lat, bbox.max_lat, step);
    let lngs = axis(bbox.min_lng, bbox.max_lng, step);

    let mut points = Vec::with_capacity(total);
    for lat in &lats {
        for lng in &lngs {
            points.push(GridPoint::new(*lat, *lng));
        }
    }
    Ok(points)
}

/// Number of points `generate` would produce, `None` when it does not fit in `usize`.
pub fn point_count(bbox: &BoundingBox, step: f64) -> Option<usize> {
    axis_len(bbox.min_lat, bbox.max_lat, step)
        .checked_mul(axis_len(bbox.min_lng, bbox.max_lng, step))
}

pub fn axis_len(min: f64, max: f64, step: f64) -> usize {
    if !(step.is_finite() && step > 0.0) || !min.is_finite() || !max.is_finite() || max < min {
        return 0;
    }
    (((max - min) / step + STEP_EPSILON).floor() as usize).saturating_add(1)
}

fn axis(min: f64, max: f64, step: f64) -> Vec<f64> {
    (0..axis_len(min, max, step))
        .map(|i| round_coordinate(min + step * i as f64).clamp(min, max))
        .collect()
}

fn round_coordinate(value: f64) -> f64 {
    (value * COORDINATE_PRECISION).round() / COORDINATE_PRECISION
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toronto() -> BoundingBox {
        BoundingBox {
            min_lat: 43.47,
            max_lat: 43.63,
            min_lng: -79.64,
            max_lng: -79.60,
        }
    }

    #[test]
    fn counts_steps_per_axis() {
        assert_eq!(axis_len(43.47, 43.63, 0.01), 17);
        assert_eq!(axis_len(-79.64, -79.60, 0.01), 5);
        assert_eq!(generate(&toronto(), 0.01).unwrap().len(), 17 * 5);
    }

    #[test]
    fn points_stay_inside_the_box() {
        let bbox = toronto();
        for point in generate(&bbox, 0.01).unwrap() {
            assert!(point.latitude >= bbox.min_lat && point.latitude <= bbox.max_lat);
            assert!(point.longitude >= bbox.min_lng && point.longitude <= bbox.max_lng);
        }
    }

    #[test]
    fn enumerates_latitude_outer_longitude_inner() {
        let points = generate(&toronto(), 0.01).unwrap();
        assert_eq!(points[0], GridPoint::new(43.47, -79.64));
        assert_eq!(points[1], GridPoint::new(43.47, -79.63));
        assert_eq!(points[5], GridPoint::new(43.48, -79.64));
        assert_eq!(points.last().copied(), Some(GridPoint::new(43.63, -79.60)));
    }

    #[test]
    fn generation_is_deterministic() {
        assert_eq!(
            generate(&toronto(), 0.01).unwrap(),
            generate(&toronto(), 0.01).unwrap()
        );
    }

    #[test]
    fn degenerate_boxes_yield_nothing() {
        let inverted = BoundingBox {
            min_lat: 43.63,
            max_lat: 43.47,
            ..toronto()
        };
        assert!(generate(&inverted, 0.01).unwrap().is_empty());
        assert!(generate(&toronto(), 0.0).unwrap().is_empty());
        assert!(generate(&toronto(), -0.5).unwrap().is_empty());

        let single = BoundingBox {
            min_lat: 10.0,
            max_lat: 10.0,
            min_lng: 20.0,
            max_lng: 20.0,
        };
        assert_eq!(generate(&single, 0.5).unwrap(), vec![GridPoint::new(10.0, 20.0)]);
    }

    #[test]
    fn refuses_grids_past_the_point_limit() {
        assert_eq!(point_count(&toronto(), 0.01), Some(17 * 5));
        assert!(point_count(&toronto(), 1e-7).unwrap() > MAX_GRID_POINTS);

        let err = generate(&toronto(), 1e-7).unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));

        let world = BoundingBox {
            min_lat: -90.0,
            max_lat: 90.0,
            min_lng: -180.0,
            max_lng: 180.0,
        };
        assert_eq!(point_count(&world, f64::MIN_POSITIVE), None);
        assert!(generate(&world, f64::MIN_POSITIVE).is_err());

        let inverted_lng = BoundingBox {
            min_lng: 10.0,
            max_lng: -10.0,
            ..world
        };
        assert!(generate(&inverted_lng, 1e-12).unwrap().is_empty());
    }
}
