use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::RegridError;
use crate::utils::nearest_index;

/// Default CYGNSS 25 km grid spacing, in degrees.
pub const CYGNSS_LAT_STEP: f64 = 0.224611;
pub const CYGNSS_LON_STEP: f64 = 0.224580;

/// Default region, around Palau.
pub const DEFAULT_MIN_LAT: f64 = 4.0;
pub const DEFAULT_MAX_LAT: f64 = 8.5;
pub const DEFAULT_MIN_LON: f64 = 130.5;
pub const DEFAULT_MAX_LON: f64 = 135.5;

/// A rectangular lat/lon region and the step sizes of the regular grid covering it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub lat_step: f64,
    pub lon_step: f64,
}

impl Bounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64, lat_step: f64, lon_step: f64) -> Result<Self, RegridError> {
        if !(-90.0..=90.0).contains(&min_lat) || !(-90.0..=90.0).contains(&max_lat) {
            return Err(RegridError::InvalidBounds("latitude values must be between -90 and 90".to_owned()));
        }

        if !(-180.0..=360.0).contains(&min_lon) || !(-180.0..=360.0).contains(&max_lon) {
            return Err(RegridError::InvalidBounds("longitude values must be between -180 and 360".to_owned()));
        }

        if min_lat >= max_lat || min_lon >= max_lon {
            return Err(RegridError::InvalidBounds("min values must be < max values".to_owned()));
        }

        for (name, step) in [("lat_step", lat_step), ("lon_step", lon_step)] {
            if !step.is_finite() || step <= 0.0 {
                return Err(RegridError::InvalidBounds(format!("{name} must be a positive number, got {step}")));
            }
        }

        Ok(Self { min_lat, max_lat, min_lon, max_lon, lat_step, lon_step })
    }
}

/// The regular target grid built from a [`Bounds`]. The upper bounds are exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct GridAxes {
    pub latitude: Array1<f32>,
    pub longitude: Array1<f32>,
    pub lat_step: f32,
    pub lon_step: f32,
}

impl GridAxes {
    pub fn from_bounds(bounds: &Bounds) -> Self {
        Self {
            latitude: arange_f32(bounds.min_lat, bounds.max_lat, bounds.lat_step),
            longitude: arange_f32(bounds.min_lon, bounds.max_lon, bounds.lon_step),
            lat_step: bounds.lat_step as f32,
            lon_step: bounds.lon_step as f32,
        }
    }

    /// Axes from existing coordinate values, with each step the mean spacing of its axis.
    pub fn from_coordinates(latitude: Array1<f32>, longitude: Array1<f32>) -> Option<Self> {
        let lat_step = mean_spacing(&latitude)?;
        let lon_step = mean_spacing(&longitude)?;
        Some(Self { latitude, longitude, lat_step, lon_step })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.latitude.len(), self.longitude.len())
    }

    pub fn nearest_lat(&self, lat: f32) -> Option<usize> {
        nearest_on_axis(&self.latitude, self.lat_step, lat)
    }

    pub fn nearest_lon(&self, lon: f32) -> Option<usize> {
        nearest_on_axis(&self.longitude, self.lon_step, lon)
    }

    /// Range of axis indices whose coordinate lies in `[lo, hi]`.
    pub(crate) fn lat_range(&self, lo: f32, hi: f32) -> std::ops::Range<usize> {
        axis_range(&self.latitude, self.lat_step, lo, hi)
    }

    pub(crate) fn lon_range(&self, lo: f32, hi: f32) -> std::ops::Range<usize> {
        axis_range(&self.longitude, self.lon_step, lo, hi)
    }

    /// Bring a longitude into the convention (-180..180 or 0..360) of this grid.
    pub fn wrap_longitude(&self, lon: f32) -> f32 {
        let signed = self.longitude.last().map(|&l| l <= 180.0).unwrap_or(true);
        if signed && lon > 180.0 {
            lon - 360.0
        } else if !signed && lon < 0.0 {
            lon + 360.0
        } else {
            lon
        }
    }
}

/// `min, min + step, ...` up to but excluding `max`, with `ceil((max - min) / step)` elements.
pub fn arange_f32(min: f64, max: f64, step: f64) -> Array1<f32> {
    let n = ((max - min) / step).ceil().max(0.0) as usize;
    Array1::from_iter((0..n).map(|i| (min + i as f64 * step) as f32))
}

fn mean_spacing(axis: &Array1<f32>) -> Option<f32> {
    let n = axis.len();
    if n < 2 {
        return None
    }
    let step = (axis[n - 1] - axis[0]) / (n - 1) as f32;
    (step.is_finite() && step > 0.0).then_some(step)
}

fn nearest_on_axis(axis: &Array1<f32>, step: f32, value: f32) -> Option<usize> {
    let (first, last) = (*axis.first()?, *axis.last()?);
    let half = step / 2.0;
    if value < first - half || value > last + half {
        return None
    }
    nearest_index(axis.as_slice()?, value)
}

fn axis_range(axis: &Array1<f32>, step: f32, lo: f32, hi: f32) -> std::ops::Range<usize> {
    let n = axis.len();
    let first = match axis.first() {
        Some(&f) => f,
        None => return 0..0,
    };
    if !lo.is_finite() || !hi.is_finite() || hi < lo {
        return 0..0;
    }

    let start = ((lo - first) / step).ceil().max(0.0) as usize;
    let end = (((hi - first) / step).floor() + 1.0).max(0.0) as usize;
    let (start, end) = (start.min(n), end.min(n));

    // Rounding in the division can put a node just outside [lo, hi]; trim those.
    let start = (start..end).find(|&i| axis[i] >= lo).unwrap_or(end);
    let end = (start..end).rev().find(|&i| axis[i] <= hi).map(|i| i + 1).unwrap_or(start);
    start..end
}


#[cfg(test)]
mod tests {
    use super::*;

    fn palau() -> Bounds {
        Bounds::new(DEFAULT_MIN_LAT, DEFAULT_MAX_LAT, DEFAULT_MIN_LON, DEFAULT_MAX_LON, CYGNSS_LAT_STEP, CYGNSS_LON_STEP).unwrap()
    }

    #[test]
    fn test_bounds_validation() {
        assert!(Bounds::new(4.0, 8.5, 130.5, 135.5, 0.1, 0.1).is_ok());
        assert!(Bounds::new(8.5, 4.0, 130.5, 135.5, 0.1, 0.1).is_err());
        assert!(Bounds::new(4.0, 8.5, 135.5, 130.5, 0.1, 0.1).is_err());
        assert!(Bounds::new(-100.0, 8.5, 130.5, 135.5, 0.1, 0.1).is_err());
        assert!(Bounds::new(4.0, 8.5, 130.5, 400.0, 0.1, 0.1).is_err());
        assert!(Bounds::new(4.0, 8.5, 130.5, 135.5, 0.0, 0.1).is_err());
        assert!(Bounds::new(4.0, 8.5, 130.5, 135.5, 0.1, f64::NAN).is_err());
    }

    #[test]
    fn test_axes_follow_arange() {
        let axes = GridAxes::from_bounds(&palau());
        // ceil(4.5 / 0.224611) = 21, ceil(5.0 / 0.224580) = 23
        assert_eq!(axes.shape(), (21, 23));
        assert_eq!(axes.latitude[0], 4.0);
        assert!(*axes.latitude.last().unwrap() < 8.5);
        assert!(*axes.longitude.last().unwrap() < 135.5);

        let a = arange_f32(0.0, 1.0, 0.25);
        assert_eq!(a.to_vec(), vec![0.0, 0.25, 0.5, 0.75]);
    }

    #[test]
    fn test_axes_from_coordinates() {
        let built = GridAxes::from_bounds(&palau());
        let axes = GridAxes::from_coordinates(built.latitude.clone(), built.longitude.clone()).unwrap();
        assert_eq!(axes.latitude, built.latitude);
        assert!((axes.lat_step - built.lat_step).abs() < 1e-5);
        assert!((axes.lon_step - built.lon_step).abs() < 1e-5);

        assert!(GridAxes::from_coordinates(Array1::from_vec(vec![4.0]), built.longitude.clone()).is_none());
        assert!(GridAxes::from_coordinates(Array1::from_vec(vec![5.0, 4.0]), built.longitude).is_none());
    }

    #[test]
    fn test_nearest_node() {
        let axes = GridAxes::from_bounds(&Bounds::new(0.0, 1.0, 10.0, 11.0, 0.25, 0.5).unwrap());
        assert_eq!(axes.nearest_lat(0.3), Some(1));
        assert_eq!(axes.nearest_lat(0.8), Some(3));
        assert_eq!(axes.nearest_lat(0.87), Some(3));
        assert_eq!(axes.nearest_lat(0.9), None);
        assert_eq!(axes.nearest_lat(-0.2), None);
        assert_eq!(axes.nearest_lon(10.6), Some(1));
        assert_eq!(axes.nearest_lon(f32::NAN), None);
    }

    #[test]
    fn test_axis_range() {
        let axes = GridAxes::from_bounds(&Bounds::new(0.0, 1.0, 10.0, 11.0, 0.25, 0.5).unwrap());
        assert_eq!(axes.lat_range(0.1, 0.6), 1..3);
        assert_eq!(axes.lat_range(0.25, 0.5), 1..3);
        assert_eq!(axes.lat_range(-1.0, 5.0), 0..4);
        assert_eq!(axes.lat_range(2.0, 3.0), 4..4);
        assert_eq!(axes.lon_range(10.1, 10.4), 1..1);
    }

    #[test]
    fn test_wrap_longitude() {
        let signed = GridAxes::from_bounds(&Bounds::new(0.0, 1.0, 130.5, 135.5, 0.5, 0.5).unwrap());
        assert_eq!(signed.wrap_longitude(190.0), -170.0);
        assert_eq!(signed.wrap_longitude(131.0), 131.0);

        let unsigned = GridAxes::from_bounds(&Bounds::new(0.0, 1.0, 170.0, 200.0, 0.5, 0.5).unwrap());
        assert_eq!(unsigned.wrap_longitude(-170.0), 190.0);
        assert_eq!(unsigned.wrap_longitude(175.0), 175.0);
    }
}
