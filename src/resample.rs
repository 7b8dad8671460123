//! Bringing two gridded datasets to a matching resolution: daily means in
//! time, block means in space, and nearest-neighbour reindexing.
use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use itertools::Itertools;
use ndarray::{s, Array1, Array3, ArrayView1};

use crate::error::RegridError;
use crate::grid::{GridDataset, GridVariable};
use crate::timestamps::datetime_to_unix_seconds;
use crate::utils::{nearest_index, RunningMean};

/// One time step per calendar day from the first to the last day present.
/// Each step is the NaN-skipping mean of the inputs on that day; days without
/// any input are entirely NaN.
pub fn resample_daily(ds: &GridDataset) -> GridDataset {
    let days: Vec<NaiveDate> = match (ds.time.iter().min(), ds.time.iter().max()) {
        (Some(first), Some(last)) => {
            let n = (last.date() - first.date()).num_days();
            (0..=n).map(|d| first.date() + Duration::days(d)).collect()
        },
        _ => Vec::new(),
    };

    let mut by_day: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
    for (i, t) in ds.time.iter().enumerate() {
        by_day.entry(t.date()).or_default().push(i);
    }

    let time: Vec<NaiveDateTime> = days.iter().filter_map(|d| d.and_hms_opt(0, 0, 0)).collect();
    let mut out = GridDataset::new(time, ds.latitude.clone(), ds.longitude.clone());
    out.attrs = ds.attrs.clone();

    let (_, nlat, nlon) = ds.shape();
    for (name, var) in ds.variables.iter() {
        let mut data = Array3::from_elem((days.len(), nlat, nlon), f32::NAN);
        for (k, day) in days.iter().enumerate() {
            let steps = match by_day.get(day) {
                Some(s) => s,
                None => continue,
            };
            let mut acc = ndarray::Array2::from_elem((nlat, nlon), RunningMean::<f32>::new());
            for &i in steps {
                ndarray::Zip::from(&mut acc)
                    .and(var.data.slice(s![i, .., ..]))
                    .for_each(|m, &v| *m += v);
            }
            data.slice_mut(s![k, .., ..]).assign(&acc.mapv(|m| m.mean().unwrap_or(f32::NAN)));
        }
        out.variables.insert(name.clone(), GridVariable::new(data, var.attrs.clone()));
    }
    out
}

/// Integer coarsening factors `round(fine / coarse)` for the latitude and longitude axes, at least 1.
pub fn coarsen_factors(fine: &GridDataset, coarse: &GridDataset) -> (usize, usize) {
    let factor = |nf: usize, nc: usize| -> usize {
        if nc == 0 {
            1
        } else {
            ((nf as f64 / nc as f64).round() as usize).max(1)
        }
    };
    (factor(fine.latitude.len(), coarse.latitude.len()), factor(fine.longitude.len(), coarse.longitude.len()))
}

/// Block-average over non-overlapping `lat_factor x lon_factor` windows. Trailing
/// rows/columns that do not fill a whole window are trimmed.
pub fn coarsen(ds: &GridDataset, lat_factor: usize, lon_factor: usize) -> GridDataset {
    let (fa, fo) = (lat_factor.max(1), lon_factor.max(1));
    let (nt, nlat, nlon) = ds.shape();
    let (clat, clon) = (nlat / fa, nlon / fo);

    let latitude = block_mean_axis(ds.latitude.view(), fa);
    let longitude = block_mean_axis(ds.longitude.view(), fo);
    let mut out = GridDataset::new(ds.time.clone(), latitude, longitude);
    out.attrs = ds.attrs.clone();

    for (name, var) in ds.variables.iter() {
        let data = Array3::from_shape_fn((nt, clat, clon), |(t, a, b)| {
            let block = var.data.slice(s![t, a * fa..(a + 1) * fa, b * fo..(b + 1) * fo]);
            let mut m = RunningMean::new();
            for &v in block.iter() {
                m += v;
            }
            m.mean().unwrap_or(f32::NAN)
        });
        out.variables.insert(name.clone(), GridVariable::new(data, var.attrs.clone()));
    }
    out
}

fn block_mean_axis(axis: ArrayView1<f32>, factor: usize) -> Array1<f32> {
    axis.exact_chunks(factor)
        .into_iter()
        .map(|c| c.iter().map(|&v| v as f64).sum::<f64>() / factor as f64)
        .map(|v| v as f32)
        .collect()
}

/// Optional maximum distances for [`reindex_nearest`]. Matches farther than
/// the tolerance become NaN; `None` accepts any distance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReindexTolerance {
    pub time: Option<Duration>,
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
}

/// Map `src` onto the coordinates `time`, `latitude` and `longitude`, taking
/// for each target coordinate the nearest source coordinate along each axis.
pub fn reindex_nearest(
    src: &GridDataset,
    time: &[NaiveDateTime],
    latitude: &Array1<f32>,
    longitude: &Array1<f32>,
    tolerance: ReindexTolerance,
) -> Result<GridDataset, RegridError> {
    let src_secs = src.time.iter().map(|&t| datetime_to_unix_seconds(t)).collect_vec();
    let src_lat = src.latitude.to_vec();
    let src_lon = src.longitude.to_vec();

    let time_idx = time.iter()
        .map(|&t| {
            let secs = datetime_to_unix_seconds(t);
            let tol = tolerance.time.map(|d| d.num_seconds() as f64);
            within(&src_secs, secs, tol)
        })
        .collect_vec();
    let lat_idx = latitude.iter().map(|&v| within(&src_lat, v, tolerance.latitude)).collect_vec();
    let lon_idx = longitude.iter().map(|&v| within(&src_lon, v, tolerance.longitude)).collect_vec();

    let mut out = GridDataset::new(time.to_vec(), latitude.clone(), longitude.clone());
    out.attrs = src.attrs.clone();
    let shape = out.shape();

    for (name, var) in src.variables.iter() {
        let data = Array3::from_shape_fn(shape, |(t, a, b)| {
            match (time_idx[t], lat_idx[a], lon_idx[b]) {
                (Some(i), Some(j), Some(k)) => var.data[[i, j, k]],
                _ => f32::NAN,
            }
        });
        out.insert(name, GridVariable::new(data, var.attrs.clone()))?;
    }
    Ok(out)
}

fn within<T: num_traits::Float>(axis: &[T], value: T, tolerance: Option<T>) -> Option<usize> {
    let i = nearest_index(axis, value)?;
    match tolerance {
        Some(tol) if (axis[i] - value).abs() > tol => None,
        _ => Some(i),
    }
}

/// Reindex `src` onto the coordinates of `like`.
pub fn reindex_like(src: &GridDataset, like: &GridDataset, tolerance: ReindexTolerance) -> Result<GridDataset, RegridError> {
    reindex_nearest(src, &like.time, &like.latitude, &like.longitude, tolerance)
}

/// Stack `ds` variable `name` as `(time, lat, lon)` after checking that it sits on `like`'s grid.
pub fn aligned_field<'a>(ds: &'a GridDataset, like: &GridDataset, name: &str) -> Result<&'a Array3<f32>, RegridError> {
    if ds.time != like.time || ds.latitude != like.latitude || ds.longitude != like.longitude {
        return Err(RegridError::GridMismatch(format!("variable {name} is not on the reference grid")));
    }
    Ok(&ds.variable(name)?.data)
}

pub(crate) fn count_finite(a: &Array3<f32>) -> usize {
    a.iter().filter(|v| v.is_finite()).count()
}
