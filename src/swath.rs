//! Level-2 ocean color swaths (e.g. PACE OCI BGC) and their regridding onto a
//! regular latitude/longitude grid.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use indicatif::ParallelProgressIterator;
use itertools::{iproduct, Itertools};
use log::{debug, warn};
use ndarray::{Array2, ArrayView2, Axis, Ix2};
use netcdf::AttrValue;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::bounds::GridAxes;
use crate::error::RegridError;
use crate::grid::{GridDataset, GridVariable};
use crate::timestamps::{timestamp_to_datetime, FileNaming};
use crate::utils::{collect_attributes, file_sha256, list_files_with_ext, load_decoded_var, ShowProgress};

/// Extension of the Level-2 swath files.
pub const SWATH_EXTENSION: &str = "nc";

pub const NAVIGATION_GROUP: &str = "navigation_data";
pub const GEOPHYSICAL_GROUP: &str = "geophysical_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegridMethod {
    /// Inverse-bilinear interpolation inside the quadrilateral of four neighbouring swath pixels
    #[default]
    Bilinear,
    /// Value of the closest swath pixel within one grid step of the node
    Nearest,
}

/// The pixel geolocation of one swath.
#[derive(Debug, Clone)]
pub struct SwathNavigation {
    pub latitude: Array2<f32>,
    pub longitude: Array2<f32>,
}

impl SwathNavigation {
    pub fn open(file: &Path) -> Result<Self, RegridError> {
        let ds = netcdf::open(file)
            .map_err(|e| RegridError::from_nc_error(e, file.to_owned()))?;
        Self::from_file(&ds, file)
    }

    fn from_file(ds: &netcdf::File, file: &Path) -> Result<Self, RegridError> {
        let nav = ds.group(NAVIGATION_GROUP)
            .map_err(|e| RegridError::from_nc_error(e, file.to_owned()))?
            .ok_or_else(|| RegridError::NetcdfMissingGroup { file: file.to_owned(), grpname: NAVIGATION_GROUP.to_owned() })?;

        let load = |varname: &str| -> Result<Array2<f32>, RegridError> {
            let var = nav.variable(varname)
                .ok_or_else(|| RegridError::missing_var(file, varname))?;
            load_decoded_var(&var, file)?
                .into_dimensionality::<Ix2>()
                .map_err(|e| RegridError::from_shape_error(e, file.to_owned(), varname.to_owned()))
        };

        let latitude = load("latitude")?;
        let longitude = load("longitude")?;
        if latitude.dim() != longitude.dim() {
            return Err(RegridError::GridMismatch(format!(
                "latitude {:?} and longitude {:?} of {} differ in shape", latitude.dim(), longitude.dim(), file.display()
            )));
        }
        Ok(Self { latitude, longitude })
    }
}

/// One swath file: its navigation, the 2-D geophysical variables sharing the
/// navigation shape, and the file's global attributes.
#[derive(Debug, Clone)]
pub struct SwathFile {
    pub path: PathBuf,
    pub navigation: SwathNavigation,
    pub variables: BTreeMap<String, (Array2<f32>, Vec<(String, AttrValue)>)>,
    pub attrs: Vec<(String, AttrValue)>,
}

impl SwathFile {
    /// Load a swath. With an empty `only`, every compatible geophysical variable is read.
    pub fn open(file: &Path, only: &[String]) -> Result<Self, RegridError> {
        let ds = netcdf::open(file)
            .map_err(|e| RegridError::from_nc_error(e, file.to_owned()))?;
        let navigation = SwathNavigation::from_file(&ds, file)?;

        let geo = ds.group(GEOPHYSICAL_GROUP)
            .map_err(|e| RegridError::from_nc_error(e, file.to_owned()))?
            .ok_or_else(|| RegridError::NetcdfMissingGroup { file: file.to_owned(), grpname: GEOPHYSICAL_GROUP.to_owned() })?;

        let mut variables = BTreeMap::new();
        for var in geo.variables() {
            let name = var.name();
            if !only.is_empty() && !only.contains(&name) {
                continue;
            }
            if var.dimensions().len() != 2 {
                debug!("Skipping {name} in {}: not 2-D", file.display());
                continue;
            }

            let data = load_decoded_var(&var, file)?
                .into_dimensionality::<Ix2>()
                .map_err(|e| RegridError::from_shape_error(e, file.to_owned(), name.clone()))?;
            if data.dim() != navigation.latitude.dim() {
                debug!("Skipping {name} in {}: shape {:?} does not match the navigation", file.display(), data.dim());
                continue;
            }

            let attrs = collect_attributes(var.attributes(), file)?;
            variables.insert(name, (data, attrs));
        }

        if let Some(missing) = only.iter().find(|v| !variables.contains_key(*v)) {
            return Err(RegridError::missing_var(file, missing));
        }

        let attrs = collect_attributes(ds.attributes(), file)?;
        Ok(Self { path: file.to_owned(), navigation, variables, attrs })
    }
}

/// Mean absolute difference between neighbouring elements, pooling the
/// differences along both axes. Non-finite differences are ignored.
pub fn mean_step(arr: ArrayView2<f32>) -> Option<f64> {
    let mut sum = 0.0f64;
    let mut count = 0u64;

    for axis in [Axis(0), Axis(1)] {
        for lane in arr.lanes(axis) {
            for (a, b) in lane.iter().tuple_windows() {
                let d = (*b as f64 - *a as f64).abs();
                if d.is_finite() {
                    sum += d;
                    count += 1;
                }
            }
        }
    }

    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Average native `(lat_step, lon_step)` across the swaths in `input_dir`, computed in parallel.
pub fn estimate_steps(input_dir: &Path, show_progress: ShowProgress) -> Result<(f64, f64), RegridError> {
    let files = list_files_with_ext(input_dir, SWATH_EXTENSION)?;
    if files.is_empty() {
        return Err(RegridError::NoInputFiles(input_dir.to_owned()));
    }

    let pb = show_progress.bar(files.len() as u64, "Estimating swath resolution");
    let per_file = files.par_iter()
        .progress_with(pb)
        .map(|f| -> Result<Option<(f64, f64)>, RegridError> {
            let nav = SwathNavigation::open(f)?;
            let lat = mean_step(nav.latitude.view());
            let lon = mean_step(nav.longitude.view());
            Ok(lat.zip(lon))
        })
        .collect::<Result<Vec<_>, RegridError>>()?;

    let steps = per_file.into_iter().flatten().collect_vec();
    if steps.is_empty() {
        return Err(RegridError::InternalError("no swath had valid navigation to estimate a step from".to_owned()));
    }
    let n = steps.len() as f64;
    let lat = steps.iter().map(|s| s.0).sum::<f64>() / n;
    let lon = steps.iter().map(|s| s.1).sum::<f64>() / n;
    Ok((lat, lon))
}

/// Interpolation weights from one swath to a target grid. Built once per swath
/// and applied to every variable.
#[derive(Debug, Clone)]
pub struct Regridder {
    src_shape: (usize, usize),
    dst_shape: (usize, usize),
    /// For each target node (row-major), the flat source indices and weights contributing to it.
    weights: Vec<Vec<(usize, f64)>>,
}

impl Regridder {
    pub fn new(src_lat: ArrayView2<f32>, src_lon: ArrayView2<f32>, axes: &GridAxes, method: RegridMethod) -> Result<Self, RegridError> {
        if src_lat.dim() != src_lon.dim() {
            return Err(RegridError::GridMismatch("source latitude and longitude differ in shape".to_owned()));
        }
        let src_lon = src_lon.mapv(|l| axes.wrap_longitude(l));

        let weights = match method {
            RegridMethod::Bilinear => bilinear_weights(src_lat, src_lon.view(), axes),
            RegridMethod::Nearest => nearest_weights(src_lat, src_lon.view(), axes),
        };
        Ok(Self { src_shape: src_lat.dim(), dst_shape: axes.shape(), weights })
    }

    /// Number of target nodes that receive a value.
    pub fn n_mapped(&self) -> usize {
        self.weights.iter().filter(|w| !w.is_empty()).count()
    }

    pub fn regrid(&self, field: ArrayView2<f32>) -> Result<Array2<f32>, RegridError> {
        if field.dim() != self.src_shape {
            return Err(RegridError::GridMismatch(format!(
                "field shape {:?} does not match the swath shape {:?}", field.dim(), self.src_shape
            )));
        }

        let (_, ncols) = self.src_shape;
        let values = self.weights.iter().map(|w| {
            if w.is_empty() {
                return f32::NAN
            }
            let mut acc = 0.0f64;
            for &(src, weight) in w {
                if weight == 0.0 {
                    continue;
                }
                let v = field[[src / ncols, src % ncols]];
                if v.is_nan() {
                    return f32::NAN
                }
                acc += weight * v as f64;
            }
            acc as f32
        }).collect_vec();

        Array2::from_shape_vec(self.dst_shape, values)
            .map_err(|e| RegridError::from_shape_error(e, PathBuf::from("?"), "regridded field".to_owned()))
    }
}

type Point = (f64, f64);

fn bilinear_weights(lat: ArrayView2<f32>, lon: ArrayView2<f32>, axes: &GridAxes) -> Vec<Vec<(usize, f64)>> {
    let (nrows, ncols) = lat.dim();
    let (nlat, nlon) = axes.shape();
    let mut weights = vec![Vec::new(); nlat * nlon];
    if nrows < 2 || ncols < 2 {
        return weights
    }

    for (i, j) in iproduct!(0..nrows - 1, 0..ncols - 1) {
        // Corners in order: (i, j), (i, j+1), (i+1, j+1), (i+1, j)
        let idx = [(i, j), (i, j + 1), (i + 1, j + 1), (i + 1, j)];
        let corners: Vec<Point> = idx.iter().map(|&(r, c)| (lon[[r, c]] as f64, lat[[r, c]] as f64)).collect();
        if corners.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            continue;
        }

        let (xmin, xmax) = min_max(corners.iter().map(|p| p.0));
        let (ymin, ymax) = min_max(corners.iter().map(|p| p.1));
        // A quad spanning the antimeridian after wrapping is not a real pixel footprint.
        if xmax - xmin > 180.0 {
            continue;
        }

        for a in axes.lat_range(ymin as f32, ymax as f32) {
            for b in axes.lon_range(xmin as f32, xmax as f32) {
                let dst = a * nlon + b;
                if !weights[dst].is_empty() {
                    continue;
                }
                let q = (axes.longitude[b] as f64, axes.latitude[a] as f64);
                if let Some((s, t)) = inverse_bilinear([corners[0], corners[1], corners[2], corners[3]], q) {
                    weights[dst] = vec![
                        (idx[0].0 * ncols + idx[0].1, (1.0 - s) * (1.0 - t)),
                        (idx[1].0 * ncols + idx[1].1, s * (1.0 - t)),
                        (idx[2].0 * ncols + idx[2].1, s * t),
                        (idx[3].0 * ncols + idx[3].1, (1.0 - s) * t),
                    ];
                }
            }
        }
    }

    weights
}

fn nearest_weights(lat: ArrayView2<f32>, lon: ArrayView2<f32>, axes: &GridAxes) -> Vec<Vec<(usize, f64)>> {
    let (_, ncols) = lat.dim();
    let (nlat, nlon) = axes.shape();
    let mut best: Vec<Option<(f64, usize)>> = vec![None; nlat * nlon];

    for ((r, c), &y) in lat.indexed_iter() {
        let x = lon[[r, c]];
        if !x.is_finite() || !y.is_finite() {
            continue;
        }
        for a in axes.lat_range(y - axes.lat_step, y + axes.lat_step) {
            for b in axes.lon_range(x - axes.lon_step, x + axes.lon_step) {
                let dy = (axes.latitude[a] - y) as f64;
                let dx = (axes.longitude[b] - x) as f64;
                let d2 = dx * dx + dy * dy;
                let dst = a * nlon + b;
                let current = best[dst];
                match current {
                    Some((bd, _)) if bd <= d2 => {},
                    _ => best[dst] = Some((d2, r * ncols + c)),
                }
            }
        }
    }

    best.into_iter()
        .map(|b| b.map(|(_, src)| vec![(src, 1.0)]).unwrap_or_default())
        .collect()
}

fn min_max<I: Iterator<Item = f64>>(it: I) -> (f64, f64) {
    it.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

/// Solve for the unit-square coordinates `(s, t)` of `q` in the quadrilateral
/// `p` (ordered around the quad, `s` along `p0 -> p1`, `t` along `p0 -> p3`).
/// Returns `None` when `q` lies outside the quad or the quad is degenerate.
fn inverse_bilinear(p: [Point; 4], q: Point) -> Option<(f64, f64)> {
    const EPS: f64 = 1e-6;
    let e = (p[1].0 - p[0].0, p[1].1 - p[0].1);
    let f = (p[3].0 - p[0].0, p[3].1 - p[0].1);
    let g = (p[0].0 - p[1].0 + p[2].0 - p[3].0, p[0].1 - p[1].1 + p[2].1 - p[3].1);

    let (mut s, mut t) = (0.5, 0.5);
    for _ in 0..20 {
        let fx = p[0].0 + s * e.0 + t * f.0 + s * t * g.0 - q.0;
        let fy = p[0].1 + s * e.1 + t * f.1 + s * t * g.1 - q.1;
        if fx.abs() < 1e-12 && fy.abs() < 1e-12 {
            break;
        }

        // Jacobian columns: dP/ds = e + t g, dP/dt = f + s g
        let (jsx, jsy) = (e.0 + t * g.0, e.1 + t * g.1);
        let (jtx, jty) = (f.0 + s * g.0, f.1 + s * g.1);
        let det = jsx * jty - jtx * jsy;
        if det.abs() < 1e-18 {
            return None
        }
        s -= (fx * jty - fy * jtx) / det;
        t -= (jsx * fy - jsy * fx) / det;
    }

    let fx = p[0].0 + s * e.0 + t * f.0 + s * t * g.0 - q.0;
    let fy = p[0].1 + s * e.1 + t * f.1 + s * t * g.1 - q.1;
    let scale = e.0.abs().max(e.1.abs()).max(f.0.abs()).max(f.1.abs()).max(1e-12);
    if (fx.abs() + fy.abs()) / scale > 1e-6 {
        return None
    }

    if (-EPS..=1.0 + EPS).contains(&s) && (-EPS..=1.0 + EPS).contains(&t) {
        Some((s.clamp(0.0, 1.0), t.clamp(0.0, 1.0)))
    } else {
        None
    }
}

/// Regrid one swath file onto the target grid as a single time step.
pub fn regrid_swath(file: &Path, axes: &GridAxes, method: RegridMethod, only: &[String]) -> Result<GridDataset, RegridError> {
    let swath = SwathFile::open(file, only)?;
    let time = timestamp_to_datetime(file, FileNaming::OceanColor)?;

    let regridder = Regridder::new(swath.navigation.latitude.view(), swath.navigation.longitude.view(), axes, method)?;
    let n_mapped = regridder.n_mapped();
    if n_mapped == 0 {
        warn!("{} does not overlap the target grid", file.display());
    } else {
        debug!("{}: {n_mapped} of {} grid nodes covered", file.display(), axes.latitude.len() * axes.longitude.len());
    }

    let mut out = GridDataset::from_axes(time, axes);
    out.attrs = swath.attrs;
    out.attrs.push(("source_file".to_owned(), AttrValue::Str(file.display().to_string())));
    out.attrs.push(("source_file_sha256".to_owned(), AttrValue::Str(file_sha256(file)?)));

    for (name, (data, attrs)) in swath.variables {
        let regridded = regridder.regrid(data.view())?.insert_axis(Axis(0));
        out.insert(&name, GridVariable::new(regridded, attrs))?;
    }

    Ok(out)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Bounds;
    use ndarray::{array, Array2};

    /// A slightly rotated, regular swath over 0..2 deg lat and 10..12 deg lon
    fn synthetic_swath(n: usize) -> (Array2<f32>, Array2<f32>) {
        let step = 2.0 / (n - 1) as f32;
        let lat = Array2::from_shape_fn((n, n), |(i, j)| i as f32 * step + 0.01 * j as f32 * step);
        let lon = Array2::from_shape_fn((n, n), |(i, j)| 10.0 + j as f32 * step - 0.01 * i as f32 * step);
        (lat, lon)
    }

    #[test]
    fn test_mean_step() {
        let lat = array![[0.0f32, 0.0], [1.0, 1.0], [2.0, 2.0]];
        // 4 row diffs of 1, 3 column diffs of 0
        let m = mean_step(lat.view()).unwrap();
        assert!((m - 4.0 / 7.0).abs() < 1e-12);

        let with_nan = array![[0.0f32, f32::NAN], [1.0, 1.0]];
        assert_eq!(mean_step(with_nan.view()), Some(0.5));
        assert_eq!(mean_step(array![[1.0f32]].view()), None);
    }

    #[test]
    fn test_estimate_steps_names_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"no swaths here").unwrap();
        match estimate_steps(dir.path(), ShowProgress::No) {
            Err(RegridError::NoInputFiles(p)) => assert_eq!(p, dir.path()),
            other => panic!("expected NoInputFiles, got {other:?}"),
        }
    }

    #[test]
    fn test_inverse_bilinear_unit_square() {
        let p = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
        let (s, t) = inverse_bilinear(p, (0.25, 0.75)).unwrap();
        assert!((s - 0.25).abs() < 1e-9 && (t - 0.75).abs() < 1e-9);
        assert!(inverse_bilinear(p, (1.5, 0.5)).is_none());

        let skewed = [(0.0, 0.0), (2.0, 0.5), (2.5, 2.0), (-0.5, 1.5)];
        let (s, t) = inverse_bilinear(skewed, (1.0, 1.0)).unwrap();
        let x = (1.0 - s) * (1.0 - t) * 0.0 + s * (1.0 - t) * 2.0 + s * t * 2.5 + (1.0 - s) * t * -0.5;
        let y = (1.0 - s) * (1.0 - t) * 0.0 + s * (1.0 - t) * 0.5 + s * t * 2.0 + (1.0 - s) * t * 1.5;
        assert!((x - 1.0).abs() < 1e-9 && (y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bilinear_reproduces_linear_field() {
        let (lat, lon) = synthetic_swath(41);
        let field = Array2::from_shape_fn(lat.dim(), |(i, j)| 3.0 * lat[[i, j]] - 2.0 * lon[[i, j]] + 40.0);
        let axes = GridAxes::from_bounds(&Bounds::new(0.5, 1.5, 10.5, 11.5, 0.25, 0.25).unwrap());

        let regridder = Regridder::new(lat.view(), lon.view(), &axes, RegridMethod::Bilinear).unwrap();
        assert_eq!(regridder.n_mapped(), 16);
        let out = regridder.regrid(field.view()).unwrap();
        for ((a, b), &v) in out.indexed_iter() {
            let expected = 3.0 * axes.latitude[a] - 2.0 * axes.longitude[b] + 40.0;
            assert!((v - expected).abs() < 1e-3, "node ({a}, {b}) = {v}, expected {expected}");
        }
    }

    #[test]
    fn test_unmapped_and_nan_nodes() {
        let (lat, lon) = synthetic_swath(11);
        let mut field = Array2::from_elem(lat.dim(), 1.0f32);
        field[[5, 5]] = f32::NAN;
        // grid extends well past the swath to the north
        let axes = GridAxes::from_bounds(&Bounds::new(0.5, 4.0, 10.5, 11.5, 0.5, 0.5).unwrap());

        let out = Regridder::new(lat.view(), lon.view(), &axes, RegridMethod::Bilinear).unwrap()
            .regrid(field.view()).unwrap();
        let (nlat, _) = axes.shape();
        assert!(out[[nlat - 1, 0]].is_nan());
        assert_eq!(out[[0, 0]], 1.0);
        // node at lat 1.0, lon 11.0 touches the NaN pixel
        assert!(out[[1, 1]].is_nan());
    }

    #[test]
    fn test_nearest_method() {
        let lat = array![[0.0f32, 0.0], [1.0, 1.0]];
        let lon = array![[10.0f32, 11.0], [10.0, 11.0]];
        let field = array![[1.0f32, 2.0], [3.0, 4.0]];
        let axes = GridAxes::from_bounds(&Bounds::new(0.0, 3.0, 10.0, 11.5, 0.9, 0.9).unwrap());

        let r = Regridder::new(lat.view(), lon.view(), &axes, RegridMethod::Nearest).unwrap();
        let out = r.regrid(field.view()).unwrap();
        assert_eq!(out[[0, 0]], 1.0);
        assert_eq!(out[[0, 1]], 2.0);
        assert_eq!(out[[1, 0]], 3.0);
        assert_eq!(out[[1, 1]], 4.0);
        // lat 2.7 is more than one step from every pixel
        assert!(out[[3, 0]].is_nan());

        assert!(r.regrid(array![[1.0f32]].view()).is_err());
    }
}
