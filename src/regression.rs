//! Per-grid-cell ordinary least squares over the time axis.
use std::path::Path;

use indicatif::ParallelProgressIterator;
use itertools::izip;
use log::debug;
use ndarray::{Array2, Array3};
use netcdf::AttrValue;
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::error::RegridError;
use crate::grid::{GridDataset, LAT_DIM, LON_DIM, TIME_DIM};
use crate::utils::{self, ShowProgress};

const TINY: f64 = 1.0e-20;

/// Result of a simple linear regression `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinRegress {
    pub slope: f64,
    pub intercept: f64,
    pub r_value: f64,
    /// Two-sided p-value for the null hypothesis that the slope is zero
    pub p_value: f64,
    /// Standard error of the slope
    pub std_err: f64,
    pub intercept_stderr: f64,
}

/// Least-squares fit of `y` against `x` (same semantics as `scipy.stats.linregress`).
pub fn linregress(x: &[f64], y: &[f64]) -> Result<LinRegress, RegridError> {
    let n = x.len();
    if n != y.len() {
        return Err(RegridError::RegressionError(format!("x has {n} values but y has {}", y.len())));
    }
    if n < 2 {
        return Err(RegridError::RegressionError("at least two points are needed".to_owned()));
    }

    let (xmin, xmax) = x.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if xmin == xmax {
        return Err(RegridError::RegressionError("all x values are identical".to_owned()));
    }

    let nf = n as f64;
    let xmean = x.iter().sum::<f64>() / nf;
    let ymean = y.iter().sum::<f64>() / nf;

    let (mut ssxm, mut ssym, mut ssxym) = (0.0, 0.0, 0.0);
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        let dx = xi - xmean;
        let dy = yi - ymean;
        ssxm += dx * dx;
        ssym += dy * dy;
        ssxym += dx * dy;
    }
    ssxm /= nf;
    ssym /= nf;
    ssxym /= nf;

    let r_den = (ssxm * ssym).sqrt();
    let r = if r_den == 0.0 {
        0.0
    } else {
        (ssxym / r_den).clamp(-1.0, 1.0)
    };

    let slope = ssxym / ssxm;
    let intercept = ymean - slope * xmean;

    if n == 2 {
        // Two points always lie on a line
        let p_value = if y[0] == y[1] { 1.0 } else { 0.0 };
        return Ok(LinRegress { slope, intercept, r_value: r, p_value, std_err: 0.0, intercept_stderr: 0.0 });
    }

    let df = (n - 2) as f64;
    let t = r * (df / ((1.0 - r + TINY) * (1.0 + r + TINY))).sqrt();
    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| RegridError::RegressionError(format!("invalid t distribution: {e}")))?;
    let p_value = 2.0 * dist.cdf(-t.abs());

    let std_err = ((1.0 - r * r) * ssym / ssxm / df).sqrt();
    let intercept_stderr = std_err * (ssxm + xmean * xmean).sqrt();

    Ok(LinRegress { slope, intercept, r_value: r, p_value, std_err, intercept_stderr })
}

/// What happened in one grid cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellOutcome {
    TooFewPoints,
    Failed,
    Fitted(LinRegress),
}

/// Regression statistics for every `(latitude, longitude)` cell.
#[derive(Debug, Clone)]
pub struct RegressionGrid {
    pub n_points: Array2<f32>,
    pub slope: Array2<f32>,
    pub intercept: Array2<f32>,
    pub r_value: Array2<f32>,
    pub p_value: Array2<f32>,
    pub std_err: Array2<f32>,
}

impl RegressionGrid {
    fn empty(shape: (usize, usize)) -> Self {
        let nan = Array2::from_elem(shape, f32::NAN);
        Self {
            n_points: nan.clone(),
            slope: nan.clone(),
            intercept: nan.clone(),
            r_value: nan.clone(),
            p_value: nan.clone(),
            std_err: nan,
        }
    }

    pub fn fields(&self) -> [(&'static str, &Array2<f32>, &'static str); 6] {
        [
            ("n_points", &self.n_points, "Number of time steps where both variables are valid"),
            ("slope", &self.slope, "Slope of the least-squares regression line"),
            ("intercept", &self.intercept, "Intercept of the least-squares regression line"),
            ("r_value", &self.r_value, "Pearson correlation coefficient"),
            ("p_value", &self.p_value, "Two-sided p-value for a hypothesis test whose null hypothesis is that the slope is zero"),
            ("std_err", &self.std_err, "Standard error of the estimated slope"),
        ]
    }
}

/// Regress `y` on `x` independently in every cell, using the time steps where
/// both are finite. Cells are processed in parallel.
pub fn regress_cells(x: &Array3<f32>, y: &Array3<f32>, show_progress: ShowProgress) -> Result<RegressionGrid, RegridError> {
    if x.dim() != y.dim() {
        return Err(RegridError::GridMismatch(format!("x has shape {:?} but y has shape {:?}", x.dim(), y.dim())));
    }
    let (_, nlat, nlon) = x.dim();

    let pb = show_progress.bar((nlat * nlon) as u64, "Regressing grid cells");
    let outcomes: Vec<(usize, CellOutcome)> = (0..nlat * nlon)
        .into_par_iter()
        .progress_with(pb)
        .map(|k| {
            let (a, b) = (k / nlon, k % nlon);
            let (xs, ys): (Vec<f64>, Vec<f64>) = izip!(x.slice(ndarray::s![.., a, b]), y.slice(ndarray::s![.., a, b]))
                .filter(|(xv, yv)| xv.is_finite() && yv.is_finite())
                .map(|(&xv, &yv)| (xv as f64, yv as f64))
                .unzip();
            let n = xs.len();

            let outcome = if n < 2 {
                debug!("({a}, {b}) had {n} values, no calculation");
                CellOutcome::TooFewPoints
            } else {
                match linregress(&xs, &ys) {
                    Ok(fit) => {
                        debug!("({a}, {b}) had {n} values, regression was calculated");
                        CellOutcome::Fitted(fit)
                    },
                    Err(e) => {
                        debug!("({a}, {b}) had {n} values, regression resulted in an error: {e}");
                        CellOutcome::Failed
                    }
                }
            };
            (n, outcome)
        })
        .collect();

    let mut grid = RegressionGrid::empty((nlat, nlon));
    for (k, (n, outcome)) in outcomes.into_iter().enumerate() {
        let idx = [k / nlon, k % nlon];
        grid.n_points[idx] = n as f32;
        if let CellOutcome::Fitted(fit) = outcome {
            grid.slope[idx] = fit.slope as f32;
            grid.intercept[idx] = fit.intercept as f32;
            grid.r_value[idx] = fit.r_value as f32;
            grid.p_value[idx] = fit.p_value as f32;
            grid.std_err[idx] = fit.std_err as f32;
        }
    }
    Ok(grid)
}

/// The regression output: both input fields on the common grid plus the per-cell statistics.
#[derive(Debug, Clone)]
pub struct StatsDataset {
    pub inputs: GridDataset,
    pub stats: RegressionGrid,
    pub x_name: String,
    pub y_name: String,
}

impl StatsDataset {
    pub fn to_netcdf(&self, nc_file: &Path) -> Result<(), RegridError> {
        utils::write_atomically(nc_file, |tmp_file| self.write_new_file(tmp_file))
    }

    fn write_new_file(&self, nc_file: &Path) -> Result<(), RegridError> {
        let mut ds = netcdf::create(nc_file)
            .map_err(|e| RegridError::from_nc_error(e, nc_file.to_owned()))?;
        self.inputs.write_coordinates(&mut ds, nc_file)?;

        for (name, var) in self.inputs.variables.iter() {
            utils::write_field(&mut ds, var.data.view(), name, &[TIME_DIM, LAT_DIM, LON_DIM], &var.attrs)?;
        }

        for (name, data, description) in self.stats.fields() {
            let attrs = vec![
                ("description".to_owned(), AttrValue::Str(description.to_owned())),
                ("regression".to_owned(), AttrValue::Str(format!("{} = slope * {} + intercept", self.y_name, self.x_name))),
            ];
            utils::write_field(&mut ds, data.view(), name, &[LAT_DIM, LON_DIM], &attrs)?;
        }
        Ok(())
    }
}
