//! Point samples (CYGNSS Level-2 wind speed) binned onto a regular grid.
use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDateTime;
use itertools::izip;
use log::debug;
use ndarray::{Array1, Array2, Axis, Ix1};
use netcdf::AttrValue;

use crate::bounds::GridAxes;
use crate::error::RegridError;
use crate::grid::{GridDataset, GridVariable};
use crate::timestamps::{CfTimeUnits, DEFAULT_TIME_UNITS};
use crate::utils::{collect_attributes, get_str_attr_with_default, load_decoded_var, RunningMean};

pub const LAT_VARNAME: &str = "lat";
pub const LON_VARNAME: &str = "lon";
pub const TIME_VARNAME: &str = "sample_time";

pub fn default_point_variables() -> Vec<String> {
    vec!["wind_speed".to_owned(), "wind_speed_uncertainty".to_owned()]
}

#[derive(Debug, Clone)]
pub struct PointSamples {
    pub latitude: Array1<f32>,
    pub longitude: Array1<f32>,
    pub sample_time: Vec<Option<NaiveDateTime>>,
    pub variables: BTreeMap<String, (Array1<f32>, Vec<(String, AttrValue)>)>,
    pub attrs: Vec<(String, AttrValue)>,
}

impl PointSamples {
    pub fn open(file: &Path, variables: &[String]) -> Result<Self, RegridError> {
        let ds = netcdf::open(file)
            .map_err(|e| RegridError::from_nc_error(e, file.to_owned()))?;

        let load = |varname: &str| -> Result<(Array1<f32>, Vec<(String, AttrValue)>), RegridError> {
            let var = ds.variable(varname)
                .ok_or_else(|| RegridError::missing_var(file, varname))?;
            let data = load_decoded_var(&var, file)?
                .into_dimensionality::<Ix1>()
                .map_err(|e| RegridError::from_shape_error(e, file.to_owned(), varname.to_owned()))?;
            Ok((data, collect_attributes(var.attributes(), file)?))
        };

        let (latitude, _) = load(LAT_VARNAME)?;
        let (longitude, _) = load(LON_VARNAME)?;

        let time_var = ds.variable(TIME_VARNAME)
            .ok_or_else(|| RegridError::missing_var(file, TIME_VARNAME))?;
        let units = get_str_attr_with_default(&time_var, "units", DEFAULT_TIME_UNITS.to_owned())?;
        let units = CfTimeUnits::parse(&units)?;
        let raw_time = crate::utils::load_nc_var::<f64, Ix1>(&time_var, file)?;
        let sample_time = raw_time.iter().map(|&t| units.decode(t)).collect();

        let mut vars = BTreeMap::new();
        for name in variables {
            vars.insert(name.clone(), load(name)?);
        }

        let n = latitude.len();
        if longitude.len() != n || raw_time.len() != n || vars.values().any(|(v, _)| v.len() != n) {
            return Err(RegridError::GridMismatch(format!("sample variables in {} have different lengths", file.display())));
        }

        let attrs = collect_attributes(ds.attributes(), file)?;
        Ok(Self { latitude, longitude, sample_time, variables: vars, attrs })
    }

    pub fn len(&self) -> usize {
        self.latitude.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latitude.is_empty()
    }

    pub fn first_time(&self) -> Option<NaiveDateTime> {
        self.sample_time.first().copied().flatten()
    }
}

/// Snap every sample to its nearest grid node and average per node and variable.
/// Samples off the grid are dropped; NaN values do not contribute.
pub fn bin_to_grid(samples: &PointSamples, axes: &GridAxes) -> BTreeMap<String, Array2<f32>> {
    let shape = axes.shape();
    let mut sums: BTreeMap<&str, Array2<RunningMean<f32>>> = samples.variables.keys()
        .map(|k| (k.as_str(), Array2::from_elem(shape, RunningMean::new())))
        .collect();

    let mut n_off_grid = 0usize;
    for (i, (&lat, &lon)) in izip!(samples.latitude.iter(), samples.longitude.iter()).enumerate() {
        let cell = axes.nearest_lat(lat).zip(axes.nearest_lon(axes.wrap_longitude(lon)));
        let (a, b) = match cell {
            Some(c) => c,
            None => {
                n_off_grid += 1;
                continue;
            }
        };

        for (name, (values, _)) in samples.variables.iter() {
            if let Some(acc) = sums.get_mut(name.as_str()) {
                acc[[a, b]] += values[i];
            }
        }
    }
    debug!("{n_off_grid} of {} samples fell outside the grid", samples.len());

    sums.into_iter()
        .map(|(name, acc)| (name.to_owned(), acc.mapv(|m| m.mean().unwrap_or(f32::NAN))))
        .collect()
}

/// Bin one file of samples onto the grid. The time step is that of the first sample.
pub fn points_to_grid(file: &Path, axes: &GridAxes, variables: &[String]) -> Result<GridDataset, RegridError> {
    let samples = PointSamples::open(file, variables)?;
    if samples.is_empty() {
        return Err(RegridError::EmptyInput(file.to_owned()));
    }
    let time = samples.first_time()
        .ok_or_else(|| RegridError::EmptyInput(file.to_owned()))?;

    let binned = bin_to_grid(&samples, axes);
    let mut out = GridDataset::from_axes(time, axes);
    out.attrs = samples.attrs.clone();

    for (name, data) in binned {
        let attrs = samples.variables.get(&name)
            .map(|(_, a)| a.clone())
            .unwrap_or_default();
        out.insert(&name, GridVariable::new(data.insert_axis(Axis(0)), attrs))?;
    }
    Ok(out)
}
