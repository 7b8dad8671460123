use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use itertools::Itertools;
use log::{debug, info};
use ndarray::{concatenate, Array1, Array3, Axis, Ix1, Ix3};
use netcdf::AttrValue;

use crate::bounds::GridAxes;
use crate::error::RegridError;
use crate::timestamps::{CfTimeUnits, DEFAULT_TIME_UNITS};
use crate::utils::{self, collect_attributes, get_str_attr_with_default, load_decoded_var, load_nc_var};

pub const TIME_DIM: &str = "time";
pub const LAT_DIM: &str = "latitude";
pub const LON_DIM: &str = "longitude";

/// One named field on the grid, shaped `(time, latitude, longitude)`.
#[derive(Debug, Clone)]
pub struct GridVariable {
    pub data: Array3<f32>,
    pub attrs: Vec<(String, AttrValue)>,
}

impl GridVariable {
    pub fn new(data: Array3<f32>, attrs: Vec<(String, AttrValue)>) -> Self {
        Self { data, attrs }
    }
}

/// A labeled geophysical field: time/latitude/longitude coordinates and the
/// variables defined on them. Missing values are NaN.
#[derive(Debug, Clone)]
pub struct GridDataset {
    pub time: Vec<NaiveDateTime>,
    pub latitude: Array1<f32>,
    pub longitude: Array1<f32>,
    pub variables: BTreeMap<String, GridVariable>,
    pub attrs: Vec<(String, AttrValue)>,
}

impl GridDataset {
    pub fn new(time: Vec<NaiveDateTime>, latitude: Array1<f32>, longitude: Array1<f32>) -> Self {
        Self { time, latitude, longitude, variables: BTreeMap::new(), attrs: Vec::new() }
    }

    pub fn from_axes(time: NaiveDateTime, axes: &GridAxes) -> Self {
        Self::new(vec![time], axes.latitude.clone(), axes.longitude.clone())
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.time.len(), self.latitude.len(), self.longitude.len())
    }

    pub fn insert(&mut self, name: &str, var: GridVariable) -> Result<(), RegridError> {
        if var.data.dim() != self.shape() {
            return Err(RegridError::GridMismatch(format!(
                "variable {name} has shape {:?} but the grid is {:?}", var.data.dim(), self.shape()
            )));
        }
        self.variables.insert(name.to_owned(), var);
        Ok(())
    }

    pub fn variable(&self, name: &str) -> Result<&GridVariable, RegridError> {
        self.variables.get(name)
            .ok_or_else(|| RegridError::NetcdfMissingVar { file: None, varname: name.to_owned() })
    }

    /// Write to `nc_file`. Nothing is left at `nc_file` if the write fails part way.
    pub fn to_netcdf(&self, nc_file: &Path) -> Result<(), RegridError> {
        utils::write_atomically(nc_file, |tmp_file| self.write_new_file(tmp_file))
    }

    fn write_new_file(&self, nc_file: &Path) -> Result<(), RegridError> {
        let mut ds = netcdf::create(nc_file)
            .map_err(|e| RegridError::from_nc_error(e, nc_file.to_owned()))?;
        self.write_coordinates(&mut ds, nc_file)?;

        for (name, var) in self.variables.iter() {
            debug!("  -> Writing variable {name}");
            utils::write_field(&mut ds, var.data.view(), name, &[TIME_DIM, LAT_DIM, LON_DIM], &var.attrs)?;
        }

        Ok(())
    }

    /// Add dimensions, coordinate variables and global attributes to a new file.
    pub(crate) fn write_coordinates(&self, ds: &mut netcdf::MutableFile, nc_file: &Path) -> Result<(), RegridError> {
        let (nt, nlat, nlon) = self.shape();
        ds.add_dimension(TIME_DIM, nt)
            .map_err(|e| RegridError::from_nc_error(e, nc_file.to_owned()))?;
        ds.add_dimension(LAT_DIM, nlat)
            .map_err(|e| RegridError::from_nc_error(e, nc_file.to_owned()))?;
        ds.add_dimension(LON_DIM, nlon)
            .map_err(|e| RegridError::from_nc_error(e, nc_file.to_owned()))?;

        for (name, value) in self.attrs.iter() {
            ds.add_attribute(name, value.clone())
                .map_err(|e| RegridError::from_nc_error(e, nc_file.to_owned()))?;
        }

        let units = CfTimeUnits::default();
        let times = Array1::from_iter(self.time.iter().map(|&t| units.encode(t)));
        utils::write_nc_var(ds, times.view(), TIME_DIM, &[TIME_DIM], Some(DEFAULT_TIME_UNITS), None)?;
        utils::write_nc_var(ds, self.latitude.view(), LAT_DIM, &[LAT_DIM], Some("degrees_north"), None)?;
        utils::write_nc_var(ds, self.longitude.view(), LON_DIM, &[LON_DIM], Some("degrees_east"), None)?;

        for (varname, standard_name) in [(TIME_DIM, "time"), (LAT_DIM, "latitude"), (LON_DIM, "longitude")] {
            let mut var = ds.variable_mut(varname)
                .ok_or_else(|| RegridError::InternalError(format!("coordinate {varname} was not created")))?;
            var.add_attribute("standard_name", standard_name)
                .map_err(|e| RegridError::from_nc_error(e, nc_file.to_owned()))?;
        }

        Ok(())
    }

    /// Read a file written by [`GridDataset::to_netcdf`]. Every variable dimensioned
    /// `(time, latitude, longitude)` is loaded.
    pub fn from_netcdf(nc_file: &Path) -> Result<Self, RegridError> {
        let ds = netcdf::open(nc_file)
            .map_err(|e| RegridError::from_nc_error(e, nc_file.to_owned()))?;

        let time_var = ds.variable(TIME_DIM)
            .ok_or_else(|| RegridError::missing_var(nc_file, TIME_DIM))?;
        let units = get_str_attr_with_default(&time_var, "units", DEFAULT_TIME_UNITS.to_owned())?;
        let units = CfTimeUnits::parse(&units)?;
        let raw_times = load_nc_var::<f64, Ix1>(&time_var, nc_file)?;
        let time = raw_times.iter()
            .map(|&t| units.decode(t).ok_or_else(|| RegridError::TimeUnits(format!("cannot decode time value {t} in {}", nc_file.display()))))
            .collect::<Result<Vec<_>, _>>()?;

        let latitude = load_axis(&ds, LAT_DIM, nc_file)?;
        let longitude = load_axis(&ds, LON_DIM, nc_file)?;

        let mut out = Self::new(time, latitude, longitude);
        out.attrs = collect_attributes(ds.attributes(), nc_file)?;

        for var in ds.variables() {
            let dims = var.dimensions().iter().map(|d| d.name()).collect_vec();
            if dims != [TIME_DIM, LAT_DIM, LON_DIM] {
                continue;
            }
            let name = var.name();
            let data = load_decoded_var(&var, nc_file)?
                .into_dimensionality::<Ix3>()
                .map_err(|e| RegridError::from_shape_error(e, nc_file.to_owned(), name.clone()))?;
            let attrs = collect_attributes(var.attributes(), nc_file)?;
            out.insert(&name, GridVariable::new(data, attrs))?;
        }

        Ok(out)
    }

    /// The latitude/longitude axes of a file written by [`GridDataset::to_netcdf`],
    /// without loading its variables. `None` if an axis has fewer than two points.
    pub fn read_axes(nc_file: &Path) -> Result<Option<GridAxes>, RegridError> {
        let ds = netcdf::open(nc_file)
            .map_err(|e| RegridError::from_nc_error(e, nc_file.to_owned()))?;
        let latitude = load_axis(&ds, LAT_DIM, nc_file)?;
        let longitude = load_axis(&ds, LON_DIM, nc_file)?;
        Ok(GridAxes::from_coordinates(latitude, longitude))
    }

    /// Open every `.nc` file in `dir` and concatenate them along time, like a
    /// multi-file dataset. Variables absent from a file are NaN for its time steps.
    pub fn open_mf(dir: &Path) -> Result<Self, RegridError> {
        let files: Vec<PathBuf> = utils::list_files_with_ext(dir, "nc")?
            .into_iter()
            .filter(|f| f.extension().map(|e| e == "nc").unwrap_or(false))
            .collect();
        info!("Opening {} files from {}", files.len(), dir.display());

        let datasets = files.iter()
            .map(|f| Self::from_netcdf(f))
            .collect::<Result<Vec<_>, _>>()?;
        Self::concat_time(datasets)
            .ok_or_else(|| RegridError::NoInputFiles(dir.to_owned()))?
    }

    /// Concatenate along time and sort by time. Returns `None` for an empty input.
    pub fn concat_time(datasets: Vec<Self>) -> Option<Result<Self, RegridError>> {
        let first = datasets.first()?;
        let latitude = first.latitude.clone();
        let longitude = first.longitude.clone();
        let attrs = first.attrs.clone();

        let names: Vec<String> = datasets.iter()
            .flat_map(|d| d.variables.keys().cloned())
            .unique()
            .collect();

        let res = (|| -> Result<Self, RegridError> {
            for d in datasets.iter() {
                if d.latitude != latitude || d.longitude != longitude {
                    return Err(RegridError::GridMismatch("files have different latitude/longitude coordinates".to_owned()));
                }
            }

            let time: Vec<NaiveDateTime> = datasets.iter().flat_map(|d| d.time.iter().copied()).collect();
            let mut out = Self::new(time, latitude.clone(), longitude.clone());
            out.attrs = attrs;

            for name in names.iter() {
                let mut var_attrs = None;
                let pieces = datasets.iter().map(|d| {
                    match d.variables.get(name) {
                        Some(v) => {
                            var_attrs.get_or_insert_with(|| v.attrs.clone());
                            v.data.clone()
                        },
                        None => Array3::from_elem(d.shape(), f32::NAN),
                    }
                }).collect_vec();
                let views = pieces.iter().map(|p| p.view()).collect_vec();
                let data = concatenate(Axis(0), &views)
                    .map_err(|e| RegridError::from_shape_error(e, PathBuf::from("?"), name.clone()))?;
                out.insert(name, GridVariable::new(data, var_attrs.unwrap_or_default()))?;
            }

            Ok(out.sorted_by_time())
        })();

        Some(res)
    }

    /// Reorder the time axis so it is ascending.
    pub fn sorted_by_time(&self) -> Self {
        let order = (0..self.time.len()).sorted_by_key(|&i| self.time[i]).collect_vec();
        self.take_times(&order)
    }

    /// Keep the time steps that fall on `start` through `end` (both days inclusive).
    pub fn select_time(&self, start: NaiveDate, end: NaiveDate) -> Self {
        let lo = start.and_hms_opt(0, 0, 0);
        let hi = end.and_hms_opt(0, 0, 0).map(|d| d + Duration::days(1));
        let keep = self.time.iter()
            .enumerate()
            .filter(|&(_, &t)| lo.map(|lo| t >= lo).unwrap_or(true) && hi.map(|hi| t < hi).unwrap_or(true))
            .map(|(i, _)| i)
            .collect_vec();
        self.take_times(&keep)
    }

    pub(crate) fn take_times(&self, indices: &[usize]) -> Self {
        let time = indices.iter().map(|&i| self.time[i]).collect();
        let mut out = Self::new(time, self.latitude.clone(), self.longitude.clone());
        out.attrs = self.attrs.clone();
        for (name, var) in self.variables.iter() {
            let data = var.data.select(Axis(0), indices);
            out.variables.insert(name.clone(), GridVariable::new(data, var.attrs.clone()));
        }
        out
    }
}

fn load_axis(ds: &netcdf::File, name: &str, nc_file: &Path) -> Result<Array1<f32>, RegridError> {
    let var = ds.variable(name)
        .ok_or_else(|| RegridError::missing_var(nc_file, name))?;
    load_nc_var::<f32, Ix1>(&var, nc_file)
}
