//! The batch jobs behind the CLI subcommands.
use std::path::{Path, PathBuf};

use indicatif::ParallelProgressIterator;
use log::{error, info, warn};
use ndarray::Array3;
use rayon::prelude::*;

use crate::bounds::GridAxes;
use crate::config::{PointsArgs, RegressArgs, RunMultiConfig, SwathArgs};
use crate::error::RegridError;
use crate::grid::{GridDataset, GridVariable};
use crate::points::points_to_grid;
use crate::regression::{regress_cells, StatsDataset};
use crate::resample::{aligned_field, coarsen, coarsen_factors, count_finite, reindex_like, resample_daily};
use crate::swath::{estimate_steps, regrid_swath, SWATH_EXTENSION};
use crate::timestamps::{file_to_time_id, files_to_process, FileNaming};
use crate::utils::{list_files_with_ext, ShowProgress};

pub const POINTS_EXTENSION: &str = "nc4";

/// Regrid every swath in the input directory that has no output yet.
pub fn run_swath(args: &SwathArgs, show_progress: ShowProgress) -> Result<(), RegridError> {
    let output_dir = args.output_dir();
    std::fs::create_dir_all(&output_dir)?;

    let axes = match (args.lat_step, args.lon_step) {
        (Some(lat), Some(lon)) => GridAxes::from_bounds(&args.region.to_bounds(lat, lon)?),
        (lat, lon) => match existing_axes(&output_dir)? {
            Some(axes) => axes,
            None => {
                let (est_lat, est_lon) = run_estimate_steps(&args.input_dir, show_progress)?;
                GridAxes::from_bounds(&args.region.to_bounds(lat.unwrap_or(est_lat), lon.unwrap_or(est_lon))?)
            }
        }
    };

    let pending = files_to_process(&args.input_dir, SWATH_EXTENSION, &output_dir, FileNaming::OceanColor)?;
    info!("{} swath files in {} need regridding", pending.len(), args.input_dir.display());

    run_in_pool(&pending, args.processes, show_progress, "Regridding swaths", |file| {
        let time_id = file_to_time_id(file, FileNaming::OceanColor)?;
        let ds = regrid_swath(file, &axes, args.method, &args.variables)?;
        let out_file = output_dir.join(format!("{time_id}.nc"));
        ds.to_netcdf(&out_file)?;
        Ok(time_id)
    })
}

/// The grid of the first regridded file already in `output_dir`, so that files
/// added on a later run concatenate with the earlier ones.
fn existing_axes(output_dir: &Path) -> Result<Option<GridAxes>, RegridError> {
    let first = list_files_with_ext(output_dir, "nc")?
        .into_iter()
        .find(|f| f.extension().map(|e| e == "nc").unwrap_or(false));
    let first = match first {
        Some(f) => f,
        None => return Ok(None),
    };

    let axes = GridDataset::read_axes(&first)?;
    match &axes {
        Some(axes) => info!("Reusing the {} x {} grid of {} (steps {:.6}, {:.6})",
                            axes.latitude.len(), axes.longitude.len(), first.display(), axes.lat_step, axes.lon_step),
        None => warn!("Cannot reuse the grid of {}, estimating the steps again", first.display()),
    }
    Ok(axes)
}

/// Bin every CYGNSS file in the input directory that has no output yet.
pub fn run_points(args: &PointsArgs, show_progress: ShowProgress) -> Result<(), RegridError> {
    let output_dir = args.output_dir();
    std::fs::create_dir_all(&output_dir)?;

    let axes = GridAxes::from_bounds(&args.region.to_bounds(args.lat_step, args.lon_step)?);
    let pending = files_to_process(&args.input_dir, POINTS_EXTENSION, &output_dir, FileNaming::Cygnss)?;
    info!("{} CYGNSS files in {} need gridding", pending.len(), args.input_dir.display());

    run_in_pool(&pending, args.processes, show_progress, "Gridding wind samples", |file| {
        let time_id = file_to_time_id(file, FileNaming::Cygnss)?;
        let ds = points_to_grid(file, &axes, &args.variables)?;
        let out_file = output_dir.join(format!("{time_id}.nc"));
        ds.to_netcdf(&out_file)?;
        Ok(time_id)
    })
}

/// Process `files` on a dedicated pool of `processes` threads. A failing file is
/// logged and does not stop the others; any failure is reported at the end.
fn run_in_pool<F>(files: &[PathBuf], processes: usize, show_progress: ShowProgress, msg: &str, process_one: F) -> Result<(), RegridError>
where F: Fn(&Path) -> Result<String, RegridError> + Sync
{
    if files.is_empty() {
        return Ok(())
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(processes.max(1))
        .build()?;

    let pb = show_progress.bar(files.len() as u64, msg);
    let n_failed = pool.install(|| {
        files.par_iter()
            .progress_with(pb)
            .filter(|file| {
                match process_one(file) {
                    Ok(time_id) => {
                        info!("Processed {time_id}");
                        false
                    },
                    Err(e) => {
                        error!("Failed to process {}: {e}", file.display());
                        true
                    }
                }
            })
            .count()
    });

    if n_failed > 0 {
        Err(RegridError::FilesFailed { failed: n_failed, total: files.len() })
    } else {
        Ok(())
    }
}

/// Mean native `(lat_step, lon_step)` of the swaths in a directory.
pub fn run_estimate_steps(input_dir: &Path, show_progress: ShowProgress) -> Result<(f64, f64), RegridError> {
    let steps = estimate_steps(input_dir, show_progress)?;
    info!("Estimated native resolution of {}: lat step = {:.6}, lon step = {:.6}", input_dir.display(), steps.0, steps.1);
    Ok(steps)
}

/// Bring the gridded wind and ocean color data to a common daily grid at the
/// wind resolution, then regress `y_var` on `x_var` in every cell.
pub fn run_regression(args: &RegressArgs, show_progress: ShowProgress) -> Result<StatsDataset, RegridError> {
    let wind = GridDataset::open_mf(&args.wind_dir)?
        .select_time(args.wind_start, args.wind_end);
    let ocean = GridDataset::open_mf(&args.ocean_dir)?
        .select_time(args.ocean_start, args.ocean_end);
    if wind.time.is_empty() {
        return Err(RegridError::EmptyInput(args.wind_dir.clone()));
    }
    if ocean.time.is_empty() {
        return Err(RegridError::EmptyInput(args.ocean_dir.clone()));
    }

    let (lat_factor, lon_factor) = coarsen_factors(&ocean, &wind);
    info!("Coarsening ocean data by {lat_factor} x {lon_factor} to match the wind grid");

    let wind = resample_daily(&wind);
    let ocean = coarsen(&resample_daily(&ocean), lat_factor, lon_factor);
    let ocean = reindex_like(&ocean, &wind, args.tolerance())?;

    let x = regression_field(&args.x_var, &wind, &ocean)?;
    let y = regression_field(&args.y_var, &wind, &ocean)?;
    info!("{} valid {} values and {} valid {} values over {} days",
          count_finite(x), args.x_var, count_finite(y), args.y_var, wind.time.len());
    if count_finite(y) == 0 {
        warn!("No valid {} values overlap the wind grid", args.y_var);
    }

    let stats = regress_cells(x, y, show_progress)?;

    let mut inputs = GridDataset::new(wind.time.clone(), wind.latitude.clone(), wind.longitude.clone());
    inputs.attrs = vec![
        ("wind_dir".to_owned(), netcdf::AttrValue::Str(args.wind_dir.display().to_string())),
        ("ocean_dir".to_owned(), netcdf::AttrValue::Str(args.ocean_dir.display().to_string())),
    ];
    for name in [&args.x_var, &args.y_var] {
        let attrs = wind.variable(name).or_else(|_| ocean.variable(name))?.attrs.clone();
        let data = regression_field(name, &wind, &ocean)?.clone();
        inputs.insert(name, GridVariable::new(data, attrs))?;
    }

    let out = StatsDataset { inputs, stats, x_name: args.x_var.clone(), y_name: args.y_var.clone() };
    if let Some(parent) = args.output_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    out.to_netcdf(&args.output_file)?;
    info!("Wrote regression statistics to {}", args.output_file.display());
    Ok(out)
}

fn regression_field<'a>(name: &str, wind: &'a GridDataset, ocean: &'a GridDataset) -> Result<&'a Array3<f32>, RegridError> {
    if wind.variables.contains_key(name) {
        aligned_field(wind, wind, name)
    } else {
        aligned_field(ocean, wind, name)
    }
}

/// Run every job in `cfg`, in the order swaths, points, regressions. A failed job
/// does not stop the later ones; the first error is returned at the end.
pub fn run_multi(cfg: &RunMultiConfig, show_progress: ShowProgress) -> Result<(), RegridError> {
    let n_jobs = cfg.swath.len() + cfg.points.len() + cfg.regress.len();
    let mut results = Vec::with_capacity(n_jobs);
    for (i, job) in cfg.swath.iter().enumerate() {
        info!("Swath job {}/{}: {}", i + 1, cfg.swath.len(), job.input_dir.display());
        results.push(run_swath(job, show_progress));
    }
    for (i, job) in cfg.points.iter().enumerate() {
        info!("Points job {}/{}: {}", i + 1, cfg.points.len(), job.input_dir.display());
        results.push(run_points(job, show_progress));
    }
    for (i, job) in cfg.regress.iter().enumerate() {
        info!("Regression job {}/{}: {}", i + 1, cfg.regress.len(), job.output_file.display());
        results.push(run_regression(job, show_progress).map(|_| ()));
    }

    let mut first_err = None;
    for res in results {
        if let Err(e) = res {
            error!("Job failed: {e}");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Names of the groups at the root of a netCDF file.
pub fn find_groups(nc_file: &Path) -> Result<Vec<String>, RegridError> {
    let ds = netcdf::open(nc_file)
        .map_err(|e| RegridError::from_nc_error(e, nc_file.to_owned()))?;
    let groups = ds.groups()
        .map_err(|e| RegridError::from_nc_error(e, nc_file.to_owned()))?
        .map(|g| g.name())
        .collect();
    Ok(groups)
}
