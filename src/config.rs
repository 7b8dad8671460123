use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use clap::Args;
use log::warn;
use serde::{Serialize, Deserialize};

use crate::bounds::{Bounds, CYGNSS_LAT_STEP, CYGNSS_LON_STEP, DEFAULT_MAX_LAT, DEFAULT_MAX_LON, DEFAULT_MIN_LAT, DEFAULT_MIN_LON};
use crate::error::RegridError;
use crate::points::default_point_variables;
use crate::resample::ReindexTolerance;
use crate::swath::RegridMethod;
use crate::timestamps::FileNaming;
use crate::utils::find_dataset_dir;

/// Name of the subdirectory of the input directory that outputs go to by default.
pub const DEFAULT_OUTPUT_SUBDIR: &str = "regridded";

/// Directory name prefixes of the downloaded datasets.
pub const OCI_DIR_PREFIX: &str = "PACE_OCI_L2_BGC_NRT_2.0";
pub const CYGNSS_DIR_PREFIX: &str = "CYGNSS_NOAA_L2_SWSP_25KM";

/// The region to regrid onto. Step sizes are given separately by each job.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionArgs {
    /// Southern edge of the output grid, in degrees north
    #[clap(long, default_value_t = DEFAULT_MIN_LAT, allow_negative_numbers = true)]
    pub min_lat: f64,

    /// Northern edge of the output grid (exclusive), in degrees north
    #[clap(long, default_value_t = DEFAULT_MAX_LAT, allow_negative_numbers = true)]
    pub max_lat: f64,

    /// Western edge of the output grid, in degrees east
    #[clap(long, default_value_t = DEFAULT_MIN_LON, allow_negative_numbers = true)]
    pub min_lon: f64,

    /// Eastern edge of the output grid (exclusive), in degrees east
    #[clap(long, default_value_t = DEFAULT_MAX_LON, allow_negative_numbers = true)]
    pub max_lon: f64,
}

impl Default for RegionArgs {
    fn default() -> Self {
        Self { min_lat: DEFAULT_MIN_LAT, max_lat: DEFAULT_MAX_LAT, min_lon: DEFAULT_MIN_LON, max_lon: DEFAULT_MAX_LON }
    }
}

impl RegionArgs {
    pub fn to_bounds(&self, lat_step: f64, lon_step: f64) -> Result<Bounds, RegridError> {
        Bounds::new(self.min_lat, self.max_lat, self.min_lon, self.max_lon, lat_step, lon_step)
    }
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct SwathArgs {
    /// Directory containing the PACE OCI Level-2 BGC files (*.nc)
    pub input_dir: PathBuf,

    /// Directory to write the regridded files to. Defaults to a "regridded" subdirectory of INPUT_DIR.
    #[clap(short, long)]
    pub output_dir: Option<PathBuf>,

    #[clap(flatten)]
    #[serde(default)]
    pub region: RegionArgs,

    /// Latitude step of the output grid. If this or --lon-step is not given, both are estimated
    /// from the mean pixel spacing of all input swaths.
    #[clap(long)]
    pub lat_step: Option<f64>,

    /// Longitude step of the output grid.
    #[clap(long)]
    pub lon_step: Option<f64>,

    /// Number of files to regrid at the same time
    #[clap(short, long, default_value_t = 2)]
    #[serde(default = "default_swath_processes")]
    pub processes: usize,

    #[clap(short, long, value_enum, default_value_t = RegridMethod::Bilinear)]
    #[serde(default)]
    pub method: RegridMethod,

    /// Variable in the geophysical_data group to regrid. Can be repeated; if not given,
    /// every 2-D variable on the swath is regridded.
    #[clap(long = "variable")]
    #[serde(default)]
    pub variables: Vec<String>,
}

impl SwathArgs {
    pub fn output_dir(&self) -> PathBuf {
        output_dir_or_default(&self.input_dir, self.output_dir.as_deref())
    }
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct PointsArgs {
    /// Directory containing the CYGNSS Level-2 wind speed files (*.nc4)
    pub input_dir: PathBuf,

    /// Directory to write the gridded files to. Defaults to a "regridded" subdirectory of INPUT_DIR.
    #[clap(short, long)]
    pub output_dir: Option<PathBuf>,

    #[clap(flatten)]
    #[serde(default)]
    pub region: RegionArgs,

    #[clap(long, default_value_t = CYGNSS_LAT_STEP)]
    #[serde(default = "default_cygnss_lat_step")]
    pub lat_step: f64,

    #[clap(long, default_value_t = CYGNSS_LON_STEP)]
    #[serde(default = "default_cygnss_lon_step")]
    pub lon_step: f64,

    /// Number of files to grid at the same time
    #[clap(short, long, default_value_t = 4)]
    #[serde(default = "default_points_processes")]
    pub processes: usize,

    /// Sample variable to average onto the grid. Can be repeated.
    #[clap(long = "variable", default_values_t = default_point_variables())]
    #[serde(default = "default_point_variables")]
    pub variables: Vec<String>,
}

impl PointsArgs {
    pub fn output_dir(&self) -> PathBuf {
        output_dir_or_default(&self.input_dir, self.output_dir.as_deref())
    }
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct RegressArgs {
    /// Directory of gridded wind files (the output of the "points" subcommand)
    pub wind_dir: PathBuf,

    /// Directory of regridded ocean color files (the output of the "swath" subcommand)
    pub ocean_dir: PathBuf,

    /// Path to write the netCDF file with the regression statistics to
    pub output_file: PathBuf,

    /// Independent variable of the regression
    #[clap(short, long, default_value = "wind_speed")]
    #[serde(default = "default_x_var")]
    pub x_var: String,

    /// Dependent variable of the regression
    #[clap(short, long, default_value = "carbon_phyto")]
    #[serde(default = "default_y_var")]
    pub y_var: String,

    /// First day of wind data to use, in YYYY-MM-DD format
    #[clap(long, default_value = "2024-03-05")]
    #[serde(default = "default_wind_start")]
    pub wind_start: NaiveDate,

    /// Last day (inclusive) of wind data to use
    #[clap(long, default_value = "2024-12-31")]
    #[serde(default = "default_end")]
    pub wind_end: NaiveDate,

    /// First day of ocean color data to use
    #[clap(long, default_value = "2024-01-01")]
    #[serde(default = "default_ocean_start")]
    pub ocean_start: NaiveDate,

    /// Last day (inclusive) of ocean color data to use
    #[clap(long, default_value = "2024-12-31")]
    #[serde(default = "default_end")]
    pub ocean_end: NaiveDate,

    /// When aligning the ocean data to the wind grid, do not match days further apart than this
    #[clap(long)]
    pub time_tolerance_hours: Option<i64>,

    /// When aligning the ocean data to the wind grid, do not match latitudes further apart than this (degrees)
    #[clap(long)]
    pub lat_tolerance: Option<f32>,

    /// Same as --lat-tolerance, for longitude
    #[clap(long)]
    pub lon_tolerance: Option<f32>,
}

impl RegressArgs {
    /// Regression between the two directories with every other setting at its default.
    pub fn new(wind_dir: PathBuf, ocean_dir: PathBuf, output_file: PathBuf) -> Self {
        Self {
            wind_dir,
            ocean_dir,
            output_file,
            x_var: default_x_var(),
            y_var: default_y_var(),
            wind_start: default_wind_start(),
            wind_end: default_end(),
            ocean_start: default_ocean_start(),
            ocean_end: default_end(),
            time_tolerance_hours: None,
            lat_tolerance: None,
            lon_tolerance: None,
        }
    }

    pub fn tolerance(&self) -> ReindexTolerance {
        ReindexTolerance {
            time: self.time_tolerance_hours.map(Duration::hours),
            latitude: self.lat_tolerance,
            longitude: self.lon_tolerance,
        }
    }
}

#[derive(Debug, Args)]
pub struct EstimateStepArgs {
    /// Directory containing the swath files (*.nc) to estimate the native resolution of
    pub input_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct GroupsArgs {
    /// netCDF file to list the groups of
    pub file: PathBuf,
}

#[derive(Debug, Args)]
pub struct TimeIdsArgs {
    /// Directory to list
    pub dir: PathBuf,

    /// Only consider files whose extension starts with this
    #[clap(short, long, default_value = "nc")]
    pub extension: String,

    #[clap(short, long, value_enum, default_value_t = FileNaming::OceanColor)]
    pub naming: FileNaming,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunMultiConfig {
    #[serde(default)]
    pub swath: Vec<SwathArgs>,
    #[serde(default)]
    pub points: Vec<PointsArgs>,
    #[serde(default)]
    pub regress: Vec<RegressArgs>,
}

impl RunMultiConfig {
    pub fn from_file(config_file: &Path) -> Result<Self, RegridError> {
        let contents = std::fs::read_to_string(config_file)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Jobs for the OCI and CYGNSS dataset directories found under `data_dir`, with
    /// default regions and steps. The regression job is only added when both exist.
    pub fn from_data_dir(data_dir: &Path, stats_file: &Path, swath_processes: usize, points_processes: usize) -> Result<Self, RegridError> {
        let region = RegionArgs::default();
        let oci_dir = find_dataset_dir(data_dir, OCI_DIR_PREFIX)?;
        let cygnss_dir = find_dataset_dir(data_dir, CYGNSS_DIR_PREFIX)?;

        let swath = oci_dir.iter().map(|dir| SwathArgs {
            input_dir: dir.clone(),
            output_dir: None,
            region: region.clone(),
            lat_step: None,
            lon_step: None,
            processes: swath_processes,
            method: RegridMethod::Bilinear,
            variables: vec![],
        }).collect();

        let points = cygnss_dir.iter().map(|dir| PointsArgs {
            input_dir: dir.clone(),
            output_dir: None,
            region: region.clone(),
            lat_step: CYGNSS_LAT_STEP,
            lon_step: CYGNSS_LON_STEP,
            processes: points_processes,
            variables: default_point_variables(),
        }).collect();

        let regress = match (&oci_dir, &cygnss_dir) {
            (Some(oci), Some(cygnss)) => vec![RegressArgs::new(
                cygnss.join(DEFAULT_OUTPUT_SUBDIR),
                oci.join(DEFAULT_OUTPUT_SUBDIR),
                data_dir.join(stats_file),
            )],
            _ => {
                warn!("Not writing a regression job; it needs both an OCI and a CYGNSS directory");
                vec![]
            }
        };

        Ok(Self { swath, points, regress })
    }
}

#[derive(Debug, Args)]
pub struct RunMultiArgs {
    /// Path to the TOML configuration file that lists the [[swath]], [[points]] and [[regress]] jobs to run
    pub config_file: PathBuf
}

fn output_dir_or_default(input_dir: &Path, output_dir: Option<&Path>) -> PathBuf {
    output_dir.map(|p| p.to_owned())
        .unwrap_or_else(|| input_dir.join(DEFAULT_OUTPUT_SUBDIR))
}

fn default_swath_processes() -> usize { 2 }
fn default_points_processes() -> usize { 4 }
fn default_cygnss_lat_step() -> f64 { CYGNSS_LAT_STEP }
fn default_cygnss_lon_step() -> f64 { CYGNSS_LON_STEP }
fn default_x_var() -> String { "wind_speed".to_owned() }
fn default_y_var() -> String { "carbon_phyto".to_owned() }
fn default_wind_start() -> NaiveDate { NaiveDate::from_ymd_opt(2024, 3, 5).unwrap_or_default() }
fn default_ocean_start() -> NaiveDate { NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default() }
fn default_end() -> NaiveDate { NaiveDate::from_ymd_opt(2024, 12, 31).unwrap_or_default() }


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_config_defaults() {
        let cfg: RunMultiConfig = toml::from_str(r#"
            [[swath]]
            input_dir = "/data/oci"

            [[points]]
            input_dir = "/data/cygnss"
            output_dir = "/data/cygnss/gridded"
            [points.region]
            min_lat = -2.0

            [[regress]]
            wind_dir = "/data/cygnss/gridded"
            ocean_dir = "/data/oci/regridded"
            output_file = "/data/stats.nc"
            wind_start = "2024-04-01"
        "#).unwrap();

        let swath = &cfg.swath[0];
        assert_eq!(swath.processes, 2);
        assert_eq!(swath.method, RegridMethod::Bilinear);
        assert!(swath.variables.is_empty());
        assert_eq!(swath.lat_step, None);
        assert_eq!(swath.region.min_lat, DEFAULT_MIN_LAT);
        assert_eq!(swath.output_dir(), PathBuf::from("/data/oci/regridded"));

        let points = &cfg.points[0];
        assert_eq!(points.processes, 4);
        assert_eq!(points.lat_step, CYGNSS_LAT_STEP);
        assert_eq!(points.variables, default_point_variables());
        assert_eq!(points.region.min_lat, -2.0);
        assert_eq!(points.region.max_lat, DEFAULT_MAX_LAT);
        assert_eq!(points.output_dir(), PathBuf::from("/data/cygnss/gridded"));

        let regress = &cfg.regress[0];
        assert_eq!(regress.x_var, "wind_speed");
        assert_eq!(regress.y_var, "carbon_phyto");
        assert_eq!(regress.wind_start, NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        assert_eq!(regress.ocean_start, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(regress.ocean_end, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
        assert_eq!(regress.tolerance(), ReindexTolerance::default());
    }

    #[test]
    fn test_empty_config() {
        let cfg: RunMultiConfig = toml::from_str("").unwrap();
        assert!(cfg.swath.is_empty() && cfg.points.is_empty() && cfg.regress.is_empty());
    }

    #[test]
    fn test_region_to_bounds() {
        let region = RegionArgs::default();
        assert!(region.to_bounds(0.1, 0.1).is_ok());
        assert!(region.to_bounds(-0.1, 0.1).is_err());
    }

    #[test]
    fn test_config_from_data_dir() {
        let root = tempfile::tempdir().unwrap();
        let oci_old = root.path().join("PACE_OCI_L2_BGC_NRT_2.0-20250121_161459");
        let oci_new = root.path().join("PACE_OCI_L2_BGC_NRT_2.0-20250301_090000");
        std::fs::create_dir(&oci_new).unwrap();
        std::fs::create_dir(&oci_old).unwrap();
        // a file with the prefix is not a dataset directory
        std::fs::write(root.path().join("CYGNSS_NOAA_L2_SWSP_25KM_V1.2.zip"), b"").unwrap();

        let cfg = RunMultiConfig::from_data_dir(root.path(), Path::new("stats.nc"), 3, 5).unwrap();
        assert_eq!(cfg.swath.len(), 1);
        assert_eq!(cfg.swath[0].input_dir, oci_old);
        assert_eq!(cfg.swath[0].processes, 3);
        assert!(cfg.points.is_empty());
        assert!(cfg.regress.is_empty());

        let cygnss = root.path().join("CYGNSS_NOAA_L2_SWSP_25KM_V1.2_1.2-20250124_000751");
        std::fs::create_dir(&cygnss).unwrap();
        let cfg = RunMultiConfig::from_data_dir(root.path(), Path::new("stats.nc"), 3, 5).unwrap();
        assert_eq!(cfg.points[0].input_dir, cygnss);
        assert_eq!(cfg.points[0].lon_step, CYGNSS_LON_STEP);
        let regress = &cfg.regress[0];
        assert_eq!(regress.wind_dir, cygnss.join(DEFAULT_OUTPUT_SUBDIR));
        assert_eq!(regress.ocean_dir, oci_old.join(DEFAULT_OUTPUT_SUBDIR));
        assert_eq!(regress.output_file, root.path().join("stats.nc"));

        // the written file reads back as the same jobs
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: RunMultiConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.swath[0].input_dir, oci_old);
        assert_eq!(back.regress[0].wind_start, regress.wind_start);
    }
}
