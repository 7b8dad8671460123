use std::{path::PathBuf, io::Write};

use clap::Parser;
use env_logger::{Builder, Env};
use log::info;
use ocean_regrid::{config::RunMultiConfig, error::RegridError};

fn main() -> Result<(), RegridError> {
    Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = MainArgs::parse();
    let cfg = RunMultiConfig::from_data_dir(&args.data_dir, &args.stats_file, args.swath_processes, args.points_processes)?;

    let cfg_str = toml::to_string_pretty(&cfg)?;
    let mut f = std::fs::File::create(&args.config_file)?;
    write!(f, "{}", cfg_str)?;
    info!("Wrote {} swath, {} points and {} regression jobs to {}",
          cfg.swath.len(), cfg.points.len(), cfg.regress.len(), args.config_file.display());
    Ok(())
}

/// Create a TOML file appropriate to pass to the `multi` subcommand of ocean-regrid
#[derive(Debug, Parser)]
struct MainArgs {
    /// Directory containing the downloaded dataset directories (PACE_OCI_L2_BGC_NRT_2.0*, CYGNSS_NOAA_L2_SWSP_25KM*)
    data_dir: PathBuf,

    /// Path to write the configuration file as.
    config_file: PathBuf,

    /// Name of the regression output file, relative to DATA_DIR
    #[clap(long, default_value = "regression_stats.nc")]
    stats_file: PathBuf,

    /// Number of swath files to regrid at once
    #[clap(long, default_value_t = 2)]
    swath_processes: usize,

    /// Number of CYGNSS files to grid at once
    #[clap(long, default_value_t = 4)]
    points_processes: usize,
}
