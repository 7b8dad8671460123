use clap::{Parser, Subcommand};
use env_logger::{Builder, Env};
use log::info;

use ocean_regrid::config::{EstimateStepArgs, GroupsArgs, PointsArgs, RegressArgs, RunMultiArgs, RunMultiConfig, SwathArgs, TimeIdsArgs};
use ocean_regrid::error::RegridError;
use ocean_regrid::pipeline;
use ocean_regrid::timestamps::file_to_time_id;
use ocean_regrid::utils::{list_files_with_ext, ShowProgress};

fn main() -> Result<(), RegridError> {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let args = Cli::parse();
    let show_progress = ShowProgress::from_flag(args.no_progress);

    match args.command {
        Commands::Swath(swath_args) => pipeline::run_swath(&swath_args, show_progress),
        Commands::Points(points_args) => pipeline::run_points(&points_args, show_progress),
        Commands::Regress(regress_args) => pipeline::run_regression(&regress_args, show_progress).map(|_| ()),
        Commands::EstimateStep(step_args) => {
            let (lat_step, lon_step) = pipeline::run_estimate_steps(&step_args.input_dir, show_progress)?;
            println!("lat_step = {lat_step}");
            println!("lon_step = {lon_step}");
            Ok(())
        },
        Commands::Groups(groups_args) => {
            for name in pipeline::find_groups(&groups_args.file)? {
                println!("{name}");
            }
            Ok(())
        },
        Commands::TimeIds(id_args) => {
            for file in list_files_with_ext(&id_args.dir, &id_args.extension)? {
                println!("{}", file_to_time_id(&file, id_args.naming)?);
            }
            Ok(())
        },
        Commands::Multi(multi_args) => {
            let cfg = RunMultiConfig::from_file(&multi_args.config_file)?;
            info!("Running {} jobs from {}", cfg.swath.len() + cfg.points.len() + cfg.regress.len(), multi_args.config_file.display());
            pipeline::run_multi(&cfg, show_progress)
        },
    }
}

/// Regrid PACE OCI ocean color swaths and CYGNSS wind samples onto a common
/// lat/lon grid and regress one on the other.
#[derive(Debug, Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Do not draw progress bars
    #[clap(long, global = true)]
    no_progress: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Regrid the OCI Level-2 swaths in a directory, one output file per swath
    Swath(SwathArgs),
    /// Average the CYGNSS Level-2 samples in a directory onto a grid, one output file per input
    Points(PointsArgs),
    /// Compute per-cell linear regressions between gridded wind and ocean color data
    Regress(RegressArgs),
    /// Estimate the native lat/lon resolution of the swaths in a directory
    EstimateStep(EstimateStepArgs),
    /// List the groups in a netCDF file
    Groups(GroupsArgs),
    /// Print the time id of each file in a directory
    TimeIds(TimeIdsArgs),
    /// Run several jobs given in a TOML file
    Multi(RunMultiArgs),
}
