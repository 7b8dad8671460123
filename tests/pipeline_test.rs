use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use netcdf::extent::Extents;
use ocean_regrid::config::{PointsArgs, RegionArgs, RegressArgs, RunMultiConfig, SwathArgs};
use ocean_regrid::error::RegridError;
use ocean_regrid::grid::GridDataset;
use ocean_regrid::pipeline;
use ocean_regrid::swath::RegridMethod;
use ocean_regrid::utils::ShowProgress;

const N_LINES: usize = 40;
const DAYS: [u32; 3] = [5, 6, 7];

fn region() -> RegionArgs {
    RegionArgs { min_lat: 0.0, max_lat: 2.0, min_lon: 10.0, max_lon: 12.0 }
}

/// A swath covering -0.2..2.2 N, 9.8..12.2 E with carbon_phyto = 10 + 2 * day_index + lat
fn write_swath(dir: &Path, day: u32) -> PathBuf {
    write_swath_sized(dir, day, N_LINES)
}

/// Same coverage as [`write_swath`] with `n` lines and `n` pixels, so a finer native step for larger `n`
fn write_swath_sized(dir: &Path, day: u32, n: usize) -> PathBuf {
    let path = dir.join(format!("PACE_OCI.202403{day:02}T023512.L2.OC_BGC.V2_0.NRT.nc"));
    let day_index = (day - DAYS[0]) as f32;
    let step = 2.4 / (n - 1) as f32;
    let lat = Array2::from_shape_fn((n, n), |(i, _)| -0.2 + i as f32 * step);
    let lon = Array2::from_shape_fn((n, n), |(_, j)| 9.8 + j as f32 * step);
    let mut carbon = lat.mapv(|l| 10.0 + 2.0 * day_index + l);
    carbon[[0, 0]] = -32767.0;

    let mut ds = netcdf::create(&path).unwrap();
    ds.add_attribute("title", "Synthetic OCI Level-2 BGC swath").unwrap();

    let dims = ["number_of_lines", "pixels_per_line"];
    {
        let mut nav = ds.add_group("navigation_data").unwrap();
        nav.add_dimension(dims[0], n).unwrap();
        nav.add_dimension(dims[1], n).unwrap();
        for (name, data) in [("latitude", &lat), ("longitude", &lon)] {
            let mut var = nav.add_variable::<f32>(name, &dims).unwrap();
            var.put_values(data.as_slice().unwrap(), Extents::All).unwrap();
        }
    }
    {
        let mut geo = ds.add_group("geophysical_data").unwrap();
        geo.add_dimension(dims[0], n).unwrap();
        geo.add_dimension(dims[1], n).unwrap();
        let mut var = geo.add_variable::<f32>("carbon_phyto", &dims).unwrap();
        var.add_attribute("_FillValue", -32767.0f32).unwrap();
        var.put_values(carbon.as_slice().unwrap(), Extents::All).unwrap();
        var.add_attribute("units", "mg m^-3").unwrap();
    }
    path
}

/// One sample on every node of the 0.5 degree grid, plus a second sample in the first cell.
/// Wind speed is 5 + day_index everywhere except that extra sample, which is 2 m/s higher.
fn write_cygnss(dir: &Path, day: u32) -> PathBuf {
    let path = dir.join(format!("cyg.ddmi.s202403{day:02}-000000-e202403{day:02}-235959.l2.wind-mss-cdr.a32.d33.nc4"));
    let wind = 5.0 + (day - DAYS[0]) as f32;

    let mut lat = Vec::new();
    let mut lon = Vec::new();
    let mut speed = Vec::new();
    for a in 0..4 {
        for b in 0..4 {
            lat.push(a as f32 * 0.5);
            lon.push(10.0 + b as f32 * 0.5);
            speed.push(wind);
        }
    }
    lat.push(0.1);
    lon.push(10.1);
    speed.push(wind + 2.0);
    // off the grid, must not count anywhere
    lat.push(-5.0);
    lon.push(10.0);
    speed.push(100.0);
    // fill value
    lat.push(1.0);
    lon.push(11.0);
    speed.push(-9999.0);

    let n = lat.len();
    let sample_time = Array1::from_elem(n, 43200.0f64);
    let uncertainty = vec![0.5f32; n];

    let mut ds = netcdf::create(&path).unwrap();
    ds.add_attribute("title", "Synthetic CYGNSS Level 2 wind speed").unwrap();
    ds.add_dimension("sample", n).unwrap();

    let mut var = ds.add_variable::<f32>("lat", &["sample"]).unwrap();
    var.put_values(&lat, Extents::All).unwrap();
    let mut var = ds.add_variable::<f32>("lon", &["sample"]).unwrap();
    var.put_values(&lon, Extents::All).unwrap();
    let mut var = ds.add_variable::<f64>("sample_time", &["sample"]).unwrap();
    var.put_values(sample_time.as_slice().unwrap(), Extents::All).unwrap();
    var.add_attribute("units", format!("seconds since 2024-03-{day:02} 00:00:00").as_str()).unwrap();

    let mut var = ds.add_variable::<f32>("wind_speed", &["sample"]).unwrap();
    var.add_attribute("_FillValue", -9999.0f32).unwrap();
    var.put_values(&speed, Extents::All).unwrap();
    var.add_attribute("units", "m s-1").unwrap();
    let mut var = ds.add_variable::<f32>("wind_speed_uncertainty", &["sample"]).unwrap();
    var.put_values(&uncertainty, Extents::All).unwrap();
    path
}

fn swath_args(input_dir: &Path) -> SwathArgs {
    SwathArgs {
        input_dir: input_dir.to_owned(),
        output_dir: None,
        region: region(),
        lat_step: Some(0.25),
        lon_step: Some(0.25),
        processes: 2,
        method: RegridMethod::Bilinear,
        variables: vec![],
    }
}

fn points_args(input_dir: &Path) -> PointsArgs {
    PointsArgs {
        input_dir: input_dir.to_owned(),
        output_dir: None,
        region: region(),
        lat_step: 0.5,
        lon_step: 0.5,
        processes: 2,
        variables: vec!["wind_speed".to_owned(), "wind_speed_uncertainty".to_owned()],
    }
}

#[test]
fn test_swath_points_and_regression() {
    let root = tempfile::tempdir().unwrap();
    let oci_dir = root.path().join("PACE_OCI_L2_BGC_NRT_2.0-20250121_161459");
    let cygnss_dir = root.path().join("CYGNSS_NOAA_L2_SWSP_25KM_V1.2_1.2-20250124_000751");
    std::fs::create_dir_all(&oci_dir).unwrap();
    std::fs::create_dir_all(&cygnss_dir).unwrap();
    for day in DAYS {
        write_swath(&oci_dir, day);
        write_cygnss(&cygnss_dir, day);
    }

    let groups = pipeline::find_groups(&oci_dir.join("PACE_OCI.20240305T023512.L2.OC_BGC.V2_0.NRT.nc")).unwrap();
    assert!(groups.contains(&"navigation_data".to_owned()));
    assert!(groups.contains(&"geophysical_data".to_owned()));

    // pooled mean of line spacing (2.4/39) and zero pixel spacing
    let (lat_step, lon_step) = pipeline::run_estimate_steps(&oci_dir, ShowProgress::No).unwrap();
    assert!((lat_step - 1.2 / 39.0).abs() < 1e-5);
    assert!((lon_step - 1.2 / 39.0).abs() < 1e-5);

    let swath = swath_args(&oci_dir);
    pipeline::run_swath(&swath, ShowProgress::No).unwrap();
    let regridded = oci_dir.join("regridded");
    for day in DAYS {
        assert!(regridded.join(format!("202403{day:02}T023512.nc")).exists());
    }

    let ocean = GridDataset::open_mf(&regridded).unwrap();
    assert_eq!(ocean.shape(), (3, 8, 8));
    let carbon = &ocean.variable("carbon_phyto").unwrap().data;
    // node (lat 0.5, lon 10.5) on the second day
    assert!((carbon[[1, 2, 2]] - 12.5).abs() < 1e-3);
    assert!(carbon.iter().all(|v| v.is_finite()));

    let points = points_args(&cygnss_dir);
    pipeline::run_points(&points, ShowProgress::No).unwrap();
    let wind_out = cygnss_dir.join("regridded").join("20240305T235959.nc");
    assert!(wind_out.exists());

    let wind = GridDataset::from_netcdf(&wind_out).unwrap();
    assert_eq!(wind.shape(), (1, 4, 4));
    assert_eq!(wind.time[0].to_string(), "2024-03-05 12:00:00");
    let speed = &wind.variable("wind_speed").unwrap().data;
    assert_eq!(speed[[0, 0, 0]], 6.0);
    assert_eq!(speed[[0, 1, 1]], 5.0);
    assert_eq!(speed[[0, 2, 2]], 5.0);

    // Outputs already exist, so nothing is reprocessed
    let modified = std::fs::metadata(&wind_out).unwrap().modified().unwrap();
    pipeline::run_points(&points, ShowProgress::No).unwrap();
    assert_eq!(std::fs::metadata(&wind_out).unwrap().modified().unwrap(), modified);

    let stats_file = root.path().join("stats").join("regression_stats.nc");
    let regress = RegressArgs::new(cygnss_dir.join("regridded"), regridded.clone(), stats_file.clone());
    let stats = pipeline::run_regression(&regress, ShowProgress::No).unwrap();

    assert_eq!(stats.inputs.time.len(), 3);
    assert_eq!(stats.inputs.latitude.len(), 4);
    for ((a, b), &n) in stats.stats.n_points.indexed_iter() {
        assert_eq!(n, 3.0, "cell ({a}, {b})");
        assert!((stats.stats.slope[[a, b]] - 2.0).abs() < 1e-3, "cell ({a}, {b})");
        assert!(stats.stats.r_value[[a, b]] > 0.999);
    }

    let ds = netcdf::open(&stats_file).unwrap();
    for name in ["wind_speed", "carbon_phyto", "n_points", "slope", "intercept", "r_value", "p_value", "std_err"] {
        assert!(ds.variable(name).is_some(), "{name} missing from the stats file");
    }
    assert_eq!(ds.variable("slope").unwrap().dimensions().len(), 2);
    assert_eq!(ds.variable("carbon_phyto").unwrap().dimensions().len(), 3);
}

#[test]
fn test_failed_file_is_reported_after_the_others() {
    let root = tempfile::tempdir().unwrap();
    write_cygnss(root.path(), 5);
    std::fs::write(root.path().join("cyg.ddmi.s20240306-000000-e20240306-235959.l2.wind-mss-cdr.a32.d33.nc4"), b"not netcdf").unwrap();

    let err = pipeline::run_points(&points_args(root.path()), ShowProgress::No).unwrap_err();
    assert!(matches!(err, RegridError::FilesFailed { failed: 1, total: 2 }));
    assert!(root.path().join("regridded").join("20240305T235959.nc").exists());
}

#[test]
fn test_missing_inputs() {
    let root = tempfile::tempdir().unwrap();
    let err = pipeline::run_estimate_steps(root.path(), ShowProgress::No).unwrap_err();
    assert!(matches!(err, RegridError::NoInputFiles(_)));

    let mut swath = swath_args(root.path());
    swath.lat_step = None;
    assert!(matches!(pipeline::run_swath(&swath, ShowProgress::No), Err(RegridError::NoInputFiles(_))));
}

#[test]
fn test_rerun_keeps_the_first_grid() {
    let root = tempfile::tempdir().unwrap();
    write_swath(root.path(), 5);
    write_swath(root.path(), 6);

    let mut swath = swath_args(root.path());
    swath.lat_step = None;
    swath.lon_step = None;
    pipeline::run_swath(&swath, ShowProgress::No).unwrap();
    let regridded = root.path().join("regridded");
    let first = GridDataset::open_mf(&regridded).unwrap();
    assert_eq!(first.time.len(), 2);

    // a later, denser swath would give a different step estimate
    write_swath_sized(root.path(), 7, 60);
    pipeline::run_swath(&swath, ShowProgress::No).unwrap();

    let all = GridDataset::open_mf(&regridded).unwrap();
    assert_eq!(all.shape(), (3, first.latitude.len(), first.longitude.len()));
    assert_eq!(all.latitude, first.latitude);
    assert_eq!(all.longitude, first.longitude);
    let carbon = &all.variable("carbon_phyto").unwrap().data;
    assert!(carbon.iter().all(|v| v.is_finite()));
}

#[test]
fn test_multi_runs_later_jobs_after_a_failure() {
    let root = tempfile::tempdir().unwrap();
    let empty_oci = root.path().join("oci");
    let cygnss_dir = root.path().join("cygnss");
    std::fs::create_dir_all(&empty_oci).unwrap();
    std::fs::create_dir_all(&cygnss_dir).unwrap();
    write_cygnss(&cygnss_dir, 5);

    let mut swath = swath_args(&empty_oci);
    swath.lat_step = None;
    let cfg = RunMultiConfig { swath: vec![swath], points: vec![points_args(&cygnss_dir)], regress: vec![] };

    match pipeline::run_multi(&cfg, ShowProgress::No) {
        Err(RegridError::NoInputFiles(dir)) => assert_eq!(dir, empty_oci),
        other => panic!("expected the swath job's error, got {other:?}"),
    }
    assert!(cygnss_dir.join("regridded").join("20240305T235959.nc").exists());
}
