//! Time handling: the time ids embedded in satellite file names, and CF-style
//! "<unit> since <reference>" time coordinates.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use clap::ValueEnum;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::RegridError;
use crate::utils::list_files_with_ext;

pub const TIME_ID_FORMAT: &str = "%Y%m%dT%H%M%S";
pub const DEFAULT_TIME_UNITS: &str = "seconds since 1970-01-01 00:00:00";

/// How a data provider embeds the acquisition time in its file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileNaming {
    /// NASA ocean color convention, e.g. `PACE_OCI.20240301T023512.L2.OC_BGC.V2_0.NRT.nc`.
    /// See https://oceancolor.gsfc.nasa.gov/resources/docs/filenaming-convention/
    OceanColor,
    /// CYGNSS convention, where the third dot-separated field ends in `YYYYMMDD-HHMMSS`.
    Cygnss,
}

/// Returns the time id of a file. Names with at most one `.` (such as our own
/// `20240301T023512.nc` outputs) use everything before the first dot.
pub fn file_to_time_id(file: &Path, naming: FileNaming) -> Result<String, RegridError> {
    let name = file.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RegridError::InvalidFileName { file: file.to_owned(), reason: "no UTF-8 file name".to_owned() })?;

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() <= 2 {
        return Ok(parts[0].to_owned())
    }

    match naming {
        FileNaming::OceanColor => Ok(parts[1].to_owned()),
        FileNaming::Cygnss => {
            // e.g. s20240305-000000-e20240305-235959 -> 20240305-235959
            let field = parts[2];
            let tail = field.get(18..)
                .ok_or_else(|| RegridError::InvalidFileName {
                    file: file.to_owned(),
                    reason: format!("field '{field}' is too short to contain a timestamp")
                })?;
            Ok(tail.replace('-', "T"))
        }
    }
}

/// Checks if a string is in the format YYYYMMDDTHHMMSS.
pub fn is_valid_iso_timestamp(iso_time: &str) -> bool {
    NaiveDateTime::parse_from_str(iso_time, TIME_ID_FORMAT).is_ok()
}

pub fn timestamp_to_datetime(file: &Path, naming: FileNaming) -> Result<NaiveDateTime, RegridError> {
    let time_id = file_to_time_id(file, naming)?;
    NaiveDateTime::parse_from_str(&time_id, TIME_ID_FORMAT)
        .map_err(|_| RegridError::InvalidTimestamp { timestamp: time_id })
}

/// Time ids of all `.nc` files in `folder`.
pub fn list_time_stamps_from_folder(folder: &Path, naming: FileNaming) -> Result<Vec<String>, RegridError> {
    list_files_with_ext(folder, "nc")?
        .into_iter()
        .filter(|f| f.extension().map(|e| e == "nc").unwrap_or(false))
        .map(|f| file_to_time_id(&f, naming))
        .collect()
}

/// Input files in `in_dir` (extension starting with `in_ext`) whose time id has
/// no matching `<id>.nc` in `out_dir` yet. Files without a valid time id are skipped.
pub fn files_to_process(in_dir: &Path, in_ext: &str, out_dir: &Path, naming: FileNaming) -> Result<Vec<PathBuf>, RegridError> {
    let mut file_id_pairs = BTreeMap::new();
    for file in list_files_with_ext(in_dir, in_ext)? {
        match file_to_time_id(&file, naming) {
            Ok(id) if is_valid_iso_timestamp(&id) => {
                file_id_pairs.insert(id, file);
            },
            Ok(id) => warn!("Skipping {}: '{id}' is not a YYYYMMDDTHHMMSS time id", file.display()),
            Err(e) => warn!("Skipping {}: {e}", file.display()),
        }
    }

    if out_dir.exists() {
        for id in list_time_stamps_from_folder(out_dir, naming)? {
            file_id_pairs.remove(&id);
        }
    }

    let mut files: Vec<PathBuf> = file_id_pairs.into_values().collect();
    files.sort();
    Ok(files)
}

/// NaiveDateTime's default is the Unix epoch.
pub fn unix_epoch() -> NaiveDateTime {
    NaiveDateTime::default()
}

pub fn datetime_to_unix_seconds(dt: NaiveDateTime) -> f64 {
    let delta = dt - unix_epoch();
    match delta.num_microseconds() {
        Some(us) => us as f64 * 1e-6,
        None => delta.num_seconds() as f64,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn seconds(&self) -> f64 {
        match self {
            TimeUnit::Seconds => 1.0,
            TimeUnit::Minutes => 60.0,
            TimeUnit::Hours => 3600.0,
            TimeUnit::Days => 86400.0,
        }
    }
}

/// A parsed CF time `units` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfTimeUnits {
    pub unit: TimeUnit,
    pub reference: NaiveDateTime,
}

impl Default for CfTimeUnits {
    fn default() -> Self {
        Self { unit: TimeUnit::Seconds, reference: unix_epoch() }
    }
}

impl CfTimeUnits {
    pub fn parse(units: &str) -> Result<Self, RegridError> {
        let err = || RegridError::TimeUnits(units.to_owned());

        let (unit, reference) = units.split_once(" since ").ok_or_else(err)?;
        let unit = match unit.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => TimeUnit::Seconds,
            "min" | "mins" | "minute" | "minutes" => TimeUnit::Minutes,
            "h" | "hr" | "hrs" | "hour" | "hours" => TimeUnit::Hours,
            "d" | "day" | "days" => TimeUnit::Days,
            _ => return Err(err()),
        };

        let reference = reference.trim();
        let reference = reference.strip_suffix("UTC")
            .or_else(|| reference.strip_suffix('Z'))
            .unwrap_or(reference)
            .trim();

        let parsed = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(reference, fmt).ok())
            .or_else(|| {
                NaiveDate::parse_from_str(reference, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
            .ok_or_else(err)?;

        Ok(Self { unit, reference: parsed })
    }

    pub fn decode(&self, value: f64) -> Option<NaiveDateTime> {
        if !value.is_finite() {
            return None
        }
        let millis = (value * self.unit.seconds() * 1000.0).round();
        if millis.abs() >= i64::MAX as f64 {
            return None
        }
        self.reference.checked_add_signed(Duration::milliseconds(millis as i64))
    }

    pub fn encode(&self, dt: NaiveDateTime) -> f64 {
        let delta = dt - self.reference;
        let secs = match delta.num_microseconds() {
            Some(us) => us as f64 * 1e-6,
            None => delta.num_seconds() as f64,
        };
        secs / self.unit.seconds()
    }
}
