use std::io::Read;
use std::ops::AddAssign;
use std::path::{PathBuf, Path};

use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use ndarray::{ArrayD, ArrayView, Dimension};
use netcdf::extent::Extents;
use netcdf::AttrValue;
use num_traits::Float;
use sha2::{Digest, Sha256};

use crate::error::RegridError;

/// Attributes describing how values are packed on disk. Fields are stored
/// unpacked, so these never get copied to an output variable.
pub const PACKING_ATTRIBUTES: [&str; 4] = ["_FillValue", "missing_value", "scale_factor", "add_offset"];

pub const NC_DEFLATE_LEVEL: i32 = 5;

pub(crate) fn nc_file(ds: &netcdf::File) -> PathBuf {
    ds.path()
      .unwrap_or_else(|_| PathBuf::from("?"))
}

/// Read a variable as `f32`, masking fill values and applying `scale_factor`/`add_offset`
/// the way a CF-aware reader would.
pub fn load_decoded_var(var: &netcdf::Variable, file: &Path) -> Result<ArrayD<f32>, RegridError> {
    let raw = var.values_arr::<f32, _>(Extents::All)
        .map_err(|e| RegridError::from_nc_error(e, file.to_owned()))?;

    let fill = get_f64_attr(var, "_FillValue")
        .or_else(|| get_f64_attr(var, "missing_value"))
        .map(|v| v as f32);
    let scale = get_f64_attr(var, "scale_factor").unwrap_or(1.0) as f32;
    let offset = get_f64_attr(var, "add_offset").unwrap_or(0.0) as f32;

    let decoded = raw.mapv(|v| {
        if Some(v) == fill || v.is_nan() {
            f32::NAN
        } else {
            v * scale + offset
        }
    });
    Ok(decoded)
}

pub fn load_nc_var<T: netcdf::NcPutGet, D: Dimension>(var: &netcdf::Variable, file: &Path) -> Result<ndarray::Array<T, D>, RegridError> {
    let data = var.values_arr::<T, _>(Extents::All)
        .map_err(|e| RegridError::from_nc_error(e, file.to_owned()))?
        .into_dimensionality::<D>()
        .map_err(|e| RegridError::from_shape_error(e, file.to_owned(), var.name()))?;
    Ok(data)
}

pub fn attr_to_f64(value: &AttrValue) -> Option<f64> {
    let v = match value {
        AttrValue::Uchar(v) => *v as f64,
        AttrValue::Uchars(v) => *v.first()? as f64,
        AttrValue::Schar(v) => *v as f64,
        AttrValue::Schars(v) => *v.first()? as f64,
        AttrValue::Ushort(v) => *v as f64,
        AttrValue::Ushorts(v) => *v.first()? as f64,
        AttrValue::Short(v) => *v as f64,
        AttrValue::Shorts(v) => *v.first()? as f64,
        AttrValue::Uint(v) => *v as f64,
        AttrValue::Uints(v) => *v.first()? as f64,
        AttrValue::Int(v) => *v as f64,
        AttrValue::Ints(v) => *v.first()? as f64,
        AttrValue::Ulonglong(v) => *v as f64,
        AttrValue::Ulonglongs(v) => *v.first()? as f64,
        AttrValue::Longlong(v) => *v as f64,
        AttrValue::Longlongs(v) => *v.first()? as f64,
        AttrValue::Float(v) => *v as f64,
        AttrValue::Floats(v) => *v.first()? as f64,
        AttrValue::Double(v) => *v,
        AttrValue::Doubles(v) => *v.first()?,
        AttrValue::Str(_) | AttrValue::Strs(_) => return None,
    };
    Some(v)
}

pub fn get_f64_attr(nc_var: &netcdf::Variable, attr_name: &str) -> Option<f64> {
    let value = nc_var.attribute(attr_name)?.value().ok()?;
    attr_to_f64(&value)
}

pub fn get_str_attr_with_default(nc_var: &netcdf::Variable, attr_name: &str, default: String) -> Result<String, RegridError> {
    let nc_attr = if let Some(a) = nc_var.attribute(attr_name) {
        a
    }else{
        return Ok(default)
    };

    let value = if let Ok(v) = nc_attr.value() {
        v
    }else{
        return Ok(default)
    };

    match value {
        AttrValue::Str(v) => Ok(v),
        AttrValue::Strs(v) => {
            let s = v.join("\n");
            Ok(s)
        },
        _ => Err(RegridError::NetcdfWrongAttrType { file: None, varname: nc_var.name(), attname: attr_name.to_owned(), expected: "String" })
    }
}

/// Collect name/value pairs from any attribute iterator (file, group or variable).
pub fn collect_attributes<'a, I>(attrs: I, file: &Path) -> Result<Vec<(String, AttrValue)>, RegridError>
where I: Iterator<Item = netcdf::Attribute<'a>>
{
    attrs.map(|a| {
        let value = a.value()
            .map_err(|e| RegridError::from_nc_error(e, file.to_owned()))?;
        Ok((a.name().to_owned(), value))
    }).collect()
}

pub fn write_var_attributes(var: &mut netcdf::VariableMut, attrs: &[(String, AttrValue)], file: &Path) -> Result<(), RegridError> {
    for (name, value) in attrs {
        if PACKING_ATTRIBUTES.contains(&name.as_str()) {
            continue;
        }
        var.add_attribute(name, value.clone())
            .map_err(|e| RegridError::from_nc_error(e, file.to_owned()))?;
    }
    Ok(())
}

pub fn write_nc_var<T: netcdf::NcPutGet + Clone, D: Dimension>(
    ds: &mut netcdf::MutableFile,
    data: ArrayView<T, D>,
    name: &str,
    dims: &[&str],
    units: Option<&str>,
    description: Option<&str>
) -> Result<(), RegridError> {
    let file = nc_file(ds);

    let mut var = ds.add_variable::<T>(name, dims)
        .map_err(|e| RegridError::from_nc_error(e, file.clone()))?;
    let data = data.as_standard_layout();
    let values = data.as_slice()
        .ok_or_else(|| RegridError::InternalError(format!("data for variable {name} is not contiguous")))?;
    var.put_values(values, Extents::All)
        .map_err(|e| RegridError::from_nc_error(e, file.clone()))?;

    if let Some(units) = units {
        var.add_attribute("units", units)
            .map_err(|e| RegridError::from_nc_error(e, file.clone()))?;
    }

    if let Some(description) = description {
        var.add_attribute("description", description)
            .map_err(|e| RegridError::from_nc_error(e, file.clone()))?;
    }

    Ok(())
}

/// Write an `f32` field with a NaN fill value and the given attributes.
pub fn write_field<D: Dimension>(
    ds: &mut netcdf::MutableFile,
    data: ArrayView<f32, D>,
    name: &str,
    dims: &[&str],
    attrs: &[(String, AttrValue)],
) -> Result<(), RegridError> {
    let file = nc_file(ds);

    let mut var = ds.add_variable::<f32>(name, dims)
        .map_err(|e| RegridError::from_nc_error(e, file.clone()))?;
    var.set_fill_value(f32::NAN)
        .map_err(|e| RegridError::from_nc_error(e, file.clone()))?;
    var.compression(NC_DEFLATE_LEVEL, true)
        .map_err(|e| RegridError::from_nc_error(e, file.clone()))?;

    let data = data.as_standard_layout();
    let values = data.as_slice()
        .ok_or_else(|| RegridError::InternalError(format!("data for variable {name} is not contiguous")))?;
    var.put_values(values, Extents::All)
        .map_err(|e| RegridError::from_nc_error(e, file.clone()))?;

    write_var_attributes(&mut var, attrs, &file)
}

/// Index of the axis element closest to `value`; the first one wins ties.
pub fn nearest_index<T: Float>(axis: &[T], value: T) -> Option<usize> {
    if value.is_nan() {
        return None
    }

    axis.iter()
        .enumerate()
        .filter(|(_, a)| !a.is_nan())
        .fold(None, |best: Option<(usize, T)>, (i, &a)| {
            let d = (a - value).abs();
            match best {
                Some((_, bd)) if bd <= d => best,
                _ => Some((i, d)),
            }
        })
        .map(|(i, _)| i)
}

/// All files in `dir` whose extension starts with `ext_prefix`, sorted by path.
pub fn list_files_with_ext(dir: &Path, ext_prefix: &str) -> Result<Vec<PathBuf>, RegridError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let p = entry?.path();
        if !p.is_file() {
            continue;
        }
        let matches = p.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.starts_with(ext_prefix))
            .unwrap_or(false);
        if matches {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}

/// The first directory directly under `data_dir` whose name starts with `prefix`,
/// in path order.
pub fn find_dataset_dir(data_dir: &Path, prefix: &str) -> Result<Option<PathBuf>, RegridError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let p = entry?.path();
        let matches = p.is_dir() && p.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(prefix))
            .unwrap_or(false);
        if matches {
            dirs.push(p);
        }
    }

    dirs.sort();
    if dirs.len() > 1 {
        warn!("{} directories in {} start with {prefix}, using {}", dirs.len(), data_dir.display(), dirs[0].display());
    } else if dirs.is_empty() {
        warn!("No directory in {} starts with {prefix}", data_dir.display());
    }
    Ok(dirs.into_iter().next())
}

/// Run `write` against `<out_file>.tmp` and rename the result to `out_file` once
/// it succeeds. On failure the partial file is removed and `out_file` is untouched.
pub fn write_atomically<F>(out_file: &Path, write: F) -> Result<(), RegridError>
where F: FnOnce(&Path) -> Result<(), RegridError>
{
    let mut tmp_name = out_file.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_file = PathBuf::from(tmp_name);

    match write(&tmp_file) {
        Ok(()) => {
            std::fs::rename(&tmp_file, out_file)?;
            Ok(())
        },
        Err(e) => {
            if tmp_file.exists() {
                if let Err(rm_err) = std::fs::remove_file(&tmp_file) {
                    warn!("Could not remove partial output {}: {rm_err}", tmp_file.display());
                }
            }
            Err(e)
        }
    }
}

pub fn file_sha256(file: &Path) -> Result<String, RegridError> {
    let mut f = std::fs::File::open(file)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowProgress {
    Yes,
    No
}

impl ShowProgress {
    pub fn from_flag(no_progress: bool) -> Self {
        if no_progress { Self::No } else { Self::Yes }
    }

    pub fn bar(&self, n: u64, msg: &str) -> ProgressBar {
        match self {
            ShowProgress::Yes => {
                let pb = ProgressBar::new(n);
                if let Ok(sty) = ProgressStyle::with_template("{msg} {bar} {human_pos}/{human_len}") {
                    pb.set_style(sty);
                }
                pb.set_message(msg.to_owned());
                pb
            },
            ShowProgress::No => ProgressBar::hidden(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunningMean<T: Float> {
    sum: T,
    count: u64,
}

impl<T: Float> Default for RunningMean<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Float> RunningMean<T> {
    pub fn new() -> Self {
        Self { sum: T::zero(), count: 0 }
    }

    pub fn mean(&self) -> Option<T> {
        if self.count == 0 {
            None
        } else {
            <T as num_traits::NumCast>::from(self.count).map(|n| self.sum / n)
        }
    }
}

impl<T: Float> AddAssign<T> for RunningMean<T> {
    fn add_assign(&mut self, rhs: T) {
        if !rhs.is_nan() {
            self.sum = self.sum + rhs;
            self.count += 1;
        }
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_mean_skips_nan() {
        let mut m = RunningMean::new();
        for v in [1.0f32, f32::NAN, 3.0] {
            m += v;
        }
        assert_eq!(m.mean(), Some(2.0));

        let empty: RunningMean<f64> = RunningMean::new();
        assert_eq!(empty.mean(), None);
    }

    #[test]
    fn test_find_dataset_dir() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(find_dataset_dir(root.path(), "CYGNSS").unwrap(), None);

        std::fs::write(root.path().join("CYGNSS_A.txt"), b"").unwrap();
        std::fs::create_dir(root.path().join("CYGNSS_C")).unwrap();
        std::fs::create_dir(root.path().join("CYGNSS_B")).unwrap();
        std::fs::create_dir(root.path().join("OTHER")).unwrap();
        assert_eq!(find_dataset_dir(root.path(), "CYGNSS").unwrap(), Some(root.path().join("CYGNSS_B")));
        assert!(find_dataset_dir(&root.path().join("missing"), "CYGNSS").is_err());
    }

    #[test]
    fn test_write_atomically() {
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("out.nc");

        let err = write_atomically(&out, |tmp| {
            std::fs::write(tmp, b"half")?;
            Err(RegridError::InternalError("stopped".to_owned()))
        });
        assert!(err.is_err());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);

        write_atomically(&out, |tmp| Ok(std::fs::write(tmp, b"whole")?)).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"whole");
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_nearest_index() {
        let axis = [0.0f32, 0.5, 1.0, 1.5];
        assert_eq!(nearest_index(&axis, 0.7), Some(1));
        assert_eq!(nearest_index(&axis, -3.0), Some(0));
        assert_eq!(nearest_index(&axis, 9.0), Some(3));
        // ties go to the first element, like argmin
        assert_eq!(nearest_index(&axis, 0.25), Some(0));
        assert_eq!(nearest_index(&axis, f32::NAN), None);
        assert_eq!(nearest_index::<f64>(&[], 1.0), None);
    }

    #[test]
    fn test_attr_to_f64() {
        assert_eq!(attr_to_f64(&AttrValue::Short(-32767)), Some(-32767.0));
        assert_eq!(attr_to_f64(&AttrValue::Floats(vec![0.5, 2.0])), Some(0.5));
        assert_eq!(attr_to_f64(&AttrValue::Str("x".to_owned())), None);
        assert_eq!(attr_to_f64(&AttrValue::Doubles(vec![])), None);
    }
}
