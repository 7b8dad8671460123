use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RegridError {
    #[error("Error reading netCDF file {}: {nc_error}", display_file(.file))]
    NetcdfError{nc_error: netcdf::error::Error, file: Option<PathBuf>},
    #[error("No group named '{grpname}' in {}", .file.display())]
    NetcdfMissingGroup{file: PathBuf, grpname: String},
    #[error("No variable named '{varname}' in {}", display_file(.file))]
    NetcdfMissingVar{file: Option<PathBuf>, varname: String},
    #[error("Wrong type for attribute {attname} on variable {varname} in file {}: expected a {expected}", display_file(.file))]
    NetcdfWrongAttrType{file: Option<PathBuf>, varname: String, attname: String, expected: &'static str},
    #[error("Error in shape of variable '{varname}' in {}: {nd_error}", display_file(.file))]
    NetcdfShapeError{file: Option<PathBuf>, varname: String, nd_error: ndarray::ShapeError},
    #[error("Invalid bounding box: {0}")]
    InvalidBounds(String),
    #[error("Cannot get a time id from file name {}: {reason}", .file.display())]
    InvalidFileName{file: PathBuf, reason: String},
    #[error("'{timestamp}' is not a valid YYYYMMDDTHHMMSS timestamp")]
    InvalidTimestamp{timestamp: String},
    #[error("Cannot interpret time units '{0}'")]
    TimeUnits(String),
    #[error("Grids do not match: {0}")]
    GridMismatch(String),
    #[error("No input files found in {}", .0.display())]
    NoInputFiles(PathBuf),
    #[error("{} contains no usable samples", .0.display())]
    EmptyInput(PathBuf),
    #[error("Cannot calculate a linear regression: {0}")]
    RegressionError(String),
    #[error("{failed} of {total} files could not be processed")]
    FilesFailed{failed: usize, total: usize},
    #[error("Could not set up the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Could not parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("Could not serialize configuration: {0}")]
    ConfigWrite(#[from] toml::ser::Error),
    #[error("Internal error in regridding code, cause: {0}")]
    InternalError(String),
}

fn display_file(file: &Option<PathBuf>) -> String {
    file.as_ref()
        .map(|f| f.display().to_string())
        .unwrap_or_else(|| "?".to_owned())
}

impl RegridError {
    pub fn from_nc_error(nc_error: netcdf::error::Error, file: PathBuf) -> Self {
        Self::NetcdfError { nc_error, file: Some(file) }
    }

    pub fn from_shape_error(nd_error: ndarray::ShapeError, file: PathBuf, varname: String) -> Self {
        Self::NetcdfShapeError { file: Some(file), varname, nd_error }
    }

    pub fn missing_var(file: &std::path::Path, varname: &str) -> Self {
        Self::NetcdfMissingVar { file: Some(file.to_owned()), varname: varname.to_owned() }
    }
}

impl From<netcdf::error::Error> for RegridError {
    fn from(value: netcdf::error::Error) -> Self {
        Self::NetcdfError { nc_error: value, file: None }
    }
}
