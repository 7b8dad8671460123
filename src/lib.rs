pub mod error;
pub mod utils;
pub mod timestamps;
pub mod bounds;
pub mod grid;
pub mod swath;
pub mod points;
pub mod resample;
pub mod regression;
pub mod config;
pub mod pipeline;
