pub mod app;
pub mod archive;
pub mod assembly;
pub mod config;
pub mod domain;
pub mod error;
pub mod hash;
pub mod lookup;
pub mod netcdf;
pub mod output;
pub mod staging;
pub mod table;
pub mod upload;
