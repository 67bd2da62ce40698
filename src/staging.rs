use std::fs;

use camino::Utf8PathBuf;
use directories::BaseDirs;

use crate::domain::{AssemblyName, StimulusSetName};
use crate::error::PackagingError;

/// Local directory where archives and NetCDF files are written before upload.
#[derive(Debug, Clone)]
pub struct Staging {
    root: Utf8PathBuf,
}

impl Staging {
    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn zip_path(&self, name: &StimulusSetName) -> Utf8PathBuf {
        self.root.join("stimuli").join(name.zip_file_name())
    }

    pub fn netcdf_path(&self, name: &AssemblyName) -> Utf8PathBuf {
        self.root.join("assemblies").join(name.netcdf_file_name())
    }

    pub fn ensure_root(&self) -> Result<(), PackagingError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| PackagingError::Filesystem(err.to_string()))
    }
}

pub fn default_staging_root() -> Result<Utf8PathBuf, PackagingError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("brainio-packaging"))
                .ok()
        })
        .ok_or_else(|| PackagingError::Filesystem("unable to resolve cache directory".to_string()))
}
