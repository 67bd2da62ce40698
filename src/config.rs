use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::BucketName;
use crate::error::PackagingError;
use crate::staging::default_staging_root;
use crate::upload::S3Settings;

pub const DEFAULT_CONFIG_FILE: &str = "brainio-packaging.json";
pub const LOOKUP_DB_ENV: &str = "BRAINIO_LOOKUP_DB";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub lookup_db: Option<String>,
    #[serde(default)]
    pub staging_dir: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub s3: Option<S3Settings>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub lookup_db: Utf8PathBuf,
    pub staging_dir: Utf8PathBuf,
    pub bucket: BucketName,
    pub s3: S3Settings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `brainio-packaging.json` in the working directory when
    /// present. Without either, defaults apply. `BRAINIO_LOOKUP_DB` overrides
    /// the database location.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PackagingError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let mut config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| PackagingError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| PackagingError::ConfigParse(err.to_string()))?
        };

        if let Ok(db) = std::env::var(LOOKUP_DB_ENV) {
            if !db.trim().is_empty() {
                config.lookup_db = Some(db.trim().to_string());
            }
        }

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PackagingError> {
        let lookup_db = match config.lookup_db {
            Some(path) => Utf8PathBuf::from(path),
            None => default_lookup_db()?,
        };
        let staging_dir = match config.staging_dir {
            Some(path) => Utf8PathBuf::from(path),
            None => default_staging_root()?,
        };
        let bucket = match config.bucket {
            Some(bucket) => bucket.parse()?,
            None => BucketName::default(),
        };

        Ok(ResolvedConfig {
            lookup_db,
            staging_dir,
            bucket,
            s3: config.s3.unwrap_or_default(),
        })
    }
}

pub fn default_lookup_db() -> Result<Utf8PathBuf, PackagingError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".brainio").join("lookup.db")).ok()
        })
        .ok_or_else(|| PackagingError::Filesystem("unable to resolve home directory".to_string()))
}
