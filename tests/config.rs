use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use brainio_packaging::config::{Config, ConfigLoader};
use brainio_packaging::error::PackagingError;

#[test]
fn defaults_fill_missing_fields() {
    let resolved = ConfigLoader::resolve_config(Config {
        lookup_db: Some("/srv/brainio/lookup.db".to_string()),
        ..Config::default()
    })
    .unwrap();

    assert_eq!(resolved.lookup_db, Utf8PathBuf::from("/srv/brainio/lookup.db"));
    assert_eq!(resolved.bucket.as_str(), "brainio-contrib");
    assert!(resolved.staging_dir.ends_with("brainio-packaging"));
    assert_eq!(resolved.s3.region, None);
    assert_eq!(resolved.s3.part_size_mib, 16);
}

#[test]
fn reads_explicit_config_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("brainio-packaging.json");
    fs::write(
        &path,
        r#"{"staging_dir": "/tmp/brainio-staging", "bucket": "brainio-dicarlo", "s3": {"region": "us-east-1", "part_size_mib": 64}}"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.staging_dir, Utf8PathBuf::from("/tmp/brainio-staging"));
    assert_eq!(resolved.bucket.as_str(), "brainio-dicarlo");
    assert_eq!(resolved.s3.part_size_mib, 64);
}

#[test]
fn explicit_config_must_exist() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("missing.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(PackagingError::ConfigRead(_))
    );
}

#[test]
fn malformed_config_is_reported() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("brainio-packaging.json");
    fs::write(&path, "{ not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(PackagingError::ConfigParse(_))
    );
}
