use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Timelike, Utc};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::PackagingError;

/// A file to place into an archive under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub source: PathBuf,
    pub name: String,
}

impl ArchiveEntry {
    pub fn new(source: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
        }
    }
}

/// Packs `entries` into a zip archive at `destination`.
///
/// Names are used exactly as given. When two entries share a name the later
/// one wins and the earlier one is skipped with a warning. Entries are stored
/// uncompressed and stamped with the source file's modification time, so the
/// same inputs always produce the same bytes.
///
/// The archive is assembled in a temporary file next to `destination` and
/// only moved into place once every entry was written.
pub fn build_archive(entries: &[ArchiveEntry], destination: &Path) -> Result<(), PackagingError> {
    tracing::debug!(destination = %destination.display(), entries = entries.len(), "building archive");
    let parent = destination
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| PackagingError::Filesystem(err.to_string()))?;

    let mut last_index = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        stat_source(&entry.source)?;
        last_index.insert(entry.name.as_str(), index);
    }

    let temp = tempfile::Builder::new()
        .prefix(".brainio-archive")
        .tempfile_in(parent)
        .map_err(|err| PackagingError::Filesystem(err.to_string()))?;
    let mut writer = ZipWriter::new(temp.as_file());

    for (index, entry) in entries.iter().enumerate() {
        if last_index.get(entry.name.as_str()) != Some(&index) {
            tracing::warn!(name = %entry.name, source = %entry.source.display(), "archive name reused; keeping the later entry");
            continue;
        }
        let mut source =
            fs::File::open(&entry.source).map_err(|err| source_error(&entry.source, err))?;
        let metadata = source
            .metadata()
            .map_err(|err| PackagingError::Filesystem(err.to_string()))?;
        let mut options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(metadata.len() > u32::MAX as u64);
        if let Some(stamp) = metadata.modified().ok().and_then(zip_timestamp) {
            options = options.last_modified_time(stamp);
        }
        writer
            .start_file(entry.name.as_str(), options)
            .map_err(|err| PackagingError::Archive(err.to_string()))?;
        io::copy(&mut source, &mut writer)
            .map_err(|err| PackagingError::Archive(format!("{}: {err}", entry.name)))?;
    }
    writer
        .finish()
        .map_err(|err| PackagingError::Archive(err.to_string()))?;

    if destination.exists() {
        fs::remove_file(destination).map_err(|err| PackagingError::Filesystem(err.to_string()))?;
    }
    temp.persist(destination)
        .map_err(|err| PackagingError::Filesystem(err.to_string()))?;
    Ok(())
}

// Every source must exist, including ones shadowed by a later entry of the same name.
fn stat_source(source: &Path) -> Result<(), PackagingError> {
    fs::metadata(source)
        .map(|_| ())
        .map_err(|err| source_error(source, err))
}

fn source_error(source: &Path, err: io::Error) -> PackagingError {
    match err.kind() {
        ErrorKind::NotFound => PackagingError::MissingSource(source.to_path_buf()),
        _ => PackagingError::Filesystem(format!("open {}: {err}", source.display())),
    }
}

/// Reads every entry of the archive through and returns the number of files.
pub fn verify_archive(zip_path: &Path) -> Result<usize, PackagingError> {
    let mut archive = open_archive(zip_path)?;
    let mut files = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| PackagingError::Archive(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| PackagingError::Archive(err.to_string()))?;
        files += 1;
    }
    Ok(files)
}

pub fn archive_entry_names(zip_path: &Path) -> Result<Vec<String>, PackagingError> {
    let archive = open_archive(zip_path)?;
    Ok(archive.file_names().map(str::to_string).collect())
}

fn open_archive(zip_path: &Path) -> Result<ZipArchive<fs::File>, PackagingError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| PackagingError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    ZipArchive::new(file).map_err(|err| PackagingError::Archive(err.to_string()))
}

fn zip_timestamp(modified: SystemTime) -> Option<zip::DateTime> {
    let stamp: DateTime<Utc> = modified.into();
    let year = u16::try_from(stamp.year()).ok()?;
    zip::DateTime::from_date_and_time(
        year,
        stamp.month() as u8,
        stamp.day() as u8,
        stamp.hour() as u8,
        stamp.minute() as u8,
        stamp.second() as u8,
    )
    .ok()
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn later_entry_wins_on_name_collision() {
        let temp = tempfile::tempdir().unwrap();
        let first = temp.path().join("first.png");
        let second = temp.path().join("second.png");
        fs::write(&first, b"first").unwrap();
        fs::write(&second, b"second").unwrap();
        let zip_path = temp.path().join("out").join("images.zip");

        build_archive(
            &[
                ArchiveEntry::new(&first, "same.png"),
                ArchiveEntry::new(&second, "same.png"),
            ],
            &zip_path,
        )
        .unwrap();

        let mut archive = open_archive(&zip_path).unwrap();
        assert_eq!(archive.len(), 1);
        let mut content = String::new();
        archive
            .by_name("same.png")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "second");
    }

    #[test]
    fn missing_source_leaves_no_archive() {
        let temp = tempfile::tempdir().unwrap();
        let zip_path = temp.path().join("images.zip");
        let err = build_archive(
            &[ArchiveEntry::new(temp.path().join("absent.png"), "absent.png")],
            &zip_path,
        )
        .unwrap_err();
        assert_matches!(err, PackagingError::MissingSource(_));
        assert!(!zip_path.exists());
    }
}
