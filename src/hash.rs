use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::error::PackagingError;

const BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-1 of a file's bytes, read through a fixed buffer.
pub fn sha1_file(path: &Path) -> Result<String, PackagingError> {
    let mut file = File::open(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => PackagingError::MissingSource(path.to_path_buf()),
        _ => PackagingError::Filesystem(format!("open {}: {err}", path.display())),
    })?;
    sha1_reader(&mut file)
        .map_err(|err| PackagingError::Filesystem(format!("read {}: {err}", path.display())))
}

pub fn sha1_reader<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
