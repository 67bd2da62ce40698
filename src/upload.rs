use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use serde::{Deserialize, Serialize};

use crate::error::PackagingError;

const MIB: u64 = 1024 * 1024;
const MIN_PART_SIZE: u64 = 5 * MIB;
const MAX_PARTS: u64 = 10_000;

/// Receives byte deltas while a transfer runs.
///
/// Some transfer clients finish with a zero or negative delta; implementations
/// must accept such calls without failing.
pub trait TransferProgress {
    fn advance(&self, delta: i64);
}

pub trait ObjectStore: Send + Sync {
    fn put(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        progress: &dyn TransferProgress,
    ) -> Result<(), PackagingError>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for Box<T> {
    fn put(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        progress: &dyn TransferProgress,
    ) -> Result<(), PackagingError> {
        (**self).put(local_path, bucket, key, progress)
    }
}

/// Public location of an uploaded object.
pub fn public_url(bucket: &str, key: &str) -> String {
    format!("https://{bucket}.s3.amazonaws.com/{key}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Settings {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_part_size_mib")]
    pub part_size_mib: u64,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            region: None,
            endpoint: None,
            part_size_mib: default_part_size_mib(),
        }
    }
}

fn default_part_size_mib() -> u64 {
    16
}

/// Blocking S3 uploader. The SDK's futures run on a private
/// current-thread runtime for the duration of each call.
pub struct S3ObjectStore {
    runtime: tokio::runtime::Runtime,
    client: Client,
    part_size: u64,
}

impl S3ObjectStore {
    pub fn new(settings: &S3Settings) -> Result<Self, PackagingError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| PackagingError::StorageClient(err.to_string()))?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = runtime.block_on(loader.load());
        if sdk_config.region().is_none() {
            return Err(PackagingError::StorageClient(
                "no AWS region configured (set s3.region or AWS_REGION)".to_string(),
            ));
        }

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        Ok(Self {
            runtime,
            client,
            part_size: (settings.part_size_mib * MIB).max(MIN_PART_SIZE),
        })
    }

    fn part_size_for(&self, size: u64) -> u64 {
        self.part_size.max(size.div_ceil(MAX_PARTS))
    }
}

impl ObjectStore for S3ObjectStore {
    fn put(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        progress: &dyn TransferProgress,
    ) -> Result<(), PackagingError> {
        let size = file_size(local_path)?;
        tracing::debug!(path = %local_path.display(), bucket, key, size, "uploading to S3");
        let part_size = self.part_size_for(size);
        let result = if size <= part_size {
            self.runtime
                .block_on(put_single(&self.client, local_path, bucket, key, size, progress))
        } else {
            self.runtime.block_on(put_multipart(
                &self.client,
                local_path,
                bucket,
                key,
                size,
                part_size,
                progress,
            ))
        };
        result.map_err(|message| PackagingError::Upload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        })
    }
}

async fn put_single(
    client: &Client,
    local_path: &Path,
    bucket: &str,
    key: &str,
    size: u64,
    progress: &dyn TransferProgress,
) -> Result<(), String> {
    let body = ByteStream::from_path(local_path)
        .await
        .map_err(|err| err.to_string())?;
    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body)
        .send()
        .await
        .map_err(describe)?;
    progress.advance(size as i64);
    Ok(())
}

async fn put_multipart(
    client: &Client,
    local_path: &Path,
    bucket: &str,
    key: &str,
    size: u64,
    part_size: u64,
    progress: &dyn TransferProgress,
) -> Result<(), String> {
    let created = client
        .create_multipart_upload()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(describe)?;
    let upload_id = created
        .upload_id()
        .ok_or_else(|| "S3 returned no upload id".to_string())?
        .to_string();

    let parts = match upload_parts(
        client, local_path, bucket, key, &upload_id, size, part_size, progress,
    )
    .await
    {
        Ok(parts) => parts,
        Err(message) => {
            if let Err(err) = client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                tracing::warn!(bucket, key, error = %describe(err), "failed to abort multipart upload");
            }
            return Err(message);
        }
    };

    client
        .complete_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(&upload_id)
        .multipart_upload(
            CompletedMultipartUpload::builder()
                .set_parts(Some(parts))
                .build(),
        )
        .send()
        .await
        .map_err(describe)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn upload_parts(
    client: &Client,
    local_path: &Path,
    bucket: &str,
    key: &str,
    upload_id: &str,
    size: u64,
    part_size: u64,
    progress: &dyn TransferProgress,
) -> Result<Vec<CompletedPart>, String> {
    let mut parts = Vec::new();
    let mut offset = 0u64;
    let mut part_number = 1i32;
    while offset < size {
        let length = part_size.min(size - offset);
        let body = ByteStream::read_from()
            .path(local_path)
            .offset(offset)
            .length(Length::Exact(length))
            .build()
            .await
            .map_err(|err| err.to_string())?;
        let output = client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(body)
            .send()
            .await
            .map_err(describe)?;
        parts.push(
            CompletedPart::builder()
                .set_e_tag(output.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        progress.advance(length as i64);
        offset += length;
        part_number += 1;
    }
    Ok(parts)
}

fn describe<E: std::error::Error>(err: E) -> String {
    DisplayErrorContext(err).to_string()
}

/// Object store backed by a local directory: `root/<bucket>/<key>`.
/// Used for offline runs and tests.
#[derive(Debug, Clone)]
pub struct DirectoryObjectStore {
    root: PathBuf,
}

impl DirectoryObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

impl ObjectStore for DirectoryObjectStore {
    fn put(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        progress: &dyn TransferProgress,
    ) -> Result<(), PackagingError> {
        let target = self.object_path(bucket, key);
        let upload_err = |message: String| PackagingError::Upload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };
        let mut source = fs::File::open(local_path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => PackagingError::MissingSource(local_path.to_path_buf()),
            _ => PackagingError::Filesystem(err.to_string()),
        })?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| upload_err(err.to_string()))?;
        }
        let mut sink = fs::File::create(&target).map_err(|err| upload_err(err.to_string()))?;
        let mut buffer = vec![0u8; MIB as usize];
        loop {
            let read = source
                .read(&mut buffer)
                .map_err(|err| upload_err(err.to_string()))?;
            if read == 0 {
                break;
            }
            sink.write_all(&buffer[..read])
                .map_err(|err| upload_err(err.to_string()))?;
            progress.advance(read as i64);
        }
        sink.flush().map_err(|err| upload_err(err.to_string()))?;
        Ok(())
    }
}

fn file_size(path: &Path) -> Result<u64, PackagingError> {
    fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound => PackagingError::MissingSource(path.to_path_buf()),
            _ => PackagingError::Filesystem(err.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[derive(Default)]
    struct Counter {
        transferred: Cell<u64>,
    }

    impl TransferProgress for Counter {
        fn advance(&self, delta: i64) {
            if delta > 0 {
                self.transferred.set(self.transferred.get() + delta as u64);
            }
        }
    }

    #[test]
    fn public_url_layout() {
        assert_eq!(
            public_url("brainio-contrib", "image_dicarlo_hvm.zip"),
            "https://brainio-contrib.s3.amazonaws.com/image_dicarlo_hvm.zip"
        );
    }

    #[test]
    fn directory_store_copies_object() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("payload.bin");
        fs::write(&source, vec![3u8; 2048]).unwrap();
        let store = DirectoryObjectStore::new(temp.path().join("remote"));
        let counter = Counter::default();

        store.put(&source, "brainio-temp", "payload.bin", &counter).unwrap();

        let copied = fs::read(store.object_path("brainio-temp", "payload.bin")).unwrap();
        assert_eq!(copied.len(), 2048);
        assert_eq!(counter.transferred.get(), 2048);
    }
}
