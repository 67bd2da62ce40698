use std::cell::Cell;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::archive::{build_archive, verify_archive};
use crate::assembly::DataAssembly;
use crate::domain::{AssemblyClass, AssemblyName, BucketName, StimulusSetName};
use crate::error::PackagingError;
use crate::hash::sha1_file;
use crate::lookup::{
    AssemblyRecord, AssemblyStoreRecord, ImageListing, ImageStoreRecord, LookupDb, NewStore,
    StimulusSetRecord,
};
use crate::netcdf::write_assembly;
use crate::staging::Staging;
use crate::table::ProtoStimulusSet;
use crate::upload::{ObjectStore, TransferProgress, public_url};

pub const LOCATION_TYPE_S3: &str = "S3";
pub const STORE_TYPE_ZIP: &str = "zip";
pub const ASSEMBLY_TYPE_NETCDF: &str = "netCDF";

#[derive(Debug, Clone, Serialize)]
pub struct StimulusSetPackage {
    pub stimulus_set: StimulusSetRecord,
    pub image_store: ImageStoreRecord,
    pub images: usize,
    pub archive_path: String,
    pub url: String,
    pub bytes_uploaded: u64,
    pub packaged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssemblyPackage {
    pub assembly: AssemblyRecord,
    pub assembly_store: AssemblyStoreRecord,
    pub stimulus_set: StimulusSetRecord,
    pub netcdf_path: String,
    pub url: String,
    pub bytes_uploaded: u64,
    pub packaged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShowResult {
    pub stimulus_set: String,
    pub images: Vec<ImageListing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HashResult {
    pub path: String,
    pub sha1: String,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Forwards upload byte deltas to a `ProgressSink` as `phase=Upload` events.
struct UploadProgress<'a> {
    sink: &'a dyn ProgressSink,
    key: &'a str,
    total: u64,
    sent: Cell<u64>,
    start: Instant,
}

impl<'a> UploadProgress<'a> {
    fn new(sink: &'a dyn ProgressSink, key: &'a str, total: u64) -> Self {
        Self {
            sink,
            key,
            total,
            sent: Cell::new(0),
            start: Instant::now(),
        }
    }

    fn sent(&self) -> u64 {
        self.sent.get()
    }
}

impl TransferProgress for UploadProgress<'_> {
    fn advance(&self, delta: i64) {
        if delta <= 0 {
            return;
        }
        let sent = self.sent.get() + delta as u64;
        self.sent.set(sent);
        self.sink.event(ProgressEvent {
            message: format!("phase=Upload; key={}; bytes={sent}/{}", self.key, self.total),
            elapsed: Some(self.start.elapsed()),
        });
    }
}

pub struct App<S: ObjectStore> {
    staging: Staging,
    store: S,
}

impl<S: ObjectStore> App<S> {
    pub fn new(staging: Staging, store: S) -> Self {
        Self { staging, store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Archives the images of `proto`, uploads the archive and records the
    /// stimulus set with its per-image metadata in `db`.
    pub fn package_stimulus_set(
        &self,
        db: &LookupDb,
        proto: &ProtoStimulusSet,
        name: &StimulusSetName,
        bucket: &BucketName,
        sink: &dyn ProgressSink,
    ) -> Result<StimulusSetPackage, PackagingError> {
        match db.find_stimulus_set(name.as_str()) {
            Ok(_) => return Err(PackagingError::StimulusSetExists(name.to_string())),
            Err(PackagingError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
        if proto.is_empty() {
            return Err(PackagingError::InvalidTable(format!(
                "stimulus set {name} has no images"
            )));
        }

        let store_name = name.store_name();
        let zip_name = name.zip_file_name();
        let attributes = proto.derive_attribute_set()?;
        if db.find_image_store(&store_name)?.is_some() {
            return Err(PackagingError::StoreExists(store_name));
        }
        db.check_attributes(&attributes)?;
        tracing::info!(stimulus_set = %name, images = proto.len(), attributes = attributes.len(), "packaging stimulus set");

        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Archive; store={store_name}; images={}", proto.len()),
            elapsed: None,
        });
        self.staging.ensure_root()?;
        let zip_path = self.staging.zip_path(name);
        build_archive(&proto.archive_entries(), zip_path.as_std_path())?;
        let entries = verify_archive(zip_path.as_std_path())?;
        sink.event(ProgressEvent {
            message: format!("phase=Archive; entries={entries}; path={zip_path}"),
            elapsed: Some(start.elapsed()),
        });

        let sha1 = sha1_file(zip_path.as_std_path())?;
        let (url, bytes_uploaded) = self.upload(&zip_path, bucket, &zip_name, sink)?;

        sink.event(ProgressEvent {
            message: format!("phase=Record; stimulus_set={name}"),
            elapsed: None,
        });
        let (stimulus_set, image_store, images) = db.atomically(|db| {
            let stimulus_set = db.stimulus_set(name.as_str())?.record;
            let image_store = db
                .image_store(&NewStore {
                    location_type: LOCATION_TYPE_S3.to_string(),
                    store_type: STORE_TYPE_ZIP.to_string(),
                    location: url.clone(),
                    unique_name: store_name.clone(),
                    sha1: sha1.clone(),
                })?
                .record;
            let images = db.add_image_metadata(proto, &stimulus_set, &image_store)?;
            Ok((stimulus_set, image_store, images))
        })?;
        tracing::info!(stimulus_set = %name, images, sha1 = %image_store.sha1, "stimulus set packaged");

        Ok(StimulusSetPackage {
            stimulus_set,
            image_store,
            images,
            archive_path: zip_path.to_string(),
            url,
            bytes_uploaded,
            packaged_at: Utc::now(),
        })
    }

    /// Serializes `assembly` to NetCDF, uploads it and records it against an
    /// already packaged stimulus set.
    #[allow(clippy::too_many_arguments)]
    pub fn package_data_assembly(
        &self,
        db: &LookupDb,
        assembly: &DataAssembly,
        name: &AssemblyName,
        stimulus_set_name: &StimulusSetName,
        assembly_class: AssemblyClass,
        bucket: &BucketName,
        sink: &dyn ProgressSink,
    ) -> Result<AssemblyPackage, PackagingError> {
        match db.find_assembly(name.as_str()) {
            Ok(_) => return Err(PackagingError::AssemblyExists(name.to_string())),
            Err(PackagingError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
        let stimulus_set = db.find_stimulus_set(stimulus_set_name.as_str())?;

        let store_name = name.store_name();
        let nc_name = name.netcdf_file_name();
        if db.find_assembly_store(&store_name)?.is_some() {
            return Err(PackagingError::StoreExists(store_name));
        }
        tracing::info!(assembly = %name, stimulus_set = %stimulus_set.name, class = %assembly_class, "packaging assembly");

        let mut flattened = assembly.clone();
        if flattened.has_multi_index() {
            flattened.reset_index();
        }
        flattened.validate()?;

        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Serialize; store={store_name}; shape={:?}", flattened.shape()),
            elapsed: None,
        });
        self.staging.ensure_root()?;
        let nc_path = self.staging.netcdf_path(name);
        write_assembly(&flattened, nc_path.as_std_path())?;
        sink.event(ProgressEvent {
            message: format!("phase=Serialize; path={nc_path}"),
            elapsed: Some(start.elapsed()),
        });

        let sha1 = sha1_file(nc_path.as_std_path())?;
        let (url, bytes_uploaded) = self.upload(&nc_path, bucket, &nc_name, sink)?;

        sink.event(ProgressEvent {
            message: format!("phase=Record; assembly={name}"),
            elapsed: None,
        });
        let (assembly, assembly_store) = db.atomically(|db| {
            let record = db
                .assembly(name.as_str(), assembly_class.as_str(), &stimulus_set)?
                .record;
            let assembly_store = db
                .assembly_store(&NewStore {
                    location_type: LOCATION_TYPE_S3.to_string(),
                    store_type: ASSEMBLY_TYPE_NETCDF.to_string(),
                    location: url.clone(),
                    unique_name: store_name.clone(),
                    sha1: sha1.clone(),
                })?
                .record;
            db.link_assembly_store(&record, &assembly_store, name.as_str())?;
            Ok((record, assembly_store))
        })?;
        tracing::info!(assembly = %name, sha1 = %assembly_store.sha1, "assembly packaged");

        Ok(AssemblyPackage {
            assembly,
            assembly_store,
            stimulus_set,
            netcdf_path: nc_path.to_string(),
            url,
            bytes_uploaded,
            packaged_at: Utc::now(),
        })
    }

    fn upload(
        &self,
        path: &Utf8Path,
        bucket: &BucketName,
        key: &str,
        sink: &dyn ProgressSink,
    ) -> Result<(String, u64), PackagingError> {
        let total = std::fs::metadata(path.as_std_path())
            .map_err(|err| PackagingError::Filesystem(err.to_string()))?
            .len();
        sink.event(ProgressEvent {
            message: format!("phase=Upload; bucket={bucket}; key={key}; size={total}"),
            elapsed: None,
        });
        let progress = UploadProgress::new(sink, key, total);
        self.store
            .put(path.as_std_path(), bucket.as_str(), key, &progress)?;
        tracing::debug!(bucket = %bucket, key, bytes = progress.sent(), "upload finished");
        Ok((public_url(bucket.as_str(), key), progress.sent()))
    }
}

pub fn show_stimulus_set(
    db: &LookupDb,
    name: &StimulusSetName,
) -> Result<ShowResult, PackagingError> {
    Ok(ShowResult {
        stimulus_set: name.to_string(),
        images: db.stimulus_set_images(name.as_str())?,
    })
}

pub fn hash_file(path: &str) -> Result<HashResult, PackagingError> {
    Ok(HashResult {
        path: path.to_string(),
        sha1: sha1_file(std::path::Path::new(path))?,
    })
}
