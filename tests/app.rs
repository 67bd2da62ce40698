use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use brainio_packaging::app::{App, show_stimulus_set};
use brainio_packaging::archive::archive_entry_names;
use brainio_packaging::assembly::{CoordValues, Coordinate, DataAssembly, Dimension, MultiIndex};
use brainio_packaging::domain::{AssemblyClass, AttributeType, BucketName, StimulusSetName, Value};
use brainio_packaging::error::PackagingError;
use brainio_packaging::lookup::LookupDb;
use brainio_packaging::output::JsonOutput;
use brainio_packaging::staging::Staging;
use brainio_packaging::table::ProtoStimulusSet;
use brainio_packaging::upload::{ObjectStore, TransferProgress};

#[derive(Default)]
struct RecordingStore {
    puts: Mutex<Vec<(String, String, u64)>>,
}

impl RecordingStore {
    fn puts(&self) -> Vec<(String, String, u64)> {
        self.puts.lock().unwrap().clone()
    }
}

impl ObjectStore for RecordingStore {
    fn put(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        progress: &dyn TransferProgress,
    ) -> Result<(), PackagingError> {
        let size = fs::metadata(local_path).unwrap().len();
        progress.advance(size as i64);
        progress.advance(0);
        self.puts
            .lock()
            .unwrap()
            .push((bucket.to_string(), key.to_string(), size));
        Ok(())
    }
}

struct FailingStore;

impl ObjectStore for FailingStore {
    fn put(
        &self,
        _local_path: &Path,
        bucket: &str,
        key: &str,
        _progress: &dyn TransferProgress,
    ) -> Result<(), PackagingError> {
        Err(PackagingError::Upload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: "connection reset".to_string(),
        })
    }
}

fn write_images(dir: &Path, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("image_{i:02}.png"));
            fs::write(&path, format!("\u{89}PNG fake image {i}")).unwrap();
            path
        })
        .collect()
}

fn app<S: ObjectStore>(temp: &TempDir, store: S) -> App<S> {
    let root = Utf8PathBuf::from_path_buf(temp.path().join("staging")).unwrap();
    App::new(Staging::new_with_root(root), store)
}

fn proto_with_metadata(images: &[PathBuf]) -> ProtoStimulusSet {
    let mut proto = ProtoStimulusSet::from_image_files(images).unwrap();
    let sizes = (0..images.len()).map(|i| Value::Int(i as i64)).collect();
    proto.add_column("image_index", sizes).unwrap();
    let labels = (0..images.len())
        .map(|i| Value::from(if i % 2 == 0 { "even" } else { "odd" }))
        .collect();
    proto.add_column("parity", labels).unwrap();
    proto
}

fn presentation_assembly(image_ids: &[String]) -> DataAssembly {
    DataAssembly {
        dims: vec![
            Dimension {
                name: "presentation".to_string(),
                size: image_ids.len(),
            },
            Dimension {
                name: "neuroid".to_string(),
                size: 2,
            },
        ],
        values: (0..image_ids.len() * 2).map(|v| v as f64).collect(),
        coords: vec![
            Coordinate {
                name: "image_id".to_string(),
                dims: vec!["presentation".to_string()],
                values: CoordValues::Text(image_ids.to_vec()),
            },
            Coordinate {
                name: "repetition".to_string(),
                dims: vec!["presentation".to_string()],
                values: CoordValues::Int(vec![0; image_ids.len()]),
            },
            Coordinate {
                name: "neuroid_id".to_string(),
                dims: vec!["neuroid".to_string()],
                values: CoordValues::Text(vec!["A-001".to_string(), "A-002".to_string()]),
            },
        ],
        multi_indexes: vec![MultiIndex {
            dim: "presentation".to_string(),
            levels: vec!["image_id".to_string(), "repetition".to_string()],
        }],
        attrs: BTreeMap::new(),
    }
}

#[test]
fn packages_stimulus_set_end_to_end() {
    let temp = TempDir::new().unwrap();
    let images = write_images(temp.path(), 25);
    let proto = proto_with_metadata(&images);
    let db = LookupDb::open_in_memory().unwrap();
    let app = app(&temp, RecordingStore::default());
    let name: StimulusSetName = "test.test_stimulus_set".parse().unwrap();

    let result = app
        .package_stimulus_set(&db, &proto, &name, &BucketName::default(), &JsonOutput)
        .unwrap();

    let names = archive_entry_names(Path::new(&result.archive_path)).unwrap();
    assert_eq!(names.len(), 25);
    for name in &names {
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), 44);
    }

    assert_eq!(result.images, 25);
    assert_eq!(result.image_store.unique_name, "image_test_test_stimulus_set");
    assert_eq!(result.image_store.store_type, "zip");
    assert_eq!(result.image_store.location_type, "S3");
    assert_eq!(
        result.url,
        "https://brainio-contrib.s3.amazonaws.com/image_test_test_stimulus_set.zip"
    );
    assert_eq!(result.image_store.sha1.len(), 40);
    assert_eq!(db.count_images("test.test_stimulus_set").unwrap(), 25);
    assert_eq!(db.count_rows("image_meta").unwrap(), 50);

    let puts = app.store().puts();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].0, "brainio-contrib");
    assert_eq!(puts[0].1, "image_test_test_stimulus_set.zip");
    assert_eq!(result.bytes_uploaded, puts[0].2);

    let listing = show_stimulus_set(&db, &name).unwrap();
    assert_eq!(listing.images.len(), 25);
    assert_eq!(listing.images[0].attributes.len(), 2);
    assert_eq!(listing.images[0].store_location, result.url);

    let json = serde_json::to_value(&result).unwrap();
    assert!(json["packaged_at"].is_string());
    assert_eq!(json["image_store"]["unique_name"], "image_test_test_stimulus_set");
}

#[test]
fn second_packaging_of_same_name_fails() {
    let temp = TempDir::new().unwrap();
    let images = write_images(temp.path(), 3);
    let proto = proto_with_metadata(&images);
    let db = LookupDb::open_in_memory().unwrap();
    let app = app(&temp, RecordingStore::default());
    let name: StimulusSetName = "test.repeat".parse().unwrap();
    let bucket = BucketName::default();

    app.package_stimulus_set(&db, &proto, &name, &bucket, &JsonOutput)
        .unwrap();
    let err = app
        .package_stimulus_set(&db, &proto, &name, &bucket, &JsonOutput)
        .unwrap_err();

    assert_matches!(err, PackagingError::StimulusSetExists(existing) if existing == "test.repeat");
    assert_eq!(db.count_rows("stimulus_set").unwrap(), 1);
    assert_eq!(db.count_rows("image_store").unwrap(), 1);
    assert_eq!(app.store().puts().len(), 1);
}

#[test]
fn heterogeneous_metadata_fails_before_upload() {
    let temp = TempDir::new().unwrap();
    let images = write_images(temp.path(), 2);
    let mut proto = ProtoStimulusSet::from_image_files(&images).unwrap();
    proto
        .add_column("label", vec![Value::Int(1), Value::from("cat")])
        .unwrap();
    let db = LookupDb::open_in_memory().unwrap();
    let app = app(&temp, RecordingStore::default());

    let err = app
        .package_stimulus_set(
            &db,
            &proto,
            &"test.mixed".parse().unwrap(),
            &BucketName::default(),
            &JsonOutput,
        )
        .unwrap_err();

    assert_matches!(err, PackagingError::HeterogeneousAttribute { .. });
    assert!(app.store().puts().is_empty());
    assert_eq!(db.count_rows("stimulus_set").unwrap(), 0);
}

#[test]
fn failed_upload_records_nothing() {
    let temp = TempDir::new().unwrap();
    let images = write_images(temp.path(), 2);
    let proto = ProtoStimulusSet::from_image_files(&images).unwrap();
    let db = LookupDb::open_in_memory().unwrap();
    let app = app(&temp, FailingStore);

    let err = app
        .package_stimulus_set(
            &db,
            &proto,
            &"test.offline".parse().unwrap(),
            &BucketName::default(),
            &JsonOutput,
        )
        .unwrap_err();

    assert_matches!(err, PackagingError::Upload { .. });
    assert_eq!(db.count_rows("stimulus_set").unwrap(), 0);
    assert_eq!(db.count_rows("image").unwrap(), 0);
}

#[test]
fn assembly_for_unknown_stimulus_set_uploads_nothing() {
    let temp = TempDir::new().unwrap();
    let db = LookupDb::open_in_memory().unwrap();
    let app = app(&temp, RecordingStore::default());
    let assembly = presentation_assembly(&["a".to_string()]);

    let err = app
        .package_data_assembly(
            &db,
            &assembly,
            &"test.orphan_assembly".parse().unwrap(),
            &"test.missing_set".parse().unwrap(),
            AssemblyClass::NeuronRecordingAssembly,
            &BucketName::default(),
            &JsonOutput,
        )
        .unwrap_err();

    assert_matches!(err, PackagingError::NotFound { entity: "stimulus set", .. });
    assert!(app.store().puts().is_empty());
    assert_eq!(db.count_rows("assembly").unwrap(), 0);
    assert_eq!(db.count_rows("assembly_store").unwrap(), 0);
}

#[test]
fn packages_assembly_against_stimulus_set() {
    let temp = TempDir::new().unwrap();
    let images = write_images(temp.path(), 4);
    let proto = ProtoStimulusSet::from_image_files(&images).unwrap();
    let image_ids = proto
        .entries()
        .map(|entry| entry.image_id.to_string())
        .collect::<Vec<_>>();
    let db = LookupDb::open_in_memory().unwrap();
    let app = app(&temp, RecordingStore::default());
    let set_name: StimulusSetName = "test.base_set".parse().unwrap();
    let bucket = BucketName::default();
    let packaged = app
        .package_stimulus_set(&db, &proto, &set_name, &bucket, &JsonOutput)
        .unwrap();

    let assembly = presentation_assembly(&image_ids);
    let result = app
        .package_data_assembly(
            &db,
            &assembly,
            &"test.base_assembly".parse().unwrap(),
            &set_name,
            AssemblyClass::NeuronRecordingAssembly,
            &bucket,
            &JsonOutput,
        )
        .unwrap();

    assert_eq!(result.assembly.assembly_class, "NeuronRecordingAssembly");
    assert_eq!(result.assembly.stimulus_set, packaged.stimulus_set.id);
    assert_eq!(result.assembly_store.unique_name, "assy_test_base_assembly");
    assert_eq!(result.assembly_store.store_type, "netCDF");
    assert_eq!(
        result.url,
        "https://brainio-contrib.s3.amazonaws.com/assy_test_base_assembly.nc"
    );
    assert_eq!(db.count_rows("assembly_store_map").unwrap(), 1);

    let header = fs::read(&result.netcdf_path).unwrap();
    assert_eq!(&header[..4], b"CDF\x02");

    let puts = app.store().puts();
    assert_eq!(puts.len(), 2);
    assert_eq!(puts[1].1, "assy_test_base_assembly.nc");

    let again = app
        .package_data_assembly(
            &db,
            &assembly,
            &"test.base_assembly".parse().unwrap(),
            &set_name,
            AssemblyClass::NeuronRecordingAssembly,
            &bucket,
            &JsonOutput,
        )
        .unwrap_err();
    assert_matches!(again, PackagingError::AssemblyExists(_));
    assert_eq!(app.store().puts().len(), 2);
}

#[test]
fn names_sharing_a_store_do_not_overwrite_it() {
    let temp = TempDir::new().unwrap();
    let first_dir = temp.path().join("first");
    let second_dir = temp.path().join("second");
    fs::create_dir_all(&first_dir).unwrap();
    fs::create_dir_all(&second_dir).unwrap();
    let first_images = write_images(&first_dir, 2);
    let second_images = write_images(&second_dir, 3);
    let db = LookupDb::open_in_memory().unwrap();
    let app = app(&temp, RecordingStore::default());
    let bucket = BucketName::default();

    let packaged = app
        .package_stimulus_set(
            &db,
            &ProtoStimulusSet::from_image_files(&first_images).unwrap(),
            &"test.x_y".parse().unwrap(),
            &bucket,
            &JsonOutput,
        )
        .unwrap();
    let err = app
        .package_stimulus_set(
            &db,
            &ProtoStimulusSet::from_image_files(&second_images).unwrap(),
            &"test.x.y".parse().unwrap(),
            &bucket,
            &JsonOutput,
        )
        .unwrap_err();

    assert_matches!(err, PackagingError::StoreExists(store) if store == "image_test_x_y");
    assert_eq!(app.store().puts().len(), 1);
    assert_eq!(db.count_rows("stimulus_set").unwrap(), 1);
    let store = db.find_image_store("image_test_x_y").unwrap().unwrap();
    assert_eq!(store.sha1, packaged.image_store.sha1);
}

#[test]
fn assembly_names_sharing_a_store_do_not_overwrite_it() {
    let temp = TempDir::new().unwrap();
    let images = write_images(temp.path(), 2);
    let proto = ProtoStimulusSet::from_image_files(&images).unwrap();
    let image_ids = proto
        .entries()
        .map(|entry| entry.image_id.to_string())
        .collect::<Vec<_>>();
    let db = LookupDb::open_in_memory().unwrap();
    let app = app(&temp, RecordingStore::default());
    let set_name: StimulusSetName = "test.shared_set".parse().unwrap();
    let bucket = BucketName::default();
    app.package_stimulus_set(&db, &proto, &set_name, &bucket, &JsonOutput)
        .unwrap();
    let assembly = presentation_assembly(&image_ids);

    app.package_data_assembly(
        &db,
        &assembly,
        &"test.a_b".parse().unwrap(),
        &set_name,
        AssemblyClass::NeuronRecordingAssembly,
        &bucket,
        &JsonOutput,
    )
    .unwrap();
    let err = app
        .package_data_assembly(
            &db,
            &assembly,
            &"test.a.b".parse().unwrap(),
            &set_name,
            AssemblyClass::NeuronRecordingAssembly,
            &bucket,
            &JsonOutput,
        )
        .unwrap_err();

    assert_matches!(err, PackagingError::StoreExists(store) if store == "assy_test_a_b");
    assert_eq!(app.store().puts().len(), 2);
    assert_eq!(db.count_rows("assembly").unwrap(), 1);
}

#[test]
fn attribute_type_conflict_fails_before_upload() {
    let temp = TempDir::new().unwrap();
    let images = write_images(temp.path(), 2);
    let db = LookupDb::open_in_memory().unwrap();
    let app = app(&temp, RecordingStore::default());
    let bucket = BucketName::default();

    let mut ints = ProtoStimulusSet::from_image_files(&images).unwrap();
    ints.add_column("size", vec![Value::Int(1), Value::Int(2)])
        .unwrap();
    app.package_stimulus_set(&db, &ints, &"test.one".parse().unwrap(), &bucket, &JsonOutput)
        .unwrap();

    let mut floats = ProtoStimulusSet::from_image_files(&images).unwrap();
    floats
        .add_column("size", vec![Value::Float(1.5), Value::Float(2.5)])
        .unwrap();
    let err = app
        .package_stimulus_set(&db, &floats, &"test.two".parse().unwrap(), &bucket, &JsonOutput)
        .unwrap_err();

    assert_matches!(
        err,
        PackagingError::Conflict { entity: "attribute", field: "type", key, .. } if key == "size"
    );
    assert_eq!(app.store().puts().len(), 1);
    assert_eq!(db.count_rows("stimulus_set").unwrap(), 1);
    assert_eq!(db.count_rows("image_store").unwrap(), 1);
}

#[test]
fn int_column_with_missing_cells_is_stored_as_floats() {
    let temp = TempDir::new().unwrap();
    let images = write_images(temp.path(), 3);
    let mut proto = ProtoStimulusSet::from_image_files(&images).unwrap();
    proto
        .add_column("variation", vec![Value::Int(1), Value::Missing, Value::Int(3)])
        .unwrap();
    let db = LookupDb::open_in_memory().unwrap();
    let app = app(&temp, RecordingStore::default());
    let name: StimulusSetName = "test.sparse".parse().unwrap();

    app.package_stimulus_set(&db, &proto, &name, &BucketName::default(), &JsonOutput)
        .unwrap();

    let mut stored = show_stimulus_set(&db, &name)
        .unwrap()
        .images
        .into_iter()
        .map(|image| image.attributes["variation"].clone())
        .collect::<Vec<_>>();
    stored.sort();
    assert_eq!(stored, vec!["1.0", "3.0", "nan"]);
    assert_matches!(
        db.attribute("variation", AttributeType::Float),
        Ok(resolved) if !resolved.created
    );
}
