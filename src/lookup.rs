use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::domain::AttributeType;
use crate::error::PackagingError;
use crate::table::{AttributeSpec, ProtoStimulusSet};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stimulus_set (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS image (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS attribute (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    type TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS image_meta (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id INTEGER NOT NULL REFERENCES image(id),
    attribute_id INTEGER NOT NULL REFERENCES attribute(id),
    value TEXT NOT NULL,
    UNIQUE (image_id, attribute_id)
);
CREATE TABLE IF NOT EXISTS image_store (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    location_type TEXT NOT NULL,
    store_type TEXT NOT NULL,
    location TEXT NOT NULL,
    unique_name TEXT NOT NULL UNIQUE,
    sha1 TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS stimulus_set_image_map (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stimulus_set_id INTEGER NOT NULL REFERENCES stimulus_set(id),
    image_id INTEGER NOT NULL REFERENCES image(id),
    UNIQUE (stimulus_set_id, image_id)
);
CREATE TABLE IF NOT EXISTS image_store_map (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_store_id INTEGER NOT NULL REFERENCES image_store(id),
    image_id INTEGER NOT NULL REFERENCES image(id),
    path TEXT NOT NULL,
    UNIQUE (image_store_id, image_id)
);
CREATE TABLE IF NOT EXISTS assembly (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    assembly_class TEXT NOT NULL,
    stimulus_set_id INTEGER NOT NULL REFERENCES stimulus_set(id)
);
CREATE TABLE IF NOT EXISTS assembly_store (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    assembly_type TEXT NOT NULL,
    location_type TEXT NOT NULL,
    location TEXT NOT NULL,
    unique_name TEXT NOT NULL UNIQUE,
    sha1 TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS assembly_store_map (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    assembly_model_id INTEGER NOT NULL REFERENCES assembly(id),
    assembly_store_model_id INTEGER NOT NULL REFERENCES assembly_store(id),
    role TEXT NOT NULL,
    UNIQUE (assembly_model_id, assembly_store_model_id)
);
";

/// Outcome of a get-or-create call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved<T> {
    pub record: T,
    pub created: bool,
}

impl<T> Resolved<T> {
    fn existing(record: T) -> Self {
        Self {
            record,
            created: false,
        }
    }

    fn created(record: T) -> Self {
        Self {
            record,
            created: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StimulusSetRecord {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    pub id: i64,
    pub image_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeRecord {
    pub id: i64,
    pub name: String,
    pub attr_type: AttributeType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageMetaRecord {
    pub id: i64,
    pub image: i64,
    pub attribute: i64,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreRecord {
    pub id: i64,
    pub location_type: String,
    pub store_type: String,
    pub location: String,
    pub unique_name: String,
    pub sha1: String,
}

pub type ImageStoreRecord = StoreRecord;
pub type AssemblyStoreRecord = StoreRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssemblyRecord {
    pub id: i64,
    pub name: String,
    pub assembly_class: String,
    pub stimulus_set: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkRecord {
    pub id: i64,
    pub left: i64,
    pub right: i64,
    pub tag: Option<String>,
}

/// Fields of a store row to get-or-create, keyed by `unique_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStore {
    pub location_type: String,
    pub store_type: String,
    pub location: String,
    pub unique_name: String,
    pub sha1: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageListing {
    pub image_id: String,
    pub path_within_store: String,
    pub store_location: String,
    pub attributes: BTreeMap<String, String>,
}

fn ensure_same(
    entity: &'static str,
    key: &str,
    field: &'static str,
    existing: &str,
    requested: &str,
) -> Result<(), PackagingError> {
    if existing == requested {
        return Ok(());
    }
    Err(PackagingError::Conflict {
        entity,
        key: key.to_string(),
        field,
        existing: existing.to_string(),
        requested: requested.to_string(),
    })
}

fn store_from_row(row: &Row<'_>) -> rusqlite::Result<StoreRecord> {
    Ok(StoreRecord {
        id: row.get(0)?,
        location_type: row.get(1)?,
        store_type: row.get(2)?,
        location: row.get(3)?,
        unique_name: row.get(4)?,
        sha1: row.get(5)?,
    })
}

/// Handle on the BrainIO lookup database.
///
/// Every get-or-create looks the row up by its natural key. A row whose
/// fields all match is returned with `created = false`; a row that differs in
/// any field yields `PackagingError::Conflict` rather than being silently
/// reused.
pub struct LookupDb {
    conn: Connection,
}

impl LookupDb {
    pub fn open(path: &Path) -> Result<Self, PackagingError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| PackagingError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, PackagingError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PackagingError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Runs `work` inside one transaction: committed on `Ok`, rolled back on
    /// `Err`.
    pub fn atomically<T>(
        &self,
        work: impl FnOnce(&Self) -> Result<T, PackagingError>,
    ) -> Result<T, PackagingError> {
        let tx = self.conn.unchecked_transaction()?;
        let value = work(self)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn stimulus_set(&self, name: &str) -> Result<Resolved<StimulusSetRecord>, PackagingError> {
        if let Some(existing) = self.lookup_stimulus_set(name)? {
            return Ok(Resolved::existing(existing));
        }
        self.conn
            .execute("INSERT INTO stimulus_set (name) VALUES (?1)", params![name])?;
        Ok(Resolved::created(StimulusSetRecord {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
        }))
    }

    pub fn find_stimulus_set(&self, name: &str) -> Result<StimulusSetRecord, PackagingError> {
        self.lookup_stimulus_set(name)?
            .ok_or_else(|| PackagingError::NotFound {
                entity: "stimulus set",
                key: name.to_string(),
            })
    }

    fn lookup_stimulus_set(&self, name: &str) -> Result<Option<StimulusSetRecord>, PackagingError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name FROM stimulus_set WHERE name = ?1",
                params![name],
                |row| {
                    Ok(StimulusSetRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn image(&self, image_id: &str) -> Result<Resolved<ImageRecord>, PackagingError> {
        let existing = self
            .conn
            .query_row(
                "SELECT id FROM image WHERE image_id = ?1",
                params![image_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        let record = |id| ImageRecord {
            id,
            image_id: image_id.to_string(),
        };
        if let Some(id) = existing {
            return Ok(Resolved::existing(record(id)));
        }
        self.conn
            .execute("INSERT INTO image (image_id) VALUES (?1)", params![image_id])?;
        Ok(Resolved::created(record(self.conn.last_insert_rowid())))
    }

    pub fn attribute(
        &self,
        name: &str,
        attr_type: AttributeType,
    ) -> Result<Resolved<AttributeRecord>, PackagingError> {
        let existing = self
            .conn
            .query_row(
                "SELECT id, type FROM attribute WHERE name = ?1",
                params![name],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        if let Some((id, stored)) = existing {
            let stored_type: AttributeType = stored.parse()?;
            if stored_type != attr_type {
                return Err(PackagingError::Conflict {
                    entity: "attribute",
                    key: name.to_string(),
                    field: "type",
                    existing: stored,
                    requested: attr_type.to_string(),
                });
            }
            return Ok(Resolved::existing(AttributeRecord {
                id,
                name: name.to_string(),
                attr_type,
            }));
        }
        self.conn.execute(
            "INSERT INTO attribute (name, type) VALUES (?1, ?2)",
            params![name, attr_type.as_str()],
        )?;
        Ok(Resolved::created(AttributeRecord {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
            attr_type,
        }))
    }

    /// Read-only check that every spec agrees with an already recorded
    /// attribute of the same name.
    pub fn check_attributes(&self, specs: &[AttributeSpec]) -> Result<(), PackagingError> {
        let mut stmt = self.conn.prepare("SELECT type FROM attribute WHERE name = ?1")?;
        for spec in specs {
            let stored = stmt
                .query_row(params![spec.name], |row| row.get::<_, String>(0))
                .optional()?;
            let Some(stored) = stored else {
                continue;
            };
            if stored.parse::<AttributeType>()? != spec.declared_type {
                return Err(PackagingError::Conflict {
                    entity: "attribute",
                    key: spec.name.clone(),
                    field: "type",
                    existing: stored,
                    requested: spec.declared_type.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn image_meta(
        &self,
        image: &ImageRecord,
        attribute: &AttributeRecord,
        value: &str,
    ) -> Result<Resolved<ImageMetaRecord>, PackagingError> {
        let existing = self
            .conn
            .query_row(
                "SELECT id, value FROM image_meta WHERE image_id = ?1 AND attribute_id = ?2",
                params![image.id, attribute.id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        if let Some((id, stored)) = existing {
            ensure_same(
                "image metadata",
                &format!("{}/{}", image.image_id, attribute.name),
                "value",
                &stored,
                value,
            )?;
            return Ok(Resolved::existing(ImageMetaRecord {
                id,
                image: image.id,
                attribute: attribute.id,
                value: stored,
            }));
        }
        self.conn.execute(
            "INSERT INTO image_meta (image_id, attribute_id, value) VALUES (?1, ?2, ?3)",
            params![image.id, attribute.id, value],
        )?;
        Ok(Resolved::created(ImageMetaRecord {
            id: self.conn.last_insert_rowid(),
            image: image.id,
            attribute: attribute.id,
            value: value.to_string(),
        }))
    }

    pub fn image_store(&self, store: &NewStore) -> Result<Resolved<ImageStoreRecord>, PackagingError> {
        self.store_row("image_store", "store_type", "image store", store)
    }

    pub fn assembly_store(
        &self,
        store: &NewStore,
    ) -> Result<Resolved<AssemblyStoreRecord>, PackagingError> {
        self.store_row("assembly_store", "assembly_type", "assembly store", store)
    }

    pub fn find_image_store(
        &self,
        unique_name: &str,
    ) -> Result<Option<ImageStoreRecord>, PackagingError> {
        self.lookup_store("image_store", "store_type", unique_name)
    }

    pub fn find_assembly_store(
        &self,
        unique_name: &str,
    ) -> Result<Option<AssemblyStoreRecord>, PackagingError> {
        self.lookup_store("assembly_store", "assembly_type", unique_name)
    }

    fn lookup_store(
        &self,
        table: &str,
        type_column: &str,
        unique_name: &str,
    ) -> Result<Option<StoreRecord>, PackagingError> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT id, location_type, {type_column}, location, unique_name, sha1 \
                     FROM {table} WHERE unique_name = ?1"
                ),
                params![unique_name],
                store_from_row,
            )
            .optional()?)
    }

    fn store_row(
        &self,
        table: &str,
        type_column: &str,
        entity: &'static str,
        store: &NewStore,
    ) -> Result<Resolved<StoreRecord>, PackagingError> {
        if let Some(existing) = self.lookup_store(table, type_column, &store.unique_name)? {
            let key = store.unique_name.as_str();
            ensure_same(entity, key, "location_type", &existing.location_type, &store.location_type)?;
            ensure_same(entity, key, "store_type", &existing.store_type, &store.store_type)?;
            ensure_same(entity, key, "location", &existing.location, &store.location)?;
            ensure_same(entity, key, "sha1", &existing.sha1, &store.sha1)?;
            return Ok(Resolved::existing(existing));
        }
        self.conn.execute(
            &format!(
                "INSERT INTO {table} (location_type, {type_column}, location, unique_name, sha1) \
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![
                store.location_type,
                store.store_type,
                store.location,
                store.unique_name,
                store.sha1
            ],
        )?;
        Ok(Resolved::created(StoreRecord {
            id: self.conn.last_insert_rowid(),
            location_type: store.location_type.clone(),
            store_type: store.store_type.clone(),
            location: store.location.clone(),
            unique_name: store.unique_name.clone(),
            sha1: store.sha1.clone(),
        }))
    }

    pub fn assembly(
        &self,
        name: &str,
        assembly_class: &str,
        stimulus_set: &StimulusSetRecord,
    ) -> Result<Resolved<AssemblyRecord>, PackagingError> {
        if let Some(existing) = self.lookup_assembly(name)? {
            ensure_same("assembly", name, "assembly_class", &existing.assembly_class, assembly_class)?;
            ensure_same(
                "assembly",
                name,
                "stimulus_set",
                &existing.stimulus_set.to_string(),
                &stimulus_set.id.to_string(),
            )?;
            return Ok(Resolved::existing(existing));
        }
        self.conn.execute(
            "INSERT INTO assembly (name, assembly_class, stimulus_set_id) VALUES (?1, ?2, ?3)",
            params![name, assembly_class, stimulus_set.id],
        )?;
        Ok(Resolved::created(AssemblyRecord {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
            assembly_class: assembly_class.to_string(),
            stimulus_set: stimulus_set.id,
        }))
    }

    pub fn find_assembly(&self, name: &str) -> Result<AssemblyRecord, PackagingError> {
        self.lookup_assembly(name)?
            .ok_or_else(|| PackagingError::NotFound {
                entity: "assembly",
                key: name.to_string(),
            })
    }

    fn lookup_assembly(&self, name: &str) -> Result<Option<AssemblyRecord>, PackagingError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, assembly_class, stimulus_set_id FROM assembly WHERE name = ?1",
                params![name],
                |row| {
                    Ok(AssemblyRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        assembly_class: row.get(2)?,
                        stimulus_set: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn link_stimulus_set_image(
        &self,
        stimulus_set: &StimulusSetRecord,
        image: &ImageRecord,
    ) -> Result<Resolved<LinkRecord>, PackagingError> {
        self.link(
            "stimulus_set_image_map",
            ("stimulus_set_id", stimulus_set.id),
            ("image_id", image.id),
            None,
        )
    }

    pub fn link_image_store(
        &self,
        image: &ImageRecord,
        store: &ImageStoreRecord,
        path: &str,
    ) -> Result<Resolved<LinkRecord>, PackagingError> {
        self.link(
            "image_store_map",
            ("image_store_id", store.id),
            ("image_id", image.id),
            Some(("path", path)),
        )
    }

    pub fn link_assembly_store(
        &self,
        assembly: &AssemblyRecord,
        store: &AssemblyStoreRecord,
        role: &str,
    ) -> Result<Resolved<LinkRecord>, PackagingError> {
        self.link(
            "assembly_store_map",
            ("assembly_model_id", assembly.id),
            ("assembly_store_model_id", store.id),
            Some(("role", role)),
        )
    }

    fn link(
        &self,
        table: &'static str,
        left: (&str, i64),
        right: (&str, i64),
        tag: Option<(&'static str, &str)>,
    ) -> Result<Resolved<LinkRecord>, PackagingError> {
        let tag_column = tag.map(|(column, _)| column).unwrap_or("NULL");
        let existing = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, {tag_column} FROM {table} WHERE {} = ?1 AND {} = ?2",
                    left.0, right.0
                ),
                params![left.1, right.1],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        if let Some((id, stored)) = existing {
            if let (Some((column, requested)), Some(stored)) = (tag, stored.as_deref()) {
                ensure_same(table, &format!("{}/{}", left.1, right.1), column, stored, requested)?;
            }
            return Ok(Resolved::existing(LinkRecord {
                id,
                left: left.1,
                right: right.1,
                tag: stored,
            }));
        }
        match tag {
            Some((column, value)) => self.conn.execute(
                &format!(
                    "INSERT INTO {table} ({}, {}, {column}) VALUES (?1, ?2, ?3)",
                    left.0, right.0
                ),
                params![left.1, right.1, value],
            )?,
            None => self.conn.execute(
                &format!("INSERT INTO {table} ({}, {}) VALUES (?1, ?2)", left.0, right.0),
                params![left.1, right.1],
            )?,
        };
        Ok(Resolved::created(LinkRecord {
            id: self.conn.last_insert_rowid(),
            left: left.1,
            right: right.1,
            tag: tag.map(|(_, value)| value.to_string()),
        }))
    }

    /// Records every row of `proto`: the image, its membership in
    /// `stimulus_set`, its path inside `store`, and one EAV row per
    /// dataset-specific attribute. Returns the number of images processed.
    pub fn add_image_metadata(
        &self,
        proto: &ProtoStimulusSet,
        stimulus_set: &StimulusSetRecord,
        store: &ImageStoreRecord,
    ) -> Result<usize, PackagingError> {
        let specs = proto.derive_attribute_set()?;
        let attributes = specs
            .iter()
            .map(|AttributeSpec { name, declared_type }| {
                self.attribute(name, *declared_type).map(|resolved| resolved.record)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut count = 0;
        for entry in proto.entries() {
            let image = self.image(entry.image_id)?.record;
            self.link_stimulus_set_image(stimulus_set, &image)?;
            self.link_image_store(&image, store, entry.path_within_store)?;
            for attribute in &attributes {
                let value = entry
                    .value(&attribute.name)
                    .map(|value| value.stored_as(attribute.attr_type))
                    .unwrap_or_else(|| "nan".to_string());
                self.image_meta(&image, attribute, &value)?;
            }
            count += 1;
        }
        tracing::debug!(stimulus_set = %stimulus_set.name, images = count, attributes = attributes.len(), "image metadata recorded");
        Ok(count)
    }

    pub fn count_images(&self, stimulus_set: &str) -> Result<usize, PackagingError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM image \
             JOIN stimulus_set_image_map m ON m.image_id = image.id \
             JOIN stimulus_set s ON s.id = m.stimulus_set_id \
             WHERE s.name = ?1",
            params![stimulus_set],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn count_rows(&self, table: &str) -> Result<usize, PackagingError> {
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Images of a stimulus set with their store path and attributes, ordered
    /// by image identifier.
    pub fn stimulus_set_images(&self, name: &str) -> Result<Vec<ImageListing>, PackagingError> {
        let stimulus_set = self.find_stimulus_set(name)?;
        // prefer the store packaged under this stimulus set's own name
        let own_store = format!("image_{}", stimulus_set.name.replace('.', "_"));
        let mut stmt = self.conn.prepare(
            "SELECT image.id, image.image_id, \
             (SELECT ism.path FROM image_store_map ism \
              JOIN image_store st ON st.id = ism.image_store_id \
              WHERE ism.image_id = image.id \
              ORDER BY st.unique_name = ?2 DESC, ism.id LIMIT 1), \
             (SELECT st.location FROM image_store_map ism \
              JOIN image_store st ON st.id = ism.image_store_id \
              WHERE ism.image_id = image.id \
              ORDER BY st.unique_name = ?2 DESC, ism.id LIMIT 1) \
             FROM image \
             JOIN stimulus_set_image_map m ON m.image_id = image.id \
             WHERE m.stimulus_set_id = ?1 \
             ORDER BY image.image_id",
        )?;
        let rows = stmt
            .query_map(params![stimulus_set.id, own_store], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut meta = self.conn.prepare(
            "SELECT attribute.name, image_meta.value FROM image_meta \
             JOIN attribute ON attribute.id = image_meta.attribute_id \
             WHERE image_meta.image_id = ?1",
        )?;
        let mut listings = Vec::with_capacity(rows.len());
        for (id, image_id, path, location) in rows {
            let attributes = meta
                .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<BTreeMap<String, String>, _>>()?;
            listings.push(ImageListing {
                image_id,
                path_within_store: path.unwrap_or_default(),
                store_location: location.unwrap_or_default(),
                attributes,
            });
        }
        Ok(listings)
    }
}
