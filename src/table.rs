use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::archive::ArchiveEntry;
use crate::domain::{AttributeType, Value};
use crate::error::PackagingError;
use crate::hash::sha1_file;

pub const LOCAL_PATH_COLUMN: &str = "image_current_local_file_path";
pub const IMAGE_ID_COLUMN: &str = "image_id";
pub const STORE_PATH_COLUMN: &str = "image_path_within_store";

pub const RESERVED_COLUMNS: [&str; 3] = [LOCAL_PATH_COLUMN, IMAGE_ID_COLUMN, STORE_PATH_COLUMN];

/// A dataset-specific column persisted through the EAV table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeSpec {
    pub name: String,
    pub declared_type: AttributeType,
}

/// One image row seen through the reserved columns.
#[derive(Debug, Clone, Copy)]
pub struct ImageEntry<'a> {
    pub index: usize,
    pub local_path: &'a str,
    pub image_id: &'a str,
    pub path_within_store: &'a str,
    row: &'a [Value],
    columns: &'a [String],
}

impl<'a> ImageEntry<'a> {
    pub fn value(&self, column: &str) -> Option<&'a Value> {
        self.columns
            .iter()
            .position(|name| name == column)
            .map(|pos| &self.row[pos])
    }
}

/// Table of images to package: one row per image, the three reserved columns
/// plus any number of dataset-specific metadata columns.
#[derive(Debug, Clone)]
pub struct ProtoStimulusSet {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    declared: BTreeMap<String, AttributeType>,
    reserved: [usize; 3],
}

impl ProtoStimulusSet {
    pub fn new(columns: Vec<String>) -> Result<Self, PackagingError> {
        let mut seen = HashSet::new();
        if let Some(duplicate) = columns.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(PackagingError::InvalidTable(format!(
                "duplicate column {duplicate}"
            )));
        }
        let position = |name: &str| {
            columns
                .iter()
                .position(|column| column == name)
                .ok_or_else(|| PackagingError::MissingColumn(name.to_string()))
        };
        let reserved = [
            position(LOCAL_PATH_COLUMN)?,
            position(IMAGE_ID_COLUMN)?,
            position(STORE_PATH_COLUMN)?,
        ];
        Ok(Self {
            columns,
            rows: Vec::new(),
            declared: BTreeMap::new(),
            reserved,
        })
    }

    /// Loads a table from CSV. Metadata cells are typed by inference; the
    /// reserved columns are kept verbatim. Relative file paths resolve
    /// against the CSV's directory.
    pub fn from_csv(path: &Path) -> Result<Self, PackagingError> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|err| PackagingError::Csv(format!("{}: {err}", path.display())))?;
        let headers = reader
            .headers()
            .map_err(|err| PackagingError::Csv(err.to_string()))?
            .iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let mut table = Self::new(headers)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        for record in reader.records() {
            let record = record.map_err(|err| PackagingError::Csv(err.to_string()))?;
            let values = record
                .iter()
                .enumerate()
                .map(|(pos, cell)| {
                    if pos == table.reserved[0] {
                        Value::Text(resolve_path(base_dir, cell))
                    } else if table.reserved.contains(&pos) {
                        Value::Text(cell.to_string())
                    } else {
                        Value::infer(cell)
                    }
                })
                .collect::<Vec<_>>();
            table.push_row(values)?;
        }
        Ok(table)
    }

    /// Builds a table from image files, identifying each image by the SHA-1
    /// of its bytes and storing it as `<sha1>.<extension>`.
    pub fn from_image_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, PackagingError> {
        let mut table = Self::new(RESERVED_COLUMNS.iter().map(|s| s.to_string()).collect())?;
        for path in paths {
            let path = path.as_ref();
            let sha1 = sha1_file(path)?;
            let store_path = match path.extension().and_then(|ext| ext.to_str()) {
                Some(ext) => format!("{sha1}.{ext}"),
                None => sha1.clone(),
            };
            table.push_row(vec![
                Value::Text(path.display().to_string()),
                Value::Text(sha1),
                Value::Text(store_path),
            ])?;
        }
        Ok(table)
    }

    pub fn push_row(&mut self, values: Vec<Value>) -> Result<(), PackagingError> {
        if values.len() != self.columns.len() {
            return Err(PackagingError::InvalidTable(format!(
                "row {} has {} cells, expected {}",
                self.rows.len(),
                values.len(),
                self.columns.len()
            )));
        }
        for pos in self.reserved {
            match &values[pos] {
                Value::Text(text) if !text.is_empty() => {}
                other => {
                    return Err(PackagingError::InvalidTable(format!(
                        "row {}: {} must be non-empty text, got {other:?}",
                        self.rows.len(),
                        self.columns[pos]
                    )));
                }
            }
        }
        self.rows.push(values);
        Ok(())
    }

    /// Appends a metadata column. `values` must hold one cell per row.
    pub fn add_column(&mut self, name: &str, values: Vec<Value>) -> Result<(), PackagingError> {
        if self.columns.iter().any(|column| column == name) {
            return Err(PackagingError::InvalidTable(format!("duplicate column {name}")));
        }
        if values.len() != self.rows.len() {
            return Err(PackagingError::InvalidTable(format!(
                "column {name} has {} cells, expected {}",
                values.len(),
                self.rows.len()
            )));
        }
        self.columns.push(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    /// Pins the declared type of a metadata column instead of inferring it.
    pub fn declare_type(
        &mut self,
        column: &str,
        declared_type: AttributeType,
    ) -> Result<(), PackagingError> {
        if RESERVED_COLUMNS.contains(&column) || !self.columns.iter().any(|c| c == column) {
            return Err(PackagingError::MissingColumn(column.to_string()));
        }
        self.declared.insert(column.to_string(), declared_type);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = ImageEntry<'_>> {
        let [path_pos, id_pos, store_pos] = self.reserved;
        self.rows.iter().enumerate().map(move |(index, row)| ImageEntry {
            index,
            local_path: row[path_pos].as_text().unwrap_or_default(),
            image_id: row[id_pos].as_text().unwrap_or_default(),
            path_within_store: row[store_pos].as_text().unwrap_or_default(),
            row,
            columns: &self.columns,
        })
    }

    pub fn archive_entries(&self) -> Vec<ArchiveEntry> {
        self.entries()
            .map(|entry| ArchiveEntry::new(entry.local_path, entry.path_within_store))
            .collect()
    }

    /// Every non-reserved column, in column order, with its declared type.
    ///
    /// Types come from `declare_type` when given, otherwise from the values:
    /// ints and floats widen to float and any other mix is an error. Missing
    /// cells are stored as `nan`, so they widen int columns to float and bool
    /// columns to str. A declared int or bool column must have no missing cells.
    pub fn derive_attribute_set(&self) -> Result<Vec<AttributeSpec>, PackagingError> {
        let mut specs = Vec::new();
        for (pos, name) in self.columns.iter().enumerate() {
            if RESERVED_COLUMNS.contains(&name.as_str()) {
                continue;
            }
            let declared_type = match self.declared.get(name) {
                Some(declared) => {
                    self.check_declared(pos, *declared)?;
                    *declared
                }
                None => self.infer_column(pos)?,
            };
            specs.push(AttributeSpec {
                name: name.clone(),
                declared_type,
            });
        }
        Ok(specs)
    }

    fn infer_column(&self, pos: usize) -> Result<AttributeType, PackagingError> {
        let mut current: Option<AttributeType> = None;
        let mut missing = false;
        for (row_index, row) in self.rows.iter().enumerate() {
            let Some(found) = row[pos].attribute_type() else {
                missing = true;
                continue;
            };
            current = match current {
                None => Some(found),
                Some(expected) => Some(expected.unify(found).ok_or_else(|| {
                    PackagingError::HeterogeneousAttribute {
                        column: self.columns[pos].clone(),
                        expected: expected.to_string(),
                        found: found.to_string(),
                        row: row_index,
                    }
                })?),
            };
        }
        // missing cells are stored as "nan", which only float and str columns can hold
        Ok(match current {
            None => AttributeType::Float,
            Some(AttributeType::Int) if missing => AttributeType::Float,
            Some(AttributeType::Bool) if missing => AttributeType::Str,
            Some(found) => found,
        })
    }

    fn check_declared(&self, pos: usize, declared: AttributeType) -> Result<(), PackagingError> {
        for (row_index, row) in self.rows.iter().enumerate() {
            let Some(found) = row[pos].attribute_type() else {
                if matches!(declared, AttributeType::Int | AttributeType::Bool) {
                    return Err(PackagingError::HeterogeneousAttribute {
                        column: self.columns[pos].clone(),
                        expected: declared.to_string(),
                        found: "missing".to_string(),
                        row: row_index,
                    });
                }
                continue;
            };
            if !declared.accepts(found) {
                return Err(PackagingError::HeterogeneousAttribute {
                    column: self.columns[pos].clone(),
                    expected: declared.to_string(),
                    found: found.to_string(),
                    row: row_index,
                });
            }
        }
        Ok(())
    }
}

fn resolve_path(base_dir: &Path, cell: &str) -> String {
    let path = PathBuf::from(cell);
    if path.is_absolute() {
        cell.to_string()
    } else {
        base_dir.join(path).display().to_string()
    }
}
