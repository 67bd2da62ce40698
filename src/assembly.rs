use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PackagingError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum CoordValues {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Text(Vec<String>),
}

impl CoordValues {
    pub fn len(&self) -> usize {
        match self {
            CoordValues::Int(values) => values.len(),
            CoordValues::Float(values) => values.len(),
            CoordValues::Text(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub name: String,
    pub dims: Vec<String>,
    pub values: CoordValues,
}

/// A stacked dimension whose index is the tuple of several level
/// coordinates, e.g. `presentation = (image_id, repetition)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiIndex {
    pub dim: String,
    pub levels: Vec<String>,
}

/// Labeled n-dimensional array of measurements. `values` is row-major over
/// `dims`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataAssembly {
    pub dims: Vec<Dimension>,
    pub values: Vec<f64>,
    #[serde(default)]
    pub coords: Vec<Coordinate>,
    #[serde(default)]
    pub multi_indexes: Vec<MultiIndex>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl DataAssembly {
    pub fn from_json_file(path: &Path) -> Result<Self, PackagingError> {
        let content = fs::read_to_string(path)
            .map_err(|err| PackagingError::Filesystem(format!("read {}: {err}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|err| PackagingError::InvalidAssembly(format!("{}: {err}", path.display())))
    }

    pub fn dim(&self, name: &str) -> Option<&Dimension> {
        self.dims.iter().find(|dim| dim.name == name)
    }

    pub fn coord(&self, name: &str) -> Option<&Coordinate> {
        self.coords.iter().find(|coord| coord.name == name)
    }

    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().map(|dim| dim.size).collect()
    }

    pub fn has_multi_index(&self) -> bool {
        !self.multi_indexes.is_empty()
    }

    /// Drops every multi-level index. The level coordinates stay on their
    /// stacked dimension as plain coordinates.
    pub fn reset_index(&mut self) {
        for index in self.multi_indexes.drain(..) {
            tracing::debug!(dim = %index.dim, levels = ?index.levels, "flattening multi-index");
        }
    }

    pub fn validate(&self) -> Result<(), PackagingError> {
        let invalid = |message: String| Err(PackagingError::InvalidAssembly(message));

        let mut names = HashSet::new();
        for dim in &self.dims {
            if !names.insert(dim.name.as_str()) {
                return invalid(format!("duplicate dimension {}", dim.name));
            }
        }
        let Some(expected) = self
            .dims
            .iter()
            .try_fold(1usize, |total, dim| total.checked_mul(dim.size))
        else {
            return invalid(format!("shape {:?} overflows the element count", self.shape()));
        };
        if self.values.len() != expected {
            return invalid(format!(
                "{} values for shape {:?} ({expected} expected)",
                self.values.len(),
                self.shape()
            ));
        }

        let mut coord_names = HashSet::new();
        for coord in &self.coords {
            if !coord_names.insert(coord.name.as_str()) {
                return invalid(format!("duplicate coordinate {}", coord.name));
            }
            let mut length = 1usize;
            for dim_name in &coord.dims {
                match self.dim(dim_name) {
                    Some(dim) => match length.checked_mul(dim.size) {
                        Some(product) => length = product,
                        None => {
                            return invalid(format!(
                                "coordinate {} overflows the element count",
                                coord.name
                            ));
                        }
                    },
                    None => {
                        return invalid(format!(
                            "coordinate {} uses unknown dimension {dim_name}",
                            coord.name
                        ));
                    }
                }
            }
            if coord.values.len() != length {
                return invalid(format!(
                    "coordinate {} has {} values, expected {length}",
                    coord.name,
                    coord.values.len()
                ));
            }
            if self.dim(&coord.name).is_some() && coord.dims != [coord.name.clone()] {
                return invalid(format!(
                    "coordinate {} shares a dimension's name but is not its index",
                    coord.name
                ));
            }
        }

        for index in &self.multi_indexes {
            if self.dim(&index.dim).is_none() {
                return invalid(format!("multi-index on unknown dimension {}", index.dim));
            }
            if index.levels.is_empty() {
                return invalid(format!("multi-index on {} has no levels", index.dim));
            }
            for level in &index.levels {
                match self.coord(level) {
                    Some(coord) if coord.dims == [index.dim.clone()] => {}
                    _ => {
                        return invalid(format!(
                            "level {level} is not a coordinate along {}",
                            index.dim
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
