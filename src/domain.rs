use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PackagingError;

pub const DEFAULT_BUCKET: &str = "brainio-contrib";

static NAME_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]*$").expect("valid name regex"));

static BUCKET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9.\-]{1,61}[a-z0-9]$").expect("valid bucket regex")
});

fn parse_dotted_name(value: &str) -> Result<String, PackagingError> {
    let trimmed = value.trim();
    let invalid = |reason: &str| PackagingError::InvalidName {
        name: value.to_string(),
        reason: reason.to_string(),
    };
    let segments = trimmed.split('.').collect::<Vec<_>>();
    if segments.len() < 2 {
        return Err(invalid("expected <lab>.<identifier>"));
    }
    if let Some(bad) = segments.iter().find(|segment| !NAME_SEGMENT.is_match(segment)) {
        return Err(invalid(&format!("bad segment {bad:?}")));
    }
    Ok(trimmed.to_string())
}

fn storage_safe(name: &str) -> String {
    name.replace('.', "_")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StimulusSetName(String);

impl StimulusSetName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unique name of the image store backing this stimulus set.
    pub fn store_name(&self) -> String {
        format!("image_{}", storage_safe(&self.0))
    }

    pub fn zip_file_name(&self) -> String {
        format!("{}.zip", self.store_name())
    }
}

impl fmt::Display for StimulusSetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StimulusSetName {
    type Err = PackagingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_dotted_name(value).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssemblyName(String);

impl AssemblyName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn store_name(&self) -> String {
        format!("assy_{}", storage_safe(&self.0))
    }

    pub fn netcdf_file_name(&self) -> String {
        format!("{}.nc", self.store_name())
    }
}

impl fmt::Display for AssemblyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AssemblyName {
    type Err = PackagingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_dotted_name(value).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketName(String);

impl BucketName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BucketName {
    fn default() -> Self {
        Self(DEFAULT_BUCKET.to_string())
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BucketName {
    type Err = PackagingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !BUCKET.is_match(normalized) || normalized.contains("..") {
            return Err(PackagingError::InvalidBucket(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[value(rename_all = "PascalCase")]
pub enum AssemblyClass {
    DataAssembly,
    BehavioralAssembly,
    NeuroidAssembly,
    #[default]
    NeuronRecordingAssembly,
    PropertyAssembly,
}

impl AssemblyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssemblyClass::DataAssembly => "DataAssembly",
            AssemblyClass::BehavioralAssembly => "BehavioralAssembly",
            AssemblyClass::NeuroidAssembly => "NeuroidAssembly",
            AssemblyClass::NeuronRecordingAssembly => "NeuronRecordingAssembly",
            AssemblyClass::PropertyAssembly => "PropertyAssembly",
        }
    }
}

impl fmt::Display for AssemblyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of an EAV attribute. Recorded next to the attribute name;
/// values themselves are always stored as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Int,
    Float,
    Bool,
    Str,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::Int => "int",
            AttributeType::Float => "float",
            AttributeType::Bool => "bool",
            AttributeType::Str => "str",
        }
    }

    /// Widest type able to hold values of both `self` and `other`, if any.
    pub fn unify(self, other: AttributeType) -> Option<AttributeType> {
        match (self, other) {
            (a, b) if a == b => Some(a),
            (AttributeType::Int, AttributeType::Float)
            | (AttributeType::Float, AttributeType::Int) => Some(AttributeType::Float),
            _ => None,
        }
    }

    /// Whether a value of type `found` may be stored under this declared type.
    pub fn accepts(self, found: AttributeType) -> bool {
        match self {
            AttributeType::Str => true,
            AttributeType::Float => matches!(found, AttributeType::Float | AttributeType::Int),
            _ => self == found,
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributeType {
    type Err = PackagingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // numpy spellings appear in rows written by the Python tooling
        match value.trim() {
            "int" | "int32" | "int64" => Ok(AttributeType::Int),
            "float" | "float32" | "float64" => Ok(AttributeType::Float),
            "bool" | "bool_" => Ok(AttributeType::Bool),
            "str" | "str_" => Ok(AttributeType::Str),
            other => Err(PackagingError::InvalidAttributeType(other.to_string())),
        }
    }
}

/// One cell of a stimulus table.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Missing,
}

impl Value {
    /// Infers a typed value from a raw text cell.
    pub fn infer(raw: &str) -> Value {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Missing;
        }
        if let Ok(int) = trimmed.parse::<i64>() {
            return Value::Int(int);
        }
        if let Ok(float) = trimmed.parse::<f64>() {
            return Value::Float(float);
        }
        match trimmed {
            "True" | "true" => Value::Bool(true),
            "False" | "false" => Value::Bool(false),
            _ => Value::Text(raw.to_string()),
        }
    }

    pub fn attribute_type(&self) -> Option<AttributeType> {
        match self {
            Value::Int(_) => Some(AttributeType::Int),
            Value::Float(_) => Some(AttributeType::Float),
            Value::Bool(_) => Some(AttributeType::Bool),
            Value::Text(_) => Some(AttributeType::Str),
            Value::Missing => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    /// String form persisted under an attribute of type `declared`. Ints in
    /// a float column render as floats.
    pub fn stored_as(&self, declared: AttributeType) -> String {
        match (self, declared) {
            (Value::Int(int), AttributeType::Float) => format_float(*int as f64),
            _ => self.to_stored_string(),
        }
    }

    /// String form persisted in the EAV table.
    pub fn to_stored_string(&self) -> String {
        match self {
            Value::Int(int) => int.to_string(),
            Value::Float(float) => format_float(*float),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Text(text) => text.clone(),
            Value::Missing => "nan".to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Renders like Python's `repr(float)`: shortest round-trip digits, with
/// exponent notation below 1e-4 and from 1e16 upwards.
fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }
    let scientific = format!("{value:e}");
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if !(-4..16).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exponent.abs());
    }
    let decimal = value.to_string();
    if decimal.contains('.') {
        decimal
    } else {
        format!("{decimal}.0")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_stimulus_set_name_valid() {
        let name: StimulusSetName = "dicarlo.hvm".parse().unwrap();
        assert_eq!(name.store_name(), "image_dicarlo_hvm");
        assert_eq!(name.zip_file_name(), "image_dicarlo_hvm.zip");
    }

    #[test]
    fn parse_stimulus_set_name_requires_lab_prefix() {
        let err = "hvm".parse::<StimulusSetName>().unwrap_err();
        assert_matches!(err, PackagingError::InvalidName { .. });
    }

    #[test]
    fn parse_name_rejects_path_separators() {
        let err = "dicarlo.a/b".parse::<AssemblyName>().unwrap_err();
        assert_matches!(err, PackagingError::InvalidName { .. });
    }

    #[test]
    fn attribute_type_widening() {
        assert_eq!(
            AttributeType::Int.unify(AttributeType::Float),
            Some(AttributeType::Float)
        );
        assert_eq!(AttributeType::Int.unify(AttributeType::Str), None);
        assert!(AttributeType::Str.accepts(AttributeType::Bool));
        assert!(!AttributeType::Int.accepts(AttributeType::Float));
    }

    #[test]
    fn float_stringification_matches_python() {
        assert_eq!(Value::Float(1.0).to_stored_string(), "1.0");
        assert_eq!(Value::Float(0.25).to_stored_string(), "0.25");
        assert_eq!(Value::Float(f64::NAN).to_stored_string(), "nan");
        assert_eq!(Value::Bool(false).to_stored_string(), "False");
    }

    #[test]
    fn large_and_small_floats_use_exponent_form() {
        assert_eq!(Value::Float(1e16).to_stored_string(), "1e+16");
        assert_eq!(Value::Float(1.5e20).to_stored_string(), "1.5e+20");
        assert_eq!(Value::Float(1e-5).to_stored_string(), "1e-05");
        assert_eq!(Value::Float(-2.5e-7).to_stored_string(), "-2.5e-07");
        assert_eq!(Value::Float(1e15).to_stored_string(), "1000000000000000.0");
        assert_eq!(Value::Float(1e-4).to_stored_string(), "0.0001");
        assert_eq!(Value::Float(-0.0).to_stored_string(), "-0.0");
    }

    #[test]
    fn ints_in_float_columns_render_as_floats() {
        assert_eq!(Value::Int(1).stored_as(AttributeType::Float), "1.0");
        assert_eq!(Value::Int(1).stored_as(AttributeType::Int), "1");
        assert_eq!(Value::Int(7).stored_as(AttributeType::Str), "7");
        assert_eq!(Value::Missing.stored_as(AttributeType::Float), "nan");
    }
}
