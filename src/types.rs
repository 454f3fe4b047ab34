//! Core data model: the target table's [`Schema`], typed [`Value`]s and the reusable [`Row`].
//!
//! Character data is carried as bytes ([`Value::Text`]) until the checker has validated (and if
//! needed transcoded) it into the storage encoding.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical data type of a target column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit floating point number.
    Float64,
    /// Boolean.
    Bool,
    /// Character data.
    Text,
}

impl DataType {
    /// Parse a type name as used on the command line (`int`, `bigint`, `text`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "int2" | "smallint" | "int16" => Some(Self::Int16),
            "int" | "int4" | "integer" | "int32" => Some(Self::Int32),
            "int8" | "bigint" | "int64" => Some(Self::Int64),
            "float" | "float8" | "double" | "float64" => Some(Self::Float64),
            "bool" | "boolean" => Some(Self::Bool),
            "text" | "varchar" | "char" | "string" => Some(Self::Text),
            _ => None,
        }
    }

    /// Whether values of this type go through encoding validation.
    pub fn is_character(&self) -> bool {
        matches!(self, Self::Text)
    }
}

/// A single named, typed column of the target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column data type.
    pub data_type: DataType,
    /// Whether NULL is rejected by the checker.
    pub not_null: bool,
    /// Value used when the input record ends before this column.
    pub default: Option<Value>,
}

impl Column {
    /// Create a nullable column without a default.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            not_null: false,
            default: None,
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Set the default used for missing trailing fields.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Ordered list of columns describing the target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Ordered list of columns.
    pub columns: Vec<Column>,
}

impl Schema {
    /// Create a new schema from columns.
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate column names in order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Returns the index of a column by name (case-insensitive), if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    /// Character data; valid storage-encoded text once the row has been checked.
    Text(Vec<u8>),
}

impl Value {
    /// Convenience constructor for text values.
    pub fn text(s: impl AsRef<str>) -> Self {
        Self::Text(s.as_ref().as_bytes().to_vec())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Render the value the way it would appear in a delimited output file.
    pub fn to_text(&self) -> Cow<'_, str> {
        match self {
            Self::Null => Cow::Borrowed(""),
            Self::Int16(v) => Cow::Owned(v.to_string()),
            Self::Int32(v) => Cow::Owned(v.to_string()),
            Self::Int64(v) => Cow::Owned(v.to_string()),
            Self::Float64(v) => Cow::Owned(v.to_string()),
            Self::Bool(v) => Cow::Borrowed(if *v { "true" } else { "false" }),
            Self::Text(bytes) => String::from_utf8_lossy(bytes),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// One output row: a value and a null flag per column.
///
/// The pipeline allocates a single `Row` per run and overwrites it for every record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
    pub nulls: Vec<bool>,
}

impl Row {
    /// Create a row sized for `columns` columns, all NULL.
    pub fn with_columns(columns: usize) -> Self {
        Self {
            values: vec![Value::Null; columns],
            nulls: vec![true; columns],
        }
    }

    /// Build a row from values; `Value::Null` entries are flagged as nulls.
    pub fn from_values(values: Vec<Value>) -> Self {
        let nulls = values.iter().map(Value::is_null).collect();
        Self { values, nulls }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Store a value in column `idx`.
    pub fn set(&mut self, idx: usize, value: Value) {
        self.nulls[idx] = value.is_null();
        self.values[idx] = value;
    }

    /// Mark column `idx` NULL.
    pub fn set_null(&mut self, idx: usize) {
        self.nulls[idx] = true;
        self.values[idx] = Value::Null;
    }

    pub fn is_null(&self, idx: usize) -> bool {
        self.nulls.get(idx).copied().unwrap_or(true)
    }

    /// Reset to `columns` NULL columns, reusing the allocations.
    pub fn reset(&mut self, columns: usize) {
        self.values.clear();
        self.values.resize(columns, Value::Null);
        self.nulls.clear();
        self.nulls.resize(columns, true);
    }

    /// Render the row as one CSV line (used for records that have no raw input bytes).
    pub fn to_csv_line(&self) -> Result<Vec<u8>, csv::Error> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        wtr.write_record(self.values.iter().map(|v| v.to_text().into_owned()))?;
        wtr.into_inner().map_err(|e| csv::Error::from(e.into_error()))
    }
}
