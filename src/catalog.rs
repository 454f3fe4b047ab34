//! Typed-input and row-check callbacks supplied by the storage side.

use crate::error::StorageError;
use crate::types::{Column, DataType, Row, Schema, Value};

/// Converts field text into typed values and runs the storage engine's own row checks.
pub trait TypeCatalog: Send + Sync {
    /// Convert the raw bytes of a non-NULL field for `column`.
    fn input(&self, column: &Column, raw: &[u8]) -> Result<Value, StorageError>;

    /// General constraint check on a complete row. Only called when constraint checking is on.
    fn check(&self, _schema: &Schema, _row: &Row) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Built-in conversions for every [`DataType`], with no extra row constraints.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCatalog;

impl TypeCatalog for DefaultCatalog {
    fn input(&self, column: &Column, raw: &[u8]) -> Result<Value, StorageError> {
        parse_typed_value(column.data_type, raw)
    }
}

/// Parse one non-NULL field into `data_type`.
pub fn parse_typed_value(data_type: DataType, raw: &[u8]) -> Result<Value, StorageError> {
    if data_type == DataType::Text {
        return Ok(Value::Text(raw.to_vec()));
    }

    let invalid = || {
        StorageError::Invalid(format!(
            "invalid input syntax for type {}: \"{}\"",
            type_name(data_type),
            String::from_utf8_lossy(raw)
        ))
    };
    let text = std::str::from_utf8(raw).map_err(|_| invalid())?.trim();

    match data_type {
        DataType::Int16 => text.parse().map(Value::Int16).map_err(|_| invalid()),
        DataType::Int32 => text.parse().map(Value::Int32).map_err(|_| invalid()),
        DataType::Int64 => text.parse().map(Value::Int64).map_err(|_| invalid()),
        DataType::Float64 => text.parse().map(Value::Float64).map_err(|_| invalid()),
        DataType::Bool => parse_bool(text).map(Value::Bool).ok_or_else(invalid),
        DataType::Text => Ok(Value::Text(raw.to_vec())),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "f" | "0" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn type_name(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Int16 => "smallint",
        DataType::Int32 => "integer",
        DataType::Int64 => "bigint",
        DataType::Float64 => "double precision",
        DataType::Bool => "boolean",
        DataType::Text => "text",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbers_with_surrounding_blanks() {
        assert_eq!(parse_typed_value(DataType::Int32, b" 42 ").unwrap(), Value::Int32(42));
        assert_eq!(parse_typed_value(DataType::Int64, b"-7").unwrap(), Value::Int64(-7));
        assert_eq!(parse_typed_value(DataType::Float64, b"2.5").unwrap(), Value::Float64(2.5));
        assert_eq!(parse_typed_value(DataType::Bool, b"Yes").unwrap(), Value::Bool(true));
    }

    #[test]
    fn rejects_out_of_range_and_empty_input() {
        let err = parse_typed_value(DataType::Int16, b"40000").unwrap_err();
        assert_eq!(err.to_string(), "invalid input syntax for type smallint: \"40000\"");
        assert!(parse_typed_value(DataType::Int32, b"").is_err());
        assert!(parse_typed_value(DataType::Bool, b"maybe").is_err());
    }

    #[test]
    fn text_is_kept_verbatim() {
        assert_eq!(
            parse_typed_value(DataType::Text, b" a ").unwrap(),
            Value::Text(b" a ".to_vec())
        );
    }
}
