//! Row validation before a row reaches the writer.
//!
//! Checks run in order: character encoding of every text value, NOT NULL, then the storage
//! catalog's own constraint check when enabled. The checker keeps no per-row state, so a
//! rejected row leaves nothing behind for the next one.

use std::sync::Arc;

use crate::catalog::TypeCatalog;
use crate::config::Encoding;
use crate::controller::RowError;
use crate::error::{ConstraintError, ConstraintKind, LoadError, StorageError};
use crate::types::{Row, Schema, Value};

/// External transcoding service: converts bytes from the input encoding into UTF-8.
pub trait Transcoder: Send + Sync {
    fn to_utf8(&self, from: Encoding, bytes: &[u8]) -> Result<Vec<u8>, String>;
}

/// Handles the encodings [`Encoding`] can name.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTranscoder;

impl Transcoder for BuiltinTranscoder {
    fn to_utf8(&self, from: Encoding, bytes: &[u8]) -> Result<Vec<u8>, String> {
        match from {
            // every byte maps to the code point of the same value
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect::<String>().into_bytes()),
            Encoding::Utf8 | Encoding::SqlAscii => std::str::from_utf8(bytes)
                .map(|s| s.as_bytes().to_vec())
                .map_err(|e| utf8_detail(bytes, &e)),
        }
    }
}

pub struct Checker {
    schema: Arc<Schema>,
    catalog: Arc<dyn TypeCatalog>,
    transcoder: Arc<dyn Transcoder>,
    encoding: Encoding,
    check_constraints: bool,
}

impl Checker {
    pub fn new(
        schema: Arc<Schema>,
        catalog: Arc<dyn TypeCatalog>,
        transcoder: Arc<dyn Transcoder>,
        encoding: Encoding,
        check_constraints: bool,
    ) -> Self {
        Self {
            schema,
            catalog,
            transcoder,
            encoding,
            check_constraints,
        }
    }

    /// Validate `row`, transcoding its text values in place when the input encoding is not the
    /// storage encoding.
    pub fn validate(&self, record_no: u64, row: &mut Row) -> Result<(), RowError> {
        for (idx, value) in row.values.iter_mut().enumerate() {
            let Value::Text(bytes) = value else { continue };
            if bytes.is_ascii() {
                continue;
            }
            let violation = |detail: String| ConstraintError {
                record_no,
                column: Some(idx),
                kind: ConstraintKind::Encoding(detail),
            };
            if self.encoding.matches_storage() {
                if let Err(e) = std::str::from_utf8(bytes) {
                    return Err(violation(utf8_detail(bytes, &e)).into());
                }
            } else {
                *bytes = self
                    .transcoder
                    .to_utf8(self.encoding, bytes)
                    .map_err(violation)?;
            }
        }

        for (idx, column) in self.schema.columns.iter().enumerate() {
            if column.not_null && row.is_null(idx) {
                return Err(ConstraintError {
                    record_no,
                    column: Some(idx),
                    kind: ConstraintKind::NotNull,
                }
                .into());
            }
        }

        if self.check_constraints {
            self.catalog.check(&self.schema, row).map_err(|err| match err {
                StorageError::Interrupted(kind) => RowError::Fatal(LoadError::Interrupted(kind)),
                StorageError::Io(e) => RowError::Fatal(LoadError::Io(e)),
                other => RowError::Constraint(ConstraintError {
                    record_no,
                    column: None,
                    kind: ConstraintKind::Check(other.to_string()),
                }),
            })?;
        }
        Ok(())
    }
}

fn utf8_detail(bytes: &[u8], err: &std::str::Utf8Error) -> String {
    let at = err.valid_up_to();
    let len = err.error_len().unwrap_or(bytes.len() - at);
    let shown: Vec<String> = bytes[at..at + len].iter().map(|b| format!("0x{b:02x}")).collect();
    format!("invalid UTF-8 sequence {} at byte {}", shown.join(" "), at + 1)
}
