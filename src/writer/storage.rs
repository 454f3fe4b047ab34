//! Storage collaborator boundary: where accepted rows end up.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StorageError;
use crate::types::{Row, Value};

/// Which row survives a unique key conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKeep {
    /// The incoming row replaces the stored one.
    New,
    /// The stored row stays and the incoming row is discarded.
    Old,
}

/// Result of a single insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// The key already existed and the incoming row was discarded.
    DuplicateDiscarded { key: String },
    /// The key already existed and `old` was replaced by the incoming row.
    Replaced { key: String, old: Row },
}

/// A table accepting rows.
pub trait Storage: Send {
    fn insert(&mut self, row: &Row, keep: DuplicateKeep) -> Result<InsertOutcome, StorageError>;

    /// Insert rows in order. Outcomes line up with `rows`.
    fn insert_batch(&mut self, rows: &[Row], keep: DuplicateKeep) -> Result<Vec<InsertOutcome>, StorageError> {
        rows.iter().map(|row| self.insert(row, keep)).collect()
    }

    /// Remove every stored row.
    fn truncate(&mut self) -> Result<(), StorageError>;

    /// Make everything inserted so far durable.
    fn finish(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TableState {
    rows: Vec<Row>,
    key_column: Option<usize>,
    index: HashMap<Vec<u8>, usize>,
}

/// In-memory table with an optional unique key column.
///
/// Clones share the same rows, so a caller can keep one handle for inspection while the writer
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    state: Arc<Mutex<TableState>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table that enforces uniqueness on column `key_column`.
    pub fn with_unique_key(key_column: usize) -> Self {
        let table = Self::default();
        if let Ok(mut state) = table.state.lock() {
            state.key_column = Some(key_column);
        }
        table
    }

    /// Snapshot of the stored rows in insertion order.
    pub fn rows(&self) -> Vec<Row> {
        self.state
            .lock()
            .map(|state| state.rows.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, TableState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Invalid("table lock poisoned".to_string()))
    }
}

impl Storage for MemoryTable {
    fn insert(&mut self, row: &Row, keep: DuplicateKeep) -> Result<InsertOutcome, StorageError> {
        let mut state = self.lock()?;
        let Some(key_column) = state.key_column else {
            state.rows.push(row.clone());
            return Ok(InsertOutcome::Inserted);
        };

        let key_value = row.values.get(key_column).unwrap_or(&Value::Null);
        if key_value.is_null() {
            // NULL keys never conflict
            state.rows.push(row.clone());
            return Ok(InsertOutcome::Inserted);
        }
        let key = key_value.to_text().into_owned();

        match state.index.get(key.as_bytes()).copied() {
            None => {
                let pos = state.rows.len();
                state.rows.push(row.clone());
                state.index.insert(key.into_bytes(), pos);
                Ok(InsertOutcome::Inserted)
            }
            Some(_) if keep == DuplicateKeep::Old => Ok(InsertOutcome::DuplicateDiscarded { key }),
            Some(pos) => {
                let old = std::mem::replace(&mut state.rows[pos], row.clone());
                Ok(InsertOutcome::Replaced { key, old })
            }
        }
    }

    fn truncate(&mut self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.rows.clear();
        state.index.clear();
        Ok(())
    }
}

/// Appends rows to a CSV file. Has no key, so it never reports duplicates.
pub struct CsvFileStorage {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvFileStorage {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for CsvFileStorage {
    fn insert(&mut self, row: &Row, _keep: DuplicateKeep) -> Result<InsertOutcome, StorageError> {
        self.writer.write_record(row.values.iter().map(field_bytes))?;
        Ok(InsertOutcome::Inserted)
    }

    fn truncate(&mut self) -> Result<(), StorageError> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(0)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

fn field_bytes(value: &Value) -> Cow<'_, [u8]> {
    match value {
        Value::Text(bytes) => Cow::Borrowed(bytes),
        other => Cow::Owned(other.to_text().into_owned().into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i32, name: &str) -> Row {
        Row::from_values(vec![Value::Int32(id), Value::text(name)])
    }

    #[test]
    fn unique_key_policies() {
        let mut table = MemoryTable::with_unique_key(0);
        let handle = table.clone();
        assert_eq!(table.insert(&row(1, "a"), DuplicateKeep::New).unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            table.insert(&row(1, "b"), DuplicateKeep::Old).unwrap(),
            InsertOutcome::DuplicateDiscarded { key: "1".into() }
        );
        assert_eq!(
            table.insert(&row(1, "c"), DuplicateKeep::New).unwrap(),
            InsertOutcome::Replaced {
                key: "1".into(),
                old: row(1, "a")
            }
        );
        assert_eq!(handle.rows(), vec![row(1, "c")]);
    }

    #[test]
    fn null_keys_and_keyless_tables_never_conflict() {
        let mut table = MemoryTable::with_unique_key(0);
        let null_key = Row::from_values(vec![Value::Null, Value::text("x")]);
        table.insert(&null_key, DuplicateKeep::Old).unwrap();
        table.insert(&null_key, DuplicateKeep::Old).unwrap();
        assert_eq!(table.len(), 2);

        let mut plain = MemoryTable::new();
        let outcomes = plain.insert_batch(&[row(1, "a"), row(1, "a")], DuplicateKeep::Old).unwrap();
        assert_eq!(outcomes, vec![InsertOutcome::Inserted, InsertOutcome::Inserted]);
        plain.truncate().unwrap();
        assert!(plain.is_empty());
    }

    #[test]
    fn csv_file_storage_appends_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut storage = CsvFileStorage::open(&path).unwrap();
        storage.insert(&row(1, "a,b"), DuplicateKeep::New).unwrap();
        storage
            .insert(&Row::from_values(vec![Value::Int32(2), Value::Null]), DuplicateKeep::New)
            .unwrap();
        storage.finish().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1,\"a,b\"\n2,\n");

        storage.truncate().unwrap();
        storage.insert(&row(3, "c"), DuplicateKeep::New).unwrap();
        storage.finish().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "3,c\n");
    }
}
