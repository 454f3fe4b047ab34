use crate::controller::DuplicateTracker;
use crate::error::WriterError;
use crate::types::Row;

use super::storage::Storage;
use super::{WriterResult, WriterStrategy};

/// Inserts every row into storage as soon as it is accepted.
pub struct DirectWriter {
    storage: Box<dyn Storage>,
    duplicates: DuplicateTracker,
    closed: bool,
}

impl DirectWriter {
    /// Wrap `storage`, emptying it first when `truncate` is set.
    pub fn new(mut storage: Box<dyn Storage>, duplicates: DuplicateTracker, truncate: bool) -> Result<Self, WriterError> {
        if truncate {
            storage.truncate()?;
        }
        Ok(Self {
            storage,
            duplicates,
            closed: false,
        })
    }
}

impl WriterStrategy for DirectWriter {
    fn insert(&mut self, row: &Row, raw: &[u8]) -> Result<(), WriterError> {
        if self.closed {
            return Err(WriterError::Closed);
        }
        let outcome = self.storage.insert(row, self.duplicates.keep())?;
        self.duplicates.record(outcome, raw)
    }

    fn close(&mut self, on_error: bool) -> Result<WriterResult, WriterError> {
        if self.closed {
            return Ok(self.duplicates.result());
        }
        self.closed = true;
        if on_error {
            let _ = self.duplicates.flush();
            return Ok(self.duplicates.result());
        }
        self.storage.finish()?;
        self.duplicates.flush()?;
        Ok(self.duplicates.result())
    }
}
