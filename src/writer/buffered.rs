use crate::controller::DuplicateTracker;
use crate::error::WriterError;
use crate::types::Row;

use super::storage::Storage;
use super::{WriterResult, WriterStrategy};

/// Collects accepted rows and inserts them `batch_size` at a time.
///
/// Pending slots are reused across batches, so steady-state loading does not allocate per row.
pub struct BufferedWriter {
    storage: Box<dyn Storage>,
    duplicates: DuplicateTracker,
    rows: Vec<Row>,
    raws: Vec<Vec<u8>>,
    pending: usize,
    batch_size: usize,
    closed: bool,
}

impl BufferedWriter {
    pub fn new(
        mut storage: Box<dyn Storage>,
        duplicates: DuplicateTracker,
        batch_size: usize,
        truncate: bool,
    ) -> Result<Self, WriterError> {
        if truncate {
            storage.truncate()?;
        }
        let batch_size = batch_size.max(1);
        Ok(Self {
            storage,
            duplicates,
            rows: Vec::with_capacity(batch_size),
            raws: Vec::with_capacity(batch_size),
            pending: 0,
            batch_size,
            closed: false,
        })
    }

    /// Rows accepted but not yet handed to storage.
    pub fn pending(&self) -> usize {
        self.pending
    }

    fn flush(&mut self) -> Result<(), WriterError> {
        if self.pending == 0 {
            return Ok(());
        }
        let batch = &self.rows[..self.pending];
        log::debug!("flushing {} buffered rows", batch.len());
        let outcomes = self.storage.insert_batch(batch, self.duplicates.keep())?;
        self.pending = 0;
        for (outcome, raw) in outcomes.into_iter().zip(&self.raws) {
            self.duplicates.record(outcome, raw)?;
        }
        Ok(())
    }
}

impl WriterStrategy for BufferedWriter {
    fn insert(&mut self, row: &Row, raw: &[u8]) -> Result<(), WriterError> {
        if self.closed {
            return Err(WriterError::Closed);
        }
        let slot = self.pending;
        if slot < self.rows.len() {
            self.rows[slot].clone_from(row);
            self.raws[slot].clear();
            self.raws[slot].extend_from_slice(raw);
        } else {
            self.rows.push(row.clone());
            self.raws.push(raw.to_vec());
        }
        self.pending += 1;

        if self.pending >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn close(&mut self, on_error: bool) -> Result<WriterResult, WriterError> {
        if self.closed {
            return Ok(self.duplicates.result());
        }
        self.closed = true;
        if on_error {
            self.pending = 0;
            let _ = self.duplicates.flush();
            return Ok(self.duplicates.result());
        }
        self.flush()?;
        self.storage.finish()?;
        self.duplicates.flush()?;
        Ok(self.duplicates.result())
    }
}
