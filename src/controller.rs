//! Per-record failure isolation.
//!
//! [`ErrorController`] wraps the build-and-check attempt of every record. Row-level failures
//! are counted, logged, reported to the observer and the raw record is appended to the parse
//! bad-record file; a run-level error inside the attempt passes through untouched. Duplicate
//! keys are only known once storage has seen the row, so they are tracked on the writer side by
//! [`DuplicateTracker`].

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ErrorLimit, OnDuplicate};
use crate::error::{ConstraintError, LoadError, LoadResult, ParseError, StorageError, WriterError};
use crate::observability::{LoadContext, LoadObserver, RejectKind};
use crate::writer::WriterResult;
use crate::writer::storage::{DuplicateKeep, InsertOutcome};

/// Outcome of a failed build-and-check attempt for one record.
#[derive(Debug)]
pub enum RowError {
    /// Malformed record or unconvertible field. Counted.
    Parse(ParseError),
    /// Encoding, NOT NULL or storage constraint violation. Counted.
    Constraint(ConstraintError),
    /// Anything that must stop the run, interrupts included. Never counted.
    Fatal(LoadError),
}

impl RowError {
    /// Classify an error returned by a storage callback while handling `field_no` (1-based).
    pub fn from_storage(err: StorageError, record_no: u64, field_no: Option<usize>) -> Self {
        match err {
            StorageError::Interrupted(kind) => Self::Fatal(LoadError::Interrupted(kind)),
            StorageError::Io(e) => Self::Fatal(LoadError::Io(e)),
            other => Self::Parse(ParseError::new(record_no, field_no, other.to_string())),
        }
    }
}

impl From<ParseError> for RowError {
    fn from(err: ParseError) -> Self {
        Self::Parse(err)
    }
}

impl From<ConstraintError> for RowError {
    fn from(err: ConstraintError) -> Self {
        Self::Constraint(err)
    }
}

impl From<LoadError> for RowError {
    fn from(err: LoadError) -> Self {
        Self::Fatal(err)
    }
}

/// Append-only file receiving rejected records verbatim. Opened on first use.
#[derive(Debug, Default)]
pub struct BadRecordSink {
    path: Option<PathBuf>,
    file: Option<BufWriter<File>>,
    written: u64,
}

impl BadRecordSink {
    /// A sink writing to `path`, or discarding everything when `path` is `None`.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            file: None,
            written: 0,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records appended so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn append(&mut self, record: &[u8]) -> io::Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if self.file.is_none() {
            let f = OpenOptions::new().create(true).append(true).open(path)?;
            self.file = Some(BufWriter::new(f));
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(record)?;
            self.written += 1;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Counts and records parse-time rejections against `PARSE_ERRORS`.
pub struct ErrorController {
    limit: ErrorLimit,
    rejected: u64,
    verbose: bool,
    sink: BadRecordSink,
    ctx: LoadContext,
    observer: Arc<dyn LoadObserver>,
}

impl ErrorController {
    pub fn new(
        limit: ErrorLimit,
        badfile: Option<PathBuf>,
        verbose: bool,
        ctx: LoadContext,
        observer: Arc<dyn LoadObserver>,
    ) -> Self {
        Self {
            limit,
            rejected: 0,
            verbose,
            sink: BadRecordSink::new(badfile),
            ctx,
            observer,
        }
    }

    /// Run one record's attempt. Returns whether the record was accepted.
    ///
    /// A rejection that pushes the counter past the limit is still written to the bad-record
    /// file before `LoadError::ParseErrorLimit` is returned.
    pub fn attempt<F>(&mut self, record_no: u64, raw: &[u8], attempt: F) -> LoadResult<bool>
    where
        F: FnOnce() -> Result<(), RowError>,
    {
        let (kind, message) = match attempt() {
            Ok(()) => return Ok(true),
            Err(RowError::Fatal(err)) => return Err(err),
            Err(RowError::Parse(err)) => (RejectKind::Parse, err.to_string()),
            Err(RowError::Constraint(err)) => (RejectKind::Constraint, err.to_string()),
        };
        self.reject(kind, record_no, raw, &message)?;
        Ok(false)
    }

    /// Records rejected so far.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn finish(&mut self) -> LoadResult<()> {
        Ok(self.sink.flush()?)
    }

    fn reject(&mut self, kind: RejectKind, record_no: u64, raw: &[u8], message: &str) -> LoadResult<()> {
        self.rejected += 1;
        if self.verbose {
            log::warn!("{message}; record: {:?}", String::from_utf8_lossy(raw));
        } else {
            log::warn!("{message}");
        }
        self.observer.on_reject(&self.ctx, kind, record_no, message);
        self.sink.append(raw)?;

        if self.limit.exceeded_by(self.rejected) {
            self.sink.flush()?;
            return Err(LoadError::ParseErrorLimit {
                count: self.rejected,
                limit: self.limit.as_u64(),
            });
        }
        Ok(())
    }
}

/// Applies the duplicate policy to storage insert outcomes and counts them against
/// `DUPLICATE_ERRORS`.
#[derive(Debug)]
pub struct DuplicateTracker {
    policy: OnDuplicate,
    limit: ErrorLimit,
    sink: BadRecordSink,
    result: WriterResult,
}

impl DuplicateTracker {
    pub fn new(policy: OnDuplicate, limit: ErrorLimit, badfile: Option<PathBuf>) -> Self {
        Self {
            policy,
            limit,
            sink: BadRecordSink::new(badfile),
            result: WriterResult::default(),
        }
    }

    /// Which row storage keeps on a key conflict.
    pub fn keep(&self) -> DuplicateKeep {
        match self.policy {
            OnDuplicate::KeepNew => DuplicateKeep::New,
            OnDuplicate::KeepOld | OnDuplicate::Error => DuplicateKeep::Old,
        }
    }

    /// Account for one insert. `raw` is the new row's input record.
    pub fn record(&mut self, outcome: InsertOutcome, raw: &[u8]) -> Result<(), WriterError> {
        match outcome {
            InsertOutcome::Inserted => {
                self.result.inserted += 1;
                return Ok(());
            }
            InsertOutcome::DuplicateDiscarded { key } => {
                if self.policy == OnDuplicate::Error {
                    return Err(WriterError::DuplicateKey { key });
                }
                self.result.duplicate_new += 1;
                log::warn!("duplicate key value {key}: new row not loaded");
                self.sink.append(raw)?;
            }
            InsertOutcome::Replaced { key, old } => {
                self.result.duplicate_old += 1;
                log::warn!("duplicate key value {key}: existing row replaced");
                let line = old
                    .to_csv_line()
                    .map_err(|e| WriterError::Storage(e.to_string()))?;
                self.sink.append(&line)?;
            }
        }

        let count = self.result.duplicate_new + self.result.duplicate_old;
        if self.limit.exceeded_by(count) {
            self.sink.flush()?;
            return Err(WriterError::DuplicateLimit {
                count,
                limit: self.limit.as_u64(),
            });
        }
        Ok(())
    }

    pub fn result(&self) -> WriterResult {
        self.result
    }

    pub fn flush(&mut self) -> Result<(), WriterError> {
        Ok(self.sink.flush()?)
    }
}
