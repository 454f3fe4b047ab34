//! Writer strategies: where accepted rows go.
//!
//! - [`DirectWriter`] inserts each row as it arrives
//! - [`BufferedWriter`] collects rows and inserts them in batches
//! - [`ParallelWriter`] ships rows over a [`crate::queue::RingQueue`] to a consumer that runs
//!   one of the other two

pub mod buffered;
pub mod direct;
pub mod parallel;
pub mod storage;

use serde::{Deserialize, Serialize};

use crate::config::{LoadOptions, WriterKind};
use crate::controller::DuplicateTracker;
use crate::error::{LoadError, LoadResult, WriterError};
use crate::types::Row;

pub use buffered::BufferedWriter;
pub use direct::DirectWriter;
pub use parallel::{ChildProcessPeer, ConsumerConfig, ConsumerReport, ParallelWriter, Peer, ThreadPeer, run_consumer};
pub use storage::{CsvFileStorage, DuplicateKeep, InsertOutcome, MemoryTable, Storage};

/// Counts reported by a writer when it is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterResult {
    /// Rows stored, replacements of an existing row not included.
    pub inserted: u64,
    /// Incoming rows discarded because their key already existed.
    pub duplicate_new: u64,
    /// Stored rows replaced by an incoming row with the same key.
    pub duplicate_old: u64,
}

/// A sink for accepted rows.
pub trait WriterStrategy {
    /// Hand over one validated row. `raw` is its input record, kept for duplicate capture.
    fn insert(&mut self, row: &Row, raw: &[u8]) -> Result<(), WriterError>;

    /// Finish the load and report counts.
    ///
    /// With `on_error` set the run is already failing: resources are released without
    /// finalizing partial output, and secondary failures are swallowed so they cannot hide the
    /// original error.
    fn close(&mut self, on_error: bool) -> Result<WriterResult, WriterError>;
}

/// Build a single-process writer over `storage` according to `options`.
///
/// The parallel strategy needs a consumer and is built through [`ParallelWriter`] instead.
pub fn local_writer(options: &LoadOptions, storage: Box<dyn Storage>) -> LoadResult<Box<dyn WriterStrategy + Send>> {
    let tracker = DuplicateTracker::new(
        options.on_duplicate,
        options.duplicate_errors,
        options.duplicate_badfile.clone(),
    );
    match options.writer {
        WriterKind::Direct => Ok(Box::new(DirectWriter::new(storage, tracker, options.truncate)?)),
        WriterKind::Buffered => Ok(Box::new(BufferedWriter::new(
            storage,
            tracker,
            options.batch_size,
            options.truncate,
        )?)),
        WriterKind::Parallel => Err(LoadError::config("the parallel writer requires a consumer")),
    }
}
