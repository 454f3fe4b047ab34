use std::fmt;

use thiserror::Error;

use crate::pipeline::RunSummary;

/// Convenience result type for load operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// Kind of administrative interrupt that stopped a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// The caller asked for the load to stop.
    Cancelled,
    /// The host is shutting down.
    Shutdown,
}

impl fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("canceling statement due to user request"),
            Self::Shutdown => f.write_str("terminating load due to administrator command"),
        }
    }
}

/// Run-level error. Anything that reaches the top of the pipeline as a `LoadError` stops the run.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Underlying I/O error on the input, a bad-record file or the log file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid option value, field layout or schema/option mismatch.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// A single record did not fit in the largest allowed record buffer.
    #[error("record {record_no} exceeds the maximum buffer size of {max} bytes")]
    RecordTooLarge { record_no: u64, max: usize },

    /// End of input was reached inside a quoted field.
    #[error("unterminated quoted field in record {record_no}")]
    UnterminatedQuote { record_no: u64 },

    /// `SKIP` asked for more records than the input holds.
    #[error("cannot skip {requested} records: input holds only {found}")]
    SkipExceedsInput { requested: u64, found: u64 },

    /// Shutdown or cancellation. Never counted, always propagated.
    #[error("{0}")]
    Interrupted(InterruptKind),

    /// The parse error counter went past its limit.
    #[error("too many parse errors: {count} (limit {limit})")]
    ParseErrorLimit { count: u64, limit: u64 },

    /// Error raised by an external row source.
    #[error("row source failed: {message}")]
    Source { message: String },

    /// Writer or transport failure.
    #[error(transparent)]
    Writer(#[from] WriterError),

    /// Ring queue failure outside of a writer.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl LoadError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// `true` for errors caused by a shutdown or cancellation request.
    pub fn is_interrupt(&self) -> bool {
        match self {
            Self::Interrupted(_) => true,
            Self::Writer(WriterError::Interrupted(_)) => true,
            Self::Writer(WriterError::Queue(QueueError::Interrupted(_))) => true,
            Self::Queue(QueueError::Interrupted(_)) => true,
            _ => false,
        }
    }
}

/// Malformed input detected while splitting or converting one record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", describe_location(.record_no, .field_no, .detail))]
pub struct ParseError {
    /// 1-based physical record number (skipped records included).
    pub record_no: u64,
    /// 1-based field number, when the failure is tied to one field.
    pub field_no: Option<usize>,
    pub detail: String,
}

impl ParseError {
    pub fn new(record_no: u64, field_no: Option<usize>, detail: impl Into<String>) -> Self {
        Self {
            record_no,
            field_no,
            detail: detail.into(),
        }
    }
}

fn describe_location(record_no: &u64, field_no: &Option<usize>, detail: &str) -> String {
    match field_no {
        Some(field) => format!("record {record_no}, column {field}: {detail}"),
        None => format!("record {record_no}: {detail}"),
    }
}

/// Which row constraint failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Character data is not valid in the input or storage encoding.
    Encoding(String),
    /// NULL in a NOT NULL column.
    NotNull,
    /// The storage collaborator rejected the row.
    Check(String),
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encoding(msg) => write!(f, "invalid byte sequence: {msg}"),
            Self::NotNull => f.write_str("null value violates not-null constraint"),
            Self::Check(msg) => write!(f, "row violates constraint: {msg}"),
        }
    }
}

/// A converted row that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", describe_constraint(.record_no, .column, .kind))]
pub struct ConstraintError {
    pub record_no: u64,
    /// 0-based column index, when known.
    pub column: Option<usize>,
    pub kind: ConstraintKind,
}

fn describe_constraint(record_no: &u64, column: &Option<usize>, kind: &ConstraintKind) -> String {
    describe_location(record_no, &column.map(|c| c + 1), &kind.to_string())
}

/// Errors reported by the storage collaborator callbacks.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The value or row is not acceptable.
    #[error("{0}")]
    Invalid(String),

    /// The callback observed a shutdown or cancellation.
    #[error("{0}")]
    Interrupted(InterruptKind),

    /// Storage-side I/O failure.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage-side CSV encoding failure.
    #[error("storage csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Writer and transport errors. All of these are fatal for the run.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("{0}")]
    Interrupted(InterruptKind),

    /// A duplicate key was found and the policy is to error.
    #[error("duplicate key value in row: {key}")]
    DuplicateKey { key: String },

    /// The duplicate error counter went past its limit.
    #[error("too many duplicate errors: {count} (limit {limit})")]
    DuplicateLimit { count: u64, limit: u64 },

    /// Writing to the duplicate bad-record file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode row frame: {0}")]
    Encode(#[from] bincode::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The consumer process is gone.
    #[error("loader process terminated unexpectedly")]
    PeerGone,

    /// The consumer did not drain the queue within the allowed number of timeouts.
    #[error("loader process stalled: queue stayed full for {stalls} write attempts")]
    PeerStalled { stalls: u32 },

    /// The consumer reported a failure.
    #[error("loader process failed: {0}")]
    Remote(String),

    /// Writer used after `close`.
    #[error("writer is already closed")]
    Closed,
}

impl From<StorageError> for WriterError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Interrupted(kind) => Self::Interrupted(kind),
            StorageError::Io(e) => Self::Io(e),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Ring queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue io error: {0}")]
    Io(#[from] std::io::Error),

    /// The segment does not carry the expected magic/version tag.
    #[error("shared segment {key} is not a ring queue (magic {found:#010x})")]
    BadMagic { key: u64, found: u32 },

    /// A read or write request of `capacity` bytes or more. Programming error.
    #[error("queue request of {requested} bytes does not fit capacity {capacity}")]
    TooLarge { requested: usize, capacity: usize },

    #[error("queue capacity {0} is too small")]
    InvalidCapacity(usize),

    #[error("{0}")]
    Interrupted(InterruptKind),

    /// The process on the other end of the queue no longer exists.
    #[error("queue peer process {pid} is gone")]
    PeerGone { pid: u32 },

    /// Read or write on a side that was already closed.
    #[error("ring queue {key} is closed")]
    Closed { key: u64 },
}

/// A failed run: the error that stopped it plus everything counted up to that point.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct LoadFailure {
    pub summary: RunSummary,
    #[source]
    pub error: LoadError,
}
