//! Load options, consumed as key/value pairs.
//!
//! The control-file syntax itself is handled elsewhere; [`LoadOptions::from_pairs`] receives the
//! already-split `(KEY, VALUE)` pairs, validates every value and fills in the per-format
//! defaults. Keys are case-insensitive and repeatable keys (`COL`, `FORCE_NOT_NULL`) accumulate.
//!
//! ```
//! use bulk_ingest::config::{InputFormat, LoadOptions, WriterKind};
//!
//! let opts = LoadOptions::from_pairs([
//!     ("TYPE", "csv"),
//!     ("DELIMITER", "|"),
//!     ("SKIP", "1"),
//!     ("PARSE_ERRORS", "INFINITE"),
//!     ("WRITER", "buffered"),
//! ])
//! .unwrap();
//! assert_eq!(opts.format, InputFormat::Csv);
//! assert_eq!(opts.delimited.delimiter, b"|".to_vec());
//! assert_eq!(opts.writer, WriterKind::Buffered);
//! ```

pub mod layout;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, LoadResult};

pub use layout::{FieldKind, FieldSpec, FixedLayout};

/// Initial record buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
/// Hard cap on record buffer growth.
pub const MAX_BUFFER_SIZE: usize = 1 << 30;
/// Rows per flush for the buffered writer.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;
/// Ring queue capacity for the parallel writer.
pub const DEFAULT_QUEUE_SIZE: usize = 1 << 20;

/// Supported input formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// Delimited text with quoting (`QUOTE`/`ESCAPE`).
    Csv,
    /// Delimited text without quoting; `ESCAPE` makes the next byte literal.
    Text,
    /// Fixed-width records described by `COL` specifications.
    Fixed,
    /// Rows produced by an external [`crate::parser::RowSource`].
    Function,
}

impl InputFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "CSV" => Some(Self::Csv),
            "TEXT" | "TSV" => Some(Self::Text),
            "FIXED" | "BINARY" => Some(Self::Fixed),
            "FUNCTION" => Some(Self::Function),
            _ => None,
        }
    }

    /// Whether records are split on a delimiter.
    pub fn is_delimited(&self) -> bool {
        matches!(self, Self::Csv | Self::Text)
    }
}

/// Writer strategy selected for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriterKind {
    /// Rows go straight to storage, one at a time.
    Direct,
    /// Rows are accumulated and flushed in batches.
    Buffered,
    /// Rows are streamed to a second process over a ring queue.
    Parallel,
}

impl WriterKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "DIRECT" => Some(Self::Direct),
            "BUFFERED" => Some(Self::Buffered),
            "PARALLEL" => Some(Self::Parallel),
            _ => None,
        }
    }
}

/// What to do when storage reports a key conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnDuplicate {
    /// Any duplicate fails the run.
    Error,
    /// Replace the existing row; the old row is rejected.
    KeepNew,
    /// Keep the existing row; the new row is rejected.
    KeepOld,
}

/// Maximum number of recoverable errors of one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorLimit {
    Limited(u64),
    Unlimited,
}

impl ErrorLimit {
    /// Parse a non-negative count, or `INFINITE`/`-1` for no limit.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("INFINITE") || value.eq_ignore_ascii_case("UNLIMITED") || value == "-1" {
            return Some(Self::Unlimited);
        }
        value.parse::<u64>().ok().map(Self::Limited)
    }

    /// Whether `count` errors is more than this limit allows.
    pub fn exceeded_by(&self, count: u64) -> bool {
        match self {
            Self::Limited(max) => count > *max,
            Self::Unlimited => false,
        }
    }

    /// Numeric limit for reporting (`u64::MAX` when unlimited).
    pub fn as_u64(&self) -> u64 {
        match self {
            Self::Limited(max) => *max,
            Self::Unlimited => u64::MAX,
        }
    }
}

impl Default for ErrorLimit {
    fn default() -> Self {
        Self::Limited(0)
    }
}

impl fmt::Display for ErrorLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(max) => write!(f, "{max}"),
            Self::Unlimited => f.write_str("INFINITE"),
        }
    }
}

/// Declared encoding of the input's character data. Storage is always UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Utf8,
    Latin1,
    /// Bytes pass through unconverted but must still be valid storage text.
    SqlAscii,
}

impl Encoding {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().replace(['-', '_'], "").as_str() {
            "UTF8" | "UNICODE" => Some(Self::Utf8),
            "LATIN1" | "ISO88591" => Some(Self::Latin1),
            "SQLASCII" => Some(Self::SqlAscii),
            _ => None,
        }
    }

    /// Whether bytes in this encoding are already storage bytes once validated.
    pub fn matches_storage(&self) -> bool {
        matches!(self, Self::Utf8 | Self::SqlAscii)
    }
}

/// Record and field syntax for the delimited formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimitedOptions {
    /// 1 to 3 byte field delimiter.
    pub delimiter: Vec<u8>,
    /// Quote byte (CSV only).
    pub quote: Option<u8>,
    /// Escape byte. In CSV it only applies inside quotes.
    pub escape: Option<u8>,
    /// Raw field content that denotes NULL.
    pub null_marker: Vec<u8>,
    /// Columns whose fields are never NULL even when they match the marker.
    pub force_not_null: Vec<String>,
}

impl DelimitedOptions {
    /// Defaults for CSV: `,` delimiter, `"` quote and escape, empty NULL marker.
    pub fn csv() -> Self {
        Self {
            delimiter: b",".to_vec(),
            quote: Some(b'"'),
            escape: Some(b'"'),
            null_marker: Vec::new(),
            force_not_null: Vec::new(),
        }
    }

    /// Defaults for TEXT: tab delimiter, `\` escape, `\N` NULL marker.
    pub fn text() -> Self {
        Self {
            delimiter: b"\t".to_vec(),
            quote: None,
            escape: Some(b'\\'),
            null_marker: b"\\N".to_vec(),
            force_not_null: Vec::new(),
        }
    }
}

/// Every option of one load, validated.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub format: InputFormat,
    pub writer: WriterKind,
    pub delimited: DelimitedOptions,
    /// Present when `format` is [`InputFormat::Fixed`].
    pub fixed: Option<FixedLayout>,
    pub preserve_blanks: bool,
    /// Records discarded before parsing starts.
    pub skip: u64,
    /// Maximum number of records processed after skipping.
    pub limit: Option<u64>,
    pub parse_errors: ErrorLimit,
    pub duplicate_errors: ErrorLimit,
    pub on_duplicate: OnDuplicate,
    pub parse_badfile: Option<PathBuf>,
    pub duplicate_badfile: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
    pub encoding: Encoding,
    /// Run the storage collaborator's general constraint check on each row.
    pub check_constraints: bool,
    pub truncate: bool,
    /// Log every rejected record instead of only the totals.
    pub verbose: bool,
    pub buffer_size: usize,
    pub max_buffer_size: usize,
    pub batch_size: usize,
    pub queue_size: usize,
    /// Upper bound on one blocked queue write before peer liveness is re-checked.
    pub queue_write_timeout: Duration,
    /// Consecutive timed-out queue writes tolerated while the peer is alive.
    pub queue_max_stalls: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            format: InputFormat::Csv,
            writer: WriterKind::Direct,
            delimited: DelimitedOptions::csv(),
            fixed: None,
            preserve_blanks: false,
            skip: 0,
            limit: None,
            parse_errors: ErrorLimit::default(),
            duplicate_errors: ErrorLimit::default(),
            on_duplicate: OnDuplicate::KeepNew,
            parse_badfile: None,
            duplicate_badfile: None,
            logfile: None,
            encoding: Encoding::Utf8,
            check_constraints: false,
            truncate: false,
            verbose: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_buffer_size: MAX_BUFFER_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            queue_size: DEFAULT_QUEUE_SIZE,
            queue_write_timeout: Duration::from_secs(10),
            queue_max_stalls: 6,
        }
    }
}

impl LoadOptions {
    /// Build options from `(KEY, VALUE)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> LoadResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut raw = RawOptions::default();
        for (key, value) in pairs {
            raw.set(key.as_ref(), value.as_ref())?;
        }
        raw.finish()
    }
}

/// Options as given, before per-format defaults are applied.
#[derive(Default)]
struct RawOptions {
    format: Option<InputFormat>,
    writer: Option<WriterKind>,
    delimiter: Option<Vec<u8>>,
    quote: Option<Vec<u8>>,
    escape: Option<Vec<u8>>,
    null_marker: Option<Vec<u8>>,
    force_not_null: Vec<String>,
    cols: Vec<String>,
    stride: Option<usize>,
    preserve_blanks: Option<bool>,
    skip: Option<u64>,
    limit: Option<u64>,
    parse_errors: Option<ErrorLimit>,
    duplicate_errors: Option<ErrorLimit>,
    on_duplicate: Option<OnDuplicate>,
    parse_badfile: Option<PathBuf>,
    duplicate_badfile: Option<PathBuf>,
    logfile: Option<PathBuf>,
    encoding: Option<Encoding>,
    check_constraints: Option<bool>,
    truncate: Option<bool>,
    verbose: Option<bool>,
    buffer_size: Option<usize>,
    batch_size: Option<usize>,
    queue_size: Option<usize>,
}

impl RawOptions {
    fn set(&mut self, key: &str, value: &str) -> LoadResult<()> {
        let key = key.trim().to_ascii_uppercase();
        let invalid = || LoadError::config(format!("invalid value for {key}: '{value}'"));
        match key.as_str() {
            "TYPE" => self.format = Some(InputFormat::from_name(value.trim()).ok_or_else(invalid)?),
            "WRITER" | "LOADER" => self.writer = Some(WriterKind::from_name(value.trim()).ok_or_else(invalid)?),
            "MULTI_PROCESS" => {
                if parse_bool(value).ok_or_else(invalid)? {
                    self.writer = Some(WriterKind::Parallel);
                }
            }
            "DELIMITER" => self.delimiter = Some(value.as_bytes().to_vec()),
            "QUOTE" => self.quote = Some(value.as_bytes().to_vec()),
            "ESCAPE" => self.escape = Some(value.as_bytes().to_vec()),
            "NULL" => self.null_marker = Some(value.as_bytes().to_vec()),
            "FORCE_NOT_NULL" => self.force_not_null.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            ),
            "COL" => self.cols.push(value.to_string()),
            "STRIDE" => self.stride = Some(parse_count(value).ok_or_else(invalid)?),
            "PRESERVE_BLANKS" => self.preserve_blanks = Some(parse_bool(value).ok_or_else(invalid)?),
            "SKIP" | "OFFSET" => self.skip = Some(value.trim().parse().map_err(|_| invalid())?),
            "LIMIT" | "LOAD" => {
                self.limit = match ErrorLimit::parse(value).ok_or_else(invalid)? {
                    ErrorLimit::Limited(n) => Some(n),
                    ErrorLimit::Unlimited => None,
                }
            }
            "PARSE_ERRORS" | "MAX_ERR_CNT" => self.parse_errors = Some(ErrorLimit::parse(value).ok_or_else(invalid)?),
            "DUPLICATE_ERRORS" => self.duplicate_errors = Some(ErrorLimit::parse(value).ok_or_else(invalid)?),
            "ON_DUPLICATE_KEEP" => {
                self.on_duplicate = Some(match value.trim().to_ascii_uppercase().as_str() {
                    "NEW" => OnDuplicate::KeepNew,
                    "OLD" => OnDuplicate::KeepOld,
                    _ => return Err(invalid()),
                })
            }
            "ON_DUPLICATE" => {
                self.on_duplicate = Some(match value.trim().to_ascii_uppercase().as_str() {
                    "ERROR" => OnDuplicate::Error,
                    "KEEP_NEW" => OnDuplicate::KeepNew,
                    "KEEP_OLD" => OnDuplicate::KeepOld,
                    _ => return Err(invalid()),
                })
            }
            "PARSE_BADFILE" => self.parse_badfile = Some(PathBuf::from(value.trim())),
            "DUPLICATE_BADFILE" => self.duplicate_badfile = Some(PathBuf::from(value.trim())),
            "LOGFILE" => self.logfile = Some(PathBuf::from(value.trim())),
            "ENCODING" => self.encoding = Some(Encoding::from_name(value.trim()).ok_or_else(invalid)?),
            "CHECK_CONSTRAINTS" => self.check_constraints = Some(parse_bool(value).ok_or_else(invalid)?),
            "TRUNCATE" => self.truncate = Some(parse_bool(value).ok_or_else(invalid)?),
            "VERBOSE" => self.verbose = Some(parse_bool(value).ok_or_else(invalid)?),
            "BUFFER_SIZE" => self.buffer_size = Some(parse_count(value).ok_or_else(invalid)?),
            "BATCH_SIZE" => self.batch_size = Some(parse_count(value).ok_or_else(invalid)?),
            "QUEUE_SIZE" => self.queue_size = Some(parse_count(value).ok_or_else(invalid)?),
            _ => return Err(LoadError::config(format!("unrecognized option '{key}'"))),
        }
        Ok(())
    }

    fn finish(self) -> LoadResult<LoadOptions> {
        let defaults = LoadOptions::default();
        let format = self.format.unwrap_or(InputFormat::Csv);

        let mut delimited = match format {
            InputFormat::Text => DelimitedOptions::text(),
            _ => DelimitedOptions::csv(),
        };
        if format.is_delimited() {
            if let Some(delimiter) = self.delimiter {
                delimited.delimiter = delimiter;
            }
            if let Some(quote) = self.quote {
                if format == InputFormat::Text {
                    return Err(LoadError::config("QUOTE is only available in CSV mode"));
                }
                delimited.quote = Some(single_byte("QUOTE", &quote)?);
                // ESCAPE follows QUOTE unless given explicitly.
                delimited.escape = delimited.quote;
            }
            if let Some(escape) = self.escape {
                delimited.escape = Some(single_byte("ESCAPE", &escape)?);
            }
            if let Some(null_marker) = self.null_marker {
                delimited.null_marker = null_marker;
            }
            delimited.force_not_null = self.force_not_null;
            validate_delimited(&delimited)?;
        } else {
            let given = [
                ("DELIMITER", self.delimiter.is_some()),
                ("QUOTE", self.quote.is_some()),
                ("ESCAPE", self.escape.is_some()),
                ("NULL", self.null_marker.is_some()),
                ("FORCE_NOT_NULL", !self.force_not_null.is_empty()),
            ];
            if let Some((name, _)) = given.iter().find(|(_, set)| *set) {
                return Err(LoadError::config(format!("{name} is only available for delimited input")));
            }
        }

        let fixed = match format {
            InputFormat::Fixed => Some(FixedLayout::parse(&self.cols, self.stride)?),
            _ if !self.cols.is_empty() || self.stride.is_some() => {
                return Err(LoadError::config("COL and STRIDE are only available for fixed-width input"));
            }
            _ => None,
        };

        let buffer_size = self.buffer_size.unwrap_or(defaults.buffer_size);
        let queue_size = self.queue_size.unwrap_or(defaults.queue_size);
        if queue_size < 16 {
            return Err(LoadError::config(format!("QUEUE_SIZE {queue_size} is too small")));
        }

        Ok(LoadOptions {
            format,
            writer: self.writer.unwrap_or(defaults.writer),
            delimited,
            fixed,
            preserve_blanks: self.preserve_blanks.unwrap_or(false),
            skip: self.skip.unwrap_or(0),
            limit: self.limit,
            parse_errors: self.parse_errors.unwrap_or_default(),
            duplicate_errors: self.duplicate_errors.unwrap_or_default(),
            on_duplicate: self.on_duplicate.unwrap_or(defaults.on_duplicate),
            parse_badfile: self.parse_badfile,
            duplicate_badfile: self.duplicate_badfile,
            logfile: self.logfile,
            encoding: self.encoding.unwrap_or(Encoding::Utf8),
            check_constraints: self.check_constraints.unwrap_or(false),
            truncate: self.truncate.unwrap_or(false),
            verbose: self.verbose.unwrap_or(false),
            buffer_size,
            max_buffer_size: defaults.max_buffer_size.max(buffer_size),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            queue_size,
            queue_write_timeout: defaults.queue_write_timeout,
            queue_max_stalls: defaults.queue_max_stalls,
        })
    }
}

/// Check the delimited-format invariants between delimiter, quote, escape and NULL marker.
pub fn validate_delimited(opts: &DelimitedOptions) -> LoadResult<()> {
    let delim = &opts.delimiter;
    if delim.is_empty() || delim.len() > 3 {
        return Err(LoadError::config("DELIMITER must be 1 to 3 bytes"));
    }
    if delim.iter().any(|b| matches!(b, b'\r' | b'\n')) {
        return Err(LoadError::config("DELIMITER cannot contain newline or carriage return"));
    }
    if delim
        .iter()
        .any(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'\\')
    {
        return Err(LoadError::config(
            "DELIMITER cannot contain lower-case letters, digits or backslash",
        ));
    }
    if opts.null_marker.iter().any(|b| matches!(b, b'\r' | b'\n')) {
        return Err(LoadError::config("NULL cannot contain newline or carriage return"));
    }
    if contains(&opts.null_marker, delim) || contains(delim, &opts.null_marker) {
        return Err(LoadError::config("NULL must not overlap the DELIMITER"));
    }
    if let Some(quote) = opts.quote {
        if delim.contains(&quote) {
            return Err(LoadError::config("DELIMITER and QUOTE must be different"));
        }
        if matches!(quote, b'\r' | b'\n') {
            return Err(LoadError::config("QUOTE cannot be newline or carriage return"));
        }
    }
    if let Some(escape) = opts.escape {
        if delim.contains(&escape) {
            return Err(LoadError::config("DELIMITER and ESCAPE must be different"));
        }
        if matches!(escape, b'\r' | b'\n') {
            return Err(LoadError::config("ESCAPE cannot be newline or carriage return"));
        }
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn single_byte(name: &str, value: &[u8]) -> LoadResult<u8> {
    match value {
        [b] => Ok(*b),
        _ => Err(LoadError::config(format!("{name} must be a single one-byte character"))),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_uppercase().as_str() {
        "YES" | "TRUE" | "ON" | "1" => Some(true),
        "NO" | "FALSE" | "OFF" | "0" => Some(false),
        _ => None,
    }
}

fn parse_count(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|n| *n > 0)
}
