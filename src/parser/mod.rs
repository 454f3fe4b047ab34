//! Record parsers: turn an input [`Source`] into [`RawRecord`]s of field byte slices.
//!
//! The parser variant is picked once from [`InputFormat`] when the parser is built:
//!
//! - CSV and TEXT go through [`DelimitedParser`]
//! - FIXED goes through [`FixedWidthParser`]
//! - FUNCTION pulls rows from a [`RowSource`] through [`FunctionParser`]
//!
//! A [`RawRecord`] borrows the parser's internal buffers and is only valid until the next call
//! to [`RecordParser::next_record`].

pub mod buffer;
pub mod delimited;
pub mod fixed;
pub mod function;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::config::{InputFormat, LoadOptions};
use crate::error::{LoadError, LoadResult};
use crate::types::Schema;

pub use buffer::RecordBuffer;
pub use delimited::DelimitedParser;
pub use fixed::FixedWidthParser;
pub use function::{FunctionParser, IterRowSource, RowSource, SourceRow};

/// Where input records come from.
pub enum Source {
    /// A byte stream (file, stdin, socket, in-memory buffer).
    Reader(Box<dyn Read + Send>),
    /// Rows produced by an external function.
    Rows(Box<dyn RowSource>),
}

impl Source {
    /// Open a file as a byte source.
    pub fn from_path(path: impl AsRef<Path>) -> LoadResult<Self> {
        Ok(Self::Reader(Box::new(File::open(path)?)))
    }

    pub fn stdin() -> Self {
        Self::Reader(Box::new(std::io::stdin()))
    }

    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self::Reader(Box::new(reader))
    }

    pub fn from_rows(rows: impl RowSource + 'static) -> Self {
        Self::Rows(Box::new(rows))
    }
}

/// Position of one field inside the parser's unescaped field data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlice {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) null: bool,
}

/// One input record: its raw bytes plus its fields.
#[derive(Debug)]
pub struct RawRecord<'a> {
    pub(crate) number: u64,
    pub(crate) raw: &'a [u8],
    pub(crate) data: &'a [u8],
    pub(crate) fields: &'a [FieldSlice],
    pub(crate) incomplete: Option<String>,
}

impl<'a> RawRecord<'a> {
    /// 1-based physical record number; skipped records are counted.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// The record as read, terminator included. This is what a bad-record file receives.
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Field `idx`: `None` past the last field, `Some(None)` for NULL.
    pub fn field(&self, idx: usize) -> Option<Option<&'a [u8]>> {
        let data = self.data;
        self.fields
            .get(idx)
            .map(|f| (!f.null).then(|| &data[f.start..f.end]))
    }

    pub fn fields(&self) -> impl Iterator<Item = Option<&'a [u8]>> + '_ {
        (0..self.fields.len()).filter_map(move |i| self.field(i))
    }

    /// Why the record could not be split, for a record cut short by end of input.
    pub fn incomplete(&self) -> Option<&str> {
        self.incomplete.as_deref()
    }
}

/// The parser variant chosen for a run.
pub enum RecordParser {
    Delimited(DelimitedParser),
    Fixed(FixedWidthParser),
    Function(FunctionParser),
}

impl RecordParser {
    /// Build the parser for `options.format`, checking the options against the target schema.
    pub fn new(source: Source, options: &LoadOptions, schema: &Schema) -> LoadResult<Self> {
        match (options.format, source) {
            (InputFormat::Csv | InputFormat::Text, Source::Reader(reader)) => {
                let mut force_not_null = vec![false; schema.len()];
                for name in &options.delimited.force_not_null {
                    let idx = schema.index_of(name).ok_or_else(|| {
                        LoadError::config(format!("FORCE_NOT_NULL column \"{name}\" does not exist"))
                    })?;
                    force_not_null[idx] = true;
                }
                Ok(Self::Delimited(DelimitedParser::new(
                    reader,
                    &options.delimited,
                    force_not_null,
                    options.buffer_size,
                    options.max_buffer_size,
                )))
            }
            (InputFormat::Fixed, Source::Reader(reader)) => {
                let layout = options
                    .fixed
                    .clone()
                    .ok_or_else(|| LoadError::config("fixed-width input requires at least one COL"))?;
                if layout.fields.len() > schema.len() {
                    return Err(LoadError::config(format!(
                        "{} COL specifications for a table of {} columns",
                        layout.fields.len(),
                        schema.len()
                    )));
                }
                if let Some(col) = schema.columns[layout.fields.len()..]
                    .iter()
                    .find(|c| c.default.is_none())
                {
                    return Err(LoadError::config(format!(
                        "no COL specification or default for column \"{}\"",
                        col.name
                    )));
                }
                Ok(Self::Fixed(FixedWidthParser::new(
                    reader,
                    layout,
                    options.preserve_blanks,
                    options.buffer_size,
                    options.max_buffer_size,
                )))
            }
            (InputFormat::Function, Source::Rows(rows)) => Ok(Self::Function(FunctionParser::new(rows))),
            (InputFormat::Function, Source::Reader(_)) => {
                Err(LoadError::config("TYPE=FUNCTION requires a row source"))
            }
            (_, Source::Rows(_)) => Err(LoadError::config("a row source requires TYPE=FUNCTION")),
        }
    }

    /// Discard the first `n` records. Fails if the input holds fewer.
    pub fn skip(&mut self, n: u64) -> LoadResult<u64> {
        if n == 0 {
            return Ok(0);
        }
        match self {
            Self::Delimited(p) => p.skip(n),
            Self::Fixed(p) => p.skip(n),
            Self::Function(p) => p.skip(n),
        }
    }

    pub fn next_record(&mut self) -> LoadResult<Option<RawRecord<'_>>> {
        match self {
            Self::Delimited(p) => p.next_record(),
            Self::Fixed(p) => p.next_record(),
            Self::Function(p) => p.next_record(),
        }
    }
}
