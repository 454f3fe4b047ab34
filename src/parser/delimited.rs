//! Delimited text parser (CSV with quoting, TEXT with backslash-style escapes).
//!
//! Each record is handled in two passes. [`DelimitedParser::scan_record`] runs the quote-aware
//! automaton over the record buffer, refilling it as needed, until it finds an unquoted LF. The
//! complete record is then split into fields, so a multi-byte delimiter is only ever compared
//! against bytes that belong to the record and never against a short tail of the buffer. `SKIP`
//! uses the same scanner, which keeps newlines inside quoted fields from being counted as
//! record boundaries.

use std::io::Read;

use crate::config::DelimitedOptions;
use crate::error::{LoadError, LoadResult};

use super::buffer::RecordBuffer;
use super::{FieldSlice, RawRecord};

const TERMINATOR: u8 = b'\n';

/// Scanner state while looking for the end of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuoteState {
    Unquoted,
    InQuote,
    /// Escape byte seen inside a quoted span; the next byte is literal.
    InQuoteEscape,
    /// Escape byte seen outside quotes (TEXT mode); the next byte is literal.
    Escaped,
}

#[derive(Debug, Clone)]
struct Syntax {
    delimiter: Vec<u8>,
    quote: Option<u8>,
    escape: Option<u8>,
    null_marker: Vec<u8>,
}

impl Syntax {
    /// Escape byte distinct from the quote byte, if any.
    fn quoted_escape(&self) -> Option<u8> {
        match (self.quote, self.escape) {
            (Some(q), Some(e)) if q != e => Some(e),
            _ => None,
        }
    }
}

pub struct DelimitedParser {
    source: Box<dyn Read + Send>,
    buf: RecordBuffer,
    syntax: Syntax,
    /// Per field position: never treat the field as NULL.
    force_not_null: Vec<bool>,
    data: Vec<u8>,
    fields: Vec<FieldSlice>,
    record_no: u64,
}

impl DelimitedParser {
    pub fn new(
        source: Box<dyn Read + Send>,
        opts: &DelimitedOptions,
        force_not_null: Vec<bool>,
        buffer_size: usize,
        max_buffer_size: usize,
    ) -> Self {
        Self {
            source,
            buf: RecordBuffer::new(buffer_size, max_buffer_size),
            syntax: Syntax {
                delimiter: opts.delimiter.clone(),
                quote: opts.quote,
                escape: opts.escape,
                null_marker: opts.null_marker.clone(),
            },
            force_not_null,
            data: Vec::new(),
            fields: Vec::new(),
            record_no: 0,
        }
    }

    /// Discard the next `n` records without splitting them.
    pub fn skip(&mut self, n: u64) -> LoadResult<u64> {
        for done in 0..n {
            match self.scan_record()? {
                Some(len) => {
                    self.buf.consume(len);
                    self.record_no += 1;
                }
                None => {
                    return Err(LoadError::SkipExceedsInput {
                        requested: n,
                        found: done,
                    });
                }
            }
        }
        Ok(n)
    }

    pub fn next_record(&mut self) -> LoadResult<Option<RawRecord<'_>>> {
        let Some(len) = self.scan_record()? else {
            return Ok(None);
        };
        self.record_no += 1;

        let start = self.buf.cursor();
        self.buf.consume(len);
        let raw = self.buf.slice(start, start + len);
        split_fields(
            &self.syntax,
            &self.force_not_null,
            strip_terminator(raw),
            &mut self.data,
            &mut self.fields,
        );

        Ok(Some(RawRecord {
            number: self.record_no,
            raw,
            data: &self.data,
            fields: &self.fields,
            incomplete: None,
        }))
    }

    /// Length of the next record including its terminator, or `None` at end of input.
    fn scan_record(&mut self) -> LoadResult<Option<usize>> {
        let record_no = self.record_no + 1;
        let quoted_escape = self.syntax.quoted_escape();
        let mut pos = 0usize;
        let mut state = QuoteState::Unquoted;

        loop {
            let pending = self.buf.pending();
            while pos < pending.len() {
                let b = pending[pos];
                pos += 1;
                state = match state {
                    QuoteState::Unquoted if b == TERMINATOR => return Ok(Some(pos)),
                    QuoteState::Unquoted if Some(b) == self.syntax.quote => QuoteState::InQuote,
                    QuoteState::Unquoted if self.syntax.quote.is_none() && Some(b) == self.syntax.escape => {
                        QuoteState::Escaped
                    }
                    QuoteState::Unquoted => QuoteState::Unquoted,
                    QuoteState::InQuote if Some(b) == quoted_escape => QuoteState::InQuoteEscape,
                    QuoteState::InQuote if Some(b) == self.syntax.quote => QuoteState::Unquoted,
                    QuoteState::InQuote | QuoteState::InQuoteEscape => QuoteState::InQuote,
                    QuoteState::Escaped => QuoteState::Unquoted,
                };
            }

            if self.buf.fill(&mut *self.source, record_no)? > 0 {
                continue;
            }
            // end of input
            if pos == 0 {
                return Ok(None);
            }
            match state {
                QuoteState::InQuote | QuoteState::InQuoteEscape => {
                    return Err(LoadError::UnterminatedQuote { record_no });
                }
                // a dangling escape cannot swallow the synthesized terminator
                QuoteState::Escaped => state = QuoteState::Unquoted,
                QuoteState::Unquoted => {}
            }
            self.buf.terminate(TERMINATOR, record_no)?;
        }
    }
}

/// Drop the LF and an optional preceding CR.
fn strip_terminator(raw: &[u8]) -> &[u8] {
    let body = raw.strip_suffix(&[TERMINATOR]).unwrap_or(raw);
    body.strip_suffix(b"\r").unwrap_or(body)
}

/// Split one complete record (terminator removed) into unescaped field bytes.
fn split_fields(
    syntax: &Syntax,
    force_not_null: &[bool],
    rec: &[u8],
    data: &mut Vec<u8>,
    fields: &mut Vec<FieldSlice>,
) {
    data.clear();
    fields.clear();

    let delimiter = syntax.delimiter.as_slice();
    let quoted_escape = syntax.quoted_escape();
    let text_escape = if syntax.quote.is_none() { syntax.escape } else { None };

    let mut i = 0usize;
    let mut raw_start = 0usize;
    let mut in_quote = false;

    while i < rec.len() {
        let b = rec[i];
        let next = rec.get(i + 1).copied();

        if in_quote {
            if Some(b) == quoted_escape && (next == syntax.quote || next == quoted_escape) {
                // next is Some here because it matched a configured byte
                data.push(rec[i + 1]);
                i += 2;
            } else if Some(b) == syntax.quote {
                if quoted_escape.is_none() && next == Some(b) {
                    // doubled quote when ESCAPE is the quote byte
                    data.push(b);
                    i += 2;
                } else {
                    in_quote = false;
                    i += 1;
                }
            } else {
                data.push(b);
                i += 1;
            }
            continue;
        }

        if rec[i..].starts_with(delimiter) {
            push_field(syntax, force_not_null, &rec[raw_start..i], data, fields);
            i += delimiter.len();
            raw_start = i;
        } else if Some(b) == syntax.quote {
            in_quote = true;
            i += 1;
        } else if Some(b) == text_escape {
            match next {
                Some(escaped) => {
                    data.push(unescape_text(escaped));
                    i += 2;
                }
                None => {
                    data.push(b);
                    i += 1;
                }
            }
        } else {
            data.push(b);
            i += 1;
        }
    }
    push_field(syntax, force_not_null, &rec[raw_start..], data, fields);
}

fn push_field(
    syntax: &Syntax,
    force_not_null: &[bool],
    raw: &[u8],
    data: &[u8],
    fields: &mut Vec<FieldSlice>,
) {
    let start = fields.last().map_or(0, |f| f.end);
    let forced = force_not_null.get(fields.len()).copied().unwrap_or(false);
    fields.push(FieldSlice {
        start,
        end: data.len(),
        null: !forced && raw == syntax.null_marker.as_slice(),
    });
}

fn unescape_text(b: u8) -> u8 {
    match b {
        b'n' => b'\n',
        b'r' => b'\r',
        b't' => b'\t',
        b'b' => 0x08,
        b'f' => 0x0c,
        b'v' => 0x0b,
        other => other,
    }
}
