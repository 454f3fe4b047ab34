//! Growable byte arena holding unparsed input.
//!
//! Layout: `bytes[..cursor]` is consumed, `bytes[cursor..used]` is pending input, and one byte
//! past `used` is always kept free so a record terminator can be synthesized at end of input.
//! When the pending record reaches the end of the arena it is slid to offset 0; only a record
//! that already starts at offset 0 makes the arena grow (doubling, up to a hard maximum).

use std::io::{ErrorKind, Read};

use crate::error::{LoadError, LoadResult};

#[derive(Debug)]
pub struct RecordBuffer {
    bytes: Vec<u8>,
    used: usize,
    cursor: usize,
    max_capacity: usize,
    eof: bool,
}

impl RecordBuffer {
    /// Create an arena of `capacity` bytes that may grow up to `max_capacity`.
    pub fn new(capacity: usize, max_capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            bytes: vec![0; capacity],
            used: 0,
            cursor: 0,
            max_capacity: max_capacity.max(capacity),
            eof: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Unconsumed input, starting with the current record.
    pub fn pending(&self) -> &[u8] {
        &self.bytes[self.cursor..self.used]
    }

    /// Start of the pending input within the arena.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes between `start` and `end` of the arena. Only valid until the next `fill`.
    pub fn slice(&self, start: usize, end: usize) -> &[u8] {
        &self.bytes[start..end]
    }

    /// Whether the source has reported end of input.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Mark `n` pending bytes consumed.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.cursor + n <= self.used);
        self.cursor += n;
    }

    /// Read more input after the pending bytes, sliding or growing the arena first if it is
    /// full. Returns the number of bytes read; 0 means end of input.
    ///
    /// `record_no` is only used to report a record that outgrows the maximum size.
    pub fn fill(&mut self, source: &mut dyn Read, record_no: u64) -> LoadResult<usize> {
        if self.eof {
            return Ok(0);
        }
        self.make_room(record_no)?;

        let limit = self.bytes.len() - 1;
        loop {
            match source.read(&mut self.bytes[self.used..limit]) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(0);
                }
                Ok(n) => {
                    self.used += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Append a synthesized record terminator after the pending input.
    pub fn terminate(&mut self, terminator: u8, record_no: u64) -> LoadResult<()> {
        self.make_room(record_no)?;
        self.bytes[self.used] = terminator;
        self.used += 1;
        Ok(())
    }

    /// Guarantee at least one readable byte plus the reserved spare byte after `used`.
    fn make_room(&mut self, record_no: u64) -> LoadResult<()> {
        if self.bytes.len() - self.used >= 2 {
            return Ok(());
        }
        if self.cursor > 0 {
            self.bytes.copy_within(self.cursor..self.used, 0);
            self.used -= self.cursor;
            self.cursor = 0;
            if self.bytes.len() - self.used >= 2 {
                return Ok(());
            }
        }

        let capacity = self.bytes.len();
        if capacity >= self.max_capacity {
            return Err(LoadError::RecordTooLarge {
                record_no,
                max: self.max_capacity,
            });
        }
        let grown = capacity.saturating_mul(2).min(self.max_capacity);
        log::debug!("growing record buffer from {capacity} to {grown} bytes at record {record_no}");
        self.bytes.resize(grown, 0);
        Ok(())
    }
}
