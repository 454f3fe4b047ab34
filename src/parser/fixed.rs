//! Fixed-width parser: every record is exactly `stride` bytes.
//!
//! Field bytes are never modified in the record buffer. Character fields are copied into the
//! field data area (trailing blanks trimmed for CHAR), binary numbers are rendered there as
//! text, so the row builder converts every format through the same entry point.

use std::io::Read;

use crate::config::{FieldKind, FieldSpec, FixedLayout};
use crate::error::{LoadError, LoadResult};

use super::buffer::RecordBuffer;
use super::{FieldSlice, RawRecord};

pub struct FixedWidthParser {
    source: Box<dyn Read + Send>,
    buf: RecordBuffer,
    layout: FixedLayout,
    preserve_blanks: bool,
    data: Vec<u8>,
    fields: Vec<FieldSlice>,
    record_no: u64,
}

impl FixedWidthParser {
    pub fn new(
        source: Box<dyn Read + Send>,
        layout: FixedLayout,
        preserve_blanks: bool,
        buffer_size: usize,
        max_buffer_size: usize,
    ) -> Self {
        // one spare byte is kept free by the buffer
        let min = layout.stride + 1;
        Self {
            source,
            buf: RecordBuffer::new(buffer_size.max(min), max_buffer_size.max(min)),
            layout,
            preserve_blanks,
            data: Vec::new(),
            fields: Vec::with_capacity(8),
            record_no: 0,
        }
    }

    pub fn skip(&mut self, n: u64) -> LoadResult<u64> {
        let stride = self.layout.stride;
        for done in 0..n {
            if self.fill_record()? < stride {
                return Err(LoadError::SkipExceedsInput {
                    requested: n,
                    found: done,
                });
            }
            self.buf.consume(stride);
            self.record_no += 1;
        }
        Ok(n)
    }

    pub fn next_record(&mut self) -> LoadResult<Option<RawRecord<'_>>> {
        let stride = self.layout.stride;
        let len = self.fill_record()?;
        if len == 0 {
            return Ok(None);
        }
        self.record_no += 1;

        let start = self.buf.cursor();
        self.buf.consume(len);
        let raw = self.buf.slice(start, start + len);

        self.data.clear();
        self.fields.clear();
        let incomplete = if len < stride {
            Some(format!("incomplete record: {len} of {stride} bytes"))
        } else {
            for spec in &self.layout.fields {
                let bytes = &raw[spec.offset..spec.end()];
                let null = decode_field(spec, bytes, self.preserve_blanks, &mut self.data);
                let start = self.fields.last().map_or(0, |f| f.end);
                self.fields.push(FieldSlice {
                    start,
                    end: self.data.len(),
                    null,
                });
            }
            None
        };

        Ok(Some(RawRecord {
            number: self.record_no,
            raw,
            data: &self.data,
            fields: &self.fields,
            incomplete,
        }))
    }

    /// Buffer up to one full record. Returns the bytes available, less than the stride only at
    /// end of input.
    fn fill_record(&mut self) -> LoadResult<usize> {
        let stride = self.layout.stride;
        loop {
            let have = self.buf.pending().len();
            if have >= stride {
                return Ok(stride);
            }
            if self.buf.fill(&mut *self.source, self.record_no + 1)? == 0 {
                return Ok(have);
            }
        }
    }
}

/// Append the field's text form to `data`. Returns whether the field is NULL.
fn decode_field(spec: &FieldSpec, bytes: &[u8], preserve_blanks: bool, data: &mut Vec<u8>) -> bool {
    if let Some(pattern) = spec.nullif.as_deref() {
        if nullif_matches(spec.kind, bytes, pattern) {
            return true;
        }
    }

    match spec.kind {
        FieldKind::Char if preserve_blanks => data.extend_from_slice(bytes),
        FieldKind::Char => data.extend_from_slice(trim_blanks(bytes)),
        FieldKind::Varchar => data.extend_from_slice(bytes),
        FieldKind::Integer => data.extend_from_slice(read_signed(bytes).to_string().as_bytes()),
        FieldKind::Unsigned => data.extend_from_slice(read_unsigned(bytes).to_string().as_bytes()),
        FieldKind::Float => data.extend_from_slice(render_float(bytes).as_bytes()),
    }
    false
}

fn nullif_matches(kind: FieldKind, bytes: &[u8], pattern: &[u8]) -> bool {
    bytes == pattern || (kind.is_character() && trim_blanks(bytes) == trim_blanks(pattern))
}

fn trim_blanks(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|b| *b != b' ').map_or(0, |i| i + 1);
    &bytes[..end]
}

fn read_unsigned(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

fn read_signed(bytes: &[u8]) -> i64 {
    let shift = 64 - 8 * bytes.len() as u32;
    // sign-extend from the field width
    ((read_unsigned(bytes) << shift) as i64) >> shift
}

fn render_float(bytes: &[u8]) -> String {
    if let Ok(word) = <[u8; 4]>::try_from(bytes) {
        f32::from_le_bytes(word).to_string()
    } else {
        f64::from_bits(read_unsigned(bytes)).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(input: Vec<u8>, specs: &[&str], stride: Option<usize>, buffer: usize) -> FixedWidthParser {
        let layout = FixedLayout::parse(specs, stride).unwrap();
        FixedWidthParser::new(Box::new(std::io::Cursor::new(input)), layout, false, buffer, 1 << 20)
    }

    fn fields(rec: &RawRecord<'_>) -> Vec<Option<String>> {
        rec.fields()
            .map(|f| f.map(|b| String::from_utf8_lossy(b).into_owned()))
            .collect()
    }

    #[test]
    fn char_trims_and_varchar_keeps_blanks() {
        let mut p = parser(b"ab  cd  ".to_vec(), &["CHAR(4)", "VARCHAR(4)"], None, 64);
        let rec = p.next_record().unwrap().unwrap();
        assert_eq!(fields(&rec), vec![Some("ab".into()), Some("cd  ".into())]);
    }

    #[test]
    fn preserve_blanks_keeps_char_padding() {
        let layout = FixedLayout::parse(&["CHAR(4)"], None).unwrap();
        let mut p = FixedWidthParser::new(Box::new(&b"ab  "[..]), layout, true, 64, 1 << 20);
        let rec = p.next_record().unwrap().unwrap();
        assert_eq!(rec.field(0), Some(Some(&b"ab  "[..])));
    }

    #[test]
    fn binary_numbers_render_as_text() {
        let mut input = Vec::new();
        input.extend_from_slice(&(-2i16).to_le_bytes());
        input.extend_from_slice(&70_000i32.to_le_bytes());
        input.extend_from_slice(&u16::MAX.to_le_bytes());
        input.extend_from_slice(&1.5f32.to_le_bytes());
        input.extend_from_slice(&(-0.25f64).to_le_bytes());
        let mut p = parser(
            input,
            &["SMALLINT", "INTEGER", "UNSIGNED SMALLINT", "FLOAT", "DOUBLE"],
            None,
            64,
        );
        let rec = p.next_record().unwrap().unwrap();
        assert_eq!(
            fields(&rec),
            vec![
                Some("-2".into()),
                Some("70000".into()),
                Some("65535".into()),
                Some("1.5".into()),
                Some("-0.25".into()),
            ]
        );
    }

    #[test]
    fn nullif_matches_exact_or_trimmed_character_fields() {
        let mut input = b"N/A \x00\x00".to_vec();
        input.extend_from_slice(b"ok  \x01\x00");
        let mut p = parser(input, &["CHAR(4) NULLIF 'N/A'", "SMALLINT NULLIF 0000"], None, 64);

        let rec = p.next_record().unwrap().unwrap();
        assert_eq!(fields(&rec), vec![None, None]);
        let rec = p.next_record().unwrap().unwrap();
        assert_eq!(fields(&rec), vec![Some("ok".into()), Some("1".into())]);
    }

    #[test]
    fn stride_padding_is_ignored_and_refill_is_seamless() {
        let input = b"aaaa--bbbb--cccc--".to_vec();
        // buffer smaller than two records forces slides mid-record
        let mut p = parser(input, &["CHAR(4)"], Some(6), 8);
        let mut seen = Vec::new();
        while let Some(rec) = p.next_record().unwrap() {
            seen.push(fields(&rec));
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], vec![Some("cccc".into())]);
    }

    #[test]
    fn trailing_partial_record_is_flagged() {
        let mut p = parser(b"abcdab".to_vec(), &["CHAR(4)"], None, 64);
        assert!(p.next_record().unwrap().unwrap().incomplete().is_none());
        let rec = p.next_record().unwrap().unwrap();
        assert_eq!(rec.number(), 2);
        assert_eq!(rec.raw(), b"ab");
        assert_eq!(rec.incomplete(), Some("incomplete record: 2 of 4 bytes"));
        assert!(p.next_record().unwrap().is_none());
    }

    #[test]
    fn skip_counts_whole_records_only() {
        let mut p = parser(b"aaaabbbbcc".to_vec(), &["CHAR(4)"], None, 64);
        let err = p.skip(3).unwrap_err();
        assert!(matches!(err, LoadError::SkipExceedsInput { requested: 3, found: 2 }));

        let mut p = parser(b"aaaabbbb".to_vec(), &["CHAR(4)"], None, 64);
        p.skip(1).unwrap();
        assert_eq!(p.next_record().unwrap().unwrap().raw(), b"bbbb");
    }
}
