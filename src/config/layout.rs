//! Fixed-width field layout: `COL` specifications and the record stride.
//!
//! Accepted forms (one per `COL` option, in column order):
//!
//! ```text
//! CHAR(10)              10 bytes following the previous field
//! INTEGER(11:14)        bytes 11..=14 of the record (1-based, inclusive)
//! DOUBLE(20+8)          8 bytes at 0-based offset 20
//! SMALLINT              2 bytes following the previous field
//! VARCHAR(5) NULLIF 'N/A'
//! CHAR(4) NULLIF 20202020
//! ```

use crate::error::{LoadError, LoadResult};

/// How the bytes of a fixed-width field are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Character data; trailing blanks are trimmed unless blanks are preserved.
    Char,
    /// Character data kept verbatim.
    Varchar,
    /// Little-endian two's complement integer of the field's length (1, 2, 4 or 8 bytes).
    Integer,
    /// Little-endian unsigned integer of the field's length (1, 2, 4 or 8 bytes).
    Unsigned,
    /// Little-endian IEEE float of the field's length (4 or 8 bytes).
    Float,
}

impl FieldKind {
    pub fn is_character(&self) -> bool {
        matches!(self, Self::Char | Self::Varchar)
    }
}

/// One field of a fixed-width record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    /// 0-based byte offset within the record.
    pub offset: usize,
    pub length: usize,
    /// Raw byte pattern that marks the field NULL.
    pub nullif: Option<Vec<u8>>,
}

impl FieldSpec {
    /// One past the last byte of the field.
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Field layout plus record stride for the fixed-width parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedLayout {
    pub fields: Vec<FieldSpec>,
    /// Bytes per record.
    pub stride: usize,
}

impl FixedLayout {
    /// Parse `COL` specifications in order. Fields without an explicit offset follow the
    /// previous field. When `stride` is `None` the record ends after the last field.
    pub fn parse<S: AsRef<str>>(specs: &[S], stride: Option<usize>) -> LoadResult<Self> {
        let mut fields = Vec::with_capacity(specs.len());
        let mut next_offset = 0usize;
        for (idx, spec) in specs.iter().enumerate() {
            let field = parse_field_spec(spec.as_ref(), next_offset).map_err(|message| {
                LoadError::config(format!("COL {}: {message} in '{}'", idx + 1, spec.as_ref()))
            })?;
            next_offset = field.end();
            fields.push(field);
        }
        Self::new(fields, stride)
    }

    /// Validate a layout built programmatically.
    pub fn new(fields: Vec<FieldSpec>, stride: Option<usize>) -> LoadResult<Self> {
        if fields.is_empty() {
            return Err(LoadError::config("fixed-width input requires at least one COL"));
        }
        if let Some(pos) = fields.iter().position(|f| f.offset.checked_add(f.length).is_none()) {
            return Err(LoadError::config(format!("COL {}: field range out of bounds", pos + 1)));
        }
        let extent = fields.iter().map(FieldSpec::end).max().unwrap_or(0);
        let stride = stride.unwrap_or(extent);
        if stride == 0 {
            return Err(LoadError::config("STRIDE must be positive"));
        }
        if extent > stride {
            return Err(LoadError::config(format!(
                "field layout needs {extent} bytes but STRIDE is {stride}"
            )));
        }

        let mut ranges: Vec<(usize, usize, usize)> = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.offset, f.end(), i + 1))
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            let (_, prev_end, prev_col) = pair[0];
            let (start, _, col) = pair[1];
            if start < prev_end {
                return Err(LoadError::config(format!(
                    "COL {col} overlaps COL {prev_col}"
                )));
            }
        }

        Ok(Self { fields, stride })
    }
}

fn parse_field_spec(spec: &str, next_offset: usize) -> Result<FieldSpec, String> {
    let mut rest = spec.trim();

    let (word, tail) = take_word(rest);
    if word.is_empty() {
        return Err("missing field type".to_string());
    }
    rest = tail;
    let mut type_name = word.to_ascii_uppercase();
    if type_name == "UNSIGNED" {
        let (next, tail) = take_word(rest);
        if !next.is_empty() && !next.eq_ignore_ascii_case("NULLIF") {
            type_name = format!("UNSIGNED {}", next.to_ascii_uppercase());
            rest = tail;
        }
    }

    let (kind, default_len) = match type_name.as_str() {
        "CHAR" | "CHARACTER" => (FieldKind::Char, None),
        "VARCHAR" => (FieldKind::Varchar, None),
        "INTEGER" | "INT" => (FieldKind::Integer, Some(4)),
        "SMALLINT" => (FieldKind::Integer, Some(2)),
        "BIGINT" => (FieldKind::Integer, Some(8)),
        "UNSIGNED" | "UNSIGNED INTEGER" | "UNSIGNED INT" => (FieldKind::Unsigned, Some(4)),
        "UNSIGNED SMALLINT" => (FieldKind::Unsigned, Some(2)),
        "UNSIGNED BIGINT" => (FieldKind::Unsigned, Some(8)),
        "FLOAT" | "REAL" => (FieldKind::Float, Some(4)),
        "DOUBLE" => (FieldKind::Float, Some(8)),
        other => return Err(format!("unknown field type '{other}'")),
    };

    let (offset, length) = if let Some(inner) = rest.strip_prefix('(') {
        let close = inner.find(')').ok_or("missing ')'")?;
        let range = parse_range(&inner[..close], next_offset)?;
        rest = inner[close + 1..].trim_start();
        range
    } else {
        let length = default_len.ok_or("field length is required")?;
        (next_offset, length)
    };

    if length == 0 {
        return Err("field length must be positive".to_string());
    }
    if offset.checked_add(length).is_none() {
        return Err("field range out of bounds".to_string());
    }
    match kind {
        FieldKind::Integer | FieldKind::Unsigned if !matches!(length, 1 | 2 | 4 | 8) => {
            return Err(format!("integer length must be 1, 2, 4 or 8, not {length}"));
        }
        FieldKind::Float if !matches!(length, 4 | 8) => {
            return Err(format!("float length must be 4 or 8, not {length}"));
        }
        _ => {}
    }

    let nullif = if rest.is_empty() {
        None
    } else {
        let (word, tail) = take_word(rest);
        if !word.eq_ignore_ascii_case("NULLIF") {
            return Err(format!("unexpected '{rest}'"));
        }
        Some(parse_pattern(tail.trim())?)
    };

    Ok(FieldSpec {
        kind,
        offset,
        length,
        nullif,
    })
}

fn take_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    let end = s
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    (&s[..end], s[end..].trim_start())
}

fn parse_range(inner: &str, next_offset: usize) -> Result<(usize, usize), String> {
    let number = |s: &str| {
        s.trim()
            .parse::<usize>()
            .map_err(|_| format!("invalid number '{}'", s.trim()))
    };

    if let Some((begin, end)) = inner.split_once(':') {
        let begin = number(begin)?;
        let end = number(end)?;
        if begin == 0 || end < begin {
            return Err(format!("invalid range {begin}:{end}"));
        }
        Ok((begin - 1, end - begin + 1))
    } else if let Some((offset, length)) = inner.split_once('+') {
        Ok((number(offset)?, number(length)?))
    } else {
        Ok((next_offset, number(inner)?))
    }
}

/// A quoted literal (`'abc'`, `''` escapes a quote) or an even-length run of hex digits.
fn parse_pattern(s: &str) -> Result<Vec<u8>, String> {
    if s.is_empty() {
        return Err("NULLIF requires a pattern".to_string());
    }
    let first = s.as_bytes()[0];
    if first == b'\'' || first == b'"' {
        let quote = first as char;
        let body = s[1..]
            .strip_suffix(quote)
            .ok_or("unterminated NULLIF literal")?;
        let doubled = format!("{quote}{quote}");
        return Ok(body.replace(&doubled, &quote.to_string()).into_bytes());
    }

    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("invalid NULLIF pattern '{s}'"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}
