//! FUNCTION input: rows produced by an external callback instead of parsed from bytes.

use crate::error::{LoadError, LoadResult, StorageError};

use super::{FieldSlice, RawRecord};

/// One produced row: a byte value per field, `None` for NULL.
pub type SourceRow = Vec<Option<Vec<u8>>>;

/// An external producer of rows.
///
/// Returning [`StorageError::Interrupted`] stops the load like any other interrupt; every other
/// error is fatal for the run.
pub trait RowSource: Send {
    fn next_row(&mut self) -> Result<Option<SourceRow>, StorageError>;
}

impl<F> RowSource for F
where
    F: FnMut() -> Result<Option<SourceRow>, StorageError> + Send,
{
    fn next_row(&mut self) -> Result<Option<SourceRow>, StorageError> {
        self()
    }
}

/// Adapts any iterator of rows into a [`RowSource`].
pub struct IterRowSource<I> {
    rows: I,
}

impl<I> IterRowSource<I>
where
    I: Iterator<Item = SourceRow> + Send,
{
    pub fn new(rows: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl<I> RowSource for IterRowSource<I>
where
    I: Iterator<Item = SourceRow> + Send,
{
    fn next_row(&mut self) -> Result<Option<SourceRow>, StorageError> {
        Ok(self.rows.next())
    }
}

pub struct FunctionParser {
    source: Box<dyn RowSource>,
    /// CSV rendering of the current row, kept for bad-record capture.
    raw: Vec<u8>,
    data: Vec<u8>,
    fields: Vec<FieldSlice>,
    record_no: u64,
}

impl FunctionParser {
    pub fn new(source: Box<dyn RowSource>) -> Self {
        Self {
            source,
            raw: Vec::new(),
            data: Vec::new(),
            fields: Vec::new(),
            record_no: 0,
        }
    }

    pub fn skip(&mut self, n: u64) -> LoadResult<u64> {
        for done in 0..n {
            if self.pull()?.is_none() {
                return Err(LoadError::SkipExceedsInput {
                    requested: n,
                    found: done,
                });
            }
            self.record_no += 1;
        }
        Ok(n)
    }

    pub fn next_record(&mut self) -> LoadResult<Option<RawRecord<'_>>> {
        let Some(row) = self.pull()? else {
            return Ok(None);
        };
        self.record_no += 1;

        self.data.clear();
        self.fields.clear();
        for value in &row {
            let start = self.data.len();
            if let Some(bytes) = value {
                self.data.extend_from_slice(bytes);
            }
            self.fields.push(FieldSlice {
                start,
                end: self.data.len(),
                null: value.is_none(),
            });
        }
        self.render_raw(&row)?;

        Ok(Some(RawRecord {
            number: self.record_no,
            raw: &self.raw,
            data: &self.data,
            fields: &self.fields,
            incomplete: None,
        }))
    }

    fn pull(&mut self) -> LoadResult<Option<SourceRow>> {
        self.source.next_row().map_err(|err| match err {
            StorageError::Interrupted(kind) => LoadError::Interrupted(kind),
            other => LoadError::Source {
                message: other.to_string(),
            },
        })
    }

    fn render_raw(&mut self, row: &SourceRow) -> LoadResult<()> {
        let mut out = std::mem::take(&mut self.raw);
        out.clear();
        let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(out);
        let rendered = wtr
            .write_record(row.iter().map(|v| v.as_deref().unwrap_or_default()))
            .map_err(|e| e.to_string())
            .and_then(|()| wtr.into_inner().map_err(|e| e.to_string()));
        match rendered {
            Ok(out) => {
                self.raw = out;
                Ok(())
            }
            Err(message) => Err(LoadError::Source { message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterruptKind;

    #[test]
    fn rows_become_fields_and_csv_raw() {
        let rows = vec![
            vec![Some(b"1".to_vec()), None, Some(b"a,b".to_vec())],
            vec![Some(b"2".to_vec())],
        ];
        let mut p = FunctionParser::new(Box::new(IterRowSource::new(rows)));

        let rec = p.next_record().unwrap().unwrap();
        assert_eq!(rec.number(), 1);
        assert_eq!(rec.field(0), Some(Some(&b"1"[..])));
        assert_eq!(rec.field(1), Some(None));
        assert_eq!(rec.raw(), b"1,,\"a,b\"\n");

        let rec = p.next_record().unwrap().unwrap();
        assert_eq!(rec.field_count(), 1);
        assert!(p.next_record().unwrap().is_none());
    }

    #[test]
    fn closure_source_errors_are_classified() {
        let mut calls = 0;
        let source = move || -> Result<Option<SourceRow>, StorageError> {
            calls += 1;
            match calls {
                1 => Err(StorageError::Invalid("boom".into())),
                _ => Err(StorageError::Interrupted(InterruptKind::Shutdown)),
            }
        };
        let mut p = FunctionParser::new(Box::new(source));
        assert!(matches!(p.next_record(), Err(LoadError::Source { .. })));
        assert!(matches!(
            p.next_record(),
            Err(LoadError::Interrupted(InterruptKind::Shutdown))
        ));
    }

    #[test]
    fn skip_past_end_fails() {
        let rows = vec![vec![Some(b"x".to_vec())]];
        let mut p = FunctionParser::new(Box::new(IterRowSource::new(rows)));
        let err = p.skip(2).unwrap_err();
        assert!(matches!(err, LoadError::SkipExceedsInput { requested: 2, found: 1 }));
    }
}
