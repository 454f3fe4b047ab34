//! Field slices to typed row values.

use std::sync::Arc;

use crate::catalog::TypeCatalog;
use crate::controller::RowError;
use crate::error::ParseError;
use crate::parser::RawRecord;
use crate::types::{Row, Schema, Value};

/// Maps field `i` of a record to column `i` of the schema.
pub struct RowBuilder {
    schema: Arc<Schema>,
    catalog: Arc<dyn TypeCatalog>,
}

impl RowBuilder {
    pub fn new(schema: Arc<Schema>, catalog: Arc<dyn TypeCatalog>) -> Self {
        Self { schema, catalog }
    }

    /// Overwrite `row` with the values of `record`.
    ///
    /// Character columns keep their bytes for the checker; other columns go through the
    /// catalog's typed input. Columns past the last field take their default, and a field
    /// count that does not fit the schema is a parse error.
    pub fn build(&self, record: &RawRecord<'_>, row: &mut Row) -> Result<(), RowError> {
        let record_no = record.number();
        if let Some(detail) = record.incomplete() {
            return Err(ParseError::new(record_no, None, detail).into());
        }
        let columns = self.schema.len();
        if record.field_count() > columns {
            return Err(ParseError::new(
                record_no,
                Some(columns + 1),
                "extra data after last expected column",
            )
            .into());
        }
        if row.len() != columns {
            row.reset(columns);
        }

        for (idx, column) in self.schema.columns.iter().enumerate() {
            match record.field(idx) {
                Some(None) => row.set_null(idx),
                Some(Some(bytes)) if column.data_type.is_character() => set_text(row, idx, bytes),
                Some(Some(bytes)) => {
                    let value = self
                        .catalog
                        .input(column, bytes)
                        .map_err(|e| RowError::from_storage(e, record_no, Some(idx + 1)))?;
                    row.set(idx, value);
                }
                None => match &column.default {
                    Some(value) => row.set(idx, value.clone()),
                    None => {
                        return Err(ParseError::new(
                            record_no,
                            Some(idx + 1),
                            format!("missing data for column \"{}\"", column.name),
                        )
                        .into());
                    }
                },
            }
        }
        Ok(())
    }
}

/// Store text in place, reusing the previous record's allocation.
fn set_text(row: &mut Row, idx: usize, bytes: &[u8]) {
    match &mut row.values[idx] {
        Value::Text(buf) => {
            buf.clear();
            buf.extend_from_slice(bytes);
        }
        slot => *slot = Value::Text(bytes.to_vec()),
    }
    row.nulls[idx] = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DefaultCatalog;
    use crate::config::DelimitedOptions;
    use crate::parser::DelimitedParser;
    use crate::types::{Column, DataType};

    fn builder() -> RowBuilder {
        let schema = Schema::new(vec![
            Column::new("id", DataType::Int32),
            Column::new("name", DataType::Text),
            Column::new("score", DataType::Float64).with_default(Value::Float64(0.0)),
        ]);
        RowBuilder::new(Arc::new(schema), Arc::new(DefaultCatalog))
    }

    fn build_all(input: &'static [u8]) -> Vec<Result<Row, String>> {
        let b = builder();
        let mut p = DelimitedParser::new(Box::new(input), &DelimitedOptions::csv(), Vec::new(), 64, 1 << 20);
        let mut row = Row::default();
        let mut out = Vec::new();
        while let Some(rec) = p.next_record().unwrap() {
            out.push(match b.build(&rec, &mut row) {
                Ok(()) => Ok(row.clone()),
                Err(RowError::Parse(e)) => Err(e.to_string()),
                Err(other) => panic!("unexpected {other:?}"),
            });
        }
        out
    }

    #[test]
    fn converts_and_applies_defaults() {
        let rows = build_all(b"1,ann,2.5\n2,,\n3,bob\n");
        assert_eq!(
            rows[0],
            Ok(Row::from_values(vec![Value::Int32(1), Value::text("ann"), Value::Float64(2.5)]))
        );
        assert_eq!(rows[1], Ok(Row::from_values(vec![Value::Int32(2), Value::Null, Value::Null])));
        assert_eq!(
            rows[2],
            Ok(Row::from_values(vec![Value::Int32(3), Value::text("bob"), Value::Float64(0.0)]))
        );
    }

    #[test]
    fn field_count_mismatch_is_a_parse_error() {
        let rows = build_all(b"1,a,2,extra\n1\nx,a,1\n");
        assert_eq!(
            rows[0],
            Err("record 1, column 4: extra data after last expected column".to_string())
        );
        assert_eq!(
            rows[1],
            Err("record 2, column 2: missing data for column \"name\"".to_string())
        );
        assert_eq!(
            rows[2],
            Err("record 3, column 1: invalid input syntax for type integer: \"x\"".to_string())
        );
    }
}
