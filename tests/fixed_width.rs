use std::io::Cursor;

use bulk_ingest::config::LoadOptions;
use bulk_ingest::parser::Source;
use bulk_ingest::pipeline::Loader;
use bulk_ingest::types::{Column, DataType, Schema, Value};
use bulk_ingest::writer::{MemoryTable, local_writer};
use bulk_ingest::{LoadFailure, RunSummary};

fn schema() -> Schema {
    Schema::new(vec![
        Column::new("name", DataType::Text),
        Column::new("amount", DataType::Int32),
        Column::new("code", DataType::Text),
        Column::new("ratio", DataType::Float64),
    ])
}

const COLS: [&str; 4] = ["CHAR(4)", "INTEGER", "CHAR(2) NULLIF 'NA'", "DOUBLE"];
const STRIDE: usize = 18;

fn record(name: &str, amount: i32, code: &str, ratio: f64) -> Vec<u8> {
    let mut out = format!("{name:<4}").into_bytes();
    out.extend_from_slice(&amount.to_le_bytes());
    out.extend_from_slice(code.as_bytes());
    out.extend_from_slice(&ratio.to_le_bytes());
    assert_eq!(out.len(), STRIDE);
    out
}

fn load(extra: &[(&str, &str)], input: Vec<u8>) -> (MemoryTable, Result<RunSummary, LoadFailure>) {
    let mut pairs: Vec<(&str, &str)> = COLS.iter().map(|c| ("COL", *c)).collect();
    pairs.push(("TYPE", "FIXED"));
    pairs.extend_from_slice(extra);
    let options = LoadOptions::from_pairs(pairs).unwrap();
    let table = MemoryTable::new();
    let mut writer = local_writer(&options, Box::new(table.clone())).unwrap();
    let result = Loader::new(options, schema()).run(Source::from_reader(Cursor::new(input)), writer.as_mut());
    (table, result)
}

#[test]
fn records_straddling_buffer_refills_decode_intact() {
    let mut input = Vec::new();
    for i in 0..50 {
        let code = if i % 2 == 0 { "NA" } else { "ok" };
        input.extend(record(&format!("n{i}"), i * -3, code, f64::from(i) / 4.0));
    }

    // the buffer is raised to one stride plus one byte, so almost every record is split
    let (table, result) = load(&[("BUFFER_SIZE", "5")], input);
    let summary = result.unwrap();
    assert_eq!(summary.loaded, 50);

    let rows = table.rows();
    assert_eq!(
        rows[7].values,
        vec![
            Value::text("n7"),
            Value::Int32(-21),
            Value::text("ok"),
            Value::Float64(1.75),
        ]
    );
    assert_eq!(rows[8].values[2], Value::Null);
    assert_eq!(rows[49].values[1], Value::Int32(-147));
}

#[test]
fn preserve_blanks_keeps_trailing_spaces() {
    let (table, result) = load(&[("PRESERVE_BLANKS", "YES")], record("ab", 1, "ok", 0.5));
    result.unwrap();
    assert_eq!(table.rows()[0].values[0], Value::text("ab  "));
}

#[test]
fn trailing_partial_record_is_a_parse_error() {
    let mut input = record("full", 9, "ok", 2.0);
    input.extend_from_slice(b"half");

    let (table, result) = load(&[("PARSE_ERRORS", "1")], input);
    let summary = result.unwrap();
    assert_eq!(summary.loaded, 1);
    assert_eq!(summary.parse_rejected, 1);
    assert_eq!(table.len(), 1);
}

#[test]
fn skip_discards_whole_records() {
    let mut input = record("skip", 0, "ok", 0.0);
    input.extend(record("keep", 1, "ok", 0.0));
    let (table, result) = load(&[("SKIP", "1")], input);
    assert_eq!(result.unwrap().skipped, 1);
    assert_eq!(table.rows()[0].values[0], Value::text("keep"));
}

#[test]
fn more_cols_than_columns_is_rejected() {
    let options = LoadOptions::from_pairs([("TYPE", "FIXED"), ("COL", "CHAR(1)"), ("COL", "CHAR(1)")]).unwrap();
    let table = MemoryTable::new();
    let mut writer = local_writer(&options, Box::new(table)).unwrap();
    let one_column = Schema::new(vec![Column::new("a", DataType::Text)]);
    let failure = Loader::new(options, one_column)
        .run(Source::from_reader(Cursor::new(b"ab".to_vec())), writer.as_mut())
        .unwrap_err();
    assert!(matches!(failure.error, bulk_ingest::LoadError::Config { .. }));
}
