use std::io::Cursor;

use bulk_ingest::config::LoadOptions;
use bulk_ingest::error::StorageError;
use bulk_ingest::parser::{IterRowSource, Source, SourceRow};
use bulk_ingest::pipeline::Loader;
use bulk_ingest::types::{Column, DataType, Schema, Value};
use bulk_ingest::writer::{CsvFileStorage, MemoryTable, local_writer};
use bulk_ingest::LoadError;

fn people_schema() -> Schema {
    Schema::new(vec![
        Column::new("id", DataType::Int64).not_null(),
        Column::new("name", DataType::Text),
        Column::new("score", DataType::Float64),
        Column::new("active", DataType::Bool),
    ])
}

fn text_schema(columns: &[&str]) -> Schema {
    Schema::new(columns.iter().map(|c| Column::new(*c, DataType::Text)).collect())
}

fn reader(text: &str) -> Source {
    Source::from_reader(Cursor::new(text.as_bytes().to_vec()))
}

fn load_into_table(pairs: &[(&str, &str)], schema: Schema, source: Source) -> (MemoryTable, bulk_ingest::RunSummary) {
    let options = LoadOptions::from_pairs(pairs.iter().copied()).unwrap();
    let table = MemoryTable::new();
    let mut writer = local_writer(&options, Box::new(table.clone())).unwrap();
    let summary = Loader::new(options, schema).run(source, writer.as_mut()).unwrap();
    (table, summary)
}

#[test]
fn load_csv_fixture_from_path() {
    let (table, summary) = load_into_table(
        &[("TYPE", "CSV"), ("SKIP", "1")],
        people_schema(),
        Source::from_path("tests/fixtures/people.csv").unwrap(),
    );

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.loaded, 3);
    let rows = table.rows();
    assert_eq!(
        rows[1].values,
        vec![
            Value::Int64(2),
            Value::text("Hopper, Grace"),
            Value::Float64(87.25),
            Value::Bool(false),
        ]
    );
    assert_eq!(rows[2].values[1..], [Value::Null, Value::Null, Value::Null]);
}

#[test]
fn csv_round_trips_through_csv_storage() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.csv");
    let input = "1,\"a,b\",x\n2,\"line\nbreak\",\n3,\"say \"\"hi\"\"\",z\r\n";

    let options = LoadOptions::from_pairs([("TYPE", "CSV")]).unwrap();
    let mut writer = local_writer(&options, Box::new(CsvFileStorage::open(&out).unwrap())).unwrap();
    let summary = Loader::new(options, text_schema(&["id", "a", "b"]))
        .run(reader(input), writer.as_mut())
        .unwrap();
    assert_eq!(summary.loaded, 3);

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(&out)
        .unwrap();
    let records: Vec<Vec<String>> = rdr
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect();
    assert_eq!(
        records,
        vec![
            vec!["1", "a,b", "x"],
            vec!["2", "line\nbreak", ""],
            vec!["3", "say \"hi\"", "z"],
        ]
    );
}

#[test]
fn skip_counts_records_not_lines() {
    let input = "\"header\nspanning\",lines\n\"second\",header\n1,a\n2,b\n";
    let (table, summary) = load_into_table(&[("SKIP", "2")], text_schema(&["id", "name"]), reader(input));

    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.loaded, 2);
    assert_eq!(table.rows()[0].values[0], Value::text("1"));
}

#[test]
fn skip_past_end_of_input_fails() {
    let options = LoadOptions::from_pairs([("SKIP", "5")]).unwrap();
    let table = MemoryTable::new();
    let mut writer = local_writer(&options, Box::new(table.clone())).unwrap();
    let failure = Loader::new(options, text_schema(&["a"]))
        .run(reader("x\ny\n"), writer.as_mut())
        .unwrap_err();
    assert!(matches!(
        failure.error,
        LoadError::SkipExceedsInput { requested: 5, found: 2 }
    ));
}

#[test]
fn multibyte_delimiter_across_small_buffers() {
    let input = "alpha||beta||gamma\ndelta||epsilon||zeta\n";
    let (table, summary) = load_into_table(
        &[("DELIMITER", "||"), ("BUFFER_SIZE", "3")],
        text_schema(&["a", "b", "c"]),
        reader(input),
    );
    assert_eq!(summary.loaded, 2);
    assert_eq!(
        table.rows()[1].values,
        vec![Value::text("delta"), Value::text("epsilon"), Value::text("zeta")]
    );
}

#[test]
fn text_format_escapes_and_null_marker() {
    let input = "1\tfoo\\tbar\n2\t\\N\n";
    let schema = Schema::new(vec![Column::new("id", DataType::Int32), Column::new("name", DataType::Text)]);
    let (table, _) = load_into_table(&[("TYPE", "TEXT")], schema, reader(input));

    let rows = table.rows();
    assert_eq!(rows[0].values[1], Value::text("foo\tbar"));
    assert_eq!(rows[1].values[1], Value::Null);
}

#[test]
fn force_not_null_keeps_empty_strings() {
    let (table, _) = load_into_table(
        &[("FORCE_NOT_NULL", "b")],
        text_schema(&["a", "b"]),
        reader(",\n"),
    );
    assert_eq!(table.rows()[0].values, vec![Value::Null, Value::text("")]);
}

#[test]
fn quoted_null_marker_is_not_null() {
    let (table, _) = load_into_table(&[], text_schema(&["a", "b"]), reader("\"\",\n"));
    assert_eq!(table.rows()[0].values, vec![Value::text(""), Value::Null]);
}

#[test]
fn function_source_feeds_the_same_pipeline() {
    let rows: Vec<SourceRow> = vec![
        vec![Some(b"1".to_vec()), Some(b"one".to_vec())],
        vec![Some(b"two".to_vec()), None],
        vec![Some(b"3".to_vec()), None],
    ];
    let dir = tempfile::tempdir().unwrap();
    let bad = dir.path().join("parse.bad");
    let bad_path = bad.to_string_lossy().into_owned();
    let schema = Schema::new(vec![Column::new("id", DataType::Int32), Column::new("name", DataType::Text)]);

    let (table, summary) = load_into_table(
        &[("TYPE", "FUNCTION"), ("PARSE_ERRORS", "1"), ("PARSE_BADFILE", &bad_path)],
        schema,
        Source::from_rows(IterRowSource::new(rows)),
    );
    assert_eq!(summary.loaded, 2);
    assert_eq!(summary.parse_rejected, 1);
    assert_eq!(table.rows()[1].values, vec![Value::Int32(3), Value::Null]);
    assert_eq!(std::fs::read_to_string(&bad).unwrap(), "two,\n");
}

#[test]
fn function_source_failure_is_fatal() {
    let mut calls = 0;
    let source = move || -> Result<Option<SourceRow>, StorageError> {
        calls += 1;
        if calls > 1 {
            return Err(StorageError::Invalid("connection reset".into()));
        }
        Ok(Some(vec![Some(b"x".to_vec())]))
    };
    let options = LoadOptions::from_pairs([("TYPE", "FUNCTION"), ("PARSE_ERRORS", "INFINITE")]).unwrap();
    let table = MemoryTable::new();
    let mut writer = local_writer(&options, Box::new(table.clone())).unwrap();
    let failure = Loader::new(options, text_schema(&["a"]))
        .run(Source::from_rows(source), writer.as_mut())
        .unwrap_err();
    assert!(matches!(failure.error, LoadError::Source { .. }));
    assert_eq!(failure.summary.loaded, 1);
}

#[test]
fn mixed_format_and_source_is_a_config_error() {
    let options = LoadOptions::default();
    let table = MemoryTable::new();
    let mut writer = local_writer(&options, Box::new(table)).unwrap();
    let failure = Loader::new(options, text_schema(&["a"]))
        .run(Source::from_rows(IterRowSource::new(Vec::<SourceRow>::new())), writer.as_mut())
        .unwrap_err();
    assert!(matches!(failure.error, LoadError::Config { .. }));
}
