use std::hint::black_box;
use std::io::Cursor;
use std::thread;
use std::time::Duration;

use bulk_ingest::cancel::CancelToken;
use bulk_ingest::config::{DEFAULT_BUFFER_SIZE, DelimitedOptions, LoadOptions, MAX_BUFFER_SIZE};
use bulk_ingest::parser::{DelimitedParser, Source};
use bulk_ingest::pipeline::Loader;
use bulk_ingest::queue::RingQueue;
use bulk_ingest::types::{Column, DataType, Schema};
use bulk_ingest::writer::{MemoryTable, local_writer};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

/// Synthetic CSV with a quoted field every tenth row.
fn generate_csv(rows: usize) -> Vec<u8> {
    let mut out = String::with_capacity(rows * 40);
    for i in 0..rows {
        if i % 10 == 0 {
            out.push_str(&format!("{i},\"name, {i}\",{}.5,true\n", i % 100));
        } else {
            out.push_str(&format!("{i},name {i},{}.25,false\n", i % 100));
        }
    }
    out.into_bytes()
}

fn schema() -> Schema {
    Schema::new(vec![
        Column::new("id", DataType::Int64).not_null(),
        Column::new("name", DataType::Text),
        Column::new("score", DataType::Float64),
        Column::new("active", DataType::Bool),
    ])
}

fn bench_delimited_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("delimited_parser");

    for size in [1_000, 10_000, 100_000].iter() {
        let input = generate_csv(*size);
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut parser = DelimitedParser::new(
                    Box::new(Cursor::new(input.clone())),
                    &DelimitedOptions::csv(),
                    vec![false; 4],
                    DEFAULT_BUFFER_SIZE,
                    MAX_BUFFER_SIZE,
                );
                let mut fields = 0;
                while let Some(record) = parser.next_record().unwrap() {
                    fields += record.field_count();
                }
                black_box(fields)
            });
        });
    }

    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_direct");

    for size in [1_000, 10_000].iter() {
        let input = generate_csv(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let options = LoadOptions::default();
                let table = MemoryTable::new();
                let mut writer = local_writer(&options, Box::new(table)).unwrap();
                let source = Source::from_reader(Cursor::new(input.clone()));
                black_box(Loader::new(options, schema()).run(source, writer.as_mut()).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_ring_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_queue");
    let messages = 10_000usize;

    for msg_len in [16usize, 256, 4096].iter() {
        group.throughput(Throughput::Bytes((messages * msg_len) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(msg_len), msg_len, |b, &len| {
            b.iter(|| {
                let mut tx = RingQueue::create(1 << 16, CancelToken::new()).unwrap();
                let mut rx = tx.attach(CancelToken::new()).unwrap();
                let reader = thread::spawn(move || {
                    let mut buf = vec![0u8; len];
                    for _ in 0..messages {
                        rx.read(&mut buf).unwrap();
                    }
                });
                let msg = vec![1u8; len];
                for _ in 0..messages {
                    while !tx.write(&[msg.as_slice()], Duration::from_millis(10)).unwrap() {}
                }
                reader.join().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_delimited_parser, bench_pipeline, bench_ring_queue);
criterion_main!(benches);
