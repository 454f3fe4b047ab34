//! `bulk-ingest` loads large delimited, fixed-width or programmatic inputs into a table while
//! isolating every bad record instead of failing the whole run.
//!
//! A run goes through four stages:
//!
//! - **parse**: [`parser::RecordParser`] splits the input into records and fields over a
//!   growable [`parser::RecordBuffer`] (CSV, TEXT, FIXED and FUNCTION sources)
//! - **build**: [`builder::RowBuilder`] converts fields into a reused [`types::Row`] through a
//!   [`catalog::TypeCatalog`]
//! - **check**: [`checker::Checker`] validates encoding, NOT NULL and row constraints
//! - **write**: a [`writer::WriterStrategy`] stores accepted rows directly, in batches, or in a
//!   second process fed through a shared-memory [`queue::RingQueue`]
//!
//! Parse and check failures are counted by [`controller::ErrorController`] against
//! `PARSE_ERRORS` and copied verbatim to a bad-record file. Duplicate keys are counted against
//! `DUPLICATE_ERRORS` on the writer side. Cancellation and shutdown are never counted.
//!
//! ## Quick example
//!
//! ```rust
//! use std::io::Cursor;
//!
//! use bulk_ingest::config::LoadOptions;
//! use bulk_ingest::parser::Source;
//! use bulk_ingest::pipeline::Loader;
//! use bulk_ingest::types::{Column, DataType, Schema, Value};
//! use bulk_ingest::writer::{local_writer, MemoryTable};
//!
//! let schema = Schema::new(vec![
//!     Column::new("id", DataType::Int64).not_null(),
//!     Column::new("name", DataType::Text),
//! ]);
//! let options = LoadOptions::from_pairs([("TYPE", "CSV"), ("PARSE_ERRORS", "1")]).unwrap();
//! let table = MemoryTable::new();
//! let mut writer = local_writer(&options, Box::new(table.clone())).unwrap();
//!
//! let input = Cursor::new(b"1,alice\nnot-a-number,bob\n3,\"carol, jr\"\n".to_vec());
//! let summary = Loader::new(options, schema)
//!     .run(Source::from_reader(input), writer.as_mut())
//!     .unwrap();
//!
//! assert_eq!(summary.loaded, 2);
//! assert_eq!(summary.parse_rejected, 1);
//! assert_eq!(table.rows()[1].values[1], Value::text("carol, jr"));
//! ```
//!
//! ## Modules
//!
//! - [`config`]: key/value options and fixed-width layouts
//! - [`parser`]: record parsers and the record buffer
//! - [`controller`]: per-record failure isolation and duplicate accounting
//! - [`writer`]: writer strategies and storage
//! - [`queue`]: the cross-process ring queue
//! - [`pipeline`]: the [`pipeline::Loader`] that ties a run together
//! - [`observability`]: run observers and severities
//! - [`error`]: error types

pub mod builder;
pub mod cancel;
pub mod catalog;
pub mod checker;
pub mod config;
pub mod controller;
pub mod error;
pub mod observability;
pub mod parser;
pub mod pipeline;
pub mod queue;
pub mod types;
pub mod writer;

pub use cancel::CancelToken;
pub use error::{LoadError, LoadFailure, LoadResult};
pub use pipeline::{Loader, RunSummary};
