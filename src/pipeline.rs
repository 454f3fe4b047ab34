//! One load run: parse, build, check and hand rows to a writer.
//!
//! [`Loader`] owns everything that lives for a single run (options, schema, collaborators,
//! observer, cancellation). Nothing is process-wide; two loaders can run side by side.
//!
//! ```no_run
//! use bulk_ingest::config::LoadOptions;
//! use bulk_ingest::parser::Source;
//! use bulk_ingest::pipeline::Loader;
//! use bulk_ingest::types::{Column, DataType, Schema};
//! use bulk_ingest::writer::{local_writer, MemoryTable};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = Schema::new(vec![
//!     Column::new("id", DataType::Int64).not_null(),
//!     Column::new("name", DataType::Text),
//! ]);
//! let options = LoadOptions::from_pairs([("TYPE", "csv"), ("PARSE_ERRORS", "10")])?;
//! let table = MemoryTable::with_unique_key(0);
//! let mut writer = local_writer(&options, Box::new(table.clone()))?;
//!
//! let summary = Loader::new(options, schema).run(Source::from_path("people.csv")?, writer.as_mut())?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::builder::RowBuilder;
use crate::cancel::CancelToken;
use crate::catalog::{DefaultCatalog, TypeCatalog};
use crate::checker::{BuiltinTranscoder, Checker, Transcoder};
use crate::config::LoadOptions;
use crate::controller::ErrorController;
use crate::error::{LoadError, LoadFailure, LoadResult};
use crate::observability::{
    CompositeObserver, FileObserver, LoadContext, LoadObserver, LoadSeverity, NoopObserver,
};
use crate::parser::{RecordParser, Source};
use crate::types::{Row, Schema};
use crate::writer::{WriterResult, WriterStrategy};

/// Counts reported at the end of a run, successful or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub skipped: u64,
    pub loaded: u64,
    pub parse_rejected: u64,
    /// New rows discarded because their key already existed.
    pub duplicate_new: u64,
    /// Existing rows replaced by a new row with the same key.
    pub duplicate_old: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    fn apply(&mut self, result: WriterResult) {
        self.loaded = result.inserted;
        self.duplicate_new = result.duplicate_new;
        self.duplicate_old = result.duplicate_old;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} Rows skipped.", self.skipped)?;
        writeln!(f, "{} Rows successfully loaded.", self.loaded)?;
        writeln!(f, "{} Rows not loaded due to parse errors.", self.parse_rejected)?;
        writeln!(f, "{} Rows not loaded due to duplicate errors.", self.duplicate_new)?;
        writeln!(f, "{} Rows replaced with new rows.", self.duplicate_old)?;
        write!(f, "Run took {:.3} sec", self.elapsed.as_secs_f64())
    }
}

/// Builder-style entry point for a load run.
pub struct Loader {
    options: LoadOptions,
    schema: Arc<Schema>,
    catalog: Arc<dyn TypeCatalog>,
    transcoder: Arc<dyn Transcoder>,
    observer: Arc<dyn LoadObserver>,
    cancel: CancelToken,
    alert_at_or_above: LoadSeverity,
    input_name: String,
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("options", &self.options)
            .field("schema", &self.schema)
            .field("alert_at_or_above", &self.alert_at_or_above)
            .field("input_name", &self.input_name)
            .finish()
    }
}

impl Loader {
    pub fn new(options: LoadOptions, schema: Schema) -> Self {
        Self {
            options,
            schema: Arc::new(schema),
            catalog: Arc::new(DefaultCatalog),
            transcoder: Arc::new(BuiltinTranscoder),
            observer: Arc::new(NoopObserver),
            cancel: CancelToken::new(),
            alert_at_or_above: LoadSeverity::Critical,
            input_name: "-".to_string(),
        }
    }

    /// Replace the typed-input and row-check collaborator.
    pub fn with_catalog(mut self, catalog: Arc<dyn TypeCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LoadObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Share a cancellation token with the caller (signal handler, another thread, a writer).
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Failures at or above `severity` also trigger `on_alert`.
    pub fn with_alert_threshold(mut self, severity: LoadSeverity) -> Self {
        self.alert_at_or_above = severity;
        self
    }

    /// Name reported to observers for the input.
    pub fn with_input_name(mut self, name: impl Into<String>) -> Self {
        self.input_name = name.into();
        self
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Load every record of `source` into `writer` and close it.
    ///
    /// On failure the writer is closed in error mode and the counts gathered so far travel
    /// with the error in [`LoadFailure`].
    pub fn run(&self, source: Source, writer: &mut dyn WriterStrategy) -> Result<RunSummary, LoadFailure> {
        let started = Instant::now();
        let observer = self.run_observer();
        let ctx = LoadContext {
            input: self.input_name.clone(),
            format: self.options.format,
            writer: self.options.writer,
        };
        observer.on_start(&ctx);
        log::debug!(
            "loading {} as {:?} with the {:?} writer",
            ctx.input,
            ctx.format,
            ctx.writer
        );

        let mut controller = ErrorController::new(
            self.options.parse_errors,
            self.options.parse_badfile.clone(),
            self.options.verbose,
            ctx.clone(),
            Arc::clone(&observer),
        );
        let mut summary = RunSummary::default();

        let loaded = self.load(source, writer, &mut controller, &mut summary);
        summary.parse_rejected = controller.rejected();

        let closed = loaded
            .and_then(|()| controller.finish())
            .and_then(|()| writer.close(false).map_err(LoadError::from));
        match closed {
            Ok(result) => {
                summary.apply(result);
                summary.elapsed = started.elapsed();
                log::info!("load of {} complete\n{summary}", ctx.input);
                observer.on_success(&ctx, &summary);
                Ok(summary)
            }
            Err(error) => {
                let _ = controller.finish();
                if let Ok(result) = writer.close(true) {
                    summary.apply(result);
                }
                summary.elapsed = started.elapsed();
                Err(self.fail(observer.as_ref(), &ctx, error, summary))
            }
        }
    }

    fn load(
        &self,
        source: Source,
        writer: &mut dyn WriterStrategy,
        controller: &mut ErrorController,
        summary: &mut RunSummary,
    ) -> LoadResult<()> {
        let mut parser = RecordParser::new(source, &self.options, &self.schema)?;
        self.cancel.check()?;
        summary.skipped = parser.skip(self.options.skip)?;

        let builder = RowBuilder::new(Arc::clone(&self.schema), Arc::clone(&self.catalog));
        let checker = Checker::new(
            Arc::clone(&self.schema),
            Arc::clone(&self.catalog),
            Arc::clone(&self.transcoder),
            self.options.encoding,
            self.options.check_constraints,
        );
        let mut row = Row::with_columns(self.schema.len());
        let mut processed = 0u64;

        loop {
            if self.options.limit.is_some_and(|limit| processed >= limit) {
                break;
            }
            self.cancel.check()?;
            let Some(record) = parser.next_record()? else {
                break;
            };
            processed += 1;

            let record_no = record.number();
            let raw = record.raw();
            let accepted = controller.attempt(record_no, raw, || {
                builder.build(&record, &mut row)?;
                checker.validate(record_no, &mut row)
            })?;
            if accepted {
                writer.insert(&row, raw)?;
            }
        }
        Ok(())
    }

    fn run_observer(&self) -> Arc<dyn LoadObserver> {
        match self.options.logfile.as_ref() {
            Some(path) => Arc::new(CompositeObserver::new(vec![
                Arc::clone(&self.observer),
                Arc::new(FileObserver::new(path)),
            ])),
            None => Arc::clone(&self.observer),
        }
    }

    fn fail(&self, observer: &dyn LoadObserver, ctx: &LoadContext, error: LoadError, summary: RunSummary) -> LoadFailure {
        let severity = LoadSeverity::of(&error);
        if error.is_interrupt() {
            log::warn!("load of {} interrupted: {error}\n{summary}", ctx.input);
        } else {
            log::error!("load of {} failed: {error}\n{summary}", ctx.input);
        }
        observer.on_failure(ctx, severity, &error, &summary);
        if severity >= self.alert_at_or_above {
            observer.on_alert(ctx, severity, &error, &summary);
        }
        LoadFailure { summary, error }
    }
}
