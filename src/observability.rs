use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{InputFormat, WriterKind};
use crate::error::{LoadError, WriterError};
use crate::pipeline::RunSummary;

/// Severity classification used for observer callbacks and alerting thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadSeverity {
    /// Informational event.
    Info,
    /// Warning-level event (the run stopped on request, or a record was rejected).
    Warning,
    /// Error-level event (the run failed).
    Error,
    /// Critical failure of I/O, the transport or the consumer process.
    Critical,
}

impl LoadSeverity {
    /// Severity of a run-stopping error.
    pub fn of(error: &LoadError) -> Self {
        if error.is_interrupt() {
            return Self::Warning;
        }
        match error {
            LoadError::Io(_) | LoadError::Queue(_) => Self::Critical,
            LoadError::Writer(WriterError::Io(_))
            | LoadError::Writer(WriterError::Queue(_))
            | LoadError::Writer(WriterError::PeerGone)
            | LoadError::Writer(WriterError::PeerStalled { .. })
            | LoadError::Writer(WriterError::Remote(_)) => Self::Critical,
            _ => Self::Error,
        }
    }
}

/// Why a single record was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// Malformed record or a field that failed type conversion.
    Parse,
    /// Encoding, NOT NULL or storage constraint violation.
    Constraint,
}

/// Context about a load run.
#[derive(Debug, Clone)]
pub struct LoadContext {
    /// Display name of the input (a path, `-` for stdin, or `function`).
    pub input: String,
    pub format: InputFormat,
    pub writer: WriterKind,
}

/// Observer interface for load events.
///
/// Implementors can record metrics, logs, or trigger alerts.
pub trait LoadObserver: Send + Sync {
    /// Called once before the first record is read.
    fn on_start(&self, _ctx: &LoadContext) {}

    /// Called for every record the error controller absorbs.
    fn on_reject(&self, _ctx: &LoadContext, _kind: RejectKind, _record_no: u64, _message: &str) {}

    /// Called when the run completes.
    fn on_success(&self, _ctx: &LoadContext, _summary: &RunSummary) {}

    /// Called when the run fails.
    fn on_failure(&self, _ctx: &LoadContext, _severity: LoadSeverity, _error: &LoadError, _summary: &RunSummary) {}

    /// Called when a failure meets the alert threshold.
    ///
    /// Default behavior forwards to [`Self::on_failure`].
    fn on_alert(&self, ctx: &LoadContext, severity: LoadSeverity, error: &LoadError, summary: &RunSummary) {
        self.on_failure(ctx, severity, error, summary)
    }
}

/// Observer that ignores every event.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl LoadObserver for NoopObserver {}

/// An observer that fans out callbacks to a list of observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn LoadObserver>>,
}

impl CompositeObserver {
    pub fn new(observers: Vec<Arc<dyn LoadObserver>>) -> Self {
        Self { observers }
    }
}

impl fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers_len", &self.observers.len())
            .finish()
    }
}

impl LoadObserver for CompositeObserver {
    fn on_start(&self, ctx: &LoadContext) {
        for o in &self.observers {
            o.on_start(ctx);
        }
    }

    fn on_reject(&self, ctx: &LoadContext, kind: RejectKind, record_no: u64, message: &str) {
        for o in &self.observers {
            o.on_reject(ctx, kind, record_no, message);
        }
    }

    fn on_success(&self, ctx: &LoadContext, summary: &RunSummary) {
        for o in &self.observers {
            o.on_success(ctx, summary);
        }
    }

    fn on_failure(&self, ctx: &LoadContext, severity: LoadSeverity, error: &LoadError, summary: &RunSummary) {
        for o in &self.observers {
            o.on_failure(ctx, severity, error, summary);
        }
    }

    fn on_alert(&self, ctx: &LoadContext, severity: LoadSeverity, error: &LoadError, summary: &RunSummary) {
        for o in &self.observers {
            o.on_alert(ctx, severity, error, summary);
        }
    }
}

/// Logs run events to stderr.
#[derive(Debug, Default)]
pub struct StdErrObserver;

impl LoadObserver for StdErrObserver {
    fn on_success(&self, ctx: &LoadContext, summary: &RunSummary) {
        eprintln!(
            "[load][ok] format={:?} writer={:?} input={} loaded={} rejected={}",
            ctx.format,
            ctx.writer,
            ctx.input,
            summary.loaded,
            summary.parse_rejected + summary.duplicate_new + summary.duplicate_old
        );
    }

    fn on_failure(&self, ctx: &LoadContext, severity: LoadSeverity, error: &LoadError, summary: &RunSummary) {
        eprintln!(
            "[load][{:?}] format={:?} input={} loaded={} err={}",
            severity, ctx.format, ctx.input, summary.loaded, error
        );
    }

    fn on_alert(&self, ctx: &LoadContext, severity: LoadSeverity, error: &LoadError, summary: &RunSummary) {
        eprintln!(
            "[ALERT][load][{:?}] format={:?} input={} loaded={} err={}",
            severity, ctx.format, ctx.input, summary.loaded, error
        );
    }
}

/// Appends run events to a local log file (the `LOGFILE` option).
#[derive(Debug)]
pub struct FileObserver {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileObserver {
    /// Create a file observer that appends events to `path`.
    ///
    /// Writes are best-effort; failures to open/write the log file are ignored.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn append(&self, text: &str) {
        let _guard = self.lock.lock().ok();
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(f, "{text}");
        }
    }
}

impl LoadObserver for FileObserver {
    fn on_start(&self, ctx: &LoadContext) {
        self.append(&format!(
            "{} start input={} type={:?} writer={:?}",
            unix_ts(),
            ctx.input,
            ctx.format,
            ctx.writer
        ));
    }

    fn on_reject(&self, _ctx: &LoadContext, kind: RejectKind, record_no: u64, message: &str) {
        self.append(&format!(
            "{} reject kind={kind:?} record={record_no} err={message}",
            unix_ts()
        ));
    }

    fn on_success(&self, _ctx: &LoadContext, summary: &RunSummary) {
        self.append(&format!("{} ok\n{summary}", unix_ts()));
    }

    fn on_failure(&self, _ctx: &LoadContext, severity: LoadSeverity, error: &LoadError, summary: &RunSummary) {
        self.append(&format!(
            "{} fail severity={severity:?} err={error}\n{summary}",
            unix_ts()
        ));
    }

    fn on_alert(&self, _ctx: &LoadContext, severity: LoadSeverity, error: &LoadError, summary: &RunSummary) {
        self.append(&format!(
            "{} ALERT severity={severity:?} err={error}\n{summary}",
            unix_ts()
        ));
    }
}

fn unix_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{InterruptKind, QueueError};

    #[test]
    fn severity_by_error_class() {
        assert_eq!(
            LoadSeverity::of(&LoadError::Interrupted(InterruptKind::Cancelled)),
            LoadSeverity::Warning
        );
        assert_eq!(
            LoadSeverity::of(&LoadError::ParseErrorLimit { count: 2, limit: 1 }),
            LoadSeverity::Error
        );
        assert_eq!(
            LoadSeverity::of(&LoadError::Writer(WriterError::PeerGone)),
            LoadSeverity::Critical
        );
        assert_eq!(
            LoadSeverity::of(&LoadError::Queue(QueueError::InvalidCapacity(1))),
            LoadSeverity::Critical
        );
        assert!(LoadSeverity::Critical > LoadSeverity::Error);
    }

    #[test]
    fn file_observer_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("load.log");
        let obs = FileObserver::new(&path);
        let ctx = LoadContext {
            input: "data.csv".into(),
            format: InputFormat::Csv,
            writer: WriterKind::Direct,
        };
        obs.on_start(&ctx);
        obs.on_reject(&ctx, RejectKind::Parse, 3, "bad");
        obs.on_success(&ctx, &RunSummary::default());

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("start input=data.csv"));
        assert!(text.contains("reject kind=Parse record=3 err=bad"));
        assert!(text.contains("Rows successfully loaded"));
    }
}
