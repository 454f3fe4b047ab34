//! Parallel writer: the loading process parses and checks, a consumer inserts.
//!
//! Wire format on the ring queue, one frame per row:
//!
//! ```text
//! [u32 little-endian length][bincode (row, raw record)]
//! ```
//!
//! A length of 0 ends the load normally and `u32::MAX` tells the consumer to abort. Both parts
//! of a frame are written in one queue call, so a frame is never split between writes.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::config::{ErrorLimit, LoadOptions, OnDuplicate, WriterKind};
use crate::controller::DuplicateTracker;
use crate::error::{QueueError, WriterError};
use crate::queue::RingQueue;
use crate::types::Row;

use super::storage::CsvFileStorage;
use super::{BufferedWriter, DirectWriter, WriterResult, WriterStrategy};

const TERMINATOR: u32 = 0;
const ABORT: u32 = u32::MAX;
const ABORT_TIMEOUT: Duration = Duration::from_millis(200);
const JOIN_GRACE: Duration = Duration::from_secs(1);
const CHILD_GRACE: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct FrameRef<'a> {
    row: &'a Row,
    raw: &'a [u8],
}

#[derive(Deserialize)]
struct Frame {
    row: Row,
    raw: Vec<u8>,
}

/// How a consumer stopped: the counts it reached and the failure that stopped it, if any.
#[derive(Debug, Default)]
pub struct ConsumerReport {
    pub result: WriterResult,
    pub error: Option<WriterError>,
}

/// JSON shape of a [`ConsumerReport`] printed by a consumer process.
#[derive(Serialize, Deserialize)]
struct WireReport {
    result: WriterResult,
    error: Option<String>,
}

impl ConsumerReport {
    pub fn failed(error: WriterError) -> Self {
        Self {
            result: WriterResult::default(),
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<WriterResult, WriterError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireReport {
            result: self.result,
            error: self.error.as_ref().map(ToString::to_string),
        })
    }

    /// Parse a report from a consumer process; its error comes back as [`WriterError::Remote`].
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let wire: WireReport = serde_json::from_slice(bytes)?;
        Ok(Self {
            result: wire.result,
            error: wire.error.map(WriterError::Remote),
        })
    }
}

/// The consumer on the other end of the queue.
pub trait Peer: Send {
    fn is_alive(&mut self) -> bool;

    /// Block until the consumer finishes and collect its report.
    fn wait(&mut self) -> ConsumerReport;

    /// Stop the consumer and release it.
    ///
    /// Returns the counts it reached when they could still be collected.
    fn abort(&mut self) -> Option<WriterResult>;
}

/// Consumer running on a thread of the loading process.
pub struct ThreadPeer {
    handle: Option<JoinHandle<ConsumerReport>>,
    cancel: CancelToken,
}

impl ThreadPeer {
    /// Start consuming `queue` into `writer` on a new thread.
    ///
    /// `cancel` must be the token `queue` was opened with; [`Peer::abort`] trips it.
    pub fn spawn(
        mut queue: RingQueue,
        mut writer: Box<dyn WriterStrategy + Send>,
        cancel: CancelToken,
    ) -> Result<Self, WriterError> {
        let handle = thread::Builder::new()
            .name("bulkload-consumer".to_string())
            .spawn(move || {
                let report = run_consumer(&mut queue, writer.as_mut());
                let _ = queue.close();
                report
            })?;
        Ok(Self {
            handle: Some(handle),
            cancel,
        })
    }
}

impl Peer for ThreadPeer {
    fn is_alive(&mut self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn wait(&mut self) -> ConsumerReport {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| ConsumerReport::failed(WriterError::Remote("consumer thread panicked".to_string()))),
            None => ConsumerReport::failed(WriterError::PeerGone),
        }
    }

    fn abort(&mut self) -> Option<WriterResult> {
        let handle = self.handle.take()?;
        self.cancel.cancel();
        let deadline = Instant::now() + JOIN_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            handle.join().ok().map(|report| report.result)
        } else {
            log::warn!("consumer thread did not stop; detaching it");
            None
        }
    }
}

/// Consumer running as a separate `bulkload consume` process.
///
/// The child prints its [`ConsumerReport`] as JSON on stdout.
pub struct ChildProcessPeer {
    child: Option<Child>,
}

impl ChildProcessPeer {
    pub fn spawn(program: &Path, queue: &RingQueue, config: &ConsumerConfig) -> Result<Self, WriterError> {
        let config = serde_json::to_string(config).map_err(|e| WriterError::Remote(e.to_string()))?;
        let mut cmd = Command::new(program);
        cmd.arg("consume")
            .arg("--queue")
            .arg(queue.handle().to_string())
            .arg("--config")
            .arg(config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = queue.dir() {
            cmd.arg("--queue-dir").arg(dir);
        }
        let child = cmd.spawn()?;
        log::debug!("spawned consumer process {} for queue {}", child.id(), queue.handle());
        Ok(Self { child: Some(child) })
    }
}

fn read_report(output: &Output) -> ConsumerReport {
    match ConsumerReport::from_json(&output.stdout) {
        Ok(report) if output.status.success() || report.error.is_some() => report,
        _ => ConsumerReport::failed(WriterError::Remote(format!("consumer exited with {}", output.status))),
    }
}

impl Peer for ChildProcessPeer {
    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn wait(&mut self) -> ConsumerReport {
        let Some(child) = self.child.take() else {
            return ConsumerReport::failed(WriterError::PeerGone);
        };
        match child.wait_with_output() {
            Ok(output) => read_report(&output),
            Err(err) => ConsumerReport::failed(err.into()),
        }
    }

    fn abort(&mut self) -> Option<WriterResult> {
        let mut child = self.child.take()?;
        // give the child a moment to act on the abort marker and report
        let deadline = Instant::now() + CHILD_GRACE;
        while matches!(child.try_wait(), Ok(None)) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if matches!(child.try_wait(), Ok(Some(_))) {
            return child.wait_with_output().ok().map(|output| read_report(&output).result);
        }
        log::warn!("consumer process {} did not stop; killing it", child.id());
        let _ = child.kill();
        let _ = child.wait();
        None
    }
}

/// What a consumer process needs to build its writer. Sent as JSON on its command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// `Direct` or `Buffered`.
    pub writer: WriterKind,
    /// CSV file receiving the loaded rows.
    pub output: PathBuf,
    pub truncate: bool,
    pub batch_size: usize,
    pub on_duplicate: OnDuplicate,
    pub duplicate_errors: ErrorLimit,
    pub duplicate_badfile: Option<PathBuf>,
}

impl ConsumerConfig {
    pub fn from_options(options: &LoadOptions, output: impl Into<PathBuf>) -> Self {
        Self {
            writer: WriterKind::Direct,
            output: output.into(),
            truncate: options.truncate,
            batch_size: options.batch_size,
            on_duplicate: options.on_duplicate,
            duplicate_errors: options.duplicate_errors,
            duplicate_badfile: options.duplicate_badfile.clone(),
        }
    }

    pub fn build_writer(&self) -> Result<Box<dyn WriterStrategy + Send>, WriterError> {
        let storage = Box::new(CsvFileStorage::open(&self.output)?);
        let tracker = DuplicateTracker::new(
            self.on_duplicate,
            self.duplicate_errors,
            self.duplicate_badfile.clone(),
        );
        match self.writer {
            WriterKind::Buffered => Ok(Box::new(BufferedWriter::new(
                storage,
                tracker,
                self.batch_size,
                self.truncate,
            )?)),
            _ => Ok(Box::new(DirectWriter::new(storage, tracker, self.truncate)?)),
        }
    }
}

/// Consumer loop: read frames from `queue` into `writer` until the terminator.
///
/// On any failure, including an abort marker from the producer, the writer is closed in error
/// mode and the report carries both the failure and the counts reached so far.
pub fn run_consumer(queue: &mut RingQueue, writer: &mut dyn WriterStrategy) -> ConsumerReport {
    let error = match consume_frames(queue, writer).and_then(|()| writer.close(false)) {
        Ok(result) => return ConsumerReport { result, error: None },
        Err(err) => err,
    };
    ConsumerReport {
        result: writer.close(true).unwrap_or_default(),
        error: Some(error),
    }
}

fn consume_frames(queue: &mut RingQueue, writer: &mut dyn WriterStrategy) -> Result<(), WriterError> {
    let mut len_buf = [0u8; 4];
    let mut buf = Vec::new();
    loop {
        queue.read(&mut len_buf)?;
        match u32::from_le_bytes(len_buf) {
            TERMINATOR => return Ok(()),
            ABORT => return Err(WriterError::Remote("load aborted by the producer".to_string())),
            len => {
                buf.resize(len as usize, 0);
                queue.read(&mut buf)?;
                let frame: Frame = bincode::deserialize(&buf)?;
                writer.insert(&frame.row, &frame.raw)?;
            }
        }
    }
}

/// Producer side: streams rows to a [`Peer`] over a [`RingQueue`].
pub struct ParallelWriter {
    queue: RingQueue,
    peer: Box<dyn Peer>,
    frame: Vec<u8>,
    write_timeout: Duration,
    max_stalls: u32,
    /// Last counts the consumer reported.
    reported: WriterResult,
    closed: bool,
}

impl ParallelWriter {
    pub fn new(queue: RingQueue, peer: Box<dyn Peer>, write_timeout: Duration, max_stalls: u32) -> Self {
        Self {
            queue,
            peer,
            frame: Vec::new(),
            write_timeout,
            max_stalls: max_stalls.max(1),
            reported: WriterResult::default(),
            closed: false,
        }
    }

    /// Consume on a thread of this process into `consumer`.
    ///
    /// The consumer side of the queue gets its own token, so an abort stops it without
    /// interrupting the run.
    pub fn with_thread(
        options: &LoadOptions,
        cancel: &CancelToken,
        consumer: Box<dyn WriterStrategy + Send>,
    ) -> Result<Self, WriterError> {
        let queue = RingQueue::create(options.queue_size, cancel.clone())?;
        let consumer_cancel = CancelToken::new();
        let peer = ThreadPeer::spawn(queue.attach(consumer_cancel.clone())?, consumer, consumer_cancel)?;
        Ok(Self::new(
            queue,
            Box::new(peer),
            options.queue_write_timeout,
            options.queue_max_stalls,
        ))
    }

    /// Consume in a `program consume` child process configured by `config`.
    pub fn with_process(
        options: &LoadOptions,
        cancel: &CancelToken,
        program: &Path,
        config: &ConsumerConfig,
    ) -> Result<Self, WriterError> {
        let queue = RingQueue::create(options.queue_size, cancel.clone())?;
        let peer = ChildProcessPeer::spawn(program, &queue, config)?;
        Ok(Self::new(
            queue,
            Box::new(peer),
            options.queue_write_timeout,
            options.queue_max_stalls,
        ))
    }

    /// Collect the consumer's report, keeping its counts for a later error-mode close.
    fn wait_peer(&mut self) -> Result<WriterResult, WriterError> {
        let report = self.peer.wait();
        self.reported = report.result;
        report.into_result()
    }

    fn abort_peer(&mut self) {
        if let Some(result) = self.peer.abort() {
            self.reported = result;
        }
    }

    /// Write one frame, re-checking the consumer each time the queue stays full.
    fn send(&mut self, parts: &[&[u8]]) -> Result<(), WriterError> {
        let mut stalls = 0;
        loop {
            if self.queue.write(parts, self.write_timeout)? {
                return Ok(());
            }
            if !self.peer.is_alive() {
                return Err(match self.wait_peer() {
                    Err(err) => err,
                    Ok(_) => WriterError::PeerGone,
                });
            }
            stalls += 1;
            log::warn!(
                "ring queue still full after {:?}, consumer alive ({stalls}/{})",
                self.write_timeout,
                self.max_stalls
            );
            if stalls >= self.max_stalls {
                return Err(WriterError::PeerStalled { stalls });
            }
        }
    }
}

impl WriterStrategy for ParallelWriter {
    fn insert(&mut self, row: &Row, raw: &[u8]) -> Result<(), WriterError> {
        if self.closed {
            return Err(WriterError::Closed);
        }
        let mut frame = std::mem::take(&mut self.frame);
        frame.clear();
        let sent = bincode::serialize_into(&mut frame, &FrameRef { row, raw })
            .map_err(WriterError::from)
            .and_then(|()| {
                let len = u32::try_from(frame.len())
                    .ok()
                    .filter(|len| *len != ABORT)
                    .ok_or(QueueError::TooLarge {
                        requested: frame.len(),
                        capacity: self.queue.capacity(),
                    })?;
                self.send(&[len.to_le_bytes().as_slice(), frame.as_slice()])
            });
        self.frame = frame;
        sent
    }

    /// Later calls return the counts the consumer last reported.
    fn close(&mut self, on_error: bool) -> Result<WriterResult, WriterError> {
        if self.closed {
            return Ok(self.reported);
        }
        self.closed = true;

        if on_error {
            if self.queue.write(&[ABORT.to_le_bytes().as_slice()], ABORT_TIMEOUT).unwrap_or(false) {
                log::debug!("sent abort marker to the consumer");
            }
            self.abort_peer();
            let _ = self.queue.close();
            return Ok(self.reported);
        }

        let outcome = match self.send(&[TERMINATOR.to_le_bytes().as_slice()]) {
            Ok(()) => self.wait_peer(),
            Err(err) => Err(err),
        };
        if outcome.is_err() {
            self.abort_peer();
        }
        let closed = self.queue.close();
        let result = outcome?;
        closed?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::types::Value;
    use crate::writer::storage::MemoryTable;

    fn options() -> LoadOptions {
        LoadOptions {
            queue_size: 256,
            queue_write_timeout: Duration::from_millis(20),
            queue_max_stalls: 3,
            ..LoadOptions::default()
        }
    }

    fn consumer(table: &MemoryTable, policy: OnDuplicate) -> Box<dyn WriterStrategy + Send> {
        let tracker = DuplicateTracker::new(policy, ErrorLimit::Unlimited, None);
        Box::new(DirectWriter::new(Box::new(table.clone()), tracker, false).unwrap())
    }

    fn row(id: i64, name: &str) -> Row {
        Row::from_values(vec![Value::Int64(id), Value::text(name)])
    }

    #[test]
    fn thread_consumer_receives_rows_in_order() {
        let table = MemoryTable::new();
        let cancel = CancelToken::new();
        let mut writer = ParallelWriter::with_thread(&options(), &cancel, consumer(&table, OnDuplicate::KeepNew)).unwrap();

        // enough rows to wrap the 256-byte queue several times
        for id in 0..100 {
            writer.insert(&row(id, "x"), b"raw\n").unwrap();
        }
        let result = writer.close(false).unwrap();
        assert_eq!(result.inserted, 100);
        let ids: Vec<_> = table.rows().into_iter().map(|r| r.values[0].clone()).collect();
        assert_eq!(ids, (0..100).map(Value::Int64).collect::<Vec<_>>());
    }

    #[test]
    fn consumer_failure_surfaces_at_close() {
        let table = MemoryTable::with_unique_key(0);
        let cancel = CancelToken::new();
        let mut writer = ParallelWriter::with_thread(&options(), &cancel, consumer(&table, OnDuplicate::Error)).unwrap();
        writer.insert(&row(1, "a"), b"1,a\n").unwrap();
        writer.insert(&row(1, "b"), b"1,b\n").unwrap();
        let err = writer.close(false).unwrap_err();
        assert!(matches!(err, WriterError::DuplicateKey { .. }));
        // the error-mode close that follows still reports what the consumer stored
        assert_eq!(writer.close(true).unwrap().inserted, 1);
    }

    struct FakePeer {
        alive: bool,
    }

    impl Peer for FakePeer {
        fn is_alive(&mut self) -> bool {
            self.alive
        }

        fn wait(&mut self) -> ConsumerReport {
            ConsumerReport::default()
        }

        fn abort(&mut self) -> Option<WriterResult> {
            None
        }
    }

    fn stuck_writer(alive: bool) -> (tempfile::TempDir, ParallelWriter) {
        let dir = tempfile::tempdir().unwrap();
        let queue = RingQueue::create_in(dir.path(), 64, CancelToken::new()).unwrap();
        let writer = ParallelWriter::new(queue, Box::new(FakePeer { alive }), Duration::from_millis(2), 2);
        (dir, writer)
    }

    #[test]
    fn live_but_stalled_consumer_fails_after_max_stalls() {
        let (_dir, mut writer) = stuck_writer(true);
        let err = loop {
            if let Err(e) = writer.insert(&row(1, "abcd"), b"") {
                break e;
            }
        };
        assert!(matches!(err, WriterError::PeerStalled { stalls: 2 }));
        writer.close(true).unwrap();
    }

    #[test]
    fn vanished_consumer_is_reported() {
        let (_dir, mut writer) = stuck_writer(false);
        let err = loop {
            if let Err(e) = writer.insert(&row(1, "abcd"), b"") {
                break e;
            }
        };
        assert!(matches!(err, WriterError::PeerGone));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let (_dir, mut writer) = stuck_writer(true);
        let big = "x".repeat(100);
        let err = writer.insert(&row(1, &big), b"").unwrap_err();
        assert!(matches!(err, WriterError::Queue(QueueError::TooLarge { .. })));
    }

    /// Takes a while over every row and counts what it stored.
    struct SlowWriter {
        stored: Arc<AtomicU64>,
    }

    impl WriterStrategy for SlowWriter {
        fn insert(&mut self, _row: &Row, _raw: &[u8]) -> Result<(), WriterError> {
            thread::sleep(Duration::from_millis(30));
            self.stored.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self, _on_error: bool) -> Result<WriterResult, WriterError> {
            Ok(WriterResult {
                inserted: self.stored.load(Ordering::SeqCst),
                ..WriterResult::default()
            })
        }
    }

    #[test]
    fn error_close_stops_a_busy_consumer_thread() {
        let dir = tempfile::tempdir().unwrap();
        let queue = RingQueue::create_in(dir.path(), 256, CancelToken::new()).unwrap();
        let consumer_cancel = CancelToken::new();
        let stored = Arc::new(AtomicU64::new(0));
        let peer = ThreadPeer::spawn(
            queue.attach(consumer_cancel.clone()).unwrap(),
            Box::new(SlowWriter { stored: stored.clone() }),
            consumer_cancel,
        )
        .unwrap();
        let mut writer = ParallelWriter::new(queue, Box::new(peer), Duration::from_millis(2), 1);

        let mut sent = 0;
        while sent < 1_000 && writer.insert(&row(sent, "abcd"), b"").is_ok() {
            sent += 1;
        }
        let result = writer.close(true).unwrap();

        let after_close = stored.load(Ordering::SeqCst);
        assert!(after_close < sent as u64, "queued rows were still drained");
        assert_eq!(result.inserted, after_close);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(stored.load(Ordering::SeqCst), after_close);
    }

    #[test]
    fn consumer_report_keeps_counts_across_processes() {
        let report = ConsumerReport {
            result: WriterResult {
                inserted: 2,
                duplicate_new: 1,
                duplicate_old: 0,
            },
            error: Some(WriterError::DuplicateLimit { count: 1, limit: 0 }),
        };
        let back = ConsumerReport::from_json(report.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(back.result, report.result);
        assert!(matches!(back.error, Some(WriterError::Remote(ref m)) if m.contains("too many duplicate errors")));
    }

    #[test]
    fn consumer_config_travels_as_json() {
        let config = ConsumerConfig::from_options(&LoadOptions::default(), "/tmp/out.csv");
        let json = serde_json::to_string(&config).unwrap();
        let back: ConsumerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
