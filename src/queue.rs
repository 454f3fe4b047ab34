//! Fixed-capacity byte channel between two processes, backed by a shared memory-mapped file.
//!
//! Segment layout: a 64-byte [`Header`] followed by `capacity` data bytes. `begin` is the next
//! byte to read and `end` the next byte to write, both modulo `capacity`. `begin == end` means
//! empty, so at most `capacity - 1` bytes are ever outstanding. Both offsets are only read and
//! advanced while holding the header's spinlock.
//!
//! The creating side owns the segment and removes its file on close. The other side attaches
//! with [`RingQueue::open`] using the numeric [`QueueHandle`] it was given out of band.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::ptr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use memmap2::{MmapMut, MmapOptions};

use crate::cancel::CancelToken;
use crate::error::QueueError;

const MAGIC: u32 = 0x5251_4231; // "RQB1"
const VERSION: u32 = 1;
const HEADER_SIZE: usize = std::mem::size_of::<Header>();
const MIN_BACKOFF: Duration = Duration::from_micros(50);
const MAX_BACKOFF: Duration = Duration::from_millis(10);

#[repr(C)]
struct Header {
    magic: AtomicU32,
    version: AtomicU32,
    capacity: AtomicU64,
    producer_pid: AtomicU32,
    lock: AtomicU32,
    begin: AtomicU64,
    end: AtomicU64,
    _reserved: [u8; 24],
}

const _: () = assert!(HEADER_SIZE == 64);

/// Out-of-band name of a queue segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

impl fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueHandle {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// One side of a ring queue.
pub struct RingQueue {
    map: MmapMut,
    data: *mut u8,
    capacity: usize,
    handle: QueueHandle,
    path: PathBuf,
    owner: bool,
    detached: bool,
    cancel: CancelToken,
}

// The mapping is shared memory; every access to `data` goes through the header lock.
unsafe impl Send for RingQueue {}

impl fmt::Debug for RingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingQueue")
            .field("handle", &self.handle)
            .field("capacity", &self.capacity)
            .field("owner", &self.owner)
            .finish()
    }
}

impl RingQueue {
    /// Create a segment with `capacity` data bytes in the default shared-memory directory.
    pub fn create(capacity: usize, cancel: CancelToken) -> Result<Self, QueueError> {
        Self::create_in(&default_dir(), capacity, cancel)
    }

    /// Create a segment in `dir`. The caller becomes the owner and the producer.
    pub fn create_in(dir: &Path, capacity: usize, cancel: CancelToken) -> Result<Self, QueueError> {
        if capacity < 2 {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        let (handle, path, file) = create_segment_file(dir)?;
        file.set_len((HEADER_SIZE + capacity) as u64)?;
        // SAFETY: the file was just created with the right length and is only mapped by queues.
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
        let data = unsafe { map.as_mut_ptr().add(HEADER_SIZE) };

        let queue = Self {
            map,
            data,
            capacity,
            handle,
            path,
            owner: true,
            detached: false,
            cancel,
        };
        let header = queue.header();
        header.version.store(VERSION, Ordering::Relaxed);
        header.capacity.store(capacity as u64, Ordering::Relaxed);
        header.producer_pid.store(std::process::id(), Ordering::Relaxed);
        header.lock.store(0, Ordering::Relaxed);
        header.begin.store(0, Ordering::Relaxed);
        header.end.store(0, Ordering::Relaxed);
        header.magic.store(MAGIC, Ordering::Release);

        log::debug!("created ring queue {handle} ({capacity} bytes) at {}", queue.path.display());
        Ok(queue)
    }

    /// Attach to a segment created in the default shared-memory directory.
    pub fn open(handle: QueueHandle, cancel: CancelToken) -> Result<Self, QueueError> {
        Self::open_in(&default_dir(), handle, cancel)
    }

    pub fn open_in(dir: &Path, handle: QueueHandle, cancel: CancelToken) -> Result<Self, QueueError> {
        let path = segment_path(dir, handle);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE {
            return Err(QueueError::BadMagic { key: handle.0, found: 0 });
        }
        // SAFETY: see `create_in`; the length was checked to cover the header.
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
        let data = unsafe { map.as_mut_ptr().add(HEADER_SIZE) };

        let mut queue = Self {
            map,
            data,
            capacity: 0,
            handle,
            path,
            owner: false,
            detached: false,
            cancel,
        };
        let header = queue.header();
        let magic = header.magic.load(Ordering::Acquire);
        if magic != MAGIC || header.version.load(Ordering::Relaxed) != VERSION {
            return Err(QueueError::BadMagic { key: handle.0, found: magic });
        }
        let capacity = header.capacity.load(Ordering::Relaxed) as usize;
        if capacity < 2 || HEADER_SIZE + capacity != len {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        queue.capacity = capacity;
        log::debug!("attached to ring queue {handle} ({capacity} bytes)");
        Ok(queue)
    }

    /// Attach a second, non-owning side to this queue's segment.
    pub fn attach(&self, cancel: CancelToken) -> Result<Self, QueueError> {
        Self::open_in(self.dir().unwrap_or(Path::new(".")), self.handle, cancel)
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle
    }

    /// Directory holding the segment file.
    pub fn dir(&self) -> Option<&Path> {
        self.path.parent()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written and not yet read.
    pub fn len(&self) -> usize {
        let _guard = self.lock();
        let (begin, end) = self.offsets();
        self.used(begin, end)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until `buf.len()` bytes are available and copy them out.
    ///
    /// Polls the cancel token between retries and fails with `PeerGone` once the producer
    /// process has exited without leaving enough data.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(), QueueError> {
        self.ensure_open()?;
        let len = buf.len();
        if len >= self.capacity {
            return Err(QueueError::TooLarge {
                requested: len,
                capacity: self.capacity,
            });
        }
        let mut backoff = MIN_BACKOFF;
        loop {
            if let Some(kind) = self.cancel.interrupt() {
                return Err(QueueError::Interrupted(kind));
            }
            {
                let _guard = self.lock();
                let (begin, end) = self.offsets();
                if self.used(begin, end) >= len {
                    self.copy_out(begin, buf);
                    self.header()
                        .begin
                        .store(((begin + len) % self.capacity) as u64, Ordering::Release);
                    return Ok(());
                }
            }
            let pid = self.header().producer_pid.load(Ordering::Relaxed);
            if !process_alive(pid) {
                return Err(QueueError::PeerGone { pid });
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Write all `parts` contiguously, or nothing.
    ///
    /// Returns `Ok(false)` when `timeout` passes before enough space frees up; the caller
    /// decides whether the reader is still alive.
    pub fn write(&mut self, parts: &[&[u8]], timeout: Duration) -> Result<bool, QueueError> {
        self.ensure_open()?;
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total >= self.capacity {
            return Err(QueueError::TooLarge {
                requested: total,
                capacity: self.capacity,
            });
        }
        let deadline = Instant::now() + timeout;
        let mut backoff = MIN_BACKOFF;
        loop {
            if let Some(kind) = self.cancel.interrupt() {
                return Err(QueueError::Interrupted(kind));
            }
            {
                let _guard = self.lock();
                let (begin, end) = self.offsets();
                let free = self.capacity - 1 - self.used(begin, end);
                if free >= total {
                    let mut pos = end;
                    for part in parts {
                        self.copy_in(pos, part);
                        pos = (pos + part.len()) % self.capacity;
                    }
                    self.header().end.store(pos as u64, Ordering::Release);
                    return Ok(true);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.detached {
            return Err(QueueError::Closed { key: self.handle.0 });
        }
        Ok(())
    }

    /// Detach; the owner also removes the segment. Safe to call more than once, but reads
    /// and writes fail afterwards.
    pub fn close(&mut self) -> Result<(), QueueError> {
        if self.detached {
            return Ok(());
        }
        self.detached = true;
        if self.owner {
            match fs::remove_file(&self.path) {
                Ok(()) => log::debug!("removed ring queue {}", self.handle),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn header(&self) -> &Header {
        // SAFETY: the mapping is page aligned and at least HEADER_SIZE bytes long.
        unsafe { &*(self.map.as_ptr() as *const Header) }
    }

    fn lock(&self) -> LockGuard<'_> {
        let lock = &self.header().lock;
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        LockGuard { lock }
    }

    fn offsets(&self) -> (usize, usize) {
        let header = self.header();
        (
            header.begin.load(Ordering::Acquire) as usize,
            header.end.load(Ordering::Acquire) as usize,
        )
    }

    fn used(&self, begin: usize, end: usize) -> usize {
        (end + self.capacity - begin) % self.capacity
    }

    fn copy_in(&self, pos: usize, bytes: &[u8]) {
        let first = bytes.len().min(self.capacity - pos);
        // SAFETY: pos < capacity and both ranges stay inside the data area.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(pos), first);
            ptr::copy_nonoverlapping(bytes.as_ptr().add(first), self.data, bytes.len() - first);
        }
    }

    fn copy_out(&self, pos: usize, buf: &mut [u8]) {
        let first = buf.len().min(self.capacity - pos);
        // SAFETY: as in `copy_in`.
        unsafe {
            ptr::copy_nonoverlapping(self.data.add(pos), buf.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.data, buf.as_mut_ptr().add(first), buf.len() - first);
        }
    }
}

impl Drop for RingQueue {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct LockGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}

fn default_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn segment_path(dir: &Path, handle: QueueHandle) -> PathBuf {
    dir.join(format!("bulkload-queue-{:016x}", handle.0))
}

/// Pick an unused key (process id in the high half) and create its file exclusively.
fn create_segment_file(dir: &Path) -> Result<(QueueHandle, PathBuf, File), QueueError> {
    let pid = u64::from(std::process::id());
    for counter in 0u64.. {
        let handle = QueueHandle((pid << 32) | (counter & 0xffff_ffff));
        let path = segment_path(dir, handle);
        match OpenOptions::new().read(true).write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((handle, path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && counter < 0xffff_ffff => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(std::io::Error::new(ErrorKind::AlreadyExists, "every ring queue key for this process is taken").into())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the process exists.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterruptKind;

    fn pair(capacity: usize) -> (tempfile::TempDir, RingQueue, RingQueue) {
        let dir = tempfile::tempdir().unwrap();
        let producer = RingQueue::create_in(dir.path(), capacity, CancelToken::new()).unwrap();
        let consumer = RingQueue::open_in(dir.path(), producer.handle(), CancelToken::new()).unwrap();
        (dir, producer, consumer)
    }

    #[test]
    fn header_is_one_cache_line() {
        assert_eq!(HEADER_SIZE, 64);
    }

    #[test]
    fn round_trip_across_wraparound() {
        let (_dir, mut tx, mut rx) = pair(8);
        let mut buf = [0u8; 5];
        assert!(tx.write(&[b"abc".as_slice(), b"de".as_slice()], Duration::ZERO).unwrap());
        rx.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abcde");

        // begin = end = 5: this write wraps after three bytes
        assert!(tx.write(&[b"fghi".as_slice(), b"j".as_slice()], Duration::ZERO).unwrap());
        assert_eq!(rx.len(), 5);
        let mut buf = [0u8; 2];
        rx.read(&mut buf).unwrap();
        assert_eq!(&buf, b"fg");
        let mut buf = [0u8; 3];
        rx.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hij");
        assert!(rx.is_empty());
    }

    #[test]
    fn full_queue_times_out_without_corruption() {
        let (_dir, mut tx, mut rx) = pair(8);
        assert!(tx.write(&[b"1234567".as_slice()], Duration::ZERO).unwrap());
        assert!(!tx.write(&[b"8".as_slice()], Duration::from_millis(5)).unwrap());
        assert_eq!(tx.len(), 7);

        let mut buf = [0u8; 7];
        rx.read(&mut buf).unwrap();
        assert_eq!(&buf, b"1234567");
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let (_dir, mut tx, mut rx) = pair(8);
        let err = tx.write(&[b"1234".as_slice(), b"5678".as_slice()], Duration::ZERO).unwrap_err();
        assert!(matches!(err, QueueError::TooLarge { requested: 8, capacity: 8 }));
        assert!(tx.is_empty());
        let mut buf = [0u8; 8];
        assert!(matches!(rx.read(&mut buf), Err(QueueError::TooLarge { .. })));
    }

    #[test]
    fn open_rejects_foreign_segments() {
        let dir = tempfile::tempdir().unwrap();
        let handle = QueueHandle(42);
        std::fs::write(segment_path(dir.path(), handle), vec![0u8; 128]).unwrap();
        let err = RingQueue::open_in(dir.path(), handle, CancelToken::new()).unwrap_err();
        assert!(matches!(err, QueueError::BadMagic { key: 42, found: 0 }));
    }

    #[test]
    fn read_observes_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let tx = RingQueue::create_in(dir.path(), 16, CancelToken::new()).unwrap();
        let cancel = CancelToken::new();
        let mut rx = RingQueue::open_in(dir.path(), tx.handle(), cancel.clone()).unwrap();

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 4];
            rx.read(&mut buf)
        });
        thread::sleep(Duration::from_millis(20));
        cancel.shutdown();
        let err = reader.join().unwrap().unwrap_err();
        assert!(matches!(err, QueueError::Interrupted(InterruptKind::Shutdown)));
    }

    #[test]
    fn owner_close_removes_segment_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = RingQueue::create_in(dir.path(), 16, CancelToken::new()).unwrap();
        let mut rx = RingQueue::open_in(dir.path(), tx.handle(), CancelToken::new()).unwrap();
        let path = segment_path(dir.path(), tx.handle());

        rx.close().unwrap();
        assert!(path.exists());
        tx.close().unwrap();
        tx.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn closed_side_refuses_reads_and_writes() {
        let (_dir, mut tx, mut rx) = pair(16);
        assert!(tx.write(&[b"ab".as_slice()], Duration::ZERO).unwrap());
        rx.close().unwrap();
        let mut buf = [0u8; 2];
        assert!(matches!(rx.read(&mut buf), Err(QueueError::Closed { .. })));

        tx.close().unwrap();
        let err = tx.write(&[b"c".as_slice()], Duration::ZERO).unwrap_err();
        assert!(matches!(err, QueueError::Closed { key } if key == tx.handle().0));
    }

    #[test]
    fn handle_round_trips_through_text() {
        let handle = QueueHandle(0x1234_0000_0007);
        assert_eq!(handle.to_string().parse::<QueueHandle>().unwrap(), handle);
    }
}
