//! Shared lock region: reader table, writer lock, transaction id counter
//!
//! The lock file is mapped shared so every process using the environment
//! sees the same reader table. Each reader slot occupies one cache line and
//! is written with atomics; the writer reads slot txnids without a lock when
//! it computes the oldest live reader. Reading a stale (newer) txnid only
//! delays reclamation, so the race is benign. Writer exclusion pairs an
//! in-process mutex with an `fcntl` record lock for other processes.

use crate::error::{Error, Result, TransactionId};
use memmap2::MmapMut;
use parking_lot::{Mutex, MutexGuard};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace};

/// Magic number identifying the lock region
pub const LOCK_MAGIC: u32 = 0xBEEF_C0DE;

/// Lock region format version
pub const LOCK_VERSION: u32 = 1;

const CACHE_LINE: usize = 64;

// Region layout: header line, writer-lock line, then one line per reader.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_TXNID: usize = 8;
const OFF_NUMREADERS: usize = 16;
const READERS_OFFSET: usize = 2 * CACHE_LINE;

// Per-slot field offsets within a reader line.
const SLOT_TXNID: usize = 0;
const SLOT_PID: usize = 8;
const SLOT_TID: usize = 16;

// fcntl record-lock bytes: byte 0 serializes writers across processes,
// byte 1 is held shared by every live environment so a whole-file exclusive
// probe succeeds only for the first opener.
const WRITER_LOCK_BYTE: i64 = 0;
const LIVENESS_BYTE: i64 = 1;

thread_local! {
    // Reader slot cache: one claimed slot per (environment, thread),
    // reused across read transactions.
    static READER_SLOTS: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

/// The mapped lock region of one environment
pub struct LockFile {
    file: File,
    map: MmapMut,
    max_readers: usize,
    /// In-process half of the writer lock
    write_mutex: Mutex<()>,
    /// Guards slot allocation scans within this process
    alloc_mutex: Mutex<()>,
    /// Slots claimed through this instance, released on drop
    claimed: Mutex<Vec<usize>>,
}

impl LockFile {
    /// Open or create the lock region
    ///
    /// The first opener takes a whole-file exclusive lock, initializes the
    /// region, then downgrades to the shared liveness lock every opener
    /// holds for its lifetime.
    pub fn open(path: &Path, max_readers: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let wanted = READERS_OFFSET + max_readers * CACHE_LINE;

        let exclusive = try_lock(&file, libc::F_WRLCK, 0, 0)?;
        let len = file.metadata()?.len() as usize;
        if exclusive && len < wanted {
            file.set_len(wanted as u64)?;
        }
        let len = file.metadata()?.len() as usize;
        if len < READERS_OFFSET + CACHE_LINE {
            unlock(&file, 0, 0)?;
            return Err(Error::Invalid("lock region too small"));
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let capacity = (len - READERS_OFFSET) / CACHE_LINE;

        let lock = Self {
            file,
            map,
            max_readers: max_readers.min(capacity),
            write_mutex: Mutex::new(()),
            alloc_mutex: Mutex::new(()),
            claimed: Mutex::new(Vec::new()),
        };

        if exclusive && lock.read_header_u32(OFF_MAGIC) != LOCK_MAGIC {
            debug!(max_readers = lock.max_readers, "initializing lock region");
            // Zero the reader table and stamp the header.
            unsafe {
                std::ptr::write_bytes(lock.map.as_ptr() as *mut u8, 0, len);
            }
            lock.write_header_u32(OFF_MAGIC, LOCK_MAGIC);
            lock.write_header_u32(OFF_VERSION, LOCK_VERSION);
            unlock(&lock.file, 0, 0)?;
            // Shared liveness lock, held until drop.
            lock_wait(&lock.file, libc::F_RDLCK, LIVENESS_BYTE, 1)?;
        } else {
            if exclusive {
                unlock(&lock.file, 0, 0)?;
            }
            // Taking the liveness lock first blocks until a concurrent
            // initializer drops its whole-file exclusive lock, so the
            // header is final by the time it is validated.
            lock_wait(&lock.file, libc::F_RDLCK, LIVENESS_BYTE, 1)?;
            let magic = lock.read_header_u32(OFF_MAGIC);
            if magic != LOCK_MAGIC {
                return Err(Error::Invalid("bad lock region magic"));
            }
            let version = lock.read_header_u32(OFF_VERSION);
            if version != LOCK_VERSION {
                return Err(Error::VersionMismatch { expected: LOCK_VERSION, found: version });
            }
        }
        Ok(lock)
    }

    fn read_header_u32(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.map[off..off + 4]);
        u32::from_le_bytes(b)
    }

    fn write_header_u32(&self, off: usize, v: u32) {
        unsafe {
            let ptr = self.map.as_ptr().add(off) as *mut u8;
            std::ptr::copy_nonoverlapping(v.to_le_bytes().as_ptr(), ptr, 4);
        }
    }

    fn atomic_u64(&self, off: usize) -> &AtomicU64 {
        debug_assert_eq!(off % 8, 0);
        unsafe { &*(self.map.as_ptr().add(off) as *const AtomicU64) }
    }

    fn atomic_u32(&self, off: usize) -> &AtomicU32 {
        debug_assert_eq!(off % 4, 0);
        unsafe { &*(self.map.as_ptr().add(off) as *const AtomicU32) }
    }

    fn slot_off(&self, idx: usize) -> usize {
        READERS_OFFSET + idx * CACHE_LINE
    }

    /// Current global transaction id
    pub fn txnid(&self) -> TransactionId {
        TransactionId(self.atomic_u64(OFF_TXNID).load(Ordering::Acquire))
    }

    /// Publish the global transaction id; only the writer-lock holder may
    /// call this
    pub fn store_txnid(&self, txnid: TransactionId) {
        self.atomic_u64(OFF_TXNID).store(txnid.0, Ordering::Release);
    }

    /// Raise the global transaction id to at least `txnid` (used when
    /// adopting an existing file at open)
    pub fn adopt_txnid(&self, txnid: TransactionId) {
        self.atomic_u64(OFF_TXNID).fetch_max(txnid.0, Ordering::AcqRel);
    }

    /// High-water count of reader slots ever used
    pub fn num_readers(&self) -> usize {
        self.atomic_u32(OFF_NUMREADERS).load(Ordering::Acquire) as usize
    }

    /// Claim a reader slot for the calling thread and record its snapshot
    ///
    /// A thread keeps its slot between read transactions; only the slot's
    /// txnid changes. The per-slot pid claim is a compare-and-swap, so slot
    /// allocation is safe across processes as well.
    pub fn slot_claim(&self, txnid: TransactionId) -> Result<usize> {
        let env_key = self.map.as_ptr() as usize;
        let pid = std::process::id();
        let tid = thread_id();

        let cached = READER_SLOTS.with(|slots| slots.borrow().get(&env_key).copied());
        if let Some(idx) = cached {
            let off = self.slot_off(idx);
            if self.atomic_u32(off + SLOT_PID).load(Ordering::Acquire) == pid
                && self.atomic_u64(off + SLOT_TID).load(Ordering::Acquire) == tid
            {
                self.atomic_u64(off + SLOT_TXNID).store(txnid.0, Ordering::Release);
                return Ok(idx);
            }
            READER_SLOTS.with(|slots| slots.borrow_mut().remove(&env_key));
        }

        let _alloc = self.alloc_mutex.lock();
        for pass in 0..2 {
            for idx in 0..self.max_readers {
                let off = self.slot_off(idx);
                let slot_pid = self.atomic_u32(off + SLOT_PID);
                if pass == 1 && self.slot_is_stale(idx) {
                    trace!(slot = idx, "reclaiming stale reader slot");
                    slot_pid.store(0, Ordering::Release);
                }
                if slot_pid.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                    self.atomic_u64(off + SLOT_TID).store(tid, Ordering::Release);
                    self.atomic_u64(off + SLOT_TXNID).store(txnid.0, Ordering::Release);
                    self.atomic_u32(OFF_NUMREADERS)
                        .fetch_max(idx as u32 + 1, Ordering::AcqRel);
                    READER_SLOTS.with(|slots| slots.borrow_mut().insert(env_key, idx));
                    self.claimed.lock().push(idx);
                    return Ok(idx);
                }
            }
        }
        Err(Error::ReadersFull)
    }

    /// Mark a slot idle at the end of a read transaction, keeping the
    /// thread's claim on it
    pub fn slot_idle(&self, idx: usize) {
        self.atomic_u64(self.slot_off(idx) + SLOT_TXNID).store(0, Ordering::Release);
    }

    /// Oldest snapshot among live readers
    pub fn oldest_reader(&self) -> Option<TransactionId> {
        let mut oldest: Option<u64> = None;
        for idx in 0..self.num_readers().min(self.max_readers) {
            let txnid = self.atomic_u64(self.slot_off(idx) + SLOT_TXNID).load(Ordering::Acquire);
            if txnid > 0 {
                oldest = Some(oldest.map_or(txnid, |o| o.min(txnid)));
            }
        }
        oldest.map(TransactionId)
    }

    /// Number of slots currently holding a live snapshot
    pub fn live_readers(&self) -> usize {
        (0..self.num_readers().min(self.max_readers))
            .filter(|&idx| {
                self.atomic_u64(self.slot_off(idx) + SLOT_TXNID).load(Ordering::Acquire) > 0
            })
            .count()
    }

    fn slot_is_stale(&self, idx: usize) -> bool {
        let pid = self.atomic_u32(self.slot_off(idx) + SLOT_PID).load(Ordering::Acquire);
        if pid == 0 {
            return false;
        }
        // Signal 0 probes for existence without delivering anything.
        unsafe { libc::kill(pid as i32, 0) != 0 }
    }

    /// Acquire the writer lock, blocking until it is free
    pub fn writer_lock(&self) -> Result<WriterGuard<'_>> {
        let guard = self.write_mutex.lock();
        lock_wait(&self.file, libc::F_WRLCK, WRITER_LOCK_BYTE, 1)?;
        Ok(WriterGuard { lock: self, _guard: guard })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let claimed = std::mem::take(&mut *self.claimed.lock());
        for idx in claimed {
            let off = self.slot_off(idx);
            self.atomic_u64(off + SLOT_TXNID).store(0, Ordering::Release);
            self.atomic_u64(off + SLOT_TID).store(0, Ordering::Release);
            self.atomic_u32(off + SLOT_PID).store(0, Ordering::Release);
        }
    }
}

/// Scoped ownership of the writer lock
pub struct WriterGuard<'a> {
    lock: &'a LockFile,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        let _ = unlock(&self.lock.file, WRITER_LOCK_BYTE, 1);
    }
}

fn thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

fn fcntl_lock(file: &File, op: libc::c_int, kind: i16, start: i64, len: i64) -> std::io::Result<bool> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = start;
    fl.l_len = len;
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), op, &fl) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EAGAIN) => Ok(false),
        _ => Err(err),
    }
}

fn try_lock(file: &File, kind: libc::c_int, start: i64, len: i64) -> Result<bool> {
    Ok(fcntl_lock(file, libc::F_SETLK, kind as i16, start, len)?)
}

fn lock_wait(file: &File, kind: libc::c_int, start: i64, len: i64) -> Result<()> {
    fcntl_lock(file, libc::F_SETLKW, kind as i16, start, len)?;
    Ok(())
}

fn unlock(file: &File, start: i64, len: i64) -> Result<()> {
    fcntl_lock(file, libc::F_SETLK, libc::F_UNLCK as i16, start, len)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_lock(dir: &TempDir) -> LockFile {
        LockFile::open(&dir.path().join("lock.mdb"), 8).unwrap()
    }

    #[test]
    fn test_slot_claim_and_reuse() {
        let dir = TempDir::new().unwrap();
        let lock = open_lock(&dir);

        let slot = lock.slot_claim(TransactionId(10)).unwrap();
        assert_eq!(lock.oldest_reader(), Some(TransactionId(10)));
        assert_eq!(lock.live_readers(), 1);

        lock.slot_idle(slot);
        assert_eq!(lock.oldest_reader(), None);

        // The same thread gets the same slot back
        let again = lock.slot_claim(TransactionId(11)).unwrap();
        assert_eq!(slot, again);
        lock.slot_idle(slot);
    }

    #[test]
    fn test_oldest_across_threads() {
        let dir = TempDir::new().unwrap();
        let lock = std::sync::Arc::new(open_lock(&dir));

        let l2 = lock.clone();
        let handle = std::thread::spawn(move || {
            let slot = l2.slot_claim(TransactionId(5)).unwrap();
            (slot, l2.oldest_reader())
        });
        let slot = lock.slot_claim(TransactionId(9)).unwrap();
        let (other, seen) = handle.join().unwrap();
        assert_ne!(slot, other);
        assert_eq!(seen, Some(TransactionId(5)));
        assert_eq!(lock.oldest_reader(), Some(TransactionId(5)));
        lock.slot_idle(other);
        assert_eq!(lock.oldest_reader(), Some(TransactionId(9)));
    }

    #[test]
    fn test_txnid_counter() {
        let dir = TempDir::new().unwrap();
        let lock = open_lock(&dir);
        assert_eq!(lock.txnid(), TransactionId(0));
        lock.store_txnid(TransactionId(2));
        assert_eq!(lock.txnid(), TransactionId(2));
        // Adoption never lowers the counter
        lock.adopt_txnid(TransactionId(1));
        assert_eq!(lock.txnid(), TransactionId(2));
        lock.adopt_txnid(TransactionId(5));
        assert_eq!(lock.txnid(), TransactionId(5));
    }

    #[test]
    fn test_writer_lock_serializes_threads() {
        let dir = TempDir::new().unwrap();
        let lock = std::sync::Arc::new(open_lock(&dir));
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                let _guard = lock.writer_lock().unwrap();
                let v = counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                // No other writer ran while we held the lock
                assert_eq!(counter.load(Ordering::SeqCst), v + 1);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
