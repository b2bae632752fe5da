//! # Shared Info Region
//!
//! The `.tdb.lock` file is a single 4096-byte page, memory-mapped
//! `MAP_SHARED` and interpreted as an array of 512 `AtomicU64` slots. On
//! 64-bit Unix, 8-byte atomics on shared mappings are hardware-atomic across
//! processes, so this page is the entire cross-process coordination state -
//! no pthread objects, no allocator metadata, no language-dependent layout.
//!
//! ```text
//! Slot  Contents
//! 0     magic
//! 1     layout format version
//! 2     init_complete flag
//! 3     open_count (total handles across all processes)
//! 4     process lock   [pid:32][instance:32], 0 = unlocked
//! 5     writer lock    [pid:32][instance:32], 0 = unlocked
//! 6     current_version
//! 7     ring head index
//! 8     ring length
//! 9-15  reserved
//! 16-79 opener table: 64 slots of [pid:32][handle_count:32]
//! 80-207 version ring: 32 descriptors of {version, root, size, readers}
//! ```
//!
//! ## Locks
//!
//! Both locks are CAS spinlocks whose owner word packs the owner's pid and a
//! per-process instance counter. They are *robust*: a waiter that spins long
//! enough probes the owner pid with `kill(pid, 0)` and, if the owner is gone,
//! steals the lock with a CAS from the observed dead owner value. The ring is
//! only ever mutated one word at a time under the process lock, so the worst
//! state a dead owner can leave behind is a leaked reader count - never a
//! torn descriptor.
//!
//! Waiting is bounded-backoff polling. There is no shared condition variable;
//! the hold times under the process lock are a handful of loads and stores.
//!
//! ## Lifecycle
//!
//! The boundary between "region exists" and "region does not" is guarded by
//! an exclusive OS file lock (`BoundaryLock`) held only around attach and
//! detach. Initialization happens entirely under that lock, so any process
//! that acquires it and still sees `init_complete == 0` knows the initializer
//! died and may reinitialize. The last detacher unlinks the file while still
//! holding the lock; a racing opener detects the unlink by re-checking the
//! inode it locked against the path and retries.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use fs2::FileExt;
use memmap2::MmapRaw;
use tracing::{debug, info, warn};

use crate::error::DbError;
use crate::storage::PersistentStore;

use super::recovery;
use super::ring::{self, Snapshot};

pub(crate) const INFO_LEN: u64 = 4096;

const SLOT_MAGIC: usize = 0;
const SLOT_FORMAT: usize = 1;
const SLOT_INIT_COMPLETE: usize = 2;
pub(crate) const SLOT_OPEN_COUNT: usize = 3;
pub(crate) const SLOT_PROCESS_LOCK: usize = 4;
pub(crate) const SLOT_WRITER_LOCK: usize = 5;
pub(crate) const SLOT_CURRENT_VERSION: usize = 6;
pub(crate) const SLOT_RING_HEAD: usize = 7;
pub(crate) const SLOT_RING_LEN: usize = 8;

pub(crate) const PID_TABLE_BASE: usize = 16;
pub(crate) const PID_SLOTS: usize = 64;

pub(crate) const RING_BASE: usize = 80;
pub(crate) const RING_CAP: usize = 32;
pub(crate) const RING_ENTRY_SLOTS: usize = 4;

const SLOT_COUNT: usize = (INFO_LEN / 8) as usize;
const _: () = assert!(RING_BASE + RING_CAP * RING_ENTRY_SLOTS <= SLOT_COUNT);

const INFO_MAGIC: u64 = u64::from_le_bytes(*b"TideDBv1");
const INFO_FORMAT: u64 = 1;

/// Distinguishes lock holders within one process.
static INSTANCE_COUNTER: AtomicU32 = AtomicU32::new(1);

fn new_token() -> u64 {
    let instance = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    ((std::process::id() as u64) << 32) | instance as u64
}

pub(crate) fn token_pid(token: u64) -> u32 {
    (token >> 32) as u32
}

/// The durable commit point as a ring snapshot, for seeding a fresh region.
fn snapshot_of(store: &PersistentStore) -> Result<Snapshot> {
    let commit = store.read_root()?;
    Ok(Snapshot {
        version: commit.version,
        root_offset: commit.root_offset,
        file_size: commit.file_size,
    })
}

/// Exponential-ish backoff for spin waits: busy first, then yield, then
/// short sleeps.
pub(crate) fn backoff(spins: u32) {
    if spins < 64 {
        std::hint::spin_loop();
    } else if spins < 256 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_micros(200));
    }
}

/// The brief exclusive OS file lock guarding attach and detach.
///
/// Steady-state coordination never touches this; it exists only to resolve
/// the last-closer vs. new-opener race around creating and unlinking the
/// lock file.
pub(crate) struct BoundaryLock {
    file: File,
}

impl BoundaryLock {
    /// Opens (creating if absent) and exclusively locks `path`, retrying if
    /// the file it locked was unlinked by a racing last closer.
    pub fn acquire(path: &Path) -> Result<Self> {
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(|e| {
                    DbError::OpenFailed(format!("cannot open '{}': {}", path.display(), e))
                })?;

            file.lock_exclusive().map_err(|e| {
                DbError::OpenFailed(format!("cannot lock '{}': {}", path.display(), e))
            })?;

            if Self::still_linked(&file, path)? {
                return Ok(Self { file });
            }
            // The inode we locked was unlinked underneath us; start over.
            let _ = FileExt::unlock(&file);
        }
    }

    /// As `acquire`, but never creates the file. `None` when it is gone.
    pub fn acquire_existing(path: &Path) -> Result<Option<Self>> {
        loop {
            let file = match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => {
                    return Err(DbError::OpenFailed(format!(
                        "cannot open '{}': {}",
                        path.display(),
                        e
                    ))
                    .into())
                }
            };

            file.lock_exclusive().map_err(|e| {
                DbError::OpenFailed(format!("cannot lock '{}': {}", path.display(), e))
            })?;

            if Self::still_linked(&file, path)? {
                return Ok(Some(Self { file }));
            }
            let _ = FileExt::unlock(&file);
        }
    }

    fn still_linked(file: &File, path: &Path) -> Result<bool> {
        let locked_ino = file.metadata().wrap_err("failed to stat locked file")?.ino();
        match fs::metadata(path) {
            Ok(m) => Ok(m.ino() == locked_ino),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).wrap_err("failed to re-stat lock file path"),
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for BoundaryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Releases a CAS lock when dropped, so a panic inside a critical section
/// cannot strand the lock with a live owner.
struct LockGuard<'a> {
    info: &'a SharedInfo,
    slot: usize,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let prev = self.info.slot(self.slot).swap(0, Ordering::AcqRel);
        debug_assert_eq!(prev, self.info.token, "released a lock owned by another");
    }
}

/// A handle's attachment to the shared info region.
#[derive(Debug)]
pub(crate) struct SharedInfo {
    map: MmapRaw,
    path: PathBuf,
    token: u64,
}

impl SharedInfo {
    /// Maps the region under an already-held boundary lock, initializing or
    /// recovering it as needed, and registers this handle as an opener.
    ///
    /// `store` supplies the durable commit point that seeds the ring when
    /// the region is (re)initialized.
    pub fn attach(boundary: &BoundaryLock, path: &Path, store: &PersistentStore) -> Result<Self> {
        let file = boundary.file();
        let len = file.metadata().wrap_err("failed to stat lock file")?.len();

        if len != INFO_LEN {
            // Fresh file, or a creator died before set_len finished.
            ensure!(
                len < INFO_LEN,
                "lock file '{}' has unexpected length {}",
                path.display(),
                len
            );
            file.set_len(INFO_LEN)
                .wrap_err("failed to size lock file")?;
        }

        let map = MmapRaw::map_raw(file).map_err(|e| {
            DbError::OpenFailed(format!("cannot map '{}': {}", path.display(), e))
        })?;

        let info = Self {
            map,
            path: path.to_path_buf(),
            token: new_token(),
        };

        let magic = info.slot(SLOT_MAGIC).load(Ordering::Acquire);
        let initialized = info.slot(SLOT_INIT_COMPLETE).load(Ordering::Acquire) == 1;

        if magic == INFO_MAGIC {
            let format = info.slot(SLOT_FORMAT).load(Ordering::Acquire);
            if format != INFO_FORMAT {
                return Err(DbError::Unsupported {
                    found: format as u32,
                    expected: INFO_FORMAT as u32,
                }
                .into());
            }

            if !initialized {
                // Initialization happens under the boundary lock we hold, so
                // an incomplete handshake means its initializer died.
                info.initialize(snapshot_of(store)?)?;
                info!(path = %path.display(), "reinitialized half-built shared info region");
            } else {
                let report = recovery::sweep(&info);
                if report.live_openers == 0 {
                    // Every registered opener is dead; leaked pins and stale
                    // locks vanish with the rebuild.
                    info.initialize(snapshot_of(store)?)?;
                    info!(
                        path = %path.display(),
                        cleared = report.cleared_pids,
                        "reinitialized stale shared info region"
                    );
                }
            }
        } else if magic == 0 {
            // Fresh file, or a creator died before writing the magic.
            info.initialize(snapshot_of(store)?)?;
            info!(path = %path.display(), "initialized shared info region");
        } else {
            return Err(DbError::OpenFailed(format!(
                "lock file '{}' is not a TideDB info region",
                path.display()
            ))
            .into());
        }

        info.register()?;
        debug!(
            path = %path.display(),
            open_count = info.open_count(),
            "attached to shared info region"
        );
        Ok(info)
    }

    /// Writes a pristine region: locks cleared, opener table empty, ring
    /// seeded with the durable commit point. Caller holds the boundary lock
    /// and has verified no live opener remains.
    fn initialize(&self, seed: Snapshot) -> Result<()> {
        for idx in 0..SLOT_COUNT {
            self.slot(idx).store(0, Ordering::Relaxed);
        }

        self.slot(SLOT_FORMAT).store(INFO_FORMAT, Ordering::Relaxed);
        ring::seed(self, seed);
        self.slot(SLOT_MAGIC).store(INFO_MAGIC, Ordering::Release);
        self.slot(SLOT_INIT_COMPLETE).store(1, Ordering::Release);
        Ok(())
    }

    /// Records this handle in the opener table. Fails when more than
    /// `PID_SLOTS` distinct processes hold the database open.
    fn register(&self) -> Result<()> {
        let pid = std::process::id() as u64;
        let mut empty = None;

        for idx in 0..PID_SLOTS {
            let slot = self.slot(PID_TABLE_BASE + idx);
            let entry = slot.load(Ordering::Acquire);
            if entry >> 32 == pid {
                slot.store((pid << 32) | ((entry & 0xffff_ffff) + 1), Ordering::Release);
                self.slot(SLOT_OPEN_COUNT).fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
            if entry == 0 && empty.is_none() {
                empty = Some(idx);
            }
        }

        match empty {
            Some(idx) => {
                self.slot(PID_TABLE_BASE + idx)
                    .store((pid << 32) | 1, Ordering::Release);
                self.slot(SLOT_OPEN_COUNT).fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            None => Err(DbError::OpenFailed(format!(
                "opener table full ({} processes)",
                PID_SLOTS
            ))
            .into()),
        }
    }

    /// Deregisters this handle under the boundary lock; unlinks the lock
    /// file when the last handle detaches. Returns whether the file was
    /// removed.
    pub fn detach(self) -> Result<bool> {
        let Some(_boundary) = BoundaryLock::acquire_existing(&self.path)? else {
            // Someone else concluded teardown already (crash recovery path).
            warn!(path = %self.path.display(), "lock file vanished before detach");
            return Ok(true);
        };

        let pid = std::process::id() as u64;
        for idx in 0..PID_SLOTS {
            let slot = self.slot(PID_TABLE_BASE + idx);
            let entry = slot.load(Ordering::Acquire);
            if entry >> 32 == pid {
                let handles = entry & 0xffff_ffff;
                let next = if handles <= 1 { 0 } else { (pid << 32) | (handles - 1) };
                slot.store(next, Ordering::Release);
                break;
            }
        }

        let remaining = self
            .slot(SLOT_OPEN_COUNT)
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);

        if remaining == 0 {
            fs::remove_file(&self.path).wrap_err("failed to remove lock file")?;
            info!(path = %self.path.display(), "removed lock file on last close");
            return Ok(true);
        }

        debug!(path = %self.path.display(), remaining, "detached from shared info region");
        Ok(false)
    }

    /// The slot at `idx` as a cross-process atomic.
    pub(crate) fn slot(&self, idx: usize) -> &AtomicU64 {
        debug_assert!(idx < SLOT_COUNT);
        // SAFETY: the mapping is INFO_LEN bytes and page-aligned, so slot idx
        // lies within it at 8-byte alignment. The region is only ever
        // accessed through AtomicU64 operations, which are hardware-atomic
        // on MAP_SHARED memory on 64-bit Unix targets; the mapping lives as
        // long as self.
        unsafe { &*self.map.as_mut_ptr().cast::<AtomicU64>().add(idx) }
    }

    fn acquire_lock(&self, slot: usize, what: &str) -> LockGuard<'_> {
        let mut spins = 0u32;
        loop {
            match self.slot(slot).compare_exchange(
                0,
                self.token,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return LockGuard { info: self, slot },
                Err(owner) => {
                    spins = spins.wrapping_add(1);
                    // Probe the owner occasionally; stealing from a live
                    // process must never happen, probing every spin is waste.
                    if spins % 1024 == 0
                        && owner != 0
                        && !recovery::process_alive(token_pid(owner))
                        && self
                            .slot(slot)
                            .compare_exchange(owner, self.token, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        warn!(
                            owner_pid = token_pid(owner),
                            lock = what,
                            "recovered lock from dead process"
                        );
                        return LockGuard { info: self, slot };
                    }
                    backoff(spins);
                }
            }
        }
    }

    /// Runs `f` under the process lock. Every info-region mutation outside
    /// attach/detach goes through here.
    pub fn with_info<R>(&self, f: impl FnOnce(&SharedInfo) -> R) -> R {
        let _guard = self.acquire_lock(SLOT_PROCESS_LOCK, "process");
        f(self)
    }

    /// Blocks until this handle holds the system-wide writer lock.
    pub fn lock_writer(&self) {
        std::mem::forget(self.acquire_lock(SLOT_WRITER_LOCK, "writer"));
    }

    pub fn unlock_writer(&self) {
        let prev = self.slot(SLOT_WRITER_LOCK).swap(0, Ordering::AcqRel);
        debug_assert_eq!(prev, self.token, "writer lock owned by another handle");
    }

    pub fn open_count(&self) -> u64 {
        self.slot(SLOT_OPEN_COUNT).load(Ordering::Acquire)
    }
}
