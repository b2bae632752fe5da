//! # SharedGroup
//!
//! `SharedGroup` is the per-handle transaction controller: it owns this
//! handle's mapping of the database file, its attachment to the shared info
//! region, and a state machine with exactly three states:
//!
//! ```text
//!          begin_read              begin_write
//!   Idle ─────────────> Reading      Idle ─────────────> Writing
//!   Idle <───────────── Reading      Idle <───────────── Writing
//!          end_read                    commit / rollback
//! ```
//!
//! One transaction per handle at a time; any other sequencing is a
//! `TransactionMisuse` error and never perturbs shared state. Handles are
//! independent - two handles in one process relate exactly like two handles
//! in different processes.
//!
//! ## Reads
//!
//! `begin_read` pins the newest ring descriptor and materializes the group
//! tree it names, bounded by that snapshot's committed size. Every later
//! commit only appends or rewrites extents the reuse gate proves no pin can
//! observe, so the view is stable until `end_read` unpins it.
//!
//! ## Writes
//!
//! `begin_write` takes the system-wide writer lock, then bases the working
//! tree on the *durable header* rather than the ring: if a previous writer
//! died between its header swap and its publish, the disk is one commit ahead
//! of shared memory, and the durable side is the truth the crashed commit
//! already promised. Commit then stages copy-on-write nodes, flushes,
//! swaps the header (the durability point), publishes the ring entry (the
//! visibility point), and releases the writer lock.
//!
//! ## Failure
//!
//! Errors before the header swap roll the transaction back implicitly -
//! nothing was published, the staged tail is unreachable. An error *during*
//! the header swap poisons the handle (`is_valid` turns false, every later
//! call fails `IoFailed`): the on-disk state is either the old or the new
//! commit, both consistent, but this handle can no longer tell which.
//!
//! ## Durability Modes
//!
//! `Durability::Full` (default) syncs data before the header swap and the
//! header after it - a crash preserves the last committed version.
//! `Durability::Relaxed` skips both syncs: commits are immediately visible
//! to every process through the shared mapping, but a machine crash may roll
//! back to an older version, or corrupt the file if writeback reorders
//! across the header flip. The tradeoff mirrors a pager's synchronous=OFF.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use tracing::{debug, info};

use crate::error::DbError;
use crate::group::Group;
use crate::storage::{node_total_len, CommitPoint, FreeExtent, Freelist, PersistentStore};

use super::info::{BoundaryLock, SharedInfo};
use super::ring::{self, Snapshot};

/// How hard a commit pushes bytes toward stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Sync data before the header swap and the header after it.
    #[default]
    Full,
    /// No syncing; a machine crash may lose or corrupt recent commits.
    Relaxed,
}

/// Builder for opening a [`SharedGroup`] with non-default settings.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    durability: Durability,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<SharedGroup> {
        SharedGroup::open_with(path.as_ref(), self)
    }
}

#[derive(Debug, Clone, Copy)]
enum TxnState {
    Idle,
    Reading { version: u64 },
    Writing { base: CommitPoint },
}

#[derive(Debug)]
pub struct SharedGroup {
    store: PersistentStore,
    info: Option<SharedInfo>,
    state: TxnState,
    group: Option<Group>,
    valid: bool,
    durability: Durability,
}

/// `<db path>.lock`, next to the database file.
fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

/// The info region of a live, unpoisoned handle. A free function over the
/// fields so callers keep disjoint borrows of the rest of the handle.
fn usable(info: &Option<SharedInfo>, valid: bool) -> Result<&SharedInfo> {
    if !valid {
        return Err(DbError::IoFailed("handle was invalidated by a failed commit".into()).into());
    }
    info.as_ref()
        .ok_or_else(|| DbError::TransactionMisuse("handle is closed").into())
}

impl SharedGroup {
    /// Opens (creating if absent) the database at `path` with default
    /// options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        OpenOptions::new().open(path)
    }

    pub fn options() -> OpenOptions {
        OpenOptions::new()
    }

    fn open_with(path: &Path, options: OpenOptions) -> Result<Self> {
        let lock_path = lock_path_for(path);

        // The boundary lock serializes creation, initialization, and the
        // last-closer teardown; everything after this block runs on the
        // shared region's own locks.
        let boundary = BoundaryLock::acquire(&lock_path)?;

        let attached = (|| -> Result<(PersistentStore, SharedInfo)> {
            let store = if path.exists() {
                PersistentStore::open(path)?
            } else {
                PersistentStore::create(path, &Group::encode_empty_node())?
            };
            let info = SharedInfo::attach(&boundary, &lock_path, &store)?;
            Ok((store, info))
        })();

        let (store, info) = match attached {
            Ok(pair) => pair,
            Err(e) => {
                // A failed open must not leave a lock file that no handle
                // accounts for. We still hold the boundary lock, so removing
                // the file we just created cannot race a real opener.
                if boundary.file().metadata().map_or(false, |m| m.len() == 0) {
                    let _ = std::fs::remove_file(&lock_path);
                }
                return Err(e);
            }
        };
        drop(boundary);

        info!(path = %path.display(), "opened shared group");

        Ok(Self {
            store,
            info: Some(info),
            state: TxnState::Idle,
            group: None,
            valid: true,
            durability: options.durability,
        })
    }

    /// Whether this handle can still run transactions: open and not poisoned
    /// by a failed header publication.
    pub fn is_valid(&self) -> bool {
        self.valid && self.info.is_some()
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    fn materialize(store: &mut PersistentStore, snap: Snapshot, writable: bool) -> Result<Group> {
        store.ensure_mapped(snap.file_size)?;
        Group::decode(store, snap.root_offset, snap.file_size, writable)
    }

    /// Begins a snapshot read transaction. The returned view is immutable
    /// and stable until `end_read`, regardless of concurrent commits.
    pub fn begin_read(&mut self) -> Result<&Group> {
        let info = usable(&self.info, self.valid)?;
        if !matches!(self.state, TxnState::Idle) {
            return Err(
                DbError::TransactionMisuse("begin_read with a transaction already active").into(),
            );
        }

        let snap = ring::pin_latest(info);
        match Self::materialize(&mut self.store, snap, false) {
            Ok(group) => {
                self.state = TxnState::Reading {
                    version: snap.version,
                };
                Ok(&*self.group.insert(group))
            }
            Err(e) => {
                // Surface the error without leaking the pin.
                ring::unpin(info, snap.version);
                Err(e).wrap_err("begin_read failed")
            }
        }
    }

    /// Ends the active read transaction, releasing its snapshot pin.
    pub fn end_read(&mut self) -> Result<()> {
        let info = usable(&self.info, self.valid)?;
        match self.state {
            TxnState::Reading { version } => {
                self.group = None;
                ring::unpin(info, version);
                self.state = TxnState::Idle;
                Ok(())
            }
            _ => Err(DbError::TransactionMisuse("end_read without an active read").into()),
        }
    }

    /// Begins the (system-wide exclusive) write transaction, blocking until
    /// the writer lock is available. The returned view aliases unmodified
    /// committed nodes and stages every modification in memory.
    pub fn begin_write(&mut self) -> Result<&mut Group> {
        let info = usable(&self.info, self.valid)?;
        if !matches!(self.state, TxnState::Idle) {
            return Err(
                DbError::TransactionMisuse("begin_write with a transaction already active").into(),
            );
        }

        info.lock_writer();

        let prepared = self.store.read_root().and_then(|base| {
            let group = Self::materialize(
                &mut self.store,
                Snapshot {
                    version: base.version,
                    root_offset: base.root_offset,
                    file_size: base.file_size,
                },
                true,
            )?;
            Ok((base, group))
        });

        match prepared {
            Ok((base, group)) => {
                self.state = TxnState::Writing { base };
                Ok(self.group.insert(group))
            }
            Err(e) => {
                info.unlock_writer();
                Err(e).wrap_err("begin_write failed")
            }
        }
    }

    /// Commits the active write transaction: stages become durable, then
    /// visible, then the writer lock is released.
    pub fn commit(&mut self) -> Result<()> {
        let info = usable(&self.info, self.valid)?;
        let (base, mut group) = match (self.state, self.group.take()) {
            (TxnState::Writing { base }, Some(group)) => (base, group),
            (_, group) => {
                self.group = group;
                return Err(
                    DbError::TransactionMisuse("commit outside a write transaction").into(),
                );
            }
        };

        match Self::write_commit(&mut self.store, info, &mut group, base, self.durability) {
            Ok(commit) => {
                ring::publish(
                    info,
                    Snapshot {
                        version: commit.version,
                        root_offset: commit.root_offset,
                        file_size: commit.file_size,
                    },
                );
                info.unlock_writer();
                self.state = TxnState::Idle;
                debug!(version = commit.version, "committed write transaction");
                Ok(())
            }
            Err(CommitError::Staging(e)) => {
                // Implicit rollback: nothing was published, the staged tail
                // is unreachable and will be overwritten by the next commit.
                info.unlock_writer();
                self.state = TxnState::Idle;
                Err(e.wrap_err(DbError::IoFailed(
                    "commit failed before publication; transaction rolled back".into(),
                )))
            }
            Err(CommitError::HeaderSwap(e)) => {
                // The on-disk state is the old or the new commit - both
                // consistent - but this handle can no longer tell which.
                self.valid = false;
                info.unlock_writer();
                self.state = TxnState::Idle;
                Err(e.wrap_err(DbError::IoFailed(
                    "header publication failed; handle invalidated".into(),
                )))
            }
        }
    }

    /// Abandons the active write transaction. No version is published and no
    /// reader in any process ever observes the staged changes.
    pub fn rollback(&mut self) -> Result<()> {
        let info = usable(&self.info, self.valid)?;
        match self.state {
            TxnState::Writing { .. } => {
                self.group = None;
                info.unlock_writer();
                self.state = TxnState::Idle;
                debug!("rolled back write transaction");
                Ok(())
            }
            _ => Err(DbError::TransactionMisuse("rollback outside a write transaction").into()),
        }
    }

    /// Closes the handle: aborts any live transaction, detaches from the
    /// info region, and - as the last closer - removes the lock file.
    /// Idempotent; also runs on drop.
    pub fn close(&mut self) -> Result<()> {
        let Some(info) = self.info.take() else {
            return Ok(());
        };

        match self.state {
            TxnState::Reading { version } => {
                self.group = None;
                ring::unpin(&info, version);
            }
            TxnState::Writing { .. } => {
                self.group = None;
                info.unlock_writer();
            }
            TxnState::Idle => {}
        }
        self.state = TxnState::Idle;

        info.detach()?;
        Ok(())
    }

    /// Exercises ring invariants on the live region: a pin/unpin cycle must
    /// round-trip and every structural check must hold before and after.
    #[cfg(debug_assertions)]
    pub fn verify_ring(&self) -> Result<()> {
        let info = usable(&self.info, self.valid)?;
        ring::check(info);
        let snap = ring::pin_latest(info);
        ring::check(info);
        ring::unpin(info, snap.version);
        ring::check(info);
        Ok(())
    }

    fn write_commit(
        store: &mut PersistentStore,
        info: &SharedInfo,
        group: &mut Group,
        base: CommitPoint,
        durability: Durability,
    ) -> std::result::Result<CommitPoint, CommitError> {
        let staged = (|| -> Result<CommitPoint> {
            // The ring can lag the disk by one commit (writer died between
            // swap and publish); the new version must clear both.
            let new_version = ring::latest(info).version.max(base.version) + 1;

            if !group.is_dirty() {
                // An empty commit still publishes a new version over the
                // same tree.
                return Ok(CommitPoint {
                    version: new_version,
                    ..base
                });
            }

            let mut freelist = Freelist::load(store, base.freelist_offset, base.file_size)?;
            if base.freelist_offset != 0 {
                // The free-list node itself is replaced every commit.
                let (_, payload) = store.node(base.freelist_offset, base.file_size)?;
                freelist.push(FreeExtent {
                    offset: base.freelist_offset,
                    len: node_total_len(payload.len()),
                    freed_version: new_version,
                });
            }

            // Reuse gate: an extent is only overwritten when no pinned
            // snapshot can reach it AND it is already unreachable from the
            // current durable header - extents freed by this very commit
            // stay untouched until the swap lands, or a crash here would
            // corrupt the state the old header still names.
            let reclaim_before = ring::oldest_pinned(info)
                .unwrap_or(u64::MAX)
                .min(base.version);

            store.begin_write_at(base.file_size);
            let root_offset = group.serialize(store, &mut freelist, new_version, reclaim_before)?;

            freelist.coalesce();
            let freelist_offset = if freelist.is_empty() {
                0
            } else {
                let mut out = Vec::new();
                freelist.encode(&mut out);
                store.append(&out)?
            };

            let commit = CommitPoint {
                version: new_version,
                root_offset,
                file_size: store.tail(),
                freelist_offset,
            };

            if durability == Durability::Full {
                store.flush_data()?;
            }
            Ok(commit)
        })()
        .map_err(CommitError::Staging)?;

        store
            .swap_header(staged, durability == Durability::Full)
            .map_err(CommitError::HeaderSwap)?;

        Ok(staged)
    }
}

enum CommitError {
    /// Failure before the header swap; implicit rollback.
    Staging(eyre::Report),
    /// Failure at the durability point; the handle is poisoned.
    HeaderSwap(eyre::Report),
}

impl Drop for SharedGroup {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
