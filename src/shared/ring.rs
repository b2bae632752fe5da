//! # Version Ring
//!
//! The ring tracks the committed versions that are still alive: the newest
//! one (the baseline for the next writer) plus every older one some reader
//! has pinned. Each descriptor is four slots in the info region:
//!
//! ```text
//! +0  version        commit that produced this snapshot
//! +1  root_offset    byte offset of the tree root
//! +2  file_size      committed size when published
//! +3  reader_count   live readers pinned here
//! ```
//!
//! Logical entries run from the tail (oldest) to `ring_head` (newest),
//! `ring_len` of them, in a circular array of `RING_CAP` descriptors.
//!
//! ## Protocol
//!
//! - `pin_latest` (readers): under the process lock, copy the head entry and
//!   increment its reader count.
//! - `unpin` (readers): under the process lock, find the entry by version and
//!   decrement. A zero-reader entry older than the head is reclaimable.
//! - `publish` (the writer, also holding the writer lock): evict zero-reader
//!   tail entries as needed, then write the next descriptor and advance the
//!   head. Readers pinning before the head store see the previous version;
//!   after it, the new one - publication is atomic at that store.
//!
//! ## Capacity Policy
//!
//! `RING_CAP` is 32 descriptors. When the ring is full and even the tail
//! entry is pinned, `publish` blocks, polling with backoff until a reader
//! unpins. The head entry is never evicted regardless of its reader count.
//!
//! Eviction is tail-only: a long-lived pin low in the ring holds every entry
//! above it, which is exactly the set of versions such a reader may yet
//! observe through the free-list reuse gate.

use std::sync::atomic::Ordering;

use tracing::warn;

use super::info::{
    backoff, SharedInfo, RING_BASE, RING_CAP, RING_ENTRY_SLOTS, SLOT_CURRENT_VERSION,
    SLOT_RING_HEAD, SLOT_RING_LEN,
};

const F_VERSION: usize = 0;
const F_ROOT: usize = 1;
const F_SIZE: usize = 2;
const F_READERS: usize = 3;

/// A pinned (or observed) committed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub version: u64,
    pub root_offset: u64,
    pub file_size: u64,
}

fn field(info: &SharedInfo, entry: usize, field: usize) -> &std::sync::atomic::AtomicU64 {
    info.slot(RING_BASE + (entry % RING_CAP) * RING_ENTRY_SLOTS + field)
}

fn head(info: &SharedInfo) -> usize {
    info.slot(SLOT_RING_HEAD).load(Ordering::SeqCst) as usize
}

fn len(info: &SharedInfo) -> usize {
    info.slot(SLOT_RING_LEN).load(Ordering::SeqCst) as usize
}

/// Entry index `steps` positions behind the head.
fn behind(head: usize, steps: usize) -> usize {
    (head + RING_CAP - steps) % RING_CAP
}

fn read_entry(info: &SharedInfo, entry: usize) -> Snapshot {
    Snapshot {
        version: field(info, entry, F_VERSION).load(Ordering::SeqCst),
        root_offset: field(info, entry, F_ROOT).load(Ordering::SeqCst),
        file_size: field(info, entry, F_SIZE).load(Ordering::SeqCst),
    }
}

/// Writes the initial single-entry ring during region initialization. The
/// caller holds the boundary lock; nobody else can observe the region yet.
pub(crate) fn seed(info: &SharedInfo, snap: Snapshot) {
    field(info, 0, F_VERSION).store(snap.version, Ordering::SeqCst);
    field(info, 0, F_ROOT).store(snap.root_offset, Ordering::SeqCst);
    field(info, 0, F_SIZE).store(snap.file_size, Ordering::SeqCst);
    field(info, 0, F_READERS).store(0, Ordering::SeqCst);

    info.slot(SLOT_RING_HEAD).store(0, Ordering::SeqCst);
    info.slot(SLOT_RING_LEN).store(1, Ordering::SeqCst);
    info.slot(SLOT_CURRENT_VERSION)
        .store(snap.version, Ordering::SeqCst);
}

/// The newest committed snapshot, pinned for a read transaction.
pub(crate) fn pin_latest(info: &SharedInfo) -> Snapshot {
    info.with_info(|info| {
        let head = head(info);
        field(info, head, F_READERS).fetch_add(1, Ordering::SeqCst);
        read_entry(info, head)
    })
}

/// The newest committed snapshot, unpinned. The writer uses this while
/// holding the writer lock, which pins the baseline implicitly: the head
/// entry is never evicted.
pub(crate) fn latest(info: &SharedInfo) -> Snapshot {
    info.with_info(|info| read_entry(info, head(info)))
}

/// Releases a read transaction's pin on `version`.
pub(crate) fn unpin(info: &SharedInfo, version: u64) {
    info.with_info(|info| {
        let head = head(info);
        for steps in 0..len(info) {
            let entry = behind(head, steps);
            if field(info, entry, F_VERSION).load(Ordering::SeqCst) == version {
                let prev = field(info, entry, F_READERS).fetch_sub(1, Ordering::SeqCst);
                debug_assert!(prev > 0, "unpin of version {} with no readers", version);
                return;
            }
        }
        // A pinned entry cannot be evicted, so this is unreachable short of
        // a misbehaving caller; losing a count is better than poisoning.
        warn!(version, "unpin found no ring entry");
    });
}

/// Oldest version some reader still has pinned. The free-list reuse gate:
/// extents freed at or before this version stay untouched.
pub(crate) fn oldest_pinned(info: &SharedInfo) -> Option<u64> {
    info.with_info(|info| {
        let head = head(info);
        for steps in (0..len(info)).rev() {
            let entry = behind(head, steps);
            if field(info, entry, F_READERS).load(Ordering::SeqCst) > 0 {
                return Some(field(info, entry, F_VERSION).load(Ordering::SeqCst));
            }
        }
        None
    })
}

/// Publishes a new committed snapshot. Caller holds the writer lock and has
/// already made the commit durable; visibility happens here, atomically at
/// the head advance. Blocks while the ring is full of pinned entries.
pub(crate) fn publish(info: &SharedInfo, snap: Snapshot) {
    let mut spins = 0u32;
    loop {
        let published = info.with_info(|info| {
            let head = head(info);
            let mut len = len(info);

            // Reclaim from the tail; the head itself is never evicted.
            while len == RING_CAP {
                let tail = behind(head, len - 1);
                if len > 1 && field(info, tail, F_READERS).load(Ordering::SeqCst) == 0 {
                    len -= 1;
                    info.slot(SLOT_RING_LEN).store(len as u64, Ordering::SeqCst);
                } else {
                    return false;
                }
            }

            debug_assert!(
                snap.version > info.slot(SLOT_CURRENT_VERSION).load(Ordering::SeqCst),
                "published version must increase"
            );

            let new_head = (head + 1) % RING_CAP;
            field(info, new_head, F_VERSION).store(snap.version, Ordering::SeqCst);
            field(info, new_head, F_ROOT).store(snap.root_offset, Ordering::SeqCst);
            field(info, new_head, F_SIZE).store(snap.file_size, Ordering::SeqCst);
            field(info, new_head, F_READERS).store(0, Ordering::SeqCst);

            info.slot(SLOT_RING_HEAD)
                .store(new_head as u64, Ordering::SeqCst);
            info.slot(SLOT_RING_LEN)
                .store((len + 1) as u64, Ordering::SeqCst);
            info.slot(SLOT_CURRENT_VERSION)
                .store(snap.version, Ordering::SeqCst);
            true
        });

        if published {
            return;
        }
        // Every slot is pinned; wait for a reader to unpin.
        spins = spins.wrapping_add(1);
        backoff(spins.saturating_add(256));
    }
}

/// Structural invariants, checked under the process lock. Debug builds only;
/// production builds carry no self-check code.
#[cfg(any(test, debug_assertions))]
pub(crate) fn check(info: &SharedInfo) {
    info.with_info(|info| {
        let head = head(info);
        let len = len(info);
        assert!(len >= 1, "ring must retain the newest descriptor");
        assert!(len <= RING_CAP);
        assert!(head < RING_CAP);

        let newest = field(info, head, F_VERSION).load(Ordering::SeqCst);
        assert_eq!(
            newest,
            info.slot(SLOT_CURRENT_VERSION).load(Ordering::SeqCst),
            "head entry must carry current_version"
        );

        let mut prev = None;
        for steps in (0..len).rev() {
            let entry = behind(head, steps);
            let version = field(info, entry, F_VERSION).load(Ordering::SeqCst);
            if let Some(prev) = prev {
                assert!(version > prev, "ring versions must increase toward the head");
            }
            prev = Some(version);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Group;
    use crate::shared::info::BoundaryLock;
    use crate::storage::PersistentStore;
    use std::path::Path;
    use tempfile::tempdir;

    fn setup(dir: &Path) -> SharedInfo {
        let store =
            PersistentStore::create(dir.join("t.tdb"), &Group::encode_empty_node()).unwrap();
        let lock_path = dir.join("t.tdb.lock");
        let boundary = BoundaryLock::acquire(&lock_path).unwrap();
        SharedInfo::attach(&boundary, &lock_path, &store).unwrap()
    }

    fn snap(version: u64) -> Snapshot {
        Snapshot {
            version,
            root_offset: 192 + version * 8,
            file_size: 1024 + version,
        }
    }

    #[test]
    fn seeded_ring_pins_version_one() {
        let dir = tempdir().unwrap();
        let info = setup(dir.path());

        let pinned = pin_latest(&info);
        assert_eq!(pinned.version, 1);
        check(&info);

        unpin(&info, pinned.version);
        check(&info);
        info.detach().unwrap();
    }

    #[test]
    fn pin_before_publish_sees_previous_version() {
        let dir = tempdir().unwrap();
        let info = setup(dir.path());

        let old = pin_latest(&info);
        publish(&info, snap(2));

        assert_eq!(old.version, 1, "existing pin is untouched");
        assert_eq!(pin_latest(&info).version, 2, "new pins see the commit");
        assert_eq!(latest(&info).version, 2);

        unpin(&info, 1);
        unpin(&info, 2);
        check(&info);
        info.detach().unwrap();
    }

    #[test]
    fn oldest_pinned_gates_on_the_lowest_pin() {
        let dir = tempdir().unwrap();
        let info = setup(dir.path());

        assert_eq!(oldest_pinned(&info), None);

        let v1 = pin_latest(&info);
        publish(&info, snap(2));
        let v2 = pin_latest(&info);
        publish(&info, snap(3));

        assert_eq!(oldest_pinned(&info), Some(1));
        unpin(&info, v1.version);
        assert_eq!(oldest_pinned(&info), Some(2));
        unpin(&info, v2.version);
        assert_eq!(oldest_pinned(&info), None);

        info.detach().unwrap();
    }

    #[test]
    fn unpinned_entries_are_evicted_when_the_ring_fills() {
        let dir = tempdir().unwrap();
        let info = setup(dir.path());

        // Publish far beyond RING_CAP with no readers; every publish must
        // reclaim the tail without blocking.
        for version in 2..(RING_CAP as u64 * 3) {
            publish(&info, snap(version));
            check(&info);
        }

        assert_eq!(latest(&info).version, RING_CAP as u64 * 3 - 1);
        info.detach().unwrap();
    }

    #[test]
    fn pinned_tail_blocks_publish_until_unpinned() {
        let dir = tempdir().unwrap();
        let info = std::sync::Arc::new(setup(dir.path()));

        let pinned = pin_latest(&info);
        for version in 2..=(RING_CAP as u64) {
            publish(&info, snap(version));
        }
        // The ring now holds RING_CAP entries and the tail is pinned.

        let publisher = {
            let info = info.clone();
            std::thread::spawn(move || {
                publish(&info, snap(RING_CAP as u64 + 1));
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!publisher.is_finished(), "publish must wait for the pin");

        unpin(&info, pinned.version);
        publisher.join().unwrap();

        assert_eq!(latest(&info).version, RING_CAP as u64 + 1);
        check(&info);

        std::sync::Arc::try_unwrap(info).unwrap().detach().unwrap();
    }

    #[test]
    fn head_survives_eviction_even_unpinned() {
        let dir = tempdir().unwrap();
        let info = setup(dir.path());

        publish(&info, snap(2));
        // Nothing pinned anywhere; the newest entry must still be there.
        assert_eq!(latest(&info).version, 2);
        check(&info);

        info.detach().unwrap();
    }
}
