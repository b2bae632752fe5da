//! # Region Recovery
//!
//! A process can die at any point while attached: holding a lock, holding a
//! reader pin, or registered in the opener table. Recovery happens in two
//! places:
//!
//! - **Steady state**: a waiter that observes a lock owned by a dead pid
//!   steals it with a CAS (see `SharedInfo::acquire_lock`).
//! - **Attach time**: under the boundary lock, `sweep` clears opener-table
//!   entries and lock words owned by dead pids and recomputes `open_count`.
//!   If no live opener remains, the caller reinitializes the whole region
//!   from the durable header, which also discards any reader counts leaked
//!   by crashed readers.
//!
//! Individual reader counts are deliberately never decremented here: a pin
//! belongs to a handle, not a pid, and several handles in one process may pin
//! the same version. The conservative rule - recover pins only by whole-region
//! rebuild when nobody is left - can never misidentify a live reader as dead.
//!
//! Liveness is probed with `kill(pid, 0)`, which checks for existence without
//! signaling. `EPERM` means the pid exists but belongs to another user; that
//! counts as alive. A recycled pid makes a dead owner look alive, which only
//! delays recovery, never corrupts it.

use std::sync::atomic::Ordering;

use tracing::warn;

use super::info::{
    token_pid, SharedInfo, PID_SLOTS, PID_TABLE_BASE, SLOT_OPEN_COUNT, SLOT_PROCESS_LOCK,
    SLOT_WRITER_LOCK,
};

/// Whether a process with this pid currently exists.
pub(crate) fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs only the existence/permission
    // check; no signal is delivered.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SweepReport {
    /// Opener-table entries cleared because their process is gone.
    pub cleared_pids: usize,
    /// Handles still held by live processes after the sweep.
    pub live_openers: u64,
}

/// Clears state owned by dead processes and recomputes `open_count`.
/// Caller holds the boundary lock, so no attach or detach races this.
pub(crate) fn sweep(info: &SharedInfo) -> SweepReport {
    let mut cleared_pids = 0usize;
    let mut live_openers = 0u64;

    for idx in 0..PID_SLOTS {
        let slot = info.slot(PID_TABLE_BASE + idx);
        let entry = slot.load(Ordering::Acquire);
        if entry == 0 {
            continue;
        }

        let pid = (entry >> 32) as u32;
        let handles = entry & 0xffff_ffff;
        if process_alive(pid) {
            live_openers += handles;
        } else {
            slot.store(0, Ordering::Release);
            cleared_pids += 1;
            warn!(pid, handles, "cleared dead opener");
        }
    }

    info.slot(SLOT_OPEN_COUNT)
        .store(live_openers, Ordering::Release);

    for lock in [SLOT_PROCESS_LOCK, SLOT_WRITER_LOCK] {
        let slot = info.slot(lock);
        let owner = slot.load(Ordering::Acquire);
        if owner != 0 && !process_alive(token_pid(owner)) {
            slot.store(0, Ordering::Release);
            warn!(owner_pid = token_pid(owner), "cleared lock held by dead process");
        }
    }

    SweepReport {
        cleared_pids,
        live_openers,
    }
}
