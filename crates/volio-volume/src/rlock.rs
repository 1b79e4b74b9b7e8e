//! Byte-range reader/writer locks
//!
//! Each volume owns one [`RangeLockTable`] mapping byte intervals to
//! reader/writer ownership. Grants and waiters live in owned vectors
//! rather than pointer-chained nodes.
//!
//! Fairness: first-requested-first-granted. A request is granted only when
//! no conflicting grant overlaps it AND no earlier-ticketed waiter
//! conflicts with it, so a stream of overlapping readers cannot starve a
//! queued writer.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use volio_common::ByteRange;

/// Lock mode for a byte interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// May overlap other readers
    Reader,
    /// Excludes all overlapping readers and writers
    Writer,
}

const fn conflicts(a: LockMode, b: LockMode) -> bool {
    !matches!((a, b), (LockMode::Reader, LockMode::Reader))
}

struct Grant {
    id: u64,
    range: ByteRange,
    mode: LockMode,
}

struct Waiter {
    ticket: u64,
    range: ByteRange,
    mode: LockMode,
}

#[derive(Default)]
struct TableState {
    granted: Vec<Grant>,
    waiting: Vec<Waiter>,
    next_id: u64,
    next_ticket: u64,
}

#[derive(Default)]
struct TableShared {
    state: Mutex<TableState>,
    cond: Condvar,
}

/// Per-volume interval lock table. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct RangeLockTable {
    shared: Arc<TableShared>,
}

impl RangeLockTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `range` can be granted under `mode`.
    pub fn lock(&self, range: ByteRange, mode: LockMode) -> RangeLockGuard {
        let mut state = self.shared.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiting.push(Waiter {
            ticket,
            range,
            mode,
        });

        loop {
            let blocked_by_grant = state
                .granted
                .iter()
                .any(|g| g.range.overlaps(&range) && conflicts(mode, g.mode));
            let blocked_by_earlier = state
                .waiting
                .iter()
                .any(|w| w.ticket < ticket && w.range.overlaps(&range) && conflicts(mode, w.mode));

            if !blocked_by_grant && !blocked_by_earlier {
                state.waiting.retain(|w| w.ticket != ticket);
                let id = state.next_id;
                state.next_id += 1;
                state.granted.push(Grant { id, range, mode });
                return RangeLockGuard {
                    shared: Arc::clone(&self.shared),
                    id,
                    range,
                    mode,
                };
            }
            self.shared.cond.wait(&mut state);
        }
    }

    /// Number of currently granted intervals.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().granted.len()
    }

    /// Assert that no guards are outstanding. Destroying the table while
    /// intervals are held is a programming error.
    pub fn assert_idle(&self) {
        let state = self.shared.state.lock();
        assert!(
            state.granted.is_empty(),
            "range lock table destroyed with {} outstanding guards",
            state.granted.len()
        );
    }
}

/// An interval grant; releasing it wakes any waiter whose remaining
/// blocking intervals have all cleared.
pub struct RangeLockGuard {
    shared: Arc<TableShared>,
    id: u64,
    range: ByteRange,
    mode: LockMode,
}

impl RangeLockGuard {
    /// The granted interval.
    #[must_use]
    pub const fn range(&self) -> ByteRange {
        self.range
    }

    /// The granted mode.
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for RangeLockGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.granted.retain(|g| g.id != self.id);
        self.shared.cond.notify_all();
    }
}
