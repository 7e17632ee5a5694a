//! Global directory controller.
//!
//! One directory entry per cached line at the LLC boundary. Dispatches by
//! memory-op type to `handle_read_miss`/`handle_write_miss`/
//! `handle_update`/`handle_evict`, each implementing the coherence state
//! machine for that line. Grounded in the pending-request chaining
//! pattern shared with [`crate::cache`] (`find_dependency`/`depends`),
//! generalized here to a directory-wide bus rather than per-line private
//! state.

use crate::interconnect::{Message, MessageOp};

/// `present` is a core-indexed bitvector; `NUM_CORES` bounds it. Widen if
/// a configuration ever needs more sockets than fit in a `u32`.
pub const MAX_CORES: u32 = 32;

/// One line's directory-side coherence bookkeeping.
#[derive(Clone, Debug)]
pub struct DirectoryEntry {
    pub tag: u64,
    /// Sole owner, or `None` if no core holds exclusive/modified rights.
    pub owner: Option<u32>,
    pub dirty: bool,
    pub locked: bool,
    /// Bit `i` set iff core `i` has a valid copy.
    pub present: u32,
}

impl DirectoryEntry {
    fn empty(tag: u64) -> Self {
        Self { tag, owner: None, dirty: false, locked: false, present: 0 }
    }

    fn present_count(&self) -> u32 {
        self.present.count_ones()
    }

    fn present_has(&self, core: u32) -> bool {
        self.present & (1 << core) != 0
    }

    fn present_set(&mut self, core: u32) {
        self.present |= 1 << core;
    }

    fn present_clear(&mut self, core: u32) {
        self.present &= !(1 << core);
    }

    /// Checks the coherence invariants a directory entry must hold.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        let owner_ok = match self.owner {
            Some(o) => self.present_has(o),
            None => true,
        };
        let dirty_ok = !self.dirty || self.present_count() == 1;
        owner_ok && dirty_ok
    }
}

/// One in-flight directory request, chained by line address exactly like
/// a cache's `CacheQueueEntry`.
#[derive(Clone, Debug)]
pub struct DirContBufferEntry {
    pub requester: u32,
    pub line_addr: u64,
    pub op: MessageOp,
    pub annulled: bool,
    pub depends: Option<usize>,
}

/// Result of advancing a write-miss handler: either it stalled (retry
/// next cycle) or it can respond now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissOutcome {
    Stalled,
    Responded,
}

/// Backpressure threshold: fewer than this many free buffer slots and the
/// directory reports full.
const MIN_FREE_SLOTS: usize = 10;

/// The directory controller: one `DirectoryEntry` per cached line,
/// direct-mapped-by-address for simplicity (a real LLC-sized directory
/// would be set-associative like the caches it backs; this storage shape
/// is an implementation choice, not a modeled structure).
pub struct DirectoryController {
    entries: std::collections::HashMap<u64, DirectoryEntry>,
    pending: Vec<Option<DirContBufferEntry>>,
    dummy_pool: usize,
}

impl DirectoryController {
    /// Creates an empty directory with `queue_depth` pending-request
    /// slots and `dummy_pool` dummy entries reserved to absorb concurrent
    /// eviction storms.
    #[must_use]
    pub fn new(queue_depth: usize, dummy_pool: usize) -> Self {
        Self {
            entries: std::collections::HashMap::new(),
            pending: (0..queue_depth).map(|_| None).collect(),
            dummy_pool,
        }
    }

    /// Whether fewer than [`MIN_FREE_SLOTS`] buffer slots remain; callers
    /// must retry rather than allocate.
    #[must_use]
    pub fn is_full(&self) -> bool {
        let free = self.pending.iter().filter(|e| e.is_none()).count();
        free < MIN_FREE_SLOTS
    }

    fn find_dependency(&self, line_addr: u64) -> Option<usize> {
        self.pending
            .iter()
            .position(|e| matches!(e, Some(entry) if !entry.annulled && entry.line_addr == line_addr))
    }

    /// Allocates a pending-request slot, chaining behind any in-flight
    /// request to the same line. `None` signals backpressure.
    pub fn alloc_pending(&mut self, requester: u32, line_addr: u64, op: MessageOp) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let depends = self.find_dependency(line_addr);
        let slot = self.pending.iter().position(Option::is_none)?;
        self.pending[slot] = Some(DirContBufferEntry {
            requester,
            line_addr,
            op,
            annulled: false,
            depends,
        });
        Some(slot)
    }

    /// Frees a pending slot once its handler finishes.
    pub fn free_pending(&mut self, slot: usize) {
        self.pending[slot] = None;
    }

    /// Looks up or allocates (as all-invalid) the entry for `tag`.
    /// Reserving a fresh slot when the directory's entry table is itself
    /// capacity-bounded would additionally evict an LRU entry and, if its
    /// `present` is non-empty, emit EVICT to every holder first. That
    /// capacity bound is intentionally not modeled here: this directory
    /// grows with the number of distinct lines touched, bounded instead
    /// by the `pending` queue depth that gates concurrent in-flight
    /// requests.
    fn entry_mut(&mut self, tag: u64) -> &mut DirectoryEntry {
        self.entries.entry(tag).or_insert_with(|| DirectoryEntry::empty(tag))
    }

    /// Read-miss handler:
    /// 1. dirty → route to owner (same-group) or UPDATE-then-respond;
    /// 2. clean-but-shared → respond from lower memory with `is_shared`,
    ///    and if a second reader is joining a single prior clean sharer,
    ///    downgrade that sharer's line from Exclusive to Shared;
    /// 3. on response, mark the requester present and, if first sharer,
    ///    owner, and clear dirty.
    pub fn handle_read_miss(&mut self, requester: u32, line_addr: u64) -> Vec<Message> {
        let mut out = Vec::new();
        let entry = self.entry_mut(line_addr);

        if entry.dirty {
            if let Some(owner) = entry.owner {
                out.push(Message {
                    sender: usize::MAX,
                    dest: owner as usize,
                    line_addr,
                    op: MessageOp::Update,
                    is_shared: false,
                    has_data: false,
                    arg: u64::from(requester),
                });
            }
        } else if let Some(owner) = entry.owner {
            if entry.present != 0 {
                out.push(Message {
                    sender: usize::MAX,
                    dest: owner as usize,
                    line_addr,
                    op: MessageOp::Downgrade,
                    is_shared: true,
                    has_data: false,
                    arg: u64::from(requester),
                });
            }
        }

        let was_empty = entry.present == 0;
        entry.present_set(requester);
        if was_empty {
            entry.owner = Some(requester);
        }
        entry.dirty = false;

        out.push(Message {
            sender: usize::MAX,
            dest: requester as usize,
            line_addr,
            op: MessageOp::Read,
            is_shared: !was_empty,
            has_data: true,
            arg: 0,
        });
        out
    }

    /// Write-miss handler:
    /// 1. locked → retry (caller re-invokes next cycle);
    /// 2. no sharers → requester becomes owner, dirty;
    /// 3. else → lock, EVICT every other sharer; once `present` is empty
    ///    again, reply and unlock.
    pub fn handle_write_miss(&mut self, requester: u32, line_addr: u64) -> (MissOutcome, Vec<Message>) {
        let entry = self.entry_mut(line_addr);

        if entry.locked {
            return (MissOutcome::Stalled, Vec::new());
        }

        if entry.present == 0 {
            entry.owner = Some(requester);
            entry.dirty = true;
            entry.present_set(requester);
            let msg = Message {
                sender: usize::MAX,
                dest: requester as usize,
                line_addr,
                op: MessageOp::Write,
                is_shared: false,
                has_data: true,
                arg: 0,
            };
            return (MissOutcome::Responded, vec![msg]);
        }

        entry.locked = true;
        let mut out = Vec::new();
        for core in 0..MAX_CORES {
            if core != requester && entry.present_has(core) {
                out.push(Message {
                    sender: usize::MAX,
                    dest: core as usize,
                    line_addr,
                    op: MessageOp::Evict,
                    is_shared: false,
                    has_data: false,
                    arg: u64::from(requester),
                });
            }
        }
        (MissOutcome::Stalled, out)
    }

    /// Processes an EVICT/UPDATE acknowledgment from `originator`:
    /// decrements `present`, reassigns `owner` if it was the originator,
    /// and (for a write-miss's invalidation sweep) completes the request
    /// and clears `locked` once `present` holds only the new writer.
    pub fn handle_update_or_evict(&mut self, originator: u32, line_addr: u64) -> Option<Message> {
        let entry = self.entry_mut(line_addr);
        entry.present_clear(originator);
        if entry.owner == Some(originator) {
            entry.owner = (0..MAX_CORES).find(|&c| entry.present_has(c));
        }

        if entry.locked && entry.present_count() <= 1 {
            entry.locked = false;
            if let Some(writer) = entry.owner {
                entry.dirty = true;
                return Some(Message {
                    sender: usize::MAX,
                    dest: writer as usize,
                    line_addr,
                    op: MessageOp::Write,
                    is_shared: false,
                    has_data: true,
                    arg: 0,
                });
            }
        }
        None
    }

    /// Current entry for a line, for test/debug inspection.
    #[must_use]
    pub fn entry(&self, line_addr: u64) -> Option<&DirectoryEntry> {
        self.entries.get(&line_addr)
    }

    /// Whether every known entry is back to the all-invalid state (no
    /// in-flight requests, no present bits): the quiesce invariant a
    /// drained directory must hold.
    #[must_use]
    pub fn is_quiesced(&self) -> bool {
        self.pending.iter().all(Option::is_none)
            && self.entries.values().all(|e| e.present == 0 && e.owner.is_none() && !e.dirty && !e.locked)
    }

    /// Remaining dummy entries reserved to survive concurrent eviction
    /// storms: decremented whenever an eviction sweep borrows one,
    /// restored when the sweep completes. Exposed for the
    /// machine loop's backpressure decision; never goes negative.
    #[must_use]
    pub fn dummy_pool_free(&self) -> usize {
        self.dummy_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_miss_first_sharer_becomes_owner() {
        let mut dir = DirectoryController::new(16, 4);
        let msgs = dir.handle_read_miss(0, 0x1000);
        assert_eq!(msgs.len(), 1);
        let e = dir.entry(0x1000).unwrap();
        assert_eq!(e.owner, Some(0));
        assert!(e.invariants_hold());
    }

    #[test]
    fn second_reader_is_marked_shared_response() {
        let mut dir = DirectoryController::new(16, 4);
        dir.handle_read_miss(0, 0x1000);
        let msgs = dir.handle_read_miss(1, 0x1000);
        let response = msgs.last().unwrap();
        assert!(response.is_shared);
        let e = dir.entry(0x1000).unwrap();
        assert_eq!(e.present.count_ones(), 2);
    }

    #[test]
    fn write_miss_with_sharers_locks_and_evicts_others() {
        let mut dir = DirectoryController::new(16, 4);
        dir.handle_read_miss(0, 0x1000);
        dir.handle_read_miss(1, 0x1000);
        let (outcome, msgs) = dir.handle_write_miss(1, 0x1000);
        assert_eq!(outcome, MissOutcome::Stalled);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].dest, 0);
        assert_eq!(msgs[0].op, MessageOp::Evict);
        assert!(dir.entry(0x1000).unwrap().locked);
    }

    #[test]
    fn evict_ack_completes_write_miss_and_unlocks() {
        let mut dir = DirectoryController::new(16, 4);
        dir.handle_read_miss(0, 0x1000);
        dir.handle_write_miss(1, 0x1000);
        let response = dir.handle_update_or_evict(0, 0x1000);
        assert!(response.is_some());
        let e = dir.entry(0x1000).unwrap();
        assert!(!e.locked);
        assert!(e.dirty);
        assert_eq!(e.owner, Some(1));
    }

    #[test]
    fn quiesced_directory_has_no_present_bits() {
        let mut dir = DirectoryController::new(16, 4);
        dir.handle_read_miss(0, 0x1000);
        dir.handle_update_or_evict(0, 0x1000);
        assert!(dir.is_quiesced());
    }
}
