//! Reorder buffer.
//!
//! Circular-buffer allocation: entries are pushed at `tail` on dispatch
//! and retired from `head` only in order. A `RobTag` encodes the physical slot
//! plus a wraparound epoch, so recovery (`flush_after`) is a pure
//! index-range operation and a stale tag from a squashed entry can never
//! alias a later occupant of the same slot.

use crate::common::addr::VirtAddr;
use crate::common::error::CoreFault;
use crate::regfile::PhysRegId;
use crate::uop::Uop;

/// Stable identifier for a ROB entry, valid until the entry commits or is
/// flushed. Encodes `(epoch, slot)` so slot reuse after wraparound never
/// aliases an older tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RobTag {
    epoch: u32,
    slot: u32,
}

/// Where an entry sits in the pipeline: its `current_state_list`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RobState {
    /// Waiting in the ROB for its operands or a functional unit.
    Dispatched,
    /// In an issue queue, not yet issued.
    ReadyToIssue,
    /// Issued to a functional unit, executing.
    Issued,
    /// Execution finished, result broadcast.
    Completed,
    /// Completed with a `CoreFault` instead of a normal result.
    Faulted,
}

/// One in-flight x86 instruction's worth of per-uop bookkeeping.
#[derive(Clone, Debug)]
pub struct RobEntry {
    /// The uop this entry tracks.
    pub uop: Uop,
    /// The rip this uop was fetched at, needed to redirect fetch back to
    /// this instruction on a replay.
    pub rip: VirtAddr,
    /// Execution cluster this uop was dispatched to.
    pub cluster: u8,
    /// Renamed destination register, if this uop writes one.
    pub dest: Option<PhysRegId>,
    /// Renamed source registers (up to three, matching `Uop::ra/rb/rc`).
    pub sources: [Option<PhysRegId>; 3],
    /// Load/store queue entry backing this uop, if it is a memory op.
    pub lsq_index: Option<u32>,
    /// Current pipeline stage.
    pub current_state_list: RobState,
    /// Cycles remaining in the current stage (execute latency countdown).
    pub cycles_left: u32,
    /// Cycle this entry's result will be visible to dependents.
    pub forward_cycle: u64,
    /// Slot index into the owning issue queue while `ReadyToIssue`.
    pub issueq_slot: Option<u32>,
    /// TLB walk level in progress for this uop's address translation, if
    /// any (`0` = not walking).
    pub tlb_walk_level: u8,
    /// Entry holds a live uop (distinguishes a real entry from a stale
    /// slot in the circular buffer).
    pub entry_valid: bool,
    /// Set once the first half of a split unaligned load/store has
    /// completed and the second half is in flight.
    pub load_store_second_phase: bool,
    /// Destination register was renamed before this uop's own writeback
    /// (used to detect WAW hazards during replay).
    pub dest_renamed_before_writeback: bool,
    /// Speculative: may still be squashed by an earlier mispredict.
    pub transient: bool,
    /// This uop holds the cache line lock for an atomic RMW.
    pub lock_acquired: bool,
    /// Issued to a functional unit at least once.
    pub issued: bool,
    /// Marked for squash; skipped at commit and during re-walks.
    pub annul_flag: bool,
    /// Direction fetch predicted for a branch uop; meaningless otherwise.
    pub branch_predicted_taken: bool,
    /// Direction execution actually resolved, once known. `None` until the
    /// branch completes.
    pub branch_resolved_taken: Option<bool>,
    /// The fault this entry completed with, if `current_state_list` is
    /// `Faulted`.
    pub fault: Option<CoreFault>,
    /// Number of times this uop has been replayed for an aliasing hazard.
    /// Commit escalates to a full flush once this crosses a threshold
    /// rather than replaying forever.
    pub replay_count: u8,
    epoch: u32,
}

impl RobEntry {
    fn new(uop: Uop, cluster: u8, epoch: u32) -> Self {
        Self {
            uop,
            rip: VirtAddr::new(0),
            cluster,
            dest: None,
            sources: [None, None, None],
            lsq_index: None,
            current_state_list: RobState::Dispatched,
            cycles_left: 0,
            forward_cycle: 0,
            issueq_slot: None,
            tlb_walk_level: 0,
            entry_valid: true,
            load_store_second_phase: false,
            dest_renamed_before_writeback: false,
            transient: true,
            lock_acquired: false,
            issued: false,
            annul_flag: false,
            branch_predicted_taken: false,
            branch_resolved_taken: None,
            fault: None,
            replay_count: 0,
            epoch,
        }
    }
}

/// A fixed-capacity circular reorder buffer.
pub struct Rob {
    entries: Vec<Option<RobEntry>>,
    head: usize,
    tail: usize,
    count: usize,
    epoch: u32,
}

impl Rob {
    /// Creates an empty ROB with room for `capacity` in-flight entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            count: 0,
            epoch: 0,
        }
    }

    /// Whether the ROB has no free slots.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count == self.entries.len()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the ROB holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Allocates a new entry at the tail for a just-dispatched uop.
    /// Returns `None` if the buffer is full; dispatch must stall.
    pub fn allocate(&mut self, uop: Uop, cluster: u8) -> Option<RobTag> {
        if self.is_full() {
            return None;
        }
        let slot = self.tail;
        let epoch = self.epoch.wrapping_add(slot as u32);
        self.entries[slot] = Some(RobEntry::new(uop, cluster, epoch));
        self.tail = (self.tail + 1) % self.entries.len();
        self.count += 1;
        Some(RobTag { epoch, slot: slot as u32 })
    }

    fn slot_of(&self, tag: RobTag) -> Option<usize> {
        let slot = tag.slot as usize;
        match &self.entries[slot] {
            Some(e) if e.epoch == tag.epoch => Some(slot),
            _ => None,
        }
    }

    /// Looks up an entry by tag.
    #[must_use]
    pub fn find_entry(&self, tag: RobTag) -> Option<&RobEntry> {
        let slot = self.slot_of(tag)?;
        self.entries[slot].as_ref()
    }

    /// Looks up an entry by tag, mutably.
    pub fn find_entry_mut(&mut self, tag: RobTag) -> Option<&mut RobEntry> {
        let slot = self.slot_of(tag)?;
        self.entries[slot].as_mut()
    }

    /// Marks an entry completed with a normal result, visible for
    /// forwarding starting at `forward_cycle`.
    pub fn complete(&mut self, tag: RobTag, forward_cycle: u64) {
        if let Some(e) = self.find_entry_mut(tag) {
            e.current_state_list = RobState::Completed;
            e.forward_cycle = forward_cycle;
        }
    }

    /// Marks an entry faulted with `fault`; commit logic inspects the
    /// stored payload before deciding whether to replay or flush.
    pub fn fault(&mut self, tag: RobTag, fault: CoreFault) {
        if let Some(e) = self.find_entry_mut(tag) {
            e.current_state_list = RobState::Faulted;
            e.fault = Some(fault);
        }
    }

    /// The oldest live entry, if any (the commit candidate).
    #[must_use]
    pub fn peek_head(&self) -> Option<&RobEntry> {
        if self.count == 0 {
            return None;
        }
        self.entries[self.head].as_ref()
    }

    /// The oldest live entry's tag, if any. Lets a caller holding only
    /// `peek_head`'s reference report which entry it inspected.
    #[must_use]
    pub fn peek_head_tag(&self) -> Option<RobTag> {
        if self.count == 0 {
            return None;
        }
        self.entries[self.head].as_ref().map(|e| RobTag { epoch: e.epoch, slot: self.head as u32 })
    }

    /// The tags of the oldest live x86-instruction group: the run of
    /// entries from `head` up to and including the first `uop.eom` entry.
    /// Returns `None` if the ROB is empty or the run reaches `tail` without
    /// a closing `eom` (the instruction is still mid-dispatch), so a
    /// caller never commits half of a group.
    #[must_use]
    pub fn peek_head_group(&self) -> Option<Vec<RobTag>> {
        if self.count == 0 {
            return None;
        }
        let cap = self.entries.len();
        let mut tags = Vec::new();
        let mut slot = self.head;
        loop {
            let entry = self.entries[slot].as_ref()?;
            tags.push(RobTag { epoch: entry.epoch, slot: slot as u32 });
            let eom = entry.uop.eom;
            slot = (slot + 1) % cap;
            if eom {
                return Some(tags);
            }
            if slot == self.tail {
                return None;
            }
        }
    }

    /// Retires the oldest entry unconditionally, advancing `head`. The
    /// caller must have already confirmed it is `Completed` or `Faulted`.
    pub fn commit_head(&mut self) -> Option<RobEntry> {
        if self.count == 0 {
            return None;
        }
        let slot = self.head;
        let entry = self.entries[slot].take();
        self.head = (self.head + 1) % self.entries.len();
        self.count -= 1;
        entry
    }

    /// Drops every live entry: a full-pipeline squash (exception handling
    /// entering the emulator, or a machine reset).
    pub fn flush_all(&mut self) {
        for e in &mut self.entries {
            *e = None;
        }
        self.head = 0;
        self.tail = 0;
        self.count = 0;
        self.epoch = self.epoch.wrapping_add(self.entries.len() as u32 + 1);
    }

    /// Drops every entry younger than `tag` (exclusive). The recovery
    /// action for a branch mispredict or load/store-ordering violation
    /// detected at `tag`.
    pub fn flush_after(&mut self, tag: RobTag) {
        let Some(keep_slot) = self.slot_of(tag) else { return };
        let cap = self.entries.len();
        let mut slot = (keep_slot + 1) % cap;
        while slot != self.tail {
            self.entries[slot] = None;
            slot = (slot + 1) % cap;
        }
        self.tail = (keep_slot + 1) % cap;
        self.count = if self.tail >= self.head {
            self.tail - self.head
        } else {
            cap - self.head + self.tail
        };
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Runs `f` over every live entry from oldest to newest.
    pub fn for_each_valid<F: FnMut(RobTag, &RobEntry)>(&self, mut f: F) {
        if self.count == 0 {
            return;
        }
        let cap = self.entries.len();
        let mut slot = self.head;
        loop {
            if let Some(e) = &self.entries[slot] {
                f(RobTag { epoch: e.epoch, slot: slot as u32 }, e);
            }
            slot = (slot + 1) % cap;
            if slot == self.tail {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uop::{AlignHalf, FlagMask, OpClass, Opcode, OpSize};

    fn nop_uop() -> Uop {
        Uop {
            opcode: Opcode { class: OpClass::Special, name: "nop" },
            size: OpSize::Quad,
            ra: 0,
            rb: 0,
            rc: 0,
            rd: 0,
            align: AlignHalf::Normal,
            setflags: FlagMask::default(),
            internal: false,
            locked: false,
            cachelevel: 0,
            nouserflags: false,
            som: true,
            eom: true,
            unaligned: false,
            rbimm: 0,
            rcimm: 0,
            riptaken: 0,
            ripseq: 0,
        }
    }

    #[test]
    fn allocate_and_commit_in_order() {
        let mut rob = Rob::new(4);
        let t0 = rob.allocate(nop_uop(), 0).unwrap();
        let t1 = rob.allocate(nop_uop(), 0).unwrap();
        rob.complete(t0, 10);
        rob.complete(t1, 11);
        assert_eq!(rob.len(), 2);
        let e0 = rob.commit_head().unwrap();
        assert_eq!(e0.current_state_list, RobState::Completed);
        assert_eq!(rob.len(), 1);
    }

    #[test]
    fn full_rob_rejects_allocation() {
        let mut rob = Rob::new(2);
        assert!(rob.allocate(nop_uop(), 0).is_some());
        assert!(rob.allocate(nop_uop(), 0).is_some());
        assert!(rob.allocate(nop_uop(), 0).is_none());
    }

    #[test]
    fn flush_after_keeps_older_entries_and_drops_younger() {
        let mut rob = Rob::new(4);
        let t0 = rob.allocate(nop_uop(), 0).unwrap();
        let _t1 = rob.allocate(nop_uop(), 0).unwrap();
        let _t2 = rob.allocate(nop_uop(), 0).unwrap();
        rob.flush_after(t0);
        assert_eq!(rob.len(), 1);
        assert!(rob.find_entry(t0).is_some());
    }

    #[test]
    fn stale_tag_after_wraparound_does_not_alias() {
        let mut rob = Rob::new(2);
        let t0 = rob.allocate(nop_uop(), 0).unwrap();
        rob.complete(t0, 1);
        rob.commit_head();
        rob.flush_all();
        let t1 = rob.allocate(nop_uop(), 0).unwrap();
        assert!(rob.find_entry(t0).is_none());
        assert!(rob.find_entry(t1).is_some());
    }

    #[test]
    fn for_each_valid_visits_oldest_to_newest() {
        let mut rob = Rob::new(4);
        rob.allocate(nop_uop(), 0).unwrap();
        rob.allocate(nop_uop(), 1).unwrap();
        let mut clusters = Vec::new();
        rob.for_each_valid(|_, e| clusters.push(e.cluster));
        assert_eq!(clusters, vec![0, 1]);
    }
}
