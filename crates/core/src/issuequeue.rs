//! Issue queue: tag-broadcast wakeup scheduling for one execution cluster.
//!
//! Each slot holds a uop waiting on up to three source tags. When a
//! producer broadcasts its result tag, every slot with a matching source
//! clears that dependency; a slot with no outstanding dependencies is
//! ready to issue. This avoids a full associative search of the ROB every
//! cycle: a cluster scheduler that wakes waiting uops off a broadcast
//! rather than polling.

use crate::rob::RobTag;

/// One waiting uop's remaining dependencies.
#[derive(Clone, Debug)]
struct Slot {
    rob_tag: RobTag,
    waiting_on: [Option<RobTag>; 3],
    priority: u64,
}

/// A capacity-bounded wakeup queue for one execution cluster.
pub struct IssueQueue {
    slots: Vec<Slot>,
    capacity: usize,
}

impl IssueQueue {
    /// Creates an empty queue with room for `capacity` waiting uops.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { slots: Vec::with_capacity(capacity), capacity }
    }

    /// Whether the queue has no free slots.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Inserts a newly dispatched uop with its outstanding source
    /// dependencies. `priority` is typically the dispatch cycle, used to
    /// break ties in favor of program order.
    pub fn insert(&mut self, rob_tag: RobTag, waiting_on: [Option<RobTag>; 3], priority: u64) -> bool {
        if self.is_full() {
            return false;
        }
        self.slots.push(Slot { rob_tag, waiting_on, priority });
        true
    }

    /// Clears `tag` from every slot's dependency list: the effect of a
    /// producer broadcasting its result this cycle.
    pub fn wakeup(&mut self, tag: RobTag) {
        for slot in &mut self.slots {
            for dep in &mut slot.waiting_on {
                if *dep == Some(tag) {
                    *dep = None;
                }
            }
        }
    }

    /// Selects and removes the oldest slot with no outstanding
    /// dependencies, if any.
    pub fn select_ready(&mut self) -> Option<RobTag> {
        let idx = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.waiting_on.iter().all(Option::is_none))
            .min_by_key(|(_, s)| s.priority)
            .map(|(i, _)| i)?;
        Some(self.slots.remove(idx).rob_tag)
    }

    /// Drops every slot whose ROB tag satisfies `squash`. Used to purge
    /// speculative uops on a pipeline flush.
    pub fn flush_where<F: Fn(RobTag) -> bool>(&mut self, squash: F) {
        self.slots.retain(|s| !squash(s.rob_tag));
    }

    /// Number of uops currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the queue holds no uops.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rob::Rob;
    use crate::uop::{AlignHalf, FlagMask, OpClass, Opcode, OpSize, Uop};

    fn nop() -> Uop {
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
    fn slot_with_no_deps_is_immediately_ready() {
        let mut rob = Rob::new(4);
        let t = rob.allocate(nop(), 0).unwrap();
        let mut iq = IssueQueue::new(4);
        iq.insert(t, [None, None, None], 0);
        assert_eq!(iq.select_ready(), Some(t));
    }

    #[test]
    fn wakeup_clears_matching_dependency() {
        let mut rob = Rob::new(4);
        let producer = rob.allocate(nop(), 0).unwrap();
        let consumer = rob.allocate(nop(), 0).unwrap();
        let mut iq = IssueQueue::new(4);
        iq.insert(consumer, [Some(producer), None, None], 1);
        assert!(iq.select_ready().is_none());
        iq.wakeup(producer);
        assert_eq!(iq.select_ready(), Some(consumer));
    }

    #[test]
    fn ties_break_by_program_order() {
        let mut rob = Rob::new(4);
        let t0 = rob.allocate(nop(), 0).unwrap();
        let t1 = rob.allocate(nop(), 0).unwrap();
        let mut iq = IssueQueue::new(4);
        iq.insert(t1, [None, None, None], 5);
        iq.insert(t0, [None, None, None], 1);
        assert_eq!(iq.select_ready(), Some(t0));
    }
}
