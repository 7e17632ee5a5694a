//! Fully-associative TLB.
//!
//! Keyed by `(virt-page, thread id)`, one-hot tag array with pseudo-LRU
//! replacement identical to the cache's (reuses
//! [`crate::cache::policies::PlruPolicy`] with a single "set").

use crate::cache::policies::{PlruPolicy, ReplacementPolicy};
use crate::common::addr::{PhysAddr, VirtAddr};

#[derive(Clone, Copy, Debug)]
struct TlbEntry {
    valid: bool,
    vpage: u64,
    thread: u8,
    ppage: u64,
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self { valid: false, vpage: 0, thread: 0, ppage: 0 }
    }
}

/// A fully-associative translation lookaside buffer for one TLB (ITLB or
/// DTLB) of one core.
pub struct Tlb {
    entries: Vec<TlbEntry>,
    policy: PlruPolicy,
}

impl Tlb {
    /// Creates an empty TLB with `entries` fully-associative slots.
    #[must_use]
    pub fn new(entries: usize) -> Self {
        Self {
            entries: vec![TlbEntry::default(); entries],
            policy: PlruPolicy::new(1, entries),
        }
    }

    fn find(&self, vpage: u64, thread: u8) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.valid && e.vpage == vpage && e.thread == thread)
    }

    /// Looks up a translation, updating PLRU on hit.
    pub fn probe(&mut self, vaddr: VirtAddr, thread: u8) -> Option<PhysAddr> {
        let vpage = vaddr.page();
        let way = self.find(vpage, thread)?;
        self.policy.update(0, way);
        let ppage = self.entries[way].ppage;
        Some(PhysAddr::new((ppage << 12) | vaddr.page_offset()))
    }

    /// Inserts a translation (the result of a page-table walk), evicting
    /// the PLRU victim. Returns `true` if an occupied slot was replaced.
    pub fn insert(&mut self, vaddr: VirtAddr, thread: u8, paddr: PhysAddr) -> bool {
        let vpage = vaddr.page();
        let way = self.policy.get_victim(0);
        let replaced = self.entries[way].valid;
        self.entries[way] = TlbEntry { valid: true, vpage, thread, ppage: paddr.mfn() };
        self.policy.update(0, way);
        replaced
    }

    /// Invalidates every entry.
    pub fn flush_all(&mut self) {
        for e in &mut self.entries {
            e.valid = false;
        }
    }

    /// Invalidates every entry belonging to `thread`.
    pub fn flush_thread(&mut self, thread: u8) {
        for e in &mut self.entries {
            if e.thread == thread {
                e.valid = false;
            }
        }
    }

    /// Invalidates the single entry for `(vaddr, thread)`, if present.
    pub fn flush_virt(&mut self, vaddr: VirtAddr, thread: u8) {
        let vpage = vaddr.page();
        if let Some(way) = self.find(vpage, thread) {
            self.entries[way].valid = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_insert_then_hit() {
        let mut tlb = Tlb::new(4);
        assert!(tlb.probe(VirtAddr::new(0x1234), 0).is_none());
        tlb.insert(VirtAddr::new(0x1234), 0, PhysAddr::new(0x5000));
        let hit = tlb.probe(VirtAddr::new(0x1234), 0).unwrap();
        assert_eq!(hit, PhysAddr::new(0x5234));
    }

    #[test]
    fn different_threads_do_not_alias() {
        let mut tlb = Tlb::new(4);
        tlb.insert(VirtAddr::new(0x1000), 0, PhysAddr::new(0x2000));
        assert!(tlb.probe(VirtAddr::new(0x1000), 1).is_none());
    }

    #[test]
    fn flush_thread_only_drops_that_threads_entries() {
        let mut tlb = Tlb::new(4);
        tlb.insert(VirtAddr::new(0x1000), 0, PhysAddr::new(0x2000));
        tlb.insert(VirtAddr::new(0x3000), 1, PhysAddr::new(0x4000));
        tlb.flush_thread(0);
        assert!(tlb.probe(VirtAddr::new(0x1000), 0).is_none());
        assert!(tlb.probe(VirtAddr::new(0x3000), 1).is_some());
    }
}
