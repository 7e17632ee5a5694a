//! MESI private cache controller.
//!
//! One level (L1/L2/L3) of a per-core cache hierarchy: set-associative
//! storage with [`policies::PlruPolicy`] replacement, a MESI line state
//! machine (see [`crate::mesi`]), and a bounded `pendingRequests` queue of
//! in-flight [`CacheQueueEntry`] values chained by line address, built on
//! a `CacheLine`/access-simulation shape generalized from a plain
//! dirty-bit line to full MESI state and snoop handling.

pub mod policies;

use crate::interconnect::{Message, MessageOp};
use crate::mesi::{self, MesiState, MesiTrigger};

use policies::{PlruPolicy, ReplacementPolicy};

/// One cache line's coherence and tag state. `valid` tracks occupancy
/// separately from `state` so a freshly-evicted slot reads as empty
/// without needing a sentinel tag value.
#[derive(Clone, Copy, Debug)]
struct CacheLine {
    tag: u64,
    valid: bool,
    state: MesiState,
}

impl Default for CacheLine {
    fn default() -> Self {
        Self { tag: 0, valid: false, state: MesiState::Invalid }
    }
}

/// The kind of access a queue entry represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueOp {
    Read,
    Write,
    Evict,
}

/// One in-flight request occupying a `pendingRequests` slot. Chained via
/// `depends` to any earlier entry targeting the same line address, via
/// `find_dependency`.
#[derive(Clone, Debug)]
pub struct CacheQueueEntry {
    pub requester: usize,
    pub line_addr: u64,
    pub op: QueueOp,
    pub annulled: bool,
    pub free_on_success: bool,
    pub has_data: bool,
    pub shared: bool,
    pub depends: Option<usize>,
}

/// Outcome of a lookup/access probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessOutcome {
    Hit,
    Miss,
}

/// A victim selected for eviction, carrying whatever writeback obligation
/// the MESI table attaches to evicting it.
#[derive(Clone, Copy, Debug)]
pub struct Eviction {
    pub line_addr: u64,
    pub writeback: bool,
}

/// One level of a per-core MESI cache.
pub struct PrivateCacheController {
    ways: usize,
    num_sets: usize,
    line_bytes: u64,
    latency: u64,
    lowest_private: bool,
    lines: Vec<Vec<CacheLine>>,
    policy: PlruPolicy,
    pending: Vec<Option<CacheQueueEntry>>,
    read_ports_used: u32,
    write_ports_used: u32,
    read_ports: u32,
    write_ports: u32,
    last_access_cycle: u64,
}

impl PrivateCacheController {
    /// Builds a cache level: `num_sets` sets, `ways`-way associative,
    /// `line_bytes` per line, `latency` cycles to service a hit,
    /// `queue_depth` in-flight requests, `lowest_private` true for the
    /// private level closest to the directory (the one responsible for
    /// writeback-on-clean-evict per the MESI table's `E -> evict` row).
    #[must_use]
    pub fn new(
        num_sets: usize,
        ways: usize,
        line_bytes: u64,
        latency: u64,
        queue_depth: usize,
        lowest_private: bool,
        read_ports: u32,
        write_ports: u32,
    ) -> Self {
        Self {
            ways,
            num_sets,
            line_bytes,
            latency,
            lowest_private,
            lines: vec![vec![CacheLine::default(); ways]; num_sets],
            policy: PlruPolicy::new(num_sets, ways),
            pending: (0..queue_depth).map(|_| None).collect(),
            read_ports_used: 0,
            write_ports_used: 0,
            read_ports,
            write_ports,
            last_access_cycle: u64::MAX,
        }
    }

    /// Service latency for a hit.
    #[must_use]
    pub const fn latency(&self) -> u64 {
        self.latency
    }

    fn set_index(&self, line_addr: u64) -> usize {
        ((line_addr / self.line_bytes) as usize) % self.num_sets
    }

    fn find_way(&self, set: usize, line_addr: u64) -> Option<usize> {
        self.lines[set]
            .iter()
            .position(|l| l.valid && l.tag == line_addr)
    }

    /// Reserves a read or write port for `sim_cycle`. Counters reset the
    /// first time a given cycle is seen. Returns `false` if no port is
    /// free this cycle.
    pub fn get_port(&mut self, sim_cycle: u64, is_write: bool) -> bool {
        if self.last_access_cycle != sim_cycle {
            self.read_ports_used = 0;
            self.write_ports_used = 0;
            self.last_access_cycle = sim_cycle;
        }
        if is_write {
            if self.write_ports_used >= self.write_ports {
                return false;
            }
            self.write_ports_used += 1;
        } else {
            if self.read_ports_used >= self.read_ports {
                return false;
            }
            self.read_ports_used += 1;
        }
        true
    }

    /// Probes the set for `line_addr`, updating PLRU on a hit.
    pub fn probe(&mut self, line_addr: u64) -> AccessOutcome {
        let set = self.set_index(line_addr);
        match self.find_way(set, line_addr) {
            Some(way) => {
                self.policy.update(set, way);
                AccessOutcome::Hit
            }
            None => AccessOutcome::Miss,
        }
    }

    /// Current MESI state of a resident line, if present.
    #[must_use]
    pub fn line_state(&self, line_addr: u64) -> Option<MesiState> {
        let set = self.set_index(line_addr);
        self.find_way(set, line_addr).map(|way| self.lines[set][way].state)
    }

    /// Applies a local read/write to a resident line's MESI state,
    /// returning the transition, or `None` if the line is not present
    /// (call [`Self::probe`] first).
    pub fn local_access(&mut self, line_addr: u64, is_write: bool) -> Option<mesi::MesiTransition> {
        let set = self.set_index(line_addr);
        let way = self.find_way(set, line_addr)?;
        let trigger = if is_write { MesiTrigger::LocalWrite } else { MesiTrigger::LocalRead };
        let t = mesi::transition(self.lines[set][way].state, trigger, self.lowest_private);
        self.lines[set][way].state = t.next;
        self.policy.update(set, way);
        Some(t)
    }

    /// Selects a PLRU victim in the line's set and evicts it, returning
    /// its address and whether the evicted data must be written back:
    /// writeback only from `Modified`, or from `Exclusive` at the
    /// lowest-private level, per the MESI table's evict column.
    pub fn evict_victim(&mut self, line_addr: u64) -> Option<Eviction> {
        let set = self.set_index(line_addr);
        let way = self.policy.get_victim(set);
        let line = &mut self.lines[set][way];
        if !line.valid {
            return None;
        }
        let t = mesi::transition(line.state, MesiTrigger::Evict, self.lowest_private);
        let evicted = Eviction { line_addr: line.tag, writeback: t.writeback };
        line.valid = false;
        line.state = MesiState::Invalid;
        Some(evicted)
    }

    /// Installs a freshly-filled line, replacing the PLRU victim in its
    /// set (the caller is responsible for having evicted/written back
    /// that victim first if it was dirty). If the line is already
    /// resident (a state-upgrade response racing an existing copy), its
    /// existing way is updated in place instead of consuming a second way
    /// for the same tag.
    pub fn install_line(&mut self, line_addr: u64, state: MesiState) {
        let set = self.set_index(line_addr);
        let way = self.find_way(set, line_addr).unwrap_or_else(|| self.policy.get_victim(set));
        self.lines[set][way] = CacheLine { tag: line_addr, valid: true, state };
        self.policy.update(set, way);
    }

    /// Applies a snoop (request arriving on the lower interconnect from a
    /// peer or the directory) to a resident line, returning the
    /// transition so the caller can build the snoop response message
    /// (`is_shared`/`has_data` from `t.writeback`).
    pub fn snoop(&mut self, line_addr: u64, write: bool) -> Option<mesi::MesiTransition> {
        let set = self.set_index(line_addr);
        let way = self.find_way(set, line_addr)?;
        let trigger = if write { MesiTrigger::SnoopWrite } else { MesiTrigger::SnoopRead };
        let t = mesi::transition(self.lines[set][way].state, trigger, self.lowest_private);
        self.lines[set][way].state = t.next;
        if t.next == MesiState::Invalid {
            self.lines[set][way].valid = false;
        }
        Some(t)
    }

    /// Finds an in-flight queue entry already targeting `line_addr`: a
    /// new request for the same line chains onto it instead of issuing a
    /// second fill.
    #[must_use]
    pub fn find_dependency(&self, line_addr: u64) -> Option<usize> {
        self.pending
            .iter()
            .position(|e| matches!(e, Some(entry) if !entry.annulled && entry.line_addr == line_addr))
    }

    /// Allocates a pending-request slot, chaining it behind an existing
    /// request to the same line if one is in flight. Returns `None`
    /// (backpressure) if the queue is full.
    pub fn alloc_pending(&mut self, requester: usize, line_addr: u64, op: QueueOp) -> Option<usize> {
        let depends = self.find_dependency(line_addr);
        let slot = self.pending.iter().position(Option::is_none)?;
        self.pending[slot] = Some(CacheQueueEntry {
            requester,
            line_addr,
            op,
            annulled: false,
            free_on_success: true,
            has_data: false,
            shared: false,
            depends,
        });
        Some(slot)
    }

    /// Frees a pending-request slot once its stage chain completes.
    pub fn free_pending(&mut self, slot: usize) {
        self.pending[slot] = None;
    }

    /// Builds the upward-interconnect miss-fill request for `line_addr`,
    /// to be emitted toward the directory/lower level.
    #[must_use]
    pub fn fill_request(&self, sender: usize, dest: usize, line_addr: u64, is_write: bool) -> Message {
        Message {
            sender,
            dest,
            line_addr,
            op: if is_write { MessageOp::Write } else { MessageOp::Read },
            is_shared: false,
            has_data: false,
            arg: 0,
        }
    }

    /// Number of in-flight requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.iter().filter(|e| e.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache() -> PrivateCacheController {
        PrivateCacheController::new(4, 2, 64, 2, 4, true, 2, 2)
    }

    #[test]
    fn miss_then_install_then_hit() {
        let mut c = small_cache();
        assert_eq!(c.probe(0x1000), AccessOutcome::Miss);
        c.install_line(0x1000, MesiState::Exclusive);
        assert_eq!(c.probe(0x1000), AccessOutcome::Hit);
        assert_eq!(c.line_state(0x1000), Some(MesiState::Exclusive));
    }

    #[test]
    fn local_write_on_shared_line_is_a_miss_to_modified() {
        let mut c = small_cache();
        c.install_line(0x1000, MesiState::Shared);
        let t = c.local_access(0x1000, true).unwrap();
        assert!(t.miss);
        assert_eq!(t.next, MesiState::Modified);
    }

    #[test]
    fn snoop_write_on_modified_invalidates_and_writes_back() {
        let mut c = small_cache();
        c.install_line(0x1000, MesiState::Modified);
        let t = c.snoop(0x1000, true).unwrap();
        assert_eq!(t.next, MesiState::Invalid);
        assert!(t.writeback);
        assert_eq!(c.probe(0x1000), AccessOutcome::Miss);
    }

    #[test]
    fn dependent_request_chains_instead_of_double_allocating() {
        let mut c = small_cache();
        let first = c.alloc_pending(0, 0x2000, QueueOp::Read).unwrap();
        let second = c.alloc_pending(1, 0x2000, QueueOp::Read).unwrap();
        assert_eq!(c.pending[second].as_ref().unwrap().depends, Some(first));
    }

    #[test]
    fn port_budget_resets_on_new_cycle() {
        let mut c = small_cache();
        assert!(c.get_port(0, false));
        assert!(c.get_port(0, false));
        assert!(!c.get_port(0, false));
        assert!(c.get_port(1, false));
    }
}
