//! In-order Atom-style core: a two-port issue-per-cycle pipeline with a
//! shared frontend feeding per-thread dispatch queues, commit buffers, and
//! store buffers.
//!
//! `AtomOp` groups every uop of one x86 instruction so commit (and, on
//! failure, annul) always happens atomically at instruction granularity,
//! unlike the OoO core's per-uop ROB entries.

use std::collections::VecDeque;

use crate::common::addr::PhysAddr;
use crate::uop::Uop;

/// One of the two issue ports.
pub type Port = u8;

/// Functional-unit class an AtomOp's uops contend for, matching the
/// 12-entry mask (4 ALU + 4 FPU + 4 AGU) budget below.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuClass {
    Alu,
    Fpu,
    Agu,
}

const ALU_UNITS: u8 = 4;
const FPU_UNITS: u8 = 4;
const AGU_UNITS: u8 = 4;

/// Outcome of attempting to issue one AtomOp this cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssueResult {
    Ok,
    /// Issued, but the port may not accept a second AtomOp this cycle
    /// (non-pipelined multi-cycle op in flight).
    OkBlock,
    Fail(FailReason),
    CacheMiss,
    /// Issued without doing any work (e.g. an annulled uop skipped in
    /// place so AtomOp grouping stays intact).
    OkSkip,
}

/// Why an issue attempt failed, for the per-reason counters below.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailReason {
    NonPipelinedBusy,
    NoPort,
    NoFu,
    SourceNotReady,
}

/// A store-buffer entry: the `(addr, data, bytemask, virtaddr, size,
/// mmio)` tuple an in-flight store carries until it drains.
#[derive(Clone, Debug)]
pub struct StoreBufferEntry {
    pub addr: PhysAddr,
    pub data: u64,
    pub bytemask: u8,
    pub virtaddr: u64,
    pub size: u8,
    pub mmio: bool,
}

/// One x86 instruction's worth of uops, grouped for atomic commit.
#[derive(Clone, Debug)]
pub struct AtomOp {
    pub uops: Vec<Uop>,
    pub lock_addrs: Vec<PhysAddr>,
    completed_uops: usize,
    annulled: bool,
    waiting_for_icache: bool,
}

impl AtomOp {
    /// Groups a `som..eom` uop run into one AtomOp.
    #[must_use]
    pub fn new(uops: Vec<Uop>) -> Self {
        Self { uops, lock_addrs: Vec::new(), completed_uops: 0, annulled: false, waiting_for_icache: false }
    }

    /// Whether every uop in this AtomOp has completed and it is ready to
    /// commit as a unit.
    #[must_use]
    pub fn is_ready_to_commit(&self) -> bool {
        !self.annulled && self.completed_uops == self.uops.len()
    }

    fn fu_class(uop: &Uop) -> FuClass {
        use crate::uop::OpClass;
        match uop.opcode.class {
            OpClass::Load | OpClass::Store => FuClass::Agu,
            OpClass::FpAlu | OpClass::FpCvt | OpClass::Vec => FuClass::Fpu,
            _ => FuClass::Alu,
        }
    }
}

/// Per-thread pipeline state: dispatch queue, in-flight AtomOp buffer
/// (the "commit buffer"), and store buffer.
pub struct ThreadState {
    pub dispatch_queue: VecDeque<AtomOp>,
    pub commit_buffer: VecDeque<AtomOp>,
    pub store_buffer: VecDeque<StoreBufferEntry>,
    store_buffer_capacity: usize,
    unresolved_branches: u32,
    max_unresolved_branches: u32,
    waiting_for_icache: bool,
}

impl ThreadState {
    fn new(store_buffer_capacity: usize, max_unresolved_branches: u32) -> Self {
        Self {
            dispatch_queue: VecDeque::new(),
            commit_buffer: VecDeque::new(),
            store_buffer: VecDeque::new(),
            store_buffer_capacity,
            unresolved_branches: 0,
            max_unresolved_branches,
            waiting_for_icache: false,
        }
    }

    /// Whether fetch for this thread must stall: too many unresolved
    /// branches in flight.
    #[must_use]
    pub fn fetch_should_stall(&self) -> bool {
        self.unresolved_branches >= self.max_unresolved_branches
    }

    /// Drains the frontend-owned state for this thread: dispatch queue
    /// and unresolved-branch counter. Used both by mispredict recovery
    /// and by a cooperative thread switch.
    fn flush_frontend(&mut self) {
        self.dispatch_queue.clear();
        self.unresolved_branches = 0;
    }
}

/// Fixed functional-unit budget shared by both issue ports this cycle.
struct FuBudget {
    alu_free: u8,
    fpu_free: u8,
    agu_free: u8,
    non_pipelined_busy: bool,
}

impl FuBudget {
    fn fresh() -> Self {
        Self { alu_free: ALU_UNITS, fpu_free: FPU_UNITS, agu_free: AGU_UNITS, non_pipelined_busy: false }
    }

    fn try_take(&mut self, class: FuClass) -> bool {
        let slot = match class {
            FuClass::Alu => &mut self.alu_free,
            FuClass::Fpu => &mut self.fpu_free,
            FuClass::Agu => &mut self.agu_free,
        };
        if *slot == 0 {
            return false;
        }
        *slot -= 1;
        true
    }
}

/// The two-wide in-order Atom-style core.
pub struct InOrderCore {
    threads: Vec<ThreadState>,
    active_thread: usize,
    num_ports: usize,
    fails: FailCounters,
}

/// Per-reason failed-issue counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailCounters {
    pub non_pipelined: u64,
    pub no_port: u64,
    pub no_fu: u64,
    pub source_not_ready: u64,
}

impl InOrderCore {
    /// Builds a two-thread core (cooperative SMT) with the given
    /// per-thread store buffer depth and unresolved-branch bound.
    #[must_use]
    pub fn new(num_threads: usize, store_buffer_size: usize, max_unresolved_branches: usize) -> Self {
        Self {
            threads: (0..num_threads)
                .map(|_| ThreadState::new(store_buffer_size, max_unresolved_branches as u32))
                .collect(),
            active_thread: 0,
            num_ports: 2,
            fails: FailCounters::default(),
        }
    }

    /// Enqueues a decoded AtomOp onto `thread`'s dispatch queue.
    pub fn dispatch(&mut self, thread: usize, op: AtomOp) {
        self.threads[thread].dispatch_queue.push_back(op);
    }

    /// Attempts to issue up to `num_ports` AtomOps this cycle from the
    /// active thread's dispatch queue, in order, against the shared FU
    /// budget. Returns one `IssueResult` per port attempted.
    pub fn issue_cycle(&mut self, is_source_ready: impl Fn(&Uop) -> bool) -> Vec<IssueResult> {
        let mut budget = FuBudget::fresh();
        let mut results = Vec::with_capacity(self.num_ports);
        let thread = &mut self.threads[self.active_thread];

        for port in 0..self.num_ports as Port {
            let Some(op) = thread.dispatch_queue.front() else { break };
            if op.waiting_for_icache {
                results.push(IssueResult::CacheMiss);
                break;
            }

            let all_ready = op.uops.iter().all(&is_source_ready);
            if !all_ready {
                self.fails.source_not_ready += 1;
                results.push(IssueResult::Fail(FailReason::SourceNotReady));
                break;
            }

            let mut blocked = false;
            let mut ok = true;
            for uop in &op.uops {
                let class = AtomOp::fu_class(uop);
                if !budget.try_take(class) {
                    self.fails.no_fu += 1;
                    ok = false;
                    break;
                }
                if Self::is_non_pipelined(uop) {
                    if budget.non_pipelined_busy {
                        self.fails.non_pipelined += 1;
                        ok = false;
                        break;
                    }
                    budget.non_pipelined_busy = true;
                    blocked = true;
                }
            }

            if !ok {
                results.push(IssueResult::Fail(FailReason::NoFu));
                break;
            }

            let Some(mut op) = thread.dispatch_queue.pop_front() else { break };
            op.completed_uops = op.uops.len();
            thread.commit_buffer.push_back(op);
            results.push(if blocked { IssueResult::OkBlock } else { IssueResult::Ok });

            if blocked {
                break;
            }
            let _ = port;
        }

        if results.is_empty() {
            self.fails.no_port += 1;
        }
        results
    }

    fn is_non_pipelined(uop: &Uop) -> bool {
        uop.opcode.name == "div" || uop.opcode.name == "sqrt" || uop.opcode.name == "idiv"
    }

    /// Commits the oldest ready AtomOp in the active thread's commit
    /// buffer: drains its store-buffer writes (via `store_hook`) and
    /// releases any cache-line locks it held. Annulled AtomOps at the
    /// head are dropped instead, releasing their locks immediately.
    pub fn commit_one(&mut self, mut unlock: impl FnMut(PhysAddr)) -> Option<AtomOp> {
        let thread = &mut self.threads[self.active_thread];
        let op = thread.commit_buffer.front()?;
        if !op.is_ready_to_commit() && !op.annulled {
            return None;
        }
        let op = thread.commit_buffer.pop_front()?;
        for addr in &op.lock_addrs {
            unlock(*addr);
        }
        Some(op)
    }

    /// Queues a store for the active thread's store buffer, if it has
    /// room. Returns `false` if the buffer is full (dispatch must stall).
    pub fn push_store(&mut self, entry: StoreBufferEntry) -> bool {
        let thread = &mut self.threads[self.active_thread];
        if thread.store_buffer.len() >= thread.store_buffer_capacity {
            return false;
        }
        thread.store_buffer.push_back(entry);
        true
    }

    /// Drains one store-buffer entry to the host-memory store hook, in
    /// FIFO order, matching the commit-time write ordering the store
    /// buffer exists to preserve.
    pub fn drain_one_store(&mut self, mut store_hook: impl FnMut(&StoreBufferEntry)) -> Option<StoreBufferEntry> {
        let thread = &mut self.threads[self.active_thread];
        let entry = thread.store_buffer.pop_front()?;
        store_hook(&entry);
        Some(entry)
    }

    /// Marks the active thread as blocked on an L2 miss and cooperatively
    /// switches to the other thread. The blocked thread's frontend is
    /// flushed; its commit buffer
    /// and store buffer are left untouched so in-flight AtomOps can still
    /// retire once the miss resolves and the thread is switched back in.
    pub fn switch_on_icache_miss(&mut self) {
        self.threads[self.active_thread].waiting_for_icache = true;
        self.threads[self.active_thread].flush_frontend();
        if let Some(next) = (0..self.threads.len())
            .map(|i| (self.active_thread + 1 + i) % self.threads.len())
            .find(|&i| !self.threads[i].waiting_for_icache)
        {
            self.active_thread = next;
        }
    }

    /// Resumes a thread previously parked by [`Self::switch_on_icache_miss`].
    pub fn resume_thread(&mut self, thread: usize) {
        self.threads[thread].waiting_for_icache = false;
    }

    /// Branch-mispredict recovery for `thread`: drains its dispatch queue
    /// and any not-yet-committed AtomOps younger than the mispredicting
    /// one from its commit buffer. Locks held by annulled AtomOps are
    /// released immediately via `unlock`; commit-time release is the
    /// normal, non-annulled path.
    pub fn recover_branch_mispredict(&mut self, thread: usize, mut unlock: impl FnMut(PhysAddr)) {
        let t = &mut self.threads[thread];
        t.flush_frontend();
        for op in t.commit_buffer.drain(..) {
            for addr in &op.lock_addrs {
                unlock(*addr);
            }
        }
    }

    /// Counts one more unresolved branch in flight for `thread` (fetch
    /// stalls once this hits the configured bound).
    pub fn note_branch_dispatched(&mut self, thread: usize) {
        self.threads[thread].unresolved_branches += 1;
    }

    /// Counts one fewer unresolved branch once it resolves.
    pub fn note_branch_resolved(&mut self, thread: usize) {
        let t = &mut self.threads[thread];
        t.unresolved_branches = t.unresolved_branches.saturating_sub(1);
    }

    /// Whether `thread`'s fetch should stall on too many unresolved
    /// branches.
    #[must_use]
    pub fn fetch_should_stall(&self, thread: usize) -> bool {
        self.threads[thread].fetch_should_stall()
    }

    /// Currently-scheduled thread.
    #[must_use]
    pub fn active_thread(&self) -> usize {
        self.active_thread
    }

    /// Snapshot of the failed-issue reason counters.
    #[must_use]
    pub fn fail_counters(&self) -> FailCounters {
        self.fails
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uop::{AlignHalf, FlagMask, OpClass, Opcode, OpSize};

    fn alu_uop(name: &'static str) -> Uop {
        Uop {
            opcode: Opcode { class: OpClass::AddSub, name },
            size: OpSize::Quad,
            ra: 0,
            rb: 0,
            rc: 0,
            rd: 1,
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
    fn issues_and_commits_a_simple_atomop() {
        let mut core = InOrderCore::new(1, 8, 8);
        core.dispatch(0, AtomOp::new(vec![alu_uop("add")]));
        let results = core.issue_cycle(|_| true);
        assert_eq!(results, vec![IssueResult::Ok]);
        let committed = core.commit_one(|_| {});
        assert!(committed.is_some());
    }

    #[test]
    fn non_pipelined_op_blocks_second_port_issue() {
        let mut core = InOrderCore::new(1, 8, 8);
        core.dispatch(0, AtomOp::new(vec![alu_uop("div")]));
        core.dispatch(0, AtomOp::new(vec![alu_uop("add")]));
        let results = core.issue_cycle(|_| true);
        assert_eq!(results, vec![IssueResult::OkBlock]);
    }

    #[test]
    fn source_not_ready_fails_issue_without_consuming_op() {
        let mut core = InOrderCore::new(1, 8, 8);
        core.dispatch(0, AtomOp::new(vec![alu_uop("add")]));
        let results = core.issue_cycle(|_| false);
        assert_eq!(results, vec![IssueResult::Fail(FailReason::SourceNotReady)]);
        assert_eq!(core.threads[0].dispatch_queue.len(), 1);
    }

    #[test]
    fn recover_releases_locks_on_annulled_atomops() {
        let mut core = InOrderCore::new(1, 8, 8);
        core.dispatch(0, AtomOp::new(vec![alu_uop("add")]));
        core.issue_cycle(|_| true);
        core.threads[0].commit_buffer[0].lock_addrs.push(PhysAddr::new(0x4000));

        let mut released = Vec::new();
        core.recover_branch_mispredict(0, |addr| released.push(addr));
        assert_eq!(released, vec![PhysAddr::new(0x4000)]);
        assert!(core.threads[0].commit_buffer.is_empty());
    }

    #[test]
    fn switching_threads_flushes_blocked_threads_frontend_only() {
        let mut core = InOrderCore::new(2, 8, 8);
        core.dispatch(0, AtomOp::new(vec![alu_uop("add")]));
        core.switch_on_icache_miss();
        assert_eq!(core.active_thread(), 1);
        assert!(core.threads[0].dispatch_queue.is_empty());
    }
}
