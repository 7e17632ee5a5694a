//! Out-of-order core: fetch -> rename -> dispatch -> issue -> execute ->
//! writeback -> commit.
//!
//! This models the per-cycle pipeline at the granularity the rest of the
//! crate's unit tests exercise: each stage is a method taking the shared
//! structures (`Rob`, `RegisterFile`, `LoadStoreQueue`, one `IssueQueue`
//! per cluster) and returning what it did, rather than a single opaque
//! `run_cycle`. The top-level `run_cycle` composes them in a fixed order
//! (fetch precedes rename precedes dispatch precedes issue precedes
//! writeback precedes commit within one invocation).

use crate::bb::BasicBlock;
use crate::bru::{BranchOutcome, BranchPredictor, Prediction};
use crate::common::addr::VirtAddr;
use crate::common::error::CoreFault;
use crate::issuequeue::IssueQueue;
use crate::lsq::{LoadStoreQueue, LsqOp};
use crate::regfile::{PhysRegId, RegFileKind, RegisterFile};
use crate::rob::{Rob, RobState, RobTag};
use crate::tlb::Tlb;
use crate::uop::Uop;

/// Execution cluster index, matching the `uop_executable_on_cluster`
/// classification. Kept small and enum-free (plain indices) since
/// cluster count is a config knob.
pub type ClusterId = u8;

/// Replays an aliasing-stalled memory uop this many times before commit
/// escalates to a full exception instead of retrying it in place.
const ALIASING_REPLAY_THRESHOLD: u8 = 4;

/// Consecutive commit cycles with no forward progress before commit
/// itself declares a dispatch deadlock and asks the caller to flush.
const DISPATCH_DEADLOCK_THRESHOLD: u32 = 64;

/// One entry fetched this cycle, queued for rename.
#[derive(Clone, Debug)]
pub struct FetchBufferEntry {
    pub uop: Uop,
    pub rip: VirtAddr,
    pub predicted: Prediction,
}

/// Outcome of issuing one uop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssueStatus {
    Completed,
    NeedsReplay,
    Misspeculated,
    NeedsRefetch,
    Skipped,
}

/// Recovery action selected by commit-time fault handling.
#[derive(Clone, Copy, Debug)]
pub enum Recovery {
    BranchMispredict { tag: RobTag, correct_rip: VirtAddr },
    AliasingReplay { tag: RobTag },
    Exception { tag: RobTag, fault: CoreFault },
    DispatchDeadlock,
}

/// The out-of-order core's per-thread pipeline state.
pub struct OooCore {
    pub rob: Rob,
    pub regfile: RegisterFile,
    pub predictor: BranchPredictor,
    /// Load/store queue backing every in-flight memory uop: address
    /// generation, aliasing checks, and store-to-load forwarding.
    pub lsq: LoadStoreQueue,
    /// Data TLB this core's memory uops translate through before probing
    /// the cache hierarchy.
    pub dtlb: Tlb,
    fetchq: Vec<FetchBufferEntry>,
    issueqs: Vec<IssueQueue>,
    commit_width: usize,
    fetch_width: usize,
    deadlock_counter: u32,
    last_commit_progress: bool,
}

impl OooCore {
    /// Builds a core with the given structural sizes.
    #[must_use]
    pub fn new(
        rob_size: usize,
        phys_regs_per_file: usize,
        issueq_size: usize,
        num_clusters: usize,
        commit_width: usize,
        fetch_width: usize,
        btb_entries: usize,
        ras_entries: usize,
        lsq_size: usize,
        dtlb_entries: usize,
    ) -> Self {
        Self {
            rob: Rob::new(rob_size),
            regfile: RegisterFile::new(phys_regs_per_file),
            predictor: BranchPredictor::new(btb_entries, ras_entries),
            lsq: LoadStoreQueue::new(lsq_size),
            dtlb: Tlb::new(dtlb_entries),
            fetchq: Vec::new(),
            issueqs: (0..num_clusters).map(|_| IssueQueue::new(issueq_size)).collect(),
            commit_width,
            fetch_width,
            deadlock_counter: 0,
            last_commit_progress: true,
        }
    }

    /// Fetch stage: pulls up to `fetch_width` uops from `block` starting
    /// at `uop_index`, predicting the terminating branch if this block's
    /// last uop is one. Returns the number of uops fetched and, if fetch
    /// stopped because a predicted-taken branch redirected it, the new
    /// fetch address.
    pub fn fetch(&mut self, block: &BasicBlock, rip: VirtAddr, uop_index: usize) -> (usize, Option<VirtAddr>) {
        let mut fetched = 0;
        let mut redirect = None;
        for (i, uop) in block.uops.iter().enumerate().skip(uop_index) {
            if fetched >= self.fetch_width {
                break;
            }
            let predicted = if uop.opcode.is_branch() {
                self.predictor.predict(rip)
            } else {
                Prediction { taken: false, target: None }
            };
            self.fetchq.push(FetchBufferEntry { uop: uop.clone(), rip, predicted });
            fetched += 1;
            if uop.opcode.is_branch() && predicted.taken {
                redirect = predicted.target.map(VirtAddr::new);
                let _ = i;
                break;
            }
        }
        (fetched, redirect)
    }

    /// Rename stage: for each fetched uop, allocates a destination
    /// physreg and binds sources via the speculative RRT, dispatching
    /// into the ROB. Stalls (returns fewer tags than uops available) when
    /// a resource is exhausted.
    pub fn rename_and_dispatch(&mut self, cluster_of: impl Fn(&Uop) -> ClusterId) -> Vec<RobTag> {
        let mut tags = Vec::new();
        while let Some(entry) = self.fetchq.first().cloned() {
            if self.rob.is_full() {
                break;
            }
            if entry.uop.is_memory_op() && self.lsq.is_full() {
                break;
            }
            let cluster = cluster_of(&entry.uop);
            let kind = if entry.uop.opcode.is_store() {
                RegFileKind::Store
            } else if matches!(entry.uop.opcode.class, crate::uop::OpClass::FpAlu | crate::uop::OpClass::FpCvt) {
                RegFileKind::Float
            } else if entry.uop.opcode.is_branch() {
                RegFileKind::Branch
            } else {
                RegFileKind::Integer
            };
            let Some(dest) = self.regfile.alloc(kind) else { break };

            let Some(tag) = self.rob.allocate(entry.uop.clone(), cluster) else {
                break;
            };
            let source_a = self.regfile.rename_read(usize::from(entry.uop.ra));
            let source_b = self.regfile.rename_read(usize::from(entry.uop.rb));
            if let Some(e) = self.rob.find_entry_mut(tag) {
                e.dest = Some(dest);
                e.rip = entry.rip;
                e.branch_predicted_taken = entry.predicted.taken;
                e.sources[0] = Some(source_a);
                e.sources[1] = Some(source_b);
            }
            self.regfile.rename_write(usize::from(entry.uop.rd), dest);

            if entry.uop.is_memory_op() {
                let op = if entry.uop.opcode.is_store() { LsqOp::Store } else { LsqOp::Load };
                if let Some(idx) = self.lsq.allocate(tag, op, entry.uop.size.bytes()) {
                    if let Some(e) = self.rob.find_entry_mut(tag) {
                        e.lsq_index = Some(idx);
                    }
                }
            }

            let iq = cluster as usize % self.issueqs.len().max(1);
            if iq < self.issueqs.len() {
                self.issueqs[iq].insert(tag, [None, None, None], self.rob.len() as u64);
            }
            tags.push(tag);
            self.fetchq.remove(0);
        }
        tags
    }

    /// Computes a memory uop's effective virtual address from its renamed
    /// base register (`sources[0]`) plus its displacement immediate.
    /// `None` if the tag is gone or was never dispatched with a bound
    /// base source.
    #[must_use]
    pub fn effective_vaddr(&self, tag: RobTag) -> Option<VirtAddr> {
        let entry = self.rob.find_entry(tag)?;
        let base_reg = entry.sources[0]?;
        let base = self.regfile.read(base_reg);
        let addr = (base as i64).wrapping_add(entry.uop.rbimm) as u64;
        Some(VirtAddr::new(addr))
    }

    /// Records another store-forwarding stall against `tag`. Returns
    /// `true` once the replay count crosses the threshold at which the
    /// caller should escalate to a full exception rather than replay the
    /// uop again in place.
    pub fn note_forward_stall(&mut self, tag: RobTag) -> bool {
        self.rob.find_entry_mut(tag).map_or(false, |e| {
            e.replay_count = e.replay_count.saturating_add(1);
            e.replay_count >= ALIASING_REPLAY_THRESHOLD
        })
    }

    /// Issue stage for one cluster: selects a ready slot and marks its
    /// ROB entry issued. The caller supplies the actual execution of the
    /// uop's semantics (the decoder-synthesized implementation, external
    /// to this crate) and passes back the `IssueStatus`.
    pub fn issue_one(&mut self, cluster: usize) -> Option<RobTag> {
        let tag = self.issueqs.get_mut(cluster)?.select_ready()?;
        if let Some(e) = self.rob.find_entry_mut(tag) {
            e.issued = true;
            e.current_state_list = RobState::Issued;
        }
        Some(tag)
    }

    /// Completes an issued uop with a normal result, broadcasting its tag
    /// to every cluster's issue queue so dependents wake.
    pub fn complete(&mut self, tag: RobTag, sim_cycle: u64, result: u64, flags: u16) {
        self.rob.complete(tag, sim_cycle + 1);
        if let Some(e) = self.rob.find_entry(tag) {
            if let Some(dest) = e.dest {
                self.regfile.writeback(dest, result, flags);
            }
        }
        for iq in &mut self.issueqs {
            iq.wakeup(tag);
        }
    }

    /// Marks an issued uop faulted with `fault`; commit will inspect the
    /// stored payload to decide between an in-place replay and a full
    /// flush to the emulator.
    pub fn fault(&mut self, tag: RobTag, fault: CoreFault) {
        self.rob.fault(tag, fault);
    }

    /// Records the actual resolved direction of a completed conditional
    /// branch. Commit compares this against the direction predicted at
    /// fetch to decide whether recovery is needed.
    pub fn resolve_branch(&mut self, tag: RobTag, taken: bool) {
        if let Some(e) = self.rob.find_entry_mut(tag) {
            e.branch_resolved_taken = Some(taken);
        }
    }

    /// Commit stage: retires up to `commit_width` completed, in-order
    /// x86-instruction groups (the run of uops between a `som` and its
    /// closing `eom`, per [`Rob::peek_head_group`]). A group commits only
    /// once every uop in it is `Completed`/`Faulted` and the whole group
    /// fits in the remaining commit-width budget this cycle, so a fault
    /// or a width cutoff can never retire half of one x86 instruction.
    /// Returns the recovery action needed, if any, and the number of uops
    /// committed.
    pub fn commit(&mut self) -> (usize, Option<Recovery>) {
        if self.deadlock_counter >= DISPATCH_DEADLOCK_THRESHOLD {
            return (0, Some(Recovery::DispatchDeadlock));
        }

        let mut committed = 0;
        while committed < self.commit_width {
            let Some(group) = self.rob.peek_head_group() else { break };
            if group.len() > self.commit_width - committed {
                break;
            }

            let all_ready = group.iter().all(|&tag| {
                self.rob
                    .find_entry(tag)
                    .is_some_and(|e| matches!(e.current_state_list, RobState::Completed | RobState::Faulted))
            });
            if !all_ready {
                break;
            }

            let faulted = group.iter().copied().find(|&tag| {
                self.rob.find_entry(tag).is_some_and(|e| matches!(e.current_state_list, RobState::Faulted))
            });
            if let Some(tag) = faulted {
                if let Some(entry) = self.rob.find_entry(tag) {
                    let fault = entry.fault.unwrap_or(CoreFault::Propagate(entry.rip));
                    self.last_commit_progress = committed > 0;
                    return (
                        committed,
                        Some(if fault.is_replay() {
                            Recovery::AliasingReplay { tag }
                        } else {
                            Recovery::Exception { tag, fault }
                        }),
                    );
                }
            }

            let mut mispredict = None;
            for &tag in &group {
                if let Some(entry) = self.rob.find_entry(tag) {
                    if !entry.uop.opcode.is_branch() {
                        continue;
                    }
                    let predicted_taken = entry.branch_predicted_taken;
                    let actual_taken = entry.branch_resolved_taken.unwrap_or(predicted_taken);
                    if actual_taken != predicted_taken {
                        let correct_rip =
                            VirtAddr::new(if actual_taken { entry.uop.riptaken } else { entry.uop.ripseq });
                        mispredict = Some((tag, actual_taken, correct_rip));
                    }
                }
            }
            if let Some((tag, actual_taken, correct_rip)) = mispredict {
                if let Some(e) = self.rob.find_entry_mut(tag) {
                    e.branch_predicted_taken = actual_taken;
                }
                self.last_commit_progress = committed > 0;
                return (committed, Some(Recovery::BranchMispredict { tag, correct_rip }));
            }

            for tag in group {
                let lsq_index = self.rob.find_entry(tag).and_then(|e| e.lsq_index);
                if let Some(idx) = lsq_index {
                    self.lsq.mark_committed(idx);
                    self.lsq.retire_head();
                }
                if let Some(entry) = self.rob.commit_head() {
                    self.regfile.commit(usize::from(entry.uop.rd));
                }
                committed += 1;
            }
        }
        self.last_commit_progress = committed > 0;
        if committed == 0 {
            self.deadlock_counter += 1;
        } else {
            self.deadlock_counter = 0;
        }
        (committed, None)
    }

    /// Applies branch-mispredict recovery: flushes the ROB after the
    /// mispredicting entry, rewinds the speculative RRT to the commit
    /// RRT, clears the fetch queue, and flushes every issue queue's
    /// now-speculative-and-dead slots.
    pub fn recover_branch_mispredict(&mut self, tag: RobTag) {
        self.recover_flush_from(tag);
    }

    /// Generic flush-from-tag recovery: drops every entry younger than
    /// `tag`, rewinds the speculative RRT, and clears fetch/issue state.
    /// Used for branch mispredict, aliasing replay, and exception recovery
    /// alike; only the target fetch address differs per caller.
    pub fn recover_flush_from(&mut self, tag: RobTag) {
        self.rob.flush_after(tag);
        self.regfile.rewind_to_commit();
        self.fetchq.clear();
        for iq in &mut self.issueqs {
            iq.flush_where(|_| true);
        }
        let rob = &self.rob;
        self.lsq.flush_where(|t| rob.find_entry(t).is_none());
        self.reinsert_live_rob_entries();
    }

    /// Full-pipeline flush used for dispatch-deadlock recovery: nothing is
    /// kept, unlike [`Self::recover_flush_from`] which preserves the ROB
    /// entry it is anchored on.
    pub fn recover_full_flush(&mut self) {
        self.rob.flush_all();
        self.regfile.rewind_to_commit();
        self.fetchq.clear();
        for iq in &mut self.issueqs {
            iq.flush_where(|_| true);
        }
        self.lsq.flush_where(|_| true);
        self.deadlock_counter = 0;
    }

    fn reinsert_live_rob_entries(&mut self) {
        let mut reinserts: Vec<(RobTag, ClusterId)> = Vec::new();
        self.rob.for_each_valid(|tag, e| {
            if matches!(e.current_state_list, RobState::Dispatched | RobState::ReadyToIssue) {
                reinserts.push((tag, e.cluster));
            }
        });
        for (tag, cluster) in reinserts {
            let iq = cluster as usize % self.issueqs.len().max(1);
            if iq < self.issueqs.len() {
                self.issueqs[iq].insert(tag, [None, None, None], 0);
            }
        }
    }

    /// Whether dispatch has made no forward progress for enough cycles
    /// that the caller should declare a dispatch deadlock and flush.
    #[must_use]
    pub fn is_deadlocked(&self, threshold: u32) -> bool {
        self.deadlock_counter >= threshold
    }

    /// Records a resolved branch's true outcome back into the predictor.
    pub fn update_predictor(&mut self, outcome: BranchOutcome) {
        self.predictor.update(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uop::{AlignHalf, FlagMask, OpClass, Opcode, OpSize};

    fn nop(rd: u16) -> Uop {
        Uop {
            opcode: Opcode { class: OpClass::AddSub, name: "add" },
            size: OpSize::Quad,
            ra: 0,
            rb: 0,
            rc: 0,
            rd,
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

    fn straight_line_block() -> BasicBlock {
        use crate::bb::{BranchType, RipVirtPhys};
        BasicBlock {
            id: RipVirtPhys {
                rip: VirtAddr::new(0x1000),
                mfn_lo: 1,
                mfn_hi: 1,
                use64: true,
                kernel: false,
                df: false,
            },
            uops: vec![nop(1), nop(2)],
            rip_taken: VirtAddr::new(0),
            rip_not_taken: VirtAddr::new(0x1010),
            branch_type: BranchType::None,
            bytes: 8,
            user_insns: 2,
            uop_count: 2,
            has_mfence: false,
            has_x87: false,
            has_sse: false,
            nondeterministic: false,
            refcount: 0,
            hit_count: 0,
            predict_count: 0,
        }
    }

    #[test]
    fn fetch_rename_issue_complete_commit_roundtrip() {
        let mut core = OooCore::new(8, 32, 8, 1, 4, 4, 16, 4, 8, 8);
        let block = straight_line_block();
        let (n, _) = core.fetch(&block, VirtAddr::new(0x1000), 0);
        assert_eq!(n, 2);

        let tags = core.rename_and_dispatch(|_| 0);
        assert_eq!(tags.len(), 2);

        let issued = core.issue_one(0).unwrap();
        assert_eq!(issued, tags[0]);
        core.complete(issued, 0, 42, 0);

        let (committed, recovery) = core.commit();
        assert_eq!(committed, 1);
        assert!(recovery.is_none());
    }

    #[test]
    fn deadlock_counter_increments_only_when_no_progress() {
        let mut core = OooCore::new(4, 16, 4, 1, 2, 2, 16, 4, 8, 8);
        let (c, _) = core.commit();
        assert_eq!(c, 0);
        assert!(!core.is_deadlocked(1));
        for _ in 0..5 {
            core.commit();
        }
        assert!(core.is_deadlocked(3));
    }
}
