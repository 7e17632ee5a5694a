//! Physical register file and rename tables.
//!
//! Architectural registers are renamed onto a larger pool of physical
//! registers, partitioned by the kind of value they hold. Two rename
//! tables map the 72 architectural slots: the speculative RRT (read by
//! rename, rewound on misprediction/exception) and the commit RRT (updated
//! only as instructions retire, the rollback target).

/// Number of architectural register slots named here (72 general +
/// flags/segment slots, rounded to a convenient table size).
pub const ARCH_REG_COUNT: usize = 72;

/// Lifecycle state of a physical register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PhysRegState {
    /// On the free list, not bound to any architectural name.
    #[default]
    Free,
    /// Allocated to an in-flight uop; result not yet computed.
    Waiting,
    /// Result computed and broadcast, but not yet visible to the commit
    /// RRT (the producing uop hasn't committed).
    Bypass,
    /// Result is final and this register has been linked into the commit
    /// RRT as an instruction retires. Equivalent to `Written` until a
    /// later rename target displaces it from the architectural mapping.
    Written,
    /// Currently the architectural value for its slot.
    Arch,
    /// Superseded as the architectural register but still referenced by
    /// some in-flight consumer; freed once `refcount` drops to zero.
    PendingFree,
}

/// Which partition of the physical register file a register belongs to:
/// the "integer, FP, store, branch" split.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegFileKind {
    /// General-purpose integer results.
    Integer,
    /// Floating-point/SSE results.
    Float,
    /// Store-data staging (kept separate so stores don't compete with
    /// integer/FP producers for rename ports).
    Store,
    /// Branch-resolution bookkeeping (condition codes, target addresses).
    Branch,
}

/// Index into a `RegisterFile`'s flat storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PhysRegId(pub u32);

#[derive(Clone, Debug)]
struct PhysReg {
    state: PhysRegState,
    data: u64,
    flags: u16,
    refcount: u32,
    kind: RegFileKind,
}

/// A partitioned pool of physical registers with round-robin allocation
/// within each partition, plus the speculative and commit rename tables
/// mapping the 72 architectural slots onto physical register ids.
pub struct RegisterFile {
    regs: Vec<PhysReg>,
    free_lists: [Vec<u32>; 4],
    alloc_cursor: [usize; 4],
    speculative_rrt: [PhysRegId; ARCH_REG_COUNT],
    commit_rrt: [PhysRegId; ARCH_REG_COUNT],
}

fn kind_index(kind: RegFileKind) -> usize {
    match kind {
        RegFileKind::Integer => 0,
        RegFileKind::Float => 1,
        RegFileKind::Store => 2,
        RegFileKind::Branch => 3,
    }
}

impl RegisterFile {
    /// Builds a register file with `per_kind` physical registers in each
    /// of the four partitions, all initially mapped to architectural slot
    /// 0 at reset (a sentinel "zero" register with refcount pinned).
    #[must_use]
    pub fn new(per_kind: usize) -> Self {
        let total = per_kind * 4;
        let mut regs = Vec::with_capacity(total);
        let mut free_lists: [Vec<u32>; 4] = Default::default();

        for (k_idx, kind) in [
            RegFileKind::Integer,
            RegFileKind::Float,
            RegFileKind::Store,
            RegFileKind::Branch,
        ]
        .into_iter()
        .enumerate()
        {
            for _ in 0..per_kind {
                let id = regs.len() as u32;
                regs.push(PhysReg {
                    state: PhysRegState::Free,
                    data: 0,
                    flags: 0,
                    refcount: 0,
                    kind,
                });
                free_lists[k_idx].push(id);
            }
        }

        let zero = PhysRegId(free_lists[0].pop().unwrap_or(0));
        regs[zero.0 as usize].state = PhysRegState::Arch;
        regs[zero.0 as usize].refcount = 1;

        Self {
            regs,
            free_lists,
            alloc_cursor: [0; 4],
            speculative_rrt: [zero; ARCH_REG_COUNT],
            commit_rrt: [zero; ARCH_REG_COUNT],
        }
    }

    /// Allocates a fresh physical register from the given partition's free
    /// list. Returns `None` if the partition is exhausted; the caller
    /// (rename) must stall.
    pub fn alloc(&mut self, kind: RegFileKind) -> Option<PhysRegId> {
        let k = kind_index(kind);
        let id = self.free_lists[k].pop()?;
        self.regs[id as usize] = PhysReg {
            state: PhysRegState::Waiting,
            data: 0,
            flags: 0,
            refcount: 1,
            kind,
        };
        Some(PhysRegId(id))
    }

    /// Looks up the speculative mapping for an architectural slot.
    #[must_use]
    pub fn rename_read(&self, arch: usize) -> PhysRegId {
        self.speculative_rrt[arch]
    }

    /// Binds architectural slot `arch` to `phys` in the speculative RRT,
    /// incrementing the new register's refcount and dropping the old
    /// mapping's.
    pub fn rename_write(&mut self, arch: usize, phys: PhysRegId) {
        let old = self.speculative_rrt[arch];
        self.speculative_rrt[arch] = phys;
        self.regs[phys.0 as usize].refcount += 1;
        self.release(old);
    }

    /// Writes a uop's result into its destination register and moves it
    /// to `Bypass`, making it visible to the inter-cluster forwarding bus.
    pub fn writeback(&mut self, phys: PhysRegId, data: u64, flags: u16) {
        let r = &mut self.regs[phys.0 as usize];
        r.data = data;
        r.flags = flags;
        r.state = PhysRegState::Bypass;
    }

    /// Reads the current value of a physical register.
    #[must_use]
    pub fn read(&self, phys: PhysRegId) -> u64 {
        self.regs[phys.0 as usize].data
    }

    /// Whether a physical register's result is ready to be consumed.
    #[must_use]
    pub fn is_ready(&self, phys: PhysRegId) -> bool {
        matches!(
            self.regs[phys.0 as usize].state,
            PhysRegState::Bypass | PhysRegState::Written | PhysRegState::Arch
        )
    }

    /// Commits architectural slot `arch`: binds the commit RRT to the
    /// register currently named by the speculative RRT, demoting the
    /// register it replaces to `PendingFree` (freed once its refcount
    /// hits zero) and promoting the new one to `Arch`.
    pub fn commit(&mut self, arch: usize) {
        let new_phys = self.speculative_rrt[arch];
        let old_phys = self.commit_rrt[arch];
        self.regs[new_phys.0 as usize].state = PhysRegState::Arch;
        self.commit_rrt[arch] = new_phys;

        if old_phys.0 != new_phys.0 {
            let old = &mut self.regs[old_phys.0 as usize];
            if old.state == PhysRegState::Arch {
                old.state = PhysRegState::PendingFree;
            }
            self.release(old_phys);
        }
    }

    /// Rewinds the speculative RRT to match the commit RRT: the recovery
    /// action taken on branch misprediction or exception.
    pub fn rewind_to_commit(&mut self) {
        for arch in 0..ARCH_REG_COUNT {
            let commit_phys = self.commit_rrt[arch];
            let spec_phys = self.speculative_rrt[arch];
            if spec_phys.0 != commit_phys.0 {
                self.speculative_rrt[arch] = commit_phys;
                self.regs[commit_phys.0 as usize].refcount += 1;
                self.release(spec_phys);
            }
        }
    }

    /// Drops one reference to a physical register; if it reaches zero and
    /// the register is not the current architectural value, returns it to
    /// its partition's free list.
    fn release(&mut self, id: PhysRegId) {
        let r = &mut self.regs[id.0 as usize];
        if r.refcount == 0 {
            return;
        }
        r.refcount -= 1;
        if r.refcount == 0 && r.state != PhysRegState::Arch {
            r.state = PhysRegState::Free;
            let k = kind_index(r.kind);
            self.free_lists[k].push(id.0);
        }
    }

    /// Current state of a physical register (test/debug visibility).
    #[must_use]
    pub fn state(&self, id: PhysRegId) -> PhysRegState {
        self.regs[id.0 as usize].state
    }

    /// Current refcount of a physical register (test/debug visibility).
    #[must_use]
    pub fn refcount(&self, id: PhysRegId) -> u32 {
        self.regs[id.0 as usize].refcount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_then_commit_promotes_to_arch() {
        let mut rf = RegisterFile::new(16);
        let p = rf.alloc(RegFileKind::Integer).unwrap();
        rf.rename_write(5, p);
        rf.writeback(p, 42, 0);
        rf.commit(5);
        assert_eq!(rf.state(p), PhysRegState::Arch);
        assert_eq!(rf.read(p), 42);
    }

    #[test]
    fn rewind_restores_commit_mapping() {
        let mut rf = RegisterFile::new(16);
        let p0 = rf.alloc(RegFileKind::Integer).unwrap();
        rf.rename_write(5, p0);
        rf.writeback(p0, 1, 0);
        rf.commit(5);

        let p1 = rf.alloc(RegFileKind::Integer).unwrap();
        rf.rename_write(5, p1); // speculative rename past commit
        assert_eq!(rf.rename_read(5), p1);

        rf.rewind_to_commit();
        assert_eq!(rf.rename_read(5), p0);
    }

    #[test]
    fn refcount_never_negative_and_free_on_zero() {
        let mut rf = RegisterFile::new(4);
        let p = rf.alloc(RegFileKind::Integer).unwrap();
        assert_eq!(rf.refcount(p), 1);
        rf.rename_write(1, p);
        assert_eq!(rf.refcount(p), 2);
    }
}
