//! Basic blocks: the decoder's unit of translation and the core's unit of
//! fetch.
//!
//! A `BasicBlock` is produced once by [`crate::decoder::Decoder::translate`]
//! and cached by RIP so repeated fetches of the same straight-line code
//! don't re-decode. Self-modifying code invalidates cached blocks by
//! machine-frame-number (mfn).

use std::collections::HashMap;

use crate::common::addr::VirtAddr;
use crate::uop::Uop;

/// Identity of a basic block: the guest RIP plus the physical page(s) its
/// bytes live on. Two blocks with the same `rip` but different `mfn_lo`
/// (after the guest remaps the page) are different blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RipVirtPhys {
    /// Guest virtual instruction pointer.
    pub rip: VirtAddr,
    /// Machine frame number of the first (or only) page the block spans.
    pub mfn_lo: u64,
    /// Machine frame number of the second page, equal to `mfn_lo` when the
    /// block does not cross a page boundary.
    pub mfn_hi: u64,
    /// 64-bit addressing mode active when this block was translated.
    pub use64: bool,
    /// Kernel-mode translation (affects segment/paging behavior).
    pub kernel: bool,
    /// Direction flag at translation time (affects string-op semantics).
    pub df: bool,
}

/// Classification of how a block ends, used by fetch to decide whether to
/// continue straight-line or consult the branch predictor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchType {
    /// No control transfer; falls through to the next block.
    None,
    /// Unconditional direct jump.
    Jump,
    /// Conditional jump.
    CondJump,
    /// Call.
    Call,
    /// Return.
    Return,
    /// Indirect jump (computed target).
    IndirectJump,
    /// Indirect call.
    IndirectCall,
    /// Software interrupt / syscall gate.
    Trap,
}

/// Maximum uops a single basic block may hold.
pub const MAX_BB_UOPS: usize = 63;

/// A decoded, straight-line sequence of uops.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    /// Identity used as the `BasicBlockCache` key.
    pub id: RipVirtPhys,
    /// The uop payload, at most [`MAX_BB_UOPS`] long.
    pub uops: Vec<Uop>,
    /// Target if the terminating branch is taken.
    pub rip_taken: VirtAddr,
    /// Target if the terminating branch is not taken (fallthrough).
    pub rip_not_taken: VirtAddr,
    /// How the block's control flow ends.
    pub branch_type: BranchType,
    /// Encoded x86 byte length.
    pub bytes: u32,
    /// Number of x86 instructions (SOM/EOM pairs) in this block.
    pub user_insns: u32,
    /// Total uop count (== `uops.len()`).
    pub uop_count: u32,
    /// Contains a memory-fence uop.
    pub has_mfence: bool,
    /// Contains an x87 uop.
    pub has_x87: bool,
    /// Contains an SSE uop.
    pub has_sse: bool,
    /// Non-deterministic (e.g. RDTSC): cannot be safely replayed by the
    /// checker without re-snapshotting.
    pub nondeterministic: bool,
    /// Outstanding references from in-flight ROB/fetch entries. A block is
    /// only evicted from the cache once this reaches zero.
    pub refcount: u64,
    /// Times this block was fetched.
    pub hit_count: u64,
    /// Times the terminating branch was correctly predicted.
    pub predict_count: u64,
}

impl BasicBlock {
    /// Whether this block's identity is consistent with the page
    /// invariant: it spans at most two contiguous 4 KiB pages, and
    /// `mfn_hi == mfn_lo` whenever it fits in one.
    #[must_use]
    pub fn page_invariant_holds(&self) -> bool {
        self.id.mfn_hi == self.id.mfn_lo || self.id.mfn_hi == self.id.mfn_lo + 1
    }
}

/// Per-CPU cache of decoded basic blocks, keyed by identity and indexed by
/// machine frame number for self-modifying-code invalidation.
#[derive(Default)]
pub struct BasicBlockCache {
    blocks: HashMap<RipVirtPhys, BasicBlock>,
    by_mfn: HashMap<u64, Vec<RipVirtPhys>>,
}

impl BasicBlockCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a cached block by identity.
    #[must_use]
    pub fn get(&self, id: &RipVirtPhys) -> Option<&BasicBlock> {
        self.blocks.get(id)
    }

    /// Inserts a freshly translated block, indexing it by the page(s) it
    /// spans so a later SMC write can find and drop it.
    pub fn insert(&mut self, block: BasicBlock) {
        let id = block.id;
        self.by_mfn.entry(id.mfn_lo).or_default().push(id);
        if id.mfn_hi != id.mfn_lo {
            self.by_mfn.entry(id.mfn_hi).or_default().push(id);
        }
        self.blocks.insert(id, block);
    }

    /// Invalidates every block touching `mfn`: the self-modifying-code
    /// path. The functional emulator marks a page dirty on a committed
    /// store, and the next fetch through this page calls this before
    /// reusing anything cached.
    pub fn invalidate_page(&mut self, mfn: u64) {
        if let Some(ids) = self.by_mfn.remove(&mfn) {
            for id in ids {
                self.blocks.remove(&id);
            }
        }
    }

    /// Number of cached blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the cache holds no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(rip: u64, mfn: u64) -> BasicBlock {
        BasicBlock {
            id: RipVirtPhys {
                rip: VirtAddr::new(rip),
                mfn_lo: mfn,
                mfn_hi: mfn,
                use64: true,
                kernel: false,
                df: false,
            },
            uops: Vec::new(),
            rip_taken: VirtAddr::new(0),
            rip_not_taken: VirtAddr::new(rip + 4),
            branch_type: BranchType::None,
            bytes: 4,
            user_insns: 1,
            uop_count: 0,
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
    fn smc_invalidation_drops_block_by_mfn() {
        let mut cache = BasicBlockCache::new();
        let block = make_block(0x3000, 3);
        let id = block.id;
        cache.insert(block);
        assert!(cache.get(&id).is_some());

        cache.invalidate_page(3);
        assert!(cache.get(&id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn single_page_block_has_equal_mfns() {
        let block = make_block(0x3000, 3);
        assert!(block.page_invariant_holds());
    }
}
