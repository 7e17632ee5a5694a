//! Decoder and functional-emulator boundary traits.
//!
//! The x86 decoder and the host emulator (QEMU) are external collaborators,
//! reached only through the interfaces the core consumes. These traits are
//! that interface; production wiring plugs in
//! real implementations, while `TestEmulator`/`TableDecoder` below are
//! fixed-table test doubles used by the integration scenarios in
//! `tests/`.

use crate::bb::{BasicBlock, RipVirtPhys};
use crate::common::addr::{PhysAddr, VirtAddr};
use crate::context::Context;

/// Translates guest code into timing-model uops. One call per distinct
/// `RipVirtPhys` identity; the core caches the result in a
/// `BasicBlockCache`.
pub trait Decoder {
    /// Decodes the basic block starting at `id`.
    fn translate(&self, id: RipVirtPhys) -> BasicBlock;
}

/// The host functional emulator's interface to the timing core.
pub trait Emulator {
    /// Executes exactly one x86 instruction functionally, updating `ctx`.
    fn step_one_x86_insn(&mut self, ctx: &mut Context);

    /// Whether `vaddr`'s containing page is marked dirty (self-modifying
    /// code since it was last cleared).
    fn is_page_dirty(&self, mfn: u64) -> bool;

    /// Marks a page dirty; called from the core's SMC commit hook.
    fn set_page_dirty(&mut self, mfn: u64);

    /// Clears a page's dirty mark once its basic blocks are invalidated.
    fn clear_page_dirty(&mut self, mfn: u64);

    /// Translates a virtual address to a physical one, or `None` on a
    /// page fault (the caller then calls
    /// [`Context::handle_page_fault`](crate::context::Context::handle_page_fault)).
    fn translate_addr(&self, vaddr: VirtAddr) -> Option<PhysAddr>;
}

/// A fixed lookup-table `Decoder` used by tests: maps a `RipVirtPhys` to
/// a pre-built `BasicBlock` supplied at construction, rather than
/// performing real x86 decoding.
#[derive(Default)]
pub struct TableDecoder {
    table: std::collections::HashMap<RipVirtPhys, BasicBlock>,
}

impl TableDecoder {
    /// Creates an empty table; tests populate it with `insert` before use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the block this decoder should return for `id`.
    pub fn insert(&mut self, id: RipVirtPhys, block: BasicBlock) {
        self.table.insert(id, block);
    }
}

impl Decoder for TableDecoder {
    fn translate(&self, id: RipVirtPhys) -> BasicBlock {
        self.table
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("TableDecoder has no block registered for {id:?}"))
    }
}

/// A trivial identity-mapped `Emulator` test double: physical address
/// equals virtual address, no paging, dirty pages tracked in a set.
#[derive(Default)]
pub struct TestEmulator {
    dirty_pages: std::collections::HashSet<u64>,
}

impl TestEmulator {
    /// Creates an emulator double with no pages marked dirty.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Emulator for TestEmulator {
    fn step_one_x86_insn(&mut self, ctx: &mut Context) {
        ctx.rip = VirtAddr::new(ctx.rip.val() + 1);
    }

    fn is_page_dirty(&self, mfn: u64) -> bool {
        self.dirty_pages.contains(&mfn)
    }

    fn set_page_dirty(&mut self, mfn: u64) {
        self.dirty_pages.insert(mfn);
    }

    fn clear_page_dirty(&mut self, mfn: u64) {
        self.dirty_pages.remove(&mfn);
    }

    fn translate_addr(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        Some(PhysAddr::new(vaddr.val()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bb::BranchType;

    fn block(rip: u64) -> BasicBlock {
        BasicBlock {
            id: RipVirtPhys {
                rip: VirtAddr::new(rip),
                mfn_lo: rip >> 12,
                mfn_hi: rip >> 12,
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
    fn table_decoder_returns_registered_block() {
        let mut d = TableDecoder::new();
        let b = block(0x1000);
        d.insert(b.id, b.clone());
        let out = d.translate(b.id);
        assert_eq!(out.bytes, b.bytes);
    }

    #[test]
    fn test_emulator_identity_maps_addresses() {
        let emu = TestEmulator::new();
        assert_eq!(emu.translate_addr(VirtAddr::new(0x4000)), Some(PhysAddr::new(0x4000)));
    }

    #[test]
    fn test_emulator_advances_rip_by_one() {
        let mut emu = TestEmulator::new();
        let mut ctx = Context::new();
        ctx.rip = VirtAddr::new(0x1000);
        emu.step_one_x86_insn(&mut ctx);
        assert_eq!(ctx.rip, VirtAddr::new(0x1001));
    }
}
