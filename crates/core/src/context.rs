//! Per-VCPU architectural state.
//!
//! `Context` is the boundary object the functional emulator and the
//! timing core both touch: the emulator owns its contents during
//! fast-forward and exception handoff, the core reads/writes it at
//! commit.

use crate::common::addr::{PhysAddr, VirtAddr};
use crate::common::error::CoreFault;

/// 128-bit SSE register, stored as two 64-bit halves.
pub type XmmReg = [u64; 2];

/// x87 FPU stack depth.
pub const X87_STACK_DEPTH: usize = 8;

/// A cached segment descriptor (base/limit/attributes), sized for
/// CS/DS/ES/FS/GS/SS.
#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attrs: u16,
}

/// Control registers, grouped since they change together on mode
/// transitions.
#[derive(Clone, Copy, Debug, Default)]
pub struct ControlRegs {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

/// A pending x86 exception surfaced from the pipeline, consumed by the
/// functional emulator on handoff.
#[derive(Clone, Copy, Debug)]
pub struct PendingException {
    pub fault: CoreFault,
    pub error_code: u32,
    pub cr2: u64,
}

/// Full architectural state of one virtual CPU.
pub struct Context {
    pub gpr: [u64; 16],
    pub xmm: [XmmReg; 16],
    pub x87_stack: [u64; X87_STACK_DEPTH],
    pub x87_tags: [u8; X87_STACK_DEPTH],
    pub x87_control: u16,
    pub x87_status: u16,
    pub rip: VirtAddr,
    pub segments: [SegmentCache; 6],
    pub cregs: ControlRegs,
    pub use64: bool,
    pub use32: bool,
    pub kernel_mode: bool,
    pub running: bool,
    pub interrupt_pending: bool,
    pub exception: Option<PendingException>,
    smc_dirty_pages: std::collections::HashSet<u64>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            gpr: [0; 16],
            xmm: [[0, 0]; 16],
            x87_stack: [0; X87_STACK_DEPTH],
            x87_tags: [0; X87_STACK_DEPTH],
            x87_control: 0x037F,
            x87_status: 0,
            rip: VirtAddr::new(0),
            segments: [SegmentCache::default(); 6],
            cregs: ControlRegs::default(),
            use64: true,
            use32: false,
            kernel_mode: false,
            running: true,
            interrupt_pending: false,
            exception: None,
            smc_dirty_pages: std::collections::HashSet::new(),
        }
    }
}

impl Context {
    /// Creates a freshly reset context (64-bit long mode, user mode,
    /// running).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-cycle interrupt probe: OR of a pending interrupt gated by the
    /// emulator's IF mask and an exit request.
    #[must_use]
    pub fn check_events(&self, if_flag: bool, exit_request: bool) -> bool {
        (self.interrupt_pending && if_flag) || exit_request
    }

    /// Records a page fault and hands control back to the emulator.
    pub fn handle_page_fault(&mut self, vaddr: VirtAddr, is_write: bool) {
        let fault = if is_write {
            CoreFault::PageFaultWrite(vaddr)
        } else {
            CoreFault::PageFaultRead(vaddr)
        };
        self.cregs.cr2 = vaddr.val();
        self.exception = Some(PendingException { fault, error_code: 0, cr2: vaddr.val() });
        self.running = false;
    }

    /// SMC hook: called on every committed store.
    pub fn smc_setdirty(&mut self, phys_page: u64) {
        self.smc_dirty_pages.insert(phys_page);
    }

    /// Whether a page has been marked dirty by a committed store since
    /// the last `smc_cleardirty`.
    #[must_use]
    pub fn smc_isdirty(&self, phys_page: u64) -> bool {
        self.smc_dirty_pages.contains(&phys_page)
    }

    /// Clears a page's dirty mark once its cached basic blocks have been
    /// invalidated and re-decoded.
    pub fn smc_cleardirty(&mut self, phys_page: u64) {
        self.smc_dirty_pages.remove(&phys_page);
    }

    /// Machine frame number backing a committed store's physical address,
    /// used as the key into `BasicBlockCache::invalidate_page`.
    #[must_use]
    pub fn mfn_of(addr: PhysAddr) -> u64 {
        addr.mfn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_context_is_running_in_long_mode() {
        let ctx = Context::new();
        assert!(ctx.running);
        assert!(ctx.use64);
        assert!(ctx.exception.is_none());
    }

    #[test]
    fn page_fault_stops_running_and_records_cr2() {
        let mut ctx = Context::new();
        ctx.handle_page_fault(VirtAddr::new(0x4000), true);
        assert!(!ctx.running);
        assert_eq!(ctx.cregs.cr2, 0x4000);
        assert!(matches!(ctx.exception.unwrap().fault, CoreFault::PageFaultWrite(_)));
    }

    #[test]
    fn smc_dirty_roundtrip() {
        let mut ctx = Context::new();
        assert!(!ctx.smc_isdirty(3));
        ctx.smc_setdirty(3);
        assert!(ctx.smc_isdirty(3));
        ctx.smc_cleardirty(3);
        assert!(!ctx.smc_isdirty(3));
    }
}
