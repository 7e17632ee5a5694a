//! Pipeline fault definitions.
//!
//! A uop leaving the execute stage either completes normally or produces a
//! `CoreFault`. None of these are thrown across call stacks with `?` and
//! unwound: a fault is data the OoO/in-order commit logic inspects to
//! decide what to do next (redirect fetch, flush and replay from the ROB,
//! hand control to the functional emulator for a real x86 exception).

use super::addr::VirtAddr;

/// Every non-normal outcome a uop (or a pipeline stage acting on its behalf)
/// can produce.
///
/// `CoreFault` is returned, not thrown: callers match on it and decide the
/// appropriate recovery (squash-and-refetch, flush-after, drop to the
/// emulator). `thiserror::Error` is derived purely for the `Display` impl
/// used when a fault reaches the "never silent" diagnostic dump.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CoreFault {
    /// Forward an architectural exception to the functional emulator.
    ///
    /// Raised for faults the timing core does not itself model precisely
    /// (divide overflow, floating-point exceptions, general-protection
    /// faults). The emulator owns the precise architectural behavior; the
    /// core only needs to know to flush and hand off at this uop.
    #[error("propagate to emulator at {0:?}")]
    Propagate(VirtAddr),

    /// A conditional or indirect branch resolved to a different target than
    /// predicted.
    #[error("branch mispredict: predicted {predicted:?}, actual {actual:?}")]
    BranchMispredict {
        /// Target the branch predictor produced at fetch time.
        predicted: VirtAddr,
        /// Target the branch actually resolved to in execute.
        actual: VirtAddr,
    },

    /// A memory access is not naturally aligned and must be split or
    /// replayed as two accesses.
    #[error("unaligned access at {0:?}")]
    UnalignedAccess(VirtAddr),

    /// Page fault on an instruction fetch.
    #[error("page fault (exec) at {0:?}")]
    PageFaultExec(VirtAddr),

    /// Page fault on a load.
    #[error("page fault (read) at {0:?}")]
    PageFaultRead(VirtAddr),

    /// Page fault on a store.
    #[error("page fault (write) at {0:?}")]
    PageFaultWrite(VirtAddr),

    /// A load issued before an older, address-unresolved store in program
    /// order and must replay once the store's address is known.
    #[error("load-store aliasing at {0:?}")]
    LoadStoreAliasing(VirtAddr),

    /// Two stores to overlapping addresses committed out of the order the
    /// store queue assumed and must replay.
    #[error("store-store aliasing at {0:?}")]
    StoreStoreAliasing(VirtAddr),

    /// Checker-mode emulator comparison mismatched architectural state.
    #[error("checker mismatch at {0:?}")]
    CheckFailed(VirtAddr),

    /// The current basic block ends before completion (partial execution
    /// due to a self-modifying-code invalidation or emulation assist) and
    /// fetch should resume at the next block.
    #[error("skip to next block after {0:?}")]
    SkipBlock(VirtAddr),

    /// The load/fill request queue is full; the requesting load must stall
    /// and retry.
    #[error("load fill request queue full")]
    LfrqFull,

    /// An x87/SSE floating-point exception (invalid operand, overflow,
    /// underflow) was raised by the emulator's result.
    #[error("floating-point exception at {0:?}")]
    FloatingPoint(VirtAddr),

    /// The uop requires the floating-point unit but it is not available
    /// (task-switch/FPU-disabled state).
    #[error("floating-point unit not available at {0:?}")]
    FloatingPointNotAvailable(VirtAddr),

    /// Integer division overflowed or divided by zero.
    #[error("divide overflow at {0:?}")]
    DivideOverflow(VirtAddr),
}

impl CoreFault {
    /// Whether this fault requires flushing the ROB from this uop forward
    /// rather than merely replaying the single offending uop.
    #[must_use]
    pub const fn requires_flush(self) -> bool {
        matches!(
            self,
            Self::Propagate(_)
                | Self::BranchMispredict { .. }
                | Self::PageFaultExec(_)
                | Self::PageFaultRead(_)
                | Self::PageFaultWrite(_)
                | Self::CheckFailed(_)
                | Self::SkipBlock(_)
                | Self::FloatingPoint(_)
                | Self::FloatingPointNotAvailable(_)
                | Self::DivideOverflow(_)
        )
    }

    /// Whether this fault is resolved by replaying the uop in place rather
    /// than by redirecting fetch.
    #[must_use]
    pub const fn is_replay(self) -> bool {
        matches!(
            self,
            Self::LoadStoreAliasing(_) | Self::StoreStoreAliasing(_) | Self::LfrqFull
        )
    }
}
