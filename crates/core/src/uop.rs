//! Micro-operations: the unit the pipeline actually schedules.
//!
//! A `Uop` is the fixed-width instruction the OoO and in-order cores
//! execute. The x86 decoder (external, see [`crate::decoder`]) is
//! responsible for producing these; this module only defines their shape.

/// Operand size encoding, matching a 2-bit `size` field on the uop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpSize {
    /// 1 byte.
    Byte,
    /// 2 bytes.
    Half,
    /// 4 bytes.
    Word,
    /// 8 bytes.
    Quad,
}

impl OpSize {
    /// Access width in bytes, used to size an LSQ entry and its overlap
    /// tests.
    #[must_use]
    pub const fn bytes(self) -> u8 {
        match self {
            Self::Byte => 1,
            Self::Half => 2,
            Self::Word => 4,
            Self::Quad => 8,
        }
    }
}

/// Coarse grouping of opcodes, used for cluster assignment
/// (`uop_executable_on_cluster`) and instruction-mix statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// Bitwise logic (and/or/xor/not).
    Logic,
    /// Integer add/subtract.
    AddSub,
    /// Shifts and rotates.
    Shift,
    /// Conditional or unconditional control transfer.
    Branch,
    /// Memory load.
    Load,
    /// Memory store.
    Store,
    /// Scalar floating-point arithmetic.
    FpAlu,
    /// Floating-point format conversion.
    FpCvt,
    /// SSE/vector operation.
    Vec,
    /// Emulation assist (complex/microcoded x86 semantics deferred to the
    /// functional emulator).
    Assist,
    /// Architectural invariant check (used by checker-mode uops).
    Check,
    /// Anything not covered above (nop, fence, uop-internal bookkeeping).
    Special,
}

/// The operation an opcode performs, reduced to what the timing model must
/// distinguish: its `OpClass` (for cluster/FU assignment) and whether it
/// reads/writes memory (for LSQ participation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Opcode {
    /// Coarse classification used for scheduling and stats.
    pub class: OpClass,
    /// Mnemonic, kept for tracing/diagnostics only.
    pub name: &'static str,
}

impl Opcode {
    /// Whether this opcode issues a memory read.
    #[must_use]
    pub const fn is_load(self) -> bool {
        matches!(self.class, OpClass::Load)
    }

    /// Whether this opcode issues a memory write.
    #[must_use]
    pub const fn is_store(self) -> bool {
        matches!(self.class, OpClass::Store)
    }

    /// Whether this opcode is a control-transfer instruction.
    #[must_use]
    pub const fn is_branch(self) -> bool {
        matches!(self.class, OpClass::Branch)
    }
}

/// Which half of an unaligned access this uop performs, encoded in the
/// condition field for load/store uops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AlignHalf {
    /// A naturally aligned access.
    #[default]
    Normal,
    /// The low half of a split unaligned access.
    Lo,
    /// The high half of a split unaligned access.
    Hi,
}

/// Condition flags a branch or predicated uop tests, using the {Z, C, O}
/// subset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlagMask {
    /// Zero flag.
    pub z: bool,
    /// Carry flag.
    pub c: bool,
    /// Overflow flag.
    pub o: bool,
}

/// A single micro-operation.
#[derive(Clone, Debug)]
pub struct Uop {
    /// The operation this uop performs.
    pub opcode: Opcode,
    /// Operand width.
    pub size: OpSize,
    /// First source register (architectural or renaming-temp index).
    pub ra: u16,
    /// Second source register.
    pub rb: u16,
    /// Third source register (used by FMA-class and some assist uops).
    pub rc: u16,
    /// Destination register.
    pub rd: u16,
    /// Alignment half for loads/stores.
    pub align: AlignHalf,
    /// Flags this uop sets on completion.
    pub setflags: FlagMask,
    /// Internal (not directly corresponding to one x86 instruction) uop,
    /// synthesized by the decoder to implement complex semantics.
    pub internal: bool,
    /// Part of a locked (atomic) read-modify-write x86 instruction.
    pub locked: bool,
    /// Cache level this uop's memory access should target (0 = L1).
    pub cachelevel: u8,
    /// Suppress flag writes even if `setflags` is non-empty (used for the
    /// first half of a split unaligned access).
    pub nouserflags: bool,
    /// Start-of-x86-instruction marker; pairs with a later `eom` uop to
    /// bound one AtomOp/commit-atomicity group.
    pub som: bool,
    /// End-of-x86-instruction marker.
    pub eom: bool,
    /// Set when this uop's address crosses a natural alignment boundary
    /// and must be retranslated into `lo`/`hi` halves.
    pub unaligned: bool,
    /// Sign-extended sixteen-bit-class immediate.
    pub rbimm: i64,
    /// Sign-extended immediate used by three-operand forms.
    pub rcimm: i64,
    /// Target if a branch is taken.
    pub riptaken: u64,
    /// Target (fallthrough) if a branch is not taken.
    pub ripseq: u64,
}

impl Uop {
    /// Whether this uop participates in the load/store queue.
    #[must_use]
    pub const fn is_memory_op(&self) -> bool {
        self.opcode.is_load() || self.opcode.is_store()
    }
}
