//! MARSSx86 timing core library.
//!
//! This crate implements the cycle-accurate microarchitectural timing model
//! driving an x86/x86-64 simulation, with the following:
//! 1. **Cores:** an out-of-order pipeline (fetch/rename/dispatch/issue/
//!    writeback/commit over a reorder buffer and partitioned physical
//!    register file) and a two-wide in-order Atom-style pipeline.
//! 2. **Memory hierarchy:** per-core MESI private caches, a shared global
//!    directory controller, a fully-associative TLB, and the interconnects
//!    tying them together.
//! 3. **Scheduling:** a single-threaded cooperative discrete-event scheduler
//!    driving every controller and core off one logical clock.
//! 4. **External boundary:** `Decoder`/`Emulator` traits standing in for the
//!    functional emulator (QEMU) this timing core is driven alongside.
//! 5. **Machine:** owns every controller/core, wires interconnects by index,
//!    and exposes `run_cycle`/`run_cycles`.

/// Common types shared across modules (addresses, uop operand/access
/// classification, error kinds).
pub mod common;
/// Simulator configuration (defaults, hierarchical config structures).
pub mod config;
/// Discrete-event scheduler driving the single logical clock.
pub mod event;
/// Messages and point-to-point interconnects between controllers.
pub mod interconnect;
/// MESI cache-line coherence state machine.
pub mod mesi;
/// Per-core private cache controller (set-associative, MESI, PLRU).
pub mod cache;
/// Global directory controller (read/write-miss, update/evict handlers).
pub mod directory;
/// Micro-operations: the pipeline's scheduling unit.
pub mod uop;
/// Decoded basic blocks and the per-CPU block cache (with SMC invalidation).
pub mod bb;
/// Partitioned physical register file and rename tables.
pub mod regfile;
/// Reorder buffer.
pub mod rob;
/// Load/store queue with aliasing detection and store-to-load forwarding.
pub mod lsq;
/// Tag-broadcast-wakeup issue queue.
pub mod issuequeue;
/// Fully-associative TLB.
pub mod tlb;
/// Branch predictor (GShare direction, BTB, RAS).
pub mod bru;
/// Per-VCPU architectural state (the functional emulator's side of things).
pub mod context;
/// `Decoder`/`Emulator` trait boundary and test doubles.
pub mod decoder;
/// Out-of-order core pipeline.
pub mod ooo_core;
/// In-order Atom-style core pipeline.
pub mod inorder_core;
/// The machine: flat controller vector, interconnects, top-level clock.
pub mod machine;
/// Simulation statistics collection, reporting, and binary persistence.
pub mod stats;

/// Root configuration type; use `Config::default()` or deserialize from JSON.
pub use crate::config::Config;
/// Owns every controller and core and drives the simulation clock.
pub use crate::machine::Machine;
/// Simulation statistics, printed or persisted at the end of a run.
pub use crate::stats::SimStats;
