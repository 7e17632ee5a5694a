//! End-to-end scenario tests exercising the timing core the way a single
//! simulated memory access or instruction would actually traverse it:
//! through the public `Machine`/`OooCore`/cache APIs rather than by poking
//! internal state directly.

use marss_core::bb::{BasicBlock, BasicBlockCache, BranchType, RipVirtPhys};
use marss_core::cache::{AccessOutcome, PrivateCacheController};
use marss_core::common::addr::{PhysAddr, VirtAddr};
use marss_core::config::Config;
use marss_core::directory::DirectoryController;
use marss_core::lsq::{ForwardResult, LoadStoreQueue, LsqOp};
use marss_core::machine::{Controller, Machine};
use marss_core::mesi::MesiState;
use marss_core::ooo_core::{OooCore, Recovery};
use marss_core::rob::Rob;
use marss_core::uop::{AlignHalf, FlagMask, OpClass, Opcode, OpSize, Uop};

fn uop(class: OpClass, name: &'static str) -> Uop {
    Uop {
        opcode: Opcode { class, name },
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

fn basic_block(rip: u64, uops: Vec<Uop>) -> BasicBlock {
    BasicBlock {
        id: RipVirtPhys { rip: VirtAddr::new(rip), mfn_lo: 1, mfn_hi: 1, use64: true, kernel: false, df: false },
        uop_count: uops.len() as u32,
        user_insns: uops.iter().filter(|u| u.eom).count() as u32,
        uops,
        rip_taken: VirtAddr::new(0x2000),
        rip_not_taken: VirtAddr::new(0x2010),
        branch_type: BranchType::CondJump,
        bytes: 16,
        has_mfence: false,
        has_x87: false,
        has_sse: false,
        nondeterministic: false,
        refcount: 0,
        hit_count: 0,
        predict_count: 0,
    }
}

// Scenario 1: single-core L1 hit.
#[test]
fn single_core_l1_hit() {
    let mut cache = PrivateCacheController::new(64, 8, 64, 4, 16, true, 2, 1);

    assert_eq!(cache.probe(0x1000), AccessOutcome::Miss);
    cache.install_line(0x1000, MesiState::Exclusive);
    assert_eq!(cache.probe(0x1000), AccessOutcome::Hit);
    assert_eq!(cache.line_state(0x1000), Some(MesiState::Exclusive));

    let t = cache.local_access(0x1000, false);
    assert!(!t.miss);
    assert_eq!(t.next, MesiState::Exclusive);
    assert_eq!(cache.latency(), 4);
}

// Scenario 2: two cores both read the same line; the second reader's fill
// and the first owner's downgrade both land in the same cycle, and both
// L1 lines should settle at Shared.
#[test]
fn two_core_read_sharing_settles_both_lines_shared() {
    let mut config = Config::default();
    config.system.num_cores = 2;
    let mut machine = Machine::new(&config);
    let l1d0 = machine.cores[0].l1d;
    let l1d1 = machine.cores[1].l1d;

    assert!(machine.request_line(l1d0, 0x4000, false));
    assert!(machine.request_line(l1d1, 0x4000, false));
    // Each fill reply sits behind the link's one-cycle delivery plus the
    // L1's own port-gated install latency before it lands.
    for _ in 0..8 {
        machine.run_cycle();
    }

    let Controller::Cache(cache0) = &machine.controllers[l1d0] else { panic!("expected cache") };
    assert_eq!(cache0.line_state(0x4000), Some(MesiState::Shared));
    let Controller::Cache(cache1) = &machine.controllers[l1d1] else { panic!("expected cache") };
    assert_eq!(cache1.line_state(0x4000), Some(MesiState::Shared));

    let Controller::Directory(dir) = &machine.controllers[machine.directory_index()] else {
        panic!("expected directory")
    };
    let entry = dir.entry(0x4000).unwrap();
    assert_eq!(entry.present.count_ones(), 2);
    assert!(!entry.dirty);
    assert!(entry.invariants_hold());
}

// Scenario 3: continuing from scenario 2's sharing state, a write from the
// second core invalidates the first and ends up the sole Modified owner.
#[test]
fn write_invalidates_sharer_and_becomes_modified_owner() {
    let mut config = Config::default();
    config.system.num_cores = 2;
    let mut machine = Machine::new(&config);
    let l1d0 = machine.cores[0].l1d;
    let l1d1 = machine.cores[1].l1d;

    machine.request_line(l1d0, 0x5000, false);
    machine.request_line(l1d1, 0x5000, false);
    for _ in 0..2 {
        machine.run_cycle();
    }

    assert!(machine.request_line(l1d1, 0x5000, true));
    // The evict reaches core 0 and unlocks the entry well before either
    // fill's own install latency elapses, so core 0's read fill lands after
    // the directory has already dropped it as a sharer and must be
    // dropped as stale; core 1's write fill needs its own full latency on
    // top of that before it resolves to Modified.
    for _ in 0..8 {
        machine.run_cycle();
    }

    let Controller::Cache(cache0) = &machine.controllers[l1d0] else { panic!("expected cache") };
    assert_eq!(cache0.line_state(0x5000), None);
    let Controller::Cache(cache1) = &machine.controllers[l1d1] else { panic!("expected cache") };
    assert_eq!(cache1.line_state(0x5000), Some(MesiState::Modified));

    let Controller::Directory(dir) = &machine.controllers[machine.directory_index()] else {
        panic!("expected directory")
    };
    let entry = dir.entry(0x5000).unwrap();
    assert_eq!(entry.owner, Some(l1d1 as u32));
    assert!(entry.dirty);
    assert!(!entry.locked);
    assert_eq!(entry.present.count_ones(), 1);
    assert!(entry.invariants_hold());
}

// Scenario 4: a conditional branch predicted not-taken resolves taken;
// commit must detect the misprediction, report the correct redirect
// target, and flush the younger speculative work before retiring cleanly.
#[test]
fn branch_misprediction_flushes_younger_work_then_commits() {
    let mut core = OooCore::new(8, 32, 8, 1, 4, 4, 16, 4);

    let mut branch = uop(OpClass::Branch, "jcc");
    branch.riptaken = 0x2000;
    branch.ripseq = 0x2010;
    let block = basic_block(0x1000, vec![branch, uop(OpClass::AddSub, "add"), uop(OpClass::AddSub, "add")]);

    let (fetched, redirect) = core.fetch(&block, VirtAddr::new(0x1000), 0);
    assert_eq!(fetched, 3);
    assert!(redirect.is_none(), "default predictor starts not-taken");

    let tags = core.rename_and_dispatch(|_| 0);
    assert_eq!(tags.len(), 3);

    for (i, &tag) in tags.iter().enumerate() {
        let issued = core.issue_one(0).unwrap();
        assert_eq!(issued, tag);
        core.complete(issued, 0, u64::from(i as u32), 0);
    }
    core.resolve_branch(tags[0], true);

    let (committed, recovery) = core.commit();
    assert_eq!(committed, 0);
    match recovery {
        Some(Recovery::BranchMispredict { tag, correct_rip }) => {
            assert_eq!(tag, tags[0]);
            assert_eq!(correct_rip, VirtAddr::new(0x2000));
        }
        other => panic!("expected BranchMispredict, got {other:?}"),
    }

    core.recover_branch_mispredict(tags[0]);
    assert_eq!(core.rob.len(), 1);

    let (committed, recovery) = core.commit();
    assert_eq!(committed, 1);
    assert!(recovery.is_none());
    assert!(core.rob.is_empty());
}

// Scenario 5: a load whose address crosses a natural alignment boundary is
// retranslated into independent Lo/Hi halves; each resolves its own
// store-to-load forwarding query against the LSQ.
#[test]
fn unaligned_load_splits_resolve_independently() {
    let mut rob = Rob::new(8);
    let store_tag = rob.allocate(uop(OpClass::Store, "st"), 0).unwrap();
    let lo_tag = rob.allocate(uop(OpClass::Load, "ld.lo"), 0).unwrap();
    let hi_tag = rob.allocate(uop(OpClass::Load, "ld.hi"), 0).unwrap();

    let mut lsq = LoadStoreQueue::new(8);
    let si = lsq.allocate(store_tag, LsqOp::Store, 8).unwrap();
    lsq.set_address(si, PhysAddr::new(0x1000));
    lsq.set_data(si, 0x1122_3344_5566_7788);

    let lo = lsq.allocate(lo_tag, LsqOp::Load, 2).unwrap();
    let hi = lsq.allocate(hi_tag, LsqOp::Load, 2).unwrap();
    let _ = (lo, hi);

    // Lo half (0x1006..0x1008) is fully covered by the 8-byte store.
    assert_eq!(lsq.forward(lo, PhysAddr::new(0x1006), 2), ForwardResult::Hit(0x1122));
    // Hi half (0x1008..0x100a) falls outside it and must miss to the cache.
    assert_eq!(lsq.forward(hi, PhysAddr::new(0x1008), 2), ForwardResult::Miss);
}

// Scenario 6: self-modifying code invalidates a cached basic block the
// moment a committed store touches the page it was translated from.
#[test]
fn self_modifying_store_drops_cached_block() {
    let mut cache = BasicBlockCache::new();
    let block = basic_block(0x3000, vec![uop(OpClass::AddSub, "add")]);
    let id = block.id;
    assert!(block.page_invariant_holds());
    cache.insert(block);
    assert!(cache.get(&id).is_some());

    cache.invalidate_page(1);
    assert!(cache.get(&id).is_none());
    assert!(cache.is_empty());
}

// Universal invariant: installing a response for a line already resident
// (a second message racing an existing copy) must update that line's
// existing way in place rather than duplicate its tag into another way.
#[test]
fn install_line_on_resident_tag_does_not_duplicate_it() {
    let mut cache = PrivateCacheController::new(1, 4, 64, 4, 4, true, 2, 1);
    cache.install_line(0x1000, MesiState::Shared);
    cache.install_line(0x1000, MesiState::Modified);
    assert_eq!(cache.line_state(0x1000), Some(MesiState::Modified));

    // Three more distinct lines must still fit in the remaining three ways
    // of this one-set, four-way cache. If the resident tag had been
    // duplicated into a second way, one of these installs would have
    // silently evicted a line that was never touched.
    cache.install_line(0x1100, MesiState::Exclusive);
    cache.install_line(0x1200, MesiState::Exclusive);
    cache.install_line(0x1300, MesiState::Exclusive);
    assert_eq!(cache.line_state(0x1000), Some(MesiState::Modified));
    assert_eq!(cache.line_state(0x1100), Some(MesiState::Exclusive));
    assert_eq!(cache.line_state(0x1200), Some(MesiState::Exclusive));
    assert_eq!(cache.line_state(0x1300), Some(MesiState::Exclusive));
}

// Universal invariant: the directory's quiesce predicate only holds once
// every entry has fully drained back to the all-invalid state, across more
// than the single line the per-handler unit tests exercise.
#[test]
fn directory_quiesces_after_every_line_drains() {
    let mut dir = DirectoryController::new(16, 4);
    dir.handle_read_miss(0, 0x1000);
    dir.handle_read_miss(1, 0x2000);
    assert!(!dir.is_quiesced());

    dir.handle_update_or_evict(0, 0x1000);
    dir.handle_update_or_evict(1, 0x2000);
    assert!(dir.is_quiesced());
}
