//! The machine: owns every controller, interconnect, and core, and drives
//! the single cooperative clock.
//!
//! Controllers are indices into one flat `Vec<Controller>` owned by this
//! `Machine`, and interconnects address each other by index, never by
//! pointer, replacing an earlier cyclic controller/interconnect pointer
//! graph. `Controller` is a tagged enum matched on, not a trait object.

use std::collections::HashMap;

use crate::bb::{BasicBlock, BasicBlockCache, RipVirtPhys};
use crate::cache::PrivateCacheController;
use crate::common::addr::VirtAddr;
use crate::common::error::CoreFault;
use crate::config::{CacheHierarchyConfig, Config, CoreKind};
use crate::context::{Context, PendingException};
use crate::decoder::{Decoder, Emulator, TableDecoder, TestEmulator};
use crate::directory::DirectoryController;
use crate::event::EventQueue;
use crate::inorder_core::InOrderCore;
use crate::interconnect::{Interconnect, InterconnectKind, Message, MessageOp};
use crate::lsq::ForwardResult;
use crate::ooo_core::{IssueStatus, OooCore, Recovery};
use crate::rob::RobTag;
use crate::stats::SimStats;
use crate::tlb::Tlb;

/// Index into `Machine::controllers`.
pub type ControllerId = usize;

/// Final backing store below the directory: fixed latency, always hits.
/// "Lower memory" is otherwise an unmodeled source of data; this is that
/// source, made concrete enough to drive the event queue.
pub struct MemoryController {
    latency: u64,
}

impl MemoryController {
    #[must_use]
    fn new(latency: u64) -> Self {
        Self { latency }
    }
}

/// One entry in the flat controller table, matched on rather than called
/// through a vtable.
pub enum Controller {
    Cache(PrivateCacheController),
    Directory(DirectoryController),
    Memory(MemoryController),
}

impl Controller {
    fn as_cache_mut(&mut self) -> Option<&mut PrivateCacheController> {
        match self {
            Controller::Cache(c) => Some(c),
            _ => None,
        }
    }

    fn as_directory_mut(&mut self) -> Option<&mut DirectoryController> {
        match self {
            Controller::Directory(d) => Some(d),
            _ => None,
        }
    }
}

/// Which execution model backs one socket.
pub enum CoreUnit {
    OutOfOrder(OooCore),
    InOrder(InOrderCore),
}

/// One socket's controller wiring and frontend state: indices into
/// `Machine::controllers` for its private L1-I, L1-D, and L2 (the shared
/// L3 and the directory are machine-wide, not per-core), plus everything
/// `Machine::drive_cores` needs to actually fetch and translate for this
/// socket every cycle.
pub struct CoreSlot {
    pub core: CoreUnit,
    pub l1i: ControllerId,
    pub l1d: ControllerId,
    pub l2: ControllerId,
    pub itlb: Tlb,
    pub bb_cache: BasicBlockCache,
    pub context: Context,
    pub decoder: TableDecoder,
    pub emulator: TestEmulator,
    fetch_rip: Option<VirtAddr>,
    fetch_block: Option<BasicBlock>,
    fetch_uop_index: usize,
}

/// What a scheduled entry on the machine's event heap means once due.
#[derive(Clone, Debug)]
enum SchedKind {
    /// Deliver `msg` straight to its destination controller.
    Deliver(Message),
    /// Re-attempt routing `msg` from `sender` after its link had no free
    /// slot; `Interconnect::retry_delay` already elapsed.
    Retry { sender: ControllerId, msg: Message },
    /// A cache's fill latency has elapsed; install the line it requested.
    Install(Message),
}

/// A scheduled action, tagged with the cycle it should run.
#[derive(Clone, Debug)]
struct RoutedMessage {
    kind: SchedKind,
}

/// Owns the entire timing core for one simulation run.
pub struct Machine {
    pub controllers: Vec<Controller>,
    pub cores: Vec<CoreSlot>,
    directory: ControllerId,
    memory: ControllerId,
    links: HashMap<(ControllerId, ControllerId), Interconnect>,
    event: EventQueue<RoutedMessage>,
    /// Directory pending-buffer slots in flight for each `(requester,
    /// line_addr)` pair, FIFO: a requester may have more than one request
    /// for the same line outstanding (e.g. a read miss followed by a write
    /// miss before the read's fill lands), so this holds every slot still
    /// owed a matching fill, oldest first.
    pending_slots: HashMap<(ControllerId, u64), Vec<usize>>,
    /// Cores blocked on an L1 fill for `(cache, line_addr)`, woken once
    /// `finish_cache_install` installs that line.
    mem_waiters: HashMap<(ControllerId, u64), Vec<(usize, RobTag)>>,
    /// Cache line size, copied from the L1-D config at construction since
    /// `PrivateCacheController` exposes no public accessor for it.
    line_bytes: u64,
    pub stats: SimStats,
}

fn build_level(cfg: &crate::config::CacheLevelConfig, lowest_private: bool) -> PrivateCacheController {
    PrivateCacheController::new(
        cfg.sets,
        cfg.ways,
        cfg.line_bytes,
        cfg.latency,
        cfg.queue_depth,
        lowest_private,
        cfg.read_ports,
        cfg.write_ports,
    )
}

impl Machine {
    /// Assembles a machine from `config`: one core per `config.system.num_cores`
    /// of the configured kind, each with its own L1-I/L1-D/L2, a shared L3,
    /// one directory, and one backing memory, linked by interconnects whose
    /// delay comes from each cache level's configured latency.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let hierarchy: &CacheHierarchyConfig = &config.cache;
        let mut controllers = Vec::new();

        let l3_idx = controllers.len();
        controllers.push(Controller::Cache(build_level(&hierarchy.l3, false)));
        let directory_idx = controllers.len();
        controllers.push(Controller::Directory(DirectoryController::new(
            config.directory.queue_depth,
            config.directory.dummy_pool,
        )));
        let memory_idx = controllers.len();
        controllers.push(Controller::Memory(MemoryController::new(hierarchy.l3.latency * 4)));

        let mut links = HashMap::new();
        links.insert(
            (l3_idx, directory_idx),
            Interconnect::new(InterconnectKind::Directory, 2, hierarchy.l3.queue_depth),
        );
        links.insert(
            (directory_idx, memory_idx),
            Interconnect::new(InterconnectKind::Lower, hierarchy.l3.latency, config.directory.queue_depth),
        );

        let mut cores = Vec::new();
        for _ in 0..config.system.num_cores {
            let l1i_idx = controllers.len();
            controllers.push(Controller::Cache(build_level(&hierarchy.l1i, false)));
            let l1d_idx = controllers.len();
            controllers.push(Controller::Cache(build_level(&hierarchy.l1d, false)));
            let l2_idx = controllers.len();
            controllers.push(Controller::Cache(build_level(&hierarchy.l2, true)));

            links.insert(
                (l1i_idx, l2_idx),
                Interconnect::new(InterconnectKind::Instruction, hierarchy.l1i.latency, hierarchy.l1i.queue_depth),
            );
            links.insert(
                (l1d_idx, l2_idx),
                Interconnect::new(InterconnectKind::Data, hierarchy.l1d.latency, hierarchy.l1d.queue_depth),
            );
            links.insert(
                (l2_idx, l3_idx),
                Interconnect::new(InterconnectKind::Lower, hierarchy.l2.latency, hierarchy.l2.queue_depth),
            );

            let core = match config.system.core_kind {
                CoreKind::OutOfOrder => CoreUnit::OutOfOrder(OooCore::new(
                    config.ooo.rob_size,
                    config.ooo.phys_regs_per_file,
                    config.ooo.issueq_size,
                    2,
                    config.ooo.commit_width,
                    config.ooo.fetch_width,
                    config.ooo.btb_entries,
                    config.ooo.ras_entries,
                    config.ooo.lsq_size,
                    config.ooo.dtlb_entries,
                )),
                CoreKind::InOrder => CoreUnit::InOrder(InOrderCore::new(
                    2,
                    config.inorder.store_buffer_size,
                    config.inorder.max_unresolved_branches,
                )),
            };
            cores.push(CoreSlot {
                core,
                l1i: l1i_idx,
                l1d: l1d_idx,
                l2: l2_idx,
                itlb: Tlb::new(config.ooo.itlb_entries),
                bb_cache: BasicBlockCache::new(),
                context: Context::new(),
                decoder: TableDecoder::new(),
                emulator: TestEmulator::new(),
                fetch_rip: None,
                fetch_block: None,
                fetch_uop_index: 0,
            });
        }

        Self {
            controllers,
            cores,
            directory: directory_idx,
            memory: memory_idx,
            links,
            event: EventQueue::new(),
            pending_slots: HashMap::new(),
            mem_waiters: HashMap::new(),
            line_bytes: hierarchy.l1d.line_bytes,
            stats: SimStats::new(),
        }
    }

    /// Starts fetch for `core` at `rip`: idle cores (the default) never
    /// call into the decoder, so a never-started core never risks hitting
    /// `TableDecoder::translate`'s panic on an unregistered block.
    pub fn start_core(&mut self, core: usize, rip: VirtAddr) {
        let slot = &mut self.cores[core];
        slot.fetch_rip = Some(rip);
        slot.fetch_block = None;
        slot.fetch_uop_index = 0;
        slot.context.rip = rip;
    }

    /// Mutable access to a core's decoder, so a caller can register basic
    /// blocks with `TableDecoder::insert` before calling `start_core`.
    pub fn core_decoder_mut(&mut self, core: usize) -> &mut TableDecoder {
        &mut self.cores[core].decoder
    }

    /// Current logical clock value.
    #[must_use]
    pub fn sim_cycle(&self) -> u64 {
        self.event.sim_cycle()
    }

    /// Issues a demand access from `requester` (a `Cache` controller index)
    /// toward the directory for `line_addr`. Chains onto an in-flight
    /// request for the same line if one already exists; on backpressure
    /// (directory full), returns `false` and the caller must retry.
    pub fn request_line(&mut self, requester: ControllerId, line_addr: u64, is_write: bool) -> bool {
        let Controller::Directory(dir) = &mut self.controllers[self.directory] else {
            unreachable!("directory index must name a Directory controller")
        };
        if dir.is_full() {
            return false;
        }
        let op = if is_write { MessageOp::Write } else { MessageOp::Read };
        let Some(slot) = dir.alloc_pending(requester as u32, line_addr, op) else {
            return false;
        };
        self.pending_slots.entry((requester, line_addr)).or_default().push(slot);

        if is_write {
            self.stats.dir_write_misses += 1;
        } else {
            self.stats.dir_read_misses += 1;
        }

        let Controller::Directory(dir) = &mut self.controllers[self.directory] else {
            unreachable!("directory index must name a Directory controller")
        };
        let msgs = if is_write {
            let (outcome, msgs) = dir.handle_write_miss(requester as u32, line_addr);
            if outcome == crate::directory::MissOutcome::Stalled {
                self.stats.dir_lock_stalls += 1;
            }
            msgs
        } else {
            dir.handle_read_miss(requester as u32, line_addr)
        };

        for msg in msgs {
            self.route(self.directory, msg);
        }
        true
    }

    /// Acknowledges an EVICT/UPDATE response reaching the directory from
    /// `originator`, driving `DirectoryController::handle_update_or_evict`
    /// and routing whatever follow-up message it produces.
    pub fn ack_update_or_evict(&mut self, originator: ControllerId, line_addr: u64) {
        let Controller::Directory(dir) = &mut self.controllers[self.directory] else {
            unreachable!("directory index must name a Directory controller")
        };
        if let Some(msg) = dir.handle_update_or_evict(originator as u32, line_addr) {
            self.route(self.directory, msg);
        }
    }

    /// Hands `msg` to the interconnect between `sender` and its destination.
    /// A full link schedules a `Retry` after `retry_delay()` instead of
    /// dropping the message; an untracked sender/dest pair (the directory's
    /// own replies, which have no registered link) falls back to a
    /// straight one-cycle `Deliver` as before.
    fn route(&mut self, sender: ControllerId, msg: Message) {
        let dest = msg.dest;
        let Some(link) = self.links.get_mut(&(sender, dest)) else {
            self.event.add_event(1, RoutedMessage { kind: SchedKind::Deliver(msg) });
            return;
        };
        if link.emit(msg.clone()) {
            return;
        }
        let retry_delay = link.retry_delay().max(1);
        self.event.add_event(retry_delay, RoutedMessage { kind: SchedKind::Retry { sender, msg } });
    }

    /// Drains every link's queued messages this cycle, scheduling each for
    /// delivery after its link's propagation delay.
    fn drain_links(&mut self) {
        let mut to_schedule = Vec::new();
        for link in self.links.values_mut() {
            let delay = link.delay().max(1);
            for msg in link.drain() {
                to_schedule.push((delay, msg));
            }
        }
        for (delay, msg) in to_schedule {
            self.event.add_event(delay, RoutedMessage { kind: SchedKind::Deliver(msg) });
        }
    }

    /// Advances the clock by one cycle: runs every scheduled action due
    /// this cycle (message delivery, link retries, cache fill installs),
    /// drains links onto the event heap, then drives every core's
    /// pipeline stages. Delivery within one cycle sees no re-entrancy:
    /// every controller mutation this cycle is based only on state
    /// visible at the start of the cycle.
    pub fn run_cycle(&mut self) {
        let due = self.event.run_cycle();
        self.stats.cycles += 1;

        for routed in due {
            match routed.kind {
                SchedKind::Deliver(msg) => self.deliver(msg),
                SchedKind::Retry { sender, msg } => self.route(sender, msg),
                SchedKind::Install(msg) => self.finish_cache_install(msg),
            }
        }
        self.drain_links();
        self.drive_cores();
    }

    fn deliver(&mut self, msg: Message) {
        match &mut self.controllers[msg.dest] {
            Controller::Cache(cache) => {
                if msg.op == MessageOp::Evict || msg.op == MessageOp::Update {
                    if let Some(t) = cache.snoop(msg.line_addr, true) {
                        if t.writeback {
                            self.stats.mesi_writebacks += 1;
                        }
                        self.stats.mesi_snoop_invalidates += 1;
                    }
                    self.ack_update_or_evict(msg.dest, msg.line_addr);
                } else if msg.op == MessageOp::Downgrade {
                    cache.snoop(msg.line_addr, false);
                } else {
                    let is_write = msg.op == MessageOp::Write;
                    let _ = cache.get_port(self.event.sim_cycle(), is_write);
                    let latency = cache.latency().max(1);
                    self.event.add_event(latency, RoutedMessage { kind: SchedKind::Install(msg) });
                }
            }
            Controller::Directory(_) => {
                self.ack_update_or_evict(msg.sender, msg.line_addr);
            }
            Controller::Memory(_) => {
                let response = Message {
                    sender: msg.dest,
                    dest: msg.sender,
                    line_addr: msg.line_addr,
                    op: msg.op,
                    is_shared: msg.op == MessageOp::Read,
                    has_data: true,
                    arg: msg.arg,
                };
                self.route(msg.dest, response);
            }
        }
    }

    /// Completes a cache fill once its port reservation's latency has
    /// elapsed: installs the line, frees the directory's pending slot for
    /// it, and wakes any core whose load/store was waiting on this fill.
    ///
    /// A fill that arrives after the directory has already evicted this
    /// requester (a write elsewhere raced ahead of this fill's latency) is
    /// stale and installs nothing; the slot still frees and waiters still
    /// wake; everything else is only late, not wrong.
    fn finish_cache_install(&mut self, msg: Message) {
        let still_owed = {
            let Controller::Directory(dir) = &self.controllers[self.directory] else {
                unreachable!("directory index must name a Directory controller")
            };
            dir.entry(msg.line_addr).map_or(true, |e| (e.present >> (msg.dest as u32)) & 1 != 0)
        };

        if still_owed {
            let state = if msg.op == MessageOp::Write {
                crate::mesi::MesiState::Modified
            } else if msg.is_shared {
                crate::mesi::MesiState::Shared
            } else {
                crate::mesi::MesiState::Exclusive
            };
            let Controller::Cache(cache) = &mut self.controllers[msg.dest] else { return };
            cache.install_line(msg.line_addr, state);
        }

        if let Some(slots) = self.pending_slots.get_mut(&(msg.dest, msg.line_addr)) {
            if let Some(slot) = (!slots.is_empty()).then(|| slots.remove(0)) {
                if slots.is_empty() {
                    self.pending_slots.remove(&(msg.dest, msg.line_addr));
                }
                let Controller::Directory(dir) = &mut self.controllers[self.directory] else {
                    unreachable!("directory index must name a Directory controller")
                };
                dir.free_pending(slot);
            }
        }

        let Some(waiters) = self.mem_waiters.remove(&(msg.dest, msg.line_addr)) else { return };
        let sim_cycle = self.event.sim_cycle();
        for (core_idx, tag) in waiters {
            let CoreUnit::OutOfOrder(core) = &mut self.cores[core_idx].core else { continue };
            core.complete(tag, sim_cycle, 0, 0);
        }
    }

    /// Runs `cycles` cycles without inspecting per-cycle output, the loop
    /// shape the CLI's `--stopcycle` stop condition drives.
    pub fn run_cycles(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.run_cycle();
        }
    }

    /// Total controllers of each kind, for diagnostics/tests.
    #[must_use]
    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    /// Index of the machine-wide directory controller.
    #[must_use]
    pub fn directory_index(&self) -> ControllerId {
        self.directory
    }

    /// Index of the machine-wide memory controller.
    #[must_use]
    pub fn memory_index(&self) -> ControllerId {
        self.memory
    }

    /// Drives every core's pipeline stages for this cycle: the step
    /// `run_cycle` was previously missing entirely, leaving every
    /// `CoreSlot::core` inert for the life of a run.
    fn drive_cores(&mut self) {
        for idx in 0..self.cores.len() {
            match &self.cores[idx].core {
                CoreUnit::OutOfOrder(_) => self.drive_ooo_core(idx),
                CoreUnit::InOrder(_) => self.drive_inorder_core(idx),
            }
        }
    }

    /// One cycle of the out-of-order pipeline, in commit-before-fetch
    /// order so a recovery selected this cycle redirects fetch before
    /// fetch runs again.
    fn drive_ooo_core(&mut self, core_idx: usize) {
        self.commit_ooo(core_idx);
        self.issue_ooo(core_idx);
        self.dispatch_ooo(core_idx);
        self.fetch_ooo(core_idx);
    }

    /// The in-order core has no frontend of its own in this crate (it
    /// consumes externally-dispatched `AtomOp`s); still exercise its
    /// per-cycle issue/commit surface so a configured in-order socket is
    /// not permanently idle.
    fn drive_inorder_core(&mut self, core_idx: usize) {
        let CoreUnit::InOrder(core) = &mut self.cores[core_idx].core else { return };
        let _ = core.issue_cycle(|_| true);
        let _ = core.commit_one(|_| {});
    }

    fn fetch_ooo(&mut self, core_idx: usize) {
        let slot = &mut self.cores[core_idx];
        let Some(rip) = slot.fetch_rip else { return };

        let id = RipVirtPhys {
            rip,
            mfn_lo: rip.page(),
            mfn_hi: rip.page(),
            use64: slot.context.use64,
            kernel: slot.context.kernel_mode,
            df: false,
        };

        if slot.fetch_block.as_ref().map(|b| b.id) != Some(id) {
            let cached = slot.bb_cache.get(&id).cloned();
            let block = match cached {
                Some(b) => {
                    self.stats.icache_hits += 1;
                    b
                }
                None => {
                    self.stats.icache_misses += 1;
                    let b = slot.decoder.translate(id);
                    slot.bb_cache.insert(b.clone());
                    b
                }
            };
            slot.fetch_block = Some(block);
            slot.fetch_uop_index = 0;
        }

        let Some(block) = slot.fetch_block.clone() else { return };
        let uop_index = slot.fetch_uop_index;

        let CoreUnit::OutOfOrder(core) = &mut slot.core else { return };
        let (fetched, redirect) = core.fetch(&block, rip, uop_index);
        slot.fetch_uop_index += fetched;

        if let Some(target) = redirect {
            slot.fetch_rip = Some(target);
            slot.fetch_block = None;
            slot.fetch_uop_index = 0;
            slot.context.rip = target;
        } else if slot.fetch_uop_index >= block.uops.len() {
            let next = block.rip_not_taken;
            slot.fetch_rip = Some(next);
            slot.fetch_block = None;
            slot.fetch_uop_index = 0;
            slot.context.rip = next;
        }
    }

    fn dispatch_ooo(&mut self, core_idx: usize) {
        let CoreUnit::OutOfOrder(core) = &mut self.cores[core_idx].core else { return };
        let _ = core.rename_and_dispatch(cluster_of);
    }

    fn issue_ooo(&mut self, core_idx: usize) {
        for cluster in 0..2usize {
            let tag = {
                let CoreUnit::OutOfOrder(core) = &mut self.cores[core_idx].core else { return };
                core.issue_one(cluster)
            };
            let Some(tag) = tag else { continue };
            let _ = self.execute_ooo_uop(core_idx, tag);
        }
    }

    /// Dispatches an issued uop to its functional path, constructing the
    /// `IssueStatus` its outcome actually represents.
    fn execute_ooo_uop(&mut self, core_idx: usize, tag: RobTag) -> IssueStatus {
        let is_memory = {
            let CoreUnit::OutOfOrder(core) = &mut self.cores[core_idx].core else {
                return IssueStatus::Skipped;
            };
            core.rob.find_entry(tag).is_some_and(|e| e.uop.is_memory_op())
        };
        if is_memory {
            return self.execute_ooo_memory(core_idx, tag);
        }
        let sim_cycle = self.event.sim_cycle();
        let CoreUnit::OutOfOrder(core) = &mut self.cores[core_idx].core else {
            return IssueStatus::Skipped;
        };
        core.complete(tag, sim_cycle, 0, 0);
        IssueStatus::Completed
    }

    /// Address generation through commit/writeback for a load or store:
    /// DTLB probe (inserting on a walk-emulator hit, faulting on a real
    /// miss), store-to-load forwarding through the LSQ, and on an LSQ
    /// miss a real L1-D probe gated by port availability and the cache's
    /// own pending-request queue.
    fn execute_ooo_memory(&mut self, core_idx: usize, tag: RobTag) -> IssueStatus {
        let slot = &mut self.cores[core_idx];
        let CoreUnit::OutOfOrder(core) = &mut slot.core else { return IssueStatus::Skipped };
        let Some(vaddr) = core.effective_vaddr(tag) else { return IssueStatus::Skipped };
        let Some(entry) = core.rob.find_entry(tag) else { return IssueStatus::Skipped };
        let is_store = entry.uop.opcode.is_store();
        let size = entry.uop.size.bytes();
        let lsq_index = entry.lsq_index;

        let paddr = if let Some(p) = core.dtlb.probe(vaddr, 0) {
            p
        } else if let Some(p) = slot.emulator.translate_addr(vaddr) {
            core.dtlb.insert(vaddr, 0, p);
            p
        } else {
            let fault = if is_store { CoreFault::PageFaultWrite(vaddr) } else { CoreFault::PageFaultRead(vaddr) };
            core.fault(tag, fault);
            return IssueStatus::Misspeculated;
        };

        if let Some(idx) = lsq_index {
            core.lsq.set_address(idx, paddr);
        }

        if is_store {
            if let Some(idx) = lsq_index {
                core.lsq.set_data(idx, 0);
            }
            let sim_cycle = self.event.sim_cycle();
            core.complete(tag, sim_cycle, 0, 0);
            self.stats.inst_store += 1;
            return IssueStatus::Completed;
        }
        self.stats.inst_load += 1;

        if let Some(idx) = lsq_index {
            match core.lsq.forward(idx, paddr, size) {
                ForwardResult::Hit(value) => {
                    core.lsq.set_data(idx, value);
                    let sim_cycle = self.event.sim_cycle();
                    core.complete(tag, sim_cycle, value, 0);
                    return IssueStatus::Completed;
                }
                ForwardResult::Stall => {
                    return if core.note_forward_stall(tag) {
                        core.fault(tag, CoreFault::LoadStoreAliasing(vaddr));
                        IssueStatus::Misspeculated
                    } else {
                        self.stats.stalls_mem += 1;
                        IssueStatus::NeedsReplay
                    };
                }
                ForwardResult::Miss => {}
            }
        }

        let l1d = slot.l1d;
        let line_addr = paddr.val() & !(self.line_bytes - 1);
        let sim_cycle = self.event.sim_cycle();

        let outcome = {
            let Controller::Cache(cache) = &mut self.controllers[l1d] else { return IssueStatus::Skipped };
            cache.probe(line_addr)
        };

        match outcome {
            crate::cache::AccessOutcome::Hit => {
                self.stats.dcache_hits += 1;
                {
                    let Controller::Cache(cache) = &mut self.controllers[l1d] else {
                        return IssueStatus::Skipped;
                    };
                    let _ = cache.get_port(sim_cycle, false);
                    let _ = cache.local_access(line_addr, false);
                }
                let CoreUnit::OutOfOrder(core) = &mut self.cores[core_idx].core else {
                    return IssueStatus::Skipped;
                };
                core.complete(tag, sim_cycle, 0, 0);
                IssueStatus::Completed
            }
            crate::cache::AccessOutcome::Miss => {
                self.stats.dcache_misses += 1;
                let (already_pending, alloc) = {
                    let Controller::Cache(cache) = &mut self.controllers[l1d] else {
                        return IssueStatus::Skipped;
                    };
                    let already_pending = cache.find_dependency(line_addr).is_some();
                    (already_pending, cache.alloc_pending(core_idx, line_addr, crate::cache::QueueOp::Read))
                };
                match alloc {
                    Some(_) => {
                        // A dependency already chained onto an in-flight request for
                        // this line; a second directory request would double up on
                        // the same fill rather than join it.
                        if already_pending || self.request_line(l1d, line_addr, false) {
                            self.mem_waiters.entry((l1d, line_addr)).or_default().push((core_idx, tag));
                        }
                        IssueStatus::NeedsReplay
                    }
                    None => {
                        self.stats.stalls_mem += 1;
                        IssueStatus::NeedsReplay
                    }
                }
            }
        }
    }

    /// Commit stage: retires completed groups, then applies whatever
    /// recovery commit selected, redirecting fetch to the right address
    /// for each recovery kind.
    fn commit_ooo(&mut self, core_idx: usize) {
        let (committed, recovery) = {
            let CoreUnit::OutOfOrder(core) = &mut self.cores[core_idx].core else { return };
            core.commit()
        };
        if committed > 0 {
            self.stats.instructions_retired += committed as u64;
            self.stats.commits_atomic += 1;
        }
        let Some(recovery) = recovery else { return };

        match recovery {
            Recovery::BranchMispredict { tag, correct_rip } => {
                self.stats.branch_mispredictions += 1;
                self.stats.rob_flushes_mispredict += 1;
                let CoreUnit::OutOfOrder(core) = &mut self.cores[core_idx].core else { return };
                let (pc, taken) = core
                    .rob
                    .find_entry(tag)
                    .map(|e| (e.rip, e.branch_predicted_taken))
                    .unwrap_or((correct_rip, false));
                core.recover_branch_mispredict(tag);
                core.update_predictor(crate::bru::BranchOutcome { pc, taken, target: Some(correct_rip.val()) });
                self.redirect_fetch(core_idx, correct_rip);
            }
            Recovery::AliasingReplay { tag } => {
                self.stats.rob_flushes_aliasing += 1;
                let CoreUnit::OutOfOrder(core) = &mut self.cores[core_idx].core else { return };
                let rip = core.rob.find_entry(tag).map(|e| e.rip);
                core.recover_flush_from(tag);
                let Some(rip) = rip else { return };
                self.redirect_fetch(core_idx, rip);
            }
            Recovery::Exception { tag, fault } => {
                let CoreUnit::OutOfOrder(core) = &mut self.cores[core_idx].core else { return };
                let rip = core.rob.find_entry(tag).map(|e| e.rip).unwrap_or(VirtAddr::new(0));
                core.recover_flush_from(tag);

                let slot = &mut self.cores[core_idx];
                slot.context.exception = Some(PendingException { fault, error_code: 0, cr2: rip.val() });
                slot.context.running = false;
                slot.emulator.step_one_x86_insn(&mut slot.context);
                slot.context.running = true;
                slot.context.exception = None;
                let next_rip = slot.context.rip;
                self.redirect_fetch(core_idx, next_rip);
            }
            Recovery::DispatchDeadlock => {
                let CoreUnit::OutOfOrder(core) = &mut self.cores[core_idx].core else { return };
                core.recover_full_flush();
                let rip = self.cores[core_idx].context.rip;
                self.redirect_fetch(core_idx, rip);
            }
        }
    }

    /// Redirects a core's fetch stage to `rip`, dropping whatever partial
    /// block it had in flight.
    fn redirect_fetch(&mut self, core_idx: usize, rip: VirtAddr) {
        let slot = &mut self.cores[core_idx];
        slot.fetch_rip = Some(rip);
        slot.fetch_block = None;
        slot.fetch_uop_index = 0;
        slot.context.rip = rip;
    }
}

/// Assigns loads and stores to the memory cluster (1) and everything
/// else to the ALU cluster (0), matching the two-cluster layout
/// `Machine::new` builds every out-of-order core with.
fn cluster_of(uop: &crate::uop::Uop) -> crate::ooo_core::ClusterId {
    if uop.is_memory_op() {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bb::BranchType;
    use crate::uop::{AlignHalf, FlagMask, OpClass, Opcode, OpSize};

    fn alu_uop(rd: u16) -> crate::uop::Uop {
        crate::uop::Uop {
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

    fn straight_line_block(rip: u64, next: u64) -> BasicBlock {
        let id = RipVirtPhys {
            rip: VirtAddr::new(rip),
            mfn_lo: VirtAddr::new(rip).page(),
            mfn_hi: VirtAddr::new(rip).page(),
            use64: true,
            kernel: false,
            df: false,
        };
        BasicBlock {
            id,
            uops: vec![alu_uop(1), alu_uop(2)],
            rip_taken: VirtAddr::new(0),
            rip_not_taken: VirtAddr::new(next),
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
    fn started_core_fetches_dispatches_and_commits_through_run_cycle() {
        let mut config = Config::default();
        config.system.num_cores = 1;
        let mut machine = Machine::new(&config);

        let block = straight_line_block(0x1000, 0x1010);
        let id = block.id;
        machine.core_decoder_mut(0).insert(id, block);
        machine.start_core(0, VirtAddr::new(0x1000));

        for _ in 0..64 {
            machine.run_cycle();
        }

        assert!(machine.stats.instructions_retired >= 2);
        assert!(machine.stats.commits_atomic >= 2);
        assert!(machine.stats.icache_misses >= 1);
    }

    #[test]
    fn machine_builds_controllers_for_configured_core_count() {
        let mut config = Config::default();
        config.system.num_cores = 2;
        let machine = Machine::new(&config);
        assert_eq!(machine.cores.len(), 2);
        // l3 + directory + memory + 3 per core * 2 cores
        assert_eq!(machine.controller_count(), 3 + 3 * 2);
    }

    #[test]
    fn request_line_populates_directory_entry() {
        let config = Config::default();
        let mut machine = Machine::new(&config);
        let l1d = machine.cores[0].l1d;
        assert!(machine.request_line(l1d, 0x1000, false));
        let Controller::Directory(dir) = &machine.controllers[machine.directory_index()] else {
            panic!("expected directory controller")
        };
        assert!(dir.entry(0x1000).is_some());
    }

    #[test]
    fn run_cycle_advances_stats_and_drains_due_messages() {
        let config = Config::default();
        let mut machine = Machine::new(&config);
        let l1d = machine.cores[0].l1d;
        machine.request_line(l1d, 0x2000, false);
        for _ in 0..8 {
            machine.run_cycle();
        }
        assert!(machine.stats.cycles >= 8);
    }
}
