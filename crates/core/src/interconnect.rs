//! Messages and interconnects tying controllers together.
//!
//! Every coherence action (a cache asking its lower level for a line, a
//! directory telling a cache to evict, a cache writing back a dirty
//! victim) travels as a `Message` over an `Interconnect`. An interconnect
//! models only the delay and backpressure of the physical link; the
//! controller on the receiving end decides whether it can accept the
//! message right now.

/// The operation a message carries, matching the directory/cache state
/// machines it drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOp {
    /// A local read request (miss needing a line in S or E).
    Read,
    /// A local write request (miss needing a line in M).
    Write,
    /// Eviction notice: invalidate (and write back if dirty).
    Evict,
    /// Directory-to-owner writeback demand before servicing a new reader.
    Update,
    /// Directory-to-owner notice that a second reader has joined: demote a
    /// clean Exclusive line to Shared without invalidating it.
    Downgrade,
}

/// A single message in flight on an interconnect.
#[derive(Clone, Debug)]
pub struct Message {
    /// Index of the sending controller.
    pub sender: usize,
    /// Index of the destination controller.
    pub dest: usize,
    /// Line address this message concerns (line-aligned).
    pub line_addr: u64,
    /// The coherence operation being requested or announced.
    pub op: MessageOp,
    /// Set on directory/cache responses to indicate the line must be
    /// installed as Shared rather than Exclusive.
    pub is_shared: bool,
    /// Whether this message carries the cache line's data payload.
    pub has_data: bool,
    /// Free-form tag threading this message back to the request that
    /// spawned it (a pending-request-buffer index).
    pub arg: u64,
}

/// Interconnect topology role, used only for readability at construction
/// sites and stats breakdowns. The emit/backpressure mechanics below are
/// identical across all roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterconnectKind {
    /// Link from a private cache up to the directory.
    Directory,
    /// Link toward a numerically higher (closer to core) cache level.
    Upper,
    /// Link toward a numerically lower (closer to memory) cache level.
    Lower,
    /// Secondary upper link, used when a level fans out to two upper
    /// consumers (e.g. a unified L2 serving split L1-I/L1-D).
    Upper2,
    /// Instruction-side private link.
    Instruction,
    /// Data-side private link.
    Data,
}

/// A point-to-point link with fixed delay and a bounded in-flight queue.
///
/// `emit` is the only mutating operation: it returns `false` when the
/// queue is full, and the caller is expected to retry after `delay()`
/// cycles (or `AVG_WAIT_DELAY` if the interconnect's own delay is zero).
pub struct Interconnect {
    kind: InterconnectKind,
    delay: u64,
    capacity: usize,
    in_flight: Vec<Message>,
}

/// Default retry delay used when an interconnect's own delay is zero.
pub const AVG_WAIT_DELAY: u64 = 4;

impl Interconnect {
    /// Creates a new interconnect of the given role, delay, and queue
    /// capacity.
    #[must_use]
    pub fn new(kind: InterconnectKind, delay: u64, capacity: usize) -> Self {
        Self {
            kind,
            delay,
            capacity,
            in_flight: Vec::with_capacity(capacity),
        }
    }

    /// The interconnect's topology role.
    #[must_use]
    pub const fn kind(&self) -> InterconnectKind {
        self.kind
    }

    /// Cycles a message spends in flight on this link.
    #[must_use]
    pub const fn delay(&self) -> u64 {
        self.delay
    }

    /// The delay a caller should wait before retrying a failed `emit`.
    #[must_use]
    pub const fn retry_delay(&self) -> u64 {
        if self.delay == 0 { AVG_WAIT_DELAY } else { self.delay }
    }

    /// Attempts to place `msg` on the link. Returns `false` (without
    /// enqueuing) if the link is at capacity.
    pub fn emit(&mut self, msg: Message) -> bool {
        if self.in_flight.len() >= self.capacity {
            return false;
        }
        self.in_flight.push(msg);
        true
    }

    /// Drains every message currently in flight, handing ownership to the
    /// caller (the top-level machine loop, which delivers each to its
    /// destination controller). In this cooperative model delivery happens
    /// once per cycle sweep rather than being separately scheduled per
    /// message, preserving a no-re-entrancy ordering guarantee: every
    /// delivery this cycle sees the same pre-sweep controller state.
    pub fn drain(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.in_flight)
    }

    /// Number of messages currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether the link has no messages queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(line_addr: u64) -> Message {
        Message {
            sender: 0,
            dest: 1,
            line_addr,
            op: MessageOp::Read,
            is_shared: false,
            has_data: false,
            arg: 0,
        }
    }

    #[test]
    fn emit_respects_capacity() {
        let mut ic = Interconnect::new(InterconnectKind::Directory, 2, 1);
        assert!(ic.emit(msg(0x1000)));
        assert!(!ic.emit(msg(0x2000)));
    }

    #[test]
    fn drain_empties_the_queue() {
        let mut ic = Interconnect::new(InterconnectKind::Upper, 1, 4);
        ic.emit(msg(0x1000));
        ic.emit(msg(0x1040));
        let drained = ic.drain();
        assert_eq!(drained.len(), 2);
        assert!(ic.is_empty());
    }

    #[test]
    fn retry_delay_falls_back_to_avg_wait() {
        let ic = Interconnect::new(InterconnectKind::Directory, 0, 4);
        assert_eq!(ic.retry_delay(), AVG_WAIT_DELAY);
    }
}
