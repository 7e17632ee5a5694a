//! Branch prediction: a single consolidated predictor interface returning
//! (predicted-target, update-info) for the fetch stage to consume. The
//! GShare/BTB/RAS shapes follow a conventional split design; this OoO
//! core needs exactly one predictor, not a selectable TAGE/Perceptron/
//! Tournament family, so only that one survives here.

use crate::common::addr::VirtAddr;

const PHT_BITS: usize = 12;
const PHT_SIZE: usize = 1 << PHT_BITS;

/// Direct-mapped branch target buffer.
struct Btb {
    entries: Vec<Option<(u64, u64)>>,
}

impl Btb {
    fn new(size: usize) -> Self {
        Self { entries: vec![None; size] }
    }

    fn index(&self, pc: u64) -> usize {
        (pc as usize >> 2) % self.entries.len()
    }

    fn lookup(&self, pc: u64) -> Option<u64> {
        match self.entries[self.index(pc)] {
            Some((tag, target)) if tag == pc => Some(target),
            _ => None,
        }
    }

    fn update(&mut self, pc: u64, target: u64) {
        let idx = self.index(pc);
        self.entries[idx] = Some((pc, target));
    }
}

/// Return-address stack.
struct Ras {
    stack: Vec<u64>,
    capacity: usize,
}

impl Ras {
    fn new(capacity: usize) -> Self {
        Self { stack: Vec::with_capacity(capacity), capacity }
    }

    fn push(&mut self, addr: u64) {
        if self.stack.len() == self.capacity {
            self.stack.remove(0);
        }
        self.stack.push(addr);
    }

    fn top(&self) -> Option<u64> {
        self.stack.last().copied()
    }

    fn pop(&mut self) -> Option<u64> {
        self.stack.pop()
    }
}

/// What fetch does with a predicted outcome: resume at `target` if
/// `taken`, otherwise continue straight-line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Prediction {
    pub taken: bool,
    pub target: Option<u64>,
}

/// The actual outcome of a resolved branch, fed back via `update`.
#[derive(Clone, Copy, Debug)]
pub struct BranchOutcome {
    pub pc: VirtAddr,
    pub taken: bool,
    pub target: Option<u64>,
}

/// GShare direction predictor plus BTB and RAS, giving fetch a single
/// `predict`/`update` interface regardless of branch kind.
pub struct BranchPredictor {
    ghr: u64,
    pht: Vec<u8>,
    btb: Btb,
    ras: Ras,
}

impl BranchPredictor {
    /// Creates a predictor with the given BTB and RAS capacities.
    #[must_use]
    pub fn new(btb_size: usize, ras_size: usize) -> Self {
        Self {
            ghr: 0,
            pht: vec![1; PHT_SIZE],
            btb: Btb::new(btb_size),
            ras: Ras::new(ras_size),
        }
    }

    fn pht_index(&self, pc: u64) -> usize {
        let pc_part = (pc >> 2) & (PHT_SIZE as u64 - 1);
        let ghr_part = self.ghr & (PHT_SIZE as u64 - 1);
        (pc_part ^ ghr_part) as usize
    }

    /// Predicts direction and (if taken) target for a conditional or
    /// direct branch at `pc`.
    #[must_use]
    pub fn predict(&self, pc: VirtAddr) -> Prediction {
        let idx = self.pht_index(pc.val());
        let taken = self.pht[idx] >= 2;
        Prediction { taken, target: if taken { self.btb.lookup(pc.val()) } else { None } }
    }

    /// Predicts an indirect jump's target purely from the BTB.
    #[must_use]
    pub fn predict_indirect(&self, pc: VirtAddr) -> Option<u64> {
        self.btb.lookup(pc.val())
    }

    /// Predicts a return's target from the RAS.
    #[must_use]
    pub fn predict_return(&self) -> Option<u64> {
        self.ras.top()
    }

    /// Records a call's return address for later `predict_return`.
    pub fn on_call(&mut self, pc: VirtAddr, return_addr: u64, target: u64) {
        self.ras.push(return_addr);
        self.btb.update(pc.val(), target);
    }

    /// Pops the RAS on a resolved return.
    pub fn on_return(&mut self) {
        self.ras.pop();
    }

    /// Feeds back a resolved branch's actual outcome, updating the PHT
    /// counter, global history, and BTB.
    pub fn update(&mut self, outcome: BranchOutcome) {
        let idx = self.pht_index(outcome.pc.val());
        if outcome.taken && self.pht[idx] < 3 {
            self.pht[idx] += 1;
        } else if !outcome.taken && self.pht[idx] > 0 {
            self.pht[idx] -= 1;
        }
        self.ghr = ((self.ghr << 1) | u64::from(outcome.taken)) & (PHT_SIZE as u64 - 1);
        if let Some(target) = outcome.target {
            self.btb.update(outcome.pc.val(), target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_taken_outcomes_saturate_prediction_to_taken() {
        let mut bp = BranchPredictor::new(16, 4);
        let pc = VirtAddr::new(0x1000);
        for _ in 0..4 {
            bp.update(BranchOutcome { pc, taken: true, target: Some(0x2000) });
        }
        let pred = bp.predict(pc);
        assert!(pred.taken);
        assert_eq!(pred.target, Some(0x2000));
    }

    #[test]
    fn ras_push_pop_is_lifo() {
        let mut bp = BranchPredictor::new(16, 4);
        bp.on_call(VirtAddr::new(0x100), 0x104, 0x200);
        bp.on_call(VirtAddr::new(0x210), 0x214, 0x300);
        assert_eq!(bp.predict_return(), Some(0x214));
        bp.on_return();
        assert_eq!(bp.predict_return(), Some(0x104));
    }
}
