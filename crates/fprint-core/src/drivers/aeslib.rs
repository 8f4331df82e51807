//! Register writes shared by the AuthenTec bulk-register families.
//!
//! A register script is a list of `(reg, value)` pairs. Consecutive pairs
//! are packed into one bulk OUT transfer, at most 16 per transfer. An
//! entry for register 0 does not exist on the device; it only forces a
//! transfer boundary.

use tracing::trace;

use crate::error::FpError;
use crate::ssm::{Phase, Ssm, Step};
use crate::transport::{Completion, Transfer};

pub const EP_IN: u8 = 0x81;
pub const EP_OUT: u8 = 0x02;
pub const BULK_TIMEOUT: u32 = 4000;

const MAX_REGWRITES_PER_REQUEST: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegWrite {
    pub reg: u8,
    pub value: u8,
}

impl RegWrite {
    pub const fn new(reg: u8, value: u8) -> Self {
        Self { reg, value }
    }

    /// Batch separator.
    pub const SPLIT: RegWrite = RegWrite::new(0, 0);
}

/// Pack a script into transfer payloads.
pub fn regv_batches(regs: &[RegWrite]) -> Vec<Vec<u8>> {
    let mut batches = Vec::new();
    for group in regs.split(|r| r.reg == 0) {
        for chunk in group.chunks(MAX_REGWRITES_PER_REQUEST) {
            batches.push(chunk.iter().flat_map(|r| [r.reg, r.value]).collect());
        }
    }
    batches
}

/// Status and length check for a transfer whose payload is ignored.
pub fn check_transfer(completion: &Completion) -> Step {
    Step::from_result(completion.check_full().map(|_| ()))
}

/// Runs a register script as a `WriteRegs` sub-machine, one state per
/// batch.
#[derive(Debug, Default)]
pub struct RegWriter {
    batches: Vec<Vec<u8>>,
}

impl RegWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step that writes `regs`: a sub-machine, or `Next` when the script
    /// holds nothing to send.
    pub fn write(&mut self, regs: &[RegWrite]) -> Step {
        self.batches = regv_batches(regs);
        trace!(regs = regs.len(), batches = self.batches.len(), "Writing registers");
        if self.batches.is_empty() {
            return Step::Next;
        }
        Step::Subsm(Ssm::new(Phase::WriteRegs, self.batches.len()))
    }

    pub fn run_state(&self, ssm: &Ssm) -> Step {
        match self.batches.get(ssm.cur_state()) {
            Some(batch) => Step::Submit(Transfer::bulk_out(EP_OUT, batch.clone(), BULK_TIMEOUT)),
            None => Step::Abort(FpError::protocol("register batch out of range")),
        }
    }

    pub fn transfer_done(&self, completion: &Completion) -> Step {
        check_transfer(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batches_split_on_zero_register() {
        let regs = [
            RegWrite::new(0x80, 0x01),
            RegWrite::SPLIT,
            RegWrite::new(0x82, 0x40),
            RegWrite::new(0x83, 0x00),
        ];
        assert_eq!(
            regv_batches(&regs),
            vec![vec![0x80, 0x01], vec![0x82, 0x40, 0x83, 0x00]]
        );
    }

    #[test]
    fn test_batches_cap_at_sixteen() {
        let regs: Vec<RegWrite> = (1..=20).map(|r| RegWrite::new(r, r)).collect();
        let batches = regv_batches(&regs);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 32);
        assert_eq!(batches[1].len(), 8);
    }

    #[test]
    fn test_leading_and_trailing_splits() {
        let regs = [RegWrite::SPLIT, RegWrite::new(0x81, 0x02), RegWrite::SPLIT];
        assert_eq!(regv_batches(&regs), vec![vec![0x81, 0x02]]);
        assert!(regv_batches(&[RegWrite::SPLIT]).is_empty());
    }

    #[test]
    fn test_empty_script_moves_on() {
        let mut writer = RegWriter::new();
        assert!(matches!(writer.write(&[]), Step::Next));
        assert!(matches!(writer.write(&[RegWrite::new(1, 2)]), Step::Subsm(_)));
    }
}
