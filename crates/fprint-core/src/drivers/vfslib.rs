//! Scripted bulk exchanges shared by the Validity swipe sensors.
//!
//! Their init and capture setup are long fixed conversations: send a
//! command, read one or more answers, sometimes check an answer against a
//! known reply. A script runs as its own machine with one action per
//! state.

use tracing::{debug, trace};

use crate::error::FpError;
use crate::ssm::{Phase, Ssm, Step};
use crate::transport::{Completion, Transfer};

/// How a receive reacts to a timeout. Some answers arrive in either
/// order or not at all; such a pair is read as `First`, `Optional`, then
/// `IfMissed` for the first one again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    Required,
    First,
    Optional,
    IfMissed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send {
        ep: u8,
        data: Vec<u8>,
    },
    Recv {
        ep: u8,
        len: usize,
        mode: RecvMode,
        /// Exact reply required, if any.
        expect: Option<Vec<u8>>,
    },
}

pub fn send(ep: u8, data: impl Into<Vec<u8>>) -> Action {
    Action::Send {
        ep,
        data: data.into(),
    }
}

pub fn recv(ep: u8, len: usize) -> Action {
    Action::Recv {
        ep,
        len,
        mode: RecvMode::Required,
        expect: None,
    }
}

pub fn recv_check(ep: u8, len: usize, expect: &[u8]) -> Action {
    Action::Recv {
        ep,
        len,
        mode: RecvMode::Required,
        expect: Some(expect.to_vec()),
    }
}

/// Two answers that may come in either order, the second possibly never.
pub fn variable_order(first: (u8, usize), second: (u8, usize)) -> [Action; 3] {
    let action = |(ep, len): (u8, usize), mode| Action::Recv {
        ep,
        len,
        mode,
        expect: None,
    };
    [
        action(first, RecvMode::First),
        action(second, RecvMode::Optional),
        action(first, RecvMode::IfMissed),
    ]
}

#[derive(Debug, Default)]
pub struct UsbExchange {
    actions: Vec<Action>,
    timeout: u32,
    first_missed: bool,
}

impl UsbExchange {
    /// Load `actions` and return the machine that plays them.
    pub fn start(&mut self, phase: Phase, actions: Vec<Action>, timeout: u32) -> Ssm {
        debug!(machine = %phase, actions = actions.len(), "Starting exchange");
        self.first_missed = false;
        self.timeout = timeout;
        let ssm = Ssm::new(phase, actions.len());
        self.actions = actions;
        ssm
    }

    pub fn run_state(&self, ssm: &Ssm) -> Step {
        match self.actions.get(ssm.cur_state()) {
            Some(Action::Send { ep, data }) => {
                trace!(len = data.len(), cmd = ?data.first(), "Sending");
                Step::Submit(Transfer::bulk_out(*ep, data.clone(), self.timeout))
            }
            Some(Action::Recv {
                mode: RecvMode::IfMissed,
                ..
            }) if !self.first_missed => Step::Next,
            Some(Action::Recv { ep, len, .. }) => {
                Step::Submit(Transfer::bulk_in(*ep, *len, self.timeout))
            }
            None => Step::Abort(FpError::protocol(format!(
                "exchange state {} out of range, only {} steps",
                ssm.cur_state(),
                self.actions.len()
            ))),
        }
    }

    pub fn transfer_done(&mut self, ssm: &Ssm, completion: &Completion) -> Step {
        let (mode, expect) = match self.actions.get(ssm.cur_state()) {
            Some(Action::Recv { mode, expect, .. }) => (*mode, expect.as_deref()),
            Some(Action::Send { .. }) => {
                return Step::from_result(completion.check_full().map(|_| ()));
            }
            None => return Step::Abort(FpError::protocol("exchange ran past its end")),
        };
        match (completion.check_status(), mode) {
            (Err(FpError::Timeout), RecvMode::First) => {
                debug!("Answer did not come first, retrying later");
                self.first_missed = true;
                Step::Next
            }
            (Err(FpError::Timeout), RecvMode::Optional | RecvMode::IfMissed) => Step::Next,
            (Err(e), _) => Step::Abort(e),
            (Ok(()), _) => {
                if mode == RecvMode::First {
                    self.first_missed = false;
                }
                match expect {
                    Some(expect) if completion.data != expect => Step::Abort(FpError::protocol(
                        format!("wrong reply {:02x?}, expected {:02x?}", completion.data, expect),
                    )),
                    _ => {
                        trace!(
                            got = completion.actual_length,
                            of = completion.requested_length,
                            "Received"
                        );
                        Step::Next
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransferStatus;

    fn done(status: TransferStatus, data: &[u8]) -> Completion {
        Completion {
            id: 1,
            status,
            data: data.to_vec(),
            actual_length: data.len(),
            requested_length: 64,
        }
    }

    #[test]
    fn test_late_first_answer_is_read_again() {
        let mut exchange = UsbExchange::default();
        let mut ssm = exchange.start(
            Phase::Exchange,
            variable_order((0x81, 2), (0x82, 64)).to_vec(),
            300,
        );
        let step = exchange.transfer_done(&ssm, &done(TransferStatus::TimedOut, &[]));
        assert!(matches!(step, Step::Next));

        ssm.jump_to(2).unwrap();
        assert!(matches!(exchange.run_state(&ssm), Step::Submit(t) if t.is_in()));
    }

    #[test]
    fn test_retry_skipped_when_first_answer_came() {
        let mut exchange = UsbExchange::default();
        let mut ssm = exchange.start(
            Phase::Exchange,
            variable_order((0x81, 2), (0x82, 64)).to_vec(),
            300,
        );
        let step = exchange.transfer_done(&ssm, &done(TransferStatus::Completed, &[0, 0]));
        assert!(matches!(step, Step::Next));
        ssm.jump_to(1).unwrap();
        // Second answer may never come
        let step = exchange.transfer_done(&ssm, &done(TransferStatus::TimedOut, &[]));
        assert!(matches!(step, Step::Next));
        ssm.jump_to(2).unwrap();
        assert!(matches!(exchange.run_state(&ssm), Step::Next));
    }

    #[test]
    fn test_checked_reply_must_match() {
        let mut exchange = UsbExchange::default();
        let ssm = exchange.start(Phase::Exchange, vec![recv_check(0x81, 64, &[0, 0])], 1000);
        assert!(matches!(
            exchange.transfer_done(&ssm, &done(TransferStatus::Completed, &[0, 0])),
            Step::Next
        ));
        assert!(matches!(
            exchange.transfer_done(&ssm, &done(TransferStatus::Completed, &[0, 1])),
            Step::Abort(FpError::Protocol(_))
        ));
        // Required answers do not tolerate a timeout
        assert!(matches!(
            exchange.transfer_done(&ssm, &done(TransferStatus::TimedOut, &[])),
            Step::Abort(FpError::Timeout)
        ));
    }

    #[test]
    fn test_state_past_script_aborts() {
        let mut exchange = UsbExchange::default();
        let ssm = exchange.start(Phase::Exchange, vec![send(0x01, [0x1a])], 1000);
        exchange.actions.clear();
        assert!(matches!(exchange.run_state(&ssm), Step::Abort(_)));
    }
}
