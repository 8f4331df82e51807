//! Cooperative runner for [`Ssm`] hierarchies.
//!
//! The runner owns the innermost running machine (parents hang off its
//! `parent` link) and the single pending operation slot. A second transfer
//! or timer can only be armed once the previous one has been delivered.

use std::time::Duration;

use tracing::{debug, trace, warn};

use super::machine::{Ssm, Step};
use crate::error::FpError;
use crate::transport::{Completion, TimerId, TransferId, TransportEvent, UsbTransport};

/// Callbacks the runner invokes while driving machines.
pub trait SsmHandler {
    /// Execute the current state of `ssm`.
    fn run_state(&mut self, ssm: &Ssm) -> Step;

    /// The transfer submitted by the current state finished.
    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion) -> Step;

    /// The timer armed by the current state expired.
    fn timer_done(&mut self, ssm: &Ssm) -> Step;

    /// A root machine completed or aborted. May return a follow-up root.
    fn machine_done(&mut self, ssm: Ssm) -> Option<Ssm>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Transfer(TransferId),
    Timer(TimerId),
}

/// Drives machines against a transport.
#[derive(Debug, Default)]
pub struct SsmRunner {
    current: Option<Ssm>,
    pending: Option<Pending>,
}

impl SsmRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// No machine is running.
    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// A transfer or timer is outstanding.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn inflight_transfer(&self) -> Option<TransferId> {
        match self.pending {
            Some(Pending::Transfer(id)) => Some(id),
            _ => None,
        }
    }

    /// Phase of the innermost running machine.
    pub fn current_phase(&self) -> Option<super::Phase> {
        self.current.as_ref().map(|s| s.phase())
    }

    /// Start a root machine at state 0.
    pub fn start<T: UsbTransport, H: SsmHandler>(
        &mut self,
        mut ssm: Ssm,
        transport: &mut T,
        handler: &mut H,
    ) -> Result<(), FpError> {
        if self.current.is_some() {
            return Err(FpError::Resource(format!(
                "cannot start {} while another machine runs",
                ssm.phase()
            )));
        }
        ssm.restart();
        debug!(machine = %ssm.phase(), states = ssm.nr_states(), "Starting state machine");
        let step = handler.run_state(&ssm);
        self.current = Some(ssm);
        self.drive(step, transport, handler);
        Ok(())
    }

    /// Route a transport event to the machine that is waiting for it.
    pub fn handle_event<T: UsbTransport, H: SsmHandler>(
        &mut self,
        event: TransportEvent,
        transport: &mut T,
        handler: &mut H,
    ) {
        let step = match (event, self.pending) {
            (TransportEvent::Transfer(done), Some(Pending::Transfer(id))) if done.id == id => {
                self.pending = None;
                let Some(ssm) = self.current.as_ref() else {
                    return;
                };
                trace!(machine = %ssm.phase(), state = ssm.cur_state(), status = ?done.status, "Transfer callback");
                handler.transfer_done(ssm, done)
            }
            (TransportEvent::Timer(timer), Some(Pending::Timer(id))) if timer == id => {
                self.pending = None;
                let Some(ssm) = self.current.as_ref() else {
                    return;
                };
                handler.timer_done(ssm)
            }
            (event, _) => {
                warn!(?event, "Ignoring event for stale operation");
                return;
            }
        };
        self.drive(step, transport, handler);
    }

    /// Cancel the outstanding operation. A transfer reports back through
    /// its completion; a timer is dropped and its machine aborted here.
    pub fn cancel<T: UsbTransport, H: SsmHandler>(&mut self, transport: &mut T, handler: &mut H) {
        match self.pending {
            Some(Pending::Transfer(id)) => {
                debug!(id, "Cancelling in-flight transfer");
                if let Err(e) = transport.cancel(id) {
                    warn!(id, error = %e, "Cancel failed");
                }
            }
            Some(Pending::Timer(id)) => {
                transport.cancel_timeout(id);
                self.pending = None;
                self.drive(Step::Abort(FpError::Cancelled), transport, handler);
            }
            None => {}
        }
    }

    fn drive<T: UsbTransport, H: SsmHandler>(
        &mut self,
        mut step: Step,
        transport: &mut T,
        handler: &mut H,
    ) {
        loop {
            let Some(ssm) = self.current.as_mut() else {
                return;
            };
            step = match step {
                Step::Submit(transfer) => {
                    if self.pending.is_some() {
                        Step::Abort(FpError::Resource("transfer slot busy".into()))
                    } else {
                        match transport.submit(transfer) {
                            Ok(id) => {
                                self.pending = Some(Pending::Transfer(id));
                                return;
                            }
                            Err(e) => Step::Abort(e.into()),
                        }
                    }
                }
                Step::Sleep(duration) => {
                    if self.pending.is_some() {
                        Step::Abort(FpError::Resource("timer slot busy".into()))
                    } else {
                        let id = transport.add_timeout(duration);
                        trace!(ms = duration.as_millis() as u64, "Timer armed");
                        self.pending = Some(Pending::Timer(id));
                        return;
                    }
                }
                Step::Next => {
                    if ssm.advance() {
                        handler.run_state(ssm)
                    } else {
                        Step::Complete
                    }
                }
                Step::Jump(state) => match ssm.jump_to(state) {
                    Ok(()) => handler.run_state(ssm),
                    Err(e) => Step::Abort(e),
                },
                Step::Subsm(mut child) => {
                    child.restart();
                    debug!(parent = %ssm.phase(), child = %child.phase(), "Starting sub-machine");
                    let Some(parent) = self.current.take() else {
                        return;
                    };
                    child.parent = Some(Box::new(parent));
                    let next = handler.run_state(&child);
                    self.current = Some(child);
                    next
                }
                Step::Complete => match self.finish(None, handler) {
                    Some(next) => next,
                    None => return,
                },
                Step::Abort(error) => match self.finish(Some(error), handler) {
                    Some(next) => next,
                    None => return,
                },
            };
        }
    }

    /// Retire the innermost machine and decide what runs next.
    fn finish<H: SsmHandler>(&mut self, error: Option<FpError>, handler: &mut H) -> Option<Step> {
        let mut ssm = self.current.take()?;
        match &error {
            Some(e) if e.is_cancelled() => {
                debug!(machine = %ssm.phase(), state = ssm.cur_state(), "State machine cancelled")
            }
            Some(e) => {
                debug!(machine = %ssm.phase(), state = ssm.cur_state(), error = %e, "State machine aborted")
            }
            None => debug!(machine = %ssm.phase(), "State machine completed"),
        }
        if let Some(e) = error {
            ssm.set_error(e);
        }

        if let Some(parent) = ssm.parent.take() {
            self.current = Some(*parent);
            return Some(match ssm.into_result() {
                Ok(()) => Step::Next,
                Err(e) => Step::Abort(e),
            });
        }

        let mut follow_up = handler.machine_done(ssm)?;
        follow_up.restart();
        debug!(machine = %follow_up.phase(), "Starting follow-up state machine");
        let step = handler.run_state(&follow_up);
        self.current = Some(follow_up);
        Some(step)
    }
}

/// Upper bound for one blocking wait inside the host loop.
pub const DEFAULT_POLL: Duration = Duration::from_millis(100);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssm::{Phase, ssm_states};
    use crate::transport::{MockTransport, Transfer, TransferStatus};

    ssm_states! {
        enum Outer {
            Write,
            Child,
            Read,
        }
    }

    ssm_states! {
        enum Inner {
            Pause,
            Write,
        }
    }

    #[derive(Default)]
    struct Recorder {
        visited: Vec<(Phase, usize)>,
        finished: Vec<Result<(), FpError>>,
        follow_up: Option<Ssm>,
    }

    impl SsmHandler for Recorder {
        fn run_state(&mut self, ssm: &Ssm) -> Step {
            self.visited.push((ssm.phase(), ssm.cur_state()));
            match ssm.phase() {
                Phase::Capture => match ssm.state::<Outer>() {
                    Some(Outer::Write) => Step::Submit(Transfer::bulk_out(0x02, vec![1], 100)),
                    Some(Outer::Child) => Step::Subsm(Ssm::for_states::<Inner>(Phase::Exchange)),
                    _ => Step::Submit(Transfer::bulk_in(0x81, 2, 100)),
                },
                _ => match ssm.state::<Inner>() {
                    Some(Inner::Pause) => Step::sleep_ms(10),
                    _ => Step::Submit(Transfer::bulk_out(0x02, vec![2], 100)),
                },
            }
        }

        fn transfer_done(&mut self, _ssm: &Ssm, completion: Completion) -> Step {
            Step::from_result(completion.check_full().map(|_| ()))
        }

        fn timer_done(&mut self, _ssm: &Ssm) -> Step {
            Step::Next
        }

        fn machine_done(&mut self, ssm: Ssm) -> Option<Ssm> {
            self.finished.push(ssm.into_result());
            self.follow_up.take()
        }
    }

    fn pump(runner: &mut SsmRunner, mock: &mut MockTransport, handler: &mut Recorder) {
        while let Some(event) = mock.poll(DEFAULT_POLL).unwrap() {
            runner.handle_event(event, mock, handler);
        }
    }

    #[test]
    fn test_runs_sub_machine_and_completes() {
        let mut mock = MockTransport::new();
        mock.queue_read(&[0xaa, 0xbb]);
        let mut handler = Recorder::default();
        let mut runner = SsmRunner::new();

        runner
            .start(Ssm::for_states::<Outer>(Phase::Capture), &mut mock, &mut handler)
            .unwrap();
        pump(&mut runner, &mut mock, &mut handler);

        assert!(runner.is_idle());
        assert_eq!(handler.finished, vec![Ok(())]);
        assert_eq!(
            handler.visited,
            vec![
                (Phase::Capture, 0),
                (Phase::Capture, 1),
                (Phase::Exchange, 0),
                (Phase::Exchange, 1),
                (Phase::Capture, 2),
            ]
        );
        assert_eq!(mock.get_writes(), vec![vec![1], vec![2]]);
        assert_eq!(mock.timers(), vec![Duration::from_millis(10)]);
    }

    #[test]
    fn test_child_error_aborts_parent() {
        let mut mock = MockTransport::new();
        mock.fail_next_write(TransferStatus::Completed);
        mock.fail_next_write(TransferStatus::Error);
        let mut handler = Recorder::default();
        let mut runner = SsmRunner::new();

        runner
            .start(Ssm::for_states::<Outer>(Phase::Capture), &mut mock, &mut handler)
            .unwrap();
        pump(&mut runner, &mut mock, &mut handler);

        assert_eq!(handler.finished.len(), 1);
        assert!(matches!(handler.finished[0], Err(FpError::Transport(_))));
        // The parent never reached its read state
        assert!(!handler.visited.contains(&(Phase::Capture, 2)));
    }

    #[test]
    fn test_cancel_inflight_transfer() {
        let mut mock = MockTransport::new();
        let mut handler = Recorder::default();
        let mut runner = SsmRunner::new();

        runner
            .start(Ssm::for_states::<Outer>(Phase::Capture), &mut mock, &mut handler)
            .unwrap();
        // Nothing scripted: the read in the last state stays in flight
        pump(&mut runner, &mut mock, &mut handler);
        assert!(runner.inflight_transfer().is_some());

        runner.cancel(&mut mock, &mut handler);
        pump(&mut runner, &mut mock, &mut handler);
        assert_eq!(handler.finished, vec![Err(FpError::Cancelled)]);
        assert!(!runner.has_pending());
    }

    #[test]
    fn test_follow_up_machine_starts() {
        let mut mock = MockTransport::new();
        mock.queue_read(&[0, 0]);
        let mut handler = Recorder {
            follow_up: Some(Ssm::for_states::<Inner>(Phase::Led)),
            ..Default::default()
        };
        let mut runner = SsmRunner::new();

        runner
            .start(Ssm::for_states::<Outer>(Phase::Capture), &mut mock, &mut handler)
            .unwrap();
        pump(&mut runner, &mut mock, &mut handler);

        assert_eq!(handler.finished, vec![Ok(()), Ok(())]);
        assert!(handler.visited.contains(&(Phase::Led, 1)));
    }
}
