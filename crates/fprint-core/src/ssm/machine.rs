//! Sequential state machine values.
//!
//! An [`Ssm`] is a cursor over an ordered list of states belonging to one
//! protocol [`Phase`]. Drivers map the ordinal `cur_state` onto their own
//! state enums and answer every state with a [`Step`].

use std::fmt;
use std::time::Duration;

use crate::error::FpError;
use crate::transport::Transfer;

/// Protocol phase implemented by a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Init,
    Activate,
    Calibrate,
    FingerDetect,
    Capture,
    Imaging,
    Deactivate,
    WriteRegs,
    Exchange,
    PowerUp,
    RebootPower,
    TuneDc,
    TuneVrb,
    Handshake,
    Led,
    ClearEp,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Open => write!(f, "OPEN"),
            Phase::Init => write!(f, "INIT"),
            Phase::Activate => write!(f, "ACTIVATE"),
            Phase::Calibrate => write!(f, "CALIBRATE"),
            Phase::FingerDetect => write!(f, "FINGER_DETECT"),
            Phase::Capture => write!(f, "CAPTURE"),
            Phase::Imaging => write!(f, "IMAGING"),
            Phase::Deactivate => write!(f, "DEACTIVATE"),
            Phase::WriteRegs => write!(f, "WRITE_REGS"),
            Phase::Exchange => write!(f, "EXCHANGE"),
            Phase::PowerUp => write!(f, "POWERUP"),
            Phase::RebootPower => write!(f, "REBOOT_POWER"),
            Phase::TuneDc => write!(f, "TUNE_DC"),
            Phase::TuneVrb => write!(f, "TUNE_VRB"),
            Phase::Handshake => write!(f, "HANDSHAKE"),
            Phase::Led => write!(f, "LED"),
            Phase::ClearEp => write!(f, "CLEAR_EP"),
        }
    }
}

/// Ordinal state list of one phase.
pub trait SsmState: Copy + fmt::Debug {
    const COUNT: usize;

    fn index(self) -> usize;

    fn from_index(index: usize) -> Option<Self>;
}

/// Declare a state enum whose variants keep their source-order ordinals.
macro_rules! ssm_states {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $($variant),+
        }

        impl $name {
            const ALL: &'static [$name] = &[$($name::$variant),+];
        }

        impl $crate::ssm::SsmState for $name {
            const COUNT: usize = $name::ALL.len();

            fn index(self) -> usize {
                self as usize
            }

            fn from_index(index: usize) -> Option<Self> {
                $name::ALL.get(index).copied()
            }
        }
    };
}
pub(crate) use ssm_states;

/// What a state asks the runtime to do next.
#[derive(Debug)]
pub enum Step {
    /// Submit one transfer; its completion goes to `transfer_done`.
    Submit(Transfer),
    /// Arm a timer; its expiry goes to `timer_done`.
    Sleep(Duration),
    Next,
    Jump(usize),
    Complete,
    Abort(FpError),
    /// Run a child machine; its completion advances this one.
    Subsm(Ssm),
}

impl Step {
    pub fn jump<S: SsmState>(state: S) -> Self {
        Step::Jump(state.index())
    }

    pub fn sleep_ms(ms: u64) -> Self {
        Step::Sleep(Duration::from_millis(ms))
    }

    /// `Next` on success, `Abort` otherwise.
    pub fn from_result(result: Result<(), FpError>) -> Self {
        match result {
            Ok(()) => Step::Next,
            Err(e) => Step::Abort(e),
        }
    }
}

/// Sequential state machine instance.
#[derive(Debug)]
pub struct Ssm {
    phase: Phase,
    cur_state: usize,
    nr_states: usize,
    error: Option<FpError>,
    pub(crate) parent: Option<Box<Ssm>>,
}

impl Ssm {
    /// New machine positioned at state 0.
    pub fn new(phase: Phase, nr_states: usize) -> Self {
        Self {
            phase,
            cur_state: 0,
            nr_states: nr_states.max(1),
            error: None,
            parent: None,
        }
    }

    /// Machine sized to the state enum `S`.
    pub fn for_states<S: SsmState>(phase: Phase) -> Self {
        Self::new(phase, S::COUNT)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cur_state(&self) -> usize {
        self.cur_state
    }

    pub fn nr_states(&self) -> usize {
        self.nr_states
    }

    /// Current state decoded as `S`.
    pub fn state<S: SsmState>(&self) -> Option<S> {
        S::from_index(self.cur_state)
    }

    pub fn error(&self) -> Option<&FpError> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> Result<(), FpError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn parent_phase(&self) -> Option<Phase> {
        self.parent.as_ref().map(|p| p.phase)
    }

    pub(crate) fn restart(&mut self) {
        self.cur_state = 0;
        self.error = None;
    }

    /// Advance one state. Returns false when the machine ran off its end.
    pub(crate) fn advance(&mut self) -> bool {
        self.cur_state += 1;
        self.cur_state < self.nr_states
    }

    pub(crate) fn jump_to(&mut self, state: usize) -> Result<(), FpError> {
        if state >= self.nr_states {
            return Err(FpError::Protocol(format!(
                "{} has no state {} (of {})",
                self.phase, state, self.nr_states
            )));
        }
        self.cur_state = state;
        Ok(())
    }

    pub(crate) fn set_error(&mut self, error: FpError) {
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    ssm_states! {
        enum Demo {
            First,
            Second,
            Third,
        }
    }

    #[test]
    fn test_state_ordinals() {
        assert_eq!(Demo::COUNT, 3);
        assert_eq!(Demo::Third.index(), 2);
        assert_eq!(Demo::from_index(1), Some(Demo::Second));
        assert_eq!(Demo::from_index(3), None);
    }

    #[test]
    fn test_advance_and_jump() {
        let mut ssm = Ssm::for_states::<Demo>(Phase::Capture);
        assert_eq!(ssm.state::<Demo>(), Some(Demo::First));
        assert!(ssm.advance());
        assert!(ssm.advance());
        assert!(!ssm.advance());

        ssm.restart();
        ssm.jump_to(Demo::Third.index()).unwrap();
        assert_eq!(ssm.state::<Demo>(), Some(Demo::Third));
        assert!(ssm.jump_to(3).is_err());
    }

    #[test]
    fn test_result_carries_error() {
        let mut ssm = Ssm::new(Phase::Init, 2);
        ssm.set_error(FpError::Timeout);
        assert_eq!(ssm.into_result(), Err(FpError::Timeout));
    }
}
