//! Veridicom 5th Sense press sensor.
//!
//! There is no finger interrupt: the loop scans continuously and judges
//! presence from the brightness of a box in the middle of each frame.

use tracing::{debug, trace};

use crate::error::FpError;
use crate::image::Image;
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const CTRL_TIMEOUT: u32 = 1000;
const EP_IN: u8 = 0x81;

const REG_CONTRAST: u8 = 0x02;
const REG_GAIN: u8 = 0x03;
const CMD_SCAN: u8 = 0xc1;

pub const IMG_WIDTH: usize = 300;
pub const IMG_HEIGHT: usize = 288;
const ROWS_PER_RQ: usize = 12;
const NR_REQS: usize = IMG_HEIGHT / ROWS_PER_RQ;
const RQ_SIZE: usize = IMG_WIDTH * ROWS_PER_RQ;

const DETBOX_ROW_START: usize = 111;
const DETBOX_COL_START: usize = 117;
const DETBOX_ROWS: usize = 64;
const DETBOX_COLS: usize = 64;
const FINGER_PRESENCE_THRESHOLD: usize = 100;

pub static INFO: DriverInfo = DriverInfo {
    name: "vcom5s",
    full_name: "Veridicom 5thSense",
    id_table: &[(0x061a, 0x0110)],
    img_width: Some(IMG_WIDTH),
    img_height: Some(IMG_HEIGHT),
    bz3_threshold: None,
    interface: 0,
};

ssm_states! {
    enum LoopState {
        SetContrast,
        SetGain,
        CmdScan,
        Capture,
        CaptureDone,
    }
}

/// A finger darkens the centre of the frame.
pub fn finger_is_present(data: &[u8]) -> bool {
    let imgavg: usize = data
        .chunks_exact(IMG_WIDTH)
        .skip(DETBOX_ROW_START)
        .take(DETBOX_ROWS)
        .map(|row| {
            row[DETBOX_COL_START..DETBOX_COL_START + DETBOX_COLS]
                .iter()
                .map(|&p| p as usize)
                .sum::<usize>()
                / DETBOX_COLS
        })
        .sum::<usize>()
        / DETBOX_ROWS;
    debug!(imgavg, "Detection box average");
    imgavg <= FINGER_PRESENCE_THRESHOLD
}

#[derive(Default)]
pub struct Vcom5s {
    capture_iteration: usize,
    frame: Vec<u8>,
}

impl Vcom5s {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_reg(reg: u8, value: u8) -> Step {
        trace!(reg = format_args!("{:#04x}", reg), value = format_args!("{:#04x}", value), "Set register");
        Step::Submit(Transfer::vendor_out(reg, value as u16, 0, Vec::new(), CTRL_TIMEOUT))
    }

    fn read_rows(&self) -> Step {
        Step::Submit(Transfer::bulk_in(EP_IN, RQ_SIZE, CTRL_TIMEOUT))
    }

    fn rows_done(&mut self, completion: &Completion, host: &mut Host) -> Step {
        let data = match completion.check_full() {
            Ok(data) => data,
            Err(e) => return Step::Abort(e),
        };
        self.frame.extend_from_slice(data);
        self.capture_iteration += 1;
        if self.capture_iteration < NR_REQS {
            return self.read_rows();
        }
        let frame = std::mem::take(&mut self.frame);
        host.report_finger_status(finger_is_present(&frame));
        host.image_captured(Image::from_data(IMG_WIDTH, IMG_HEIGHT, frame));
        Step::Next
    }
}

impl ImageDriver for Vcom5s {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn activate(&mut self, host: &mut Host) -> Result<Ssm, FpError> {
        // Nothing to set up beyond what the loop writes every pass
        host.activate_complete(Ok(()));
        Ok(Ssm::for_states::<LoopState>(Phase::Capture))
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.state::<LoopState>() {
            Some(LoopState::SetContrast) => Self::write_reg(REG_CONTRAST, 0x01),
            Some(LoopState::SetGain) => Self::write_reg(REG_GAIN, 0x29),
            Some(LoopState::CmdScan) => {
                if host.is_deactivating() {
                    debug!("Deactivating, marking completed");
                    return Step::Complete;
                }
                Step::Submit(Transfer::vendor_in(CMD_SCAN, 0, 0, 0, CTRL_TIMEOUT))
            }
            Some(LoopState::Capture) => {
                self.capture_iteration = 0;
                self.frame = Vec::with_capacity(IMG_WIDTH * IMG_HEIGHT);
                self.read_rows()
            }
            Some(LoopState::CaptureDone) => Step::jump(LoopState::CmdScan),
            None => Step::Abort(FpError::protocol("bad loop state")),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        match ssm.state::<LoopState>() {
            Some(LoopState::Capture) => self.rows_done(&completion, host),
            _ => Step::from_result(completion.check_status()),
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        self.frame.clear();
        if let Err(e) = ssm.into_result() {
            if !host.is_deactivating() {
                host.session_error(e);
            }
        }
        None
    }
}
