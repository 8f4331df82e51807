//! EgisTec ES603 swipe sensor.
//!
//! Every exchange is an `EGIS` request on the bulk OUT endpoint answered by
//! a `SIGE` message (or raw pixel data) on the bulk IN endpoint. Before the
//! first capture the analog front end is tuned: a DC offset search, then
//! VRT/VRB contrast tuning against frame histograms. The tuned values are
//! kept for later activations.
//!
//! Pixels come packed two per byte (4 bits each). A full fingerprint is
//! read with the sensor's Fly-Estimation mode as two tall frames whose
//! repeated trailing lines are trimmed.

use tracing::{debug, warn};

use crate::error::FpError;
use crate::image::{Image, ImageFlags};
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const EP_IN: u8 = 0x81;
const EP_OUT: u8 = 0x02;
const BULK_TIMEOUT: u32 = 1000;

/// Sensor area frame: 192x4 pixels at 4 bits per pixel.
const FRAME_WIDTH: usize = 192;
const FRAME_SIZE: usize = FRAME_WIDTH * 4 / 2;

/// Fly-Estimation frame: 256x500 pixels at 4 bits per pixel.
const FE_WIDTH: usize = 256;
const FE_HEIGHT: usize = 500;
const FE_SIZE: usize = FE_WIDTH * FE_HEIGHT / 2;
const FE_ROW: usize = FE_WIDTH / 2;

const GAIN_SMALL_INIT: u8 = 0x23;
const VRT_MAX: u8 = 0x3f;
const VRB_MAX: u8 = 0x3a;
const DCOFFSET_MIN: u8 = 0x00;
const DCOFFSET_MAX: u8 = 0x35;

const CMD_READ_REG: u8 = 0x01;
const CMD_WRITE_REG: u8 = 0x02;
const CMD_READ_FRAME: u8 = 0x03;
const CMD_READ_FE: u8 = 0x06;
const CMD_20: u8 = 0x20;
const CMD_25: u8 = 0x25;
const CMD_OK: u8 = 0x01;

/// Registers per message.
const REG_MAX: usize = 0x18;

const REG_MODE_CONTROL: u8 = 0x02;
const REG_04: u8 = 0x04;
const REG_10: u8 = 0x10;
const REG_21: u8 = 0x21;
const REG_22: u8 = 0x22;
const REG_26: u8 = 0x26;
const REG_27: u8 = 0x27;
const REG_50: u8 = 0x50;
const REG_INFO: [u8; 4] = [0x70, 0x71, 0x72, 0x73];
const REG_GAIN: u8 = 0xe0;
const REG_VRT: u8 = 0xe1;
const REG_VRB: u8 = 0xe2;
const REG_VCO_CONTROL: u8 = 0xe5;
const REG_DCOFFSET: u8 = 0xe6;
const REG_F0: u8 = 0xf0;
const REG_F2: u8 = 0xf2;

const MODE_SLEEP: u8 = 0x30;
const MODE_SENSOR: u8 = 0x33;
/// Fly-Estimation fingerprint mode.
const MODE_FP: u8 = 0x34;
const VCO_IDLE: u8 = 0x13;
const VCO_RT: u8 = 0x14;

/// Magic plus command byte.
const MSG_HDR_SIZE: usize = 6;
const MAGIC_OUT: [u8; 5] = *b"EGIS\x09";
const MAGIC_IN: [u8; 5] = *b"SIGE\x0a";

/// Expected model registers 0x70..0x73.
const SENSOR_INFO: [u8; 4] = [0x4a, 0x44, 0x49, 0x31];

const INIT_SENSOR_REGS: &[(u8, u8)] = &[
    (REG_MODE_CONTROL, MODE_SLEEP),
    (REG_50, 0x0f),
    (REG_GAIN, 0x04),
    (REG_VRT, 0x08),
    (REG_VRB, 0x0d),
    (REG_VCO_CONTROL, VCO_RT),
    (REG_DCOFFSET, 0x36),
    (REG_F0, 0x00),
    (REG_F2, 0x00),
];

/// Encryption registers, loaded with values that leave it disabled.
const INIT_ENC_REGS: &[(u8, u8)] = &[
    (0x41, 0x12),
    (0x42, 0x34),
    (0x43, 0x56),
    (0x44, 0x78),
    (0x45, 0x90),
    (0x46, 0xab),
    (0x47, 0xcd),
    (0x48, 0xef),
];

/// Registers 0x20..=0x37.
const INIT_REGS: &[(u8, u8)] = &[
    (0x20, 0x00),
    (0x21, 0x23),
    (0x22, 0x21),
    (0x23, 0x20),
    (0x24, 0x14),
    (0x25, 0x6a),
    (0x26, 0x00),
    (0x27, 0x00),
    (0x28, 0x00),
    (0x29, 0xc0),
    (0x2a, 0x50),
    (0x2b, 0x50),
    (0x2c, 0x4d),
    (0x2d, 0x03),
    (0x2e, 0x06),
    (0x2f, 0x06),
    (0x30, 0x10),
    (0x31, 0x02),
    (0x32, 0x14),
    (0x33, 0x34),
    (0x34, 0x01),
    (0x35, 0x08),
    (0x36, 0x03),
    (0x37, 0x21),
];

const EXIT_REGS: &[(u8, u8)] = &[(REG_VCO_CONTROL, VCO_IDLE), (REG_MODE_CONTROL, MODE_SLEEP)];

pub static INFO: DriverInfo = DriverInfo {
    name: "etes603",
    full_name: "EgisTec ES603",
    id_table: &[(0x1c7a, 0x0603)],
    img_width: Some(FE_WIDTH),
    img_height: None,
    bz3_threshold: None,
    interface: 0,
};

ssm_states! {
    enum InitState {
        CheckInfo,
        Cmd20,
        Cmd25,
        Sensor,
        Enc,
        Regs,
    }
}

ssm_states! {
    enum TuneDcState {
        Init,
        SetDcOffset,
        GetFrame,
        SetReg2122,
        SetGain,
        SetFinalDcOffset,
    }
}

ssm_states! {
    enum TuneVrbState {
        Init,
        GetGain,
        GetDcOffset,
        SetDcOffset,
        GetFrame,
        SetFinalDcOffset,
        SetReg2627,
        SetGainVrtVrb,
        SetModeSleep,
    }
}

ssm_states! {
    enum FingerState {
        SetModeSleep,
        SetDcOffset,
        SetGainVrtVrb,
        SetVcoRt,
        SetReg04,
        SetModeSensor,
        GetFrame,
    }
}

ssm_states! {
    enum CaptureState {
        SetReg10,
        SetModeFp,
        GetFp,
    }
}

fn msg(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MSG_HDR_SIZE + payload.len());
    out.extend_from_slice(&MAGIC_OUT);
    out.push(cmd);
    out.extend_from_slice(payload);
    out
}

fn msg_set_regs(regs: &[(u8, u8)]) -> Vec<u8> {
    debug_assert!(!regs.is_empty() && regs.len() <= REG_MAX);
    let mut payload = vec![regs.len() as u8];
    for &(reg, val) in regs {
        payload.extend_from_slice(&[reg, val]);
    }
    msg(CMD_WRITE_REG, &payload)
}

fn msg_get_regs(regs: &[u8]) -> Vec<u8> {
    debug_assert!(!regs.is_empty() && regs.len() <= REG_MAX);
    let mut payload = vec![regs.len() as u8];
    payload.extend_from_slice(regs);
    msg(CMD_READ_REG, &payload)
}

/// Request a sensor area frame. With `use_gvv` set the given gain, VRT
/// and VRB apply to this frame only.
fn msg_get_frame(use_gvv: u8, gain: u8, vrt: u8, vrb: u8) -> Vec<u8> {
    msg(CMD_READ_FRAME, &[0x01, FRAME_WIDTH as u8, use_gvv, gain, vrt, vrb])
}

/// Request a Fly-Estimation fingerprint frame; 0x01f4 is its height.
fn msg_get_fp() -> Vec<u8> {
    msg(CMD_READ_FE, &[0x01, 0xf4, 0x02, 0x01, 0x64])
}

fn check_answer(answer: &[u8]) -> Result<u8, FpError> {
    if answer.len() < MSG_HDR_SIZE || answer[..5] != MAGIC_IN {
        return Err(FpError::protocol("answer without SIGE header"));
    }
    Ok(answer[5])
}

fn check_ok(answer: &[u8]) -> Result<(), FpError> {
    match check_answer(answer)? {
        CMD_OK => Ok(()),
        cmd => Err(FpError::protocol(format!("command failed with 0x{:02x}", cmd))),
    }
}

/// Sum of every 4-bit pixel.
fn brightness(frame: &[u8]) -> usize {
    frame
        .iter()
        .map(|&b| (b >> 4) as usize + (b & 0x0f) as usize)
        .sum()
}

/// Less than one gray level per byte on average.
fn frame_is_empty(frame: &[u8]) -> bool {
    brightness(frame) < frame.len()
}

/// Share of pixels that are full black, black, gray, white and full white.
/// Gray is black plus white; the extremes are excluded from the middle
/// classes.
fn histogram(frame: &[u8]) -> [f32; 5] {
    let mut hist = [0f32; 16];
    for &b in frame {
        hist[(b >> 4) as usize] += 1.0;
        hist[(b & 0x0f) as usize] += 1.0;
    }
    let total = (frame.len() * 2).max(1) as f32;
    for h in hist.iter_mut() {
        *h /= total;
    }
    let black: f32 = hist[1..8].iter().sum();
    let white: f32 = hist[8..15].iter().sum();
    [hist[0], black, black + white, white, hist[15]]
}

/// Expand 4-bit pixels to 8 bits.
fn expand_4bpp(input: &[u8]) -> Vec<u8> {
    input.iter().flat_map(|&b| [b & 0xf0, b << 4]).collect()
}

/// Drop the trailing lines repeating the empty pattern found in the last
/// two lines, the pattern included. Returns the number of lines removed.
fn trim_fp_end(fp: &[u8], height: usize) -> usize {
    if height < 4 {
        return 0;
    }
    let pattern_at = (height - 2) * FE_ROW;
    let pattern = &fp[pattern_at..pattern_at + FE_WIDTH];
    let mut i = 2;
    while i + 2 <= height {
        let at = pattern_at - i * FE_ROW;
        if fp[at..at + FE_WIDTH] != *pattern {
            break;
        }
        i += 2;
    }
    debug!(lines = i - 2, "Removing empty lines from image");
    i.min(height)
}

pub struct Etes603 {
    regs: [u8; 256],
    /// Registers asked for by the read in flight.
    read_regs: Vec<u8>,
    /// Set between a request and its answer.
    answer_len: Option<usize>,
    fp: Vec<u8>,
    fp_height: usize,
    tunedc_min: u8,
    tunedc_max: u8,
    gain: u8,
    dcoffset: u8,
    vrt: u8,
    vrb: u8,
    /// The sensor left sleep mode and has to be put back on deactivation.
    active: bool,
}

impl Default for Etes603 {
    fn default() -> Self {
        Self::new()
    }
}

impl Etes603 {
    pub fn new() -> Self {
        Self {
            regs: [0; 256],
            read_regs: Vec::new(),
            answer_len: None,
            fp: Vec::new(),
            fp_height: 0,
            tunedc_min: DCOFFSET_MIN,
            tunedc_max: DCOFFSET_MAX,
            gain: 0,
            dcoffset: 0,
            vrt: 0,
            vrb: 0,
            active: false,
        }
    }

    fn is_tuned(&self) -> bool {
        self.dcoffset != 0
    }

    fn reset_param(&mut self) {
        self.dcoffset = 0;
        self.vrt = 0;
        self.vrb = 0;
        self.gain = 0;
    }

    fn request(&mut self, data: Vec<u8>, answer_len: usize) -> Step {
        self.answer_len = Some(answer_len);
        Step::Submit(Transfer::bulk_out(EP_OUT, data, BULK_TIMEOUT))
    }

    fn set_regs(&mut self, regs: &[(u8, u8)]) -> Step {
        self.request(msg_set_regs(regs), MSG_HDR_SIZE + 1)
    }

    fn get_regs(&mut self, regs: &[u8]) -> Step {
        self.read_regs = regs.to_vec();
        self.request(msg_get_regs(regs), MSG_HDR_SIZE + 1 + regs.len())
    }

    fn get_frame(&mut self, use_gvv: u8, gain: u8, vrt: u8, vrb: u8) -> Step {
        self.request(msg_get_frame(use_gvv, gain, vrt, vrb), FRAME_SIZE)
    }

    fn parse_regs(&mut self, answer: &[u8]) -> Result<(), FpError> {
        let cmd = check_answer(answer)?;
        if cmd != CMD_OK {
            return Err(FpError::protocol(format!("register read failed with 0x{:02x}", cmd)));
        }
        for (reg, val) in self.read_regs.iter().zip(&answer[MSG_HDR_SIZE..]) {
            self.regs[*reg as usize] = *val;
        }
        Ok(())
    }

    fn check_info(&self) -> Result<(), FpError> {
        let info = REG_INFO.map(|reg| self.regs[reg as usize]);
        if info == SENSOR_INFO {
            return Ok(());
        }
        Err(FpError::protocol(format!(
            "unknown sensor parameters {:02x} {:02x} {:02x} {:02x}",
            info[0], info[1], info[2], info[3]
        )))
    }

    fn init_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<InitState>() {
            Some(InitState::CheckInfo) => self.get_regs(&REG_INFO),
            Some(InitState::Cmd20) => self.request(msg(CMD_20, &[]), MSG_HDR_SIZE + 5),
            Some(InitState::Cmd25) => self.request(msg(CMD_25, &[]), MSG_HDR_SIZE + 5),
            Some(InitState::Sensor) => self.set_regs(INIT_SENSOR_REGS),
            Some(InitState::Enc) => self.set_regs(INIT_ENC_REGS),
            Some(InitState::Regs) => self.set_regs(INIT_REGS),
            None => Step::Abort(FpError::protocol("unknown init state")),
        }
    }

    fn init_answer(&mut self, ssm: &Ssm, answer: &[u8]) -> Result<(), FpError> {
        match ssm.state::<InitState>() {
            Some(InitState::CheckInfo) => {
                self.parse_regs(answer)?;
                self.check_info()
            }
            Some(InitState::Cmd20) => {
                let cmd = check_answer(answer)?;
                let vals = answer.get(MSG_HDR_SIZE..MSG_HDR_SIZE + 2);
                if cmd != 0x05 || vals != Some(&[0x00, 0x00][..]) {
                    warn!(cmd, ?vals, "Unexpected CMD_20 answer");
                }
                Ok(())
            }
            Some(InitState::Cmd25) => {
                check_ok(answer)?;
                if answer.get(MSG_HDR_SIZE).is_some_and(|&v| v != 0x00) {
                    warn!(val = answer[MSG_HDR_SIZE], "Unexpected CMD_25 answer");
                }
                Ok(())
            }
            _ => check_ok(answer),
        }
    }

    /// Bisect the DC offset at which the frame turns almost black. The
    /// gain is lowered when the search hits the upper bound.
    fn tunedc_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<TuneDcState>() {
            Some(TuneDcState::Init) => {
                debug!("Tuning DC offset");
                self.gain = GAIN_SMALL_INIT;
                self.tunedc_min = DCOFFSET_MIN;
                self.tunedc_max = DCOFFSET_MAX;
                Step::Next
            }
            Some(TuneDcState::SetDcOffset) => {
                self.dcoffset = (self.tunedc_max + self.tunedc_min) / 2;
                debug!(dcoffset = self.dcoffset, gain = self.gain, "Testing DC offset");
                self.set_regs(&[(REG_DCOFFSET, self.dcoffset)])
            }
            // VRT 0x15 and VRB 0x10 stay constant while tuning
            Some(TuneDcState::GetFrame) => self.get_frame(0x01, self.gain, 0x15, 0x10),
            Some(TuneDcState::SetReg2122) => {
                debug!(dcoffset = self.dcoffset, gain = self.gain, "DC offset tuned");
                self.set_regs(&[(REG_21, 0x23), (REG_22, 0x21)])
            }
            Some(TuneDcState::SetGain) => self.set_regs(&[(REG_GAIN, self.gain)]),
            Some(TuneDcState::SetFinalDcOffset) => self.set_regs(&[(REG_DCOFFSET, self.dcoffset)]),
            None => Step::Abort(FpError::protocol("unknown DC tuning state")),
        }
    }

    fn tunedc_answer(&mut self, ssm: &Ssm, answer: &[u8]) -> Step {
        match ssm.state::<TuneDcState>() {
            Some(TuneDcState::GetFrame) => {
                // Only the first line pair decides
                let head = &answer[..answer.len().min(FRAME_WIDTH)];
                if frame_is_empty(head) {
                    self.tunedc_max = self.dcoffset;
                } else {
                    self.tunedc_min = self.dcoffset;
                }
                if self.tunedc_min + 1 < self.tunedc_max {
                    Step::jump(TuneDcState::SetDcOffset)
                } else if self.tunedc_max < DCOFFSET_MAX {
                    self.dcoffset = self.tunedc_max + 1;
                    Step::Next
                } else if self.gain == 0 {
                    Step::Abort(FpError::protocol("DC offset out of range at minimum gain"))
                } else {
                    self.gain -= 1;
                    Step::jump(TuneDcState::SetDcOffset)
                }
            }
            // Not checked; the device answers this write inconsistently
            Some(TuneDcState::SetGain) => Step::Next,
            _ => Step::from_result(check_ok(answer)),
        }
    }

    /// Adjust VRT and VRB until the histogram of a frame is neither too
    /// dark nor too bright.
    fn tunevrb_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<TuneVrbState>() {
            Some(TuneVrbState::Init) => {
                if self.dcoffset == 0 {
                    return Step::Abort(FpError::protocol("VRT/VRB tuning needs a DC offset"));
                }
                debug!("Tuning VRT/VRB");
                self.vrt = 0x0a;
                self.vrb = 0x10;
                Step::Next
            }
            Some(TuneVrbState::GetGain) => self.get_regs(&[REG_GAIN]),
            Some(TuneVrbState::GetDcOffset) => self.get_regs(&[REG_DCOFFSET]),
            // One below the tuned value leaves room for adjustment
            Some(TuneVrbState::SetDcOffset) => self.set_regs(&[(REG_DCOFFSET, self.dcoffset - 1)]),
            Some(TuneVrbState::GetFrame) => {
                debug!(vrt = self.vrt, vrb = self.vrb, "Testing VRT/VRB");
                self.get_frame(0x01, self.gain, self.vrt, self.vrb)
            }
            Some(TuneVrbState::SetFinalDcOffset) => {
                debug!(vrt = self.vrt, vrb = self.vrb, "VRT/VRB tuned");
                self.set_regs(&[(REG_DCOFFSET, self.dcoffset)])
            }
            Some(TuneVrbState::SetReg2627) => self.set_regs(&[(REG_26, 0x11), (REG_27, 0x00)]),
            Some(TuneVrbState::SetGainVrtVrb) => self.set_gain_vrt_vrb(),
            Some(TuneVrbState::SetModeSleep) => self.set_regs(&[(REG_MODE_CONTROL, MODE_SLEEP)]),
            None => Step::Abort(FpError::protocol("unknown VRT/VRB tuning state")),
        }
    }

    fn tunevrb_answer(&mut self, ssm: &Ssm, answer: &[u8]) -> Step {
        match ssm.state::<TuneVrbState>() {
            Some(TuneVrbState::GetGain) | Some(TuneVrbState::GetDcOffset) => {
                Step::from_result(self.parse_regs(answer))
            }
            Some(TuneVrbState::GetFrame) => self.tune_vrb_from_frame(answer),
            _ => Step::from_result(check_ok(answer)),
        }
    }

    fn tune_vrb_from_frame(&mut self, frame: &[u8]) -> Step {
        let [full_black, black, _, white, full_white] = histogram(frame);
        if full_black + black > 0.95 {
            if self.vrt == 0 || self.vrb == 0 {
                debug!("Image is too dark, reducing DC offset");
                self.dcoffset -= 1;
                return Step::jump(TuneVrbState::Init);
            }
            self.vrt -= 1;
            self.vrb -= 1;
            return Step::jump(TuneVrbState::GetFrame);
        }
        if full_white > 0.95 {
            if self.dcoffset >= DCOFFSET_MAX {
                return Step::Abort(FpError::protocol("image too bright at maximum DC offset"));
            }
            debug!("Image is too bright, increasing DC offset");
            self.dcoffset += 1;
            return Step::jump(TuneVrbState::Init);
        }
        if full_white + white > 0.4 {
            if self.vrt >= VRT_MAX && self.vrb >= VRB_MAX {
                debug!("VRT/VRB at maximum");
                return Step::Next;
            }
            if self.vrt as i32 >= 2 * self.vrb as i32 - 0x0a {
                self.vrt += 1;
                self.vrb += 1;
            } else {
                self.vrt += 1;
            }
            self.vrt = self.vrt.min(VRT_MAX);
            self.vrb = self.vrb.min(VRB_MAX);
            return Step::jump(TuneVrbState::GetFrame);
        }
        Step::Next
    }

    fn set_gain_vrt_vrb(&mut self) -> Step {
        let regs = [(REG_GAIN, self.gain), (REG_VRT, self.vrt), (REG_VRB, self.vrb)];
        self.set_regs(&regs)
    }

    fn finger_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<FingerState>() {
            Some(FingerState::SetModeSleep) => self.set_regs(&[(REG_MODE_CONTROL, MODE_SLEEP)]),
            Some(FingerState::SetDcOffset) => self.set_regs(&[(REG_DCOFFSET, self.dcoffset)]),
            Some(FingerState::SetGainVrtVrb) => self.set_gain_vrt_vrb(),
            Some(FingerState::SetVcoRt) => self.set_regs(&[(REG_VCO_CONTROL, VCO_RT)]),
            Some(FingerState::SetReg04) => self.set_regs(&[(REG_04, 0x00)]),
            Some(FingerState::SetModeSensor) => self.set_regs(&[(REG_MODE_CONTROL, MODE_SENSOR)]),
            Some(FingerState::GetFrame) => self.get_frame(0x00, 0x00, 0x00, 0x00),
            None => Step::Abort(FpError::protocol("unknown finger detection state")),
        }
    }

    fn finger_answer(&mut self, ssm: &Ssm, answer: &[u8], host: &mut Host) -> Step {
        match ssm.state::<FingerState>() {
            Some(FingerState::GetFrame) => {
                if frame_is_empty(answer) {
                    Step::jump(FingerState::GetFrame)
                } else {
                    host.report_finger_status(true);
                    Step::Complete
                }
            }
            _ => Step::from_result(check_ok(answer)),
        }
    }

    fn capture_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<CaptureState>() {
            Some(CaptureState::SetReg10) => {
                debug!("Capturing a fingerprint");
                self.fp.clear();
                self.fp_height = 0;
                self.set_regs(&[(REG_10, 0x92)])
            }
            Some(CaptureState::SetModeFp) => self.set_regs(&[(REG_MODE_CONTROL, MODE_FP)]),
            Some(CaptureState::GetFp) => self.request(msg_get_fp(), FE_SIZE),
            None => Step::Abort(FpError::protocol("unknown capture state")),
        }
    }

    fn capture_answer(&mut self, ssm: &Ssm, answer: &[u8], host: &mut Host) -> Step {
        if ssm.state::<CaptureState>() != Some(CaptureState::GetFp) {
            return Step::from_result(check_ok(answer));
        }
        if answer.len() != FE_SIZE {
            return Step::Abort(FpError::ShortTransfer {
                expected: FE_SIZE,
                actual: answer.len(),
            });
        }
        self.fp.truncate(self.fp_height * FE_ROW);
        self.fp.extend_from_slice(answer);
        self.fp_height += FE_HEIGHT;
        if self.fp_height <= FE_HEIGHT {
            // The next frame overwrites the last two lines
            self.fp_height -= 2;
            debug!("Capturing a second frame");
            return Step::jump(CaptureState::GetFp);
        }

        for _ in 0..2 {
            let removed = trim_fp_end(&self.fp, self.fp_height);
            self.fp_height -= removed;
        }
        let data = expand_4bpp(&self.fp[..self.fp_height * FE_ROW]);
        // White on black, bottom to top
        let img = Image::from_data(FE_WIDTH, self.fp_height, data).with_flags(
            ImageFlags::COLORS_INVERTED | ImageFlags::V_FLIPPED | ImageFlags::PARTIAL,
        );
        debug!(width = img.width, height = img.height, "Sending fingerprint image");
        host.image_captured(img);
        host.report_finger_status(false);
        Step::Complete
    }
}

impl ImageDriver for Etes603 {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn activate(&mut self, host: &mut Host) -> Result<Ssm, FpError> {
        self.active = true;
        self.answer_len = None;
        if !self.is_tuned() {
            debug!("Tuning device");
            return Ok(Ssm::for_states::<InitState>(Phase::Init));
        }
        debug!(
            dcoffset = self.dcoffset,
            vrt = self.vrt,
            vrb = self.vrb,
            gain = self.gain,
            "Using previous tuning"
        );
        host.activate_complete(Ok(()));
        Ok(Ssm::for_states::<FingerState>(Phase::FingerDetect))
    }

    fn deactivate(&mut self, _host: &mut Host) -> Option<Ssm> {
        self.exit()
    }

    fn run_state(&mut self, ssm: &Ssm, _host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Init => self.init_state(ssm),
            Phase::TuneDc => self.tunedc_state(ssm),
            Phase::TuneVrb => self.tunevrb_state(ssm),
            Phase::FingerDetect => self.finger_state(ssm),
            Phase::Capture => self.capture_state(ssm),
            Phase::Deactivate => self.set_regs(EXIT_REGS),
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    /// A sent request chains to the read of its answer.
    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        if let Err(e) = completion.check_status() {
            self.answer_len = None;
            return Step::Abort(e);
        }
        if let Some(len) = self.answer_len.take() {
            if completion.actual_length != completion.requested_length {
                warn!(
                    length = completion.requested_length,
                    actual = completion.actual_length,
                    "Short request write"
                );
            }
            return Step::Submit(Transfer::bulk_in(EP_IN, len, BULK_TIMEOUT));
        }

        let answer = completion.data.as_slice();
        match ssm.phase() {
            Phase::Init => Step::from_result(self.init_answer(ssm, answer)),
            Phase::TuneDc => self.tunedc_answer(ssm, answer),
            Phase::TuneVrb => self.tunevrb_answer(ssm, answer),
            Phase::FingerDetect => self.finger_answer(ssm, answer, host),
            Phase::Capture => self.capture_answer(ssm, answer, host),
            _ => Step::from_result(check_ok(answer)),
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let result = ssm.into_result();

        if phase == Phase::Deactivate {
            match result {
                Ok(()) => debug!("The device is now in idle state"),
                Err(e) => warn!(error = %e, "Error switching the device to idle state"),
            }
            return None;
        }
        if host.is_deactivating() {
            if matches!(phase, Phase::Init | Phase::TuneDc | Phase::TuneVrb) {
                self.reset_param();
                host.activate_complete(Err(FpError::Cancelled));
            }
            return self.exit();
        }

        match (phase, result) {
            (Phase::Init, Ok(())) => Some(Ssm::for_states::<TuneDcState>(Phase::TuneDc)),
            (Phase::TuneDc, Ok(())) => Some(Ssm::for_states::<TuneVrbState>(Phase::TuneVrb)),
            (Phase::TuneVrb, Ok(())) => {
                debug!("Tuning is done, starting finger detection");
                host.activate_complete(Ok(()));
                Some(Ssm::for_states::<FingerState>(Phase::FingerDetect))
            }
            (Phase::Init | Phase::TuneDc | Phase::TuneVrb, Err(e)) => {
                warn!(machine = %phase, error = %e, "Tuning failed");
                self.active = false;
                self.reset_param();
                host.activate_complete(Err(e));
                None
            }
            (Phase::FingerDetect, Ok(())) => Some(Ssm::for_states::<CaptureState>(Phase::Capture)),
            (Phase::Capture, Ok(())) => Some(Ssm::for_states::<FingerState>(Phase::FingerDetect)),
            (Phase::Capture, Err(FpError::Capture(reason))) => {
                host.abort_scan(reason);
                Some(Ssm::for_states::<FingerState>(Phase::FingerDetect))
            }
            (_, Err(e)) => {
                host.session_error(e);
                None
            }
            (phase, Ok(())) => {
                warn!(machine = %phase, "Unexpected machine completed");
                None
            }
        }
    }
}

impl Etes603 {
    /// Put the sensor back to sleep, once per activation.
    fn exit(&mut self) -> Option<Ssm> {
        self.answer_len = None;
        if !std::mem::take(&mut self.active) {
            return None;
        }
        debug!("Switching device to idle mode");
        Some(Ssm::new(Phase::Deactivate, 1))
    }
}
