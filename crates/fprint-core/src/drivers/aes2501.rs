//! AuthenTec AES2501 swipe sensor.
//!
//! 192x16 strips of 4-bit pixels, each followed by a histogram and a
//! register dump. The A/D reference is nudged per strip from the
//! histogram; three empty strips in a row end the swipe.

use tracing::debug;

use super::aeslib::{BULK_TIMEOUT, EP_IN, RegWrite, RegWriter, check_transfer};
use crate::assembling::{Frame, FrameAsmblCtx, PixelFormat, assemble_frames, do_movement_estimation};
use crate::error::FpError;
use crate::image::ImageFlags;
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, SsmState, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const FRAME_WIDTH: usize = 192;
const FRAME_HEIGHT: usize = 16;
const IMAGE_WIDTH: usize = FRAME_WIDTH + FRAME_WIDTH / 2;
const STRIP_LEN: usize = FRAME_WIDTH * FRAME_HEIGHT / 2;
const STRIP_READ_LEN: usize = 1705;
const REG_DUMP_LEN: usize = 126;

const REG_CTRL1: u8 = 0x80;
const REG_CTRL2: u8 = 0x81;
const REG_EXCITCTRL: u8 = 0x82;
const REG_DETCTRL: u8 = 0x83;
const REG_COLSCAN: u8 = 0x88;
const REG_MEASDRV: u8 = 0x89;
const REG_MEASFREQ: u8 = 0x8a;
const REG_DEMODPHASE1: u8 = 0x8d;
const REG_DEMODPHASE2: u8 = 0x8c;
const REG_CHANGAIN: u8 = 0x8e;
const REG_ADREFHI: u8 = 0x91;
const REG_ADREFLO: u8 = 0x92;
const REG_ENDROW: u8 = 0x94;
const REG_STRTCOL: u8 = 0x95;
const REG_ENDCOL: u8 = 0x96;
const REG_DATFMT: u8 = 0x97;
const REG_IMAGCTRL: u8 = 0x98;
const REG_CHWORD1: u8 = 0x9b;
const REG_CHWORD2: u8 = 0x9c;
const REG_CHWORD3: u8 = 0x9d;
const REG_CHWORD4: u8 = 0x9e;
const REG_CHWORD5: u8 = 0x9f;
const REG_TREG1: u8 = 0xa1;
const REG_AUTOCALOFFSET: u8 = 0xa8;
const REG_TREGC: u8 = 0xac;
const REG_TREGD: u8 = 0xad;
const REG_LPONT: u8 = 0xb4;

const FIRST_REG: u8 = REG_CTRL1;
const LAST_REG: u8 = REG_CHWORD5;

const CTRL1_MASTER_RESET: u8 = 0x01;
const CTRL1_SCAN_RESET: u8 = 0x02;
const CTRL1_REG_UPDATE: u8 = 0x04;
const CTRL2_READ_REGS: u8 = 0x02;
const CTRL2_SET_ONE_SHOT: u8 = 0x04;
const DETCTRL_DRATE_CONTINUOUS: u8 = 0x00;
const DETCTRL_SDELAY_31_MS: u8 = 0x00;
const COLSCAN_SRATE_128_US: u8 = 0x02;
const MEASDRV_MDRIVE_0_325: u8 = 0x00;
const MEASDRV_MEASURE_SQUARE: u8 = 0x10;
const MEASFREQ_2M: u8 = 0x05;
const DEMODPHASE_NONE: u8 = 0x00;
const CHANGAIN_STAGE1_2X: u8 = 0x00;
const CHANGAIN_STAGE1_16X: u8 = 0x03;
const CHANGAIN_STAGE2_2X: u8 = 0x00;
const CHANGAIN_STAGE2_4X: u8 = 0x10;
const DATFMT_BIN_IMG: u8 = 0x10;
const IMAGCTRL_IMG_DATA_DISABLE: u8 = 0x01;
const IMAGCTRL_HISTO_DATA_ENABLE: u8 = 0x02;
const IMAGCTRL_TST_REG_ENABLE: u8 = 0x20;
const TREGC_ENABLE: u8 = 0x01;
const LPONT_MIN_VALUE: u8 = 0x00;

const ADREFHI_MIN_VALUE: u8 = 0x28;
const ADREFHI_MAX_VALUE: u8 = 0x58;
const SUM_HIGH_THRESH: u32 = 1000;
const SUM_LOW_THRESH: u32 = 700;

/// Register dump polls before giving up on the calibration value.
const READ_REGS_RETRIES: u8 = 13;
const NO_FINGER_STRIPS: u32 = 3;

pub static INFO: DriverInfo = DriverInfo {
    name: "aes2501",
    full_name: "AuthenTec AES2501",
    id_table: &[(0x08ff, 0x2500), (0x08ff, 0x2580)],
    img_width: Some(IMAGE_WIDTH),
    img_height: None,
    bz3_threshold: None,
    interface: 0,
};

const FINGER_DET_REQS: &[RegWrite] = &[
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::new(REG_EXCITCTRL, 0x40),
    RegWrite::new(REG_DETCTRL, DETCTRL_DRATE_CONTINUOUS | DETCTRL_SDELAY_31_MS),
    RegWrite::new(REG_COLSCAN, COLSCAN_SRATE_128_US),
    RegWrite::new(REG_MEASDRV, MEASDRV_MDRIVE_0_325 | MEASDRV_MEASURE_SQUARE),
    RegWrite::new(REG_MEASFREQ, MEASFREQ_2M),
    RegWrite::new(REG_DEMODPHASE1, DEMODPHASE_NONE),
    RegWrite::new(REG_DEMODPHASE2, DEMODPHASE_NONE),
    RegWrite::new(REG_CHANGAIN, CHANGAIN_STAGE2_4X | CHANGAIN_STAGE1_16X),
    RegWrite::new(REG_ADREFHI, 0x44),
    RegWrite::new(REG_ADREFLO, 0x34),
    RegWrite::new(REG_STRTCOL, 0x16),
    RegWrite::new(REG_ENDCOL, 0x16),
    RegWrite::new(REG_DATFMT, DATFMT_BIN_IMG | 0x08),
    RegWrite::new(REG_TREG1, 0x70),
    RegWrite::new(0xa2, 0x02),
    RegWrite::new(0xa7, 0x00),
    RegWrite::new(REG_TREGC, TREGC_ENABLE),
    RegWrite::new(REG_TREGD, 0x1a),
    RegWrite::SPLIT,
    RegWrite::new(REG_CTRL1, CTRL1_REG_UPDATE),
    RegWrite::new(REG_CTRL2, CTRL2_SET_ONE_SHOT),
    RegWrite::new(REG_LPONT, LPONT_MIN_VALUE),
];

const CAPTURE_REQS_1: &[RegWrite] = &[
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::SPLIT,
    RegWrite::new(REG_EXCITCTRL, 0x40),
    RegWrite::new(REG_DETCTRL, DETCTRL_SDELAY_31_MS | DETCTRL_DRATE_CONTINUOUS),
    RegWrite::new(REG_COLSCAN, COLSCAN_SRATE_128_US),
    RegWrite::new(REG_DEMODPHASE2, 0x7c),
    RegWrite::new(REG_MEASDRV, MEASDRV_MEASURE_SQUARE | MEASDRV_MDRIVE_0_325),
    RegWrite::new(REG_DEMODPHASE1, 0x24),
    RegWrite::new(REG_CHWORD1, 0x00),
    RegWrite::new(REG_CHWORD2, 0x6c),
    RegWrite::new(REG_CHWORD3, 0x09),
    RegWrite::new(REG_CHWORD4, 0x54),
    RegWrite::new(REG_CHWORD5, 0x78),
    RegWrite::new(0xa2, 0x02),
    RegWrite::new(0xa7, 0x00),
    RegWrite::new(0xb6, 0x26),
    RegWrite::new(0xb7, 0x1a),
    RegWrite::new(REG_CTRL1, CTRL1_REG_UPDATE),
    RegWrite::new(
        REG_IMAGCTRL,
        IMAGCTRL_TST_REG_ENABLE | IMAGCTRL_HISTO_DATA_ENABLE | IMAGCTRL_IMG_DATA_DISABLE,
    ),
    RegWrite::new(REG_STRTCOL, 0x10),
    RegWrite::new(REG_ENDCOL, 0x1f),
    RegWrite::new(REG_CHANGAIN, CHANGAIN_STAGE1_2X | CHANGAIN_STAGE2_2X),
    RegWrite::new(REG_ADREFHI, 0x70),
    RegWrite::new(REG_ADREFLO, 0x20),
    RegWrite::new(REG_CTRL2, CTRL2_SET_ONE_SHOT),
    RegWrite::new(REG_LPONT, LPONT_MIN_VALUE),
];

const CAPTURE_REQS_2: &[RegWrite] = &[
    RegWrite::new(
        REG_IMAGCTRL,
        IMAGCTRL_TST_REG_ENABLE | IMAGCTRL_HISTO_DATA_ENABLE | IMAGCTRL_IMG_DATA_DISABLE,
    ),
    RegWrite::new(REG_STRTCOL, 0x10),
    RegWrite::new(REG_ENDCOL, 0x1f),
    RegWrite::new(REG_CHANGAIN, CHANGAIN_STAGE1_16X),
    RegWrite::new(REG_ADREFHI, 0x70),
    RegWrite::new(REG_ADREFLO, 0x20),
    RegWrite::new(REG_CTRL2, CTRL2_SET_ONE_SHOT),
];

const STRIP_SCAN_REQS: [RegWrite; 7] = [
    RegWrite::new(REG_IMAGCTRL, IMAGCTRL_TST_REG_ENABLE | IMAGCTRL_HISTO_DATA_ENABLE),
    RegWrite::new(REG_STRTCOL, 0x00),
    RegWrite::new(REG_ENDCOL, 0x2f),
    RegWrite::new(REG_CHANGAIN, CHANGAIN_STAGE1_16X),
    RegWrite::new(REG_ADREFHI, ADREFHI_MAX_VALUE),
    RegWrite::new(REG_ADREFLO, 0x20),
    RegWrite::new(REG_CTRL2, CTRL2_SET_ONE_SHOT),
];
const ADREFHI_SLOT: usize = 4;

const INIT_1: &[RegWrite] = &[
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::SPLIT,
    RegWrite::new(0xb0, 0x27),
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::new(REG_EXCITCTRL, 0x40),
    RegWrite::new(0xff, 0x00),
    RegWrite::new(0xff, 0x00),
    RegWrite::new(0xff, 0x00),
    RegWrite::new(0xff, 0x00),
    RegWrite::new(0xff, 0x00),
    RegWrite::new(0xff, 0x00),
    RegWrite::new(0xff, 0x00),
    RegWrite::new(0xff, 0x00),
    RegWrite::new(0xff, 0x00),
    RegWrite::new(0xff, 0x00),
    RegWrite::new(0xff, 0x00),
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::new(REG_EXCITCTRL, 0x40),
    RegWrite::new(REG_DETCTRL, DETCTRL_DRATE_CONTINUOUS | DETCTRL_SDELAY_31_MS),
    RegWrite::new(REG_COLSCAN, COLSCAN_SRATE_128_US),
    RegWrite::new(REG_MEASDRV, MEASDRV_MDRIVE_0_325 | MEASDRV_MEASURE_SQUARE),
    RegWrite::new(REG_MEASFREQ, MEASFREQ_2M),
    RegWrite::new(REG_DEMODPHASE1, DEMODPHASE_NONE),
    RegWrite::new(REG_DEMODPHASE2, DEMODPHASE_NONE),
    RegWrite::new(REG_CHANGAIN, CHANGAIN_STAGE2_4X | CHANGAIN_STAGE1_16X),
    RegWrite::new(REG_ADREFHI, 0x44),
    RegWrite::new(REG_ADREFLO, 0x34),
    RegWrite::new(REG_STRTCOL, 0x16),
    RegWrite::new(REG_ENDCOL, 0x16),
    RegWrite::new(REG_DATFMT, DATFMT_BIN_IMG | 0x08),
    RegWrite::new(REG_TREG1, 0x70),
    RegWrite::new(0xa2, 0x02),
    RegWrite::new(0xa7, 0x00),
    RegWrite::new(REG_TREGC, TREGC_ENABLE),
    RegWrite::new(REG_TREGD, 0x1a),
    RegWrite::new(REG_CTRL1, CTRL1_REG_UPDATE),
    RegWrite::new(REG_CTRL2, CTRL2_SET_ONE_SHOT),
    RegWrite::new(REG_LPONT, LPONT_MIN_VALUE),
];

const INIT_2: &[RegWrite] = &[
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::new(REG_EXCITCTRL, 0x40),
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::new(REG_AUTOCALOFFSET, 0x41),
    RegWrite::new(REG_EXCITCTRL, 0x42),
    RegWrite::new(REG_DETCTRL, 0x53),
    RegWrite::new(REG_CTRL1, CTRL1_REG_UPDATE),
];

const INIT_4: &[RegWrite] = &[
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::new(REG_EXCITCTRL, 0x40),
    RegWrite::new(0xb0, 0x27),
    RegWrite::new(REG_ENDROW, 0x0a),
    RegWrite::new(REG_CTRL1, CTRL1_REG_UPDATE),
    RegWrite::new(REG_DETCTRL, 0x45),
    RegWrite::new(REG_AUTOCALOFFSET, 0x41),
];

const INIT_5: &[RegWrite] = &[
    RegWrite::new(0xb0, 0x27),
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::new(REG_EXCITCTRL, 0x40),
    RegWrite::new(0xff, 0x00),
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::new(REG_EXCITCTRL, 0x40),
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::new(REG_EXCITCTRL, 0x40),
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::new(REG_EXCITCTRL, 0x40),
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::new(REG_EXCITCTRL, 0x40),
    RegWrite::new(REG_CTRL1, CTRL1_MASTER_RESET),
    RegWrite::new(REG_EXCITCTRL, 0x40),
    RegWrite::new(REG_CTRL1, CTRL1_SCAN_RESET),
    RegWrite::new(REG_CTRL1, CTRL1_SCAN_RESET),
];

const READ_REGS_REQ: &[RegWrite] = &[RegWrite::new(REG_CTRL2, CTRL2_READ_REGS)];

ssm_states! {
    enum ActivateState {
        WriteInit1,
        ReadData1,
        WriteInit2,
        RequestRegs,
        ReadRegs,
        // Repeats the init 4 script while the calibration value is pending
        WriteInit3,
        PollRegsAgain,
        WriteInit4,
        WriteInit5,
    }
}

ssm_states! {
    enum FingerDetState {
        WriteReqs,
        ReadHistogram,
    }
}

ssm_states! {
    enum CaptureState {
        WriteReqs1,
        ReadData1,
        WriteReqs2,
        ReadData2,
        RequestStrip,
        ReadStrip,
    }
}

/// Value of `target` from a register dump.
fn regval_from_dump(dump: &[u8], target: u8) -> Result<u8, FpError> {
    if dump.first() != Some(&FIRST_REG) {
        return Err(FpError::protocol("not a register dump"));
    }
    if !(FIRST_REG..=LAST_REG).contains(&target) {
        return Err(FpError::protocol("register out of dump range"));
    }
    let offset = (target - FIRST_REG) as usize * 2 + 1;
    dump.get(offset)
        .copied()
        .ok_or_else(|| FpError::protocol("register dump truncated"))
}

/// Sum of the little-endian histogram bins from `threshold` up.
fn sum_histogram_values(data: &[u8], threshold: u8) -> Result<u32, FpError> {
    if data.first() != Some(&0xde) {
        return Err(FpError::protocol("not a histogram"));
    }
    if threshold > 0x0f {
        return Err(FpError::protocol("histogram threshold out of range"));
    }
    let bins = data
        .get(1..33)
        .ok_or_else(|| FpError::protocol("histogram truncated"))?;
    Ok(bins
        .chunks_exact(2)
        .skip(threshold as usize)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as u32)
        .sum())
}

pub struct Aes2501 {
    regs: RegWriter,
    strip_scan_reqs: [RegWrite; 7],
    strips: Vec<Frame>,
    read_regs_retry_count: u8,
    no_finger_cnt: u32,
}

impl Aes2501 {
    pub fn new() -> Self {
        Self {
            regs: RegWriter::new(),
            strip_scan_reqs: STRIP_SCAN_REQS,
            strips: Vec::new(),
            read_regs_retry_count: 0,
            no_finger_cnt: 0,
        }
    }

    fn start_capture(&mut self) -> Ssm {
        self.no_finger_cnt = 0;
        self.strip_scan_reqs[ADREFHI_SLOT].value = ADREFHI_MAX_VALUE;
        Ssm::for_states::<CaptureState>(Phase::Capture)
    }

    fn regs_read(&mut self, regs: &[u8]) -> Step {
        debug!(reg_af = regs[0x5f], "Register dump");
        self.read_regs_retry_count += 1;
        if regs[0x5f] != 0x6b || self.read_regs_retry_count == READ_REGS_RETRIES {
            Step::jump(ActivateState::WriteInit4)
        } else {
            Step::Next
        }
    }

    fn finger_detected(&mut self, data: &[u8], host: &mut Host) -> Step {
        let sum: u32 = data[1..9]
            .iter()
            .map(|&b| (b & 0x0f) as u32 + (b >> 4) as u32)
            .sum();
        if sum > 20 {
            host.report_finger_status(true);
            Step::Complete
        } else {
            Step::jump(FingerDetState::WriteReqs)
        }
    }

    fn strip_read(&mut self, data: &[u8], host: &mut Host) -> Step {
        let dump_offset = 1 + STRIP_LEN + 1 + 16 * 2 + 1 + 8;
        let threshold = match regval_from_dump(&data[dump_offset..], REG_DATFMT) {
            Ok(v) => v,
            Err(e) => return Step::Abort(e),
        };
        let sum = match sum_histogram_values(&data[1 + STRIP_LEN..], threshold & 0x0f) {
            Ok(sum) => sum,
            Err(e) => return Step::Abort(e),
        };
        debug!(sum, "Strip histogram");

        let adrefhi = &mut self.strip_scan_reqs[ADREFHI_SLOT].value;
        if sum < SUM_LOW_THRESH {
            *adrefhi = adrefhi.saturating_sub(0x8).max(ADREFHI_MIN_VALUE);
        } else if sum > SUM_HIGH_THRESH {
            *adrefhi = adrefhi.saturating_add(0x8).min(ADREFHI_MAX_VALUE);
        }
        debug!(adrefhi = *adrefhi, "A/D reference");

        if sum == 0 {
            self.no_finger_cnt += 1;
            if self.no_finger_cnt == NO_FINGER_STRIPS {
                self.submit_image(host);
                host.report_finger_status(false);
                return Step::Complete;
            }
        } else {
            self.strips.push(Frame::new(data[1..1 + STRIP_LEN].to_vec()));
            self.no_finger_cnt = 0;
        }
        Step::jump(CaptureState::RequestStrip)
    }

    fn submit_image(&mut self, host: &mut Host) {
        let ctx =
            FrameAsmblCtx::new(FRAME_WIDTH, FRAME_HEIGHT, IMAGE_WIDTH, PixelFormat::AesPacked4);
        let mut strips = std::mem::take(&mut self.strips);
        do_movement_estimation(&ctx, &mut strips);
        match assemble_frames(&ctx, &strips) {
            Ok(img) => host.image_captured(img.with_flags(ImageFlags::PARTIAL)),
            Err(e) => host.session_error(e),
        }
    }
}

impl Default for Aes2501 {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageDriver for Aes2501 {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        self.read_regs_retry_count = 0;
        Ok(Ssm::for_states::<ActivateState>(Phase::Activate))
    }

    fn deactivate(&mut self, _host: &mut Host) -> Option<Ssm> {
        self.strips.clear();
        None
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::WriteRegs => self.regs.run_state(ssm),
            Phase::Activate => match ssm.state::<ActivateState>() {
                Some(ActivateState::WriteInit1) => self.regs.write(INIT_1),
                Some(ActivateState::ReadData1) => {
                    Step::Submit(Transfer::bulk_in(EP_IN, 20, BULK_TIMEOUT))
                }
                Some(ActivateState::WriteInit2) => self.regs.write(INIT_2),
                Some(ActivateState::RequestRegs) => self.regs.write(READ_REGS_REQ),
                Some(ActivateState::ReadRegs) => {
                    Step::Submit(Transfer::bulk_in(EP_IN, REG_DUMP_LEN, BULK_TIMEOUT))
                }
                Some(ActivateState::WriteInit3) | Some(ActivateState::WriteInit4) => {
                    self.regs.write(INIT_4)
                }
                Some(ActivateState::PollRegsAgain) => Step::jump(ActivateState::RequestRegs),
                Some(ActivateState::WriteInit5) => self.regs.write(INIT_5),
                None => Step::Abort(FpError::protocol("unknown activation state")),
            },
            Phase::FingerDetect => match ssm.state::<FingerDetState>() {
                Some(FingerDetState::WriteReqs) => {
                    if host.is_deactivating() {
                        Step::Complete
                    } else {
                        self.regs.write(FINGER_DET_REQS)
                    }
                }
                _ => Step::Submit(Transfer::bulk_in(EP_IN, 20, BULK_TIMEOUT)),
            },
            Phase::Capture => match ssm.state::<CaptureState>() {
                Some(CaptureState::WriteReqs1) => self.regs.write(CAPTURE_REQS_1),
                Some(CaptureState::WriteReqs2) => self.regs.write(CAPTURE_REQS_2),
                Some(CaptureState::ReadData1) | Some(CaptureState::ReadData2) => {
                    Step::Submit(Transfer::bulk_in(EP_IN, 159, BULK_TIMEOUT))
                }
                Some(CaptureState::RequestStrip) => {
                    if host.is_deactivating() {
                        Step::Complete
                    } else {
                        self.regs.write(&self.strip_scan_reqs)
                    }
                }
                Some(CaptureState::ReadStrip) => {
                    Step::Submit(Transfer::bulk_in(EP_IN, STRIP_READ_LEN, BULK_TIMEOUT))
                }
                None => Step::Abort(FpError::protocol("unknown capture state")),
            },
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        if ssm.phase() == Phase::WriteRegs {
            return self.regs.transfer_done(&completion);
        }
        let data = match completion.check_full() {
            Ok(data) => data,
            Err(e) => return Step::Abort(e),
        };
        match (ssm.phase(), ssm.cur_state()) {
            (Phase::Activate, s) if s == ActivateState::ReadRegs.index() => self.regs_read(data),
            (Phase::FingerDetect, s) if s == FingerDetState::ReadHistogram.index() => {
                self.finger_detected(data, host)
            }
            (Phase::Capture, s) if s == CaptureState::ReadStrip.index() => {
                self.strip_read(data, host)
            }
            _ => check_transfer(&completion),
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let result = ssm.into_result();
        if phase == Phase::Activate {
            let ok = result.is_ok();
            host.activate_complete(result);
            return ok.then(|| Ssm::for_states::<FingerDetState>(Phase::FingerDetect));
        }

        if host.is_deactivating() {
            self.strips.clear();
            return None;
        }
        if let Err(e) = result {
            host.session_error(e);
            return None;
        }
        match phase {
            Phase::FingerDetect => Some(self.start_capture()),
            _ => Some(Ssm::for_states::<FingerDetState>(Phase::FingerDetect)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_with_sum(sum: u16) -> Vec<u8> {
        let mut data = vec![0u8; STRIP_READ_LEN];
        for (i, b) in data[1..1 + STRIP_LEN].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let hist = 1 + STRIP_LEN;
        data[hist] = 0xde;
        // Everything in the top bin
        data[hist + 1 + 15 * 2..hist + 1 + 16 * 2].copy_from_slice(&sum.to_le_bytes());
        let dump = 1 + STRIP_LEN + 1 + 32 + 1 + 8;
        data[dump] = FIRST_REG;
        data[dump + (REG_DATFMT - FIRST_REG) as usize * 2 + 1] = 0x08;
        data
    }

    #[test]
    fn test_regval_from_dump() {
        let mut dump = vec![0u8; REG_DUMP_LEN];
        dump[0] = FIRST_REG;
        dump[(REG_DATFMT - FIRST_REG) as usize * 2 + 1] = 0x18;
        assert_eq!(regval_from_dump(&dump, REG_DATFMT), Ok(0x18));
        assert!(regval_from_dump(&dump, 0x70).is_err());
        dump[0] = 0;
        assert!(regval_from_dump(&dump, REG_DATFMT).is_err());
    }

    #[test]
    fn test_histogram_sum_from_threshold() {
        let data = strip_with_sum(900);
        let hist = &data[1 + STRIP_LEN..];
        assert_eq!(sum_histogram_values(hist, 8), Ok(900));
        assert!(sum_histogram_values(&[0x00; 33], 0).is_err());
        assert!(sum_histogram_values(hist, 16).is_err());
    }

    #[test]
    fn test_adrefhi_follows_histogram() {
        use crate::events::RecordingObserver;
        use std::sync::Arc;

        let mut host = Host::for_tests(&INFO, Arc::new(RecordingObserver::new()));
        let mut drv = Aes2501::new();
        drv.start_capture();

        drv.strip_read(&strip_with_sum(10), &mut host);
        assert_eq!(drv.strip_scan_reqs[ADREFHI_SLOT].value, ADREFHI_MAX_VALUE - 8);
        drv.strip_read(&strip_with_sum(2000), &mut host);
        assert_eq!(drv.strip_scan_reqs[ADREFHI_SLOT].value, ADREFHI_MAX_VALUE);
        assert_eq!(drv.strips.len(), 2);
    }

    #[test]
    fn test_three_empty_strips_submit_image() {
        use crate::events::RecordingObserver;
        use crate::imgdev::AcquireState;
        use std::sync::Arc;

        let obs = Arc::new(RecordingObserver::new());
        let mut host = Host::for_tests(&INFO, obs.clone());
        host.force_state(AcquireState::AwaitImage);
        let mut drv = Aes2501::new();
        drv.start_capture();

        for _ in 0..4 {
            assert!(matches!(drv.strip_read(&strip_with_sum(900), &mut host), Step::Jump(_)));
        }
        assert!(matches!(drv.strip_read(&strip_with_sum(0), &mut host), Step::Jump(_)));
        assert!(matches!(drv.strip_read(&strip_with_sum(0), &mut host), Step::Jump(_)));
        assert!(matches!(drv.strip_read(&strip_with_sum(0), &mut host), Step::Complete));

        let images = obs.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].width, IMAGE_WIDTH);
        assert_eq!(images[0].flags, ImageFlags::PARTIAL);
        assert!(drv.strips.is_empty());
        assert_eq!(obs.count("report_finger_status"), 1);
    }
}
