//! AuthenTec AES2550 / AES2810 swipe sensor.
//!
//! Unlike the older AuthenTec parts this one reports strip displacement
//! itself, so strips are assembled with the deltas found in their
//! headers. Commands are raw byte sequences mixing register pairs and
//! single-byte opcodes.

use tracing::debug;

use super::aeslib::{BULK_TIMEOUT, EP_IN, EP_OUT, check_transfer};
use crate::assembling::{Frame, FrameAsmblCtx, PixelFormat, assemble_frames};
use crate::error::FpError;
use crate::image::ImageFlags;
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, SsmState, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const FRAME_WIDTH: usize = 192;
const FRAME_HEIGHT: usize = 8;
const IMAGE_WIDTH: usize = FRAME_WIDTH + FRAME_WIDTH / 2;

const REG80_MASTER_RESET: u8 = 1 << 0;
const REG80_FORCE_FINGER_PRESENT: u8 = 1 << 1;
const REG80_HGC_ENABLE: u8 = 1 << 3;
const REG80_SENSOR_MODE_OFS: u8 = 4;
const REG81_NSHOT: u8 = 1 << 2;
const REG83_FINGER_PRESENT: u8 = 1 << 7;
const REG85_FLUSH_PER_FRAME: u8 = 1 << 7;
const REG8F_AUTH_DISABLE: u8 = 1 << 2;
const REG8F_EHISTO_DISABLE: u8 = 1 << 3;
const REG95_COL_SCANNED_OFS: u8 = 0;
const REG95_EPIX_AVG_OFS: u8 = 4;
const REGA8_DIG_BIT_EN: u8 = 1 << 4;
const REGBF_RSR_LEVEL_SUPER_RSR: u8 = 3;
const REGBF_RSR_DIR_UPDOWN_MOTION: u8 = 2 << 2;
const REGCF_INTERFERENCE_CHK_EN: u8 = 1 << 0;
const REGCF_INTERFERENCE_AVG_EN: u8 = 1 << 1;
const REGCF_INTERFERENCE_AVG_OFFS: u8 = 4;
const REGDC_BP_NUM_REF_SWEEP_OFS: u8 = 0;

const CMD_SET_IDLE_MODE: u8 = 0x00;
const CMD_RUN_FD: u8 = 0x01;
const CMD_GET_ENROLL_IMG: u8 = 0x02;
const CMD_CALIBRATE: u8 = 0x06;
const CMD_READ_CALIBRATION_DATA: u8 = 0x10;
const CMD_HEARTBEAT: u8 = 0x70;

const STRIP_SIZE: usize = 0x31e + 3;
const HEARTBEAT_SIZE: usize = 4 + 3;
const EDATA_MAGIC: u8 = 0xe0;
const HEARTBEAT_MAGIC: u8 = 0xdb;
const EP_IN_BUF_SIZE: usize = 8192;
const STRIP_DATA_OFFSET: usize = 33;

/// Heartbeats without a strip before the finger counts as gone.
const FINGER_OFF_HEARTBEATS: u32 = 3;

pub static INFO: DriverInfo = DriverInfo {
    name: "aes2550",
    full_name: "AuthenTec AES2550/AES2810",
    id_table: &[(0x08ff, 0x2550), (0x08ff, 0x2810)],
    img_width: Some(IMAGE_WIDTH),
    img_height: None,
    bz3_threshold: None,
    interface: 0,
};

const FINGER_DET_REQS: &[u8] = &[
    0x80, REG80_MASTER_RESET,
    0x95, (8 << REG95_COL_SCANNED_OFS) | (1 << REG95_EPIX_AVG_OFS),
    0xad, 0x00,
    0xbd, 0x00,
    0xbe, 0x00,
    0xcf, REGCF_INTERFERENCE_CHK_EN,
    CMD_HEARTBEAT, 0x00, 0x01, 0x00, // heartbeat off
    CMD_RUN_FD,
];

const CAPTURE_REQS: &[u8] = &[
    0x80, REG80_MASTER_RESET,
    0x80, (1 << REG80_SENSOR_MODE_OFS) | REG80_HGC_ENABLE,
    0x85, REG85_FLUSH_PER_FRAME,
    0x8f, REG8F_AUTH_DISABLE | REG8F_EHISTO_DISABLE,
    0xbf, REGBF_RSR_DIR_UPDOWN_MOTION | REGBF_RSR_LEVEL_SUPER_RSR,
    0xcf, (3 << REGCF_INTERFERENCE_AVG_OFFS) | REGCF_INTERFERENCE_AVG_EN,
    0xdc, 1 << REGDC_BP_NUM_REF_SWEEP_OFS,
    CMD_HEARTBEAT, 0x00, 0x01, 0x03, // 3 * 16 cycles without an image
    CMD_GET_ENROLL_IMG,
];

const CAPTURE_SET_IDLE_REQS: &[u8] = &[
    0x80, REG80_MASTER_RESET,
    CMD_HEARTBEAT, 0x00, 0x01, 0x00,
    CMD_SET_IDLE_MODE,
];

const INIT_REQS: &[u8] = &[
    0x80, REG80_MASTER_RESET,
    0x80, (1 << REG80_SENSOR_MODE_OFS) | REG80_FORCE_FINGER_PRESENT,
    0x85, REG85_FLUSH_PER_FRAME,
    0xa8, REGA8_DIG_BIT_EN,
    0x81, REG81_NSHOT,
];

const CALIBRATE_REQS: &[u8] = &[
    0x80, REG80_MASTER_RESET,
    CMD_CALIBRATE,
    CMD_READ_CALIBRATION_DATA,
];

ssm_states! {
    enum ActivateState {
        WriteInit,
        ReadData,
        Calibrate,
        ReadCalibTable,
    }
}

ssm_states! {
    enum FingerDetState {
        WriteReqs,
        ReadData,
    }
}

ssm_states! {
    enum CaptureState {
        WriteReqs,
        ReadData,
        SetIdle,
    }
}

fn write(data: &'static [u8]) -> Step {
    Step::Submit(Transfer::bulk_out(EP_OUT, data, BULK_TIMEOUT))
}

fn read() -> Step {
    Step::Submit(Transfer::bulk_in(EP_IN, EP_IN_BUF_SIZE, BULK_TIMEOUT))
}

/// Strip with the displacement the sensor reported for it.
fn parse_strip(data: &[u8]) -> Result<Frame, FpError> {
    if data[0] != EDATA_MAGIC {
        return Err(FpError::protocol(format!("bogus strip magic {:#04x}", data[0])));
    }
    let len = u16::from_be_bytes([data[1], data[2]]) as usize;
    if len != STRIP_SIZE - 3 {
        debug!(len, "Bogus frame length");
    }
    let delta_x = data[6] as i8 as i32;
    let delta_y = -(data[7] as i8 as i32);
    let packed = FRAME_WIDTH * FRAME_HEIGHT / 2;
    let pixels = data[STRIP_DATA_OFFSET..STRIP_DATA_OFFSET + packed].to_vec();
    debug!(delta_x, delta_y, "Strip deltas");
    Ok(Frame::with_delta(pixels, delta_x, delta_y))
}

#[derive(Default)]
pub struct Aes2550 {
    strips: Vec<Frame>,
    heartbeat_cnt: u32,
}

impl Aes2550 {
    pub fn new() -> Self {
        Self::default()
    }

    fn finger_detected(&self, data: &[u8], host: &mut Host) -> Step {
        // Two bytes: register 0x83 and its value
        if data.len() >= 2 && data[0] == 0x83 && data[1] & REG83_FINGER_PRESENT != 0 {
            host.report_finger_status(true);
            Step::Complete
        } else {
            Step::jump(FingerDetState::WriteReqs)
        }
    }

    fn capture_read(&mut self, data: &[u8]) -> Step {
        match data.len() {
            STRIP_SIZE => match parse_strip(data) {
                Ok(frame) => {
                    self.strips.push(frame);
                    self.heartbeat_cnt = 0;
                    Step::jump(CaptureState::ReadData)
                }
                Err(e) => Step::Abort(e),
            },
            HEARTBEAT_SIZE if data[0] == HEARTBEAT_MAGIC => {
                self.heartbeat_cnt += 1;
                if self.heartbeat_cnt == FINGER_OFF_HEARTBEATS {
                    debug!("Got 3 heartbeats, finger removed");
                    Step::Next
                } else {
                    Step::jump(CaptureState::ReadData)
                }
            }
            len => {
                debug!(len, "Short frame, skipping");
                Step::jump(CaptureState::ReadData)
            }
        }
    }

    fn submit_image(&mut self, host: &mut Host) {
        let ctx = FrameAsmblCtx::new(FRAME_WIDTH, FRAME_HEIGHT, IMAGE_WIDTH, PixelFormat::AesPacked4);
        let strips = std::mem::take(&mut self.strips);
        match assemble_frames(&ctx, &strips) {
            Ok(img) => host.image_captured(img.with_flags(ImageFlags::PARTIAL)),
            Err(e) => host.session_error(e),
        }
        host.report_finger_status(false);
    }
}

impl ImageDriver for Aes2550 {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        Ok(Ssm::for_states::<ActivateState>(Phase::Activate))
    }

    fn deactivate(&mut self, _host: &mut Host) -> Option<Ssm> {
        self.strips.clear();
        None
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Activate => match ssm.state::<ActivateState>() {
                Some(ActivateState::WriteInit) => write(INIT_REQS),
                Some(ActivateState::Calibrate) => write(CALIBRATE_REQS),
                _ => read(),
            },
            Phase::FingerDetect => match ssm.state::<FingerDetState>() {
                Some(FingerDetState::WriteReqs) if host.is_deactivating() => Step::Complete,
                Some(FingerDetState::WriteReqs) => write(FINGER_DET_REQS),
                _ => read(),
            },
            Phase::Capture => match ssm.state::<CaptureState>() {
                Some(CaptureState::WriteReqs) => {
                    self.heartbeat_cnt = 0;
                    write(CAPTURE_REQS)
                }
                Some(CaptureState::ReadData) if host.is_deactivating() => Step::Complete,
                Some(CaptureState::ReadData) => read(),
                _ => write(CAPTURE_SET_IDLE_REQS),
            },
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        match (ssm.phase(), ssm.cur_state()) {
            // Reads are sized to the buffer, so only the status matters
            (Phase::Activate, s)
                if s == ActivateState::ReadData.index()
                    || s == ActivateState::ReadCalibTable.index() =>
            {
                Step::from_result(completion.check_status())
            }
            (Phase::FingerDetect, s) if s == FingerDetState::ReadData.index() => {
                match completion.check_status() {
                    Ok(()) => self.finger_detected(&completion.data, host),
                    Err(e) => Step::Abort(e),
                }
            }
            (Phase::Capture, s) if s == CaptureState::ReadData.index() => {
                match completion.check_status() {
                    Ok(()) => self.capture_read(&completion.data),
                    Err(e) => Step::Abort(e),
                }
            }
            (Phase::Capture, s) if s == CaptureState::SetIdle.index() => {
                if let Err(e) = completion.check_full() {
                    return Step::Abort(e);
                }
                self.submit_image(host);
                Step::Complete
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
            Phase::FingerDetect => Some(Ssm::for_states::<CaptureState>(Phase::Capture)),
            _ => Some(Ssm::for_states::<FingerDetState>(Phase::FingerDetect)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::DriverConfig;
    use crate::drivers::DriverKind;
    use crate::events::{FpEvent, RecordingObserver};
    use crate::imgdev::ImgDev;
    use crate::transport::MockTransport;

    fn pump(dev: &mut ImgDev<MockTransport>) {
        while dev.handle_events(Duration::ZERO).unwrap() {}
    }

    fn strip(fill: u8, dy: i8) -> Vec<u8> {
        let mut data = vec![fill; STRIP_SIZE];
        data[0] = EDATA_MAGIC;
        data[1] = 0x03;
        data[2] = 0x1e;
        data[6] = 0;
        data[7] = (-dy) as u8;
        data
    }

    fn heartbeat() -> Vec<u8> {
        let mut data = vec![0u8; HEARTBEAT_SIZE];
        data[0] = HEARTBEAT_MAGIC;
        data
    }

    fn active() -> (ImgDev<MockTransport>, MockTransport, Arc<RecordingObserver>) {
        let mock = MockTransport::with_ids(0x08ff, 0x2810);
        let obs = Arc::new(RecordingObserver::new());
        let mut dev =
            ImgDev::open_with_transport(mock.clone(), &DriverConfig::default(), obs.clone())
                .unwrap();
        assert_eq!(dev.info().name, "aes2550");
        dev.activate().unwrap();
        mock.queue_read(&[0x00]);
        mock.queue_read(&[0x00; 32]);
        pump(&mut dev);
        assert_eq!(obs.count("activate_complete"), 1);
        (dev, mock, obs)
    }

    #[test]
    fn test_strip_header_deltas() {
        let frame = parse_strip(&strip(0x11, 4)).unwrap();
        assert_eq!(frame.delta_y, 4);
        assert_eq!(frame.delta_x, 0);
        assert_eq!(frame.data.len(), FRAME_WIDTH * FRAME_HEIGHT / 2);

        let mut bad = strip(0, 1);
        bad[0] = 0x00;
        assert!(matches!(parse_strip(&bad), Err(FpError::Protocol(_))));
    }

    #[test]
    fn test_no_finger_polls_again() {
        let (mut dev, mock, obs) = active();
        mock.clear_writes();
        mock.queue_read(&[0x83, 0x00]);
        pump(&mut dev);
        assert_eq!(obs.count("report_finger_status"), 0);
        // Only the re-armed detection script went out
        let writes = mock.get_writes();
        assert_eq!(writes, vec![FINGER_DET_REQS.to_vec()]);
    }

    #[test]
    fn test_capture_until_heartbeats() {
        let (mut dev, mock, obs) = active();
        mock.queue_read(&[0x83, REG83_FINGER_PRESENT]);
        pump(&mut dev);
        assert_eq!(obs.events().last(), Some(&FpEvent::FingerStatus { present: true }));

        mock.queue_read(&strip(0x12, 0));
        mock.queue_read(&strip(0x34, 4));
        mock.queue_read(&[0x01, 0x02, 0x03]);
        mock.queue_read(&heartbeat());
        mock.queue_read(&strip(0x56, 4));
        mock.queue_read(&heartbeat());
        mock.queue_read(&heartbeat());
        pump(&mut dev);
        // The counter restarted after the third strip
        assert!(obs.images().is_empty());

        mock.queue_read(&heartbeat());
        pump(&mut dev);
        let images = obs.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].width, IMAGE_WIDTH);
        assert_eq!(images[0].height, FRAME_HEIGHT + 8);
        assert_eq!(images[0].flags, ImageFlags::PARTIAL);
        assert!(mock.get_writes().contains(&CAPTURE_SET_IDLE_REQS.to_vec()));
        assert_eq!(obs.count("report_finger_status"), 2);
    }

    #[test]
    fn test_heartbeats_without_strips_abort_scan() {
        let (mut dev, mock, obs) = active();
        mock.queue_read(&[0x83, REG83_FINGER_PRESENT]);
        for _ in 0..FINGER_OFF_HEARTBEATS {
            mock.queue_read(&heartbeat());
        }
        pump(&mut dev);
        assert!(obs.images().is_empty());
        assert_eq!(obs.count("abort_scan"), 1);
        assert_eq!(obs.count("session_error"), 0);
    }

    #[test]
    fn test_bad_magic_is_session_error() {
        let (mut dev, mock, obs) = active();
        mock.queue_read(&[0x83, REG83_FINGER_PRESENT]);
        let mut bad = strip(0, 0);
        bad[0] = 0x42;
        mock.queue_read(&bad);
        pump(&mut dev);
        assert_eq!(obs.count("session_error"), 1);
        assert!(dev.is_idle());
    }
}
