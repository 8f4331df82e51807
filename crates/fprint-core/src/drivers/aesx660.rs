//! AuthenTec AES1660 and AES2660 swipe sensors.
//!
//! Both parts speak the same bulk protocol: every answer starts with a
//! 3-byte header (type, little-endian payload size) and image strips may
//! straddle transfer boundaries. The two init sequences and the start
//! imaging command differ per part and come from [`AesX660Config`].

use tracing::debug;

use super::aeslib::{BULK_TIMEOUT, EP_IN, EP_OUT, check_transfer};
use crate::assembling::{Frame, FrameAsmblCtx, PixelFormat, assemble_frames};
use crate::config::AesX660Config;
use crate::error::FpError;
use crate::image::ImageFlags;
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, SsmState, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const HEADER_SIZE: usize = 3;
const RESPONSE_TYPE_OFFSET: usize = 0x00;
const RESPONSE_SIZE_LSB_OFFSET: usize = 0x01;
const RESPONSE_SIZE_MSB_OFFSET: usize = 0x02;
const CALIBRATE_RESPONSE: u8 = 0x06;
const FINGER_DET_RESPONSE: u8 = 0x40;
const FINGER_PRESENT_OFFSET: usize = 0x03;
const FINGER_PRESENT: u8 = 0x01;
const IMAGE_OK_OFFSET: usize = 0x03;
const IMAGE_OK: u8 = 0x0d;
const LAST_FRAME_OFFSET: usize = 0x04;
const LAST_FRAME_BIT: u8 = 0x01;
const FRAME_DELTA_X_OFFSET: usize = 16;
const FRAME_DELTA_Y_OFFSET: usize = 17;
const IMAGE_OFFSET: usize = 43;
const BULK_TRANSFER_SIZE: usize = 4096;
const FRAME_HEIGHT: usize = 8;

const READ_ID_RESPONSE: u8 = 0x07;
const INIT_RESPONSE: u8 = 0x42;

const AES1660_FRAME_WIDTH: usize = 128;
const AES2660_FRAME_WIDTH: usize = 192;

pub static AES1660_INFO: DriverInfo = DriverInfo {
    name: "aes1660",
    full_name: "AuthenTec AES1660",
    id_table: &[
        (0x08ff, 0x1660),
        (0x08ff, 0x1680),
        (0x08ff, 0x1681),
        (0x08ff, 0x1682),
        (0x08ff, 0x1683),
        (0x08ff, 0x1684),
        (0x08ff, 0x1685),
        (0x08ff, 0x1686),
        (0x08ff, 0x1687),
        (0x08ff, 0x1688),
        (0x08ff, 0x1689),
        (0x08ff, 0x168a),
        (0x08ff, 0x168b),
        (0x08ff, 0x168c),
        (0x08ff, 0x168d),
        (0x08ff, 0x168e),
        (0x08ff, 0x168f),
    ],
    img_width: Some(AES1660_FRAME_WIDTH + AES1660_FRAME_WIDTH / 2),
    img_height: None,
    bz3_threshold: Some(20),
    interface: 0,
};

pub static AES2660_INFO: DriverInfo = DriverInfo {
    name: "aes2660",
    full_name: "AuthenTec AES2660",
    id_table: &[
        (0x08ff, 0x2660),
        (0x08ff, 0x2680),
        (0x08ff, 0x2681),
        (0x08ff, 0x2682),
        (0x08ff, 0x2683),
        (0x08ff, 0x2684),
        (0x08ff, 0x2685),
        (0x08ff, 0x2686),
        (0x08ff, 0x2687),
        (0x08ff, 0x2688),
        (0x08ff, 0x2689),
        (0x08ff, 0x268a),
        (0x08ff, 0x268b),
        (0x08ff, 0x268c),
        (0x08ff, 0x268d),
        (0x08ff, 0x268e),
        (0x08ff, 0x268f),
        (0x08ff, 0x2691),
    ],
    img_width: Some(AES2660_FRAME_WIDTH + AES2660_FRAME_WIDTH / 2),
    img_height: None,
    bz3_threshold: None,
    interface: 0,
};

/// LED blinking while waiting for a finger.
const LED_BLINK_CMD: &[u8] = &[
    0x77, 0x18, 0x00, 0x00, 0x3f, 0x00, 0xff, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0xf3, 0x01,
    0x00, 0x00, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0xf3, 0x01, 0x00, 0x7f,
];

/// LED solid while capturing.
const LED_SOLID_CMD: &[u8] = &[
    0x77, 0x18, 0x00, 0x00, 0x3f, 0x00, 0xff, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0xe7, 0x03,
    0x00, 0x00, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x7f,
];

const WAIT_FOR_FINGER_CMD: &[u8] = &[0x20, 0x40, 0x04, 0x00, 0x02, 0x1e, 0x00, 0x32];

const SET_IDLE_CMD: &[u8] = &[0x0d];

/// Read ID; the answer is at most 8 bytes.
const READ_ID_CMD: &[u8] = &[0x44, 0x02, 0x00, 0x08, 0x00, 0x07];

const CALIBRATE_CMD: &[u8] = &[0x44, 0x02, 0x00, 0x04, 0x00, 0x06];

ssm_states! {
    enum ActivateState {
        SetIdle,
        SendReadIdCmd,
        ReadId,
        SendCalibrateCmd,
        ReadCalibrateData,
        SendInitCmd,
        ReadInitResponse,
    }
}

ssm_states! {
    enum FingerDetState {
        SendLedCmd,
        SendFdCmd,
        ReadFdData,
        SetIdle,
    }
}

ssm_states! {
    enum CaptureState {
        SendLedCmd,
        SendCaptureCmd,
        ReadStripeData,
        SetIdle,
    }
}

fn send(cmd: &[u8]) -> Step {
    Step::Submit(Transfer::bulk_out(EP_OUT, cmd, BULK_TIMEOUT))
}

fn read(len: usize) -> Step {
    Step::Submit(Transfer::bulk_in(EP_IN, len, BULK_TIMEOUT))
}

/// Reassembles length-prefixed responses out of a byte stream.
#[derive(Debug)]
struct ResponseBuffer {
    buf: Vec<u8>,
    want: usize,
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            want: HEADER_SIZE,
        }
    }
}

impl ResponseBuffer {
    fn reset(&mut self) {
        self.buf.clear();
        self.want = HEADER_SIZE;
    }

    /// Append `data`; returns every response it completed.
    fn feed(&mut self, mut data: &[u8]) -> Vec<Vec<u8>> {
        let mut done = Vec::new();
        while !data.is_empty() {
            let take = (self.want - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() < self.want {
                break;
            }
            if self.want == HEADER_SIZE {
                let size = u16::from_le_bytes([
                    self.buf[RESPONSE_SIZE_LSB_OFFSET],
                    self.buf[RESPONSE_SIZE_MSB_OFFSET],
                ]) as usize;
                debug!(kind = self.buf[RESPONSE_TYPE_OFFSET], size, "Got response header");
                if size > 0 {
                    self.want = HEADER_SIZE + size;
                    continue;
                }
            }
            done.push(std::mem::take(&mut self.buf));
            self.want = HEADER_SIZE;
        }
        done
    }
}

pub struct AesX660 {
    info: &'static DriverInfo,
    frame_width: usize,
    init_seqs: [Vec<Vec<u8>>; 2],
    start_imaging_cmd: Vec<u8>,
    init_seq_idx: usize,
    init_cmd_idx: usize,
    responses: ResponseBuffer,
    strips: Vec<Frame>,
}

impl AesX660 {
    pub fn aes1660(config: &AesX660Config) -> Result<Self, FpError> {
        Self::new(&AES1660_INFO, AES1660_FRAME_WIDTH, config)
    }

    pub fn aes2660(config: &AesX660Config) -> Result<Self, FpError> {
        Self::new(&AES2660_INFO, AES2660_FRAME_WIDTH, config)
    }

    fn new(
        info: &'static DriverInfo,
        frame_width: usize,
        config: &AesX660Config,
    ) -> Result<Self, FpError> {
        if config.init_1.is_empty() || config.init_2.is_empty() {
            return Err(FpError::Config(format!("{}: init sequences missing", info.name)));
        }
        if config.start_imaging_cmd.is_empty() {
            return Err(FpError::Config(format!("{}: start imaging command missing", info.name)));
        }
        Ok(Self {
            info,
            frame_width,
            init_seqs: [config.init_1.clone(), config.init_2.clone()],
            start_imaging_cmd: config.start_imaging_cmd.clone(),
            init_seq_idx: 0,
            init_cmd_idx: 0,
            responses: ResponseBuffer::default(),
            strips: Vec::new(),
        })
    }

    fn asmbl_ctx(&self) -> FrameAsmblCtx {
        FrameAsmblCtx::new(
            self.frame_width,
            FRAME_HEIGHT,
            self.frame_width + self.frame_width / 2,
            PixelFormat::AesPacked4,
        )
    }

    fn current_init_cmd(&self) -> Option<&[u8]> {
        let seq = self.init_seqs.get(self.init_seq_idx.checked_sub(1)?)?;
        seq.get(self.init_cmd_idx).map(Vec::as_slice)
    }

    fn read_id(&mut self, data: &[u8]) -> Step {
        if data[0] != READ_ID_RESPONSE {
            return Step::Abort(FpError::protocol(format!(
                "bogus read ID response {:#04x}",
                data[RESPONSE_TYPE_OFFSET]
            )));
        }
        debug!(
            id = %format!("{:02x}{:02x}", data[4], data[3]),
            bcd = %format!("{:02x}.{:02x}", data[5], data[6]),
            status = data[7],
            "Sensor identified"
        );
        match self.init_seq_idx {
            0 => {
                self.init_seq_idx = 1;
                self.init_cmd_idx = 0;
                // Calibration only follows the second sequence
                Step::jump(ActivateState::SendInitCmd)
            }
            1 => {
                self.init_seq_idx = 2;
                self.init_cmd_idx = 0;
                Step::Next
            }
            _ => Step::Abort(FpError::protocol(format!(
                "failed to init device, status {:#04x}",
                data[7]
            ))),
        }
    }

    fn init_response(&mut self, data: &[u8]) -> Step {
        if data[0] != INIT_RESPONSE || data[3] != 0x01 {
            return Step::Abort(FpError::protocol(format!(
                "bogus init response {:02x} {:02x}",
                data[0], data[3]
            )));
        }
        self.init_cmd_idx += 1;
        let seq_len = self.init_seqs[self.init_seq_idx - 1].len();
        if self.init_cmd_idx < seq_len {
            Step::jump(ActivateState::SendInitCmd)
        } else if self.init_seq_idx < 2 {
            Step::jump(ActivateState::SendReadIdCmd)
        } else {
            Step::Complete
        }
    }

    /// Keep the strip carried by one response. Returns whether the sensor
    /// flagged it as the last one.
    fn process_stripe(&mut self, resp: &[u8]) -> Result<bool, FpError> {
        let packed = self.frame_width * FRAME_HEIGHT / 2;
        if resp.len() <= LAST_FRAME_OFFSET {
            debug!(len = resp.len(), "Skipping short response");
            return Ok(false);
        }
        debug!(ok = resp[IMAGE_OK_OFFSET], last = resp[LAST_FRAME_OFFSET], "Processing frame");
        if resp[IMAGE_OK_OFFSET] != IMAGE_OK {
            return Ok(false);
        }
        if resp.len() < IMAGE_OFFSET + packed {
            return Err(FpError::protocol(format!("truncated strip of {} bytes", resp.len())));
        }
        let delta_x = resp[FRAME_DELTA_X_OFFSET] as i8 as i32;
        let delta_y = -(resp[FRAME_DELTA_Y_OFFSET] as i8 as i32);
        self.strips.push(Frame::with_delta(
            resp[IMAGE_OFFSET..IMAGE_OFFSET + packed].to_vec(),
            delta_x,
            delta_y,
        ));
        Ok(resp[LAST_FRAME_OFFSET] & LAST_FRAME_BIT != 0)
    }

    fn stripe_data(&mut self, data: &[u8]) -> Step {
        debug!(len = data.len(), "Got stripe data");
        let mut last = false;
        for resp in self.responses.feed(data) {
            match self.process_stripe(&resp) {
                Ok(flag) => last |= flag,
                Err(e) => return Step::Abort(e),
            }
        }
        if last {
            Step::Next
        } else {
            Step::jump(CaptureState::ReadStripeData)
        }
    }

    fn submit_image(&mut self, host: &mut Host) {
        let ctx = self.asmbl_ctx();
        let strips = std::mem::take(&mut self.strips);
        debug!(frames = strips.len(), "Assembling capture");
        match assemble_frames(&ctx, &strips) {
            Ok(img) => host.image_captured(img.with_flags(ImageFlags::PARTIAL)),
            Err(e) => host.session_error(e),
        }
        host.report_finger_status(false);
    }
}

impl ImageDriver for AesX660 {
    fn info(&self) -> &'static DriverInfo {
        self.info
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        Ok(Ssm::for_states::<ActivateState>(Phase::Activate))
    }

    fn deactivate(&mut self, _host: &mut Host) -> Option<Ssm> {
        self.strips.clear();
        None
    }

    fn run_state(&mut self, ssm: &Ssm, _host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Activate => match ssm.state::<ActivateState>() {
                Some(ActivateState::SetIdle) => {
                    self.init_seq_idx = 0;
                    send(SET_IDLE_CMD)
                }
                Some(ActivateState::SendReadIdCmd) => send(READ_ID_CMD),
                Some(ActivateState::ReadId) => read(8),
                Some(ActivateState::SendCalibrateCmd) => send(CALIBRATE_CMD),
                Some(ActivateState::ReadCalibrateData) => read(4),
                Some(ActivateState::SendInitCmd) => {
                    debug!(seq = self.init_seq_idx, cmd = self.init_cmd_idx, "Sending init command");
                    match self.current_init_cmd() {
                        Some(cmd) => send(cmd),
                        None => Step::Abort(FpError::protocol("init command out of range")),
                    }
                }
                Some(ActivateState::ReadInitResponse) => read(4),
                None => Step::Abort(FpError::protocol("unknown activate state")),
            },
            Phase::FingerDetect => match ssm.state::<FingerDetState>() {
                Some(FingerDetState::SendLedCmd) => send(LED_BLINK_CMD),
                // The device only answers once a finger shows up
                Some(FingerDetState::SendFdCmd) => {
                    Step::Submit(Transfer::bulk_out(EP_OUT, WAIT_FOR_FINGER_CMD, 0))
                }
                Some(FingerDetState::ReadFdData) => read(4),
                _ => send(SET_IDLE_CMD),
            },
            Phase::Capture => match ssm.state::<CaptureState>() {
                Some(CaptureState::SendLedCmd) => send(LED_SOLID_CMD),
                Some(CaptureState::SendCaptureCmd) => {
                    self.responses.reset();
                    send(&self.start_imaging_cmd)
                }
                Some(CaptureState::ReadStripeData) => read(BULK_TRANSFER_SIZE),
                _ => {
                    debug!(frames = self.strips.len(), "Capture finished");
                    send(SET_IDLE_CMD)
                }
            },
            Phase::Deactivate => send(SET_IDLE_CMD),
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        let state = ssm.cur_state();
        match ssm.phase() {
            Phase::Activate if state == ActivateState::ReadId.index() => {
                match completion.check_full() {
                    Ok(data) => self.read_id(data),
                    Err(e) => Step::Abort(e),
                }
            }
            Phase::Activate if state == ActivateState::ReadCalibrateData.index() => {
                match completion.check_full() {
                    Ok(data) if data[RESPONSE_TYPE_OFFSET] == CALIBRATE_RESPONSE => Step::Next,
                    Ok(data) => Step::Abort(FpError::protocol(format!(
                        "bogus calibrate response {:#04x}",
                        data[0]
                    ))),
                    Err(e) => Step::Abort(e),
                }
            }
            Phase::Activate if state == ActivateState::ReadInitResponse.index() => {
                match completion.check_full() {
                    Ok(data) => self.init_response(data),
                    Err(e) => Step::Abort(e),
                }
            }
            Phase::FingerDetect if state == FingerDetState::ReadFdData.index() => {
                match completion.check_full() {
                    Ok(data) if data[RESPONSE_TYPE_OFFSET] != FINGER_DET_RESPONSE => {
                        Step::Abort(FpError::protocol(format!("bogus FD response {:#04x}", data[0])))
                    }
                    Ok(data) if data[FINGER_PRESENT_OFFSET] == FINGER_PRESENT => Step::Next,
                    Ok(data) => {
                        debug!(result = data[FINGER_PRESENT_OFFSET], "Waiting for finger");
                        Step::jump(FingerDetState::SendFdCmd)
                    }
                    Err(e) => Step::Abort(e),
                }
            }
            Phase::FingerDetect if state == FingerDetState::SetIdle.index() => {
                match completion.check_full() {
                    Ok(_) => Step::Complete,
                    Err(e) => Step::Abort(e),
                }
            }
            Phase::Capture if state == CaptureState::ReadStripeData.index() => {
                match completion.check_status() {
                    Ok(()) => self.stripe_data(&completion.data),
                    Err(e) => Step::Abort(e),
                }
            }
            Phase::Capture if state == CaptureState::SetIdle.index() => {
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
        match phase {
            Phase::Activate => {
                let ok = result.is_ok();
                host.activate_complete(result);
                return ok.then(|| Ssm::for_states::<FingerDetState>(Phase::FingerDetect));
            }
            Phase::Deactivate => {
                if let Err(e) = result {
                    debug!(error = %e, "Set idle on deactivation failed");
                }
                return None;
            }
            _ => {}
        }

        if host.is_deactivating() {
            // The sensor may still be waiting for a finger
            self.strips.clear();
            return Some(Ssm::new(Phase::Deactivate, 1));
        }
        if let Err(e) = result {
            host.session_error(e);
            return None;
        }
        match phase {
            Phase::FingerDetect => {
                host.report_finger_status(true);
                Some(Ssm::for_states::<CaptureState>(Phase::Capture))
            }
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
    use crate::events::{FpEvent, RecordingObserver};
    use crate::imgdev::ImgDev;
    use crate::transport::MockTransport;

    const INIT_1_CMD: [u8; 4] = [0x44, 0x01, 0x00, 0x11];
    const INIT_2_CMD: [u8; 4] = [0x44, 0x01, 0x00, 0x22];
    const START_IMAGING: [u8; 2] = [0x13, 0x20];

    fn config() -> DriverConfig {
        let mut config = DriverConfig::default();
        config.aes1660 = AesX660Config {
            init_1: vec![INIT_1_CMD.to_vec()],
            init_2: vec![INIT_2_CMD.to_vec()],
            start_imaging_cmd: START_IMAGING.to_vec(),
        };
        config
    }

    fn pump(dev: &mut ImgDev<MockTransport>) {
        while dev.handle_events(Duration::ZERO).unwrap() {}
    }

    fn read_id_reply() -> [u8; 8] {
        [0x07, 0x00, 0x00, 0x60, 0x16, 0x01, 0x00, 0x00]
    }

    fn stripe(dy: i8, last: bool) -> Vec<u8> {
        let packed = AES1660_FRAME_WIDTH * FRAME_HEIGHT / 2;
        let size = IMAGE_OFFSET + packed - HEADER_SIZE;
        let mut resp = vec![0x5a; IMAGE_OFFSET + packed];
        resp[0] = 0x49;
        resp[1..3].copy_from_slice(&(size as u16).to_le_bytes());
        resp[IMAGE_OK_OFFSET] = IMAGE_OK;
        resp[LAST_FRAME_OFFSET] = last as u8;
        resp[FRAME_DELTA_X_OFFSET] = 0;
        resp[FRAME_DELTA_Y_OFFSET] = (-dy) as u8;
        resp
    }

    fn active() -> (ImgDev<MockTransport>, MockTransport, Arc<RecordingObserver>) {
        let mock = MockTransport::with_ids(0x08ff, 0x1685);
        let obs = Arc::new(RecordingObserver::new());
        let mut dev = ImgDev::open_with_transport(mock.clone(), &config(), obs.clone()).unwrap();
        dev.activate().unwrap();
        mock.queue_read(&read_id_reply());
        mock.queue_read(&[0x42, 0x00, 0x00, 0x01]);
        mock.queue_read(&read_id_reply());
        mock.queue_read(&[0x06, 0x00, 0x00, 0x00]);
        mock.queue_read(&[0x42, 0x00, 0x00, 0x01]);
        pump(&mut dev);
        (dev, mock, obs)
    }

    #[test]
    fn test_missing_init_sequences_fail_open() {
        let mock = MockTransport::with_ids(0x08ff, 0x2660);
        let obs = Arc::new(RecordingObserver::new());
        let result = ImgDev::open_with_transport(mock, &DriverConfig::default(), obs);
        assert!(matches!(result, Err(FpError::Config(_))));
    }

    #[test]
    fn test_response_buffer_straddles_transfers() {
        let mut buf = ResponseBuffer::default();
        let a = stripe(1, false);
        let b = stripe(2, true);
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let (head, tail) = stream.split_at(a.len() + 10);
        let first = buf.feed(head);
        assert_eq!(first, vec![a]);
        let second = buf.feed(tail);
        assert_eq!(second, vec![b]);

        // Header-only responses complete on their own
        assert_eq!(buf.feed(&[0x0d, 0x00, 0x00]), vec![vec![0x0d, 0x00, 0x00]]);
    }

    #[test]
    fn test_activation_runs_both_init_sequences() {
        let (_dev, mock, obs) = active();
        assert_eq!(obs.count("activate_complete"), 1);
        assert!(matches!(
            obs.events()[1],
            FpEvent::ActivateComplete { result: Ok(()) }
        ));
        let writes = mock.get_writes();
        assert_eq!(
            &writes[..7],
            &[
                SET_IDLE_CMD.to_vec(),
                READ_ID_CMD.to_vec(),
                INIT_1_CMD.to_vec(),
                READ_ID_CMD.to_vec(),
                CALIBRATE_CMD.to_vec(),
                INIT_2_CMD.to_vec(),
                LED_BLINK_CMD.to_vec(),
            ]
        );
    }

    #[test]
    fn test_capture_ends_on_last_frame_flag() {
        let (mut dev, mock, obs) = active();
        mock.queue_read(&[0x40, 0x00, 0x00, 0x00]);
        mock.queue_read(&[0x40, 0x00, 0x00, 0x01]);
        pump(&mut dev);
        assert_eq!(obs.count("report_finger_status"), 1);

        let mut data = stripe(0, false);
        data.extend_from_slice(&stripe(3, false));
        mock.queue_read(&data);
        mock.queue_read(&stripe(3, true));
        pump(&mut dev);

        let images = obs.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].width, 192);
        assert_eq!(images[0].height, FRAME_HEIGHT + 6);
        assert!(mock.get_writes().contains(&START_IMAGING.to_vec()));
        assert_eq!(obs.count("report_finger_status"), 2);
    }

    #[test]
    fn test_deactivate_while_waiting_for_finger_sets_idle() {
        let (mut dev, mock, obs) = active();
        mock.clear_writes();
        assert!(mock.has_inflight());

        dev.deactivate().unwrap();
        pump(&mut dev);

        assert_eq!(mock.get_writes(), vec![SET_IDLE_CMD.to_vec()]);
        assert_eq!(obs.count("deactivate_complete"), 1);
        assert_eq!(obs.count("session_error"), 0);
    }
}
