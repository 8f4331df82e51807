//! UPEK TouchChip Fingerprint Coprocessor (147e:2020), imaging mode.
//!
//! Requests are "Ciao" packets: a 4-byte prefix, a header whose high nibble
//! of byte 5 carries a rolling sequence number, a payload and a CRC16
//! trailer. The coprocessor streams the swipe as a series of image frames,
//! each one acknowledged before the next is sent.

use crc::{CRC_16_XMODEM, Crc};
use tracing::{debug, trace, warn};

use super::aeslib::check_transfer;
use crate::config::UpekTcImgConfig;
use crate::error::{FpError, ScanRetry};
use crate::image::{Image, ImageFlags};
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, SsmState, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const EP_IN: u8 = 0x81;
const EP_OUT: u8 = 0x02;
const CTRL_TIMEOUT: u32 = 4000;
const BULK_TIMEOUT: u32 = 4000;

const IMAGE_WIDTH: usize = 144;
const IMAGE_HEIGHT: usize = 384;
pub const IMAGE_SIZE: usize = IMAGE_WIDTH * IMAGE_HEIGHT;

pub const MAX_CMD_SIZE: usize = 64;
const MAX_RESPONSE_SIZE: usize = 2052;
const SHORT_RESPONSE_SIZE: usize = 64;
/// Prefix and CRC trailer; a request must carry more than this.
const CMD_OVERHEAD: usize = 6;
/// Header and CRC around a response payload.
const RESPONSE_OVERHEAD: usize = 9;

const UDF_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

pub static INFO: DriverInfo = DriverInfo {
    name: "upektc_img",
    full_name: "Upek TouchChip Fingerprint Coprocessor",
    id_table: &[(0x147e, 0x2020)],
    img_width: Some(IMAGE_WIDTH),
    img_height: Some(IMAGE_HEIGHT),
    bz3_threshold: Some(20),
    interface: 0,
};

ssm_states! {
    enum ActivateState {
        ControlReq1,
        ReadCtrlResp1,
        Init1,
        ReadInit1Resp,
        Init2,
        ReadInit2Resp,
        ControlReq2,
        ReadCtrlResp2,
        Init3,
        ReadInit3Resp,
        Init4,
        ReadInit4Resp,
    }
}

ssm_states! {
    enum CaptureState {
        InitCapture,
        ReadData,
        ReadDataTerm,
        Ack0028,
        Ack08,
        AckFrame,
        Ack0028Term,
    }
}

ssm_states! {
    enum DeactivateState {
        Deinit,
        ReadDeinitData,
    }
}

/// Stamp the sequence number and CRC into a request.
pub fn prepare_cmd(template: &[u8], seq: u8) -> Vec<u8> {
    let mut cmd = template.to_vec();
    cmd[5] = (cmd[5] & 0x0f) | (seq << 4);
    let size = cmd.len();
    // The prefix and the CRC itself are not covered
    let crc = UDF_CRC.checksum(&cmd[4..size - 2]);
    cmd[size - 2..].copy_from_slice(&crc.to_le_bytes());
    cmd
}

/// Payload length announced in a response header.
fn payload_len(data: &[u8]) -> usize {
    (((data[5] & 0x0f) as usize) << 8) | data[6] as usize
}

/// Pixel bytes carried by one image frame.
pub fn frame_pixels(data: &[u8]) -> Result<&[u8], FpError> {
    let mut offset = 8;
    let mut len = payload_len(data).saturating_sub(1);
    match data[7] {
        0x2c => {
            len = len.saturating_sub(10);
            offset += 10;
        }
        0x20 => len = len.saturating_sub(4),
        _ => {}
    }
    data.get(offset..offset + len)
        .ok_or_else(|| FpError::protocol(format!("image frame of {} bytes is truncated", len)))
}

pub struct UpekTcImg {
    config: UpekTcImgConfig,
    seq: u8,
    response: Vec<u8>,
    response_rest: usize,
    image_bits: Vec<u8>,
}

impl UpekTcImg {
    pub fn new(config: &UpekTcImgConfig) -> Result<Self, FpError> {
        if config.init.len() != 4 {
            return Err(FpError::Config(format!(
                "upektc_img: expected 4 init requests, got {}",
                config.init.len()
            )));
        }
        let named = [
            ("init_capture", &config.init_capture),
            ("ack_00_28", &config.ack_00_28),
            ("ack_08", &config.ack_08),
            ("ack_frame", &config.ack_frame),
            ("deinit", &config.deinit),
        ];
        let requests = config.init.iter().map(|r| ("init", r)).chain(named);
        for (name, request) in requests {
            if request.len() <= CMD_OVERHEAD || request.len() > MAX_CMD_SIZE {
                return Err(FpError::Config(format!(
                    "upektc_img: {} must be {}..={} bytes, got {}",
                    name,
                    CMD_OVERHEAD + 1,
                    MAX_CMD_SIZE,
                    request.len()
                )));
            }
        }
        Ok(Self {
            config: config.clone(),
            seq: 0,
            response: Vec::with_capacity(MAX_RESPONSE_SIZE),
            response_rest: 0,
            image_bits: Vec::with_capacity(IMAGE_SIZE * 2),
        })
    }

    fn submit(&self, template: &[u8], seq: u8) -> Step {
        Step::Submit(Transfer::bulk_out(EP_OUT, prepare_cmd(template, seq), BULK_TIMEOUT))
    }

    /// Send a request stamped with the running sequence number.
    fn submit_seq(&mut self, template: &[u8]) -> Step {
        let step = self.submit(template, self.seq);
        self.seq = self.seq.wrapping_add(1);
        step
    }

    fn read_short() -> Step {
        Step::Submit(Transfer::bulk_in(EP_IN, SHORT_RESPONSE_SIZE, BULK_TIMEOUT))
    }

    fn activate_state(&mut self, ssm: &Ssm) -> Step {
        let Some(state) = ssm.state::<ActivateState>() else {
            return Step::Abort(FpError::protocol("bad activation state"));
        };
        let init = &self.config.init;
        match state {
            ActivateState::ControlReq1 | ActivateState::ControlReq2 => {
                Step::Submit(Transfer::vendor_out(0x0c, 0x0100, 0x0400, vec![0u8], CTRL_TIMEOUT))
            }
            ActivateState::Init1 => self.submit(&init[0], 0),
            ActivateState::Init2 => self.submit(&init[1], 0),
            ActivateState::Init3 => self.submit(&init[2], 0),
            ActivateState::Init4 => {
                let template = init[3].clone();
                self.submit_seq(&template)
            }
            _ => Self::read_short(),
        }
    }

    fn capture_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<CaptureState>() {
            Some(CaptureState::InitCapture) => {
                let template = self.config.init_capture.clone();
                self.submit_seq(&template)
            }
            Some(CaptureState::ReadData | CaptureState::ReadDataTerm) => {
                let len = if self.response_rest == 0 {
                    SHORT_RESPONSE_SIZE
                } else {
                    MAX_RESPONSE_SIZE - SHORT_RESPONSE_SIZE
                };
                Step::Submit(Transfer::bulk_in(EP_IN, len, BULK_TIMEOUT))
            }
            Some(CaptureState::Ack0028 | CaptureState::Ack0028Term) => {
                let template = self.config.ack_00_28.clone();
                self.submit_seq(&template)
            }
            Some(CaptureState::Ack08) => self.submit(&self.config.ack_08, 0),
            Some(CaptureState::AckFrame) => {
                let template = self.config.ack_frame.clone();
                self.submit_seq(&template)
            }
            None => Step::Abort(FpError::protocol("bad capture state")),
        }
    }

    fn capture_request_done(ssm: &Ssm, completion: &Completion) -> Step {
        if let Err(e) = completion.check_full() {
            return Step::Abort(e);
        }
        if ssm.cur_state() == CaptureState::Ack0028Term.index() {
            Step::jump(CaptureState::ReadDataTerm)
        } else {
            Step::jump(CaptureState::ReadData)
        }
    }

    fn read_data_done(&mut self, ssm: &Ssm, completion: &Completion, host: &mut Host) -> Step {
        if let Err(e) = completion.check_status() {
            return Step::Abort(e);
        }
        if host.is_deactivating() {
            debug!("Deactivate requested");
            return Step::Complete;
        }
        trace!(len = completion.actual_length, "Response read");
        if completion.actual_length == 0 {
            return Step::Jump(ssm.cur_state());
        }
        if ssm.cur_state() == CaptureState::ReadDataTerm.index() {
            debug!("Terminating capture");
            return Step::Complete;
        }

        if self.response_rest == 0 {
            self.response.clear();
            self.response.extend_from_slice(&completion.data);
            if self.response.len() < 8 {
                return Step::Abort(FpError::protocol("response header is truncated"));
            }
            let response_size = payload_len(&self.response) + RESPONSE_OVERHEAD;
            if response_size > completion.actual_length {
                debug!(response_size, actual = completion.actual_length, "Waiting for rest of transfer");
                self.response_rest = response_size - completion.actual_length;
                return Step::jump(CaptureState::ReadData);
            }
        } else {
            self.response.resize(SHORT_RESPONSE_SIZE, 0);
            self.response.extend_from_slice(&completion.data);
        }
        self.response_rest = 0;

        let data = std::mem::take(&mut self.response);
        let step = self.handle_response(&data, host);
        self.response = data;
        step
    }

    fn handle_response(&mut self, data: &[u8], host: &mut Host) -> Step {
        match (data[4], data[7]) {
            (0x00, 0x28) => {
                let status = data.get(18).copied().unwrap_or_default();
                debug!(status = format_args!("{:#04x}", status), "Finger status");
                let reason = match status {
                    // No finger yet, or finger present
                    0x0c | 0x00 => return Step::jump(CaptureState::Ack0028),
                    0x1e => ScanRetry::TooShort,
                    0x1d => ScanRetry::CenterFinger,
                    _ => ScanRetry::Retry,
                };
                warn!(?reason, "Scan aborted by the coprocessor");
                host.abort_scan(reason);
                host.report_finger_status(false);
                Step::jump(CaptureState::Ack0028Term)
            }
            (0x00, kind @ (0x2c | 0x24 | 0x20)) => {
                if kind == 0x2c {
                    host.report_finger_status(true);
                }
                let pixels = match frame_pixels(data) {
                    Ok(pixels) => pixels,
                    Err(e) => return Step::Abort(e),
                };
                if self.image_bits.len() + pixels.len() > IMAGE_SIZE * 2 {
                    return Step::Abort(FpError::protocol("image frames overflow the buffer"));
                }
                self.image_bits.extend_from_slice(pixels);
                if kind != 0x20 {
                    return Step::jump(CaptureState::AckFrame);
                }
                // Last frame
                if self.image_bits.len() != IMAGE_SIZE {
                    return Step::Abort(FpError::protocol(format!(
                        "image is {} bytes, expected {}",
                        self.image_bits.len(),
                        IMAGE_SIZE
                    )));
                }
                debug!(size = self.image_bits.len(), "Image complete");
                let bits = std::mem::take(&mut self.image_bits);
                let img = Image::from_data(IMAGE_WIDTH, IMAGE_HEIGHT, bits);
                host.image_captured(img.with_flags(ImageFlags::PARTIAL));
                host.report_finger_status(false);
                Step::Complete
            }
            (0x00, kind) => Step::Abort(FpError::protocol(format!("unknown response {:#04x}", kind))),
            (0x08, _) => Step::jump(CaptureState::Ack08),
            (code, _) => Step::Abort(FpError::protocol(format!("unhandled response {:#04x}", code))),
        }
    }

    fn start_capture(&mut self) -> Ssm {
        self.image_bits.clear();
        self.response_rest = 0;
        Ssm::for_states::<CaptureState>(Phase::Capture)
    }
}

impl ImageDriver for UpekTcImg {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        self.seq = 0;
        Ok(Ssm::for_states::<ActivateState>(Phase::Activate))
    }

    fn run_state(&mut self, ssm: &Ssm, _host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Activate => self.activate_state(ssm),
            Phase::Capture => self.capture_state(ssm),
            Phase::Deactivate => match ssm.state::<DeactivateState>() {
                Some(DeactivateState::Deinit) => {
                    let template = self.config.deinit.clone();
                    self.submit_seq(&template)
                }
                _ => Self::read_short(),
            },
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Activate => {
                let s = ssm.cur_state();
                let is_request = [
                    ActivateState::Init1,
                    ActivateState::Init2,
                    ActivateState::Init3,
                    ActivateState::Init4,
                ]
                .iter()
                .any(|state| state.index() == s);
                if is_request {
                    check_transfer(&completion)
                } else {
                    // Replies are not interpreted
                    Step::from_result(completion.check_status())
                }
            }
            Phase::Capture => {
                let s = ssm.cur_state();
                if s == CaptureState::ReadData.index() || s == CaptureState::ReadDataTerm.index() {
                    self.read_data_done(ssm, &completion, host)
                } else {
                    Self::capture_request_done(ssm, &completion)
                }
            }
            Phase::Deactivate if ssm.cur_state() == DeactivateState::Deinit.index() => {
                check_transfer(&completion)
            }
            _ => Step::from_result(completion.check_status()),
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let result = ssm.into_result();
        match phase {
            Phase::Activate => {
                debug!(ok = result.is_ok(), "Activation finished");
                let ok = result.is_ok();
                host.activate_complete(result);
                ok.then(|| self.start_capture())
            }
            Phase::Deactivate => {
                if let Err(e) = result {
                    host.session_error(e);
                }
                None
            }
            _ if host.is_deactivating() => {
                self.image_bits.clear();
                Some(Ssm::for_states::<DeactivateState>(Phase::Deactivate))
            }
            _ => match result {
                Ok(()) => Some(self.start_capture()),
                Err(e) => {
                    host.session_error(e);
                    None
                }
            },
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
    use crate::imgdev::{AcquireState, ImgDev};
    use crate::transport::MockTransport;

    fn pump(dev: &mut ImgDev<MockTransport>) {
        while dev.handle_events(Duration::ZERO).unwrap() {}
    }

    fn request(tag: u8) -> Vec<u8> {
        let mut cmd = b"Ciao".to_vec();
        cmd.extend_from_slice(&[0x00, 0x00, 0x03, tag, 0x00, 0x00]);
        cmd.extend_from_slice(&[0x00, 0x00]);
        cmd
    }

    fn config() -> DriverConfig {
        let mut config = DriverConfig::default();
        config.upektc_img = UpekTcImgConfig {
            init: vec![request(0x01), request(0x02), request(0x03), request(0x04)],
            init_capture: request(0x10),
            ack_00_28: request(0x28),
            ack_08: request(0x08),
            ack_frame: request(0x24),
            deinit: request(0x0d),
        };
        config
    }

    fn response(code: u8, kind: u8, payload: &[u8]) -> Vec<u8> {
        // The announced length counts the kind byte
        let len = payload.len() + 1;
        let mut data = b"Ciao".to_vec();
        data.extend_from_slice(&[code, (len >> 8) as u8 & 0x0f, len as u8, kind]);
        data.extend_from_slice(payload);
        data.extend_from_slice(&[0x00, 0x00]);
        data
    }

    fn finger_status(status: u8) -> Vec<u8> {
        let mut payload = vec![0u8; 12];
        payload[10] = status;
        response(0x00, 0x28, &payload)
    }

    fn active() -> (ImgDev<MockTransport>, MockTransport, Arc<RecordingObserver>) {
        let mock = MockTransport::with_ids(0x147e, 0x2020);
        let obs = Arc::new(RecordingObserver::new());
        let mut dev = ImgDev::open_with_transport(mock.clone(), &config(), obs.clone()).unwrap();
        assert_eq!(dev.info().name, "upektc_img");
        dev.activate().unwrap();
        for _ in 0..6 {
            mock.queue_read(&[0u8; SHORT_RESPONSE_SIZE]);
        }
        pump(&mut dev);
        assert_eq!(obs.events(), vec![FpEvent::ActivateComplete { result: Ok(()) }]);
        (dev, mock, obs)
    }

    /// Queue a frame response, splitting it the way the device does.
    fn queue_response(mock: &MockTransport, data: &[u8]) {
        if data.len() <= SHORT_RESPONSE_SIZE {
            mock.queue_read(data);
        } else {
            mock.queue_read(&data[..SHORT_RESPONSE_SIZE]);
            mock.queue_read(&data[SHORT_RESPONSE_SIZE..]);
        }
    }

    #[test]
    fn test_prepare_cmd_stamps_seq_and_crc() {
        let cmd = prepare_cmd(&request(0x10), 3);
        assert_eq!(cmd[5], 0x30);
        let crc = UDF_CRC.checksum(&cmd[4..cmd.len() - 2]);
        assert_eq!(&cmd[cmd.len() - 2..], &crc.to_le_bytes());
        // XMODEM check value
        assert_eq!(UDF_CRC.checksum(b"123456789"), 0x31c3);
        // Only the low nibble of the seq survives
        assert_eq!(prepare_cmd(&request(0x10), 0x13)[5], 0x30);
    }

    #[test]
    fn test_frame_pixels_trims_headers() {
        let first = response(0x00, 0x2c, &[1u8; 30]);
        assert_eq!(frame_pixels(&first).unwrap(), &[1u8; 20][..]);
        let plain = response(0x00, 0x24, &[2u8; 30]);
        assert_eq!(frame_pixels(&plain).unwrap().len(), 30);
        let last = response(0x00, 0x20, &[3u8; 30]);
        assert_eq!(frame_pixels(&last).unwrap().len(), 26);
    }

    #[test]
    fn test_activation_sequence() {
        let (_dev, mock, _obs) = active();
        let transfers = mock.transfers();
        assert_eq!(
            transfers[0],
            Transfer::vendor_out(0x0c, 0x0100, 0x0400, vec![0u8], CTRL_TIMEOUT)
        );
        assert_eq!(transfers[6], transfers[0]);
        let writes = mock.get_writes();
        // Control, four init requests, control again, then the capture start
        assert_eq!(writes[1], prepare_cmd(&request(0x01), 0));
        assert_eq!(writes[5], prepare_cmd(&request(0x04), 0));
        assert_eq!(writes[6], prepare_cmd(&request(0x10), 1));
    }

    #[test]
    fn test_swipe_assembles_frames() {
        const FRAME_PIXELS: usize = 1728;
        let frames = IMAGE_SIZE / FRAME_PIXELS;
        let (mut dev, mock, obs) = active();
        mock.clear_writes();

        queue_response(&mock, &finger_status(0x0c));
        let mut first = vec![0u8; 10];
        first.extend(vec![0x40; FRAME_PIXELS]);
        queue_response(&mock, &response(0x00, 0x2c, &first));
        queue_response(&mock, &response(0x08, 0x00, &[]));
        for _ in 0..frames - 2 {
            queue_response(&mock, &response(0x00, 0x24, &vec![0x80; FRAME_PIXELS]));
        }
        let mut last = vec![0xc0; FRAME_PIXELS];
        last.extend([0u8; 4]);
        queue_response(&mock, &response(0x00, 0x20, &last));
        pump(&mut dev);

        let images = obs.images();
        assert_eq!(images.len(), 1);
        assert_eq!((images[0].width, images[0].height), (IMAGE_WIDTH, IMAGE_HEIGHT));
        assert!(images[0].flags.contains(ImageFlags::PARTIAL));
        assert_eq!(obs.count("report_finger_status"), 2);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);

        let writes = mock.get_writes();
        assert_eq!(writes[0], prepare_cmd(&request(0x28), 2));
        assert_eq!(writes[1], prepare_cmd(&request(0x24), 3));
        // The 0x08 acknowledgement always goes out with seq 0
        assert_eq!(writes[2], prepare_cmd(&request(0x08), 0));
        assert_eq!(writes[3], prepare_cmd(&request(0x24), 4));
        // Every frame but the last was acknowledged, then a fresh capture started
        assert_eq!(writes.last(), Some(&prepare_cmd(&request(0x10), (2 + frames) as u8)));
    }

    #[test]
    fn test_short_swipe_aborts_scan() {
        let (mut dev, mock, obs) = active();
        queue_response(&mock, &finger_status(0x0c));
        let mut first = vec![0u8; 10];
        first.extend([0x40; 16]);
        queue_response(&mock, &response(0x00, 0x2c, &first));
        queue_response(&mock, &finger_status(0x1e));
        queue_response(&mock, &finger_status(0x0c));
        pump(&mut dev);

        assert!(obs.images().is_empty());
        assert!(obs.events().contains(&FpEvent::AbortScan { reason: ScanRetry::TooShort }));
        assert_eq!(obs.count("session_error"), 0);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
    }

    #[test]
    fn test_empty_read_is_retried() {
        let (mut dev, mock, obs) = active();
        let before = mock.transfers().len();
        mock.queue_read(&[]);
        pump(&mut dev);
        let transfers = mock.transfers();
        assert_eq!(transfers.len(), before + 1);
        assert_eq!(transfers.last(), Some(&Transfer::bulk_in(EP_IN, SHORT_RESPONSE_SIZE, BULK_TIMEOUT)));
        assert_eq!(obs.events().len(), 1);
    }

    #[test]
    fn test_unknown_response_is_session_error() {
        let (mut dev, mock, obs) = active();
        queue_response(&mock, &response(0x05, 0x00, &[]));
        pump(&mut dev);
        assert_eq!(obs.count("session_error"), 1);
        assert!(dev.is_idle());
    }

    #[test]
    fn test_deactivate_sends_deinit() {
        let (mut dev, mock, obs) = active();
        mock.clear_writes();
        dev.deactivate().unwrap();
        mock.queue_read(&[0u8; SHORT_RESPONSE_SIZE]);
        pump(&mut dev);
        assert_eq!(mock.get_writes(), vec![prepare_cmd(&request(0x0d), 2)]);
        assert_eq!(obs.count("deactivate_complete"), 1);
        assert_eq!(obs.count("session_error"), 0);
    }

    #[test]
    fn test_config_validated() {
        assert!(matches!(
            UpekTcImg::new(&UpekTcImgConfig::default()),
            Err(FpError::Config(_))
        ));
        let mut config = config().upektc_img;
        config.ack_08 = vec![0u8; MAX_CMD_SIZE + 1];
        assert!(matches!(UpekTcImg::new(&config), Err(FpError::Config(_))));
    }
}
