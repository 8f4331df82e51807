//! Secugen FDU 2000 press sensor.
//!
//! Each two-byte command is acknowledged on a reply endpoint. A frame
//! arrives as one large bulk read of nibble-coded lines, each introduced by
//! a start-of-line marker; presence is signalled by the read succeeding.

use tracing::{debug, trace, warn};

use crate::error::FpError;
use crate::image::{Image, ImageFlags};
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const EP_IMAGE: u8 = 0x82;
const EP_REPLY: u8 = 0x81;
const EP_CMD: u8 = 0x01;
const BULK_TIMEOUT: u32 = 200;
const ACK_LEN: usize = 8;

pub const RAW_IMAGE_WIDTH: usize = 398;
pub const RAW_IMAGE_HEIGHT: usize = 301;
const RAW_IMAGE_SIZE: usize = RAW_IMAGE_WIDTH * RAW_IMAGE_HEIGHT;

const SOF: [u8; 8] = [0x0f, 0x0f, 0x0f, 0x0f, 0x00, 0x00, 0x0c, 0x07];
/// Followed by four nibbles of line number.
const SOL: [u8; 8] = [0x0f, 0x0f, 0x0f, 0x0f, 0x00, 0x00, 0x0b, 0x06];
const LINE_NUMBER_LEN: usize = 4;

/// A command and the prefix its acknowledgement must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub cmd: [u8; 2],
    pub ack: &'static [u8],
}

pub const CAPTURE_READY: Request = Request {
    cmd: [0x00, 0x04],
    ack: &[0x00, 0x04, 0x01, 0x01],
};
pub const CAPTURE_READ: Request = Request {
    cmd: [0x00, 0x01],
    ack: &[0x00, 0x01, 0x01, 0x01],
};
pub const CAPTURE_END: Request = Request {
    cmd: [0x00, 0x05],
    ack: &[0x00, 0x05, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01],
};
pub const LED_OFF: Request = Request { cmd: [0x05, 0x00], ack: &[] };
pub const LED_ON: Request = Request { cmd: [0x05, 0x01], ack: &[] };

pub static INFO: DriverInfo = DriverInfo {
    name: "fdu2000",
    full_name: "Secugen FDU 2000",
    id_table: &[(0x1162, 0x0300)],
    img_width: Some(RAW_IMAGE_WIDTH),
    img_height: Some(RAW_IMAGE_HEIGHT),
    bz3_threshold: Some(23),
    interface: 0,
};

ssm_states! {
    enum CmdState {
        Send,
        ReadAck,
    }
}

ssm_states! {
    enum OpenState {
        CaptureEnd,
        LedOff,
    }
}

ssm_states! {
    enum LoopState {
        LedOn,
        CaptureReady,
        CaptureRead,
        ReadImage,
        CaptureEnd,
        LedOff,
        Deliver,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Decode a raw frame. Lines missing from a truncated read stay black.
pub fn decode_frame(buffer: &[u8]) -> Option<Image> {
    let mut pos = find(buffer, &SOF)? + SOF.len();
    let mut image = vec![0u8; RAW_IMAGE_SIZE];
    for line in image.chunks_exact_mut(RAW_IMAGE_WIDTH) {
        let Some(at) = find(&buffer[pos..], &SOL) else {
            break;
        };
        let start = pos + at + SOL.len() + LINE_NUMBER_LEN;
        let Some(raw) = buffer.get(start..start + RAW_IMAGE_WIDTH * 2) else {
            break;
        };
        for (out, pair) in line.iter_mut().zip(raw.chunks_exact(2)) {
            *out = (pair[0] << 4) | (pair[1] & 0x0f);
        }
        pos = start + RAW_IMAGE_WIDTH * 2;
    }
    Some(
        Image::from_data(RAW_IMAGE_WIDTH, RAW_IMAGE_HEIGHT, image).with_flags(
            ImageFlags::COLORS_INVERTED | ImageFlags::V_FLIPPED | ImageFlags::H_FLIPPED,
        ),
    )
}

#[derive(Default)]
pub struct Fdu2000 {
    /// Command of the running `Exchange` machine.
    request: Option<Request>,
    image: Option<Image>,
}

impl Fdu2000 {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(&mut self, request: Request) -> Step {
        self.request = Some(request);
        Step::Subsm(Ssm::for_states::<CmdState>(Phase::Exchange))
    }

    fn cmd_state(&self, ssm: &Ssm) -> Step {
        let Some(request) = self.request else {
            return Step::Abort(FpError::protocol("no command pending"));
        };
        match ssm.state::<CmdState>() {
            Some(CmdState::Send) => {
                trace!(cmd = ?request.cmd, "Send command");
                Step::Submit(Transfer::bulk_out(EP_CMD, request.cmd.to_vec(), BULK_TIMEOUT))
            }
            Some(CmdState::ReadAck) if request.ack.is_empty() => Step::Complete,
            Some(CmdState::ReadAck) => {
                Step::Submit(Transfer::bulk_in(EP_REPLY, ACK_LEN, BULK_TIMEOUT))
            }
            None => Step::Abort(FpError::protocol("bad command state")),
        }
    }

    fn cmd_done(&self, ssm: &Ssm, completion: &Completion) -> Step {
        if let Err(e) = completion.check_status() {
            return Step::Abort(e);
        }
        if ssm.state::<CmdState>() == Some(CmdState::Send) {
            return Step::Next;
        }
        let ack = self.request.map(|r| r.ack).unwrap_or_default();
        if completion.data.starts_with(ack) {
            Step::Next
        } else {
            warn!(got = ?completion.data, expected = ?ack, "Unexpected acknowledgement");
            Step::Abort(FpError::protocol("unexpected acknowledgement"))
        }
    }

    fn loop_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.state::<LoopState>() {
            Some(LoopState::LedOn) => {
                if host.is_deactivating() {
                    return Step::Complete;
                }
                self.command(LED_ON)
            }
            Some(LoopState::CaptureReady) => self.command(CAPTURE_READY),
            Some(LoopState::CaptureRead) => self.command(CAPTURE_READ),
            Some(LoopState::ReadImage) => {
                if host.is_deactivating() {
                    return Step::Next;
                }
                Step::Submit(Transfer::bulk_in(EP_IMAGE, RAW_IMAGE_SIZE * 6, BULK_TIMEOUT * 10))
            }
            Some(LoopState::CaptureEnd) => self.command(CAPTURE_END),
            Some(LoopState::LedOff) => self.command(LED_OFF),
            Some(LoopState::Deliver) => {
                if let Some(image) = self.image.take() {
                    host.report_finger_status(true);
                    host.image_captured(image);
                    host.report_finger_status(false);
                }
                if host.is_deactivating() {
                    Step::Complete
                } else {
                    Step::jump(LoopState::LedOn)
                }
            }
            None => Step::Abort(FpError::protocol("bad loop state")),
        }
    }

    fn image_done(&mut self, completion: &Completion, host: &mut Host) -> Step {
        if host.is_deactivating() {
            return Step::Next;
        }
        // Nothing on the sensor yet: the read times out or comes back empty
        if completion.check_status().is_err() || completion.data.is_empty() {
            return Step::jump(LoopState::CaptureRead);
        }
        debug!(bytes = completion.data.len(), "Frame read");
        match decode_frame(&completion.data) {
            Some(image) => {
                self.image = Some(image);
                Step::Next
            }
            None => {
                warn!("No start of frame, reading again");
                Step::jump(LoopState::CaptureRead)
            }
        }
    }
}

impl ImageDriver for Fdu2000 {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    /// Make sure the sensor is not left in capture mode.
    fn open(&mut self, _host: &mut Host) -> Result<Option<Ssm>, FpError> {
        Ok(Some(Ssm::for_states::<OpenState>(Phase::Open)))
    }

    fn activate(&mut self, host: &mut Host) -> Result<Ssm, FpError> {
        self.image = None;
        host.activate_complete(Ok(()));
        Ok(Ssm::for_states::<LoopState>(Phase::Capture))
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Exchange => self.cmd_state(ssm),
            Phase::Open => match ssm.state::<OpenState>() {
                Some(OpenState::CaptureEnd) => self.command(CAPTURE_END),
                Some(OpenState::LedOff) => self.command(LED_OFF),
                None => Step::Abort(FpError::protocol("bad open state")),
            },
            Phase::Capture => self.loop_state(ssm, host),
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Exchange => self.cmd_done(ssm, &completion),
            _ => self.image_done(&completion, host),
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let result = ssm.into_result();
        if phase == Phase::Open {
            if let Err(e) = &result {
                warn!(error = %e, "Could not init device");
            }
            host.open_complete(result);
            return None;
        }
        self.image = None;
        if let Err(e) = result {
            if !host.is_deactivating() {
                host.session_error(e);
            }
        }
        None
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
    use crate::transport::{MockTransport, TransferStatus};

    fn pump(dev: &mut ImgDev<MockTransport>) {
        while dev.handle_events(Duration::ZERO).unwrap() {}
    }

    fn ack(request: Request) -> Vec<u8> {
        let mut reply = request.ack.to_vec();
        reply.resize(ACK_LEN, 0);
        reply
    }

    fn opened() -> (ImgDev<MockTransport>, MockTransport, Arc<RecordingObserver>) {
        let mock = MockTransport::with_ids(0x1162, 0x0300);
        mock.queue_read(&ack(CAPTURE_END));
        let obs = Arc::new(RecordingObserver::new());
        let mut dev =
            ImgDev::open_with_transport(mock.clone(), &DriverConfig::default(), obs.clone())
                .unwrap();
        pump(&mut dev);
        (dev, mock, obs)
    }

    /// A frame whose every line repeats the given pixel.
    fn raw_frame(lines: usize, pixel: u8) -> Vec<u8> {
        let mut raw = vec![0x55; 16];
        raw.extend_from_slice(&SOF);
        for n in 0..lines {
            raw.extend_from_slice(&SOL);
            raw.extend_from_slice(&[0, 0, (n >> 4) as u8 & 0x0f, n as u8 & 0x0f]);
            for _ in 0..RAW_IMAGE_WIDTH {
                raw.extend_from_slice(&[pixel >> 4, pixel & 0x0f]);
            }
        }
        raw
    }

    #[test]
    fn test_decode_joins_nibbles() {
        let img = decode_frame(&raw_frame(RAW_IMAGE_HEIGHT, 0xa7)).unwrap();
        assert_eq!((img.width, img.height), (RAW_IMAGE_WIDTH, RAW_IMAGE_HEIGHT));
        assert!(img.data.iter().all(|&p| p == 0xa7));
        assert!(img.flags.contains(ImageFlags::COLORS_INVERTED | ImageFlags::H_FLIPPED));
    }

    #[test]
    fn test_decode_truncated_frame_keeps_lines_read() {
        let img = decode_frame(&raw_frame(10, 0x31)).unwrap();
        assert_eq!(img.pixel(5, 9), 0x31);
        assert_eq!(img.pixel(5, 10), 0);
        assert!(decode_frame(&[0u8; 64]).is_none());
    }

    #[test]
    fn test_open_leaves_capture_mode() {
        let (dev, mock, obs) = opened();
        assert!(dev.is_opened());
        assert_eq!(obs.events(), vec![FpEvent::OpenComplete { result: Ok(()) }]);
        assert_eq!(mock.get_writes(), vec![CAPTURE_END.cmd.to_vec(), LED_OFF.cmd.to_vec()]);
    }

    #[test]
    fn test_bad_ack_fails_open() {
        let mock = MockTransport::with_ids(0x1162, 0x0300);
        mock.queue_read(&ack(CAPTURE_READY));
        let obs = Arc::new(RecordingObserver::new());
        let mut dev =
            ImgDev::open_with_transport(mock.clone(), &DriverConfig::default(), obs.clone())
                .unwrap();
        pump(&mut dev);
        assert!(!dev.is_opened());
        assert!(matches!(
            obs.events().as_slice(),
            [FpEvent::OpenComplete { result: Err(FpError::Protocol(_)) }]
        ));
    }

    #[test]
    fn test_empty_reads_are_retried_until_frame() {
        let (mut dev, mock, obs) = opened();
        mock.clear_writes();
        dev.activate().unwrap();
        mock.queue_read(&ack(CAPTURE_READY));
        mock.queue_read(&ack(CAPTURE_READ));
        mock.queue_status(TransferStatus::TimedOut);
        mock.queue_read(&ack(CAPTURE_READ));
        mock.queue_read(&raw_frame(RAW_IMAGE_HEIGHT, 0x40));
        mock.queue_read(&ack(CAPTURE_END));
        pump(&mut dev);

        assert_eq!(obs.images().len(), 1);
        assert_eq!(obs.count("report_finger_status"), 2);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
        assert_eq!(
            mock.get_writes(),
            vec![
                LED_ON.cmd.to_vec(),
                CAPTURE_READY.cmd.to_vec(),
                CAPTURE_READ.cmd.to_vec(),
                CAPTURE_READ.cmd.to_vec(),
                CAPTURE_END.cmd.to_vec(),
                LED_OFF.cmd.to_vec(),
                // Next pass
                LED_ON.cmd.to_vec(),
                CAPTURE_READY.cmd.to_vec(),
            ]
        );
    }

    #[test]
    fn test_deactivate_ends_capture_mode() {
        let (mut dev, mock, obs) = opened();
        dev.activate().unwrap();
        mock.queue_read(&ack(CAPTURE_READY));
        mock.queue_read(&ack(CAPTURE_READ));
        pump(&mut dev);
        mock.clear_writes();

        dev.deactivate().unwrap();
        mock.queue_read(&ack(CAPTURE_END));
        pump(&mut dev);
        assert_eq!(mock.get_writes(), vec![CAPTURE_END.cmd.to_vec(), LED_OFF.cmd.to_vec()]);
        assert_eq!(obs.count("deactivate_complete"), 1);
        assert_eq!(obs.count("session_error"), 0);
        assert!(dev.is_idle());
    }
}
