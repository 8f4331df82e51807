//! ElanTech swipe sensor.
//!
//! Every exchange is a 2-byte command on the command endpoint, optionally
//! followed by a read. Raw frames are 16-bit, vertical and wider than the
//! usable area; they are transposed, trimmed, normalized per frame and
//! then assembled like AuthenTec strips.

use tracing::debug;

use crate::assembling::{
    Frame, FrameAsmblCtx, PixelFormat, assemble_frames, do_movement_estimation, normalize_u16,
};
use crate::config::ElanConfig;
use crate::error::{FpError, ScanRetry};
use crate::image::ImageFlags;
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, SsmState, Step, ssm_states};
use crate::transport::{Completion, Transfer};

/// Pixels discarded on both ends of the raw height; their intensity
/// differs from the rest of the frame.
const FRAME_MARGIN: usize = 12;

const EP_CMD_OUT: u8 = 0x01;
const EP_CMD_IN: u8 = 0x83;
const EP_IMG_IN: u8 = 0x82;

const CMD_TIMEOUT: u32 = 10000;
/// Used once frames flow, to notice a lifted finger quickly.
const FINGER_TIMEOUT: u32 = 200;

const FINGER_PRESENT: u8 = 0x55;

pub static INFO: DriverInfo = DriverInfo {
    name: "elan",
    full_name: "ElanTech Fingerprint Sensor",
    id_table: &[(0x04f3, 0x0907)],
    img_width: None,
    img_height: None,
    bz3_threshold: Some(22),
    interface: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Response {
    None,
    Fixed(usize),
    /// One raw frame, sized from the reported dimensions.
    Frame,
}

#[derive(Debug, Clone, Copy)]
struct ElanCmd {
    cmd: [u8; 2],
    response: Response,
    response_in: u8,
}

impl ElanCmd {
    const fn new(cmd: [u8; 2], response: Response) -> Self {
        Self {
            cmd,
            response,
            response_in: EP_CMD_IN,
        }
    }
}

const GET_SENSOR_DIM_CMDS: &[ElanCmd] = &[ElanCmd::new([0x00, 0x0c], Response::Fixed(4))];

const INIT_START_CMDS: &[ElanCmd] = &[
    ElanCmd::new([0x40, 0x19], Response::Fixed(2)),
    ElanCmd::new([0x40, 0x2a], Response::Fixed(2)),
];

const READ_CMDS: &[ElanCmd] = &[ElanCmd {
    cmd: [0x00, 0x09],
    response: Response::Frame,
    response_in: EP_IMG_IN,
}];

/// Issued after data reads during init and calibration.
const INIT_END_CMDS: &[ElanCmd] = &[ElanCmd::new([0x40, 0x24], Response::Fixed(2))];

/// The same command twice.
const CALIBRATE_START_CMDS: &[ElanCmd] = &[
    ElanCmd::new([0x40, 0x23], Response::Fixed(1)),
    ElanCmd::new([0x40, 0x23], Response::Fixed(1)),
];

const CALIBRATE_END_CMDS: &[ElanCmd] = &[ElanCmd::new([0x40, 0x24], Response::Fixed(2))];

/// LED on.
const CAPTURE_START_CMDS: &[ElanCmd] = &[ElanCmd::new([0x40, 0x31], Response::None)];

/// The read after this one completes only once a finger is on the sensor.
const CAPTURE_WAIT_FINGER_CMDS: &[ElanCmd] = &[ElanCmd::new([0x40, 0x3f], Response::Fixed(1))];

/// LED off.
const DEACTIVATE_CMDS: &[ElanCmd] = &[ElanCmd::new([0x00, 0x0b], Response::None)];

ssm_states! {
    enum ActivateState {
        GetSensorDim,
        SetSensorDim,
        Start,
        ReadData,
        End,
    }
}

ssm_states! {
    enum CalibrateState {
        Start1,
        ReadData1,
        End1,
        Start2,
        ReadData2,
        End2,
    }
}

ssm_states! {
    enum CaptureState {
        Start,
        WaitFinger,
        ReadData,
        SaveFrame,
    }
}

pub struct Elan {
    config: ElanConfig,
    cmds: &'static [ElanCmd],
    cmd_timeout: u32,
    last_read: Vec<u8>,
    /// Usable frame width, the raw frame height.
    frame_width: usize,
    frame_height: usize,
    raw_frame_width: usize,
    frames: Vec<Vec<u16>>,
}

impl Elan {
    pub fn new(config: ElanConfig) -> Self {
        Self {
            config,
            cmds: &[],
            cmd_timeout: CMD_TIMEOUT,
            last_read: Vec::new(),
            frame_width: 0,
            frame_height: 0,
            raw_frame_width: 0,
            frames: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.cmds = &[];
        self.cmd_timeout = CMD_TIMEOUT;
        self.last_read.clear();
        self.frames.clear();
    }

    /// Run a command list as an `Exchange` sub-machine: a send and a
    /// receive state per command. `None` keeps the current timeout.
    fn run_cmds(&mut self, cmds: &'static [ElanCmd], timeout: Option<u32>) -> Step {
        self.cmds = cmds;
        if let Some(timeout) = timeout {
            self.cmd_timeout = timeout;
        }
        Step::Subsm(Ssm::new(Phase::Exchange, cmds.len() * 2))
    }

    fn response_len(&self, cmd: &ElanCmd) -> usize {
        match cmd.response {
            Response::None => 0,
            Response::Fixed(len) => len,
            // 2-byte pixels, vertical frame
            Response::Frame => self.raw_frame_width * self.frame_width * 2,
        }
    }

    fn exchange_state(&self, ssm: &Ssm) -> Step {
        let Some(cmd) = self.cmds.get(ssm.cur_state() / 2) else {
            return Step::Abort(FpError::protocol("command index out of range"));
        };
        if ssm.cur_state() % 2 == 0 {
            return Step::Submit(Transfer::bulk_out(EP_CMD_OUT, cmd.cmd, self.cmd_timeout));
        }
        match self.response_len(cmd) {
            0 => Step::Next,
            len => Step::Submit(Transfer::bulk_in(cmd.response_in, len, self.cmd_timeout)),
        }
    }

    fn set_sensor_dim(&mut self) -> Step {
        if self.last_read.len() < 4 {
            return Step::Abort(FpError::protocol("missing sensor dimensions"));
        }
        self.frame_width = self.last_read[2] as usize;
        self.raw_frame_width = self.last_read[0] as usize;
        if self.raw_frame_width <= 2 * FRAME_MARGIN || self.frame_width == 0 {
            return Step::Abort(FpError::protocol(format!(
                "implausible sensor dimensions {}x{}",
                self.raw_frame_width, self.frame_width
            )));
        }
        self.frame_height = self.raw_frame_width - 2 * FRAME_MARGIN;
        debug!(
            width = self.frame_width,
            height = self.frame_height,
            raw_width = self.raw_frame_width,
            "Sensor dimensions"
        );
        Step::Next
    }

    /// Raw frames are perpendicular to the swipe direction. Turn the last
    /// read horizontal and drop the margins.
    fn save_frame(&mut self) {
        let raw_height = self.frame_width;
        let raw_width = self.raw_frame_width;
        let raw: Vec<u16> = self
            .last_read
            .chunks_exact(2)
            .map(|px| u16::from_le_bytes([px[0], px[1]]))
            .collect();
        let mut frame = vec![0u16; self.frame_width * self.frame_height];
        for y in 0..raw_height {
            for x in FRAME_MARGIN..raw_width - FRAME_MARGIN {
                frame[y + (x - FRAME_MARGIN) * raw_height] = raw[x + y * raw_width];
            }
        }
        self.frames.push(frame);
        debug!(frames = self.frames.len(), "Frame saved");
    }

    fn asmbl_ctx(&self) -> FrameAsmblCtx {
        FrameAsmblCtx::new(
            self.frame_width,
            self.frame_height,
            self.frame_width * 3 / 2,
            PixelFormat::Gray8,
        )
    }

    fn submit_image(&mut self, host: &mut Host) {
        let keep = self.frames.len().saturating_sub(self.config.skip_last_frames);
        let mut strips: Vec<Frame> = self.frames[..keep]
            .iter()
            .map(|raw| Frame::new(normalize_u16(raw)))
            .collect();
        let ctx = self.asmbl_ctx();
        do_movement_estimation(&ctx, &mut strips);
        match assemble_frames(&ctx, &strips) {
            Ok(img) => host.image_captured(img.with_flags(ImageFlags::PARTIAL)),
            Err(e) => host.session_error(e),
        }
    }

    /// Either the frame cap was reached or the finger went away.
    fn capture_finished(&mut self, host: &mut Host) {
        if self.frames.len() >= self.config.min_frames {
            self.submit_image(host);
        } else {
            debug!(frames = self.frames.len(), "Capture too short");
            host.abort_scan(ScanRetry::TooShort);
        }
        host.report_finger_status(false);
        self.frames.clear();
    }

    fn capture(&mut self) -> Ssm {
        self.reset();
        Ssm::for_states::<CaptureState>(Phase::Capture)
    }
}

impl ImageDriver for Elan {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        self.reset();
        Ok(Ssm::for_states::<ActivateState>(Phase::Activate))
    }

    fn deactivate(&mut self, _host: &mut Host) -> Option<Ssm> {
        self.reset();
        Some(Ssm::new(Phase::Deactivate, 1))
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Exchange => self.exchange_state(ssm),
            Phase::Activate => match ssm.state::<ActivateState>() {
                Some(ActivateState::GetSensorDim) => self.run_cmds(GET_SENSOR_DIM_CMDS, Some(CMD_TIMEOUT)),
                Some(ActivateState::SetSensorDim) => self.set_sensor_dim(),
                Some(ActivateState::Start) => self.run_cmds(INIT_START_CMDS, Some(CMD_TIMEOUT)),
                Some(ActivateState::ReadData) => self.run_cmds(READ_CMDS, Some(CMD_TIMEOUT)),
                Some(ActivateState::End) => self.run_cmds(INIT_END_CMDS, Some(CMD_TIMEOUT)),
                None => Step::Abort(FpError::protocol("unknown activate state")),
            },
            Phase::Calibrate => match ssm.state::<CalibrateState>() {
                Some(CalibrateState::Start1) | Some(CalibrateState::Start2) => {
                    self.run_cmds(CALIBRATE_START_CMDS, Some(CMD_TIMEOUT))
                }
                Some(CalibrateState::ReadData1) | Some(CalibrateState::ReadData2) => {
                    self.run_cmds(READ_CMDS, Some(CMD_TIMEOUT))
                }
                _ => self.run_cmds(CALIBRATE_END_CMDS, Some(CMD_TIMEOUT)),
            },
            Phase::Capture => match ssm.state::<CaptureState>() {
                Some(CaptureState::Start) => self.run_cmds(CAPTURE_START_CMDS, Some(CMD_TIMEOUT)),
                Some(CaptureState::WaitFinger) => self.run_cmds(CAPTURE_WAIT_FINGER_CMDS, None),
                // 0x55 means finger present, 0xff an uncalibrated device
                Some(CaptureState::ReadData) => match self.last_read.first().copied() {
                    Some(FINGER_PRESENT) => {
                        host.report_finger_status(true);
                        self.run_cmds(READ_CMDS, Some(CMD_TIMEOUT))
                    }
                    other => {
                        debug!(status = ?other, "Unexpected finger wait answer");
                        Step::Abort(FpError::Capture(ScanRetry::Retry))
                    }
                },
                Some(CaptureState::SaveFrame) => {
                    self.save_frame();
                    if self.frames.len() < self.config.max_frames {
                        self.cmd_timeout = FINGER_TIMEOUT;
                        Step::jump(CaptureState::WaitFinger)
                    } else {
                        Step::Complete
                    }
                }
                None => Step::Abort(FpError::protocol("unknown capture state")),
            },
            Phase::Deactivate => self.run_cmds(DEACTIVATE_CMDS, Some(CMD_TIMEOUT)),
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, _host: &mut Host) -> Step {
        let data = match completion.check_full() {
            Ok(data) => data,
            Err(e) => return Step::Abort(e),
        };
        // Odd exchange states are receives
        if ssm.phase() == Phase::Exchange && ssm.cur_state() % 2 == 1 {
            self.last_read = data.to_vec();
        }
        Step::Next
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let state = ssm.cur_state();
        let result = ssm.into_result();

        if phase == Phase::Deactivate {
            if let Err(e) = result {
                debug!(error = %e, "LED off failed");
            }
            return None;
        }
        if host.is_deactivating() {
            self.reset();
            if phase == Phase::Activate || phase == Phase::Calibrate {
                host.activate_complete(Err(FpError::Cancelled));
            }
            return Some(Ssm::new(Phase::Deactivate, 1));
        }

        match (phase, result) {
            (Phase::Activate, Ok(())) => {
                self.reset();
                Some(Ssm::for_states::<CalibrateState>(Phase::Calibrate))
            }
            (Phase::Activate, Err(e)) | (Phase::Calibrate, Err(e)) => {
                host.activate_complete(Err(e));
                None
            }
            (Phase::Calibrate, Ok(())) => {
                host.activate_complete(Ok(()));
                Some(self.capture())
            }
            (_, Ok(())) => {
                self.capture_finished(host);
                Some(self.capture())
            }
            // A finger lifted mid-capture shows up as a timeout while
            // waiting for the next frame
            (_, Err(FpError::Timeout)) if state == CaptureState::WaitFinger.index() => {
                if self.frames.is_empty() {
                    debug!("No finger yet, waiting again");
                } else {
                    self.capture_finished(host);
                }
                Some(self.capture())
            }
            (_, Err(e)) => {
                host.session_error(e);
                None
            }
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
    use crate::transport::{MockTransport, TransferStatus};

    const RAW_WIDTH: usize = 2 * FRAME_MARGIN + 16;
    const WIDTH: usize = 24;

    fn pump(dev: &mut ImgDev<MockTransport>) {
        while dev.handle_events(Duration::ZERO).unwrap() {}
    }

    /// Raw frame whose usable part carries a gradient shifted by `shift`.
    fn raw_frame(shift: usize) -> Vec<u8> {
        let mut raw = Vec::with_capacity(RAW_WIDTH * WIDTH * 2);
        for y in 0..WIDTH {
            for x in 0..RAW_WIDTH {
                let v = ((x + shift) * 37 + y * y * 11) % 900 + 100;
                raw.extend_from_slice(&(v as u16).to_le_bytes());
            }
        }
        raw
    }

    fn active() -> (ImgDev<MockTransport>, MockTransport, Arc<RecordingObserver>) {
        let mock = MockTransport::with_ids(0x04f3, 0x0907);
        let obs = Arc::new(RecordingObserver::new());
        let mut dev =
            ImgDev::open_with_transport(mock.clone(), &DriverConfig::default(), obs.clone())
                .unwrap();
        dev.activate().unwrap();
        // Activation: dimensions, two init answers, a frame, init end
        mock.queue_read(&[RAW_WIDTH as u8, 0x00, WIDTH as u8, 0x00]);
        mock.queue_read(&[0x01, 0x00]);
        mock.queue_read(&[0x01, 0x00]);
        mock.queue_read(&raw_frame(0));
        mock.queue_read(&[0x00, 0x00]);
        // Calibration, twice: two start answers, a frame, end answer
        for _ in 0..2 {
            mock.queue_read(&[0x01]);
            mock.queue_read(&[0x01]);
            mock.queue_read(&raw_frame(0));
            mock.queue_read(&[0x00, 0x00]);
        }
        pump(&mut dev);
        (dev, mock, obs)
    }

    #[test]
    fn test_frame_is_transposed_and_trimmed() {
        let mut elan = Elan::new(ElanConfig::default());
        elan.raw_frame_width = RAW_WIDTH;
        elan.frame_width = WIDTH;
        elan.frame_height = RAW_WIDTH - 2 * FRAME_MARGIN;
        elan.last_read = raw_frame(0);
        elan.save_frame();

        let frame = &elan.frames[0];
        assert_eq!(frame.len(), WIDTH * elan.frame_height);
        // Raw pixel (x = margin + 3, y = 5) lands at (5, 3)
        let raw = u16::from_le_bytes([
            elan.last_read[2 * (FRAME_MARGIN + 3 + 5 * RAW_WIDTH)],
            elan.last_read[2 * (FRAME_MARGIN + 3 + 5 * RAW_WIDTH) + 1],
        ]);
        assert_eq!(frame[5 + 3 * WIDTH], raw);
    }

    #[test]
    fn test_activation_completes_after_calibration() {
        let (dev, mock, obs) = active();
        assert_eq!(obs.count("activate_complete"), 1);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
        // Capture started: LED on, then waiting for a finger
        let writes = mock.get_writes();
        assert_eq!(&writes[writes.len() - 2..], &[vec![0x40, 0x31], vec![0x40, 0x3f]]);
        assert!(mock.has_inflight());
    }

    #[test]
    fn test_finger_lift_ends_capture() {
        let (mut dev, mock, obs) = active();
        for i in 0..8 {
            mock.queue_read(&[FINGER_PRESENT]);
            mock.queue_read(&raw_frame(i * 2));
        }
        mock.queue_status(TransferStatus::TimedOut);
        pump(&mut dev);

        assert_eq!(obs.count("report_finger_status"), 2);
        let images = obs.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].width, WIDTH * 3 / 2);
        assert_eq!(
            obs.events().last(),
            Some(&FpEvent::FingerStatus { present: false })
        );
        // Back to waiting for the next finger
        assert!(mock.has_inflight());
    }

    #[test]
    fn test_short_capture_is_retried() {
        let (mut dev, mock, obs) = active();
        for i in 0..3 {
            mock.queue_read(&[FINGER_PRESENT]);
            mock.queue_read(&raw_frame(i));
        }
        mock.queue_status(TransferStatus::TimedOut);
        pump(&mut dev);

        assert!(obs.images().is_empty());
        assert_eq!(obs.count("abort_scan"), 1);
        assert_eq!(obs.count("session_error"), 0);
    }

    #[test]
    fn test_deactivate_turns_led_off() {
        let (mut dev, mock, obs) = active();
        mock.clear_writes();
        dev.deactivate().unwrap();
        pump(&mut dev);
        assert_eq!(mock.get_writes(), vec![vec![0x00, 0x0b]]);
        assert_eq!(obs.count("deactivate_complete"), 1);
        assert_eq!(obs.count("session_error"), 0);
    }
}
