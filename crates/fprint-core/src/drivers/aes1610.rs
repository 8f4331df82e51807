//! AuthenTec AES1610 swipe sensor.
//!
//! The sensor delivers 128x8 strips of 4-bit pixels. Finger presence comes
//! from a histogram read, gain follows the histogram of every strip, and
//! capture ends after a run of blank strips or at the strip cap.

use tracing::debug;

use super::aeslib::{BULK_TIMEOUT, EP_IN, RegWrite, RegWriter, check_transfer};
use crate::assembling::{Frame, FrameAsmblCtx, PixelFormat, assemble_frames, do_movement_estimation};
use crate::config::Aes1610Config;
use crate::error::FpError;
use crate::image::ImageFlags;
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, SsmState, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const FRAME_WIDTH: usize = 128;
const FRAME_HEIGHT: usize = 8;
const IMAGE_WIDTH: usize = FRAME_WIDTH + FRAME_WIDTH / 2;
const STRIP_LEN: usize = FRAME_WIDTH * FRAME_HEIGHT / 2;
const STRIP_READ_LEN: usize = 665;
const HISTOGRAM_LEN: usize = 19;

pub static INFO: DriverInfo = DriverInfo {
    name: "aes1610",
    full_name: "AuthenTec AES1610",
    id_table: &[(0x08ff, 0x1600)],
    img_width: Some(IMAGE_WIDTH),
    img_height: None,
    bz3_threshold: Some(20),
    interface: 0,
};

const INIT: &[RegWrite] = &[RegWrite::new(0x82, 0x00)];

const FINGER_DET_REQS: &[RegWrite] = &[
    RegWrite::new(0x80, 0x01),
    RegWrite::new(0x80, 0x12),
    RegWrite::new(0x85, 0x00),
    RegWrite::new(0x8A, 0x00),
    RegWrite::new(0x8B, 0x0E),
    RegWrite::new(0x8C, 0x90),
    RegWrite::new(0x8D, 0x83),
    RegWrite::new(0x8E, 0x07),
    RegWrite::new(0x8F, 0x07),
    RegWrite::new(0x96, 0x00),
    RegWrite::new(0x97, 0x48),
    RegWrite::new(0xA1, 0x00),
    RegWrite::new(0xA2, 0x50),
    RegWrite::new(0xA6, 0xE4),
    RegWrite::new(0xAD, 0x08),
    RegWrite::new(0xAE, 0x5B),
    RegWrite::new(0xAF, 0x54),
    RegWrite::new(0xB1, 0x28),
    RegWrite::new(0xB5, 0xAB),
    RegWrite::new(0xB6, 0x0E),
    RegWrite::new(0x1B, 0x2D),
    RegWrite::new(0x81, 0x04),
];

const CAPTURE_REQS: &[RegWrite] = &[
    RegWrite::new(0x80, 0x01),
    RegWrite::new(0x80, 0x12),
    RegWrite::new(0x84, 0x01),
    RegWrite::new(0x85, 0x00),
    RegWrite::new(0x89, 0x64),
    RegWrite::new(0x8A, 0x00),
    RegWrite::new(0x8B, 0x0E),
    RegWrite::new(0x8C, 0x90),
    RegWrite::new(0xBE, 0x23),
    RegWrite::new(0x29, 0x04),
    RegWrite::new(0x2A, 0xFF),
    RegWrite::new(0x96, 0x00),
    RegWrite::new(0x98, 0x03),
    RegWrite::new(0x99, 0x00),
    RegWrite::new(0x9C, 0xA5),
    RegWrite::new(0x9D, 0x40),
    RegWrite::new(0x9E, 0xC6),
    RegWrite::new(0x9F, 0x8E),
    RegWrite::new(0xA2, 0x50),
    RegWrite::new(0xA3, 0xF0),
    RegWrite::new(0xAD, 0x08),
    RegWrite::new(0xBD, 0x4F),
    RegWrite::new(0xAF, 0x54),
    RegWrite::new(0xB1, 0x08),
    RegWrite::new(0xB5, 0xAB),
    RegWrite::new(0x1B, 0x2D),
    RegWrite::new(0xB6, 0x4E),
    RegWrite::new(0xB8, 0x70),
    RegWrite::new(0x2B, 0xB3),
    RegWrite::new(0x2C, 0x5D),
    RegWrite::new(0x2D, 0x98),
    RegWrite::new(0x2E, 0xB0),
    RegWrite::new(0x2F, 0x20),
    RegWrite::new(0xA2, 0xD0),
    RegWrite::new(0x1D, 0x21),
    RegWrite::new(0x1E, 0xBE),
    RegWrite::new(0x1C, 0x00),
    RegWrite::new(0x1D, 0x30),
    RegWrite::new(0x1E, 0x29),
    RegWrite::new(0x1C, 0x01),
    RegWrite::new(0x1D, 0x00),
    RegWrite::new(0x1E, 0x9E),
    RegWrite::new(0x1C, 0x02),
    RegWrite::new(0x1D, 0x30),
    RegWrite::new(0x1E, 0xBB),
    RegWrite::new(0x1C, 0x03),
    RegWrite::new(0x1D, 0x00),
    RegWrite::new(0x1E, 0x9D),
    RegWrite::new(0x1C, 0x04),
    RegWrite::new(0x1D, 0x22),
    RegWrite::new(0x1E, 0xFF),
    RegWrite::new(0x1C, 0x05),
    RegWrite::new(0x1D, 0x1B),
    RegWrite::new(0x1E, 0x4E),
    RegWrite::new(0x1C, 0x06),
    RegWrite::new(0x1D, 0x16),
    RegWrite::new(0x1E, 0x28),
    RegWrite::new(0x1C, 0x07),
    RegWrite::new(0x1D, 0x22),
    RegWrite::new(0x1E, 0xFF),
    RegWrite::new(0x1C, 0x08),
    RegWrite::new(0x1D, 0x15),
    RegWrite::new(0x1E, 0xF1),
    RegWrite::new(0x1C, 0x09),
    RegWrite::new(0x1D, 0x30),
    RegWrite::new(0x1E, 0xD5),
    RegWrite::new(0x1C, 0x0A),
    RegWrite::new(0x1D, 0x00),
    RegWrite::new(0x1E, 0x9E),
    RegWrite::new(0x1C, 0x0B),
    RegWrite::new(0x1D, 0x17),
    RegWrite::new(0x1E, 0x9D),
    RegWrite::new(0x1C, 0x0C),
    RegWrite::new(0x1D, 0x28),
    RegWrite::new(0x1E, 0xD7),
    RegWrite::new(0x1C, 0x0D),
    RegWrite::new(0x1D, 0x17),
    RegWrite::new(0x1E, 0xD7),
    RegWrite::new(0x1C, 0x0E),
    RegWrite::new(0x1D, 0x0A),
    RegWrite::new(0x1E, 0xCB),
    RegWrite::new(0x1C, 0x0F),
    RegWrite::new(0x1D, 0x24),
    RegWrite::new(0x1E, 0x14),
    RegWrite::new(0x1C, 0x10),
    RegWrite::new(0x1D, 0x17),
    RegWrite::new(0x1E, 0x85),
    RegWrite::new(0x1C, 0x11),
    RegWrite::new(0x1D, 0x15),
    RegWrite::new(0x1E, 0x71),
    RegWrite::new(0x1C, 0x12),
    RegWrite::new(0x1D, 0x2B),
    RegWrite::new(0x1E, 0x36),
    RegWrite::new(0x1C, 0x13),
    RegWrite::new(0x1D, 0x12),
    RegWrite::new(0x1E, 0x06),
    RegWrite::new(0x1C, 0x14),
    RegWrite::new(0x1D, 0x30),
    RegWrite::new(0x1E, 0x97),
    RegWrite::new(0x1C, 0x15),
    RegWrite::new(0x1D, 0x21),
    RegWrite::new(0x1E, 0x32),
    RegWrite::new(0x1C, 0x16),
    RegWrite::new(0x1D, 0x06),
    RegWrite::new(0x1E, 0xE6),
    RegWrite::new(0x1C, 0x17),
    RegWrite::new(0x1D, 0x16),
    RegWrite::new(0x1E, 0x06),
    RegWrite::new(0x1C, 0x18),
    RegWrite::new(0x1D, 0x30),
    RegWrite::new(0x1E, 0x01),
    RegWrite::new(0x1C, 0x19),
    RegWrite::new(0x1D, 0x21),
    RegWrite::new(0x1E, 0x37),
    RegWrite::new(0x1C, 0x1A),
    RegWrite::new(0x1D, 0x00),
    RegWrite::new(0x1E, 0x08),
    RegWrite::new(0x1C, 0x1B),
    RegWrite::new(0x1D, 0x80),
    RegWrite::new(0x1E, 0xD5),
    RegWrite::new(0xA2, 0x50),
    RegWrite::new(0xA2, 0x50),
    RegWrite::new(0x81, 0x01),
];

const STRIP_SCAN_REQS: [RegWrite; 5] = [
    RegWrite::new(0xBE, 0x23),
    RegWrite::new(0x29, 0x04),
    RegWrite::new(0x2A, 0xFF),
    RegWrite::new(0xBD, 0x4F),
    RegWrite::new(0xFF, 0x00),
];

const CAPTURE_STOP: &[RegWrite] = &[RegWrite::new(0x81, 0x00)];

const BE_VALUES: [u8; 8] = [0x23, 0x43, 0x63, 0x64, 0x65, 0x67, 0x6A, 0x6B];
const BD_VALUES: [u8; 7] = [0x28, 0x2b, 0x30, 0x3b, 0x45, 0x49, 0x4B];

/// Indices of the gain registers inside the capture script.
const CAPTURE_GAIN_SLOTS: [usize; 4] = [8, 9, 10, 21];

ssm_states! {
    enum ActivateState {
        WriteInit,
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
        WriteReqs,
        ReadData,
        RequestStrip,
        ReadStrip,
        Stop,
    }
}

/// Gain adaptation state. Both scripts live per device and are mutated
/// as histograms come in.
#[derive(Debug, Clone)]
struct Gain {
    strip_scan_reqs: [RegWrite; 5],
    capture_reqs: Vec<RegWrite>,
    pos_be: usize,
    pos_bd: usize,
}

impl Gain {
    fn new() -> Self {
        Self {
            strip_scan_reqs: STRIP_SCAN_REQS,
            capture_reqs: CAPTURE_REQS.to_vec(),
            pos_be: 0,
            pos_bd: 0,
        }
    }

    fn commit_to_capture(&mut self) {
        for (slot, req) in CAPTURE_GAIN_SLOTS.iter().zip(&self.strip_scan_reqs) {
            self.capture_reqs[*slot].value = req.value;
        }
    }

    /// First adjustment, from the finger detection histogram.
    fn adjust_first(&mut self, histogram: &[u8]) {
        let values = if histogram[1] > 0x78 {
            [0x6B, 0x06, 0x35, 0x4B]
        } else if histogram[1] > 0x55 {
            [0x63, 0x15, 0x35, 0x3b]
        } else if histogram[1] > 0x40 || histogram[16] > 0x19 {
            [0x43, 0x13, 0x35, 0x30]
        } else {
            [0x23, 0x07, 0x35, 0x28]
        };
        for (req, value) in self.strip_scan_reqs.iter_mut().zip(values) {
            req.value = value;
        }
        self.commit_to_capture();
        debug!(gain = ?values, "First gain");
    }

    /// Softened adjustment from the histogram trailing a strip.
    fn adjust_normal(&mut self, strip: &[u8]) {
        let (be_target, bd_target, reg29) = if strip[514] > 0x78 {
            (7, 6, 0x04)
        } else if strip[514] > 0x55 {
            (2, 2, 0x15)
        } else if strip[514] > 0x40 || strip[529] > 0x19 {
            (1, 1, 0x13)
        } else {
            (0, 0, 0x07)
        };
        self.pos_be = step_towards(self.pos_be, be_target);
        self.pos_bd = step_towards(self.pos_bd, bd_target);

        self.strip_scan_reqs[0].value = BE_VALUES[self.pos_be];
        self.strip_scan_reqs[1].value = reg29;
        self.strip_scan_reqs[2].value = 0x35;
        self.strip_scan_reqs[3].value = BD_VALUES[self.pos_bd];
        debug!(be = self.pos_be, bd = self.pos_bd, "Gain adjusted");
    }

    /// Back to the power-on scripts once a capture is over.
    fn restore(&mut self) {
        self.strip_scan_reqs = STRIP_SCAN_REQS;
        for slot in CAPTURE_GAIN_SLOTS {
            self.capture_reqs[slot] = CAPTURE_REQS[slot];
        }
        self.pos_be = 0;
        self.pos_bd = 0;
    }
}

fn step_towards(pos: usize, target: usize) -> usize {
    match pos.cmp(&target) {
        std::cmp::Ordering::Less => pos + 1,
        std::cmp::Ordering::Greater => pos - 1,
        std::cmp::Ordering::Equal => pos,
    }
}

pub struct Aes1610 {
    config: Aes1610Config,
    regs: RegWriter,
    gain: Gain,
    strips: Vec<Frame>,
    blanks_count: u32,
}

impl Aes1610 {
    pub fn new(config: Aes1610Config) -> Self {
        Self {
            config,
            regs: RegWriter::new(),
            gain: Gain::new(),
            strips: Vec::new(),
            blanks_count: 0,
        }
    }

    fn asmbl_ctx() -> FrameAsmblCtx {
        FrameAsmblCtx::new(FRAME_WIDTH, FRAME_HEIGHT, IMAGE_WIDTH, PixelFormat::AesPacked4)
    }

    fn reset_capture(&mut self) {
        self.strips.clear();
        self.blanks_count = 0;
    }

    fn finger_detected(&mut self, data: &[u8], host: &mut Host) -> Step {
        let sum: u32 = data[3..17]
            .iter()
            .map(|&b| (b & 0x0f) as u32 + (b >> 4) as u32)
            .sum();
        if sum > self.config.finger_threshold {
            self.gain.adjust_first(data);
            host.report_finger_status(true);
            Step::Complete
        } else {
            Step::jump(FingerDetState::WriteReqs)
        }
    }

    fn strip_read(&mut self, data: &[u8], host: &mut Host) -> Step {
        // Histogram bins 10..15 tell whether the finger is still there
        let sum: u32 = data[516..530].iter().map(|&b| b as u32).sum();
        debug!(sum, strips = self.strips.len(), "Strip read");

        if sum > 0 {
            self.strips.push(Frame::new(data[1..1 + STRIP_LEN].to_vec()));
            self.blanks_count = 0;
        } else {
            self.blanks_count += 1;
            debug!("Got blank frame");
        }

        self.gain.adjust_normal(data);

        if self.blanks_count > self.config.max_blank_strips
            || self.strips.len() >= self.config.max_frames
        {
            debug!(blanks = self.blanks_count, frames = self.strips.len(), "Sending stop capture");
            self.submit_image(host);
            host.report_finger_status(false);
            self.gain.restore();
            Step::jump(CaptureState::Stop)
        } else {
            Step::jump(CaptureState::RequestStrip)
        }
    }

    fn submit_image(&mut self, host: &mut Host) {
        let ctx = Self::asmbl_ctx();
        let mut strips = std::mem::take(&mut self.strips);
        self.blanks_count = 0;
        do_movement_estimation(&ctx, &mut strips);
        match assemble_frames(&ctx, &strips) {
            Ok(img) => host.image_captured(img.with_flags(ImageFlags::PARTIAL)),
            Err(e) => host.session_error(e),
        }
    }
}

impl ImageDriver for Aes1610 {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        Ok(Ssm::for_states::<ActivateState>(Phase::Activate))
    }

    fn deactivate(&mut self, _host: &mut Host) -> Option<Ssm> {
        self.reset_capture();
        None
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::WriteRegs => self.regs.run_state(ssm),
            Phase::Activate => self.regs.write(INIT),
            Phase::FingerDetect => match ssm.state::<FingerDetState>() {
                Some(FingerDetState::WriteReqs) => {
                    if host.is_deactivating() {
                        Step::Complete
                    } else {
                        self.regs.write(FINGER_DET_REQS)
                    }
                }
                _ => Step::Submit(Transfer::bulk_in(EP_IN, HISTOGRAM_LEN, BULK_TIMEOUT)),
            },
            Phase::Capture => match ssm.state::<CaptureState>() {
                Some(CaptureState::WriteReqs) => self.regs.write(&self.gain.capture_reqs),
                Some(CaptureState::RequestStrip) => {
                    if host.is_deactivating() {
                        Step::Complete
                    } else {
                        self.regs.write(&self.gain.strip_scan_reqs)
                    }
                }
                Some(CaptureState::ReadData) | Some(CaptureState::ReadStrip) => {
                    Step::Submit(Transfer::bulk_in(EP_IN, STRIP_READ_LEN, BULK_TIMEOUT))
                }
                Some(CaptureState::Stop) => self.regs.write(CAPTURE_STOP),
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
            self.reset_capture();
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

    fn open() -> (ImgDev<MockTransport>, MockTransport, Arc<RecordingObserver>) {
        let mock = MockTransport::with_ids(0x08ff, 0x1600);
        let obs = Arc::new(RecordingObserver::new());
        let dev = ImgDev::open(DriverKind::Aes1610, mock.clone(), &DriverConfig::default(), obs.clone())
            .unwrap();
        (dev, mock, obs)
    }

    fn histogram(level: u8) -> Vec<u8> {
        let mut data = vec![0u8; HISTOGRAM_LEN];
        data[1] = level;
        for b in &mut data[3..17] {
            *b = 0x22;
        }
        data
    }

    #[test]
    fn test_first_gain_from_histogram() {
        let mut gain = Gain::new();
        gain.adjust_first(&histogram(0x80));
        let values: Vec<u8> = gain.strip_scan_reqs[..4].iter().map(|r| r.value).collect();
        assert_eq!(values, vec![0x6B, 0x06, 0x35, 0x4B]);
        assert_eq!(gain.capture_reqs[8].value, 0x6B);
        assert_eq!(gain.capture_reqs[21].value, 0x4B);
    }

    #[test]
    fn test_gain_restore_is_idempotent() {
        let initial = Gain::new();
        let mut gain = initial.clone();
        gain.adjust_first(&histogram(0x60));
        let mut strip = vec![0u8; STRIP_READ_LEN];
        strip[514] = 0x90;
        gain.adjust_normal(&strip);
        gain.restore();
        for slot in CAPTURE_GAIN_SLOTS {
            assert_eq!(gain.capture_reqs[slot], initial.capture_reqs[slot]);
        }
    }

    #[test]
    fn test_activation_and_finger_detection() {
        let (mut dev, mock, obs) = open();
        dev.activate().unwrap();
        pump(&mut dev);
        assert_eq!(obs.count("activate_complete"), 1);

        // Finger detection script went out and the histogram read waits
        assert_eq!(mock.get_writes().len(), 3);
        mock.queue_read(&histogram(0x80));
        pump(&mut dev);

        assert_eq!(
            obs.events().last(),
            Some(&FpEvent::FingerStatus { present: true })
        );
        // Capture script carries the adapted gain
        let writes = mock.get_writes();
        assert!(writes[3..].concat().windows(2).any(|w| w == [0xBE, 0x6B]));
    }

    #[test]
    fn test_blank_strips_end_capture_without_image() {
        let (mut dev, mock, obs) = open();
        dev.activate().unwrap();
        pump(&mut dev);
        mock.queue_read(&histogram(0x30));
        pump(&mut dev);

        // Capture warm-up read, then only blank strips
        for _ in 0..12 {
            mock.queue_read(&vec![0u8; STRIP_READ_LEN]);
            pump(&mut dev);
        }

        assert!(obs.images().is_empty());
        assert_eq!(obs.count("abort_scan"), 1);
        assert_eq!(
            obs.events().last(),
            Some(&FpEvent::FingerStatus { present: false })
        );
    }

    #[test]
    fn test_capture_stops_at_frame_cap() {
        let mock = MockTransport::with_ids(0x08ff, 0x1600);
        let obs = Arc::new(RecordingObserver::new());
        let mut config = DriverConfig::default();
        config.aes1610.max_frames = 4;
        let mut dev = ImgDev::open(DriverKind::Aes1610, mock.clone(), &config, obs.clone()).unwrap();
        dev.activate().unwrap();
        pump(&mut dev);
        mock.queue_read(&histogram(0x30));
        pump(&mut dev);

        // Finger stays on: every strip has histogram weight
        let mut strip = vec![0u8; STRIP_READ_LEN];
        strip[1..1 + STRIP_LEN].fill(0x55);
        strip[516..530].fill(0x01);
        mock.queue_read(&strip);
        pump(&mut dev);
        for _ in 0..3 {
            mock.queue_read(&strip);
            pump(&mut dev);
        }
        assert!(obs.images().is_empty());

        mock.queue_read(&strip);
        pump(&mut dev);
        let images = obs.images();
        assert_eq!(images.len(), 1);
        // Flat strips advance one row each
        assert_eq!(images[0].height, FRAME_HEIGHT + 4 - 1);
        assert_eq!(obs.count("abort_scan"), 0);
        assert_eq!(
            obs.events().last(),
            Some(&FpEvent::FingerStatus { present: false })
        );
    }

    #[test]
    fn test_deactivate_mid_capture() {
        let (mut dev, mock, obs) = open();
        dev.activate().unwrap();
        pump(&mut dev);
        mock.queue_read(&histogram(0x30));
        pump(&mut dev);
        assert!(mock.has_inflight());

        dev.deactivate().unwrap();
        pump(&mut dev);

        assert_eq!(obs.count("deactivate_complete"), 1);
        assert_eq!(obs.count("session_error"), 0);
        assert!(obs.images().is_empty());
        assert!(dev.is_idle());
    }
}
