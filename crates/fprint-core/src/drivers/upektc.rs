//! UPEK TouchChip and Eikon Touch 300 press sensors.
//!
//! Both parts run a vendor setup script and then answer one scan command
//! with a full frame. Finger presence is judged from the frame itself by
//! counting dark pixels, so detection and capture issue the same command.

use tracing::debug;

use super::aeslib::check_transfer;
use crate::config::{SetupCmd, UpekTcConfig};
use crate::error::FpError;
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::image::Image;
use crate::ssm::{Phase, Ssm, SsmState, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const BULK_TIMEOUT: u32 = 4000;
pub const CMD_LEN: usize = 0x40;

const IMAGE_WIDTH: usize = 208;
const IMAGE_HEIGHT: usize = 288;
pub const IMAGE_SIZE: usize = IMAGE_WIDTH * IMAGE_HEIGHT;

/// Pixels darker than this count towards finger presence.
const DARK_PIXEL: u8 = 160;

pub static INFO: DriverInfo = DriverInfo {
    name: "upektc",
    full_name: "UPEK TouchChip/Eikon Touch 300",
    id_table: &[(0x0483, 0x2015), (0x147e, 0x3001)],
    img_width: Some(IMAGE_WIDTH),
    img_height: Some(IMAGE_HEIGHT),
    bz3_threshold: Some(30),
    interface: 0,
};

/// Endpoints and detection threshold of one reader variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variant {
    pub ep_in: u8,
    pub ep_out: u8,
    pub sum_threshold: usize,
}

pub const TOUCHCHIP: Variant = Variant {
    ep_in: 0x82,
    ep_out: 0x03,
    sum_threshold: 10000,
};

pub const EIKON_TOUCH: Variant = Variant {
    ep_in: 0x81,
    ep_out: 0x02,
    sum_threshold: 5000,
};

ssm_states! {
    enum ActivateState {
        WriteInit,
        ReadData,
    }
}

ssm_states! {
    enum FingerDetState {
        WriteCmd,
        ReadData,
    }
}

ssm_states! {
    enum CaptureState {
        WriteCmd,
        ReadData,
    }
}

/// Whether enough of the frame is covered.
pub fn finger_present(img: &[u8], sum_threshold: usize) -> bool {
    let sum = img.iter().filter(|&&p| p < DARK_PIXEL).count();
    debug!(sum, "Dark pixel count");
    sum >= sum_threshold
}

pub struct UpekTc {
    variant: Variant,
    setup: Vec<SetupCmd>,
    scan_cmd: Vec<u8>,
    init_idx: usize,
}

impl UpekTc {
    pub fn new(config: &UpekTcConfig, pid: u16) -> Result<Self, FpError> {
        let (variant, setup) = match pid {
            0x2015 => (TOUCHCHIP, &config.touchchip_setup),
            0x3001 => (EIKON_TOUCH, &config.eikon_setup),
            _ => return Err(FpError::Resource(format!("unknown upektc variant {:04x}", pid))),
        };
        if setup.is_empty() {
            return Err(FpError::Config(format!("upektc: no setup script for {:04x}", pid)));
        }
        if let Some(bad) = setup.iter().find(|s| s.cmd.len() != CMD_LEN) {
            return Err(FpError::Config(format!(
                "upektc: setup commands must be {} bytes, got {}",
                CMD_LEN,
                bad.cmd.len()
            )));
        }
        if config.scan_cmd.len() != CMD_LEN {
            return Err(FpError::Config(format!("upektc: scan_cmd must be {} bytes", CMD_LEN)));
        }
        Ok(Self {
            variant,
            setup: setup.clone(),
            scan_cmd: config.scan_cmd.clone(),
            init_idx: 0,
        })
    }

    fn write(&self, data: &[u8]) -> Step {
        Step::Submit(Transfer::bulk_out(self.variant.ep_out, data, BULK_TIMEOUT))
    }

    fn read(&self, len: usize) -> Step {
        Step::Submit(Transfer::bulk_in(self.variant.ep_in, len, BULK_TIMEOUT))
    }

    fn next_init_cmd(&mut self) -> Step {
        self.init_idx += 1;
        if self.init_idx == self.setup.len() {
            Step::Complete
        } else {
            Step::jump(ActivateState::WriteInit)
        }
    }

    fn run_activate(&self, ssm: &Ssm) -> Step {
        let Some(cmd) = self.setup.get(self.init_idx) else {
            return Step::Abort(FpError::protocol("setup command out of range"));
        };
        match ssm.state::<ActivateState>() {
            Some(ActivateState::WriteInit) => self.write(&cmd.cmd),
            _ => self.read(cmd.response_len),
        }
    }

    fn activate_done(&mut self, ssm: &Ssm, completion: &Completion) -> Step {
        if ssm.cur_state() == ActivateState::WriteInit.index() {
            if let Err(e) = completion.check_full() {
                return Step::Abort(e);
            }
            if self.setup[self.init_idx].response_len > 0 {
                return Step::Next;
            }
            return self.next_init_cmd();
        }
        // Replies are not interpreted
        match completion.check_status() {
            Ok(()) => self.next_init_cmd(),
            Err(e) => Step::Abort(e),
        }
    }
}

impl ImageDriver for UpekTc {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        self.init_idx = 0;
        Ok(Ssm::for_states::<ActivateState>(Phase::Activate))
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Activate => self.run_activate(ssm),
            Phase::FingerDetect | Phase::Capture => {
                if ssm.cur_state() == FingerDetState::WriteCmd.index() {
                    if host.is_deactivating() {
                        return Step::Complete;
                    }
                    self.write(&self.scan_cmd)
                } else {
                    self.read(IMAGE_SIZE)
                }
            }
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        match (ssm.phase(), ssm.cur_state()) {
            (Phase::Activate, _) => self.activate_done(ssm, &completion),
            (Phase::FingerDetect, s) if s == FingerDetState::ReadData.index() => {
                let data = match completion.check_full() {
                    Ok(data) => data,
                    Err(e) => return Step::Abort(e),
                };
                if finger_present(data, self.variant.sum_threshold) {
                    host.report_finger_status(true);
                    Step::Complete
                } else {
                    Step::jump(FingerDetState::WriteCmd)
                }
            }
            (Phase::Capture, s) if s == CaptureState::ReadData.index() => {
                let data = match completion.check_full() {
                    Ok(data) => data,
                    Err(e) => return Step::Abort(e),
                };
                host.image_captured(Image::from_data(IMAGE_WIDTH, IMAGE_HEIGHT, data.to_vec()));
                host.report_finger_status(false);
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
    use crate::events::{FpEvent, RecordingObserver};
    use crate::imgdev::{AcquireState, ImgDev};
    use crate::transport::MockTransport;

    fn pump(dev: &mut ImgDev<MockTransport>) {
        while dev.handle_events(Duration::ZERO).unwrap() {}
    }

    fn config() -> DriverConfig {
        let mut config = DriverConfig::default();
        config.upektc.touchchip_setup = vec![
            SetupCmd { cmd: vec![0x01; CMD_LEN], response_len: 0 },
            SetupCmd { cmd: vec![0x02; CMD_LEN], response_len: 8 },
            SetupCmd { cmd: vec![0x03; CMD_LEN], response_len: 0 },
        ];
        config.upektc.eikon_setup = vec![SetupCmd { cmd: vec![0x04; CMD_LEN], response_len: 4 }];
        config.upektc.scan_cmd = vec![0x0e; CMD_LEN];
        config
    }

    fn active(pid: u16) -> (ImgDev<MockTransport>, MockTransport, Arc<RecordingObserver>) {
        let mock = MockTransport::with_ids(if pid == 0x2015 { 0x0483 } else { 0x147e }, pid);
        let obs = Arc::new(RecordingObserver::new());
        let mut dev = ImgDev::open_with_transport(mock.clone(), &config(), obs.clone()).unwrap();
        assert_eq!(dev.info().name, "upektc");
        dev.activate().unwrap();
        mock.queue_read(&[0u8; 8]);
        mock.queue_read(&[0u8; 4]);
        pump(&mut dev);
        assert_eq!(obs.events(), vec![FpEvent::ActivateComplete { result: Ok(()) }]);
        (dev, mock, obs)
    }

    fn frame(dark: usize) -> Vec<u8> {
        let mut data = vec![0xff; IMAGE_SIZE];
        data[..dark].fill(0x20);
        data
    }

    #[test]
    fn test_finger_present_counts_dark_pixels() {
        assert!(!finger_present(&frame(9999), TOUCHCHIP.sum_threshold));
        assert!(finger_present(&frame(10000), TOUCHCHIP.sum_threshold));
        assert!(finger_present(&frame(5000), EIKON_TOUCH.sum_threshold));
    }

    #[test]
    fn test_setup_reads_only_when_reply_expected() {
        let (_dev, mock, _obs) = active(0x2015);
        let transfers = mock.transfers();
        assert_eq!(transfers[0], Transfer::bulk_out(0x03, vec![0x01; CMD_LEN], BULK_TIMEOUT));
        assert_eq!(transfers[1], Transfer::bulk_out(0x03, vec![0x02; CMD_LEN], BULK_TIMEOUT));
        assert_eq!(transfers[2], Transfer::bulk_in(0x82, 8, BULK_TIMEOUT));
        assert_eq!(transfers[3], Transfer::bulk_out(0x03, vec![0x03; CMD_LEN], BULK_TIMEOUT));
        // Detection starts right away
        assert_eq!(transfers[4], Transfer::bulk_out(0x03, vec![0x0e; CMD_LEN], BULK_TIMEOUT));
    }

    #[test]
    fn test_eikon_uses_its_endpoints() {
        let (_dev, mock, _obs) = active(0x3001);
        let transfers = mock.transfers();
        assert_eq!(transfers[0], Transfer::bulk_out(0x02, vec![0x04; CMD_LEN], BULK_TIMEOUT));
        assert_eq!(transfers[1], Transfer::bulk_in(0x81, 4, BULK_TIMEOUT));
        assert_eq!(mock.transfers().last(), Some(&Transfer::bulk_in(0x81, IMAGE_SIZE, BULK_TIMEOUT)));
    }

    #[test]
    fn test_detect_then_capture() {
        let (mut dev, mock, obs) = active(0x2015);
        mock.queue_read(&frame(100));
        pump(&mut dev);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);

        mock.queue_read(&frame(IMAGE_SIZE));
        mock.queue_read(&frame(20000));
        pump(&mut dev);
        let images = obs.images();
        assert_eq!(images.len(), 1);
        assert_eq!((images[0].width, images[0].height), (IMAGE_WIDTH, IMAGE_HEIGHT));
        assert_eq!(obs.count("report_finger_status"), 2);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
    }

    #[test]
    fn test_short_frame_is_session_error() {
        let (mut dev, mock, obs) = active(0x2015);
        mock.queue_read(&[0u8; 100]);
        pump(&mut dev);
        assert_eq!(obs.count("session_error"), 1);
        assert!(dev.is_idle());
    }

    #[test]
    fn test_bad_config_rejected() {
        let mut config = config().upektc;
        config.scan_cmd.truncate(10);
        assert!(matches!(UpekTc::new(&config, 0x2015), Err(FpError::Config(_))));
        assert!(matches!(
            UpekTc::new(&UpekTcConfig::default(), 0x3001),
            Err(FpError::Config(_))
        ));
    }

    #[test]
    fn test_deactivate_while_detecting() {
        let (mut dev, mock, obs) = active(0x2015);
        dev.deactivate().unwrap();
        pump(&mut dev);
        assert_eq!(obs.count("deactivate_complete"), 1);
        assert!(!mock.has_inflight());
    }
}
