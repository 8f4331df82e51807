//! Validity VFS301 and VFS300 swipe sensors.
//!
//! The host writes commands to one bulk endpoint and reads short answers
//! from a control-data endpoint and scan data from a second one. The long
//! init exchange replays vendor fragments from [`Vfs301Config`]; it is run
//! as a script of sends and receives, one transfer per state.

use tracing::{debug, warn};

use super::vfslib::{Action, UsbExchange, recv, send, variable_order};
use crate::config::Vfs301Config;
use crate::error::{FpError, ScanRetry};
use crate::image::{Image, ImageFlags};
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const EP_OUT: u8 = 0x01;
const EP_CTRL: u8 = 0x81;
const EP_DATA: u8 = 0x82;
const DEFAULT_WAIT_TIMEOUT: u32 = 300;
/// Maximum wait for one block of scan data.
const RECV_TIMEOUT: u32 = 2000;
const RECV_LEN_FIRST: usize = 84032;
const RECV_LEN_NEXT: usize = 84096;

const FP_WIDTH: usize = 200;
/// Size of one line record in the scan stream.
const FRAME_SIZE: usize = 288;
const LINE_SCAN_OFFSET: usize = 8;
/// Minimum mean difference for a line to count as new.
const LINE_DIFF_THRESHOLD: usize = 15;
const POLL_INTERVAL_MS: u64 = 200;

const NEXT_SCAN_MARK: [u8; 4] = [0xde, 0xad, 0xde, 0xad];
const NEXT_SCAN_FA00: u16 = 0xfa00;

const NO_EVENT: [u8; 7] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
const GOT_EVENT: [u8; 7] = [0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00];

pub static INFO: DriverInfo = DriverInfo {
    name: "vfs301",
    full_name: "Validity VFS301",
    id_table: &[(0x138a, 0x0005), (0x138a, 0x0008)],
    img_width: Some(FP_WIDTH),
    img_height: None,
    bz3_threshold: Some(24),
    interface: 0,
};

/// Vendor fragments and the messages built from them.
#[derive(Debug, Clone)]
struct Messages {
    init_06: [Vec<u8>; 4],
    init_02d0: [Vec<u8>; 7],
    init_0220: [Vec<u8>; 3],
    msg_12: Vec<u8>,
    msg_24: Vec<u8>,
    next_scan: Vec<u8>,
    /// Offset of the subtype field inside `next_scan`.
    next_scan_field: usize,
}

fn fragments<const N: usize>(name: &str, list: &[Vec<u8>]) -> Result<[Vec<u8>; N], FpError> {
    if list.iter().any(Vec::is_empty) {
        return Err(FpError::Config(format!("vfs301: empty {} fragment", name)));
    }
    list.to_vec().try_into().map_err(|v: Vec<Vec<u8>>| {
        FpError::Config(format!(
            "vfs301: expected {} {} fragments, got {}",
            N,
            name,
            v.len()
        ))
    })
}

impl Messages {
    fn from_config(config: &Vfs301Config) -> Result<Self, FpError> {
        let blob = |name: &str, data: &Vec<u8>| {
            if data.is_empty() {
                Err(FpError::Config(format!("vfs301: {} missing", name)))
            } else {
                Ok(data.clone())
            }
        };
        let next_scan = blob("next scan template", &config.next_scan_template)?;
        let next_scan_field = next_scan
            .windows(NEXT_SCAN_MARK.len())
            .rposition(|w| w == NEXT_SCAN_MARK)
            .ok_or_else(|| FpError::Config("vfs301: next scan template lacks its marker".into()))?;
        Ok(Self {
            init_06: fragments("06", &config.init_06)?,
            init_02d0: fragments("02d0", &config.init_02d0)?,
            init_0220: fragments("0220", &config.init_0220)?,
            msg_12: blob("12", &config.msg_12)?,
            msg_24: blob("24", &config.msg_24)?,
            next_scan,
            next_scan_field,
        })
    }

    /// Next-scan request with `subtype` stored twice, big-endian.
    fn next_scan(&self, subtype: u16) -> Vec<u8> {
        let mut msg = self.next_scan.clone();
        let [hi, lo] = subtype.to_be_bytes();
        msg[self.next_scan_field..self.next_scan_field + 4].copy_from_slice(&[hi, lo, hi, lo]);
        msg
    }
}

/// Command 0x0b: 39 bytes, subtype at 21, check byte at 35.
fn cmd_0b(subtype: u8) -> Vec<u8> {
    let mut msg = vec![0u8; 39];
    msg[0] = 0x0b;
    msg[21] = subtype;
    msg[35] = if subtype == 0x04 { 0x9f } else { 0xab };
    msg
}

fn cmd(code: u8) -> Action {
    send(EP_OUT, [code])
}

fn blob(data: &[u8]) -> Action {
    send(EP_OUT, data)
}

fn init_script(m: &Messages) -> Vec<Action> {
    let ok = || recv(EP_CTRL, 2);
    let mut ops = vec![
        cmd(0x01),
        recv(EP_CTRL, 38),
        send(EP_OUT, cmd_0b(0x04)),
        recv(EP_CTRL, 6),
        send(EP_OUT, cmd_0b(0x05)),
        recv(EP_CTRL, 7),
        cmd(0x19),
        recv(EP_CTRL, 64),
        recv(EP_CTRL, 4),
        blob(&m.init_06[0]),
        ok(),
        cmd(0x01),
        recv(EP_CTRL, 38),
        cmd(0x1a),
        ok(),
        blob(&m.init_06[1]),
        ok(),
        blob(&m.init_0220[0]),
        ok(),
        recv(EP_DATA, 256),
        recv(EP_DATA, 32),
        cmd(0x1a),
        ok(),
        blob(&m.init_06[2]),
        ok(),
        cmd(0x01),
        recv(EP_CTRL, 38),
    ];

    // Calibration scans, lines of 208 bytes
    const CALIBRATION_LEN: [usize; 7] = [11648, 53248, 19968, 5824, 6656, 6656, 832];
    for (fragment, len) in m.init_02d0.iter().zip(CALIBRATION_LEN) {
        ops.push(blob(fragment));
        ops.push(ok());
        ops.push(recv(EP_DATA, len));
    }

    ops.extend([
        blob(&m.msg_12),
        ok(),
        cmd(0x1a),
        ok(),
        blob(&m.init_06[1]),
        ok(),
        blob(&m.init_0220[1]),
    ]);
    ops.extend(variable_order((EP_CTRL, 2), (EP_DATA, 5760)));
    ops.extend([
        cmd(0x1a),
        ok(),
        blob(&m.init_06[0]),
        ok(),
        cmd(0x1a),
        ok(),
        blob(&m.init_06[3]),
        ok(),
        // Turns the white light on
        blob(&m.msg_24),
        ok(),
        cmd(0x01),
        recv(EP_CTRL, 38),
        blob(&m.init_0220[2]),
        recv(EP_CTRL, 2368),
        recv(EP_CTRL, 36),
        recv(EP_DATA, 5760),
    ]);
    ops
}

/// Wind-down after the scan stream ended. Answers may come in either
/// order, and the scan data may not come at all.
fn finish_script(m: &Messages) -> Vec<Action> {
    let mut ops = vec![cmd(0x04)];
    ops.extend(variable_order((EP_CTRL, 2), (EP_DATA, 16384)));
    ops.push(blob(&m.init_0220[1]));
    ops.extend(variable_order((EP_DATA, 5760), (EP_CTRL, 2)));
    ops
}

ssm_states! {
    enum FingerState {
        RequestPrint,
        RequestAck,
        WaitPrint,
        PeekEvent,
        PeekReply,
    }
}

ssm_states! {
    enum CaptureState {
        ReadHeader,
        ReadPrint,
        Finish,
        SubmitPrint,
    }
}

fn scanline_differs(a: &[u8], b: &[u8]) -> bool {
    let diff: usize = a.iter().zip(b).map(|(&x, &y)| x.abs_diff(y) as usize).sum();
    diff / FP_WIDTH > LINE_DIFF_THRESHOLD
}

/// Keep the first line and every line that differs enough from the last
/// kept one.
pub fn extract_image(scanlines: &[Vec<u8>]) -> Option<Image> {
    let (first, rest) = scanlines.split_first()?;
    let mut data = first.clone();
    let mut last = first;
    let mut height = 1;
    for line in rest {
        if scanline_differs(last, line) {
            data.extend_from_slice(line);
            last = line;
            height += 1;
        }
    }
    Some(Image::from_data(FP_WIDTH, height, data))
}

/// Split a block of the scan stream into scan lines. The first block may
/// start mid-record; it is realigned on the `01 fe` record marker.
pub fn parse_lines(block: &[u8], first: bool) -> Vec<Vec<u8>> {
    let mut data = block;
    if first {
        let skip = data
            .windows(2)
            .take(FRAME_SIZE)
            .position(|w| w == [0x01, 0xfe])
            .unwrap_or(FRAME_SIZE.min(data.len()));
        data = &data[skip..];
    }
    data.chunks_exact(FRAME_SIZE)
        .map(|line| line[LINE_SCAN_OFFSET..LINE_SCAN_OFFSET + FP_WIDTH].to_vec())
        .collect()
}

pub struct Vfs301 {
    messages: Messages,
    /// Script of the current `Init` or `Exchange` machine.
    exchange: UsbExchange,
    recv_exp_amt: usize,
    scanlines: Vec<Vec<u8>>,
}

impl Vfs301 {
    pub fn new(config: &Vfs301Config) -> Result<Self, FpError> {
        Ok(Self {
            messages: Messages::from_config(config)?,
            exchange: UsbExchange::default(),
            recv_exp_amt: RECV_LEN_FIRST,
            scanlines: Vec::new(),
        })
    }

    fn finger_state(&self, ssm: &Ssm) -> Step {
        match ssm.state::<FingerState>() {
            Some(FingerState::RequestPrint) => Step::Submit(Transfer::bulk_out(
                EP_OUT,
                self.messages.next_scan(NEXT_SCAN_FA00),
                DEFAULT_WAIT_TIMEOUT,
            )),
            Some(FingerState::RequestAck) => {
                Step::Submit(Transfer::bulk_in(EP_CTRL, 2, DEFAULT_WAIT_TIMEOUT))
            }
            Some(FingerState::WaitPrint) => Step::sleep_ms(POLL_INTERVAL_MS),
            Some(FingerState::PeekEvent) => {
                Step::Submit(Transfer::bulk_out(EP_OUT, vec![0x17], DEFAULT_WAIT_TIMEOUT))
            }
            Some(FingerState::PeekReply) => {
                Step::Submit(Transfer::bulk_in(EP_CTRL, 7, DEFAULT_WAIT_TIMEOUT))
            }
            None => Step::Abort(FpError::protocol("unknown finger state")),
        }
    }

    fn capture_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.state::<CaptureState>() {
            Some(CaptureState::ReadHeader) => {
                host.report_finger_status(true);
                self.scanlines.clear();
                self.recv_exp_amt = RECV_LEN_FIRST;
                Step::Submit(Transfer::bulk_in(EP_DATA, 64, DEFAULT_WAIT_TIMEOUT))
            }
            Some(CaptureState::ReadPrint) => {
                Step::Submit(Transfer::bulk_in(EP_DATA, self.recv_exp_amt, RECV_TIMEOUT))
            }
            Some(CaptureState::Finish) => {
                let actions = finish_script(&self.messages);
                Step::Subsm(self.exchange.start(Phase::Exchange, actions, DEFAULT_WAIT_TIMEOUT))
            }
            Some(CaptureState::SubmitPrint) => {
                let lines = std::mem::take(&mut self.scanlines);
                match extract_image(&lines) {
                    Some(img) => {
                        debug!(lines = lines.len(), height = img.height, "Scan complete");
                        host.image_captured(
                            img.with_flags(ImageFlags::COLORS_INVERTED | ImageFlags::V_FLIPPED),
                        );
                    }
                    None => host.abort_scan(ScanRetry::TooShort),
                }
                host.report_finger_status(false);
                Step::Complete
            }
            None => Step::Abort(FpError::protocol("unknown capture state")),
        }
    }

    /// A full block continues the stream; a short one ends it.
    fn scan_block_done(&mut self, completion: &Completion) -> Step {
        if let Err(e) = completion.check_status() {
            return Step::Abort(e);
        }
        if completion.actual_length < self.recv_exp_amt {
            debug!(
                got = completion.actual_length,
                lines = self.scanlines.len(),
                "Scan stream ended"
            );
            return Step::Next;
        }
        let first = self.recv_exp_amt == RECV_LEN_FIRST;
        self.scanlines.extend(parse_lines(&completion.data, first));
        self.recv_exp_amt = RECV_LEN_NEXT;
        Step::jump(CaptureState::ReadPrint)
    }
}

impl ImageDriver for Vfs301 {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        let actions = init_script(&self.messages);
        Ok(self.exchange.start(Phase::Init, actions, DEFAULT_WAIT_TIMEOUT))
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Init | Phase::Exchange => self.exchange.run_state(ssm),
            Phase::FingerDetect => self.finger_state(ssm),
            Phase::Capture => self.capture_state(ssm, host),
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, _host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Init | Phase::Exchange => self.exchange.transfer_done(ssm, &completion),
            Phase::FingerDetect if ssm.state::<FingerState>() == Some(FingerState::PeekReply) => {
                match completion.check_status() {
                    Ok(()) if completion.data == NO_EVENT => Step::jump(FingerState::WaitPrint),
                    Ok(()) if completion.data == GOT_EVENT => Step::Complete,
                    Ok(()) => Step::Abort(FpError::protocol(format!(
                        "unexpected reply to wait: {:02x?}",
                        completion.data
                    ))),
                    Err(e) => Step::Abort(e),
                }
            }
            Phase::Capture if ssm.state::<CaptureState>() == Some(CaptureState::ReadPrint) => {
                self.scan_block_done(&completion)
            }
            _ => Step::from_result(completion.check_status()),
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let result = ssm.into_result();
        if host.is_deactivating() {
            self.scanlines.clear();
            if phase == Phase::Init {
                host.activate_complete(Err(FpError::Cancelled));
            }
            return None;
        }
        match (phase, result) {
            (Phase::Init, Ok(())) => {
                host.activate_complete(Ok(()));
                Some(Ssm::for_states::<FingerState>(Phase::FingerDetect))
            }
            (Phase::Init, Err(e)) => {
                host.activate_complete(Err(e));
                None
            }
            (Phase::FingerDetect, Ok(())) => Some(Ssm::for_states::<CaptureState>(Phase::Capture)),
            (Phase::Capture, Ok(())) => Some(Ssm::for_states::<FingerState>(Phase::FingerDetect)),
            (_, Err(e)) => {
                warn!(machine = %phase, error = %e, "Scan loop failed");
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::drivers::vfslib::RecvMode;
    use crate::config::DriverConfig;
    use crate::events::RecordingObserver;
    use crate::imgdev::{AcquireState, ImgDev};
    use crate::transport::{MockTransport, TransferStatus};

    fn pump(dev: &mut ImgDev<MockTransport>) {
        while dev.handle_events(Duration::ZERO).unwrap() {}
    }

    fn config() -> DriverConfig {
        let mut config = DriverConfig::default();
        config.vfs301 = Vfs301Config {
            init_06: (1..=4).map(|i| vec![0x06, i]).collect(),
            init_02d0: (1..=7).map(|i| vec![0x02, 0xd0, i]).collect(),
            init_0220: (1..=3).map(|i| vec![0x02, 0x20, i]).collect(),
            msg_12: vec![0x12],
            msg_24: vec![0x24],
            next_scan_template: vec![0x02, 0x20, 0xde, 0xad, 0xde, 0xad, 0x00, 0x01],
        };
        config
    }

    /// Answer every receive in `actions`, the first of each pair on time.
    fn queue_script(mock: &MockTransport, actions: &[Action]) {
        for action in actions {
            if let Action::Recv { len, mode, .. } = action {
                if *mode != RecvMode::IfMissed {
                    mock.queue_read(&vec![0u8; *len]);
                }
            }
        }
    }

    fn scan_line(counter: u8, value: u8) -> Vec<u8> {
        let mut line = vec![0u8; FRAME_SIZE];
        line[0] = 0x01;
        line[1] = 0xfe;
        line[2] = counter;
        line[LINE_SCAN_OFFSET..LINE_SCAN_OFFSET + FP_WIDTH].fill(value);
        line
    }

    fn active() -> (ImgDev<MockTransport>, MockTransport, Arc<RecordingObserver>) {
        let mock = MockTransport::with_ids(0x138a, 0x0005);
        let obs = Arc::new(RecordingObserver::new());
        let config = config();
        let mut dev = ImgDev::open_with_transport(mock.clone(), &config, obs.clone()).unwrap();
        dev.activate().unwrap();
        let messages = Messages::from_config(&config.vfs301).unwrap();
        queue_script(&mock, &init_script(&messages));
        pump(&mut dev);
        (dev, mock, obs)
    }

    #[test]
    fn test_next_scan_patches_subtype() {
        let messages = Messages::from_config(&config().vfs301).unwrap();
        assert_eq!(
            messages.next_scan(0x2c01),
            vec![0x02, 0x20, 0x2c, 0x01, 0x2c, 0x01, 0x00, 0x01]
        );
    }

    #[test]
    fn test_cmd_0b_layout() {
        let msg = cmd_0b(0x05);
        assert_eq!(msg.len(), 39);
        assert_eq!((msg[0], msg[21], msg[35]), (0x0b, 0x05, 0xab));
        assert_eq!(cmd_0b(0x04)[35], 0x9f);
    }

    #[test]
    fn test_missing_fragments_fail_open() {
        let mock = MockTransport::with_ids(0x138a, 0x0008);
        let obs = Arc::new(RecordingObserver::new());
        let result = ImgDev::open_with_transport(mock, &DriverConfig::default(), obs);
        assert!(matches!(result, Err(FpError::Config(_))));
    }

    #[test]
    fn test_first_block_realigns_on_marker() {
        let mut block = vec![0xaa; 5];
        block.extend(scan_line(0, 10));
        block.extend(scan_line(1, 20));
        let lines = parse_lines(&block, true);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].iter().all(|&p| p == 20));
        // Later blocks are taken as is
        assert_eq!(parse_lines(&block, false)[0][0], 0xaa);
    }

    #[test]
    fn test_similar_lines_are_dropped() {
        let lines = vec![
            vec![10; FP_WIDTH],
            vec![20; FP_WIDTH],
            vec![50; FP_WIDTH],
            vec![60; FP_WIDTH],
        ];
        let img = extract_image(&lines).unwrap();
        assert_eq!(img.height, 2);
        assert_eq!(img.row(1)[0], 50);
        assert!(extract_image(&[]).is_none());
    }

    #[test]
    fn test_activation_arms_finger_polling() {
        let (dev, mock, obs) = active();
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
        assert_eq!(obs.count("activate_complete"), 1);
        let writes = mock.get_writes();
        assert_eq!(writes[0], vec![0x01]);
        assert_eq!(writes[2], cmd_0b(0x05));
        assert!(writes.contains(&vec![0x24]));
        assert_eq!(
            writes.last().unwrap(),
            &vec![0x02, 0x20, 0xfa, 0x00, 0xfa, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn test_init_tolerates_late_answer() {
        let mock = MockTransport::with_ids(0x138a, 0x0005);
        let obs = Arc::new(RecordingObserver::new());
        let config = config();
        let mut dev = ImgDev::open_with_transport(mock.clone(), &config, obs.clone()).unwrap();
        dev.activate().unwrap();
        let messages = Messages::from_config(&config.vfs301).unwrap();
        for action in init_script(&messages) {
            match action {
                Action::Recv {
                    mode: RecvMode::First,
                    ..
                } => mock.queue_status(TransferStatus::TimedOut),
                Action::Recv { len, .. } => mock.queue_read(&vec![0u8; len]),
                Action::Send { .. } => {}
            }
        }
        pump(&mut dev);
        assert_eq!(obs.count("activate_complete"), 1);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
    }

    #[test]
    fn test_swipe_produces_image() {
        let (mut dev, mock, obs) = active();
        // Ack, then no event once, then a finger
        mock.queue_read(&[0, 0]);
        mock.queue_read(&NO_EVENT);
        mock.queue_read(&GOT_EVENT);
        mock.queue_read(&[0u8; 64]);

        // Stream starts mid-record
        let mut block = vec![0x55; 3];
        for i in 0..(RECV_LEN_FIRST - 3) / FRAME_SIZE {
            let value = if i % 2 == 0 { 0x10 } else { 0x80 };
            block.extend(scan_line(i as u8, value));
        }
        block.resize(RECV_LEN_FIRST, 0);
        mock.queue_read(&block);
        // Short block ends the stream
        mock.queue_read(&[0u8; 100]);
        let messages = Messages::from_config(&config().vfs301).unwrap();
        queue_script(&mock, &finish_script(&messages));
        pump(&mut dev);

        assert_eq!(mock.timers(), vec![Duration::from_millis(POLL_INTERVAL_MS); 2]);
        let images = obs.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].width, FP_WIDTH);
        assert!(images[0].height > 100);
        assert_eq!(obs.count("report_finger_status"), 2);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
        assert_eq!(obs.count("session_error"), 0);
    }

    #[test]
    fn test_deactivate_during_wait() {
        let (mut dev, mock, obs) = active();
        mock.queue_read(&[0, 0]);
        // Stop while the poll timer is armed
        dev.handle_events(Duration::ZERO).unwrap();
        dev.deactivate().unwrap();
        pump(&mut dev);
        assert_eq!(obs.count("deactivate_complete"), 1);
        assert_eq!(obs.count("session_error"), 0);
        assert!(dev.is_idle());
    }
}
