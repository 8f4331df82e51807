//! Validity VFS0050 swipe sensor.
//!
//! Every state change is a 125-byte control packet followed by a commit.
//! Once turned on, the sensor raises a 5-byte interrupt on EP 0x83 when a
//! finger lands and then streams 148-byte lines on EP 0x82 until the swipe
//! ends. Each line starts with an 8-byte header carrying its sequence
//! number and two noise hashes.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace, warn};

use crate::assembling::{LineAsmblCtx, assemble_lines};
use crate::config::Vfs0050Config;
use crate::error::{FpError, ScanRetry};
use crate::imgdev::{AcquireState, DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const EP_OUT: u8 = 0x01;
const EP1_IN: u8 = 0x81;
const EP2_IN: u8 = 0x82;
const EP3_IN: u8 = 0x83;

const USB_TIMEOUT: u32 = 3000;
/// Endpoint drains stop on the first read that times out.
const ABORT_TIMEOUT: u32 = 20;
const SUBMIT_DELAY_MS: u64 = 100;
/// The orange LED stays on this long after a swipe.
const ORANGE_DELAY_MS: u64 = 400;

const USB_BUFFER_SIZE: usize = 65536;
const CONTROL_PACKET_SIZE: usize = 125;
const COMMIT_RESPONSE_SIZE: usize = 1106;
const INTERRUPT_SIZE: usize = 5;

pub const LINE_SIZE: usize = 148;
const LINE_HEADER: usize = 8;
pub const IMAGE_WIDTH: usize = 100;
const NEXT_LINE_WIDTH: usize = 8;
/// Pixels followed by the preview of the next line.
const LINE_BODY: usize = IMAGE_WIDTH + NEXT_LINE_WIDTH;
const NEXT_LINE_SHIFT: usize = (IMAGE_WIDTH - NEXT_LINE_WIDTH) / 2 - 1;
const MAX_HEIGHT: usize = 3000;
const NOISE_THRESHOLD: u8 = 40;

const EMPTY_INTERRUPT: [u8; INTERRUPT_SIZE] = [0; INTERRUPT_SIZE];
const FINGER_INTERRUPTS: [[u8; INTERRUPT_SIZE]; 3] = [
    [0x02, 0x00, 0x0e, 0x00, 0xf0],
    [0x02, 0x04, 0x0a, 0x00, 0xf0],
    [0x02, 0x00, 0x0a, 0x00, 0xf0],
];
const CMD_CLEAR_EP2: u8 = 0x04;

pub static INFO: DriverInfo = DriverInfo {
    name: "vfs0050",
    full_name: "Validity VFS0050",
    id_table: &[(0x138a, 0x0050)],
    img_width: Some(IMAGE_WIDTH),
    img_height: None,
    bz3_threshold: Some(24),
    interface: 0,
};

ssm_states! {
    enum MainState {
        InitialAbort1,
        InitialAbort2,
        InitialAbort3,
        ClearEp2,
        TurnOff,
        TurnOn,
        AskInterrupt,
        ReceiveFinger,
        SubmitImage,
        NextReceive,
        WaitAnotherScan,
    }
}

ssm_states! {
    enum DeinitState {
        ClearEp2,
        TurnOff,
    }
}

ssm_states! {
    enum ControlState {
        SendControl,
        ReturnCode,
        SendCommit,
        CommitResponse,
        ReadInterrupt,
        DrainInterrupt,
        ClearEp2,
    }
}

ssm_states! {
    enum ClearEpState {
        Command,
        ReturnCode,
        Drain,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    TurnOn,
    TurnOff,
    NextReceive1,
    NextReceive2,
}

/// A line is noise when both hashes sit well inside the byte range.
fn is_noise(line: &[u8]) -> bool {
    let inside = |v: u8| v > NOISE_THRESHOLD && v < u8::MAX - NOISE_THRESHOLD + 1;
    inside(line[4]) && inside(line[5])
}

fn line_id(line: &[u8]) -> u16 {
    LittleEndian::read_u16(&line[2..4])
}

/// Cut the received stream into lines, drop trailing noise and strip the
/// headers.
fn swipe_lines(stream: &[u8]) -> Result<Vec<&[u8]>, ScanRetry> {
    let mut lines: Vec<&[u8]> = stream.chunks_exact(LINE_SIZE).collect();
    let received = lines.len();
    while lines.last().is_some_and(|line| is_noise(line)) {
        lines.pop();
    }
    lines.truncate(MAX_HEIGHT);
    debug!(received, kept = lines.len(), "Swipe lines");
    if lines.len() < IMAGE_WIDTH {
        return Err(ScanRetry::TooShort);
    }

    for pair in lines.windows(2) {
        let (prev, cur) = (line_id(pair[0]), line_id(pair[1]));
        if cur != prev.wrapping_add(1) {
            trace!(prev, cur, "Line sequence gap");
        }
    }
    Ok(lines
        .into_iter()
        .map(|line| &line[LINE_HEADER..LINE_HEADER + LINE_BODY])
        .collect())
}

/// Preview of the next line against the centre of a later one.
fn get_deviation(_ctx: &LineAsmblCtx, line1: &[u8], line2: &[u8]) -> i32 {
    line1[IMAGE_WIDTH..LINE_BODY]
        .iter()
        .zip(&line2[NEXT_LINE_SHIFT..NEXT_LINE_SHIFT + NEXT_LINE_WIDTH])
        .map(|(&a, &b)| (a as i32 - b as i32).pow(2))
        .sum()
}

fn get_pixel(_ctx: &LineAsmblCtx, line: &[u8], x: usize) -> u8 {
    line[x]
}

fn drain(ep: u8) -> Step {
    Step::Submit(if ep == EP3_IN {
        Transfer::interrupt_in(ep, USB_BUFFER_SIZE, ABORT_TIMEOUT)
    } else {
        Transfer::bulk_in(ep, USB_BUFFER_SIZE, ABORT_TIMEOUT)
    })
}

/// An empty endpoint times out; anything read is dropped and read again.
fn drained(ssm: &Ssm, completion: &Completion) -> Step {
    match completion.check_status() {
        Err(FpError::Timeout) => Step::Next,
        Err(e) => Step::Abort(e),
        Ok(()) if completion.actual_length == 0 => Step::Next,
        Ok(()) => {
            warn!(bytes = completion.actual_length, "Endpoint had extra data");
            Step::Jump(ssm.cur_state())
        }
    }
}

fn read_full(completion: &Completion) -> Step {
    Step::from_result(completion.check_full().map(|_| ()))
}

pub struct Vfs0050 {
    config: Vfs0050Config,
    control: Control,
    stream: Vec<u8>,
    receiving: bool,
    asmbl_ctx: LineAsmblCtx,
}

impl Vfs0050 {
    pub fn new(config: &Vfs0050Config) -> Result<Self, FpError> {
        let packets = [
            ("turn_on", &config.turn_on),
            ("turn_off", &config.turn_off),
            ("next_receive_1", &config.next_receive_1),
            ("next_receive_2", &config.next_receive_2),
        ];
        for (name, packet) in packets {
            if packet.len() != CONTROL_PACKET_SIZE {
                return Err(FpError::Config(format!(
                    "vfs0050: {} must be {} bytes, got {}",
                    name,
                    CONTROL_PACKET_SIZE,
                    packet.len()
                )));
            }
        }
        if config.commit_out.is_empty() {
            return Err(FpError::Config("vfs0050: commit_out is required".into()));
        }
        Ok(Self {
            config: config.clone(),
            control: Control::TurnOff,
            stream: Vec::new(),
            receiving: false,
            asmbl_ctx: LineAsmblCtx {
                line_width: IMAGE_WIDTH,
                max_height: MAX_HEIGHT,
                resolution: 10,
                median_filter_size: 25,
                max_search_offset: 100,
                get_deviation,
                get_pixel,
            },
        })
    }

    fn packet(&self) -> &[u8] {
        match self.control {
            Control::TurnOn => &self.config.turn_on,
            Control::TurnOff => &self.config.turn_off,
            Control::NextReceive1 => &self.config.next_receive_1,
            Control::NextReceive2 => &self.config.next_receive_2,
        }
    }

    fn send_control(&mut self, control: Control) -> Step {
        debug!(?control, "Control packet");
        self.control = control;
        Step::Subsm(Ssm::for_states::<ControlState>(Phase::Exchange))
    }

    fn clear_ep2() -> Step {
        Step::Subsm(Ssm::for_states::<ClearEpState>(Phase::ClearEp))
    }

    fn reset_capture(&mut self) {
        self.stream.clear();
        self.receiving = false;
    }

    fn main_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.state::<MainState>() {
            Some(MainState::InitialAbort1) => drain(EP1_IN),
            Some(MainState::InitialAbort2) => drain(EP2_IN),
            Some(MainState::InitialAbort3) => drain(EP3_IN),
            Some(MainState::ClearEp2) => Self::clear_ep2(),
            Some(MainState::TurnOff) => self.send_control(Control::TurnOff),
            // Open leaves the sensor off
            Some(MainState::TurnOn) if ssm.phase() != Phase::Activate => Step::Complete,
            Some(MainState::TurnOn) => self.send_control(Control::TurnOn),
            Some(MainState::AskInterrupt) => {
                if host.state() == AcquireState::Activating {
                    host.activate_complete(Ok(()));
                }
                self.reset_capture();
                Step::Submit(Transfer::interrupt_in(EP3_IN, INTERRUPT_SIZE, 0))
            }
            Some(MainState::ReceiveFinger) => {
                if !self.receiving {
                    self.receiving = true;
                    host.report_finger_status(true);
                }
                Step::Submit(Transfer::bulk_in(EP2_IN, USB_BUFFER_SIZE, USB_TIMEOUT))
            }
            Some(MainState::SubmitImage) => {
                self.submit_image(host);
                Step::sleep_ms(SUBMIT_DELAY_MS)
            }
            Some(MainState::NextReceive) => self.send_control(Control::NextReceive1),
            Some(MainState::WaitAnotherScan) => Step::sleep_ms(ORANGE_DELAY_MS),
            None => Step::Abort(FpError::protocol("unknown main state")),
        }
    }

    fn main_done(&mut self, ssm: &Ssm, completion: &Completion) -> Step {
        match ssm.state::<MainState>() {
            Some(MainState::InitialAbort1 | MainState::InitialAbort2 | MainState::InitialAbort3) => {
                drained(ssm, completion)
            }
            Some(MainState::AskInterrupt) => Self::interrupt_done(completion),
            Some(MainState::ReceiveFinger) => self.chunk_done(completion),
            _ => Step::from_result(completion.check_status()),
        }
    }

    fn interrupt_done(completion: &Completion) -> Step {
        if let Err(e) = completion.check_status() {
            return Step::Abort(e);
        }
        if completion.actual_length != INTERRUPT_SIZE {
            return Step::Abort(FpError::protocol(format!(
                "unknown interrupt size {}",
                completion.actual_length
            )));
        }
        let interrupt = &completion.data[..INTERRUPT_SIZE];
        if FINGER_INTERRUPTS.iter().any(|known| known == interrupt) {
            debug!(?interrupt, "Finger interrupt");
            Step::Next
        } else if interrupt[0] == 0x01 {
            warn!("Finger is already on the scanner");
            Step::Next
        } else {
            Step::Abort(FpError::protocol(format!("unknown interrupt {:02x?}", interrupt)))
        }
    }

    /// An empty read ends the swipe.
    fn chunk_done(&mut self, completion: &Completion) -> Step {
        match completion.check_status() {
            Ok(()) | Err(FpError::Timeout) => {
                if completion.actual_length == 0 {
                    return Step::Next;
                }
                self.stream
                    .extend_from_slice(&completion.data[..completion.actual_length]);
                trace!(bytes = self.stream.len(), "Swipe data");
                Step::jump(MainState::ReceiveFinger)
            }
            Err(e) => Step::Abort(e),
        }
    }

    fn control_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<ControlState>() {
            Some(ControlState::SendControl) => {
                Step::Submit(Transfer::bulk_out(EP_OUT, self.packet().to_vec(), USB_TIMEOUT))
            }
            Some(ControlState::ReturnCode) => {
                Step::Submit(Transfer::bulk_in(EP1_IN, 2, USB_TIMEOUT))
            }
            // The next-receive packets only go out as a pair
            Some(ControlState::SendCommit) if self.control == Control::NextReceive1 => {
                self.control = Control::NextReceive2;
                Step::jump(ControlState::SendControl)
            }
            Some(ControlState::SendCommit) => Step::Submit(Transfer::bulk_out(
                EP_OUT,
                self.config.commit_out.clone(),
                USB_TIMEOUT,
            )),
            Some(ControlState::CommitResponse) => Step::Submit(Transfer::bulk_in(
                EP1_IN,
                COMMIT_RESPONSE_SIZE,
                USB_TIMEOUT,
            )),
            Some(ControlState::ReadInterrupt) => Step::Submit(Transfer::interrupt_in(
                EP3_IN,
                INTERRUPT_SIZE,
                USB_TIMEOUT,
            )),
            Some(ControlState::DrainInterrupt) => drain(EP3_IN),
            Some(ControlState::ClearEp2) if self.control == Control::TurnOn => Step::Next,
            Some(ControlState::ClearEp2) => Self::clear_ep2(),
            None => Step::Abort(FpError::protocol("unknown control state")),
        }
    }

    fn control_done(&mut self, ssm: &Ssm, completion: &Completion) -> Step {
        match ssm.state::<ControlState>() {
            Some(ControlState::ReadInterrupt) => match completion.check_full() {
                Ok(data) if data == EMPTY_INTERRUPT => Step::Next,
                Ok(data) => Step::Abort(FpError::protocol(format!(
                    "interrupt {:02x?} after commit",
                    data
                ))),
                Err(e) => Step::Abort(e),
            },
            Some(ControlState::DrainInterrupt) => drained(ssm, completion),
            _ => read_full(completion),
        }
    }

    fn clear_ep_state(&self, ssm: &Ssm) -> Step {
        match ssm.state::<ClearEpState>() {
            Some(ClearEpState::Command) => {
                Step::Submit(Transfer::bulk_out(EP_OUT, [CMD_CLEAR_EP2], USB_TIMEOUT))
            }
            Some(ClearEpState::ReturnCode) => {
                Step::Submit(Transfer::bulk_in(EP1_IN, 2, USB_TIMEOUT))
            }
            Some(ClearEpState::Drain) => drain(EP2_IN),
            None => Step::Abort(FpError::protocol("unknown clear state")),
        }
    }

    fn submit_image(&mut self, host: &mut Host) {
        let stream = std::mem::take(&mut self.stream);
        self.receiving = false;
        match swipe_lines(&stream) {
            Ok(lines) => match assemble_lines(&self.asmbl_ctx, &lines) {
                Ok(img) => host.image_captured(img),
                Err(e) => host.session_error(e),
            },
            Err(reason) => host.abort_scan(reason),
        }
        host.report_finger_status(false);
    }
}

impl ImageDriver for Vfs0050 {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    /// Flush stale data and leave the sensor turned off.
    fn open(&mut self, _host: &mut Host) -> Result<Option<Ssm>, FpError> {
        Ok(Some(Ssm::for_states::<MainState>(Phase::Open)))
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        self.reset_capture();
        Ok(Ssm::for_states::<MainState>(Phase::Activate))
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Open | Phase::Activate => self.main_state(ssm, host),
            Phase::Deactivate => match ssm.state::<DeinitState>() {
                Some(DeinitState::ClearEp2) => Self::clear_ep2(),
                Some(DeinitState::TurnOff) => self.send_control(Control::TurnOff),
                None => Step::Abort(FpError::protocol("unknown deinit state")),
            },
            Phase::Exchange => self.control_state(ssm),
            Phase::ClearEp => self.clear_ep_state(ssm),
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, _host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Open | Phase::Activate => self.main_done(ssm, &completion),
            Phase::Exchange => self.control_done(ssm, &completion),
            Phase::ClearEp if ssm.state::<ClearEpState>() == Some(ClearEpState::Drain) => {
                drained(ssm, &completion)
            }
            _ => read_full(&completion),
        }
    }

    fn timer_done(&mut self, ssm: &Ssm, _host: &mut Host) -> Step {
        match ssm.state::<MainState>() {
            Some(MainState::WaitAnotherScan) => Step::jump(MainState::TurnOn),
            _ => Step::Next,
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let result = ssm.into_result();
        match phase {
            Phase::Open => {
                if let Err(e) = &result {
                    warn!(error = %e, "Initialization failed");
                }
                host.open_complete(result);
                None
            }
            Phase::Deactivate => {
                if let Err(e) = result {
                    warn!(error = %e, "Sensor was not turned off");
                }
                None
            }
            _ if host.is_deactivating() => {
                debug!("Scan loop stopped, turning sensor off");
                self.reset_capture();
                Some(Ssm::for_states::<DeinitState>(Phase::Deactivate))
            }
            _ => {
                if let Err(e) = result {
                    if host.state() == AcquireState::Activating {
                        host.activate_complete(Err(e));
                    } else {
                        host.session_error(e);
                    }
                }
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
    use crate::imgdev::ImgDev;
    use crate::transport::{MockTransport, TransferStatus};

    fn pump(dev: &mut ImgDev<MockTransport>) {
        while dev.handle_events(Duration::ZERO).unwrap() {}
    }

    fn config() -> DriverConfig {
        let packet = |tag: u8| {
            let mut p = vec![0u8; CONTROL_PACKET_SIZE];
            p[0] = tag;
            p
        };
        let mut config = DriverConfig::default();
        config.vfs0050 = Vfs0050Config {
            turn_on: packet(0x31),
            turn_off: packet(0x30),
            next_receive_1: packet(0x41),
            next_receive_2: packet(0x42),
            commit_out: vec![0xc0; 16],
        };
        config
    }

    fn queue_clear_ep2(mock: &MockTransport) {
        mock.queue_read(&[0x00, 0x00]);
        mock.queue_status(TransferStatus::TimedOut);
    }

    fn queue_control(mock: &MockTransport, control: Control) {
        mock.queue_read(&[0x00, 0x00]);
        if control == Control::NextReceive1 {
            mock.queue_read(&[0x00, 0x00]);
        }
        mock.queue_read(&vec![0u8; COMMIT_RESPONSE_SIZE]);
        mock.queue_read(&EMPTY_INTERRUPT);
        mock.queue_status(TransferStatus::TimedOut);
        if control != Control::TurnOn {
            queue_clear_ep2(mock);
        }
    }

    fn queue_start(mock: &MockTransport) {
        for _ in 0..3 {
            mock.queue_status(TransferStatus::TimedOut);
        }
        queue_clear_ep2(mock);
        queue_control(mock, Control::TurnOff);
    }

    fn opened() -> (ImgDev<MockTransport>, MockTransport, Arc<RecordingObserver>) {
        let mock = MockTransport::with_ids(0x138a, 0x0050);
        queue_start(&mock);
        let obs = Arc::new(RecordingObserver::new());
        let mut dev = ImgDev::open_with_transport(mock.clone(), &config(), obs.clone()).unwrap();
        pump(&mut dev);
        (dev, mock, obs)
    }

    fn activated() -> (ImgDev<MockTransport>, MockTransport, Arc<RecordingObserver>) {
        let (mut dev, mock, obs) = opened();
        mock.clear_writes();
        queue_start(&mock);
        queue_control(&mock, Control::TurnOn);
        dev.activate().unwrap();
        pump(&mut dev);
        (dev, mock, obs)
    }

    fn line(id: u16, phase: usize, noise: u8) -> Vec<u8> {
        let mut line = vec![0u8; LINE_SIZE];
        line[0] = 0x01;
        line[1] = 0xfe;
        LittleEndian::write_u16(&mut line[2..4], id);
        line[4] = noise;
        line[5] = noise;
        for x in 0..LINE_BODY {
            line[LINE_HEADER + x] = if (x + phase) % 6 < 3 { 0x30 } else { 0xd0 };
        }
        line
    }

    fn swipe(lines: usize) -> Vec<u8> {
        (0..lines).flat_map(|i| line(i as u16, i % 6, 0)).collect()
    }

    fn last_transfer(mock: &MockTransport) -> Option<Transfer> {
        mock.transfers().last().cloned()
    }

    #[test]
    fn test_packets_validated() {
        assert!(matches!(
            Vfs0050::new(&Vfs0050Config::default()),
            Err(FpError::Config(_))
        ));
        let mut short = config().vfs0050;
        short.turn_on.truncate(64);
        assert!(matches!(Vfs0050::new(&short), Err(FpError::Config(_))));
    }

    #[test]
    fn test_open_flushes_and_turns_off() {
        let (dev, mock, obs) = opened();
        assert!(dev.is_opened());
        assert_eq!(obs.events(), vec![FpEvent::OpenComplete { result: Ok(()) }]);
        assert!(!mock.has_inflight());

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0], vec![CMD_CLEAR_EP2]);
        assert_eq!(writes[1], config().vfs0050.turn_off);
        assert_eq!(writes[2], config().vfs0050.commit_out);
        assert_eq!(writes[3], vec![CMD_CLEAR_EP2]);
    }

    #[test]
    fn test_activation_waits_on_interrupt() {
        let (dev, mock, obs) = activated();
        assert_eq!(obs.count("activate_complete"), 1);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);

        let writes = mock.get_writes();
        assert_eq!(writes[writes.len() - 2], config().vfs0050.turn_on);
        // No EP2 clear after turning on
        assert_eq!(writes.last(), Some(&config().vfs0050.commit_out));
        assert!(mock.has_inflight());
        assert_eq!(
            last_transfer(&mock),
            Some(Transfer::interrupt_in(EP3_IN, INTERRUPT_SIZE, 0))
        );
    }

    #[test]
    fn test_dirty_commit_interrupt_fails_activation() {
        let (mut dev, mock, obs) = opened();
        queue_start(&mock);
        mock.queue_read(&[0x00, 0x00]);
        mock.queue_read(&vec![0u8; COMMIT_RESPONSE_SIZE]);
        mock.queue_read(&[0x02, 0x00, 0x00, 0x00, 0x00]);
        dev.activate().unwrap();
        pump(&mut dev);
        assert!(matches!(
            obs.events().last(),
            Some(FpEvent::ActivateComplete {
                result: Err(FpError::Protocol(_))
            })
        ));
    }

    #[test]
    fn test_unknown_interrupt_is_session_error() {
        let (mut dev, mock, obs) = activated();
        mock.queue_read(&[0x03, 0x00, 0x00, 0x00, 0x00]);
        pump(&mut dev);
        assert_eq!(obs.count("session_error"), 1);
        assert_eq!(obs.count("report_finger_status"), 0);
    }

    #[test]
    fn test_finger_already_on_starts_reading() {
        let (mut dev, mock, obs) = activated();
        mock.queue_read(&[0x01, 0x00, 0x00, 0x00, 0x00]);
        pump(&mut dev);
        assert_eq!(
            obs.events().last(),
            Some(&FpEvent::FingerStatus { present: true })
        );
        assert_eq!(
            last_transfer(&mock),
            Some(Transfer::bulk_in(EP2_IN, USB_BUFFER_SIZE, USB_TIMEOUT))
        );
    }

    #[test]
    fn test_swipe_lines_strip_headers_and_noise() {
        let mut stream = swipe(120);
        for i in 0..30 {
            stream.extend(line(120 + i, 0, 0x80));
        }
        // Partial trailing line is ignored
        stream.extend([0x01, 0xfe, 0x00]);

        let lines = swipe_lines(&stream).unwrap();
        assert_eq!(lines.len(), 120);
        assert!(lines.iter().all(|l| l.len() == LINE_BODY));
        assert_eq!(lines[1], &line(1, 1, 0)[LINE_HEADER..LINE_HEADER + LINE_BODY]);

        assert_eq!(swipe_lines(&swipe(IMAGE_WIDTH - 1)), Err(ScanRetry::TooShort));
    }

    #[test]
    fn test_noise_hashes() {
        assert!(is_noise(&line(0, 0, 41)));
        assert!(is_noise(&line(0, 0, 215)));
        assert!(!is_noise(&line(0, 0, 40)));
        assert!(!is_noise(&line(0, 0, 216)));
    }

    #[test]
    fn test_swipe_cycle() {
        let (mut dev, mock, obs) = activated();
        let stream = swipe(300);
        mock.queue_read(&FINGER_INTERRUPTS[0]);
        mock.queue_read(&stream[..USB_BUFFER_SIZE.min(stream.len())]);
        mock.queue_status(TransferStatus::TimedOut);
        queue_control(&mock, Control::NextReceive1);
        queue_control(&mock, Control::TurnOn);
        pump(&mut dev);

        let images = obs.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].width, IMAGE_WIDTH);
        assert!(images[0].height > 0);
        assert_eq!(obs.count("report_finger_status"), 2);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
        assert_eq!(
            mock.timers(),
            vec![
                Duration::from_millis(SUBMIT_DELAY_MS),
                Duration::from_millis(ORANGE_DELAY_MS)
            ]
        );

        // Both next-receive packets precede a single commit
        let writes = mock.get_writes();
        let nr1 = writes
            .iter()
            .position(|w| *w == config().vfs0050.next_receive_1)
            .unwrap();
        assert_eq!(writes[nr1 + 1], config().vfs0050.next_receive_2);
        assert_eq!(writes[nr1 + 2], config().vfs0050.commit_out);
        // Back to waiting for the next finger
        assert_eq!(
            last_transfer(&mock),
            Some(Transfer::interrupt_in(EP3_IN, INTERRUPT_SIZE, 0))
        );
    }

    #[test]
    fn test_short_swipe_is_too_short() {
        let (mut dev, mock, obs) = activated();
        mock.queue_read(&FINGER_INTERRUPTS[2]);
        mock.queue_read(&swipe(40));
        mock.queue_status(TransferStatus::TimedOut);
        pump(&mut dev);

        assert!(obs.images().is_empty());
        assert_eq!(
            obs.events()
                .iter()
                .filter(|e| matches!(e, FpEvent::AbortScan { reason: ScanRetry::TooShort }))
                .count(),
            1
        );
        assert_eq!(
            obs.events().last(),
            Some(&FpEvent::FingerStatus { present: false })
        );
    }

    #[test]
    fn test_deactivate_turns_sensor_off() {
        let (mut dev, mock, obs) = activated();
        mock.clear_writes();
        dev.deactivate().unwrap();
        queue_clear_ep2(&mock);
        queue_control(&mock, Control::TurnOff);
        pump(&mut dev);

        assert_eq!(obs.count("deactivate_complete"), 1);
        assert_eq!(obs.count("session_error"), 0);
        assert!(dev.is_idle());
        let writes = mock.get_writes();
        assert_eq!(writes[0], vec![CMD_CLEAR_EP2]);
        assert_eq!(writes[1], config().vfs0050.turn_off);
    }
}
