//! Validity VFS5011 family swipe sensors.
//!
//! Lines are 240-byte records: an 8-byte header, 160 pixels and trailing
//! sensor data. The sensor interleaves two rows, so the swipe speed is
//! recovered by the line assembler. Init and capture setup replay vendor
//! scripts from [`Vfs5011Config`].

use tracing::{debug, warn};

use super::vfslib::{Action, UsbExchange, recv, recv_check, send};
use crate::assembling::{LineAsmblCtx, assemble_lines, mean_sq_diff_norm, std_sq_dev};
use crate::config::Vfs5011Config;
use crate::error::FpError;
use crate::imgdev::{AcquireState, DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const EP_OUT: u8 = 0x01;
const EP_CTRL: u8 = 0x81;
const EP_DATA: u8 = 0x82;
const DEFAULT_WAIT_TIMEOUT: u32 = 3000;
const PREPARE_TIMEOUT: u32 = 1000;

pub const LINE_SIZE: usize = 240;
pub const IMAGE_WIDTH: usize = 160;
const PIXEL_OFFSET: usize = 8;
const CAPTURE_LINES: usize = 256;

/// Lines below this squared deviation carry no ridges.
const DEVIATION_THRESHOLD: i32 = 15 * 15;
/// Minimum mean squared difference for a line to be recorded.
const DIFFERENCE_THRESHOLD: i32 = 600;
/// Empty lines in a row that end the swipe.
const STOP_CHECK_LINES: usize = 50;

const NORMAL_CONTROL_REPLY: [u8; 2] = [0x00, 0x00];

const CMD_01: u8 = 0x01;
const CMD_04: u8 = 0x04;
const CMD_19: u8 = 0x19;
const CMD_1A: u8 = 0x1a;
const CMD_27: u8 = 0x27;

const INIT_BLOBS: usize = 19;
const PREPARE_BLOBS: usize = 5;

pub static INFO: DriverInfo = DriverInfo {
    name: "vfs5011",
    full_name: "Validity VFS5011",
    id_table: &[
        (0x138a, 0x0010),
        (0x138a, 0x0011),
        (0x138a, 0x0015),
        (0x138a, 0x0017),
        (0x138a, 0x0018),
    ],
    img_width: Some(IMAGE_WIDTH),
    img_height: None,
    bz3_threshold: Some(20),
    interface: 0,
};

/// Squared deviation of the sum of two interleaved rows.
fn get_deviation2(_ctx: &LineAsmblCtx, row1: &[u8], row2: &[u8]) -> i32 {
    const SIZE: usize = 64;
    let sums: Vec<i32> = row1[56..56 + SIZE]
        .iter()
        .zip(&row2[168..168 + SIZE])
        .map(|(&a, &b)| a as i32 + b as i32)
        .collect();
    let mean = sums.iter().sum::<i32>() / SIZE as i32;
    sums.iter().map(|s| (s - mean) * (s - mean)).sum::<i32>() / SIZE as i32
}

fn get_pixel(_ctx: &LineAsmblCtx, row: &[u8], x: usize) -> u8 {
    row[PIXEL_OFFSET + x]
}

fn pixels(line: &[u8]) -> &[u8] {
    &line[PIXEL_OFFSET..PIXEL_OFFSET + IMAGE_WIDTH]
}

/// Lines kept from one swipe.
#[derive(Debug, Default)]
pub struct LineRecorder {
    rows: Vec<Vec<u8>>,
    lines_captured: usize,
    empty_lines: usize,
    max_captured: usize,
    max_recorded: usize,
}

impl LineRecorder {
    pub fn new(max_captured: usize, max_recorded: usize) -> Self {
        Self {
            max_captured,
            max_recorded,
            ..Self::default()
        }
    }

    pub fn rows(&self) -> &[Vec<u8>] {
        &self.rows
    }

    /// Feed one chunk of lines. Returns true once the swipe is over.
    pub fn process_chunk(&mut self, chunk: &[u8]) -> bool {
        for line in chunk.chunks_exact(LINE_SIZE) {
            if std_sq_dev(pixels(line)) < DEVIATION_THRESHOLD {
                if self.lines_captured == 0 {
                    continue;
                }
                self.empty_lines += 1;
            } else {
                self.empty_lines = 0;
            }
            if self.empty_lines >= STOP_CHECK_LINES {
                debug!(empty = self.empty_lines, "Swipe ended on empty lines");
                return true;
            }

            self.lines_captured += 1;
            if self.lines_captured > self.max_captured {
                debug!(captured = self.lines_captured, "Capture line limit reached");
                return true;
            }

            let differs = self.rows.last().is_none_or(|last| {
                mean_sq_diff_norm(pixels(last), pixels(line)) >= DIFFERENCE_THRESHOLD
            });
            if differs {
                self.rows.push(line.to_vec());
                if self.rows.len() >= self.max_recorded {
                    debug!(recorded = self.rows.len(), "Recorded line limit reached");
                    return true;
                }
            }
        }
        false
    }
}

ssm_states! {
    enum LoopState {
        RequestFprint,
        InitComplete,
        ReadData,
        DataComplete,
        PrepareNextCapture,
    }
}

fn blob(data: &[u8]) -> Action {
    send(EP_OUT, data)
}

fn cmd(code: u8) -> Action {
    send(EP_OUT, [code])
}

fn ok() -> Action {
    recv_check(EP_CTRL, 64, &NORMAL_CONTROL_REPLY)
}

/// Full sensor initialization, run on every open.
fn init_script(init: &[Vec<u8>]) -> Vec<Action> {
    let i = |n: usize| blob(&init[n]);
    vec![
        cmd(CMD_01),
        recv(EP_CTRL, 64),
        cmd(CMD_19),
        recv(EP_CTRL, 64),
        recv(EP_CTRL, 64),
        i(0),
        recv(EP_CTRL, 64),
        i(1),
        recv(EP_CTRL, 64),
        i(2),
        ok(),
        cmd(CMD_01),
        recv(EP_CTRL, 64),
        cmd(CMD_1A),
        ok(),
        i(3),
        ok(),
        i(4),
        ok(),
        recv(EP_DATA, 256),
        recv(EP_DATA, 64),
        cmd(CMD_1A),
        ok(),
        i(5),
        ok(),
        cmd(CMD_01),
        recv(EP_CTRL, 64),
        i(6),
        ok(),
        recv(EP_DATA, 17216),
        recv(EP_DATA, 32),
        i(7),
        ok(),
        recv(EP_DATA, 45056),
        i(8),
        ok(),
        recv(EP_DATA, 16896),
        i(9),
        ok(),
        recv(EP_DATA, 4928),
        i(10),
        ok(),
        recv(EP_DATA, 5632),
        i(11),
        ok(),
        recv(EP_DATA, 5632),
        i(12),
        ok(),
        recv(EP_DATA, 3328),
        recv(EP_DATA, 64),
        i(13),
        ok(),
        cmd(CMD_1A),
        ok(),
        i(3),
        ok(),
        i(14),
        ok(),
        recv(EP_DATA, 4800),
        cmd(CMD_1A),
        ok(),
        i(2),
        ok(),
        cmd(CMD_27),
        recv(EP_CTRL, 64),
        cmd(CMD_1A),
        ok(),
        i(15),
        ok(),
        i(16),
        recv(EP_CTRL, 2368),
        recv(EP_CTRL, 64),
        recv(EP_DATA, 4800),
        i(17),
        ok(),
        i(18),
        ok(),
    ]
}

/// Arm the sensor for the next swipe.
fn capture_script(prepare: &[Vec<u8>]) -> Vec<Action> {
    let p = |n: usize| blob(&prepare[n]);
    vec![
        cmd(CMD_04),
        recv(EP_DATA, 64),
        recv(EP_DATA, 84032),
        ok(),
        cmd(CMD_1A),
        ok(),
        p(0),
        ok(),
        cmd(CMD_1A),
        ok(),
        p(1),
        ok(),
        p(2),
        recv(EP_CTRL, 2368),
        recv(EP_CTRL, 64),
        recv(EP_DATA, 4800),
        p(3),
        ok(),
        p(4),
        recv_check(EP_CTRL, 2368, &NORMAL_CONTROL_REPLY),
    ]
}

pub struct Vfs5011 {
    init: Vec<Vec<u8>>,
    prepare: Vec<Vec<u8>>,
    max_capture_lines: usize,
    max_recorded_lines: usize,
    exchange: UsbExchange,
    recorder: LineRecorder,
    asmbl_ctx: LineAsmblCtx,
}

impl Vfs5011 {
    pub fn new(config: &Vfs5011Config) -> Result<Self, FpError> {
        let check = |name: &str, blobs: &[Vec<u8>], count: usize| {
            if blobs.len() != count || blobs.iter().any(Vec::is_empty) {
                return Err(FpError::Config(format!(
                    "vfs5011: expected {} {} blobs, got {}",
                    count,
                    name,
                    blobs.len()
                )));
            }
            Ok(())
        };
        check("init", &config.init, INIT_BLOBS)?;
        check("prepare", &config.prepare, PREPARE_BLOBS)?;
        Ok(Self {
            init: config.init.clone(),
            prepare: config.prepare.clone(),
            max_capture_lines: config.max_capture_lines,
            max_recorded_lines: config.max_recorded_lines,
            exchange: UsbExchange::default(),
            recorder: LineRecorder::default(),
            asmbl_ctx: LineAsmblCtx {
                line_width: IMAGE_WIDTH,
                max_height: config.max_recorded_lines,
                resolution: 10,
                median_filter_size: 25,
                max_search_offset: 30,
                get_deviation: get_deviation2,
                get_pixel,
            },
        })
    }

    fn loop_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.state::<LoopState>() {
            Some(LoopState::RequestFprint) => {
                let actions = capture_script(&self.prepare);
                Step::Subsm(self.exchange.start(Phase::Exchange, actions, PREPARE_TIMEOUT))
            }
            Some(LoopState::InitComplete) => {
                self.recorder = LineRecorder::new(self.max_capture_lines, self.max_recorded_lines);
                if host.state() == AcquireState::Activating {
                    host.activate_complete(Ok(()));
                }
                Step::Next
            }
            Some(LoopState::ReadData) => Step::Submit(Transfer::bulk_in(
                EP_DATA,
                CAPTURE_LINES * LINE_SIZE,
                0,
            )),
            Some(LoopState::DataComplete) => Step::sleep_ms(1),
            Some(LoopState::PrepareNextCapture) => {
                let actions = capture_script(&self.prepare);
                Step::Subsm(self.exchange.start(Phase::Exchange, actions, DEFAULT_WAIT_TIMEOUT))
            }
            None => Step::Abort(FpError::protocol("unknown loop state")),
        }
    }

    fn chunk_done(&mut self, completion: &Completion, host: &mut Host) -> Step {
        match completion.check_status() {
            Ok(()) | Err(FpError::Timeout) => {
                if completion.actual_length > 0 {
                    host.report_finger_status(true);
                }
                if self.recorder.process_chunk(&completion.data) {
                    Step::jump(LoopState::DataComplete)
                } else {
                    Step::jump(LoopState::ReadData)
                }
            }
            Err(e) => Step::Abort(e),
        }
    }

    fn submit_image(&mut self, host: &mut Host) {
        let recorder = std::mem::take(&mut self.recorder);
        debug!(lines = recorder.rows().len(), "Assembling swipe");
        match assemble_lines(&self.asmbl_ctx, recorder.rows()) {
            Ok(img) => host.image_captured(img),
            Err(e) => host.session_error(e),
        }
    }
}

impl ImageDriver for Vfs5011 {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn open(&mut self, _host: &mut Host) -> Result<Option<Ssm>, FpError> {
        let actions = init_script(&self.init);
        Ok(Some(self.exchange.start(Phase::Open, actions, DEFAULT_WAIT_TIMEOUT)))
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        Ok(Ssm::for_states::<LoopState>(Phase::Capture))
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Open | Phase::Exchange => self.exchange.run_state(ssm),
            Phase::Capture => self.loop_state(ssm, host),
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Open | Phase::Exchange => self.exchange.transfer_done(ssm, &completion),
            Phase::Capture if ssm.state::<LoopState>() == Some(LoopState::ReadData) => {
                self.chunk_done(&completion, host)
            }
            _ => Step::from_result(completion.check_status()),
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let result = ssm.into_result();

        if phase == Phase::Open {
            if let Err(e) = &result {
                warn!(error = %e, "Initialization failed");
            }
            host.open_complete(result);
            return None;
        }
        if host.is_deactivating() {
            debug!("Capture loop stopped");
            self.recorder = LineRecorder::default();
            return None;
        }
        match result {
            Ok(()) => {
                self.submit_image(host);
                host.report_finger_status(false);
                Some(Ssm::for_states::<LoopState>(Phase::Capture))
            }
            Err(e) => {
                if host.state() == AcquireState::Activating {
                    host.activate_complete(Err(e));
                } else {
                    host.session_error(e);
                }
                None
            }
        }
    }
}
