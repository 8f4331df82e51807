//! UPEK TouchStrip sensor-only swipe readers (147e:2016, 1000, 1001).
//!
//! The sensor streams raw rows over bulk IN as 64-byte packets: a 14-bit
//! big-endian sequence number followed by 62 pixel bytes. Rows are cut out
//! of the stream by absolute byte address, so lost packets are padded to
//! keep later rows aligned. A swipe ends after a long run of blank rows.
//!
//! Registers are written one control transfer at a time. The three models
//! differ only in their register programs and row width.

use tracing::{debug, trace, warn};

use crate::assembling::{LineAsmblCtx, assemble_lines, mean_sq_diff_norm, std_sq_dev};
use crate::config::{RegScript, SonlyScripts, UpekSonlyConfig};
use crate::error::FpError;
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, SsmState, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const CTRL_TIMEOUT: u32 = 1000;
const REG_REQUEST: u8 = 0x0c;
const EP_IMAGE: u8 = 0x81;
const EP_INTR: u8 = 0x83;
const IMG_TRANSFER_SIZE: usize = 4096;

const PACKET_SIZE: usize = 64;
const PACKET_DATA: usize = 62;
const SEQ_MODULUS: i32 = 16384;
/// Filler for lost packets when no earlier row can stand in.
const DUMMY_PIXEL: u8 = 204;

const MAX_ROWS: usize = 2048;
const BLANK_THRESHOLD: i32 = 250;
const FINGER_PRESENT_THRESHOLD: u32 = 32;
const FINGER_REMOVED_THRESHOLD: u32 = 100;
const DIFF_THRESHOLD: i32 = 13;

const IMG_WIDTH_2016: usize = 288;
const IMG_WIDTH_1000: usize = 288;
const IMG_WIDTH_1001: usize = 216;

const BASE_INFO: DriverInfo = DriverInfo {
    name: "upeksonly",
    full_name: "UPEK TouchStrip Sensor-Only",
    id_table: &[(0x147e, 0x2016), (0x147e, 0x1000), (0x147e, 0x1001)],
    img_width: None,
    img_height: None,
    bz3_threshold: None,
    interface: 0,
};

/// Registry entry covering every model.
pub static INFO: DriverInfo = BASE_INFO;

static INFO_2016: DriverInfo = DriverInfo {
    id_table: &[(0x147e, 0x2016)],
    ..BASE_INFO
};

static INFO_1000: DriverInfo = DriverInfo {
    id_table: &[(0x147e, 0x1000)],
    ..BASE_INFO
};

static INFO_1001: DriverInfo = DriverInfo {
    id_table: &[(0x147e, 0x1001)],
    bz3_threshold: Some(25),
    ..BASE_INFO
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    M2016,
    M1000,
    M1001,
}

impl Model {
    fn from_pid(pid: u16) -> Option<Self> {
        match pid {
            0x2016 => Some(Model::M2016),
            0x1000 => Some(Model::M1000),
            0x1001 => Some(Model::M1001),
            _ => None,
        }
    }

    pub fn img_width(self) -> usize {
        match self {
            Model::M2016 => IMG_WIDTH_2016,
            Model::M1000 => IMG_WIDTH_1000,
            Model::M1001 => IMG_WIDTH_1001,
        }
    }

    fn info(self) -> &'static DriverInfo {
        match self {
            Model::M2016 => &INFO_2016,
            Model::M1000 => &INFO_1000,
            Model::M1001 => &INFO_1001,
        }
    }

    /// Script counts: init, await finger, capture.
    fn script_counts(self) -> (usize, usize, usize) {
        match self {
            Model::M2016 => (1, 4, 1),
            Model::M1000 => (1, 2, 1),
            Model::M1001 => (5, 0, 5),
        }
    }

    /// The 1001 has no finger interrupt; presence is judged from rows.
    fn has_finger_interrupt(self) -> bool {
        self != Model::M1001
    }
}

/// One step of a register program.
#[derive(Debug, Clone)]
enum Op {
    Regs(RegScript),
    Read(u8),
    Write(u8, u8),
    /// Write a value derived from the last register read.
    WriteFrom(u8, fn(u8) -> u8),
    /// Reset the row collector before streaming starts.
    ResetCapture,
}

#[derive(Debug, Default)]
struct Programs {
    init: Vec<Op>,
    await_finger: Vec<Op>,
    capture: Vec<Op>,
    deinit: Vec<Op>,
}

fn fix_reg01(v: u8) -> u8 {
    if v != 0xc6 { 0x46 } else { 0xc6 }
}

fn fix_reg13(v: u8) -> u8 {
    if v != 0x45 { 0x05 } else { 0x45 }
}

fn keep_reg07(v: u8) -> u8 {
    if v != 0x10 && v != 0x90 {
        warn!(value = format_args!("{:#04x}", v), "Odd reg7 value");
    }
    v
}

impl Programs {
    fn build(model: Model, scripts: &SonlyScripts) -> Self {
        let regs = |list: &[RegScript]| list.iter().cloned().map(Op::Regs).collect::<Vec<_>>();
        let deinit = vec![Op::Regs(scripts.deinit.clone())];
        match model {
            Model::M2016 => {
                let a = &scripts.await_finger;
                Self {
                    init: vec![
                        Op::Regs(scripts.init[0].clone()),
                        Op::Read(0x09),
                        Op::WriteFrom(0x09, |v| v & !0x08),
                        Op::Read(0x13),
                        Op::WriteFrom(0x13, |v| v & !0x10),
                        Op::Write(0x04, 0x00),
                        Op::Write(0x05, 0x00),
                    ],
                    await_finger: vec![
                        Op::Regs(a[0].clone()),
                        Op::Read(0x01),
                        Op::WriteFrom(0x01, fix_reg01),
                        Op::Regs(a[1].clone()),
                        Op::Read(0x13),
                        Op::WriteFrom(0x13, fix_reg13),
                        Op::Regs(a[2].clone()),
                        Op::Read(0x07),
                        Op::WriteFrom(0x07, keep_reg07),
                        Op::Regs(a[3].clone()),
                    ],
                    capture: vec![
                        Op::ResetCapture,
                        Op::Write(0x15, 0x20),
                        Op::Write(0x30, 0xe0),
                        Op::Regs(scripts.capture[0].clone()),
                    ],
                    deinit,
                }
            }
            Model::M1000 | Model::M1001 => {
                let mut capture = vec![Op::ResetCapture];
                capture.extend(regs(&scripts.capture));
                Self {
                    init: regs(&scripts.init),
                    await_finger: regs(&scripts.await_finger),
                    capture,
                    deinit,
                }
            }
        }
    }

    fn get(&self, phase: Phase) -> &[Op] {
        match phase {
            Phase::Activate => &self.init,
            Phase::FingerDetect => &self.await_finger,
            Phase::Imaging => &self.capture,
            Phase::Deactivate => &self.deinit,
            _ => &[],
        }
    }
}

ssm_states! {
    enum LoopState {
        RunAwaitFinger,
        AwaitFinger,
        RunCapture,
        Capture,
        RunDeinit,
        Final,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FingerState {
    AwaitFinger,
    Detected,
    Removed,
}

/// Squared deviation of the sum of two interleaved rows.
fn get_deviation2(ctx: &LineAsmblCtx, line1: &[u8], line2: &[u8]) -> i32 {
    let half = (ctx.line_width / 2) as i32;
    let sums: Vec<i32> = (0..ctx.line_width)
        .step_by(2)
        .map(|i| line1[i + 1] as i32 + line2[i] as i32)
        .collect();
    let mean = sums.iter().sum::<i32>() / half;
    sums.iter().map(|s| (s - mean) * (s - mean)).sum::<i32>() / half
}

/// Lines carry the raw row followed by its realigned pixels.
fn get_pixel(ctx: &LineAsmblCtx, line: &[u8], x: usize) -> u8 {
    line[ctx.line_width + x]
}

/// Undo the sensor's column roll and the two-row lag of even columns.
fn realign(rows: &[Vec<u8>], width: usize) -> Vec<Vec<u8>> {
    (0..rows.len())
        .map(|i| {
            let mut line = Vec::with_capacity(width * 2);
            line.extend_from_slice(&rows[i]);
            for x in 0..width {
                let offset = if x < width - 2 {
                    x + 2
                } else if x > width - 2 {
                    x - (width - 2)
                } else {
                    line.push(0);
                    continue;
                };
                let src = if x % 2 == 0 && i + 2 < rows.len() { &rows[i + 2] } else { &rows[i] };
                line.push(src[offset]);
            }
            line
        })
        .collect()
}

pub struct UpekSonly {
    model: Model,
    programs: Programs,
    /// Script of the running `WriteRegs` machine.
    regs: RegScript,
    read_reg_result: u8,

    rows: Vec<Vec<u8>>,
    rowbuf: Vec<u8>,
    /// Fill level of `rowbuf`; `None` while between rows.
    rowbuf_offset: Option<usize>,
    wraparounds: i32,
    last_seqnum: i32,
    num_blank: u32,
    num_nonblank: u32,
    finger_state: FingerState,
    handed_off: bool,
}

impl UpekSonly {
    pub fn new(config: &UpekSonlyConfig, pid: u16) -> Result<Self, FpError> {
        let model = Model::from_pid(pid)
            .ok_or_else(|| FpError::Resource(format!("unknown upeksonly model {:04x}", pid)))?;
        let scripts = match model {
            Model::M2016 => &config.model_2016,
            Model::M1000 => &config.model_1000,
            Model::M1001 => &config.model_1001,
        };
        let expected = model.script_counts();
        let actual = (scripts.init.len(), scripts.await_finger.len(), scripts.capture.len());
        if actual != expected || scripts.init.iter().all(|s| s.is_empty()) {
            return Err(FpError::Config(format!(
                "upeksonly {:04x}: expected {:?} init/await/capture scripts, got {:?}",
                pid, expected, actual
            )));
        }
        Ok(Self {
            model,
            programs: Programs::build(model, scripts),
            regs: Vec::new(),
            read_reg_result: 0,
            rows: Vec::new(),
            rowbuf: Vec::new(),
            rowbuf_offset: None,
            wraparounds: -1,
            last_seqnum: SEQ_MODULUS - 1,
            num_blank: 0,
            num_nonblank: 0,
            finger_state: FingerState::AwaitFinger,
            handed_off: false,
        })
    }

    fn width(&self) -> usize {
        self.model.img_width()
    }

    fn reset_capture(&mut self) {
        self.rows.clear();
        self.rowbuf.clear();
        self.rowbuf_offset = None;
        self.wraparounds = -1;
        self.num_blank = 0;
        self.num_nonblank = 0;
        self.last_seqnum = SEQ_MODULUS - 1;
        self.handed_off = false;
        self.finger_state = if self.model.has_finger_interrupt() {
            FingerState::Detected
        } else {
            FingerState::AwaitFinger
        };
    }

    fn is_capturing(&self) -> bool {
        !self.handed_off && self.rows.len() < MAX_ROWS && self.finger_state != FingerState::Removed
    }

    fn write_reg(reg: u8, value: u8) -> Step {
        trace!(reg = format_args!("{:#04x}", reg), value = format_args!("{:#04x}", value), "Set register");
        Step::Submit(Transfer::vendor_out(REG_REQUEST, 0, reg as u16, vec![value], CTRL_TIMEOUT))
    }

    fn run_op(&mut self, op: Op) -> Step {
        match op {
            Op::Regs(script) if script.is_empty() => Step::Next,
            Op::Regs(script) => {
                let len = script.len();
                self.regs = script;
                Step::Subsm(Ssm::new(Phase::WriteRegs, len))
            }
            Op::Read(reg) => {
                Step::Submit(Transfer::vendor_in(REG_REQUEST, 0, reg as u16, 8, CTRL_TIMEOUT))
            }
            Op::Write(reg, value) => Self::write_reg(reg, value),
            Op::WriteFrom(reg, derive) => Self::write_reg(reg, derive(self.read_reg_result)),
            Op::ResetCapture => {
                self.reset_capture();
                Step::Next
            }
        }
    }

    fn op_done(&mut self, op: Option<&Op>, completion: &Completion) -> Step {
        let data = match completion.check_full() {
            Ok(data) => data,
            Err(e) => return Step::Abort(e),
        };
        if let Some(Op::Read(reg)) = op {
            self.read_reg_result = data.first().copied().unwrap_or_default();
            trace!(reg = format_args!("{:#04x}", reg), value = self.read_reg_result, "Register read");
        }
        Step::Next
    }

    fn loop_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.state::<LoopState>() {
            Some(LoopState::RunAwaitFinger) => {
                if host.is_deactivating() {
                    return Step::Complete;
                }
                match self.programs.await_finger.len() {
                    0 => Step::Next,
                    n => Step::Subsm(Ssm::new(Phase::FingerDetect, n)),
                }
            }
            Some(LoopState::AwaitFinger) => {
                if self.model.has_finger_interrupt() {
                    Step::Submit(Transfer::interrupt_in(EP_INTR, 4, 0))
                } else {
                    Step::Next
                }
            }
            Some(LoopState::RunCapture) => {
                Step::Subsm(Ssm::new(Phase::Imaging, self.programs.capture.len()))
            }
            Some(LoopState::Capture) => {
                if host.is_deactivating() || !self.is_capturing() {
                    return Step::Next;
                }
                Step::Submit(Transfer::bulk_in(EP_IMAGE, IMG_TRANSFER_SIZE, 0))
            }
            Some(LoopState::RunDeinit) => {
                Step::Subsm(Ssm::new(Phase::Deactivate, self.programs.deinit.len()))
            }
            Some(LoopState::Final) => Step::jump(LoopState::RunAwaitFinger),
            None => Step::Abort(FpError::protocol("bad loop state")),
        }
    }

    fn loop_done(&mut self, ssm: &Ssm, completion: &Completion, host: &mut Host) -> Step {
        if ssm.cur_state() == LoopState::AwaitFinger.index() {
            let data = match completion.check_full() {
                Ok(data) => data,
                Err(e) => return Step::Abort(e),
            };
            debug!(?data, "Interrupt received");
            self.finger_state = FingerState::Detected;
            host.report_finger_status(true);
            return Step::Next;
        }

        if let Err(e) = completion.check_status() {
            if host.is_deactivating() {
                return Step::Next;
            }
            warn!(error = %e, "Bad image transfer, terminating session");
            return Step::Abort(e);
        }
        for packet in completion.data.chunks_exact(PACKET_SIZE) {
            if !self.is_capturing() {
                break;
            }
            self.handle_packet(packet, host);
        }
        if host.is_deactivating() || !self.is_capturing() {
            Step::Next
        } else {
            Step::jump(LoopState::Capture)
        }
    }

    fn handle_packet(&mut self, packet: &[u8], host: &mut Host) {
        let mut seqnum = ((packet[0] as i32) << 8) | packet[1] as i32;
        let data = &packet[2..];

        if seqnum != self.last_seqnum + 1 && seqnum != 0 && self.last_seqnum != SEQ_MODULUS - 1 {
            let missing = seqnum - self.last_seqnum;
            warn!(missing, from = self.last_seqnum, to = seqnum, "Lost packets");
            for _ in 1..missing {
                let abs_base_addr = (self.last_seqnum + 1) as usize * PACKET_DATA;
                let dummy = self.dummy_data();
                self.place(abs_base_addr, &dummy, host);
                self.last_seqnum += 1;
                if !self.is_capturing() {
                    return;
                }
            }
        }
        if seqnum <= self.last_seqnum {
            debug!("Detected wraparound");
            self.wraparounds += 1;
        }
        self.last_seqnum = seqnum;
        seqnum += self.wraparounds * SEQ_MODULUS;
        self.place(seqnum as usize * PACKET_DATA, data, host);
    }

    /// Stand-in for a lost packet, taken from the last row where possible.
    fn dummy_data(&self) -> [u8; PACKET_DATA] {
        let mut dummy = [DUMMY_PIXEL; PACKET_DATA];
        if let (Some(offset), Some(last_row), true) =
            (self.rowbuf_offset, self.rows.last(), self.rows.len() > 1)
        {
            let row_left = self.width() - offset;
            if row_left >= PACKET_DATA {
                dummy.copy_from_slice(&last_row[offset..offset + PACKET_DATA]);
            } else {
                dummy[..row_left].copy_from_slice(&last_row[offset..]);
                dummy[row_left..].copy_from_slice(&last_row[..PACKET_DATA - row_left]);
            }
        }
        dummy
    }

    /// Route one packet's pixels by absolute stream address.
    fn place(&mut self, abs_base_addr: usize, data: &[u8], host: &mut Host) {
        let width = self.width();
        if let Some(offset) = self.rowbuf_offset {
            let for_rowbuf = (width - offset).min(PACKET_DATA);
            self.add_to_rowbuf(&data[..for_rowbuf], host);
            // Row boundary inside the packet
            if for_rowbuf < PACKET_DATA {
                self.start_new_row(&data[for_rowbuf..]);
            }
            return;
        }
        if abs_base_addr % width == 0 {
            self.start_new_row(data);
            return;
        }
        let next_row_addr = (abs_base_addr / width + 1) * width;
        let diff = next_row_addr - abs_base_addr;
        if diff < PACKET_DATA {
            self.start_new_row(&data[diff..]);
        }
    }

    fn start_new_row(&mut self, data: &[u8]) {
        self.rowbuf.clear();
        self.rowbuf.extend_from_slice(data);
        self.rowbuf_offset = Some(data.len());
    }

    fn add_to_rowbuf(&mut self, data: &[u8], host: &mut Host) {
        self.rowbuf.extend_from_slice(data);
        let offset = self.rowbuf.len();
        self.rowbuf_offset = Some(offset);
        if offset >= self.width() {
            self.row_complete(host);
        }
    }

    fn row_complete(&mut self, host: &mut Host) {
        self.rowbuf_offset = None;

        if let Some(last_row) = self.rows.last() {
            let std_sq = std_sq_dev(&self.rowbuf);
            let mean_sq_diff = mean_sq_diff_norm(last_row, &self.rowbuf);

            if self.finger_state == FingerState::AwaitFinger {
                if std_sq > BLANK_THRESHOLD {
                    self.num_nonblank += 1;
                } else {
                    self.num_nonblank = 0;
                }
                if self.num_nonblank <= FINGER_PRESENT_THRESHOLD {
                    return;
                }
                self.finger_state = FingerState::Detected;
                host.report_finger_status(true);
            }

            if std_sq > BLANK_THRESHOLD {
                self.num_blank = 0;
            } else {
                self.num_blank += 1;
                // A brief touch before the swipe leaves a gap; only a long
                // blank run ends the scan
                if self.num_blank > FINGER_REMOVED_THRESHOLD {
                    self.finger_state = FingerState::Removed;
                    debug!(blank = self.num_blank, rows = self.rows.len(), "Detected finger removal");
                    self.handoff_img(host);
                    return;
                }
            }
            trace!(mean_sq_diff, std_sq, blank = self.num_blank, "Row stats");
            if mean_sq_diff < DIFF_THRESHOLD {
                return;
            }
        }

        self.rows.push(std::mem::take(&mut self.rowbuf));

        if self.rows.len() >= MAX_ROWS {
            debug!("Row limit met");
            self.handoff_img(host);
        }
    }

    fn handoff_img(&mut self, host: &mut Host) {
        self.handed_off = true;
        if self.rows.is_empty() {
            warn!("No rows to hand off");
            return;
        }
        let rows = std::mem::take(&mut self.rows);
        debug!(rows = rows.len(), "Assembling swipe");
        let width = self.width();
        let ctx = LineAsmblCtx {
            line_width: width,
            max_height: 1024,
            resolution: 8,
            median_filter_size: 25,
            max_search_offset: 30,
            get_deviation: get_deviation2,
            get_pixel,
        };
        match assemble_lines(&ctx, &realign(&rows, width)) {
            Ok(img) => host.image_captured(img),
            Err(e) => host.session_error(e),
        }
        host.report_finger_status(false);
    }
}

impl ImageDriver for UpekSonly {
    fn info(&self) -> &'static DriverInfo {
        self.model.info()
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        Ok(Ssm::new(Phase::Activate, self.programs.init.len()))
    }

    fn deactivate(&mut self, _host: &mut Host) -> Option<Ssm> {
        self.rows.clear();
        self.rowbuf.clear();
        None
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Capture => self.loop_state(ssm, host),
            Phase::WriteRegs => match self.regs.get(ssm.cur_state()) {
                Some(&(reg, value)) => Self::write_reg(reg, value),
                None => Step::Abort(FpError::protocol("register write out of range")),
            },
            phase => match self.programs.get(phase).get(ssm.cur_state()).cloned() {
                Some(op) => self.run_op(op),
                None => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
            },
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Capture => self.loop_done(ssm, &completion, host),
            Phase::WriteRegs => Step::from_result(completion.check_full().map(|_| ())),
            phase => {
                let op = self.programs.get(phase).get(ssm.cur_state()).cloned();
                self.op_done(op.as_ref(), &completion)
            }
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let result = ssm.into_result();
        if phase == Phase::Activate {
            let ok = result.is_ok();
            host.activate_complete(result);
            return ok.then(|| Ssm::for_states::<LoopState>(Phase::Capture));
        }
        if host.is_deactivating() {
            self.rows.clear();
            self.rowbuf.clear();
            return None;
        }
        if let Err(e) = result {
            host.session_error(e);
        }
        None
    }
}
