//! Validity VFS101 swipe sensor.
//!
//! Every command is a short packet on EP 0x01 carrying a 16-bit sequence
//! number, answered by a 15-byte reply on EP 0x81 that echoes it. Images
//! come from EP 0x82 as blocks of 292-byte frames; a block shorter than
//! the maximum ends the image. Bytes 282/283 of each frame report the
//! scan level, which locates the finger inside the buffer.
//!
//! Activation flushes any pending print, tunes the contrast against empty
//! images and then loops: request a print, poll the finger state, load
//! and extract the image, abort the print and wait for the sensor to
//! settle.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace, warn};

use crate::error::{FpError, ScanRetry};
use crate::image::{Image, ImageFlags};
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const EP_OUT: u8 = 0x01;
const EP_REPLY: u8 = 0x81;
const EP_IMAGE: u8 = 0x82;
const BULK_TIMEOUT: u32 = 100;

pub const FRAME_SIZE: usize = 292;
const BLOCK_SIZE: usize = 16 * FRAME_SIZE;
const BUFFER_HEIGHT: usize = 5000;
const BUFFER_SIZE: usize = BUFFER_HEIGHT * FRAME_SIZE;
const REPLY_SIZE: usize = 0x0f;
const FINGER_STATE_OFFSET: usize = 0x0a;

pub const IMAGE_WIDTH: usize = 200;
const PIXEL_OFFSET: usize = 6;
const IMAGE_MAX_HEIGHT: usize = 1023;
const IMAGE_MIN_HEIGHT: usize = 200;
/// Frames in the reply to an empty print request.
const EMPTY_PRINT_LINES: usize = 10;

/// Scan level at which the finger image starts, scanning upward.
const LEVEL_BEGIN: u32 = 768;
const LEVEL_END: u32 = 64;
/// Consecutive frames needed to accept a level edge.
const LEVEL_LINES: usize = 4;
const MIN_IMAGE_LEVEL: u8 = 144;
const BEST_CONTRAST_LEVEL: i64 = 128;
const MIN_CONTRAST_LEVEL: i64 = 16;

const PAR_000E: u16 = 0x000e;
const PAR_0011: u16 = 0x0011;
const PAR_THRESHOLD: u16 = 0x0057;
const PAR_STATE_3: u16 = 0x005e;
const PAR_STATE_5: u16 = 0x005f;
const PAR_INFO_RATE: u16 = 0x0062;
const PAR_0076: u16 = 0x0076;
const PAR_INFO_CONTRAST: u16 = 0x0077;
const PAR_0078: u16 = 0x0078;

const REG_IMG_EXPOSURE: u32 = 0xff500e;
const REG_IMG_CONTRAST: u32 = 0xff5038;

const VAL_000E: u16 = 0x0001;
const VAL_0011: u16 = 0x0008;
const VAL_THRESHOLD: u16 = 0x0096;
const VAL_STATE_3: u16 = 0x0064;
const VAL_STATE_5: u16 = 0x00c8;
const VAL_INFO_RATE: u16 = 0x0001;
const VAL_0076: u16 = 0x0012;
const VAL_0078: u16 = 0x2230;
const VAL_CALIB_EXPOSURE: u32 = 0x4000;
const VAL_IMG_EXPOSURE: u32 = 0x21c0;

const CMD_GET_PRINT: u8 = 0x03;
const CMD_SET_PARAM: u8 = 0x05;
const CMD_ABORT_PRINT: u8 = 0x0e;
const CMD_POKE: u8 = 0x13;
const CMD_GET_FINGER_STATE: u8 = 0x16;

const START_CONTRAST: i32 = 15;

pub static INFO: DriverInfo = DriverInfo {
    name: "vfs101",
    full_name: "Validity VFS101",
    id_table: &[(0x138a, 0x0001)],
    img_width: Some(IMAGE_WIDTH),
    img_height: None,
    bz3_threshold: Some(24),
    interface: 0,
};

ssm_states! {
    enum InitState {
        RecvDirty,
        AbortPrint,
        LoadAbort,
        GetEmptyPrint,
        LoadEmpty,
        CheckEmpty,
        EmptyLoop,
        GetFingerState,
        CheckFingerState,
        GetStrayPrint,
        LoadStray,
        StrayLoop,
        Set000e,
        Set0011,
        Set0076,
        Set0078,
        SetThreshold,
        SetState3Count,
        SetState5Count,
        SetInfoContrast,
        SetInfoRate,
        CalibExposure,
        CalibContrast,
        CalibGetPrint,
        CalibLoad,
        CalibCheck,
        SetExposure,
        SetContrast,
        SetLineContrast,
        SetLineRate,
    }
}

ssm_states! {
    enum LoopState {
        GetPrint,
        Sleep,
        GetState,
        LoadImage,
        ExtractImage,
        CheckAction,
        FailGetState,
        FailCheckState,
        FailGetPrint,
        FailLoad,
        FailLoop,
        FailSleep,
        AbortPrint,
        LoadAbort,
        GetEmptyPrint,
        LoadEmpty,
        CheckEmpty,
        EmptyLoop,
    }
}

ssm_states! {
    enum SwapState {
        Send,
        Recv,
    }
}

ssm_states! {
    enum LoadState {
        Read,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FingerState {
    Empty,
    Present,
    Unknown(u8),
}

impl FingerState {
    fn from_reply(reply: &[u8]) -> Self {
        match reply.get(FINGER_STATE_OFFSET).copied().unwrap_or_default() {
            0x00 | 0x01 => FingerState::Empty,
            0x02..=0x06 => FingerState::Present,
            other => FingerState::Unknown(other),
        }
    }
}

fn get_print(lines: u16, full: bool) -> Vec<u8> {
    let mut cmd = if full {
        vec![0, 0, 0, 0, CMD_GET_PRINT, 0, 0, 0, 0x01, 0x00, 0, 0, 0x01, 0x01]
    } else {
        vec![0, 0, 0, 0, CMD_GET_PRINT, 0, 0, 0, 0x00, 0x01, 0, 0, 0x00, 0x01]
    };
    LittleEndian::write_u16(&mut cmd[6..8], lines);
    cmd
}

fn set_param(param: u16, value: u16) -> Vec<u8> {
    let mut cmd = vec![0, 0, 0, 0, CMD_SET_PARAM, 0, 0, 0, 0, 0];
    LittleEndian::write_u16(&mut cmd[6..8], param);
    LittleEndian::write_u16(&mut cmd[8..10], value);
    cmd
}

fn abort_print() -> Vec<u8> {
    vec![0, 0, 0, 0, CMD_ABORT_PRINT, 0]
}

fn poke(addr: u32, value: u32, size: u8) -> Vec<u8> {
    let mut cmd = vec![0, 0, 0, 0, CMD_POKE, 0, 0, 0, 0, 0, 0, 0, 0, 0, size];
    LittleEndian::write_u32(&mut cmd[6..10], addr);
    LittleEndian::write_u32(&mut cmd[10..14], value);
    cmd
}

fn get_finger_state() -> Vec<u8> {
    vec![0, 0, 0, 0, CMD_GET_FINGER_STATE, 0]
}

fn at(x: usize, y: usize) -> usize {
    x + y * FRAME_SIZE
}

fn scan_level(buffer: &[u8], y: usize) -> u32 {
    buffer[at(283, y)] as u32 * 256 + buffer[at(282, y)] as u32
}

/// Locate the finger from the scan levels, scanning from the last frame
/// down. Returns the bottom frame and the height, and whitens the
/// background pixels in between.
fn screen(buffer: &mut [u8], lines: usize) -> (usize, usize) {
    if lines == 0 {
        return (0, 0);
    }
    let last_line = lines - 1;
    let mut top = last_line;
    let mut bottom = 0;
    let mut count = 0;
    for y in (0..=last_line).rev() {
        let level = scan_level(buffer, y);
        trace!(line = y, level, "Scan level");
        if level >= LEVEL_BEGIN && top == last_line {
            if count < LEVEL_LINES {
                count += 1;
            } else {
                top = y + LEVEL_LINES;
                count = 0;
            }
        } else if (level < LEVEL_END || level >= 0xffff) && top != last_line {
            if count < LEVEL_LINES {
                count += 1;
            } else {
                bottom = y + LEVEL_LINES + 1;
                break;
            }
        } else {
            count = 0;
        }
    }

    let height = (top + 1).saturating_sub(bottom).min(IMAGE_MAX_HEIGHT);
    debug!(lines, bottom, top, height, "Screened image");
    for y in bottom..=top {
        for x in PIXEL_OFFSET..PIXEL_OFFSET + IMAGE_WIDTH {
            let px = &mut buffer[at(x, y)];
            if *px > MIN_IMAGE_LEVEL {
                *px = 0xff;
            }
        }
    }
    (bottom, height)
}

/// Mean difference between bytes 5 and 4 over the loaded frames.
fn contrast_level(buffer: &[u8], lines: usize) -> i64 {
    if lines == 0 {
        return 0;
    }
    let sum: i64 = (0..lines)
        .map(|y| buffer[at(5, y)] as i64 - buffer[at(4, y)] as i64)
        .sum();
    sum / lines as i64
}

pub struct Vfs101 {
    seqnum: u16,
    command: Vec<u8>,
    reply: Vec<u8>,
    /// Accept the next reply or image whatever its status.
    lenient: bool,
    buffer: Vec<u8>,
    /// Frames in the buffer after a load, image height after extraction.
    height: usize,
    counter: u32,
    contrast: i32,
    best_contrast: i32,
    best_level: i64,
}

impl Default for Vfs101 {
    fn default() -> Self {
        Self {
            seqnum: u16::MAX,
            command: Vec::new(),
            reply: Vec::new(),
            lenient: false,
            buffer: Vec::new(),
            height: 0,
            counter: 0,
            contrast: START_CONTRAST,
            best_contrast: 0,
            best_level: -1,
        }
    }
}

impl Vfs101 {
    pub fn new() -> Self {
        Self::default()
    }

    fn swap(&mut self, command: Vec<u8>) -> Step {
        trace!(cmd = command[4], "Command");
        self.command = command;
        Step::Subsm(Ssm::for_states::<SwapState>(Phase::Exchange))
    }

    fn load(&mut self, lenient: bool) -> Step {
        self.lenient = lenient;
        self.buffer.clear();
        self.height = 0;
        Step::Subsm(Ssm::for_states::<LoadState>(Phase::Imaging))
    }

    fn finger_state(&self) -> FingerState {
        FingerState::from_reply(&self.reply)
    }

    fn contrast_poke(&self) -> Vec<u8> {
        poke(REG_IMG_CONTRAST, self.contrast as u32, 0x01)
    }

    fn check_contrast(&mut self) {
        let level = contrast_level(&self.buffer, self.height);
        if level < MIN_CONTRAST_LEVEL {
            self.contrast += 1;
            return;
        }
        debug!(contrast = self.contrast, level, "Contrast level");
        if (level - BEST_CONTRAST_LEVEL).abs() < (self.best_level - BEST_CONTRAST_LEVEL).abs() {
            self.best_contrast = self.contrast;
            self.best_level = level;
        }
    }

    /// Sensor still busy with the aborted print: retry after a pause.
    fn wait_abort(&mut self, settled: Step) -> Step {
        if self.height == EMPTY_PRINT_LINES {
            self.counter = 0;
            settled
        } else if self.counter < 10 {
            self.counter += 1;
            Step::sleep_ms(100)
        } else {
            Step::Abort(FpError::protocol("sensor did not finish aborting"))
        }
    }

    fn init_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        let Some(state) = ssm.state::<InitState>() else {
            return Step::Abort(FpError::protocol("unknown init state"));
        };
        match state {
            InitState::RecvDirty => {
                self.lenient = true;
                Step::Submit(Transfer::bulk_in(EP_REPLY, REPLY_SIZE, BULK_TIMEOUT))
            }
            InitState::AbortPrint => self.swap(abort_print()),
            InitState::LoadAbort | InitState::LoadEmpty | InitState::LoadStray => self.load(true),
            InitState::GetEmptyPrint => self.swap(get_print(EMPTY_PRINT_LINES as u16, false)),
            InitState::CheckEmpty => self.wait_abort(Step::jump(InitState::GetFingerState)),
            InitState::EmptyLoop => Step::jump(InitState::GetEmptyPrint),
            InitState::GetFingerState => self.swap(get_finger_state()),
            InitState::CheckFingerState => match self.finger_state() {
                FingerState::Present if self.counter < 20 => {
                    if self.counter == 2 {
                        warn!("Unexpected finger on the sensor");
                        host.abort_scan(ScanRetry::RemoveFinger);
                    }
                    self.counter += 1;
                    Step::sleep_ms(250)
                }
                FingerState::Present => {
                    Step::Abort(FpError::protocol("finger not removed from the sensor"))
                }
                _ if self.counter == 0 => Step::jump(InitState::Set000e),
                _ => {
                    // Finger lifted; flush the print it left behind
                    self.counter = 0;
                    Step::jump(InitState::AbortPrint)
                }
            },
            InitState::GetStrayPrint => self.swap(get_print(BUFFER_HEIGHT as u16, true)),
            InitState::StrayLoop => Step::jump(InitState::GetFingerState),
            InitState::Set000e => self.swap(set_param(PAR_000E, VAL_000E)),
            InitState::Set0011 => self.swap(set_param(PAR_0011, VAL_0011)),
            InitState::Set0076 => self.swap(set_param(PAR_0076, VAL_0076)),
            InitState::Set0078 => self.swap(set_param(PAR_0078, VAL_0078)),
            InitState::SetThreshold => self.swap(set_param(PAR_THRESHOLD, VAL_THRESHOLD)),
            InitState::SetState3Count => self.swap(set_param(PAR_STATE_3, VAL_STATE_3)),
            InitState::SetState5Count => self.swap(set_param(PAR_STATE_5, VAL_STATE_5)),
            InitState::SetInfoContrast => self.swap(set_param(PAR_INFO_CONTRAST, 10)),
            InitState::SetInfoRate => self.swap(set_param(PAR_INFO_RATE, 32)),
            InitState::CalibExposure => {
                self.counter = 1;
                self.swap(poke(REG_IMG_EXPOSURE, VAL_CALIB_EXPOSURE, 0x02))
            }
            InitState::CalibContrast | InitState::SetContrast => {
                let cmd = self.contrast_poke();
                self.swap(cmd)
            }
            InitState::CalibGetPrint => self.swap(get_print(EMPTY_PRINT_LINES as u16, false)),
            InitState::CalibLoad => self.load(false),
            InitState::CalibCheck => {
                self.check_contrast();
                if self.contrast <= 6 || self.counter >= 12 {
                    self.contrast = self.best_contrast;
                    self.counter = 0;
                    debug!(contrast = self.contrast, "Contrast calibrated");
                    Step::Next
                } else {
                    self.contrast -= 1;
                    self.counter += 1;
                    Step::jump(InitState::CalibContrast)
                }
            }
            InitState::SetExposure => self.swap(poke(REG_IMG_EXPOSURE, VAL_IMG_EXPOSURE, 0x02)),
            InitState::SetLineContrast => {
                self.swap(set_param(PAR_INFO_CONTRAST, self.contrast as u16))
            }
            InitState::SetLineRate => self.swap(set_param(PAR_INFO_RATE, VAL_INFO_RATE)),
        }
    }

    fn loop_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        let Some(state) = ssm.state::<LoopState>() else {
            return Step::Abort(FpError::protocol("unknown loop state"));
        };
        match state {
            LoopState::GetPrint | LoopState::FailGetPrint => {
                self.swap(get_print(BUFFER_HEIGHT as u16, true))
            }
            LoopState::Sleep => Step::sleep_ms(50),
            LoopState::GetState | LoopState::FailGetState => self.swap(get_finger_state()),
            LoopState::LoadImage => match self.finger_state() {
                FingerState::Empty => Step::jump(LoopState::Sleep),
                FingerState::Present => self.load(true),
                FingerState::Unknown(state) => Step::Abort(FpError::protocol(format!(
                    "unknown finger state {:#04x}",
                    state
                ))),
            },
            LoopState::ExtractImage => {
                if self.height > 0 {
                    self.extract_image(host);
                }
                Step::sleep_ms(10)
            }
            LoopState::CheckAction if self.height > 0 => Step::jump(LoopState::AbortPrint),
            LoopState::CheckAction => Step::Next,
            LoopState::FailCheckState => self.check_lifted(host),
            LoopState::FailLoad | LoopState::LoadAbort | LoopState::LoadEmpty => self.load(true),
            LoopState::FailLoop => Step::jump(LoopState::FailGetState),
            LoopState::FailSleep => Step::sleep_ms(10),
            LoopState::AbortPrint => self.swap(abort_print()),
            LoopState::GetEmptyPrint => self.swap(get_print(EMPTY_PRINT_LINES as u16, false)),
            LoopState::CheckEmpty => self.wait_abort(Step::jump(LoopState::GetPrint)),
            LoopState::EmptyLoop => Step::jump(LoopState::GetEmptyPrint),
        }
    }

    /// After a failed scan, wait for the finger to leave before retrying.
    fn check_lifted(&mut self, host: &mut Host) -> Step {
        if self.finger_state() == FingerState::Present {
            if self.counter >= 20 {
                return Step::Abort(FpError::protocol("finger not removed from the sensor"));
            }
            if self.counter == 1 {
                warn!("Finger still present after scan");
                host.abort_scan(ScanRetry::RemoveFinger);
            }
            self.counter += 1;
            return Step::sleep_ms(250);
        }
        if self.counter == 0 {
            if self.height == 0 {
                warn!("Image too short, retry");
                host.abort_scan(ScanRetry::TooShort);
            } else {
                warn!("Image load failed, retry");
                host.abort_scan(ScanRetry::Retry);
            }
        }
        host.report_finger_status(false);
        self.counter = 0;
        Step::jump(LoopState::FailSleep)
    }

    fn extract_image(&mut self, host: &mut Host) {
        let (bottom, height) = screen(&mut self.buffer, self.height);
        if height < IMAGE_MIN_HEIGHT {
            debug!(height, "Image too short");
            self.height = 0;
            return;
        }
        self.height = height;
        host.report_finger_status(true);
        let data: Vec<u8> = self.buffer[bottom * FRAME_SIZE..]
            .chunks_exact(FRAME_SIZE)
            .take(height)
            .flat_map(|frame| &frame[PIXEL_OFFSET..PIXEL_OFFSET + IMAGE_WIDTH])
            .copied()
            .collect();
        let img = Image::from_data(IMAGE_WIDTH, height, data).with_flags(ImageFlags::V_FLIPPED);
        host.image_captured(img);
        host.report_finger_status(false);
    }

    fn swap_done(&mut self, ssm: &Ssm, completion: &Completion) -> Step {
        if ssm.state::<SwapState>() == Some(SwapState::Send) {
            return Step::from_result(completion.check_full().map(|_| ()));
        }
        self.accept_reply(completion, false)
    }

    fn accept_reply(&mut self, completion: &Completion, lenient: bool) -> Step {
        match completion.check_status() {
            Err(FpError::Cancelled) => return Step::Abort(FpError::Cancelled),
            Err(e) if !lenient => return Step::Abort(e),
            _ => {}
        }
        self.reply = completion.data.clone();
        if !lenient {
            let echoed = match self.reply.get(..2) {
                Some(seq) => LittleEndian::read_u16(seq),
                None => return Step::Abort(FpError::protocol("reply without sequence number")),
            };
            if echoed != self.seqnum {
                return Step::Abort(FpError::protocol(format!(
                    "seqnum mismatch, got {:04x}, expected {:04x}",
                    echoed, self.seqnum
                )));
            }
        }
        Step::Next
    }

    fn block_done(&mut self, completion: &Completion) -> Step {
        match completion.check_status() {
            Err(FpError::Cancelled) => return Step::Abort(FpError::Cancelled),
            Err(e) if !self.lenient => return Step::Abort(e),
            _ => {}
        }
        let data = &completion.data;
        if !self.lenient && data.len() % FRAME_SIZE != 0 {
            return Step::Abort(FpError::protocol("received incomplete frame"));
        }
        self.buffer.extend_from_slice(data);
        if data.len() == BLOCK_SIZE {
            if BUFFER_SIZE - self.buffer.len() < BLOCK_SIZE {
                return Step::Abort(FpError::Resource("image too large".into()));
            }
            return Step::jump(LoadState::Read);
        }
        self.lenient = false;
        self.height = self.buffer.len() / FRAME_SIZE;
        debug!(height = self.height, "Image loaded");
        Step::Complete
    }
}

impl ImageDriver for Vfs101 {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        self.contrast = START_CONTRAST;
        self.best_level = -1;
        self.counter = 0;
        Ok(Ssm::for_states::<InitState>(Phase::Activate))
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Activate | Phase::Capture if host.is_deactivating() => Step::Complete,
            Phase::Activate => self.init_state(ssm, host),
            Phase::Capture => self.loop_state(ssm, host),
            Phase::Exchange => match ssm.state::<SwapState>() {
                Some(SwapState::Send) => {
                    self.seqnum = self.seqnum.wrapping_add(1);
                    LittleEndian::write_u16(&mut self.command[..2], self.seqnum);
                    Step::Submit(Transfer::bulk_out(EP_OUT, self.command.clone(), BULK_TIMEOUT))
                }
                _ => Step::Submit(Transfer::bulk_in(EP_REPLY, REPLY_SIZE, BULK_TIMEOUT)),
            },
            Phase::Imaging => Step::Submit(Transfer::bulk_in(EP_IMAGE, BLOCK_SIZE, BULK_TIMEOUT)),
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, _host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Exchange => self.swap_done(ssm, &completion),
            Phase::Imaging => self.block_done(&completion),
            // Dirty data left from a previous session
            Phase::Activate => {
                let lenient = std::mem::take(&mut self.lenient);
                self.accept_reply(&completion, lenient)
            }
            _ => Step::from_result(completion.check_status()),
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let result = ssm.into_result();
        if host.is_deactivating() {
            debug!(machine = %phase, "Stopped for deactivation");
            self.buffer.clear();
            return None;
        }
        match (phase, result) {
            (Phase::Activate, result) => {
                let ok = result.is_ok();
                host.activate_complete(result);
                ok.then(|| Ssm::for_states::<LoopState>(Phase::Capture))
            }
            (_, Ok(())) => Some(Ssm::for_states::<LoopState>(Phase::Capture)),
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

    fn pump(dev: &mut ImgDev<MockTransport>) {
        while dev.handle_events(Duration::ZERO).unwrap() {}
    }

    /// Replays the sensor side, echoing sequence numbers.
    struct Sensor {
        mock: MockTransport,
        seq: u16,
    }

    impl Sensor {
        fn reply(&mut self, finger: u8) {
            let mut reply = [0u8; REPLY_SIZE];
            LittleEndian::write_u16(&mut reply[..2], self.seq);
            reply[FINGER_STATE_OFFSET] = finger;
            self.seq = self.seq.wrapping_add(1);
            self.mock.queue_read(&reply);
        }

        fn ok(&mut self) {
            self.reply(0x00);
        }

        fn frames(&self, frames: &[Vec<u8>]) {
            let data: Vec<u8> = frames.concat();
            for block in data.chunks(BLOCK_SIZE) {
                self.mock.queue_read(block);
            }
            if data.len() % BLOCK_SIZE == 0 {
                self.mock.queue_status(TransferStatus::TimedOut);
            }
        }

        fn empty_print(&self) {
            self.frames(&vec![frame(0, 0); EMPTY_PRINT_LINES]);
        }

        fn timeout(&self) {
            self.mock.queue_status(TransferStatus::TimedOut);
        }
    }

    /// Frame with the given scan level and a contrast byte pair 128 apart.
    fn frame(level: u16, y: usize) -> Vec<u8> {
        let mut frame = vec![0u8; FRAME_SIZE];
        frame[5] = 128;
        for x in PIXEL_OFFSET..PIXEL_OFFSET + IMAGE_WIDTH {
            frame[x] = ((x + y) % 3 * 60) as u8;
        }
        frame[282] = level as u8;
        frame[283] = (level >> 8) as u8;
        frame
    }

    /// Finger between frames 50 and 289 of 300.
    fn swipe(lines: usize) -> Vec<Vec<u8>> {
        (0..lines)
            .map(|y| {
                let level = if (50..lines.saturating_sub(10)).contains(&y) { 1000 } else { 0 };
                frame(level, y)
            })
            .collect()
    }

    fn queue_activation(sensor: &mut Sensor) {
        sensor.timeout();
        sensor.ok();
        sensor.timeout();
        sensor.ok();
        sensor.empty_print();
        sensor.reply(0x00);
        for _ in 0..9 {
            sensor.ok();
        }
        sensor.ok();
        for _ in 0..10 {
            sensor.ok();
            sensor.ok();
            sensor.empty_print();
        }
        for _ in 0..4 {
            sensor.ok();
        }
    }

    fn active() -> (ImgDev<MockTransport>, Sensor, Arc<RecordingObserver>) {
        let mock = MockTransport::with_ids(0x138a, 0x0001);
        let obs = Arc::new(RecordingObserver::new());
        let mut dev =
            ImgDev::open_with_transport(mock.clone(), &DriverConfig::default(), obs.clone())
                .unwrap();
        let mut sensor = Sensor { mock, seq: 0 };
        queue_activation(&mut sensor);
        dev.activate().unwrap();
        pump(&mut dev);
        (dev, sensor, obs)
    }

    fn contrast_pokes(mock: &MockTransport) -> Vec<u32> {
        mock.get_writes()
            .iter()
            .filter(|w| w.len() == 15 && w[4] == CMD_POKE)
            .filter(|w| LittleEndian::read_u32(&w[6..10]) == REG_IMG_CONTRAST)
            .map(|w| LittleEndian::read_u32(&w[10..14]))
            .collect()
    }

    #[test]
    fn test_command_layout() {
        assert_eq!(
            get_print(0x000a, false),
            vec![0, 0, 0, 0, 0x03, 0, 0x0a, 0x00, 0x00, 0x01, 0, 0, 0x00, 0x01]
        );
        assert_eq!(set_param(PAR_0078, VAL_0078), vec![0, 0, 0, 0, 0x05, 0, 0x78, 0, 0x30, 0x22]);
        assert_eq!(
            poke(REG_IMG_EXPOSURE, VAL_IMG_EXPOSURE, 2),
            vec![0, 0, 0, 0, 0x13, 0, 0x0e, 0x50, 0xff, 0, 0xc0, 0x21, 0, 0, 0x02]
        );
    }

    #[test]
    fn test_screen_finds_finger_edges() {
        let mut buffer = swipe(300).concat();
        // Bright background pixel is whitened
        buffer[at(PIXEL_OFFSET, 100)] = 200;
        let (bottom, height) = screen(&mut buffer, 300);
        assert_eq!(bottom, 50);
        assert_eq!(height, 240);
        assert_eq!(buffer[at(PIXEL_OFFSET, 100)], 0xff);

        let mut flat = vec![0u8; FRAME_SIZE * 20];
        assert_eq!(screen(&mut flat, 20), (0, 20));
        assert_eq!(screen(&mut [], 0), (0, 0));
    }

    #[test]
    fn test_contrast_keeps_closest_level() {
        let mut drv = Vfs101::new();
        drv.buffer = vec![frame(0, 0); 4].concat();
        drv.height = 4;
        drv.contrast = 12;
        drv.check_contrast();
        assert_eq!((drv.best_contrast, drv.best_level), (12, 128));

        // Too flat to count
        drv.buffer.iter_mut().for_each(|b| *b = 0);
        drv.check_contrast();
        assert_eq!(drv.contrast, 13);
        assert_eq!(drv.best_contrast, 12);
    }

    #[test]
    fn test_activation_calibrates_contrast() {
        let (dev, sensor, obs) = active();
        assert_eq!(obs.events(), vec![FpEvent::ActivateComplete { result: Ok(()) }]);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);

        let writes = sensor.mock.get_writes();
        assert_eq!(writes[0], vec![0, 0, 0, 0, CMD_ABORT_PRINT, 0]);
        assert_eq!(
            contrast_pokes(&sensor.mock),
            vec![15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 15]
        );
        // Capture loop has requested its first print
        assert_eq!(writes.last().map(|w| w[4]), Some(CMD_GET_PRINT));
    }

    #[test]
    fn test_seqnum_mismatch_fails_activation() {
        let mock = MockTransport::with_ids(0x138a, 0x0001);
        let obs = Arc::new(RecordingObserver::new());
        let mut dev =
            ImgDev::open_with_transport(mock.clone(), &DriverConfig::default(), obs.clone())
                .unwrap();
        let mut sensor = Sensor { mock, seq: 7 };
        sensor.timeout();
        sensor.ok();
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
    fn test_swipe_to_image() {
        let (mut dev, mut sensor, obs) = active();
        sensor.ok();
        sensor.reply(0x03);
        sensor.frames(&swipe(300));
        sensor.ok();
        sensor.timeout();
        sensor.ok();
        sensor.empty_print();
        sensor.ok();
        pump(&mut dev);

        let images = obs.images();
        assert_eq!(images.len(), 1);
        assert_eq!((images[0].width, images[0].height), (IMAGE_WIDTH, 240));
        assert_eq!(obs.count("report_finger_status"), 2);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
        let timers = sensor.mock.timers();
        assert_eq!(
            timers[timers.len() - 3..],
            [
                Duration::from_millis(50),
                Duration::from_millis(10),
                Duration::from_millis(50)
            ]
        );
    }

    #[test]
    fn test_empty_sensor_keeps_polling() {
        let (mut dev, mut sensor, obs) = active();
        let before = sensor.mock.timers().len();
        sensor.ok();
        sensor.reply(0x01);
        sensor.reply(0x00);
        pump(&mut dev);
        assert_eq!(sensor.mock.timers().len() - before, 3);
        assert_eq!(obs.count("report_finger_status"), 0);
    }

    #[test]
    fn test_short_swipe_is_too_short() {
        let (mut dev, mut sensor, obs) = active();
        sensor.ok();
        sensor.reply(0x02);
        sensor.frames(&swipe(100));
        sensor.reply(0x00);
        pump(&mut dev);

        assert!(obs.images().is_empty());
        assert!(obs.events().contains(&FpEvent::AbortScan {
            reason: ScanRetry::TooShort
        }));
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
    }

    #[test]
    fn test_unknown_finger_state_is_session_error() {
        let (mut dev, mut sensor, obs) = active();
        sensor.ok();
        sensor.reply(0x42);
        pump(&mut dev);
        assert_eq!(obs.count("session_error"), 1);
        assert!(dev.is_idle());
    }

    #[test]
    fn test_deactivate_stops_loop() {
        let (mut dev, _sensor, obs) = active();
        dev.deactivate().unwrap();
        pump(&mut dev);
        assert_eq!(obs.count("deactivate_complete"), 1);
        assert_eq!(obs.count("session_error"), 0);
    }
}
