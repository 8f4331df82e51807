//! DigitalPersona U.are.U 4000/4000B and the Microsoft readers built on it.
//!
//! Registers are accessed through vendor control requests. Power and finger
//! events arrive as 64-byte interrupt packets. Second generation Microsoft
//! readers authenticate the host with an AES challenge during power-up, and
//! images may come scrambled with an LFSR key stream that has to be undone
//! block by block.

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::{debug, info, warn};

use crate::error::FpError;
use crate::image::{Image, ImageFlags};
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, Step, ssm_states};
use crate::transport::{Completion, Transfer};

const EP_INTR: u8 = 0x81;
const EP_DATA: u8 = 0x82;
const USB_RQ: u8 = 0x04;
const CTRL_TIMEOUT: u32 = 5000;
const IRQ_LENGTH: usize = 64;
const CR_LENGTH: usize = 16;
/// Wait for the scan power interrupt before retrying the power-up.
const SCANPWR_TIMEOUT: u32 = 300;
const SCANPWR_RETRIES: u32 = 3;
const POWER_RETRIES: u32 = 100;
const POWER_PAUSE_MS: u64 = 10;

const IMAGE_HEIGHT: usize = 290;
const IMAGE_WIDTH: usize = 384;
const IMAGE_HEADER: usize = 64;
const IMAGE_SIZE: usize = IMAGE_HEADER + IMAGE_HEIGHT * IMAGE_WIDTH;
const BLOCK_COUNT: usize = 15;
const BLOCK_INFO_OFFSET: usize = 16;
/// Row variance above which an image is considered scrambled.
const ENC_THRESHOLD: i64 = 5000;

const IRQDATA_SCANPWR_ON: u16 = 0x56aa;
const IRQDATA_FINGER_ON: u16 = 0x0101;
const IRQDATA_FINGER_OFF: u16 = 0x0200;
const IRQDATA_DEATH: u16 = 0x0800;

const REG_HWSTAT: u16 = 0x07;
const REG_SCRAMBLE_DATA_INDEX: u16 = 0x33;
const REG_SCRAMBLE_DATA_KEY: u16 = 0x34;
const REG_MODE: u16 = 0x4e;
const REG_DEVICE_INFO: u16 = 0xf0;
const REG_RESPONSE: u16 = 0x2000;
const REG_CHALLENGE: u16 = 0x2010;

const MODE_AWAIT_FINGER_ON: u8 = 0x10;
const MODE_AWAIT_FINGER_OFF: u8 = 0x12;
const MODE_CAPTURE: u8 = 0x20;
const MODE_OFF: u8 = 0x70;

const BLOCKF_CHANGE_KEY: u8 = 0x80;
const BLOCKF_NO_KEY_UPDATE: u8 = 0x04;
const BLOCKF_ENCRYPTED: u8 = 0x02;
const BLOCKF_NOT_PRESENT: u8 = 0x01;

/// Challenge-response key of second generation Microsoft readers.
const CRKEY: [u8; 16] = [
    0x79, 0xac, 0x91, 0x79, 0x5c, 0xa1, 0x47, 0x8e, 0x98, 0xe0, 0x0f, 0x3c, 0x59, 0x8f, 0x5f,
    0x4b,
];

#[derive(Debug)]
struct Profile {
    name: &'static str,
    auth_cr: bool,
    encryption: bool,
}

const MS_KBD: Profile = Profile {
    name: "Microsoft Keyboard with Fingerprint Reader",
    auth_cr: false,
    encryption: false,
};
const MS_INTELLIMOUSE: Profile = Profile {
    name: "Microsoft Wireless IntelliMouse with Fingerprint Reader",
    auth_cr: false,
    encryption: false,
};
const MS_STANDALONE: Profile = Profile {
    name: "Microsoft Fingerprint Reader",
    auth_cr: false,
    encryption: false,
};
const MS_STANDALONE_V2: Profile = Profile {
    name: "Microsoft Fingerprint Reader v2",
    auth_cr: true,
    encryption: false,
};
const DP_URU4000: Profile = Profile {
    name: "Digital Persona U.are.U 4000",
    auth_cr: false,
    encryption: false,
};
const DP_URU4000B: Profile = Profile {
    name: "Digital Persona U.are.U 4000B",
    auth_cr: false,
    encryption: true,
};

static PROFILES: [((u16, u16), &Profile); 7] = [
    ((0x045e, 0x00bb), &MS_KBD),
    ((0x045e, 0x00bc), &MS_INTELLIMOUSE),
    ((0x045e, 0x00bd), &MS_STANDALONE),
    ((0x045e, 0x00ca), &MS_STANDALONE_V2),
    ((0x05ba, 0x0007), &DP_URU4000),
    ((0x05ba, 0x0008), &DP_URU4000),
    ((0x05ba, 0x000a), &DP_URU4000B),
];

pub static INFO: DriverInfo = DriverInfo {
    name: "uru4000",
    full_name: "Digital Persona U.are.U 4000/4000B/4500",
    id_table: &[
        (0x045e, 0x00bb),
        (0x045e, 0x00bc),
        (0x045e, 0x00bd),
        (0x045e, 0x00ca),
        (0x05ba, 0x0007),
        (0x05ba, 0x0008),
        (0x05ba, 0x000a),
    ],
    img_width: Some(IMAGE_WIDTH),
    img_height: Some(IMAGE_HEIGHT),
    bz3_threshold: None,
    interface: 0,
};

ssm_states! {
    enum InitState {
        GetHwstat,
        CheckHwstatReboot,
        RebootPower,
        CheckHwstatPowerdown,
        Powerup,
        AwaitScanPower,
        GetVersion,
        ReportVersion,
    }
}

// Clear the low power bit, waiting for bit 0 to come up.
ssm_states! {
    enum RebootPwrState {
        SetHwstat,
        GetHwstat,
        CheckHwstat,
        Pause,
    }
}

ssm_states! {
    enum PowerupState {
        Init,
        SetHwstat,
        GetHwstat,
        CheckHwstat,
        Pause,
        ReadChallenge,
        WriteResponse,
        ChallengeDone,
    }
}

ssm_states! {
    enum FingerState {
        SetMode,
        AwaitIrq,
    }
}

ssm_states! {
    enum ImagingState {
        SetMode,
        Capture,
        SendIndex,
        ReadKey,
        Decode,
        ReportImage,
    }
}

/// Advance the scrambler key by one bit.
pub fn update_key(key: u32) -> u32 {
    let mut bit = key & 0x9248_144d;
    bit ^= bit << 16;
    bit ^= bit << 8;
    bit ^= bit << 4;
    bit ^= bit << 2;
    bit ^= bit << 1;
    (bit & 0x8000_0000) | (key >> 1)
}

fn key_byte(key: u32) -> u8 {
    const TAPS: [u32; 8] = [4, 8, 11, 14, 18, 21, 24, 29];
    TAPS.iter()
        .enumerate()
        .fold(0u8, |acc, (i, &tap)| acc | ((((key >> tap) & 1) as u8) << i))
}

/// Unscramble `data` in place. Plaintext byte `i` is ciphertext byte `i + 1`
/// masked with the key stream; the last byte is implicitly zero. Returns
/// the key for the next block.
pub fn do_decode(data: &mut [u8], mut key: u32) -> u32 {
    let Some(last) = data.len().checked_sub(1) else {
        return key;
    };
    for i in 0..last {
        let xor = key_byte(key);
        key = update_key(key);
        data[i] = data[i + 1] ^ xor;
    }
    data[last] = 0;
    update_key(key)
}

#[derive(Debug, PartialEq, Eq)]
pub enum DecodeStop {
    Done,
    /// The device switched keys; a fresh seed must be negotiated before
    /// decoding resumes at the same block.
    ChangeKey,
}

/// Raw image as read from the data endpoint: a 64-byte header with the
/// line count, the key number and 15 block descriptors, then the lines.
#[derive(Debug, Default)]
pub struct RawImage {
    buf: Vec<u8>,
    block: usize,
    lines_done: usize,
}

impl RawImage {
    pub fn new(buf: Vec<u8>) -> Self {
        Self {
            buf,
            block: 0,
            lines_done: 0,
        }
    }

    pub fn num_lines(&self) -> usize {
        LittleEndian::read_u16(&self.buf[4..6]) as usize
    }

    pub fn key_number(&self) -> u8 {
        self.buf[6]
    }

    fn block_info(&self, block: usize) -> (u8, usize) {
        let at = BLOCK_INFO_OFFSET + block * 2;
        (self.buf[at], self.buf[at + 1] as usize)
    }

    /// Header present and every declared line received.
    pub fn is_complete(&self) -> bool {
        self.buf.len() >= IMAGE_HEADER
            && self.num_lines() < IMAGE_HEIGHT
            && self.buf.len() >= self.num_lines() * IMAGE_WIDTH + IMAGE_HEADER
    }

    fn lines(&self, first: usize, count: usize) -> std::ops::Range<usize> {
        let start = (IMAGE_HEADER + first * IMAGE_WIDTH).min(self.buf.len());
        let end = (start + count * IMAGE_WIDTH).min(self.buf.len());
        start..end
    }

    /// Variance of the sum of the first two received lines. Scrambled
    /// images look like noise.
    pub fn variance(&self) -> i64 {
        let mut rows = Vec::with_capacity(2);
        let mut r = 0;
        for block in 0..BLOCK_COUNT {
            let (flags, lines) = self.block_info(block);
            if flags & BLOCKF_NOT_PRESENT != 0 {
                continue;
            }
            for _ in 0..lines {
                if rows.len() == 2 {
                    break;
                }
                rows.push(self.lines(r, 1));
                r += 1;
            }
        }
        let [a, b] = rows.as_slice() else {
            return 0;
        };
        if a.len() != IMAGE_WIDTH || b.len() != IMAGE_WIDTH {
            return 0;
        }
        let sums: Vec<i64> = self.buf[a.clone()]
            .iter()
            .zip(&self.buf[b.clone()])
            .map(|(&x, &y)| x as i64 + y as i64)
            .collect();
        let mean = sums.iter().sum::<i64>() / IMAGE_WIDTH as i64;
        sums.iter().map(|s| (s - mean) * (s - mean)).sum::<i64>() / IMAGE_WIDTH as i64
    }

    /// Unscramble blocks starting where the previous call stopped.
    pub fn decode(&mut self, mut key: u32) -> DecodeStop {
        let num_lines = self.num_lines();
        while self.block < BLOCK_COUNT && self.lines_done < num_lines {
            let (flags, lines) = self.block_info(self.block);
            if lines == 0 {
                break;
            }
            if flags & BLOCKF_CHANGE_KEY != 0 {
                debug!(block = self.block, "Changing encryption key");
                self.buf[BLOCK_INFO_OFFSET + self.block * 2] &= !BLOCKF_CHANGE_KEY;
                self.buf[6] = self.buf[6].wrapping_add(1);
                return DecodeStop::ChangeKey;
            }
            let range = self.lines(self.lines_done, lines);
            match flags & (BLOCKF_NO_KEY_UPDATE | BLOCKF_ENCRYPTED) {
                BLOCKF_ENCRYPTED => {
                    debug!(lines, "Decoding block");
                    key = do_decode(&mut self.buf[range], key);
                }
                0 => {
                    for _ in 0..lines * IMAGE_WIDTH {
                        key = update_key(key);
                    }
                }
                _ => {}
            }
            if flags & BLOCKF_NOT_PRESENT == 0 {
                self.lines_done += lines;
            }
            self.block += 1;
        }
        DecodeStop::Done
    }

    /// Lay the blocks out into a full-size image. Blocks the device did
    /// not send repeat the lines that follow.
    pub fn to_image(&self) -> Image {
        let mut img = Image::new(IMAGE_WIDTH, IMAGE_HEIGHT);
        let num_lines = self.num_lines();
        let mut to = 0;
        let mut r = 0;
        for block in 0..BLOCK_COUNT {
            if r >= num_lines {
                break;
            }
            let (flags, lines) = self.block_info(block);
            if lines == 0 {
                break;
            }
            let src = self.lines(r, lines);
            let n = src.len().min(img.data.len() - to);
            img.data[to..to + n].copy_from_slice(&self.buf[src.start..src.start + n]);
            if flags & BLOCKF_NOT_PRESENT == 0 {
                r += lines;
            }
            to += lines * IMAGE_WIDTH;
            if to >= img.data.len() {
                break;
            }
        }
        img
    }
}

fn read_regs(reg: u16, len: usize) -> Step {
    debug!(reg, len, "Reading registers");
    Step::Submit(Transfer::vendor_in(USB_RQ, reg, 0, len, CTRL_TIMEOUT))
}

fn write_regs(reg: u16, values: impl Into<Vec<u8>>) -> Step {
    Step::Submit(Transfer::vendor_out(USB_RQ, reg, 0, values, CTRL_TIMEOUT))
}

fn set_hwstat(value: u8) -> Step {
    debug!(value, "Setting hwstat");
    write_regs(REG_HWSTAT, [value])
}

fn await_irq(timeout: u32) -> Step {
    Step::Submit(Transfer::interrupt_in(EP_INTR, IRQ_LENGTH, timeout))
}

fn irq_type(completion: &Completion) -> Result<u16, FpError> {
    let data = completion.check_full()?;
    let kind = BigEndian::read_u16(&data[..2]);
    debug!(kind = %format!("{:04x}", kind), "Interrupt received");
    if kind == IRQDATA_DEATH {
        warn!("Interrupt of death received, expect the next scan to fail");
    }
    Ok(kind)
}

pub struct Uru4000 {
    profile: &'static Profile,
    cr_cipher: Aes128,
    last_reg_rd: Vec<u8>,
    last_hwstat: u8,
    rebootpwr_ctr: u32,
    powerup_ctr: u32,
    powerup_hwstat: u8,
    scanpwr_irq_timeouts: u32,
    /// Finger machine waits for the finger to land rather than leave.
    await_finger_on: bool,
    img: RawImage,
    img_enc_seed: u32,
}

impl Uru4000 {
    pub fn new(vid: u16, pid: u16) -> Result<Self, FpError> {
        let profile = PROFILES
            .iter()
            .find(|(ids, _)| *ids == (vid, pid))
            .map(|(_, profile)| *profile)
            .ok_or_else(|| FpError::Resource(format!("unknown reader {:04x}:{:04x}", vid, pid)))?;
        debug!(model = profile.name, "Reader profile");
        Ok(Self {
            profile,
            cr_cipher: Aes128::new(&GenericArray::from(CRKEY)),
            last_reg_rd: Vec::new(),
            last_hwstat: 0,
            rebootpwr_ctr: 0,
            powerup_ctr: 0,
            powerup_hwstat: 0,
            scanpwr_irq_timeouts: 0,
            await_finger_on: true,
            img: RawImage::default(),
            img_enc_seed: 0,
        })
    }

    fn last_reg(&self) -> u8 {
        self.last_reg_rd.first().copied().unwrap_or(0)
    }

    fn challenge_response(&self) -> Result<[u8; CR_LENGTH], FpError> {
        if self.last_reg_rd.len() != CR_LENGTH {
            return Err(FpError::protocol("short challenge"));
        }
        let mut block = GenericArray::clone_from_slice(&self.last_reg_rd);
        self.cr_cipher.encrypt_block(&mut block);
        let mut response = [0u8; CR_LENGTH];
        response.copy_from_slice(&block);
        Ok(response)
    }

    fn finger_machine(&mut self, on: bool) -> Ssm {
        self.await_finger_on = on;
        Ssm::for_states::<FingerState>(Phase::FingerDetect)
    }

    fn init_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<InitState>() {
            Some(InitState::GetHwstat) => read_regs(REG_HWSTAT, 1),
            Some(InitState::CheckHwstatReboot) => {
                self.last_hwstat = self.last_reg();
                if self.last_hwstat & 0x84 == 0x84 {
                    Step::Next
                } else {
                    Step::jump(InitState::CheckHwstatPowerdown)
                }
            }
            Some(InitState::RebootPower) => {
                Step::Subsm(Ssm::for_states::<RebootPwrState>(Phase::RebootPower))
            }
            Some(InitState::CheckHwstatPowerdown) => {
                if self.last_hwstat & 0x80 == 0 {
                    set_hwstat(self.last_hwstat | 0x80)
                } else {
                    Step::Next
                }
            }
            Some(InitState::Powerup) => Step::Subsm(Ssm::for_states::<PowerupState>(Phase::PowerUp)),
            Some(InitState::AwaitScanPower) => await_irq(SCANPWR_TIMEOUT),
            Some(InitState::GetVersion) => read_regs(REG_DEVICE_INFO, 16),
            Some(InitState::ReportVersion) => {
                let v = &self.last_reg_rd;
                if v.len() == 16 {
                    info!("Versions {:02x}{:02x} and {:02x}{:02x}", v[10], v[11], v[4], v[5]);
                }
                Step::Complete
            }
            None => Step::Abort(FpError::protocol("unknown init state")),
        }
    }

    fn rebootpwr_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<RebootPwrState>() {
            Some(RebootPwrState::SetHwstat) => {
                self.rebootpwr_ctr = POWER_RETRIES;
                set_hwstat(self.last_hwstat & 0x0f)
            }
            Some(RebootPwrState::GetHwstat) => read_regs(REG_HWSTAT, 1),
            Some(RebootPwrState::CheckHwstat) => {
                self.last_hwstat = self.last_reg();
                if self.last_hwstat & 0x01 != 0 {
                    Step::Complete
                } else {
                    Step::Next
                }
            }
            Some(RebootPwrState::Pause) => Step::sleep_ms(POWER_PAUSE_MS),
            None => Step::Abort(FpError::protocol("unknown reboot state")),
        }
    }

    fn powerup_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<PowerupState>() {
            Some(PowerupState::Init) => {
                self.powerup_ctr = POWER_RETRIES;
                self.powerup_hwstat = self.last_hwstat & 0x0f;
                Step::Next
            }
            Some(PowerupState::SetHwstat) => set_hwstat(self.powerup_hwstat),
            Some(PowerupState::GetHwstat) => read_regs(REG_HWSTAT, 1),
            Some(PowerupState::CheckHwstat) => {
                self.last_hwstat = self.last_reg();
                if self.last_hwstat & 0x80 == 0 {
                    Step::Complete
                } else {
                    Step::Next
                }
            }
            Some(PowerupState::Pause) => Step::sleep_ms(POWER_PAUSE_MS),
            Some(PowerupState::ReadChallenge) => read_regs(REG_CHALLENGE, CR_LENGTH),
            Some(PowerupState::WriteResponse) => match self.challenge_response() {
                Ok(response) => write_regs(REG_RESPONSE, response),
                Err(e) => Step::Abort(e),
            },
            Some(PowerupState::ChallengeDone) => Step::jump(PowerupState::SetHwstat),
            None => Step::Abort(FpError::protocol("unknown powerup state")),
        }
    }

    fn imaging_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<ImagingState>() {
            Some(ImagingState::SetMode) => write_regs(REG_MODE, [MODE_CAPTURE]),
            Some(ImagingState::Capture) => {
                Step::Submit(Transfer::bulk_in(EP_DATA, IMAGE_SIZE, 0))
            }
            Some(ImagingState::SendIndex) => {
                if !self.img.is_complete() {
                    warn!(
                        lines = self.img.buf.get(4..6).map(LittleEndian::read_u16),
                        len = self.img.buf.len(),
                        "Bad captured image"
                    );
                    return Step::jump(ImagingState::Capture);
                }
                if !self.profile.encryption {
                    let dev2 = self.img.variance();
                    debug!(dev2, "Row variance");
                    if dev2 < ENC_THRESHOLD {
                        return Step::jump(ImagingState::ReportImage);
                    }
                    info!("Image seems to be encrypted");
                }
                let mut index = [0u8; 5];
                index[0] = self.img.key_number();
                LittleEndian::write_u32(&mut index[1..], self.img_enc_seed);
                write_regs(REG_SCRAMBLE_DATA_INDEX, index)
            }
            Some(ImagingState::ReadKey) => read_regs(REG_SCRAMBLE_DATA_KEY, 4),
            Some(ImagingState::Decode) => {
                if self.last_reg_rd.len() != 4 {
                    return Step::Abort(FpError::protocol("short scramble key"));
                }
                let key = LittleEndian::read_u32(&self.last_reg_rd) ^ self.img_enc_seed;
                debug!(
                    key_number = self.img.key_number(),
                    key = %format!("{:08x}", key),
                    "Decoding image"
                );
                match self.img.decode(key) {
                    DecodeStop::Done => Step::Next,
                    DecodeStop::ChangeKey => {
                        self.img_enc_seed = rand::random();
                        Step::jump(ImagingState::SendIndex)
                    }
                }
            }
            Some(ImagingState::ReportImage) => Step::Complete,
            None => Step::Abort(FpError::protocol("unknown imaging state")),
        }
    }

    fn report_image(&mut self, host: &mut Host) {
        let mut flags = ImageFlags::COLORS_INVERTED;
        if !self.profile.encryption {
            flags |= ImageFlags::V_FLIPPED | ImageFlags::H_FLIPPED;
        }
        let img = self.img.to_image().with_flags(flags);
        self.img = RawImage::default();
        host.image_captured(img);
    }

    fn scanpwr_timeout(&mut self) -> Step {
        self.scanpwr_irq_timeouts += 1;
        warn!(attempt = self.scanpwr_irq_timeouts, "Power-up timed out");
        if self.scanpwr_irq_timeouts >= SCANPWR_RETRIES {
            return Step::Abort(FpError::Timeout);
        }
        Step::jump(InitState::GetHwstat)
    }
}

impl ImageDriver for Uru4000 {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        self.scanpwr_irq_timeouts = 0;
        self.img_enc_seed = rand::random();
        Ok(Ssm::for_states::<InitState>(Phase::Init))
    }

    fn deactivate(&mut self, _host: &mut Host) -> Option<Ssm> {
        Some(Ssm::new(Phase::Deactivate, 1))
    }

    fn run_state(&mut self, ssm: &Ssm, _host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Init => self.init_state(ssm),
            Phase::RebootPower => self.rebootpwr_state(ssm),
            Phase::PowerUp => self.powerup_state(ssm),
            Phase::FingerDetect => match ssm.state::<FingerState>() {
                Some(FingerState::SetMode) => {
                    let mode = if self.await_finger_on {
                        MODE_AWAIT_FINGER_ON
                    } else {
                        MODE_AWAIT_FINGER_OFF
                    };
                    write_regs(REG_MODE, [mode])
                }
                Some(FingerState::AwaitIrq) => await_irq(0),
                None => Step::Abort(FpError::protocol("unknown finger state")),
            },
            Phase::Imaging => self.imaging_state(ssm),
            Phase::Deactivate => write_regs(REG_MODE, [MODE_OFF]),
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        let phase = ssm.phase();
        if phase == Phase::Init && ssm.state::<InitState>() == Some(InitState::AwaitScanPower) {
            return match irq_type(&completion) {
                Ok(IRQDATA_SCANPWR_ON) => Step::Next,
                Ok(_) => {
                    debug!("Ignoring interrupt");
                    Step::jump(InitState::AwaitScanPower)
                }
                Err(FpError::Timeout) => self.scanpwr_timeout(),
                Err(e) => Step::Abort(e),
            };
        }
        if phase == Phase::FingerDetect && ssm.state::<FingerState>() == Some(FingerState::AwaitIrq) {
            return match irq_type(&completion) {
                Ok(IRQDATA_FINGER_ON) if self.await_finger_on => {
                    host.report_finger_status(true);
                    Step::Complete
                }
                Ok(IRQDATA_FINGER_OFF) if !self.await_finger_on => {
                    host.report_finger_status(false);
                    Step::Complete
                }
                Ok(kind) => {
                    warn!(kind = %format!("{:04x}", kind), "Ignoring unexpected interrupt");
                    Step::jump(FingerState::AwaitIrq)
                }
                Err(e) => Step::Abort(e),
            };
        }
        if phase == Phase::Imaging && ssm.state::<ImagingState>() == Some(ImagingState::Capture) {
            return match completion.check_status() {
                Ok(()) => {
                    self.img = RawImage::new(completion.data);
                    Step::Next
                }
                Err(e) => Step::Abort(e),
            };
        }

        match completion.check_full() {
            Ok(data) => {
                if !data.is_empty() {
                    self.last_reg_rd = data.to_vec();
                }
                Step::Next
            }
            Err(FpError::ShortTransfer { expected, actual }) => Step::Abort(FpError::protocol(
                format!("register access moved {} of {} bytes", actual, expected),
            )),
            Err(e) => Step::Abort(e),
        }
    }

    fn timer_done(&mut self, ssm: &Ssm, _host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::RebootPower => {
                self.rebootpwr_ctr -= 1;
                if self.rebootpwr_ctr == 0 {
                    return Step::Abort(FpError::protocol("could not reboot device power"));
                }
                Step::jump(RebootPwrState::GetHwstat)
            }
            Phase::PowerUp => {
                self.powerup_ctr -= 1;
                if self.powerup_ctr == 0 {
                    return Step::Abort(FpError::protocol("could not power device up"));
                }
                if self.profile.auth_cr {
                    Step::Next
                } else {
                    Step::jump(PowerupState::SetHwstat)
                }
            }
            _ => Step::Next,
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let state = ssm.cur_state();
        let result = ssm.into_result();

        if phase == Phase::Deactivate {
            if let Err(e) = result {
                warn!(error = %e, "Failed to switch the reader off");
            }
            return None;
        }
        if host.is_deactivating() {
            self.img = RawImage::default();
            if phase == Phase::Init {
                host.activate_complete(Err(FpError::Cancelled));
            }
            return Some(Ssm::new(Phase::Deactivate, 1));
        }

        match (phase, result) {
            (Phase::Init, Ok(())) => {
                host.activate_complete(Ok(()));
                Some(self.finger_machine(true))
            }
            (Phase::Init, Err(e)) => {
                warn!(state, error = %e, "Initialization failed");
                host.activate_complete(Err(e));
                None
            }
            (Phase::FingerDetect, Ok(())) if self.await_finger_on => {
                Some(Ssm::for_states::<ImagingState>(Phase::Imaging))
            }
            (Phase::FingerDetect, Ok(())) => Some(self.finger_machine(true)),
            (Phase::Imaging, Ok(())) => {
                self.report_image(host);
                Some(self.finger_machine(false))
            }
            (_, Err(e)) => {
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
    use crate::config::DriverConfig;
    use crate::events::{FpEvent, RecordingObserver};
    use crate::imgdev::{AcquireState, ImgDev};
    use crate::transport::{MockTransport, TransferStatus};

    fn pump(dev: &mut ImgDev<MockTransport>) {
        while dev.handle_events(Duration::ZERO).unwrap() {}
    }

    fn irq(kind: u16) -> Vec<u8> {
        let mut data = vec![0u8; IRQ_LENGTH];
        BigEndian::write_u16(&mut data[..2], kind);
        data
    }

    fn raw_image(num_lines: u16, key_number: u8, blocks: &[(u8, u8)], fill: impl Fn(usize) -> u8) -> Vec<u8> {
        let mut buf = vec![0u8; IMAGE_SIZE];
        LittleEndian::write_u16(&mut buf[4..6], num_lines);
        buf[6] = key_number;
        for (i, &(flags, lines)) in blocks.iter().enumerate() {
            buf[BLOCK_INFO_OFFSET + i * 2] = flags;
            buf[BLOCK_INFO_OFFSET + i * 2 + 1] = lines;
        }
        for (i, px) in buf[IMAGE_HEADER..].iter_mut().enumerate() {
            *px = fill(i);
        }
        buf
    }

    /// Power-up without reboot: hwstat reads 0, powered down, powered up,
    /// scan power interrupt, version block.
    fn queue_init(mock: &MockTransport) {
        mock.queue_read(&[0x00]);
        mock.queue_read(&[0x00]);
        mock.queue_read(&irq(IRQDATA_SCANPWR_ON));
        mock.queue_read(&[0u8; 16]);
    }

    fn active(vid: u16, pid: u16) -> (ImgDev<MockTransport>, MockTransport, Arc<RecordingObserver>) {
        let mock = MockTransport::with_ids(vid, pid);
        let obs = Arc::new(RecordingObserver::new());
        let mut dev =
            ImgDev::open_with_transport(mock.clone(), &DriverConfig::default(), obs.clone())
                .unwrap();
        dev.activate().unwrap();
        queue_init(&mock);
        pump(&mut dev);
        (dev, mock, obs)
    }

    #[test]
    fn test_key_stream_decrypts_block() {
        let cipher: Vec<u8> = (0..IMAGE_SIZE).map(|i| (i * 7 + 3) as u8).collect();
        let mut buf = cipher.clone();
        LittleEndian::write_u16(&mut buf[4..6], 290);
        buf[6] = 7;
        buf[BLOCK_INFO_OFFSET..IMAGE_HEADER].fill(0);
        buf[BLOCK_INFO_OFFSET] = BLOCKF_ENCRYPTED;
        buf[BLOCK_INFO_OFFSET + 1] = 32;
        let mut img = RawImage::new(buf);
        let key = 0x1234_5678;
        assert_eq!(img.decode(key), DecodeStop::Done);

        let mut k = key;
        for i in 0..IMAGE_WIDTH {
            let expected = cipher[IMAGE_HEADER + i + 1] ^ key_byte(k);
            assert_eq!(img.buf[IMAGE_HEADER + i], expected, "byte {}", i);
            k = update_key(k);
        }
        // Block end is zero, lines past the block untouched
        assert_eq!(img.buf[IMAGE_HEADER + 32 * IMAGE_WIDTH - 1], 0);
        assert_eq!(img.buf[IMAGE_HEADER + 32 * IMAGE_WIDTH], cipher[IMAGE_HEADER + 32 * IMAGE_WIDTH]);
    }

    #[test]
    fn test_key_change_stops_decoding() {
        let blocks = [(BLOCKF_ENCRYPTED, 16), (BLOCKF_CHANGE_KEY | BLOCKF_ENCRYPTED, 16)];
        let buf = raw_image(32, 7, &blocks, |i| (i % 251) as u8);
        let second = buf[IMAGE_HEADER + 16 * IMAGE_WIDTH..IMAGE_HEADER + 32 * IMAGE_WIDTH].to_vec();
        let mut img = RawImage::new(buf);

        assert_eq!(img.decode(1), DecodeStop::ChangeKey);
        assert_eq!(img.key_number(), 8);
        assert_eq!(img.block_info(1).0, BLOCKF_ENCRYPTED);
        assert_eq!(img.lines_done, 16);

        assert_eq!(img.decode(0xdead_beef), DecodeStop::Done);
        let mut expected = second;
        do_decode(&mut expected, 0xdead_beef);
        assert_eq!(&img.buf[IMAGE_HEADER + 16 * IMAGE_WIDTH..IMAGE_HEADER + 32 * IMAGE_WIDTH], &expected[..]);
    }

    #[test]
    fn test_lfsr_shifts_feedback_into_top_bit() {
        assert_eq!(update_key(0), 0);
        assert_eq!(update_key(0x2), 0x1);
        // Bit 0 is a tap: odd parity sets the top bit
        assert_eq!(update_key(0x1), 0x8000_0000);
    }

    #[test]
    fn test_flat_image_is_not_scrambled() {
        let img = RawImage::new(raw_image(10, 0, &[(0, 10)], |_| 0x40));
        assert_eq!(img.variance(), 0);
        let noisy = RawImage::new(raw_image(10, 0, &[(0, 10)], |i| if i % 2 == 0 { 0 } else { 0xff }));
        assert!(noisy.variance() >= ENC_THRESHOLD);
    }

    #[test]
    fn test_missing_block_repeats_lines() {
        let blocks = [(0, 2), (BLOCKF_NOT_PRESENT, 1), (0, 2)];
        let img = RawImage::new(raw_image(4, 0, &blocks, |i| ((i / IMAGE_WIDTH) as u8).wrapping_add(1)));
        let out = img.to_image();
        let rows: Vec<u8> = (0..6).map(|y| out.pixel(0, y)).collect();
        assert_eq!(rows, vec![1, 2, 3, 3, 4, 0]);
    }

    #[test]
    fn test_activation_and_capture_cycle() {
        let (mut dev, mock, obs) = active(0x05ba, 0x0007);
        assert_eq!(obs.count("activate_complete"), 1);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
        assert_eq!(
            mock.control_writes(),
            vec![(REG_HWSTAT, vec![0x80]), (REG_HWSTAT, vec![0x00]), (REG_MODE, vec![MODE_AWAIT_FINGER_ON])]
        );

        mock.clear_writes();
        mock.queue_read(&irq(IRQDATA_SCANPWR_ON));
        mock.queue_read(&irq(IRQDATA_FINGER_ON));
        mock.queue_read(&raw_image(100, 0, &[(0, 100)], |_| 0x40));
        mock.queue_read(&irq(IRQDATA_FINGER_OFF));
        pump(&mut dev);

        let images = obs.images();
        assert_eq!(images.len(), 1);
        assert_eq!((images[0].width, images[0].height), (IMAGE_WIDTH, IMAGE_HEIGHT));
        // Flipped back, then inverted
        assert_eq!(images[0].pixel(0, IMAGE_HEIGHT - 1), 0xff - 0x40);
        assert_eq!(
            mock.control_writes(),
            vec![
                (REG_MODE, vec![MODE_CAPTURE]),
                (REG_MODE, vec![MODE_AWAIT_FINGER_OFF]),
                (REG_MODE, vec![MODE_AWAIT_FINGER_ON]),
            ]
        );
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
        assert_eq!(obs.count("session_error"), 0);
    }

    #[test]
    fn test_scrambled_image_uses_device_key() {
        let (mut dev, mock, obs) = active(0x05ba, 0x000a);
        mock.clear_writes();
        let raw = raw_image(8, 3, &[(BLOCKF_ENCRYPTED, 8)], |i| (i * 31 % 256) as u8);
        mock.queue_read(&irq(IRQDATA_FINGER_ON));
        mock.queue_read(&raw);
        // Key register reads 0, so the key equals the seed
        mock.queue_read(&[0, 0, 0, 0]);
        pump(&mut dev);

        let writes = mock.control_writes();
        let (reg, index) = &writes[1];
        assert_eq!(*reg, REG_SCRAMBLE_DATA_INDEX);
        assert_eq!(index[0], 3);
        let seed = LittleEndian::read_u32(&index[1..]);

        let mut expected = raw[IMAGE_HEADER..IMAGE_HEADER + 8 * IMAGE_WIDTH].to_vec();
        do_decode(&mut expected, seed);
        let images = obs.images();
        assert_eq!(images.len(), 1);
        let got: Vec<u8> = images[0].data[..8 * IMAGE_WIDTH].iter().map(|p| 0xff - p).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_challenge_response_during_powerup() {
        let mock = MockTransport::with_ids(0x045e, 0x00ca);
        let obs = Arc::new(RecordingObserver::new());
        let mut dev =
            ImgDev::open_with_transport(mock.clone(), &DriverConfig::default(), obs.clone())
                .unwrap();
        dev.activate().unwrap();
        let challenge: Vec<u8> = (0..16).collect();
        mock.queue_read(&[0x00]);
        // Still in low power after the first attempt
        mock.queue_read(&[0x80]);
        mock.queue_read(&challenge);
        mock.queue_read(&[0x00]);
        mock.queue_read(&irq(IRQDATA_SCANPWR_ON));
        mock.queue_read(&[0u8; 16]);
        pump(&mut dev);

        assert_eq!(mock.timers(), vec![Duration::from_millis(POWER_PAUSE_MS)]);
        let mut block = GenericArray::clone_from_slice(&challenge);
        Aes128::new(&GenericArray::from(CRKEY)).encrypt_block(&mut block);
        assert!(mock.control_writes().contains(&(REG_RESPONSE, block.to_vec())));
        assert_eq!(obs.count("activate_complete"), 1);
        assert_eq!(dev.state(), AcquireState::AwaitFingerOn);
    }

    #[test]
    fn test_scan_power_timeout_gives_up() {
        let mock = MockTransport::with_ids(0x05ba, 0x0007);
        let obs = Arc::new(RecordingObserver::new());
        let mut dev =
            ImgDev::open_with_transport(mock.clone(), &DriverConfig::default(), obs.clone())
                .unwrap();
        dev.activate().unwrap();
        for _ in 0..SCANPWR_RETRIES {
            mock.queue_read(&[0x00]);
            mock.queue_read(&[0x00]);
            mock.queue_status(TransferStatus::TimedOut);
        }
        pump(&mut dev);

        assert_eq!(
            obs.events().last(),
            Some(&FpEvent::ActivateComplete {
                result: Err(FpError::Timeout)
            })
        );
        assert!(dev.is_idle());
    }

    #[test]
    fn test_deactivate_switches_reader_off() {
        let (mut dev, mock, obs) = active(0x05ba, 0x0007);
        mock.clear_writes();
        dev.deactivate().unwrap();
        pump(&mut dev);
        assert_eq!(mock.control_writes(), vec![(REG_MODE, vec![MODE_OFF])]);
        assert_eq!(obs.count("deactivate_complete"), 1);
        assert_eq!(obs.count("session_error"), 0);
    }
}
