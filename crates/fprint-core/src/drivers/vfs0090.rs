//! Validity VFS0090 press sensor behind a TLS-like channel.
//!
//! Open replays the vendor init sequence, recovers the device keys from
//! the sixth reply and runs the handshake. Every later command and answer
//! on the bulk pipe is a sealed record. Scan progress arrives on the
//! interrupt endpoint and the finished image is read in three records.

use p256::SecretKey;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::Vfs0090Config;
use crate::error::{FpError, ScanRetry};
use crate::image::Image;
use crate::imgdev::{AcquireState, DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, Step, ssm_states};
use crate::tls::constants::fixed_host_key;
use crate::tls::handshake::{self, CERTIFICATE_MIN_LEN, CLIENT_HELLO_MIN_LEN};
use crate::tls::keys::{self, PRE_KEY_LEN};
use crate::tls::record::CONTENT_APPLICATION;
use crate::tls::{DeviceKeys, Handshake, KeyBlock, RecordCipher, TlsError};
use crate::transport::{Completion, Transfer};

const EP_OUT: u8 = 0x01;
const EP_IN: u8 = 0x81;
const EP_INTERRUPT: u8 = 0x83;
const USB_TIMEOUT: u32 = 10000;
const MAX_REPLY: usize = 1024 * 1024;
const INTERRUPT_LEN: usize = 0x100;

const INIT_MESSAGES: usize = 6;
/// Last byte of the first init reply on a paired sensor.
const SENSOR_READY: u8 = 0x07;

pub const IMAGE_WIDTH: usize = 144;
pub const IMAGE_HEIGHT: usize = 144;
const IMAGE_SIZE: usize = IMAGE_WIDTH * IMAGE_HEIGHT;
const IMAGE_CHUNKS: usize = 3;
const FIRST_CHUNK_HEADER: usize = 0x12;
const NEXT_CHUNK_HEADER: usize = 0x06;
const LED_WAIT_MS: u64 = 500;

const CMD_READ_IMAGE: [u8; 5] = [0x51, 0x00, 0x20, 0x00, 0x00];
const CMD_END_SCAN: [u8; 5] = [0x60, 0x00, 0x00, 0x00, 0x00];
const CMD_RESET_SCAN: [u8; 5] = [0x62, 0x00, 0x00, 0x00, 0x00];

/// Seed of sensors paired inside a VirtualBox guest.
const FALLBACK_SEED: &[u8] = b"VirtualBox\x000\x00";
const DMI_DIR: &str = "/sys/class/dmi/id";

pub static INFO: DriverInfo = DriverInfo {
    name: "vfs0090",
    full_name: "Validity VFS0090",
    id_table: &[(0x138a, 0x0090)],
    img_width: Some(IMAGE_WIDTH),
    img_height: Some(IMAGE_HEIGHT),
    bz3_threshold: None,
    interface: 0,
};

ssm_states! {
    enum OpenState {
        Init,
        Keys,
        Handshake,
    }
}

ssm_states! {
    enum HandshakeState {
        ClientHello,
        ServerHello,
        Certificate,
        Finished,
    }
}

ssm_states! {
    enum ScanState {
        LedOn,
        LedOnReply,
        ScanMatrix,
        ScanMatrixReply,
        AwaitInterrupt,
        ReadImage,
        ReadImageReply,
        EndScan,
        EndScanReply,
        ResetScan,
        ResetScanReply,
        SubmitImage,
        LedResult,
        LedResultReply,
        LedWait,
    }
}

/// Interrupt reports seen while a scan is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanStatus {
    WaitingFinger,
    FingerDown,
    Scanning,
    ScanComplete,
    Success,
    Failed(ScanRetry),
    Unknown,
}

fn scan_status(interrupt: &[u8]) -> ScanStatus {
    match interrupt {
        [0x00, 0x00, 0x00, 0x00, 0x00] => ScanStatus::WaitingFinger,
        [0x02, 0x00, 0x40, 0x10, 0x00] | [0x02, 0x00, 0x40, 0x06, 0x06] => ScanStatus::FingerDown,
        [0x03, 0x40, 0x01, 0x00, 0x00] => ScanStatus::Scanning,
        [0x03, 0x41, 0x03, 0x00, 0x40] => ScanStatus::ScanComplete,
        // The second one is also sent for low-quality scans
        [0x03, 0x43, 0x04, 0x00, 0x41] | [0x03, 0x42, 0x04, 0x00, 0x40] => ScanStatus::Success,
        [0x03, 0x60, 0x07, 0x00, 0x40] | [0x03, 0x61, 0x07, 0x00, 0x41] => {
            ScanStatus::Failed(ScanRetry::CenterFinger)
        }
        [0x03, 0x20, 0x07, 0x00, 0x00] => ScanStatus::Failed(ScanRetry::Retry),
        _ => ScanStatus::Unknown,
    }
}

/// Host seeds to try, most specific first.
fn host_seeds(configured: &[u8]) -> Vec<Vec<u8>> {
    let mut seeds = Vec::with_capacity(2);
    if !configured.is_empty() {
        seeds.push(configured.to_vec());
    } else if let Some(seed) = dmi_host_seed() {
        seeds.push(seed);
    } else {
        warn!("No DMI product identity, only the fallback seed will be tried");
    }
    seeds.push(FALLBACK_SEED.to_vec());
    seeds
}

fn dmi_host_seed() -> Option<Vec<u8>> {
    // Only the first word of each field counts
    let read = |field: &str| {
        std::fs::read_to_string(format!("{DMI_DIR}/{field}"))
            .ok()
            .and_then(|s| s.split_whitespace().next().map(str::to_owned))
    };
    Some(keys::host_seed(
        &read("product_name")?,
        &read("product_serial")?,
    ))
}

pub struct Vfs0090 {
    config: Vfs0090Config,
    seeds: Vec<Vec<u8>>,
    provision: Zeroizing<Vec<u8>>,
    device_keys: Option<DeviceKeys>,
    handshake: Option<Handshake>,
    pending_keys: Option<KeyBlock>,
    channel: Option<RecordCipher>,
    image: Vec<u8>,
    chunks: usize,
    scan_ok: bool,
}

impl Vfs0090 {
    pub fn new(config: &Vfs0090Config) -> Result<Self, FpError> {
        let invalid = |what: &str| FpError::Config(format!("vfs0090: {what}"));
        if config.pre_key.len() != PRE_KEY_LEN {
            return Err(invalid("pre_key must be 32 bytes"));
        }
        if config.init.len() != INIT_MESSAGES || config.init.iter().any(Vec::is_empty) {
            return Err(invalid("init needs 6 non-empty messages"));
        }
        if config.client_hello.len() < CLIENT_HELLO_MIN_LEN {
            return Err(invalid("client_hello template too short"));
        }
        if config.certificate.len() < CERTIFICATE_MIN_LEN {
            return Err(invalid("certificate template too short"));
        }
        let commands = [
            &config.led_green_on,
            &config.led_green_blink,
            &config.led_red_blink,
            &config.scan_matrix,
        ];
        if commands.iter().any(|c| c.is_empty()) {
            return Err(invalid("LED and scan matrix commands are required"));
        }
        if !config.host_key.is_empty() && SecretKey::from_slice(&config.host_key).is_err() {
            return Err(invalid("host_key is not a P-256 scalar"));
        }

        Ok(Self {
            config: config.clone(),
            seeds: host_seeds(&config.host_seed),
            provision: Zeroizing::new(Vec::new()),
            device_keys: None,
            handshake: None,
            pending_keys: None,
            channel: None,
            image: Vec::new(),
            chunks: 0,
            scan_ok: false,
        })
    }

    /// Configured host key, otherwise the one the sensor was paired with.
    fn host_key(&self) -> Result<SecretKey, FpError> {
        if self.config.host_key.is_empty() {
            return Ok(fixed_host_key()?);
        }
        SecretKey::from_slice(&self.config.host_key)
            .map_err(|e| FpError::Config(format!("vfs0090 host_key: {e}")))
    }

    fn forget_secrets(&mut self) {
        self.provision = Zeroizing::new(Vec::new());
        self.device_keys = None;
        self.handshake = None;
        self.pending_keys = None;
        self.channel = None;
    }

    fn send_sealed(&self, plaintext: &[u8]) -> Step {
        let Some(channel) = &self.channel else {
            return Step::Abort(FpError::protocol("secure channel not established"));
        };
        match channel.seal(CONTENT_APPLICATION, plaintext) {
            Ok(record) => Step::Submit(Transfer::bulk_out(EP_OUT, record, USB_TIMEOUT)),
            Err(e) => Step::Abort(e.into()),
        }
    }

    fn read_reply() -> Step {
        Step::Submit(Transfer::bulk_in(EP_IN, MAX_REPLY, USB_TIMEOUT))
    }

    fn open_sealed(&self, completion: &Completion) -> Result<Zeroizing<Vec<u8>>, FpError> {
        completion.check_status()?;
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| FpError::protocol("secure channel not established"))?;
        let (_, plain) = channel.open(&completion.data)?;
        Ok(plain)
    }

    // Init: one send and one read per message.

    fn init_state(&self, ssm: &Ssm) -> Step {
        if ssm.cur_state() % 2 == 1 {
            return Self::read_reply();
        }
        match self.config.init.get(ssm.cur_state() / 2) {
            Some(message) => Step::Submit(Transfer::bulk_out(EP_OUT, message.clone(), USB_TIMEOUT)),
            None => Step::Abort(FpError::protocol("init message out of range")),
        }
    }

    fn init_done(&mut self, ssm: &Ssm, completion: &Completion) -> Step {
        if ssm.cur_state() % 2 == 0 {
            return Step::from_result(completion.check_full().map(|_| ()));
        }
        if let Err(e) = completion.check_status() {
            return Step::Abort(e);
        }
        match ssm.cur_state() / 2 {
            0 => match completion.data.last() {
                Some(&SENSOR_READY) => Step::Next,
                last => Step::Abort(FpError::protocol(format!(
                    "sensor is not paired, init byte {:02x?}",
                    last
                ))),
            },
            index if index == INIT_MESSAGES - 1 => {
                debug!(len = completion.data.len(), "Provisioning data received");
                self.provision = Zeroizing::new(completion.data.clone());
                Step::Next
            }
            _ => Step::Next,
        }
    }

    fn open_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<OpenState>() {
            Some(OpenState::Init) => Step::Subsm(Ssm::new(Phase::Init, 2 * INIT_MESSAGES)),
            Some(OpenState::Keys) => {
                match DeviceKeys::recover(&self.provision, &self.config.pre_key, &self.seeds) {
                    Ok(keys) => {
                        self.device_keys = Some(keys);
                        Step::Next
                    }
                    Err(e) => Step::Abort(e.into()),
                }
            }
            Some(OpenState::Handshake) => {
                Step::Subsm(Ssm::for_states::<HandshakeState>(Phase::Handshake))
            }
            None => Step::Abort(FpError::protocol("bad open state")),
        }
    }

    fn handshake_state(&mut self, ssm: &Ssm) -> Step {
        match ssm.state::<HandshakeState>() {
            Some(HandshakeState::ClientHello) => {
                let host_key = match self.host_key() {
                    Ok(key) => key,
                    Err(e) => return Step::Abort(e),
                };
                let mut handshake = Handshake::new(host_key, handshake::client_random());
                let step = match handshake.client_hello(&self.config.client_hello) {
                    Ok(hello) => Step::Submit(Transfer::bulk_out(EP_OUT, hello, USB_TIMEOUT)),
                    Err(e) => Step::Abort(e.into()),
                };
                self.handshake = Some(handshake);
                step
            }
            Some(HandshakeState::ServerHello | HandshakeState::Finished) => Self::read_reply(),
            Some(HandshakeState::Certificate) => {
                let (Some(handshake), Some(keys)) = (&mut self.handshake, &self.device_keys)
                else {
                    return Step::Abort(TlsError::State("certificate without device keys").into());
                };
                match handshake.certificate(&self.config.certificate, keys) {
                    Ok((cert, key_block)) => {
                        self.pending_keys = Some(key_block);
                        Step::Submit(Transfer::bulk_out(EP_OUT, cert, USB_TIMEOUT))
                    }
                    Err(e) => Step::Abort(e.into()),
                }
            }
            None => Step::Abort(FpError::protocol("bad handshake state")),
        }
    }

    fn handshake_done(&mut self, ssm: &Ssm, completion: &Completion) -> Step {
        match ssm.state::<HandshakeState>() {
            Some(HandshakeState::ServerHello) => {
                if let Err(e) = completion.check_status() {
                    return Step::Abort(e);
                }
                let Some(handshake) = &mut self.handshake else {
                    return Step::Abort(TlsError::State("ServerHello before ClientHello").into());
                };
                Step::from_result(handshake.server_hello(&completion.data).map_err(Into::into))
            }
            Some(HandshakeState::Finished) => {
                if let Err(e) = completion.check_status() {
                    return Step::Abort(e);
                }
                if completion.data.is_empty() {
                    return Step::Abort(FpError::protocol("empty reply to Finished"));
                }
                let Some(key_block) = self.pending_keys.take() else {
                    return Step::Abort(TlsError::State("Finished before Certificate").into());
                };
                self.channel = Some(RecordCipher::client(&key_block));
                self.handshake = None;
                info!("Secure channel established");
                Step::Next
            }
            _ => Step::from_result(completion.check_full().map(|_| ())),
        }
    }

    // Scan loop

    fn scan_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.state::<ScanState>() {
            Some(ScanState::LedOn) => {
                self.image.clear();
                self.chunks = 0;
                self.scan_ok = false;
                self.send_sealed(&self.config.led_green_on)
            }
            Some(ScanState::ScanMatrix) => self.send_sealed(&self.config.scan_matrix),
            Some(ScanState::AwaitInterrupt) => {
                Step::Submit(Transfer::interrupt_in(EP_INTERRUPT, INTERRUPT_LEN, 0))
            }
            Some(ScanState::ReadImage) => self.send_sealed(&CMD_READ_IMAGE),
            Some(ScanState::EndScan) => self.send_sealed(&CMD_END_SCAN),
            Some(ScanState::ResetScan) => self.send_sealed(&CMD_RESET_SCAN),
            Some(ScanState::SubmitImage) => {
                self.submit_image(host);
                Step::Next
            }
            Some(ScanState::LedResult) => {
                let led = if self.scan_ok {
                    &self.config.led_green_blink
                } else {
                    &self.config.led_red_blink
                };
                self.send_sealed(led)
            }
            Some(ScanState::LedWait) => Step::sleep_ms(LED_WAIT_MS),
            Some(
                ScanState::LedOnReply
                | ScanState::ScanMatrixReply
                | ScanState::ReadImageReply
                | ScanState::EndScanReply
                | ScanState::ResetScanReply
                | ScanState::LedResultReply,
            ) => Self::read_reply(),
            None => Step::Abort(FpError::protocol("bad scan state")),
        }
    }

    fn scan_done(&mut self, ssm: &Ssm, completion: &Completion, host: &mut Host) -> Step {
        let Some(state) = ssm.state::<ScanState>() else {
            return Step::Abort(FpError::protocol("bad scan state"));
        };
        match state {
            ScanState::AwaitInterrupt => self.interrupt_done(completion, host),
            ScanState::ReadImageReply => match self.open_sealed(completion) {
                Ok(chunk) => self.image_chunk(&chunk),
                Err(e) => Step::Abort(e),
            },
            ScanState::ScanMatrixReply => {
                if let Err(e) = self.open_sealed(completion) {
                    return Step::Abort(e);
                }
                if host.state() == AcquireState::Activating {
                    host.activate_complete(Ok(()));
                }
                Step::Next
            }
            ScanState::LedOnReply
            | ScanState::EndScanReply
            | ScanState::ResetScanReply
            | ScanState::LedResultReply => {
                Step::from_result(self.open_sealed(completion).map(|_| ()))
            }
            _ => Step::from_result(completion.check_full().map(|_| ())),
        }
    }

    fn interrupt_done(&mut self, completion: &Completion, host: &mut Host) -> Step {
        if let Err(e) = completion.check_status() {
            return Step::Abort(e);
        }
        let status = scan_status(&completion.data);
        debug!(?status, "Scan interrupt");
        match status {
            ScanStatus::FingerDown => {
                host.report_finger_status(true);
                Step::jump(ScanState::AwaitInterrupt)
            }
            ScanStatus::Success => {
                host.report_finger_status(true);
                Step::Next
            }
            ScanStatus::Failed(reason) => {
                info!(%reason, "Scan failed");
                host.abort_scan(reason);
                Step::jump(ScanState::LedResult)
            }
            ScanStatus::Unknown => {
                warn!(interrupt = ?completion.data, "Unknown scan interrupt");
                Step::jump(ScanState::AwaitInterrupt)
            }
            ScanStatus::WaitingFinger | ScanStatus::Scanning | ScanStatus::ScanComplete => {
                Step::jump(ScanState::AwaitInterrupt)
            }
        }
    }

    fn image_chunk(&mut self, chunk: &[u8]) -> Step {
        let header = if self.chunks == 0 {
            FIRST_CHUNK_HEADER
        } else {
            NEXT_CHUNK_HEADER
        };
        if chunk.len() < header {
            return Step::Abort(FpError::protocol(format!(
                "image chunk {} is {} bytes",
                self.chunks,
                chunk.len()
            )));
        }
        self.image.extend_from_slice(&chunk[header..]);
        self.chunks += 1;
        if self.chunks < IMAGE_CHUNKS {
            Step::jump(ScanState::ReadImage)
        } else {
            Step::Next
        }
    }

    fn submit_image(&mut self, host: &mut Host) {
        if self.image.len() < IMAGE_SIZE {
            warn!(len = self.image.len(), "Image incomplete");
            host.abort_scan(ScanRetry::Retry);
            return;
        }
        let mut data = std::mem::take(&mut self.image);
        data.truncate(IMAGE_SIZE);
        self.scan_ok = true;
        host.image_captured(Image::from_data(IMAGE_WIDTH, IMAGE_HEIGHT, data));
    }
}

impl ImageDriver for Vfs0090 {
    fn info(&self) -> &'static DriverInfo {
        &INFO
    }

    fn open(&mut self, _host: &mut Host) -> Result<Option<Ssm>, FpError> {
        self.forget_secrets();
        Ok(Some(Ssm::for_states::<OpenState>(Phase::Open)))
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        if self.channel.is_none() {
            return Err(FpError::protocol("secure channel not established"));
        }
        Ok(Ssm::for_states::<ScanState>(Phase::Capture))
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Open => self.open_state(ssm),
            Phase::Init => self.init_state(ssm),
            Phase::Handshake => self.handshake_state(ssm),
            Phase::Capture => self.scan_state(ssm, host),
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::Init => self.init_done(ssm, &completion),
            Phase::Handshake => self.handshake_done(ssm, &completion),
            Phase::Capture => self.scan_done(ssm, &completion, host),
            _ => Step::from_result(completion.check_status()),
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let result = ssm.into_result();

        if phase == Phase::Open {
            // Only the record keys outlive the handshake
            self.provision = Zeroizing::new(Vec::new());
            self.device_keys = None;
            if let Err(e) = &result {
                warn!(error = %e, "Secure channel setup failed");
                self.forget_secrets();
            }
            host.open_complete(result);
            return None;
        }
        if host.is_deactivating() {
            debug!("Scan loop stopped");
            self.image.clear();
            return None;
        }
        match result {
            Ok(()) => {
                host.report_finger_status(false);
                Some(Ssm::for_states::<ScanState>(Phase::Capture))
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

    fn close(&mut self, _host: &mut Host) {
        self.forget_secrets();
    }
}
