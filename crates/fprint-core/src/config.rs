//! Driver configuration.
//!
//! Numeric tunables default to the values the drivers were tuned with.
//! Vendor byte scripts that cannot be derived from the protocol are empty by
//! default and must be supplied before the matching family can be opened.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::FpError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl From<ConfigError> for FpError {
    fn from(err: ConfigError) -> Self {
        FpError::Config(err.to_string())
    }
}

/// AES1610 capture limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Aes1610Config {
    /// Histogram sum above which a finger is present.
    pub finger_threshold: u32,
    /// Consecutive blank strips that end a swipe.
    pub max_blank_strips: u32,
    pub max_frames: usize,
}

impl Default for Aes1610Config {
    fn default() -> Self {
        Self {
            finger_threshold: 20,
            max_blank_strips: 10,
            max_frames: 350,
        }
    }
}

/// Vendor init scripts of the AES1660 and AES2660.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AesX660Config {
    pub init_1: Vec<Vec<u8>>,
    pub init_2: Vec<Vec<u8>>,
    pub start_imaging_cmd: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElanConfig {
    /// Shorter swipes are reported as too short.
    pub min_frames: usize,
    pub max_frames: usize,
    /// Frames dropped from the end, taken while the finger lifts.
    pub skip_last_frames: usize,
}

impl Default for ElanConfig {
    fn default() -> Self {
        Self {
            min_frames: 7,
            max_frames: 30,
            skip_last_frames: 1,
        }
    }
}

/// VFS301 vendor fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vfs301Config {
    pub init_06: Vec<Vec<u8>>,
    pub init_02d0: Vec<Vec<u8>>,
    pub init_0220: Vec<Vec<u8>>,
    pub msg_12: Vec<u8>,
    pub msg_24: Vec<u8>,
    /// Next-scan request, patched in place before sending.
    pub next_scan_template: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vfs5011Config {
    pub init: Vec<Vec<u8>>,
    pub prepare: Vec<Vec<u8>>,
    pub max_capture_lines: usize,
    pub max_recorded_lines: usize,
}

impl Default for Vfs5011Config {
    fn default() -> Self {
        Self {
            init: Vec::new(),
            prepare: Vec::new(),
            max_capture_lines: 100_000,
            max_recorded_lines: 2000,
        }
    }
}

/// VFS0050 control packets. Each state packet is 125 bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vfs0050Config {
    pub turn_on: Vec<u8>,
    pub turn_off: Vec<u8>,
    /// Sent back to back to re-arm the sensor after a swipe.
    pub next_receive_1: Vec<u8>,
    pub next_receive_2: Vec<u8>,
    /// Commit following every state packet.
    pub commit_out: Vec<u8>,
}

/// One UPEK TouchChip setup command and the reply it expects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupCmd {
    pub cmd: Vec<u8>,
    /// Bytes to read back; zero sends the next command at once.
    pub response_len: usize,
}

/// UPEK TouchChip (0483:2015) and Eikon Touch 300 (147e:3001) scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpekTcConfig {
    pub touchchip_setup: Vec<SetupCmd>,
    pub eikon_setup: Vec<SetupCmd>,
    pub scan_cmd: Vec<u8>,
}

/// UPEK TouchChip coprocessor requests. Sequence and CRC fields are
/// patched before sending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpekTcImgConfig {
    /// Four init requests; the last one starts the sequence counter.
    pub init: Vec<Vec<u8>>,
    pub init_capture: Vec<u8>,
    pub ack_00_28: Vec<u8>,
    pub ack_08: Vec<u8>,
    pub ack_frame: Vec<u8>,
    pub deinit: Vec<u8>,
}

/// `(register, value)` pairs written one control transfer each.
pub type RegScript = Vec<(u8, u8)>;

/// Register scripts of one UPEK TouchStrip sensor-only model. Scripts run
/// in order, interleaved with the register fixups the model needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SonlyScripts {
    pub init: Vec<RegScript>,
    pub await_finger: Vec<RegScript>,
    pub capture: Vec<RegScript>,
    pub deinit: RegScript,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpekSonlyConfig {
    pub model_2016: SonlyScripts,
    pub model_1000: SonlyScripts,
    pub model_1001: SonlyScripts,
}

/// VFS0090 pairing material and command blobs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vfs0090Config {
    /// Vendor pre-key wrapping the device private key.
    pub pre_key: Vec<u8>,
    /// Six init messages; the last reply carries the provisioning data.
    pub init: Vec<Vec<u8>>,
    pub client_hello: Vec<u8>,
    pub certificate: Vec<u8>,
    pub led_green_on: Vec<u8>,
    pub led_green_blink: Vec<u8>,
    pub led_red_blink: Vec<u8>,
    pub scan_matrix: Vec<u8>,
    /// `name\0serial\0` of the paired host. Empty reads DMI.
    pub host_seed: Vec<u8>,
    /// Host ECDH scalar override. Empty uses the pairing host key.
    pub host_key: Vec<u8>,
}

impl std::fmt::Debug for Vfs0090Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs0090Config")
            .field("init", &self.init.len())
            .field("host_seed", &String::from_utf8_lossy(&self.host_seed))
            .finish_non_exhaustive()
    }
}

/// Configuration for every driver family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub aes1610: Aes1610Config,
    pub aes1660: AesX660Config,
    pub aes2660: AesX660Config,
    pub elan: ElanConfig,
    pub vfs301: Vfs301Config,
    pub vfs5011: Vfs5011Config,
    pub vfs0050: Vfs0050Config,
    pub vfs0090: Vfs0090Config,
    pub upektc: UpekTcConfig,
    pub upektc_img: UpekTcImgConfig,
    pub upeksonly: UpekSonlyConfig,
}

impl DriverConfig {
    pub fn from_toml_str(content: &str) -> std::result::Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> std::result::Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Self::from_toml_str(&content)?)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml_string()?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_driver_constants() {
        let config = DriverConfig::default();
        assert_eq!(config.aes1610.max_frames, 350);
        assert_eq!(config.elan.min_frames, 7);
        assert_eq!(config.vfs5011.max_recorded_lines, 2000);
        assert!(config.vfs0090.pre_key.is_empty());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DriverConfig::from_toml_str(
            r#"
            [elan]
            max_frames = 40

            [aes1660]
            start_imaging_cmd = [0x13, 0x20]
            "#,
        )
        .unwrap();
        assert_eq!(config.elan.max_frames, 40);
        assert_eq!(config.elan.min_frames, 7);
        assert_eq!(config.aes1660.start_imaging_cmd, vec![0x13, 0x20]);
        assert_eq!(config.aes1610, Aes1610Config::default());
    }

    #[test]
    fn test_register_programs_from_toml() {
        let config = DriverConfig::from_toml_str(
            r#"
            [upeksonly.model_1000]
            init = [[[0x0c, 0x13], [0x0b, 0x01]]]
            deinit = [[0x0b, 0x00]]

            [[upektc.touchchip_setup]]
            cmd = [0x82, 0x05]
            response_len = 64
            "#,
        )
        .unwrap();
        let sonly = &config.upeksonly.model_1000;
        assert_eq!(sonly.init, vec![vec![(0x0c, 0x13), (0x0b, 0x01)]]);
        assert_eq!(sonly.deinit, vec![(0x0b, 0x00)]);
        assert!(sonly.capture.is_empty());
        assert_eq!(config.upektc.touchchip_setup[0].response_len, 64);
        assert!(config.upektc_img.init.is_empty());
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = DriverConfig::from_toml_str("[elan]\nmax_frames = \"many\"").unwrap_err();
        assert!(matches!(FpError::from(err), FpError::Config(_)));
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("fprint-config-{}.toml", std::process::id()));
        let mut config = DriverConfig::default();
        config.vfs0090.host_seed = b"Host\0SN\0".to_vec();
        config.vfs5011.init = vec![vec![1, 2], vec![3]];
        config.save_to_file(&path).unwrap();

        let loaded = DriverConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        assert!(DriverConfig::load_from_file("/nonexistent/fprint.toml").is_err());
    }

    #[test]
    fn test_secrets_not_in_debug() {
        let mut config = Vfs0090Config::default();
        config.pre_key = vec![0xab; 32];
        assert!(!format!("{:?}", config).contains("171"));
    }
}
