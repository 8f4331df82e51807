//! TLS 1.2-like secure channel spoken by the Validity VFS0090.
//!
//! The sensor runs a cut-down TLS handshake over its bulk endpoints:
//! fixed ClientHello and Certificate templates, ECDH on P-256 with the
//! device key recovered from its provisioning data, then MAC-then-encrypt
//! AES-256-CBC records for every later command.
//!
//! - [`constants`]: fixed host key the sensors are paired with
//! - [`prf`]: TLS 1.2 PRF over HMAC-SHA256
//! - [`keys`]: seed derivation, device key recovery and the key block
//! - [`record`]: record sealing and opening
//! - [`handshake`]: ClientHello, ServerHello, Certificate and Finished

pub mod constants;
pub mod handshake;
pub mod keys;
pub mod prf;
pub mod record;

use thiserror::Error;

use crate::error::FpError;

pub use handshake::Handshake;
pub use keys::{DeviceKeys, KeyBlock};
pub use prf::tls_prf;
pub use record::RecordCipher;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TlsError {
    #[error("Message too short: {actual} bytes, need {needed}")]
    Truncated { needed: usize, actual: usize },

    #[error("Unexpected record type {0:#04x}")]
    RecordType(u8),

    #[error("Ciphertext is not block aligned")]
    Alignment,

    #[error("Bad record padding")]
    Padding,

    #[error("Record MAC mismatch")]
    Mac,

    #[error("No host seed decrypts the device key")]
    KeyRecovery,

    #[error("Invalid key material: {0}")]
    Key(String),

    #[error("Handshake out of order: {0}")]
    State(&'static str),

    #[error("Signing failed: {0}")]
    Signature(String),
}

impl From<TlsError> for FpError {
    fn from(err: TlsError) -> Self {
        match err {
            TlsError::Padding | TlsError::Mac | TlsError::KeyRecovery => {
                FpError::Integrity(err.to_string())
            }
            other => FpError::Protocol(other.to_string()),
        }
    }
}

pub(crate) fn require_len(data: &[u8], needed: usize) -> Result<(), TlsError> {
    if data.len() < needed {
        return Err(TlsError::Truncated {
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}
