//! MAC-then-encrypt record layer.
//!
//! A sealed record is `type || 03 03 || length || IV || ciphertext`, where
//! the ciphertext covers `plaintext || HMAC-SHA256 || padding`. The MAC is
//! taken over the 5-byte header of the plaintext followed by the
//! plaintext. Padding is TLS-style: `n + 1` bytes of value `n`.

use aes::Aes256;
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use tracing::trace;
use zeroize::Zeroizing;

use super::keys::KeyBlock;
use super::prf::{HASH_LEN, hmac_sha256, hmac_verify};
use super::{TlsError, require_len};

pub const HEADER_LEN: usize = 5;
pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const VERSION: [u8; 2] = [0x03, 0x03];

pub const CONTENT_HANDSHAKE: u8 = 0x16;
pub const CONTENT_APPLICATION: u8 = 0x17;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Encrypt a block-aligned buffer in place.
pub(crate) fn cbc_encrypt(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), TlsError> {
    let len = buf.len();
    Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| TlsError::Key("AES-256 key or IV length".into()))?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| TlsError::Alignment)?;
    Ok(())
}

/// Decrypt a block-aligned buffer in place.
pub(crate) fn cbc_decrypt(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), TlsError> {
    Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| TlsError::Key("AES-256 key or IV length".into()))?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| TlsError::Alignment)?;
    Ok(())
}

fn header(content_type: u8, len: usize) -> Result<[u8; HEADER_LEN], TlsError> {
    let len = u16::try_from(len).map_err(|_| TlsError::Key(format!("record of {len} bytes")))?;
    let [hi, lo] = len.to_be_bytes();
    Ok([content_type, VERSION[0], VERSION[1], hi, lo])
}

/// One direction pair of record keys.
pub struct RecordCipher {
    write_mac: Zeroizing<Vec<u8>>,
    write_key: Zeroizing<Vec<u8>>,
    read_mac: Zeroizing<Vec<u8>>,
    read_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for RecordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCipher").finish_non_exhaustive()
    }
}

impl RecordCipher {
    /// Host side: writes with the client keys, reads with the server keys.
    pub fn client(keys: &KeyBlock) -> Self {
        Self {
            write_mac: Zeroizing::new(keys.client_mac_key().to_vec()),
            write_key: Zeroizing::new(keys.client_write_key().to_vec()),
            read_mac: Zeroizing::new(keys.server_mac_key().to_vec()),
            read_key: Zeroizing::new(keys.server_write_key().to_vec()),
        }
    }

    /// Sensor side of the same key block.
    pub fn server(keys: &KeyBlock) -> Self {
        Self {
            write_mac: Zeroizing::new(keys.server_mac_key().to_vec()),
            write_key: Zeroizing::new(keys.server_write_key().to_vec()),
            read_mac: Zeroizing::new(keys.client_mac_key().to_vec()),
            read_key: Zeroizing::new(keys.client_write_key().to_vec()),
        }
    }

    /// `IV || ciphertext` of one record, without the outer header.
    pub fn seal_body(
        &self,
        content_type: u8,
        plaintext: &[u8],
        iv: &[u8; IV_LEN],
    ) -> Result<Vec<u8>, TlsError> {
        let head = header(content_type, plaintext.len())?;
        let mac = hmac_sha256(&self.write_mac, &[&head, plaintext])?;

        let mut buf = Zeroizing::new(Vec::with_capacity(
            plaintext.len() + HASH_LEN + BLOCK_LEN,
        ));
        buf.extend_from_slice(plaintext);
        buf.extend_from_slice(&mac);
        let len = buf.len();
        let pad = BLOCK_LEN - len % BLOCK_LEN;
        buf.resize(len + pad, (pad - 1) as u8);
        cbc_encrypt(&self.write_key, iv, &mut buf)?;

        let mut body = Vec::with_capacity(IV_LEN + buf.len());
        body.extend_from_slice(iv);
        body.extend_from_slice(&buf);
        Ok(body)
    }

    /// Complete record under a fresh random IV.
    pub fn seal(&self, content_type: u8, plaintext: &[u8]) -> Result<Vec<u8>, TlsError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let body = self.seal_body(content_type, plaintext, &iv)?;

        let mut record = Vec::with_capacity(HEADER_LEN + body.len());
        record.extend_from_slice(&header(content_type, body.len())?);
        record.extend_from_slice(&body);
        trace!(
            content_type,
            plain = plaintext.len(),
            sealed = record.len(),
            "Sealed record"
        );
        Ok(record)
    }

    /// Decrypt and authenticate one record, returning its type and plaintext.
    pub fn open(&self, record: &[u8]) -> Result<(u8, Zeroizing<Vec<u8>>), TlsError> {
        require_len(record, HEADER_LEN + IV_LEN + HASH_LEN + BLOCK_LEN)?;
        let content_type = record[0];
        let (iv, ciphertext) = record[HEADER_LEN..].split_at(IV_LEN);
        if ciphertext.len() % BLOCK_LEN != 0 {
            return Err(TlsError::Alignment);
        }

        let mut buf = Zeroizing::new(ciphertext.to_vec());
        cbc_decrypt(&self.read_key, iv, &mut buf)?;

        let pad = usize::from(buf[buf.len() - 1]) + 1;
        if pad + HASH_LEN > buf.len()
            || buf[buf.len() - pad..]
                .iter()
                .any(|&b| usize::from(b) + 1 != pad)
        {
            return Err(TlsError::Padding);
        }
        let plain_len = buf.len() - pad - HASH_LEN;
        let (plain, rest) = buf.split_at(plain_len);
        hmac_verify(
            &self.read_mac,
            &[&header(content_type, plain_len)?, plain],
            &rest[..HASH_LEN],
        )?;

        trace!(content_type, plain = plain_len, "Opened record");
        Ok((content_type, Zeroizing::new(plain.to_vec())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::prf::tls_prf;

    fn key_block() -> KeyBlock {
        KeyBlock::derive(&[0x42; 0x30], &[1; 32], &[2; 32]).unwrap()
    }

    #[test]
    fn test_sealed_record_layout() {
        let keys = key_block();
        let host = RecordCipher::client(&keys);
        let record = host.seal(CONTENT_APPLICATION, &[0x39, 0x20, 0xbf, 0x02]).unwrap();

        // 4 bytes data + 32 MAC + 12 padding, one IV
        assert_eq!(record.len(), HEADER_LEN + IV_LEN + 48);
        assert_eq!(&record[..5], &[0x17, 0x03, 0x03, 0x00, 0x40]);
    }

    #[test]
    fn test_sensor_opens_host_record() {
        let keys = key_block();
        let host = RecordCipher::client(&keys);
        let sensor = RecordCipher::server(&keys);

        let plain: Vec<u8> = (0..100u8).collect();
        let record = host.seal(CONTENT_APPLICATION, &plain).unwrap();
        let (content_type, opened) = sensor.open(&record).unwrap();
        assert_eq!(content_type, CONTENT_APPLICATION);
        assert_eq!(&opened[..], &plain[..]);

        // Host cannot read its own records
        assert!(host.open(&record).is_err());
    }

    #[test]
    fn test_full_block_of_padding() {
        let keys = key_block();
        let iv = [9u8; IV_LEN];
        let body = RecordCipher::client(&keys)
            .seal_body(
                CONTENT_HANDSHAKE,
                &[0x14, 0, 0, 0x0c, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
                &iv,
            )
            .unwrap();
        // 16 bytes data + 32 MAC leave an aligned buffer, so a whole block pads
        assert_eq!(body.len(), 0x50);
        assert_eq!(&body[..IV_LEN], &iv);

        let mut plain = body[IV_LEN..].to_vec();
        cbc_decrypt(keys.client_write_key(), &iv, &mut plain).unwrap();
        assert_eq!(&plain[plain.len() - 16..], &[15u8; 16]);
    }

    #[test]
    fn test_tampered_record_is_rejected() {
        let keys = key_block();
        let sensor = RecordCipher::server(&keys);
        let host = RecordCipher::client(&keys);

        let mut record = sensor.seal(CONTENT_APPLICATION, b"status").unwrap();
        let last = record.len() - 20;
        record[last] ^= 0x01;
        assert!(matches!(
            host.open(&record),
            Err(TlsError::Mac | TlsError::Padding)
        ));

        let record = sensor.seal(CONTENT_APPLICATION, &[0u8; 40]).unwrap();
        assert!(matches!(
            host.open(&record[..record.len() - 1]),
            Err(TlsError::Alignment)
        ));
        assert!(matches!(
            host.open(&record[..20]),
            Err(TlsError::Truncated { .. })
        ));
    }

    #[test]
    fn test_mac_covers_header() {
        let keys = key_block();
        let sensor = RecordCipher::server(&keys);
        let host = RecordCipher::client(&keys);

        let mut record = sensor.seal(CONTENT_APPLICATION, b"status").unwrap();
        record[0] = CONTENT_HANDSHAKE;
        assert_eq!(host.open(&record).err(), Some(TlsError::Mac));
    }

    #[test]
    fn test_keys_come_from_key_block() {
        let keys = key_block();
        let seed = [[1u8; 32], [2u8; 32]].concat();
        let raw = tls_prf(&[0x42; 0x30], "key expansion", &seed, 0x120).unwrap();
        assert_eq!(keys.client_mac_key(), &raw[..0x20]);
        assert_eq!(keys.client_write_key(), &raw[0x40..0x60]);
        assert_eq!(keys.server_write_key(), &raw[0x60..0x80]);
    }
}
