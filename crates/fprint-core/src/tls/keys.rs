//! Key material for the secure channel.
//!
//! Each sensor is provisioned with an ECDSA key pair. The private half is
//! stored encrypted under a master key derived from a vendor pre-key and a
//! seed naming the host machine, so only the machine that paired the
//! sensor can recover it.

use std::fmt;

use p256::PublicKey;
use p256::ecdsa::SigningKey;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::prf::tls_prf;
use super::record::{IV_LEN, cbc_decrypt};
use super::{TlsError, require_len};

pub const PRE_KEY_LEN: usize = 0x20;
pub const KEY_BLOCK_LEN: usize = 0x120;
pub const DEVICE_CERT_LEN: usize = 0xb8;
const MASTER_KEY_LEN: usize = 0x20;
const COORD_LEN: usize = 0x20;

/// The provisioning reply must reach past the device public key.
pub const PROVISION_MIN_LEN: usize = 0x681;
const KEY_BLOB_OFFSET: usize = 0x52;
const KEY_BLOB_LEN: usize = 0x70;
const DEVICE_CERT_OFFSET: usize = 0x116;
const DEVICE_X_OFFSET: usize = 0x60a;
const DEVICE_Y_OFFSET: usize = 0x64e;

/// Host seed from the DMI product name and serial, each NUL-terminated.
pub fn host_seed(product_name: &str, product_serial: &str) -> Vec<u8> {
    let mut seed = Vec::with_capacity(product_name.len() + product_serial.len() + 2);
    seed.extend_from_slice(product_name.as_bytes());
    seed.push(0);
    seed.extend_from_slice(product_serial.as_bytes());
    seed.push(0);
    seed
}

/// `TLS_PRF(pre_key, "GWK", seed)`, the key wrapping the device's private key.
pub fn master_key(pre_key: &[u8], seed: &[u8]) -> Result<Zeroizing<Vec<u8>>, TlsError> {
    tls_prf(pre_key, "GWK", seed, MASTER_KEY_LEN)
}

fn padding_ok(plain: &[u8]) -> bool {
    let Some(&last) = plain.last() else {
        return false;
    };
    let pad = usize::from(last);
    (1..=IV_LEN).contains(&pad)
        && plain.len() == 3 * COORD_LEN + pad
        && plain[plain.len() - pad..]
            .iter()
            .all(|&b| usize::from(b) == pad)
}

/// IV then `x || y || d`, little endian, then padding. `None` when the
/// padding shows the master key is wrong.
///
/// The padding must fill the blob exactly past the three coordinates.
fn decrypt_key_blob(master: &[u8], blob: &[u8]) -> Result<Option<Zeroizing<Vec<u8>>>, TlsError> {
    let (iv, ciphertext) = blob.split_at(IV_LEN);
    let mut plain = Zeroizing::new(ciphertext.to_vec());
    cbc_decrypt(master, iv, &mut plain)?;
    Ok(padding_ok(&plain).then_some(plain))
}

fn reversed(bytes: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(bytes.iter().rev().copied().collect())
}

/// Keys recovered from the sensor's provisioning reply.
pub struct DeviceKeys {
    /// Signs the certificate verify step.
    pub signing_key: SigningKey,
    /// ECDH peer for the pre-master secret.
    pub device_public: PublicKey,
    /// Device certificate, embedded in the host's Certificate message.
    pub certificate: Vec<u8>,
}

impl fmt::Debug for DeviceKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKeys")
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

impl DeviceKeys {
    /// Try each host seed in turn until one decrypts the private key.
    pub fn recover(provision: &[u8], pre_key: &[u8], seeds: &[Vec<u8>]) -> Result<Self, TlsError> {
        require_len(provision, PROVISION_MIN_LEN)?;
        if pre_key.len() != PRE_KEY_LEN {
            return Err(TlsError::Key(format!(
                "pre-key is {} bytes, need {}",
                pre_key.len(),
                PRE_KEY_LEN
            )));
        }

        let blob = &provision[KEY_BLOB_OFFSET..KEY_BLOB_OFFSET + IV_LEN + KEY_BLOB_LEN];
        let mut private = None;
        for (index, seed) in seeds.iter().enumerate() {
            let master = master_key(pre_key, seed)?;
            if let Some(plain) = decrypt_key_blob(&master, blob)? {
                debug!(seed = index, "Device key decrypted");
                private = Some(reversed(&plain[2 * COORD_LEN..3 * COORD_LEN]));
                break;
            }
            warn!(seed = index, "Host seed does not unlock the device key");
        }
        let private = private.ok_or(TlsError::KeyRecovery)?;
        let signing_key = SigningKey::from_slice(&private)
            .map_err(|e| TlsError::Key(format!("device signing key: {e}")))?;

        let mut sec1 = Vec::with_capacity(1 + 2 * COORD_LEN);
        sec1.push(0x04);
        sec1.extend(provision[DEVICE_X_OFFSET..DEVICE_X_OFFSET + COORD_LEN].iter().rev());
        sec1.extend(provision[DEVICE_Y_OFFSET..DEVICE_Y_OFFSET + COORD_LEN].iter().rev());
        let device_public = PublicKey::from_sec1_bytes(&sec1)
            .map_err(|e| TlsError::Key(format!("device public key: {e}")))?;

        Ok(Self {
            signing_key,
            device_public,
            certificate: provision[DEVICE_CERT_OFFSET..DEVICE_CERT_OFFSET + DEVICE_CERT_LEN]
                .to_vec(),
        })
    }
}

/// Session key block: MAC keys at 0x00 and 0x20, write keys at 0x40 and
/// 0x60, remaining bytes unused.
pub struct KeyBlock(Zeroizing<Vec<u8>>);

impl fmt::Debug for KeyBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyBlock(..)")
    }
}

impl KeyBlock {
    /// `TLS_PRF(master_secret, "key expansion", server_random || client_random)`.
    pub fn derive(
        master_secret: &[u8],
        server_random: &[u8],
        client_random: &[u8],
    ) -> Result<Self, TlsError> {
        let seed = [server_random, client_random].concat();
        Ok(Self(tls_prf(
            master_secret,
            "key expansion",
            &seed,
            KEY_BLOCK_LEN,
        )?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn client_mac_key(&self) -> &[u8] {
        &self.0[0x00..0x20]
    }

    pub fn server_mac_key(&self) -> &[u8] {
        &self.0[0x20..0x40]
    }

    pub fn client_write_key(&self) -> &[u8] {
        &self.0[0x40..0x60]
    }

    pub fn server_write_key(&self) -> &[u8] {
        &self.0[0x60..0x80]
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    use super::*;
    use crate::tls::record::cbc_encrypt;

    /// Provisioning reply as a paired sensor sends it.
    pub(crate) fn provision_reply(
        pre_key: &[u8],
        seed: &[u8],
        signing: &SigningKey,
        device_public: &PublicKey,
    ) -> Vec<u8> {
        let mut reply = vec![0u8; PROVISION_MIN_LEN + 0x1f];

        let verifying = signing.verifying_key().to_encoded_point(false);
        let mut plain = Vec::new();
        plain.extend(verifying.x().unwrap().iter().rev());
        plain.extend(verifying.y().unwrap().iter().rev());
        plain.extend(signing.to_bytes().iter().rev());
        plain.extend([0x10u8; 16]);
        let iv = [0x5a; IV_LEN];
        cbc_encrypt(&master_key(pre_key, seed).unwrap(), &iv, &mut plain).unwrap();
        reply[KEY_BLOB_OFFSET..KEY_BLOB_OFFSET + IV_LEN].copy_from_slice(&iv);
        reply[KEY_BLOB_OFFSET + IV_LEN..KEY_BLOB_OFFSET + IV_LEN + KEY_BLOB_LEN]
            .copy_from_slice(&plain);

        for (i, b) in reply[DEVICE_CERT_OFFSET..DEVICE_CERT_OFFSET + DEVICE_CERT_LEN]
            .iter_mut()
            .enumerate()
        {
            *b = i as u8;
        }

        let point = device_public.to_encoded_point(false);
        let x: Vec<u8> = point.x().unwrap().iter().rev().copied().collect();
        let y: Vec<u8> = point.y().unwrap().iter().rev().copied().collect();
        reply[DEVICE_X_OFFSET..DEVICE_X_OFFSET + COORD_LEN].copy_from_slice(&x);
        reply[DEVICE_Y_OFFSET..DEVICE_Y_OFFSET + COORD_LEN].copy_from_slice(&y);
        reply
    }
}
