//! Host side of the sensor handshake.
//!
//! The sensor only accepts byte-exact ClientHello and Certificate
//! messages, so both are vendor templates patched at fixed offsets. The
//! transcript hash covers the handshake bodies without record headers.

use std::time::{SystemTime, UNIX_EPOCH};

use p256::ecdsa::signature::hazmat::RandomizedPrehashSigner;
use p256::ecdsa::{DerSignature, Signature};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{SecretKey, ecdh};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use zeroize::Zeroizing;

use super::keys::{DEVICE_CERT_LEN, DeviceKeys, KeyBlock};
use super::prf::tls_prf;
use super::record::{CONTENT_HANDSHAKE, IV_LEN, RecordCipher};
use super::{TlsError, require_len};

pub const RANDOM_LEN: usize = 0x20;
pub const MASTER_SECRET_LEN: usize = 0x30;
pub const VERIFY_DATA_LEN: usize = 0x0c;

const CLIENT_RANDOM_OFFSET: usize = 0x0f;
const CLIENT_HELLO_BODY: std::ops::Range<usize> = 0x09..0x4c;
pub const CLIENT_HELLO_MIN_LEN: usize = CLIENT_HELLO_BODY.end;

const SERVER_RANDOM_OFFSET: usize = 0x0b;
const SERVER_HELLO_BODY: std::ops::Range<usize> = 0x05..0x42;

const CERT_DEVICE_OFFSET: usize = 0x15;
const CERT_HOST_KEY_OFFSET: usize = 0xd2;
const CERT_BODY: std::ops::Range<usize> = 0x09..0x112;
const CERT_SIGNATURE_OFFSET: usize = 0x116;
const CERT_VERIFY_BODY: std::ops::Range<usize> = 0x112..0x15e;
const CERT_FINISHED_OFFSET: usize = 0x169;
const FINISHED_BODY_LEN: usize = 0x50;
pub const CERTIFICATE_MIN_LEN: usize = CERT_FINISHED_OFFSET + FINISHED_BODY_LEN;

const SIGNATURE_LEN: usize = 0x48;
/// A DER signature is 0x48 bytes only when both r and s have their top
/// bit set.
const SIGN_ATTEMPTS: usize = 64;

const FINISHED_HEADER: [u8; 4] = [0x14, 0x00, 0x00, VERIFY_DATA_LEN as u8];

/// 4 bytes of big-endian time followed by 28 random bytes.
pub fn client_random() -> [u8; RANDOM_LEN] {
    let mut random = [0u8; RANDOM_LEN];
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default();
    random[..4].copy_from_slice(&now.to_be_bytes());
    rand::thread_rng().fill_bytes(&mut random[4..]);
    random
}

/// Handshake progress. Secrets are wiped when it is dropped.
pub struct Handshake {
    transcript: Sha256,
    host_key: SecretKey,
    client_random: [u8; RANDOM_LEN],
    server_random: Option<[u8; RANDOM_LEN]>,
    master_secret: Option<Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("server_hello", &self.server_random.is_some())
            .field("keys", &self.master_secret.is_some())
            .finish_non_exhaustive()
    }
}

impl Handshake {
    /// `host_key` is the ECDH key whose public half goes into the
    /// Certificate message.
    pub fn new(host_key: SecretKey, client_random: [u8; RANDOM_LEN]) -> Self {
        Self {
            transcript: Sha256::new(),
            host_key,
            client_random,
            server_random: None,
            master_secret: None,
        }
    }

    pub fn client_random(&self) -> &[u8; RANDOM_LEN] {
        &self.client_random
    }

    pub fn server_random(&self) -> Option<&[u8; RANDOM_LEN]> {
        self.server_random.as_ref()
    }

    pub fn master_secret(&self) -> Option<&[u8]> {
        self.master_secret.as_deref().map(Vec::as_slice)
    }

    /// Patch the client random into the template.
    pub fn client_hello(&mut self, template: &[u8]) -> Result<Vec<u8>, TlsError> {
        require_len(template, CLIENT_HELLO_MIN_LEN)?;
        let mut hello = template.to_vec();
        hello[CLIENT_RANDOM_OFFSET..CLIENT_RANDOM_OFFSET + RANDOM_LEN]
            .copy_from_slice(&self.client_random);
        self.transcript.update(&hello[CLIENT_HELLO_BODY]);
        Ok(hello)
    }

    pub fn server_hello(&mut self, reply: &[u8]) -> Result<(), TlsError> {
        require_len(reply, SERVER_HELLO_BODY.end)?;
        if reply[0] != CONTENT_HANDSHAKE {
            return Err(TlsError::RecordType(reply[0]));
        }
        let mut random = [0u8; RANDOM_LEN];
        random.copy_from_slice(&reply[SERVER_RANDOM_OFFSET..SERVER_RANDOM_OFFSET + RANDOM_LEN]);
        trace!(server_random = ?random, "ServerHello");
        self.server_random = Some(random);
        self.transcript.update(&reply[SERVER_HELLO_BODY]);
        Ok(())
    }

    /// Derive the session keys and build the Certificate message:
    /// device certificate, host public key, the signature over the
    /// transcript and the encrypted Finished.
    pub fn certificate(
        &mut self,
        template: &[u8],
        keys: &DeviceKeys,
    ) -> Result<(Vec<u8>, KeyBlock), TlsError> {
        let server_random = self
            .server_random
            .ok_or(TlsError::State("certificate before ServerHello"))?;
        require_len(template, CERTIFICATE_MIN_LEN)?;
        if keys.certificate.len() != DEVICE_CERT_LEN {
            return Err(TlsError::Key(format!(
                "device certificate is {} bytes",
                keys.certificate.len()
            )));
        }

        let shared = ecdh::diffie_hellman(
            self.host_key.to_nonzero_scalar(),
            keys.device_public.as_affine(),
        );
        let seed = [self.client_random, server_random].concat();
        let master_secret = tls_prf(
            shared.raw_secret_bytes(),
            "master secret",
            &seed,
            MASTER_SECRET_LEN,
        )?;
        let key_block = KeyBlock::derive(&master_secret, &server_random, &self.client_random)?;
        debug!("Session keys derived");

        let mut cert = template.to_vec();
        cert[CERT_DEVICE_OFFSET..CERT_DEVICE_OFFSET + DEVICE_CERT_LEN]
            .copy_from_slice(&keys.certificate);
        let host_public = self.host_key.public_key().to_encoded_point(false);
        cert[CERT_HOST_KEY_OFFSET..CERT_HOST_KEY_OFFSET + 0x40]
            .copy_from_slice(&host_public.as_bytes()[1..]);
        self.transcript.update(&cert[CERT_BODY]);

        let digest = self.transcript.clone().finalize();
        let signature = sign_transcript(keys, &digest)?;
        cert[CERT_SIGNATURE_OFFSET..CERT_SIGNATURE_OFFSET + SIGNATURE_LEN]
            .copy_from_slice(signature.as_bytes());
        self.transcript.update(&cert[CERT_VERIFY_BODY]);

        let handshake_hash = self.transcript.clone().finalize();
        let verify_data = tls_prf(
            &master_secret,
            "client finished",
            &handshake_hash,
            VERIFY_DATA_LEN,
        )?;
        let mut finished = Vec::with_capacity(FINISHED_HEADER.len() + VERIFY_DATA_LEN);
        finished.extend_from_slice(&FINISHED_HEADER);
        finished.extend_from_slice(&verify_data);

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let body =
            RecordCipher::client(&key_block).seal_body(CONTENT_HANDSHAKE, &finished, &iv)?;
        cert[CERT_FINISHED_OFFSET..CERT_FINISHED_OFFSET + FINISHED_BODY_LEN]
            .copy_from_slice(&body);

        self.master_secret = Some(master_secret);
        Ok((cert, key_block))
    }
}

fn sign_transcript(keys: &DeviceKeys, digest: &[u8]) -> Result<DerSignature, TlsError> {
    let mut rng = rand::thread_rng();
    for attempt in 0..SIGN_ATTEMPTS {
        let signature: Signature = keys
            .signing_key
            .sign_prehash_with_rng(&mut rng, digest)
            .map_err(|e| TlsError::Signature(e.to_string()))?;
        let der = signature.to_der();
        if der.as_bytes().len() == SIGNATURE_LEN {
            trace!(attempt, "Transcript signed");
            return Ok(der);
        }
    }
    Err(TlsError::Signature(format!(
        "no {SIGNATURE_LEN}-byte signature in {SIGN_ATTEMPTS} attempts"
    )))
}
