//! TLS 1.2 pseudo-random function.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use super::TlsError;

type HmacSha256 = Hmac<Sha256>;

pub const HASH_LEN: usize = 32;

fn keyed(key: &[u8]) -> Result<HmacSha256, TlsError> {
    HmacSha256::new_from_slice(key).map_err(|_| TlsError::Key("unusable HMAC key".into()))
}

/// HMAC-SHA256 of the concatenated `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; HASH_LEN], TlsError> {
    let mut mac = keyed(key)?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time check of `tag` against the HMAC of `parts`.
pub fn hmac_verify(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<(), TlsError> {
    let mut mac = keyed(key)?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag).map_err(|_| TlsError::Mac)
}

/// `P_SHA256(secret, label || seed)` truncated to `len` bytes.
pub fn tls_prf(
    secret: &[u8],
    label: &str,
    seed: &[u8],
    len: usize,
) -> Result<Zeroizing<Vec<u8>>, TlsError> {
    let label = label.as_bytes();
    let mut out = Zeroizing::new(Vec::with_capacity(len + HASH_LEN));

    // A(1) = HMAC(secret, label || seed)
    let mut a = hmac_sha256(secret, &[label, seed])?;
    while out.len() < len {
        let mut block = hmac_sha256(secret, &[&a, label, seed])?;
        out.extend_from_slice(&block);
        block.zeroize();
        a = hmac_sha256(secret, &[&a])?;
    }
    a.zeroize();

    out.truncate(len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_block_is_p_hash() {
        let secret = [0x0b; 32];
        let out = tls_prf(&secret, "master secret", b"seed", 0x20).unwrap();

        let a1 = hmac_sha256(&secret, &[b"master secret", b"seed"]).unwrap();
        let expected = hmac_sha256(&secret, &[&a1, b"master secret", b"seed"]).unwrap();
        assert_eq!(&out[..], &expected[..]);
    }

    #[test]
    fn test_shorter_output_is_prefix() {
        let key_block = tls_prf(b"secret", "key expansion", &[7; 64], 0x120).unwrap();
        let master = tls_prf(b"secret", "key expansion", &[7; 64], 0x30).unwrap();
        assert_eq!(key_block.len(), 0x120);
        assert_eq!(&key_block[..0x30], &master[..]);
    }

    #[test]
    fn test_label_and_seed_matter() {
        let a = tls_prf(b"k", "GWK", b"seed", 0x20).unwrap();
        let b = tls_prf(b"k", "GWL", b"seed", 0x20).unwrap();
        let c = tls_prf(b"k", "GWK", b"seee", 0x20).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, tls_prf(b"k", "GWK", b"seed", 0x20).unwrap());
    }

    #[test]
    fn test_empty_output() {
        assert!(tls_prf(b"k", "x", b"", 0).unwrap().is_empty());
    }

    #[test]
    fn test_hmac_verify() {
        let tag = hmac_sha256(b"key", &[b"head", b"body"]).unwrap();
        assert!(hmac_verify(b"key", &[b"headbody"], &tag).is_ok());
        assert_eq!(
            hmac_verify(b"key", &[b"headbodz"], &tag),
            Err(TlsError::Mac)
        );
    }
}
