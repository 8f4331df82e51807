//! Fixed host key material the sensor was paired against.
//!
//! Sensors paired by the vendor tooling expect this exact host key in the
//! Certificate message. Keep every copy of it in this module.

use p256::SecretKey;

use super::TlsError;

/// Host ECDH private scalar, big endian.
pub const HOST_PRIVATE_KEY: [u8; 32] = [
    0x20, 0x14, 0x3b, 0x7b, 0x62, 0x64, 0x90, 0x07, 0x54, 0x4e, 0x7a, 0x98, 0xf9, 0x81, 0xbe, 0xc1,
    0xf2, 0x1f, 0x9a, 0x29, 0x65, 0xb6, 0xcc, 0x29, 0x0c, 0x45, 0xd3, 0x87, 0xae, 0xbf, 0xa4, 0xd9,
];

/// Affine x of the matching public point.
pub const HOST_PUBLIC_X: [u8; 32] = [
    0x1d, 0xd8, 0x36, 0x68, 0xe9, 0xb0, 0x7b, 0x93, 0x12, 0x38, 0x31, 0x23, 0x90, 0xc8, 0x87, 0xca,
    0xdb, 0x82, 0x27, 0x39, 0xde, 0x7b, 0x43, 0xd2, 0x23, 0xd7, 0xcd, 0xd1, 0x3c, 0x77, 0x0e, 0xd2,
];

/// Affine y of the matching public point.
pub const HOST_PUBLIC_Y: [u8; 32] = [
    0xd1, 0x93, 0x70, 0x02, 0xaf, 0x3b, 0x18, 0x47, 0xc5, 0x30, 0x4c, 0x33, 0x60, 0xcf, 0xbf, 0xc5,
    0x9b, 0x3c, 0x67, 0xd9, 0x45, 0x06, 0x38, 0xda, 0x92, 0xbe, 0x65, 0xbf, 0x81, 0x8c, 0xaa, 0x7e,
];

pub fn fixed_host_key() -> Result<SecretKey, TlsError> {
    SecretKey::from_slice(&HOST_PRIVATE_KEY).map_err(|e| TlsError::Key(e.to_string()))
}

#[cfg(test)]
mod tests {
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    use super::*;

    #[test]
    fn test_fixed_key_matches_public_point() {
        let point = fixed_host_key().unwrap().public_key().to_encoded_point(false);
        assert_eq!(point.x().unwrap().as_slice(), &HOST_PUBLIC_X);
        assert_eq!(point.y().unwrap().as_slice(), &HOST_PUBLIC_Y);
    }
}
