//! X25519 key helpers
//!
//! Derives the interface public key from the configured private key and
//! produces short key fingerprints for logs.

use x25519_dalek::{PublicKey, StaticSecret};

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// Number of key bytes shown in log fingerprints
const FINGERPRINT_LEN: usize = 8;

/// Derive public key from private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Check if a public key is usable (not the all-zero identity point)
pub fn is_valid_public_key(key: &[u8; KEY_LEN]) -> bool {
    !key.iter().all(|&b| b == 0)
}

/// Hex of the first key bytes, safe to write to logs
pub fn fingerprint(key: &[u8; KEY_LEN]) -> String {
    hex::encode(&key[..FINGERPRINT_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7748 section 6.1, Alice
    const ALICE_PRIVATE: [u8; KEY_LEN] = [
        0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2, 0x66,
        0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5, 0x1d, 0xb9,
        0x2c, 0x2a,
    ];

    #[test]
    fn test_public_key_derivation() {
        let expected_public = [
            0x85, 0x20, 0xf0, 0x09, 0x89, 0x30, 0xa7, 0x54, 0x74, 0x8b, 0x7d, 0xdc, 0xb4, 0x3e,
            0xf7, 0x5a, 0x0d, 0xbf, 0x3a, 0x0d, 0x26, 0x38, 0x1a, 0xf4, 0xeb, 0xa4, 0xa9, 0x8e,
            0xaa, 0x9b, 0x4e, 0x6a,
        ];

        assert_eq!(public_key(&ALICE_PRIVATE), expected_public);
    }

    #[test]
    fn test_is_valid_public_key() {
        assert!(is_valid_public_key(&public_key(&ALICE_PRIVATE)));
        assert!(!is_valid_public_key(&[0u8; KEY_LEN]));
    }

    #[test]
    fn test_fingerprint() {
        let public = public_key(&ALICE_PRIVATE);
        assert_eq!(fingerprint(&public), "8520f0098930a754");
    }
}
