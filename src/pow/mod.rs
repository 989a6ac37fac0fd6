//! Hashcash proof of work: the SHA-256 prefix test and the nonce source.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_BYTES: usize = 16;

/// Returns true iff the hex digest of `header` starts with `difficulty`
/// zero characters. Difficulty counts hex nibbles, not bits: 20 leading
/// hex zeros is roughly 80 bits of work.
pub fn verify(header: &str, difficulty: u32) -> bool {
    let digest = Sha256::digest(header.as_bytes());
    let digest_hex = hex::encode(digest);
    digest_hex
        .bytes()
        .take(difficulty as usize)
        .all(|b| b == b'0')
        && digest_hex.len() >= difficulty as usize
}

/// Draws 16 octets from the OS RNG and returns their standard base64
/// encoding. Doubles as the challenge store key, so collisions must stay
/// cryptographically negligible.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_known_prefix() {
        // Brute-force a difficulty-1 witness so the test is self-contained.
        let witness = (0..)
            .map(|i| format!("prefix-test:{i}"))
            .find(|s| hex::encode(Sha256::digest(s.as_bytes())).starts_with('0'))
            .unwrap();
        assert!(verify(&witness, 1));
    }

    #[test]
    fn rejects_wrong_prefix() {
        let sample = (0..)
            .map(|i| format!("prefix-test:{i}"))
            .find(|s| !hex::encode(Sha256::digest(s.as_bytes())).starts_with('0'))
            .unwrap();
        assert!(!verify(&sample, 1));
    }

    #[test]
    fn zero_difficulty_always_passes() {
        assert!(verify("anything at all", 0));
    }

    #[test]
    fn impossible_difficulty_fails() {
        // 65 nibbles exceeds the digest length.
        assert!(!verify("anything at all", 65));
    }

    #[test]
    fn nonce_is_16_octets_of_base64() {
        let nonce = generate_nonce();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&nonce)
            .unwrap();
        assert_eq!(decoded.len(), NONCE_BYTES);
    }

    #[test]
    fn nonces_do_not_repeat() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_ne!(a, b);
    }
}
