//! The colon-separated challenge header:
//! `version:difficulty:expiresAt:subject:algorithm:nonce[:counter_b64]`
//!
//! The subject is the client's observed `host:port` and may itself contain
//! one colon, so a challenge is 6 or 7 fields and a solution 7 or 8. A
//! 7-field header is read as a colon-subject challenge; the counter is
//! only present as the 8th field.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::GateError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashcashHeader {
    pub version: u32,
    pub difficulty: u32,
    pub expires_at: i64,
    pub subject: String,
    pub algorithm: String,
    pub nonce: String,
    pub counter: i64,
}

impl fmt::Display for HashcashHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A zero counter serializes to the challenge form. A solution whose
        // winning counter is 0 is therefore byte-identical to the challenge
        // it answers, and the verifier accepts it on those bytes.
        if self.counter == 0 {
            write!(
                f,
                "{}:{}:{}:{}:{}:{}",
                self.version,
                self.difficulty,
                self.expires_at,
                self.subject,
                self.algorithm,
                self.nonce
            )
        } else {
            write!(
                f,
                "{}:{}:{}:{}:{}:{}:{}",
                self.version,
                self.difficulty,
                self.expires_at,
                self.subject,
                self.algorithm,
                self.nonce,
                BASE64.encode(self.counter.to_string())
            )
        }
    }
}

impl FromStr for HashcashHeader {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 6 || parts.len() > 8 {
            return Err(GateError::InvalidFormat);
        }

        let version: u32 = parts[0].parse().map_err(|_| GateError::InvalidFormat)?;
        let difficulty: u32 = parts[1].parse().map_err(|_| GateError::InvalidFormat)?;
        let expires_at: i64 = parts[2].parse().map_err(|_| GateError::InvalidFormat)?;

        let (subject, algorithm, nonce) = if parts.len() > 6 {
            (format!("{}:{}", parts[3], parts[4]), parts[5], parts[6])
        } else {
            (parts[3].to_string(), parts[4], parts[5])
        };

        let counter = if parts.len() > 7 {
            let decoded = BASE64
                .decode(parts[7])
                .map_err(|_| GateError::InvalidFormat)?;
            let digits = String::from_utf8(decoded).map_err(|_| GateError::InvalidFormat)?;
            digits.parse::<i64>().map_err(|_| GateError::InvalidFormat)?
        } else {
            0
        };

        Ok(HashcashHeader {
            version,
            difficulty,
            expires_at,
            subject,
            algorithm: algorithm.to_string(),
            nonce: nonce.to_string(),
            counter,
        })
    }
}

impl HashcashHeader {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    pub fn subject_matches(&self, peer: &str) -> bool {
        self.subject == peer
    }
}
