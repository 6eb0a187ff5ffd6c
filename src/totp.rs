//! Time-based one-time codes for the MFA step
//!
//! Standard RFC 6238 parameters: HMAC-SHA1, 6 digits, 30 second step.

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use totp_rs::{Algorithm, Secret, TOTP};

const DIGITS: usize = 6;
const STEP_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum TotpError {
    #[error("TOTP seed is empty")]
    EmptySeed,
    #[error("TOTP seed is not valid Base32: {0}")]
    InvalidSeed(String),
    #[error("System clock is before the Unix epoch")]
    Clock,
}

/// Code generator bound to one shared seed
#[derive(Clone)]
pub struct Totp {
    inner: TOTP,
}

impl Totp {
    /// Decode a Base32 seed as authenticator apps display it
    ///
    /// Spaces, lowercase letters and trailing `=` padding are accepted.
    pub fn from_seed(seed: &str) -> Result<Self, TotpError> {
        let normalized: String = seed
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect::<String>()
            .trim_end_matches('=')
            .to_ascii_uppercase();

        if normalized.is_empty() {
            return Err(TotpError::EmptySeed);
        }

        let bytes = Secret::Encoded(normalized)
            .to_bytes()
            .map_err(|e| TotpError::InvalidSeed(format!("{:?}", e)))?;

        if bytes.is_empty() {
            return Err(TotpError::EmptySeed);
        }

        // Issuers hand out seeds shorter than the 128 bits RFC 4226 recommends
        let inner = TOTP::new_unchecked(Algorithm::SHA1, DIGITS, 1, STEP_SECS, bytes);
        Ok(Self { inner })
    }

    /// Code for the 30 second window containing `unix_secs`
    pub fn code_at(&self, unix_secs: u64) -> String {
        self.inner.generate(unix_secs)
    }

    /// Code for the current window
    pub fn code_now(&self) -> Result<String, TotpError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| TotpError::Clock)?;
        Ok(self.code_at(now.as_secs()))
    }
}

impl std::fmt::Debug for Totp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Totp(<redacted>)")
    }
}

/// Current code for `seed`
pub fn code_now(seed: &str) -> Result<String, TotpError> {
    Totp::from_seed(seed)?.code_now()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Base32 of the RFC 6238 SHA1 test key "12345678901234567890"
    const RFC_SEED: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn test_rfc6238_vectors() {
        let totp = Totp::from_seed(RFC_SEED).unwrap();
        assert_eq!(totp.code_at(59), "287082");
        assert_eq!(totp.code_at(1_111_111_109), "081804");
        assert_eq!(totp.code_at(1_234_567_890), "005924");
    }

    #[test]
    fn test_code_is_stable_within_window() {
        let totp = Totp::from_seed(RFC_SEED).unwrap();
        assert_eq!(totp.code_at(1_234_567_860), totp.code_at(1_234_567_889));
    }

    #[test]
    fn test_codes_differ_across_windows() {
        let totp = Totp::from_seed(RFC_SEED).unwrap();
        assert_ne!(totp.code_at(59), totp.code_at(1_111_111_109));
        assert_ne!(totp.code_at(1_111_111_109), totp.code_at(1_234_567_890));
    }

    #[test]
    fn test_code_now_is_six_digits() {
        let code = code_now(RFC_SEED).unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_seed_normalization() {
        let spaced = Totp::from_seed("gezd gnbv gy3t qojq gezd gnbv gy3t qojq").unwrap();
        assert_eq!(spaced.code_at(59), "287082");

        let padded = Totp::from_seed("JBSWY3DPEHPK3PXP====").unwrap();
        let plain = Totp::from_seed("JBSWY3DPEHPK3PXP").unwrap();
        assert_eq!(padded.code_at(1_000_000), plain.code_at(1_000_000));
    }

    #[test]
    fn test_empty_seed_rejected() {
        assert!(matches!(Totp::from_seed(""), Err(TotpError::EmptySeed)));
        assert!(matches!(Totp::from_seed("   "), Err(TotpError::EmptySeed)));
    }

    #[test]
    fn test_malformed_seed_rejected() {
        assert!(matches!(
            Totp::from_seed("not*base32!"),
            Err(TotpError::InvalidSeed(_))
        ));
    }
}
