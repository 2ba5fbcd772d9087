//! PKCE (Proof Key for Code Exchange), S256 only.

use crate::auth::secrets_match;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Verifiers and challenges are 43 to 128 characters of
/// `[A-Za-z0-9-._~]` (RFC 7636 section 4.1).
fn is_pkce_string(value: &str) -> bool {
    (43..=128).contains(&value.len())
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

pub fn is_valid_verifier(verifier: &str) -> bool {
    is_pkce_string(verifier)
}

pub fn is_valid_challenge(challenge: &str) -> bool {
    is_pkce_string(challenge)
}

/// `BASE64URL(SHA256(verifier))`
pub fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Check a verifier against the challenge recorded at /authorize.
pub fn verify_s256(code_verifier: &str, code_challenge: &str) -> bool {
    is_valid_verifier(code_verifier) && secrets_match(&s256_challenge(code_verifier), code_challenge)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7636 Appendix B
    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn test_s256_rfc_vector() {
        assert_eq!(s256_challenge(VERIFIER), CHALLENGE);
        assert!(verify_s256(VERIFIER, CHALLENGE));
    }

    #[test]
    fn test_s256_wrong_verifier() {
        let other = "x".repeat(43);
        assert!(!verify_s256(&other, CHALLENGE));
    }

    #[test]
    fn test_verifier_format() {
        assert!(!is_valid_verifier("too-short"));
        assert!(!is_valid_verifier(&"a".repeat(129)));
        assert!(!is_valid_verifier(&format!("{}+", "a".repeat(42))));
        assert!(is_valid_verifier(&"a~._-".repeat(9)));
    }

    #[test]
    fn test_malformed_verifier_rejected_even_if_hash_matches() {
        let short = "abc";
        assert!(!verify_s256(short, &s256_challenge(short)));
    }
}
