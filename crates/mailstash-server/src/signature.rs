//! Webhook signature verification
//!
//! The provider signs the exact request body bytes with HMAC-SHA256
//! under the shared secret and sends `Signature: <algorithm>=<hexdigest>`.
//! Verification is constant-time; a missing secret fails closed.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::ServerError;

type HmacSha256 = Hmac<Sha256>;

/// Verify a signed webhook body. Any failure is a 401; the request body
/// is never inspected before its signature checks out.
pub fn verify_signature(
    secret: Option<&str>,
    header: Option<&str>,
    body: &[u8],
) -> Result<(), ServerError> {
    let secret = secret.ok_or_else(|| {
        ServerError::Unauthorized("webhook secret not configured".to_string())
    })?;

    let header = header
        .ok_or_else(|| ServerError::Unauthorized("missing Signature header".to_string()))?;

    let (algorithm, hex_digest) = header
        .split_once('=')
        .ok_or_else(|| ServerError::Unauthorized("malformed Signature header".to_string()))?;

    if !algorithm.eq_ignore_ascii_case("sha256") {
        return Err(ServerError::Unauthorized(format!(
            "unsupported signature algorithm {:?}",
            algorithm
        )));
    }

    let claimed = decode_hex(hex_digest.trim())
        .ok_or_else(|| ServerError::Unauthorized("signature is not valid hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServerError::Unauthorized(format!("invalid webhook secret: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&claimed)
        .map_err(|_| ServerError::Unauthorized("signature mismatch".to_string()))
}

/// Compute the signature header value for a body. Test and tooling
/// helper; the server only ever verifies.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length works");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256={}", hex)
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "swordfish";
    const BODY: &[u8] = br#"{"type":"email.received","emailId":"e1"}"#;

    #[test]
    fn test_valid_signature() {
        let header = sign(SECRET, BODY);
        assert!(verify_signature(Some(SECRET), Some(&header), BODY).is_ok());
    }

    #[test]
    fn test_corrupted_signature_rejected() {
        let mut header = sign(SECRET, BODY);
        header.pop();
        header.push('0');
        assert!(verify_signature(Some(SECRET), Some(&header), BODY).is_err());
    }

    #[test]
    fn test_body_tamper_rejected() {
        let header = sign(SECRET, BODY);
        assert!(verify_signature(Some(SECRET), Some(&header), b"{}").is_err());
    }

    #[test]
    fn test_missing_header_rejected() {
        assert!(verify_signature(Some(SECRET), None, BODY).is_err());
    }

    #[test]
    fn test_missing_secret_fails_closed() {
        let header = sign(SECRET, BODY);
        assert!(verify_signature(None, Some(&header), BODY).is_err());
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let header = sign(SECRET, BODY).replace("sha256=", "md5=");
        assert!(verify_signature(Some(SECRET), Some(&header), BODY).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = sign("other-secret", BODY);
        assert!(verify_signature(Some(SECRET), Some(&header), BODY).is_err());
    }
}
