//! Webhook body signing.
//!
//! Both delivery channels sign the raw JSON body with HMAC-SHA256 under the
//! configured secret: `X-CodeQ-Signature: sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-CodeQ-Signature";

type HmacSha256 = Hmac<Sha256>;

pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of a header produced by [`sign`].
pub fn verify(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(digest) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&digest).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let secret = b"webhook-secret";
        let body = br#"{"taskId":"t1","status":"COMPLETED"}"#;
        let header = sign(secret, body);
        assert!(header.starts_with("sha256="));
        assert!(verify(secret, body, &header));
    }

    #[test]
    fn tampered_body_fails() {
        let secret = b"webhook-secret";
        let header = sign(secret, b"original");
        assert!(!verify(secret, b"tampered", &header));
    }

    #[test]
    fn wrong_secret_fails() {
        let header = sign(b"secret-a", b"body");
        assert!(!verify(b"secret-b", b"body", &header));
    }

    #[test]
    fn malformed_headers_fail_closed() {
        assert!(!verify(b"s", b"body", ""));
        assert!(!verify(b"s", b"body", "md5=abc"));
        assert!(!verify(b"s", b"body", "sha256=not-hex"));
    }
}
