//! Webhook request authentication
//!
//! Each webhook carries one of five auth schemes. The credential is stored
//! encrypted and decrypted just before the HTTP call; this module turns the
//! decrypted parts into request headers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::RequestBuilder;
use sha2::Sha256;

use super::manager::WebhookError;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Auth configuration for one delivery, credential already decrypted
#[derive(Debug, Clone)]
pub enum WebhookAuth {
    None,
    /// Credential is "username:password"
    Basic { credential: String },
    Bearer { token: String },
    ApiKey { header: String, value: String },
    /// Payload signing secret
    Hmac { secret: String },
}

impl WebhookAuth {
    /// Assemble auth from the stored parts. A scheme that needs a credential
    /// but has none is a configuration error, not a retryable failure.
    pub fn from_parts(
        auth_type: &str,
        auth_header: Option<&str>,
        credential: Option<&str>,
    ) -> Result<Self, WebhookError> {
        match auth_type {
            "none" => Ok(WebhookAuth::None),
            "basic" => {
                let credential = require(credential, "basic")?;
                Ok(WebhookAuth::Basic { credential })
            }
            "bearer" => {
                let token = require(credential, "bearer")?;
                Ok(WebhookAuth::Bearer { token })
            }
            "api_key" => {
                let value = require(credential, "api_key")?;
                Ok(WebhookAuth::ApiKey {
                    header: auth_header.unwrap_or(DEFAULT_API_KEY_HEADER).to_string(),
                    value,
                })
            }
            "hmac" => {
                let secret = require(credential, "hmac")?;
                Ok(WebhookAuth::Hmac { secret })
            }
            other => Err(WebhookError::Validation(format!(
                "Unknown auth type: {}",
                other
            ))),
        }
    }

    /// Add the auth headers to a request. HMAC signs "<timestamp>.<payload>"
    /// and sets both the signature and timestamp headers.
    pub fn apply(
        &self,
        request: RequestBuilder,
        payload: &[u8],
        timestamp: i64,
    ) -> RequestBuilder {
        match self {
            WebhookAuth::None => request,
            WebhookAuth::Basic { credential } => request.header(
                "Authorization",
                format!("Basic {}", BASE64.encode(credential.as_bytes())),
            ),
            WebhookAuth::Bearer { token } => {
                request.header("Authorization", format!("Bearer {}", token))
            }
            WebhookAuth::ApiKey { header, value } => request.header(header, value),
            WebhookAuth::Hmac { secret } => {
                let signature = sign_payload(secret, timestamp, payload);
                request
                    .header("X-Webhook-Signature", format!("sha256={}", signature))
                    .header("X-Webhook-Timestamp", timestamp.to_string())
            }
        }
    }
}

fn require(credential: Option<&str>, scheme: &str) -> Result<String, WebhookError> {
    credential
        .filter(|c| !c.is_empty())
        .map(|c| c.to_string())
        .ok_or_else(|| {
            WebhookError::Validation(format!("Auth type {} requires a credential", scheme))
        })
}

/// Hex HMAC-SHA256 of "<timestamp>.<payload>"
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_matches_manual_computation() {
        let payload = br#"{"event":"email.sent"}"#;
        let signature = sign_payload("whsec_test", 1700000000, payload);

        // Same input, computed in one buffer
        let mut mac = HmacSha256::new_from_slice(b"whsec_test").unwrap();
        mac.update(b"1700000000.");
        mac.update(payload);
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(signature, expected);
    }

    #[test]
    fn test_signature_depends_on_timestamp() {
        let payload = b"{}";
        let a = sign_payload("s", 1, payload);
        let b = sign_payload("s", 2, payload);
        assert_ne!(a, b);
    }

    #[test]
    fn test_from_parts_requires_credential() {
        assert!(WebhookAuth::from_parts("hmac", None, None).is_err());
        assert!(WebhookAuth::from_parts("bearer", None, Some("")).is_err());
        assert!(WebhookAuth::from_parts("none", None, None).is_ok());
    }

    #[test]
    fn test_from_parts_api_key_default_header() {
        let auth = WebhookAuth::from_parts("api_key", None, Some("k")).unwrap();
        match auth {
            WebhookAuth::ApiKey { header, value } => {
                assert_eq!(header, "X-API-Key");
                assert_eq!(value, "k");
            }
            _ => panic!("expected api key auth"),
        }
    }

    #[test]
    fn test_from_parts_rejects_unknown_type() {
        assert!(WebhookAuth::from_parts("oauth", None, Some("x")).is_err());
    }
}
