//! Webhook signature verification.
//!
//! HMAC digests and token equality are compared in constant time; a
//! failure never reveals which byte mismatched, and secret values never
//! appear in errors or logs.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::WebhookProvider;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Verify a hex-encoded HMAC-SHA256 signature over the raw body.
#[must_use]
pub fn verify_sha256(body: &[u8], signature: &str, secret: &str) -> bool {
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// Verify a hex-encoded HMAC-SHA1 signature (legacy header support).
#[must_use]
pub fn verify_sha1(body: &[u8], signature: &str, secret: &str) -> bool {
    let signature = signature.strip_prefix("sha1=").unwrap_or(signature);
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// Constant-time token equality.
#[must_use]
pub fn token_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Verify a request for one provider against a per-repository secret.
///
/// `header` resolves a header by name. Providers without a presented
/// credential fail closed whenever a secret is configured.
#[must_use]
pub fn verify_provider(
    provider: WebhookProvider,
    header: &impl Fn(&str) -> Option<String>,
    body: &[u8],
    secret: &str,
) -> bool {
    match provider {
        WebhookProvider::Github => {
            if let Some(signature) = header("X-Hub-Signature-256") {
                return verify_sha256(body, &signature, secret);
            }
            if let Some(signature) = header("X-Hub-Signature") {
                return verify_sha1(body, &signature, secret);
            }
            false
        }
        WebhookProvider::Gitlab => header("X-Gitlab-Token")
            .is_some_and(|token| token_matches(&token, secret)),
        WebhookProvider::Bitbucket => header("X-Hub-Signature")
            .is_some_and(|signature| verify_sha256(body, &signature, secret)),
        WebhookProvider::Gitea => header("X-Gitea-Signature")
            .is_some_and(|signature| verify_sha256(body, &signature, secret)),
        WebhookProvider::Generic => header("X-Webhook-Token")
            .is_some_and(|token| token_matches(&token, secret)),
    }
}
