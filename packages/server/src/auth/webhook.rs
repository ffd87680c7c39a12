use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is missing")]
    Missing,
    #[error("signature is not valid hex")]
    BadEncoding,
    #[error("signature does not match payload")]
    Mismatch,
}

fn mac(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length")
}

/// Signed payload layout: when a timestamp accompanies the signature it is
/// bound into the MAC as `{timestamp}.{body}`, otherwise the raw body alone
/// is signed.
fn signed_payload(body: &[u8], timestamp: Option<&str>) -> Vec<u8> {
    match timestamp {
        Some(ts) => {
            let mut payload = Vec::with_capacity(ts.len() + 1 + body.len());
            payload.extend_from_slice(ts.as_bytes());
            payload.push(b'.');
            payload.extend_from_slice(body);
            payload
        }
        None => body.to_vec(),
    }
}

/// Per-job callback secret, derived from the shared secret and the job id.
/// The worker signs callbacks with this; the receiver re-derives it from the
/// analysis id in the callback body.
pub fn derive_callback_secret(secret: &str, job_id: &str) -> String {
    let mut mac = mac(secret);
    mac.update(job_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Produce the hex signature for an outbound webhook body.
pub fn sign_webhook(secret: &str, body: &[u8], timestamp: Option<&str>) -> String {
    let mut mac = mac(secret);
    mac.update(&signed_payload(body, timestamp));
    hex::encode(mac.finalize().into_bytes())
}

/// Check a presented signature against the body in constant time.
///
/// Accepts the bare hex digest or the `sha256=` prefixed form.
pub fn verify_webhook_signature(
    secret: &str,
    body: &[u8],
    signature: &str,
    timestamp: Option<&str>,
) -> Result<(), SignatureError> {
    let hex_digest = signature.strip_prefix("sha256=").unwrap_or(signature);
    let presented = hex::decode(hex_digest).map_err(|_| SignatureError::BadEncoding)?;

    let mut mac = mac(secret);
    mac.update(&signed_payload(body, timestamp));
    mac.verify_slice(&presented)
        .map_err(|_| SignatureError::Mismatch)
}
