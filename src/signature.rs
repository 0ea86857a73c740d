use chrono::DateTime;
use chrono::Utc;
use hmac::Hmac;
use hmac::Mac;
use secrecy::ExposeSecret;
use secrecy::Secret;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The one error callers ever see. Whether the signature was malformed,
/// wrong, or stale is logged but deliberately not distinguishable from the
/// outside.
#[derive(Debug, thiserror::Error)]
#[error("invalid signature")]
pub struct InvalidSignature;

/// Message authentication for the payment webhook. The provider signs
/// `t=<unix-seconds>.<raw-body>` with HMAC-SHA-256 and sends
/// `Signature: t=<t>,v1=<hex>`; we recompute and compare in constant time,
/// and reject timestamps outside the tolerance window.
pub fn verify_signature(
    secret: &Secret<String>,
    header: &str,
    body: &[u8],
    tolerance_secs: i64,
    now: DateTime<Utc>,
) -> Result<(), InvalidSignature> {
    let (timestamp, signature) = parse_header(header).ok_or_else(|| {
        tracing::debug!("malformed signature header");
        InvalidSignature
    })?;

    if (now.timestamp() - timestamp).abs() > tolerance_secs {
        tracing::debug!("stale webhook timestamp");
        return Err(InvalidSignature);
    }

    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|_| InvalidSignature)?;
    mac.update(format!("t={timestamp}.").as_bytes());
    mac.update(body);
    // constant-time comparison
    mac.verify_slice(&signature).map_err(|_| {
        tracing::debug!("webhook signature mismatch");
        InvalidSignature
    })
}

/// Produce the header value the provider would send; used by the test suite
/// to forge valid (and invalid) deliveries.
pub fn sign(
    secret: &Secret<String>,
    timestamp: i64,
    body: &[u8],
) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .expect("HMAC accepts keys of any size");
    mac.update(format!("t={timestamp}.").as_bytes());
    mac.update(body);
    let signature = hex::encode(mac.finalize().into_bytes());
    format!("t={timestamp},v1={signature}")
}

fn parse_header(header: &str) -> Option<(i64, Vec<u8>)> {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signature = hex::decode(value).ok(),
            _ => {}
        }
    }
    Some((timestamp?, signature?))
}
