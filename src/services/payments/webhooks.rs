//! Gateway webhook verification and payload parsing.
//!
//! Signature checks are pure so they can run before any database work.
//! Two header shapes are accepted: a plain `x-timestamp`/`x-signature`
//! pair, and the Stripe-style `Stripe-Signature: t=...,v1=...` form.
//! Both sign the same string: `"{timestamp}.{raw body}"` under
//! HMAC-SHA256, hex-encoded.

use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Payload the gateway posts back for asynchronous payment updates.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    /// Event discriminator, e.g. `payment.captured` or `payment.failed`.
    #[serde(rename = "type")]
    pub kind: String,
    pub payment_id: Uuid,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// How an incoming webhook was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event moved payment or order state.
    Applied,
    /// Redelivery of something already applied; acknowledged without change.
    Duplicate,
    /// An event kind this engine does not consume.
    Ignored,
}

/// Checks the webhook signature against the shared secret.
///
/// Rejects payloads whose timestamp falls outside `tolerance_secs` of the
/// current clock, which bounds the replay window to the same degree in
/// both directions.
pub fn verify_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
) -> Result<(), ServiceError> {
    let (timestamp, signature) = extract_signature(headers).ok_or_else(|| {
        ServiceError::ValidationError("Missing webhook signature headers".to_string())
    })?;

    let ts: i64 = timestamp.parse().map_err(|_| {
        ServiceError::ValidationError("Invalid webhook timestamp".to_string())
    })?;
    let now = Utc::now().timestamp();
    if (now - ts).unsigned_abs() > tolerance_secs {
        return Err(ServiceError::ValidationError(
            "Webhook timestamp outside tolerance".to_string(),
        ));
    }

    let expected = sign(payload, &timestamp, secret)?;
    if !constant_time_eq(&expected, &signature) {
        return Err(ServiceError::ValidationError(
            "Webhook signature mismatch".to_string(),
        ));
    }
    Ok(())
}

/// Parses the verified body into a [`WebhookEvent`].
pub fn parse_event(payload: &[u8]) -> Result<WebhookEvent, ServiceError> {
    serde_json::from_slice(payload)
        .map_err(|e| ServiceError::ValidationError(format!("Invalid webhook payload: {}", e)))
}

/// Computes the hex HMAC over `"{timestamp}.{payload}"`.
pub(crate) fn sign(payload: &[u8], timestamp: &str, secret: &str) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        ServiceError::ValidationError("Webhook secret is not a usable HMAC key".to_string())
    })?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn extract_signature(headers: &HeaderMap) -> Option<(String, String)> {
    if let (Some(ts), Some(sig)) = (headers.get("x-timestamp"), headers.get("x-signature")) {
        if let (Ok(ts), Ok(sig)) = (ts.to_str(), sig.to_str()) {
            return Some((ts.to_string(), sig.to_string()));
        }
    }

    let header = headers.get("stripe-signature")?.to_str().ok()?;
    let mut timestamp = None;
    let mut v1 = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value.to_string()),
            Some(("v1", value)) => v1 = Some(value.to_string()),
            _ => {}
        }
    }
    match (timestamp, v1) {
        (Some(ts), Some(sig)) => Some((ts, sig)),
        _ => None,
    }
}

/// Comparison that does not short-circuit on the first differing byte.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
