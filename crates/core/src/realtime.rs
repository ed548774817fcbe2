use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::domain::agent::AgentEvent;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-exportdesk-signature";
const SIGNATURE_PREFIX: &str = "sha256=";

/// Body pushed to realtime subscribers (dashboards, webhooks) for each bus event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeMessage {
    pub event_type: String,
    pub published_by: String,
    pub sequence: Option<u64>,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

impl From<&AgentEvent> for RealtimeMessage {
    fn from(event: &AgentEvent) -> Self {
        Self {
            event_type: event.event_type.clone(),
            published_by: event.published_by.clone(),
            sequence: event.sequence,
            payload: event.payload.clone(),
            published_at: event.timestamp,
        }
    }
}

/// `sha256=<hex hmac>` over the raw request body.
pub fn sign_payload(secret: &[u8], body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", encode_hex(mac.finalize().into_bytes().as_slice()))
}

pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Some(expected) = signature.strip_prefix(SIGNATURE_PREFIX).and_then(decode_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(value.get(index..index + 2)?, 16).ok())
        .collect()
}
