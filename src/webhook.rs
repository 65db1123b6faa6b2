//! Settlement webhook wire format and HMAC-SHA256 body signing. The
//! simulator signs, the gateway callback verifies; the shared secret comes
//! from config.

use bigdecimal::BigDecimal;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-Settlement-Signature";

type HmacSha256 = Hmac<Sha256>;

/// What the counterparty posts to the registered callback URL. The
/// `transaction_id` (and the reference echoed back inside `echo`) are the
/// consumer's idempotency keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub status: String,
    pub code: String,
    pub transaction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_no: Option<String>,
    pub amount: BigDecimal,
    pub echo: Option<serde_json::Value>,
    pub message: String,
}

impl WebhookPayload {
    /// The gateway reference travels in `echo.reference`, planted there at
    /// submission time.
    pub fn echoed_reference(&self) -> Option<&str> {
        self.echo.as_ref().and_then(|e| e["reference"].as_str())
    }
}

pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length; new_from_slice cannot fail.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
