//! WhatsApp webhook payloads and signature verification

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use whatsend_storage::models::MessageStatus;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Top-level webhook notification
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub statuses: Vec<StatusNotification>,
}

/// Delivery receipt for one outbound message
#[derive(Debug, Clone, Deserialize)]
pub struct StatusNotification {
    /// Provider message id (`wamid...`)
    pub id: String,
    pub status: String,
    /// Unix seconds, as a string
    pub timestamp: Option<String>,
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<WebhookError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookError {
    pub code: Option<i64>,
    pub title: Option<String>,
    pub message: Option<String>,
}

impl WebhookPayload {
    /// Every status notification in the payload, in order
    pub fn statuses(&self) -> impl Iterator<Item = &StatusNotification> {
        self.entry
            .iter()
            .flat_map(|e| e.changes.iter())
            .flat_map(|c| c.value.statuses.iter())
    }
}

impl StatusNotification {
    /// Message status this receipt moves to; `None` for statuses we do not track
    pub fn message_status(&self) -> Option<MessageStatus> {
        match self.status.as_str() {
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        let secs: i64 = self.timestamp.as_deref()?.parse().ok()?;
        Utc.timestamp_opt(secs, 0).single()
    }

    /// First error rendered as `code: title`
    pub fn error_summary(&self) -> Option<String> {
        let error = self.errors.first()?;
        let text = error
            .message
            .as_deref()
            .or(error.title.as_deref())
            .unwrap_or("unknown error");
        Some(match error.code {
            Some(code) => format!("{}: {}", code, text),
            None => text.to_string(),
        })
    }
}

/// Verify an `X-Hub-Signature-256` header (`sha256=<hex>`) against the raw body
pub fn verify_signature(app_secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the signature header value for a body
pub fn sign(app_secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAYLOAD: &str = r#"{
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "2002",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "statuses": [
                        {"id": "wamid.1", "status": "delivered", "timestamp": "1717243200", "recipient_id": "5511999990000"},
                        {"id": "wamid.2", "status": "failed", "timestamp": "1717243201",
                         "errors": [{"code": 131049, "title": "Message not delivered"}]},
                        {"id": "wamid.3", "status": "deleted"}
                    ]
                }
            }, {
                "field": "messages",
                "value": {"messages": [{"from": "5511999990000", "type": "text"}]}
            }]
        }]
    }"#;

    #[test]
    fn test_parse_statuses() {
        let payload: WebhookPayload = serde_json::from_str(PAYLOAD).unwrap();
        let statuses: Vec<_> = payload.statuses().collect();

        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[0].message_status(), Some(MessageStatus::Delivered));
        assert_eq!(
            statuses[0].occurred_at().map(|t| t.timestamp()),
            Some(1_717_243_200)
        );
        assert_eq!(
            statuses[1].error_summary().as_deref(),
            Some("131049: Message not delivered")
        );
        assert_eq!(statuses[2].message_status(), None);
    }

    #[test]
    fn test_signature_round_trip() {
        let body = PAYLOAD.as_bytes();
        let header = sign("app-secret", body).unwrap();

        assert!(verify_signature("app-secret", body, &header));
        assert!(!verify_signature("other-secret", body, &header));
        assert!(!verify_signature("app-secret", b"tampered", &header));
        assert!(!verify_signature("app-secret", body, "sha1=abc"));
        assert!(!verify_signature("app-secret", body, "sha256=not-hex"));
    }
}
