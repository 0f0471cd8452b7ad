use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::verify::SignatureEncoding;

/// Header consulted for HMAC signatures when a subscription has a secret
/// but never named its own header.
pub const DEFAULT_SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Paused,
}

/// A registered webhook endpoint bound to one agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub session_id: String,
    /// Ingress URL derived from `id`; rebased to the current bind address
    /// on startup, never edited through updates.
    pub url: String,
    pub name: String,
    pub service: String,
    /// Text prepended to every delivered event envelope.
    pub prompt: String,
    pub secret_token: Option<String>,
    pub hmac_header: Option<String>,
    #[serde(default)]
    pub signature_encoding: SignatureEncoding,
    /// Gate expression; falsy result drops the event before storage.
    pub jq_filter: Option<String>,
    /// Projection expression applied to accepted payloads.
    pub summary_filter: Option<String>,
    #[serde(default)]
    pub one_shot: bool,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Header carrying this subscription's signature.
    pub fn signature_header(&self) -> &str {
        self.hmac_header.as_deref().unwrap_or(DEFAULT_SIGNATURE_HEADER)
    }
}

/// A stored inbound event that passed the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub subscription_id: String,
    pub received_at: DateTime<Utc>,
    /// Raw request body, stored verbatim.
    pub payload: String,
    #[serde(default)]
    pub summary: Option<Value>,
    pub delivered: bool,
}

/// Fields accepted by subscription create calls. Everything except
/// `session_id` falls back to a default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSubscription {
    pub session_id: String,
    pub name: Option<String>,
    pub service: Option<String>,
    pub prompt: Option<String>,
    pub secret_token: Option<String>,
    pub hmac_header: Option<String>,
    #[serde(default)]
    pub signature_encoding: Option<SignatureEncoding>,
    pub jq_filter: Option<String>,
    pub summary_filter: Option<String>,
    #[serde(default)]
    pub one_shot: bool,
    pub status: Option<SubscriptionStatus>,
}

pub fn subscription_id() -> String {
    format!("sub_{}", &Uuid::new_v4().simple().to_string()[..8])
}

pub fn event_id() -> String {
    format!("evt_{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// Render the fixed delivery envelope handed to the target session.
pub fn render_envelope(service: &str, event_id: &str, prompt: &str, summary: &Value) -> String {
    let summary_text = match summary {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    format!(
        "<webhook-event service=\"{service}\" event-id=\"{event_id}\">\n{prompt}\n<payload>\n{summary_text}\n</payload>\n</webhook-event>"
    )
}
