//! Subscription Registry and Event Store
//!
//! In-memory maps backed by JSON files under the data directory:
//! `subscriptions.json` for the registry, `events/<subscription_id>.json`
//! for stored payloads. Loading is tolerant: an unreadable file is logged
//! and skipped, never fatal. Events outlive their subscription; nothing
//! here deletes them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

use crate::error::GatewayError;
use crate::types::{
    subscription_id, CreateSubscription, Event, Subscription, SubscriptionStatus,
};
use crate::verify::SignatureEncoding;

pub struct GatewayStore {
    subscriptions: HashMap<String, Subscription>,
    /// Events per subscription id, in arrival order.
    events: HashMap<String, Vec<Event>>,
    /// Event id back to its subscription id.
    event_index: HashMap<String, String>,
    data_dir: PathBuf,
}

impl GatewayStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            subscriptions: HashMap::new(),
            events: HashMap::new(),
            event_index: HashMap::new(),
            data_dir,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    pub fn load(&mut self) {
        let path = self.data_dir.join("subscriptions.json");
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<Vec<Subscription>>(&content) {
                    Ok(items) => {
                        for sub in items {
                            self.subscriptions.insert(sub.id.clone(), sub);
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring unparseable subscriptions.json"),
                },
                Err(e) => warn!(error = %e, "failed to read subscriptions.json"),
            }
        }

        // Event files are keyed by subscription id but loaded independently
        // of the registry: events for deleted subscriptions stay readable.
        let events_dir = self.data_dir.join("events");
        if let Ok(entries) = std::fs::read_dir(&events_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(sub_id) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let sub_id = sub_id.to_string();
                let parsed = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|c| serde_json::from_str::<Vec<Event>>(&c).ok());
                match parsed {
                    Some(items) => {
                        for event in &items {
                            self.event_index.insert(event.id.clone(), sub_id.clone());
                        }
                        self.events.insert(sub_id, items);
                    }
                    None => warn!(path = %path.display(), "ignoring unreadable event file"),
                }
            }
        }
    }

    pub fn save_subscriptions(&self) -> Result<(), GatewayError> {
        std::fs::create_dir_all(&self.data_dir)?;
        let path = self.data_dir.join("subscriptions.json");
        let mut items: Vec<&Subscription> = self.subscriptions.values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let content = serde_json::to_string_pretty(&items)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn save_events(&self, subscription_id: &str) -> Result<(), GatewayError> {
        let dir = self.data_dir.join("events");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{subscription_id}.json"));
        let empty = Vec::new();
        let events = self.events.get(subscription_id).unwrap_or(&empty);
        let content = serde_json::to_string_pretty(&events)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Point every stored webhook URL at `base`. Returns true if anything
    /// changed and needs saving.
    pub fn rebase_urls(&mut self, base: &str) -> bool {
        let mut changed = false;
        for sub in self.subscriptions.values_mut() {
            let url = format!("{base}/webhook/{}", sub.id);
            if sub.url != url {
                sub.url = url;
                changed = true;
            }
        }
        changed
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    pub fn create(
        &mut self,
        req: CreateSubscription,
        base: &str,
    ) -> Result<Subscription, GatewayError> {
        if req.session_id.is_empty() {
            return Err(GatewayError::validation("session_id is required"));
        }

        let id = subscription_id();
        let sub = Subscription {
            url: format!("{base}/webhook/{id}"),
            id,
            session_id: req.session_id,
            name: req.name.unwrap_or_else(|| "webhook".to_string()),
            service: req.service.unwrap_or_else(|| "custom".to_string()),
            prompt: req.prompt.unwrap_or_default(),
            secret_token: req.secret_token,
            hmac_header: req.hmac_header,
            signature_encoding: req.signature_encoding.unwrap_or_default(),
            jq_filter: req.jq_filter,
            summary_filter: req.summary_filter,
            one_shot: req.one_shot,
            status: req.status.unwrap_or(SubscriptionStatus::Active),
            created_at: Utc::now(),
        };
        self.subscriptions.insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    pub fn get(&self, id: &str) -> Result<&Subscription, GatewayError> {
        self.subscriptions
            .get(id)
            .ok_or_else(|| GatewayError::not_found("subscription", id))
    }

    pub fn list(&self, session_id: Option<&str>) -> Vec<&Subscription> {
        let mut items: Vec<&Subscription> = self
            .subscriptions
            .values()
            .filter(|s| session_id.map_or(true, |sid| s.session_id == sid))
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    /// Merge-update: only fields present in `data` are touched. Optional
    /// fields clear when supplied as null. Validation runs before any
    /// mutation, so a rejected call leaves the record as it was.
    pub fn update(
        &mut self,
        id: &str,
        data: &serde_json::Value,
    ) -> Result<Subscription, GatewayError> {
        let sub = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| GatewayError::not_found("subscription", id))?;

        let status = match data.get("status") {
            Some(v) => Some(
                serde_json::from_value::<SubscriptionStatus>(v.clone())
                    .map_err(|_| GatewayError::validation(format!("invalid status: {v}")))?,
            ),
            None => None,
        };
        let encoding = match data.get("signature_encoding") {
            Some(v) => Some(
                serde_json::from_value::<SignatureEncoding>(v.clone()).map_err(|_| {
                    GatewayError::validation(format!("invalid signature_encoding: {v}"))
                })?,
            ),
            None => None,
        };
        if let Some(v) = data.get("session_id") {
            match v.as_str() {
                Some(s) if !s.is_empty() => {}
                _ => {
                    return Err(GatewayError::validation("session_id must be a non-empty string"))
                }
            }
        }

        if let Some(v) = data.get("session_id").and_then(|v| v.as_str()) {
            sub.session_id = v.to_string();
        }
        if let Some(v) = data.get("name").and_then(|v| v.as_str()) {
            sub.name = v.to_string();
        }
        if let Some(v) = data.get("service").and_then(|v| v.as_str()) {
            sub.service = v.to_string();
        }
        if let Some(v) = data.get("prompt").and_then(|v| v.as_str()) {
            sub.prompt = v.to_string();
        }
        if data.get("secret_token").is_some() {
            sub.secret_token = data["secret_token"].as_str().map(|s| s.to_string());
        }
        if data.get("hmac_header").is_some() {
            sub.hmac_header = data["hmac_header"].as_str().map(|s| s.to_string());
        }
        if data.get("jq_filter").is_some() {
            sub.jq_filter = data["jq_filter"].as_str().map(|s| s.to_string());
        }
        if data.get("summary_filter").is_some() {
            sub.summary_filter = data["summary_filter"].as_str().map(|s| s.to_string());
        }
        if let Some(v) = data.get("one_shot").and_then(|v| v.as_bool()) {
            sub.one_shot = v;
        }
        if let Some(s) = status {
            sub.status = s;
        }
        if let Some(e) = encoding {
            sub.signature_encoding = e;
        }

        Ok(sub.clone())
    }

    pub fn delete(&mut self, id: &str) -> Result<Subscription, GatewayError> {
        self.subscriptions
            .remove(id)
            .ok_or_else(|| GatewayError::not_found("subscription", id))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    pub fn insert_event(&mut self, event: Event) {
        self.event_index
            .insert(event.id.clone(), event.subscription_id.clone());
        self.events
            .entry(event.subscription_id.clone())
            .or_default()
            .push(event);
    }

    pub fn event(&self, event_id: &str) -> Result<&Event, GatewayError> {
        self.event_index
            .get(event_id)
            .and_then(|sub_id| self.events.get(sub_id))
            .and_then(|events| events.iter().find(|e| e.id == event_id))
            .ok_or_else(|| GatewayError::not_found("event", event_id))
    }

    /// Newest first.
    pub fn recent_events(&self, subscription_id: &str, limit: usize) -> Vec<&Event> {
        self.events
            .get(subscription_id)
            .map(|events| events.iter().rev().take(limit).collect())
            .unwrap_or_default()
    }

    /// Flip an event to delivered. Returns the owning subscription id when
    /// the flag actually changed, so the caller knows which file to save.
    pub fn mark_delivered(&mut self, event_id: &str) -> Option<String> {
        let sub_id = self.event_index.get(event_id)?.clone();
        let event = self
            .events
            .get_mut(&sub_id)?
            .iter_mut()
            .find(|e| e.id == event_id)?;
        if event.delivered {
            return None;
        }
        event.delivered = true;
        Some(sub_id)
    }

    pub fn event_count(&self) -> usize {
        self.events.values().map(|v| v.len()).sum()
    }
}
