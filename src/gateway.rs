//! Gateway Facade
//!
//! One object owning the registry, the event store, the session delivery
//! channel, and the tunnel supervisor. The webhook ingress handler and
//! every control-plane operation live here; the HTTP layer and any RPC
//! front end stay thin over these methods.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::filter;
use crate::sessions::{Handoff, Notice, SessionChannel, SessionMessage};
use crate::store::GatewayStore;
use crate::tunnel::{TunnelMode, TunnelStatus, TunnelSupervisor};
use crate::types::{
    event_id, render_envelope, CreateSubscription, Event, Subscription, SubscriptionStatus,
};
use crate::verify;

/// How an inbound webhook request ended. Everything except the last two
/// acknowledges success to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Event stored and handed toward the target session.
    Accepted,
    /// Subscription paused: acknowledged and discarded so the provider
    /// does not treat the pause as a failure and retry.
    Paused,
    /// Gate filter said no: acknowledged, nothing stored.
    Dropped,
    SignatureMismatch,
    UnknownSubscription,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub local_base: String,
    pub data_dir: String,
    pub subscriptions: usize,
    pub events: usize,
    pub sessions: usize,
    pub observers: usize,
    pub tunnel: TunnelStatus,
}

pub struct Gateway {
    store: RwLock<GatewayStore>,
    sessions: Arc<SessionChannel>,
    tunnel: TunnelSupervisor,
    local_base: String,
    named_tunnel: Option<TunnelMode>,
}

impl Gateway {
    /// Build the gateway over an already-loaded store. Spawns the task
    /// that forwards tunnel transitions into the notice stream, so this
    /// needs a running runtime.
    pub fn new(
        store: GatewayStore,
        tunnel: TunnelSupervisor,
        local_base: String,
        named_tunnel: Option<TunnelMode>,
    ) -> Self {
        let sessions = Arc::new(SessionChannel::new());

        let mut status_rx = tunnel.subscribe();
        let notify = Arc::clone(&sessions);
        tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = status_rx.borrow_and_update().clone();
                notify
                    .broadcast(Notice::TunnelChanged {
                        state: status.state,
                        url: status.url,
                    })
                    .await;
            }
        });

        Self {
            store: RwLock::new(store),
            sessions,
            tunnel,
            local_base,
            named_tunnel,
        }
    }

    // ---------------------------------------------------------------------
    // Webhook ingress
    // ---------------------------------------------------------------------

    /// Run one inbound request through the pipeline: resolve, paused
    /// check, signature, gate filter, summary, persist, envelope, handoff,
    /// one-shot retirement.
    pub async fn ingest(
        &self,
        subscription_id: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> IngestOutcome {
        let sub = match self.store.read().await.get(subscription_id) {
            Ok(sub) => sub.clone(),
            Err(_) => {
                debug!(subscription_id, "webhook for unknown subscription");
                return IngestOutcome::UnknownSubscription;
            }
        };

        if sub.status == SubscriptionStatus::Paused {
            debug!(id = %sub.id, "subscription paused, discarding event");
            return IngestOutcome::Paused;
        }

        // Signature covers the raw, unparsed body. No secret means accept
        // unconditionally; that risk belongs to whoever created the
        // subscription without one.
        if let Some(secret) = &sub.secret_token {
            let header_name = sub.signature_header();
            let presented = headers
                .get(header_name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !verify::verify(secret, body, presented, sub.signature_encoding) {
                warn!(id = %sub.id, header = header_name, "webhook signature mismatch");
                return IngestOutcome::SignatureMismatch;
            }
        }

        let parsed: Option<Value> = serde_json::from_slice(body).ok();

        if let Some(expr) = &sub.jq_filter {
            let passed = match &parsed {
                Some(input) => match filter::evaluate(expr, input) {
                    Ok(v) => !filter::falsy(&v),
                    Err(e) => {
                        debug!(id = %sub.id, error = %e, "gate filter error, dropping event");
                        false
                    }
                },
                // A gate over a body that does not parse can never hold.
                None => false,
            };
            if !passed {
                debug!(id = %sub.id, "event dropped by gate filter");
                return IngestOutcome::Dropped;
            }
        }

        let input = parsed
            .unwrap_or_else(|| Value::String(String::from_utf8_lossy(body).into_owned()));

        let summary = match &sub.summary_filter {
            Some(expr) => match filter::evaluate(expr, &input) {
                Ok(v) => v,
                Err(e) => {
                    debug!(id = %sub.id, error = %e, "summary filter failed, using fallback");
                    filter::fallback_summary(&input)
                }
            },
            None => filter::fallback_summary(&input),
        };

        let event = Event {
            id: event_id(),
            subscription_id: sub.id.clone(),
            received_at: Utc::now(),
            payload: String::from_utf8_lossy(body).into_owned(),
            summary: Some(summary.clone()),
            delivered: false,
        };
        let event_id = event.id.clone();
        {
            let mut store = self.store.write().await;
            store.insert_event(event);
            if let Err(e) = store.save_events(&sub.id) {
                error!(id = %sub.id, error = %e, "failed to persist event");
            }
        }
        self.sessions
            .broadcast(Notice::EventReceived {
                event_id: event_id.clone(),
                subscription_id: sub.id.clone(),
            })
            .await;

        let text = render_envelope(&sub.service, &event_id, &sub.prompt, &summary);
        let handoff = self
            .sessions
            .push(
                &sub.session_id,
                SessionMessage {
                    event_id: event_id.clone(),
                    text,
                },
            )
            .await;

        match handoff {
            Ok(outcome) => {
                let mut delivered = outcome.flushed;
                if outcome.handoff == Handoff::Delivered {
                    delivered.push(event_id.clone());
                }
                self.flip_delivered(&delivered, &sub.session_id).await;

                // One-shot retires on handoff success: the mailbox took
                // the message, whether or not anyone has read it yet.
                if sub.one_shot {
                    self.retire_one_shot(&sub.id).await;
                }
            }
            Err(e) => {
                warn!(
                    id = %sub.id,
                    session_id = %sub.session_id,
                    error = %e,
                    "delivery failed; event stored undelivered"
                );
            }
        }

        info!(id = %sub.id, event_id = %event_id, "webhook accepted");
        IngestOutcome::Accepted
    }

    async fn retire_one_shot(&self, subscription_id: &str) {
        let removed = {
            let mut store = self.store.write().await;
            let removed = store.delete(subscription_id).is_ok();
            if removed {
                if let Err(e) = store.save_subscriptions() {
                    error!(id = subscription_id, error = %e, "failed to persist retirement");
                }
            }
            removed
        };
        if removed {
            info!(id = subscription_id, "one-shot subscription retired");
            self.sessions
                .broadcast(Notice::SubscriptionDeleted {
                    id: subscription_id.to_string(),
                })
                .await;
        }
    }

    /// Mark events delivered, persist the flips, and notify observers.
    async fn flip_delivered(&self, event_ids: &[String], session_id: &str) {
        if event_ids.is_empty() {
            return;
        }
        {
            let mut store = self.store.write().await;
            let mut touched: Vec<String> = Vec::new();
            for event_id in event_ids {
                if let Some(sub_id) = store.mark_delivered(event_id) {
                    if !touched.contains(&sub_id) {
                        touched.push(sub_id);
                    }
                }
            }
            for sub_id in &touched {
                if let Err(e) = store.save_events(sub_id) {
                    error!(subscription_id = %sub_id, error = %e, "failed to persist delivered flags");
                }
            }
        }
        for event_id in event_ids {
            self.sessions
                .broadcast(Notice::EventDelivered {
                    event_id: event_id.clone(),
                    session_id: session_id.to_string(),
                })
                .await;
        }
    }

    // ---------------------------------------------------------------------
    // Subscription registry operations
    // ---------------------------------------------------------------------

    pub async fn create_subscription(
        &self,
        req: CreateSubscription,
    ) -> Result<Subscription, GatewayError> {
        let sub = {
            let mut store = self.store.write().await;
            let sub = store.create(req, &self.local_base)?;
            store.save_subscriptions()?;
            sub
        };
        // The target session is now known; events queue for it even before
        // a consumer attaches.
        self.sessions.register(&sub.session_id).await;
        self.sessions
            .broadcast(Notice::SubscriptionCreated { id: sub.id.clone() })
            .await;
        info!(id = %sub.id, session_id = %sub.session_id, service = %sub.service, "subscription created");
        Ok(sub)
    }

    pub async fn get_subscription(&self, id: &str) -> Result<Subscription, GatewayError> {
        self.store.read().await.get(id).map(Subscription::clone)
    }

    pub async fn list_subscriptions(&self, session_id: Option<&str>) -> Vec<Subscription> {
        self.store
            .read()
            .await
            .list(session_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn update_subscription(
        &self,
        id: &str,
        data: &Value,
    ) -> Result<Subscription, GatewayError> {
        let sub = {
            let mut store = self.store.write().await;
            let sub = store.update(id, data)?;
            store.save_subscriptions()?;
            sub
        };
        if data.get("session_id").is_some() {
            self.sessions.register(&sub.session_id).await;
        }
        self.sessions
            .broadcast(Notice::SubscriptionUpdated { id: sub.id.clone() })
            .await;
        info!(id = %sub.id, "subscription updated");
        Ok(sub)
    }

    pub async fn delete_subscription(&self, id: &str) -> Result<Subscription, GatewayError> {
        let removed = {
            let mut store = self.store.write().await;
            let removed = store.delete(id)?;
            store.save_subscriptions()?;
            removed
        };
        self.sessions
            .broadcast(Notice::SubscriptionDeleted {
                id: removed.id.clone(),
            })
            .await;
        info!(id = %removed.id, "subscription deleted");
        Ok(removed)
    }

    /// Provider-facing URL for a subscription: the tunnel URL when one is
    /// up, the local base otherwise.
    pub async fn webhook_url(&self, id: &str) -> Result<String, GatewayError> {
        let store = self.store.read().await;
        let sub = store.get(id)?;
        let base = self
            .tunnel
            .public_url()
            .unwrap_or_else(|| self.local_base.clone());
        Ok(format!("{base}/webhook/{}", sub.id))
    }

    // ---------------------------------------------------------------------
    // Event store operations
    // ---------------------------------------------------------------------

    /// Full stored event, raw payload included.
    pub async fn event_payload(&self, event_id: &str) -> Result<Event, GatewayError> {
        self.store.read().await.event(event_id).map(Event::clone)
    }

    /// Newest-first stored events for a subscription. Works for deleted
    /// subscriptions too; their events outlive them.
    pub async fn recent_events(&self, subscription_id: &str, limit: usize) -> Vec<Event> {
        self.store
            .read()
            .await
            .recent_events(subscription_id, limit)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn server_info(&self) -> ServerInfo {
        let store = self.store.read().await;
        ServerInfo {
            local_base: self.local_base.clone(),
            data_dir: store.data_dir().display().to_string(),
            subscriptions: store.subscription_count(),
            events: store.event_count(),
            sessions: self.sessions.session_count().await,
            observers: self.sessions.observer_count().await,
            tunnel: self.tunnel.status(),
        }
    }

    // ---------------------------------------------------------------------
    // Session channel operations
    // ---------------------------------------------------------------------

    /// Attach a consumer for a session. Any queued backlog lands in the
    /// returned receiver and is marked delivered.
    pub async fn attach_session(&self, session_id: &str) -> mpsc::Receiver<SessionMessage> {
        let (rx, drained) = self.sessions.attach(session_id).await;
        self.flip_delivered(&drained, session_id).await;
        rx
    }

    pub async fn register_session(&self, session_id: &str) {
        self.sessions.register(session_id).await;
    }

    pub async fn detach_session(&self, session_id: &str) {
        self.sessions.detach(session_id).await;
    }

    /// Subscribe to the control-plane notice stream.
    pub async fn observe(&self) -> mpsc::Receiver<Notice> {
        self.sessions.add_observer().await
    }

    // ---------------------------------------------------------------------
    // Tunnel operations
    // ---------------------------------------------------------------------

    /// Start the configured named tunnel.
    pub async fn tunnel_start(&self) -> Result<TunnelStatus, GatewayError> {
        let Some(mode) = self.named_tunnel.clone() else {
            return Err(GatewayError::validation("no named tunnel configured"));
        };
        self.tunnel.start(mode).await
    }

    /// Start an ephemeral tunnel with a random public hostname.
    pub async fn tunnel_start_quick(&self) -> Result<TunnelStatus, GatewayError> {
        self.tunnel.start(TunnelMode::Quick).await
    }

    pub async fn tunnel_stop(&self) -> TunnelStatus {
        self.tunnel.stop().await
    }

    pub fn tunnel_status(&self) -> TunnelStatus {
        self.tunnel.status()
    }
}
