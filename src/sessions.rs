//! Session Delivery Channel
//!
//! Hands formatted event text to a specific agent session through a
//! per-session mailbox, and fans control-plane notices out to any attached
//! observers. Order is FIFO within one session id; nothing is promised
//! across sessions.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::tunnel::TunnelState;

/// Most messages a detached session's mailbox will hold. Overflow drops
/// the oldest queued message; the event itself stays stored undelivered.
pub const MAILBOX_CAPACITY: usize = 256;

const OBSERVER_BUFFER: usize = 64;

/// One formatted envelope addressed to a session.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub event_id: String,
    pub text: String,
}

/// Where a pushed message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// A live consumer's channel accepted it.
    Delivered,
    /// Held in the mailbox until a consumer attaches.
    Queued,
}

#[derive(Debug)]
pub struct PushOutcome {
    pub handoff: Handoff,
    /// Event ids of older queued messages flushed to the live consumer
    /// during this push.
    pub flushed: Vec<String>,
}

/// Control-plane notification broadcast to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    SubscriptionCreated { id: String },
    SubscriptionUpdated { id: String },
    SubscriptionDeleted { id: String },
    EventReceived { event_id: String, subscription_id: String },
    EventDelivered { event_id: String, session_id: String },
    TunnelChanged { state: TunnelState, url: Option<String> },
}

#[derive(Default)]
struct Mailbox {
    queued: VecDeque<SessionMessage>,
    consumer: Option<mpsc::Sender<SessionMessage>>,
}

impl Mailbox {
    fn enqueue(&mut self, session_id: &str, message: SessionMessage) {
        if self.queued.len() >= MAILBOX_CAPACITY {
            if let Some(dropped) = self.queued.pop_front() {
                warn!(
                    session_id,
                    event_id = %dropped.event_id,
                    "mailbox full, dropping oldest queued message"
                );
            }
        }
        self.queued.push_back(message);
    }
}

#[derive(Default)]
pub struct SessionChannel {
    mailboxes: Mutex<HashMap<String, Mailbox>>,
    observers: Mutex<Vec<mpsc::Sender<Notice>>>,
}

impl SessionChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a session id known without attaching a consumer. Pushes to it
    /// queue instead of failing.
    pub async fn register(&self, session_id: &str) {
        self.mailboxes
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default();
    }

    /// Push one message to a session.
    ///
    /// Unknown session ids fail; known ones either hand the message to the
    /// live consumer or queue it. Queued backlog is flushed ahead of the
    /// new message so per-session order survives reconnects.
    pub async fn push(
        &self,
        session_id: &str,
        message: SessionMessage,
    ) -> Result<PushOutcome, GatewayError> {
        let mut mailboxes = self.mailboxes.lock().await;
        let Some(mailbox) = mailboxes.get_mut(session_id) else {
            return Err(GatewayError::SessionNotFound(session_id.to_string()));
        };

        let mut flushed = Vec::new();
        let mut live = mailbox.consumer.clone();

        if let Some(tx) = &live {
            while let Some(queued) = mailbox.queued.pop_front() {
                let id = queued.event_id.clone();
                match tx.try_send(queued) {
                    Ok(()) => flushed.push(id),
                    Err(TrySendError::Full(back)) => {
                        mailbox.queued.push_front(back);
                        break;
                    }
                    Err(TrySendError::Closed(back)) => {
                        mailbox.queued.push_front(back);
                        mailbox.consumer = None;
                        live = None;
                        break;
                    }
                }
            }
        }

        let handoff = match (&live, mailbox.queued.is_empty()) {
            (Some(tx), true) => match tx.try_send(message) {
                Ok(()) => Handoff::Delivered,
                Err(TrySendError::Full(back)) => {
                    mailbox.enqueue(session_id, back);
                    Handoff::Queued
                }
                Err(TrySendError::Closed(back)) => {
                    mailbox.consumer = None;
                    mailbox.enqueue(session_id, back);
                    Handoff::Queued
                }
            },
            _ => {
                mailbox.enqueue(session_id, message);
                Handoff::Queued
            }
        };

        Ok(PushOutcome { handoff, flushed })
    }

    /// Attach a consumer for a session, superseding any previous one.
    ///
    /// Queued backlog is drained into the returned receiver up front;
    /// the second element lists the event ids that were drained.
    pub async fn attach(
        &self,
        session_id: &str,
    ) -> (mpsc::Receiver<SessionMessage>, Vec<String>) {
        let mut mailboxes = self.mailboxes.lock().await;
        let mailbox = mailboxes.entry(session_id.to_string()).or_default();

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let mut drained = Vec::new();
        while let Some(queued) = mailbox.queued.pop_front() {
            let id = queued.event_id.clone();
            match tx.try_send(queued) {
                Ok(()) => drained.push(id),
                Err(TrySendError::Full(back)) | Err(TrySendError::Closed(back)) => {
                    mailbox.queued.push_front(back);
                    break;
                }
            }
        }
        mailbox.consumer = Some(tx);
        (rx, drained)
    }

    /// Drop the live consumer; the session stays known and later pushes
    /// queue in its mailbox.
    pub async fn detach(&self, session_id: &str) {
        if let Some(mailbox) = self.mailboxes.lock().await.get_mut(session_id) {
            mailbox.consumer = None;
        }
    }

    /// Subscribe to the control-plane notice stream.
    pub async fn add_observer(&self) -> mpsc::Receiver<Notice> {
        let (tx, rx) = mpsc::channel(OBSERVER_BUFFER);
        self.observers.lock().await.push(tx);
        rx
    }

    /// Best-effort fan-out. Observers that are full or gone are evicted
    /// rather than allowed to hold up the rest.
    pub async fn broadcast(&self, notice: Notice) {
        let snapshot: Vec<mpsc::Sender<Notice>> = self.observers.lock().await.clone();
        let mut dead = Vec::new();
        for observer in &snapshot {
            if observer.try_send(notice.clone()).is_err() {
                dead.push(observer.clone());
            }
        }
        if !dead.is_empty() {
            let mut observers = self.observers.lock().await;
            observers.retain(|o| !dead.iter().any(|d| d.same_channel(o)));
            debug!(evicted = dead.len(), "removed unresponsive observers");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.mailboxes.lock().await.len()
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> SessionMessage {
        SessionMessage {
            event_id: format!("evt_{n:03}"),
            text: format!("message {n}"),
        }
    }

    #[tokio::test]
    async fn push_to_unknown_session_fails() {
        let channel = SessionChannel::new();
        let err = channel.push("never-seen", msg(1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn registered_session_queues_until_attach() {
        let channel = SessionChannel::new();
        channel.register("s1").await;

        for n in 0..3 {
            let outcome = channel.push("s1", msg(n)).await.unwrap();
            assert_eq!(outcome.handoff, Handoff::Queued);
            assert!(outcome.flushed.is_empty());
        }

        let (mut rx, drained) = channel.attach("s1").await;
        assert_eq!(drained, vec!["evt_000", "evt_001", "evt_002"]);
        for n in 0..3 {
            assert_eq!(rx.recv().await.unwrap().event_id, format!("evt_{n:03}"));
        }
    }

    #[tokio::test]
    async fn attached_consumer_gets_direct_delivery() {
        let channel = SessionChannel::new();
        let (mut rx, drained) = channel.attach("s1").await;
        assert!(drained.is_empty());

        let outcome = channel.push("s1", msg(7)).await.unwrap();
        assert_eq!(outcome.handoff, Handoff::Delivered);
        assert_eq!(rx.recv().await.unwrap().text, "message 7");
    }

    #[tokio::test]
    async fn detach_returns_to_queueing() {
        let channel = SessionChannel::new();
        let (_rx, _) = channel.attach("s1").await;
        channel.detach("s1").await;

        let outcome = channel.push("s1", msg(1)).await.unwrap();
        assert_eq!(outcome.handoff, Handoff::Queued);
    }

    #[tokio::test]
    async fn dropped_receiver_detected_on_push() {
        let channel = SessionChannel::new();
        let (rx, _) = channel.attach("s1").await;
        drop(rx);

        let outcome = channel.push("s1", msg(1)).await.unwrap();
        assert_eq!(outcome.handoff, Handoff::Queued);

        // Message survived into the mailbox for the next consumer.
        let (mut rx, drained) = channel.attach("s1").await;
        assert_eq!(drained, vec!["evt_001"]);
        assert_eq!(rx.recv().await.unwrap().event_id, "evt_001");
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let channel = SessionChannel::new();
        channel.register("s1").await;

        for n in 0..MAILBOX_CAPACITY + 2 {
            channel.push("s1", msg(n)).await.unwrap();
        }

        let (mut rx, drained) = channel.attach("s1").await;
        assert_eq!(drained.len(), MAILBOX_CAPACITY);
        // 0 and 1 were dropped to make room.
        assert_eq!(rx.recv().await.unwrap().event_id, "evt_002");
    }

    #[tokio::test]
    async fn backlog_flushes_before_new_message() {
        let channel = SessionChannel::new();
        let (mut rx, _) = channel.attach("s1").await;

        // Fill the consumer channel without reading.
        for n in 0..MAILBOX_CAPACITY {
            let outcome = channel.push("s1", msg(n)).await.unwrap();
            assert_eq!(outcome.handoff, Handoff::Delivered);
        }
        let overflow = channel.push("s1", msg(900)).await.unwrap();
        assert_eq!(overflow.handoff, Handoff::Queued);

        // Make room, then push again: the queued message goes first.
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        let outcome = channel.push("s1", msg(901)).await.unwrap();
        assert_eq!(outcome.handoff, Handoff::Delivered);
        assert_eq!(outcome.flushed, vec!["evt_900"]);

        let mut seen = Vec::new();
        for _ in 0..MAILBOX_CAPACITY {
            seen.push(rx.recv().await.unwrap().event_id);
        }
        assert_eq!(seen[MAILBOX_CAPACITY - 2], "evt_900");
        assert_eq!(seen[MAILBOX_CAPACITY - 1], "evt_901");
    }

    #[tokio::test]
    async fn reattach_supersedes_old_consumer() {
        let channel = SessionChannel::new();
        let (mut old_rx, _) = channel.attach("s1").await;
        let (mut new_rx, _) = channel.attach("s1").await;

        channel.push("s1", msg(1)).await.unwrap();
        assert_eq!(new_rx.recv().await.unwrap().event_id, "evt_001");
        assert!(old_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn broadcast_reaches_all_observers() {
        let channel = SessionChannel::new();
        let mut a = channel.add_observer().await;
        let mut b = channel.add_observer().await;

        channel
            .broadcast(Notice::SubscriptionCreated { id: "sub_1".into() })
            .await;

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                Notice::SubscriptionCreated { id } => assert_eq!(id, "sub_1"),
                other => panic!("unexpected notice {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn gone_observer_is_evicted() {
        let channel = SessionChannel::new();
        let keep = channel.add_observer().await;
        let gone = channel.add_observer().await;
        drop(gone);
        assert_eq!(channel.observer_count().await, 2);

        channel
            .broadcast(Notice::SubscriptionDeleted { id: "sub_1".into() })
            .await;
        assert_eq!(channel.observer_count().await, 1);
        drop(keep);
    }

    #[tokio::test]
    async fn notice_wire_shape() {
        let notice = Notice::EventReceived {
            event_id: "evt_1".into(),
            subscription_id: "sub_1".into(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["kind"], "event_received");
        assert_eq!(json["event_id"], "evt_1");
        assert_eq!(json["subscription_id"], "sub_1");
    }
}
