//! Control-plane tests: registry CRUD and merge semantics, event
//! retrieval, restart persistence, the observer notice stream, and server
//! info.

mod helpers;

use axum::http::HeaderMap;
use serde_json::json;

use helpers::{subscription, TestGateway, LOCAL_BASE};
use webhook_gateway::error::GatewayError;
use webhook_gateway::sessions::Notice;
use webhook_gateway::tunnel::TunnelState;
use webhook_gateway::types::CreateSubscription;

#[tokio::test]
async fn create_fills_defaults_and_derives_url() {
    let gw = TestGateway::new().await;
    let sub = gw
        .gateway
        .create_subscription(subscription("s1"))
        .await
        .unwrap();

    assert!(sub.id.starts_with("sub_"));
    assert_eq!(sub.url, format!("{LOCAL_BASE}/webhook/{}", sub.id));
    assert_eq!(sub.name, "webhook");
    assert_eq!(sub.service, "custom");
    // Tunnel down: the public URL equals the local one.
    assert_eq!(gw.gateway.webhook_url(&sub.id).await.unwrap(), sub.url);
}

#[tokio::test]
async fn create_rejects_missing_session_id() {
    let gw = TestGateway::new().await;
    let err = gw
        .gateway
        .create_subscription(subscription(""))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Validation(_)));
    assert!(gw.gateway.list_subscriptions(None).await.is_empty());
}

#[tokio::test]
async fn partial_update_touches_only_supplied_fields() {
    let gw = TestGateway::new().await;
    let sub = gw
        .gateway
        .create_subscription(CreateSubscription {
            session_id: "s1".into(),
            name: Some("ci".into()),
            prompt: Some("deploy finished".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let updated = gw
        .gateway
        .update_subscription(&sub.id, &json!({"name": "ci-prod"}))
        .await
        .unwrap();
    assert_eq!(updated.name, "ci-prod");
    assert_eq!(updated.prompt, "deploy finished");
    assert_eq!(updated.session_id, sub.session_id);
    assert_eq!(updated.url, sub.url);
    assert_eq!(updated.created_at, sub.created_at);

    // An empty patch is a no-op returning the unchanged record.
    let unchanged = gw
        .gateway
        .update_subscription(&sub.id, &json!({}))
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_value(&unchanged).unwrap(),
        serde_json::to_value(&updated).unwrap()
    );
}

#[tokio::test]
async fn concurrent_updates_on_different_fields_both_apply() {
    let gw = TestGateway::new().await;
    let sub = gw
        .gateway
        .create_subscription(subscription("s1"))
        .await
        .unwrap();

    let left_patch = json!({"name": "left"});
    let right_patch = json!({"prompt": "right"});
    let left = gw.gateway.update_subscription(&sub.id, &left_patch);
    let right = gw.gateway.update_subscription(&sub.id, &right_patch);
    let (left, right) = tokio::join!(left, right);
    left.unwrap();
    right.unwrap();

    let merged = gw.gateway.get_subscription(&sub.id).await.unwrap();
    assert_eq!(merged.name, "left");
    assert_eq!(merged.prompt, "right");
}

#[tokio::test]
async fn update_rejects_unknown_id_and_bad_status() {
    let gw = TestGateway::new().await;
    assert!(matches!(
        gw.gateway
            .update_subscription("sub_nope", &json!({"name": "x"}))
            .await
            .unwrap_err(),
        GatewayError::NotFound { .. }
    ));

    let sub = gw
        .gateway
        .create_subscription(subscription("s1"))
        .await
        .unwrap();
    assert!(matches!(
        gw.gateway
            .update_subscription(&sub.id, &json!({"status": "zzz"}))
            .await
            .unwrap_err(),
        GatewayError::Validation(_)
    ));
}

#[tokio::test]
async fn list_filters_by_session() {
    let gw = TestGateway::new().await;
    gw.gateway
        .create_subscription(subscription("s1"))
        .await
        .unwrap();
    gw.gateway
        .create_subscription(subscription("s2"))
        .await
        .unwrap();
    gw.gateway
        .create_subscription(subscription("s1"))
        .await
        .unwrap();

    assert_eq!(gw.gateway.list_subscriptions(None).await.len(), 3);
    let s1 = gw.gateway.list_subscriptions(Some("s1")).await;
    assert_eq!(s1.len(), 2);
    assert!(s1.iter().all(|s| s.session_id == "s1"));
}

#[tokio::test]
async fn delete_removes_and_errors_on_unknown() {
    let gw = TestGateway::new().await;
    let sub = gw
        .gateway
        .create_subscription(subscription("s1"))
        .await
        .unwrap();

    gw.gateway.delete_subscription(&sub.id).await.unwrap();
    assert!(gw.gateway.get_subscription(&sub.id).await.is_err());
    assert!(matches!(
        gw.gateway.delete_subscription(&sub.id).await.unwrap_err(),
        GatewayError::NotFound { .. }
    ));
}

#[tokio::test]
async fn event_payload_roundtrip_and_recent_order() {
    let gw = TestGateway::new().await;
    let sub = gw
        .gateway
        .create_subscription(subscription("s1"))
        .await
        .unwrap();

    let headers = HeaderMap::new();
    gw.gateway.ingest(&sub.id, &headers, br#"{"n":1}"#).await;
    gw.gateway.ingest(&sub.id, &headers, br#"{"n":2}"#).await;

    let recent = gw.gateway.recent_events(&sub.id, 1).await;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].payload, r#"{"n":2}"#);

    let full = gw.gateway.event_payload(&recent[0].id).await.unwrap();
    assert_eq!(full.payload, r#"{"n":2}"#);
    assert_eq!(full.subscription_id, sub.id);

    assert!(matches!(
        gw.gateway.event_payload("evt_nope").await.unwrap_err(),
        GatewayError::NotFound { .. }
    ));
}

#[tokio::test]
async fn deleted_subscription_keeps_events_retrievable() {
    let gw = TestGateway::new().await;
    let sub = gw
        .gateway
        .create_subscription(subscription("s1"))
        .await
        .unwrap();
    gw.gateway
        .ingest(&sub.id, &HeaderMap::new(), br#"{"n":1}"#)
        .await;
    gw.gateway.delete_subscription(&sub.id).await.unwrap();

    let events = gw.gateway.recent_events(&sub.id, 10).await;
    assert_eq!(events.len(), 1);
    assert!(gw.gateway.event_payload(&events[0].id).await.is_ok());
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = helpers::reopened_gateway(dir.path()).await;
    let sub = first
        .create_subscription(subscription("s1"))
        .await
        .unwrap();
    first
        .update_subscription(&sub.id, &json!({"name": "renamed"}))
        .await
        .unwrap();
    first
        .ingest(&sub.id, &HeaderMap::new(), br#"{"n":1}"#)
        .await;
    drop(first);

    let reopened = helpers::reopened_gateway(dir.path()).await;
    let reloaded = reopened.get_subscription(&sub.id).await.unwrap();
    assert_eq!(reloaded.name, "renamed");
    assert_eq!(reloaded.url, sub.url);

    let events = reopened.recent_events(&sub.id, 10).await;
    assert_eq!(events.len(), 1);
    assert!(!events[0].delivered);
}

#[tokio::test]
async fn notices_flow_to_observers() {
    let gw = TestGateway::new().await;
    let mut notices = gw.gateway.observe().await;

    let sub = gw
        .gateway
        .create_subscription(subscription("s1"))
        .await
        .unwrap();
    match notices.recv().await.unwrap() {
        Notice::SubscriptionCreated { id } => assert_eq!(id, sub.id),
        other => panic!("unexpected notice {other:?}"),
    }

    gw.gateway
        .ingest(&sub.id, &HeaderMap::new(), br#"{"n":1}"#)
        .await;
    let event_id = match notices.recv().await.unwrap() {
        Notice::EventReceived {
            event_id,
            subscription_id,
        } => {
            assert_eq!(subscription_id, sub.id);
            event_id
        }
        other => panic!("unexpected notice {other:?}"),
    };

    // Attach drains the queued message and reports the delivery.
    let _rx = gw.gateway.attach_session("s1").await;
    match notices.recv().await.unwrap() {
        Notice::EventDelivered {
            event_id: delivered,
            session_id,
        } => {
            assert_eq!(delivered, event_id);
            assert_eq!(session_id, "s1");
        }
        other => panic!("unexpected notice {other:?}"),
    }

    gw.gateway
        .update_subscription(&sub.id, &json!({"name": "x"}))
        .await
        .unwrap();
    assert!(matches!(
        notices.recv().await.unwrap(),
        Notice::SubscriptionUpdated { .. }
    ));

    gw.gateway.delete_subscription(&sub.id).await.unwrap();
    assert!(matches!(
        notices.recv().await.unwrap(),
        Notice::SubscriptionDeleted { .. }
    ));
}

#[tokio::test]
async fn detached_session_queues_until_reattach() {
    let gw = TestGateway::new().await;
    let sub = gw
        .gateway
        .create_subscription(subscription("s-detach"))
        .await
        .unwrap();

    let mut rx = gw.gateway.attach_session("s-detach").await;
    gw.gateway.detach_session("s-detach").await;

    gw.gateway
        .ingest(&sub.id, &HeaderMap::new(), br#"{"n":1}"#)
        .await;
    // Nothing reaches the detached consumer.
    assert!(rx.try_recv().is_err());

    // A fresh attach drains the queued message and flips its event.
    let mut rx2 = gw.gateway.attach_session("s-detach").await;
    let message = rx2.recv().await.expect("queued message");
    let event = gw.gateway.event_payload(&message.event_id).await.unwrap();
    assert!(event.delivered);
}

#[tokio::test]
async fn named_tunnel_start_requires_configuration() {
    let gw = TestGateway::new().await;
    let err = gw.gateway.tunnel_start().await.unwrap_err();
    assert!(matches!(err, GatewayError::Validation(_)));
}

#[tokio::test]
async fn server_info_reports_counts() {
    let gw = TestGateway::new().await;
    let sub = gw
        .gateway
        .create_subscription(subscription("s1"))
        .await
        .unwrap();
    gw.gateway
        .ingest(&sub.id, &HeaderMap::new(), br#"{"n":1}"#)
        .await;

    let info = gw.gateway.server_info().await;
    assert_eq!(info.local_base, LOCAL_BASE);
    assert_eq!(info.subscriptions, 1);
    assert_eq!(info.events, 1);
    assert_eq!(info.sessions, 1);
    assert_eq!(info.tunnel.state, TunnelState::Stopped);
    assert_eq!(info.tunnel.url, None);
}
