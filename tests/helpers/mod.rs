//! Reusable helpers for gateway integration tests.
//!
//! `TestGateway` wires a real `Gateway` over a temp data dir and sends
//! requests through the full axum router via `tower::ServiceExt::oneshot`.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tempfile::TempDir;
use tower::ServiceExt;

use webhook_gateway::gateway::Gateway;
use webhook_gateway::http;
use webhook_gateway::store::GatewayStore;
use webhook_gateway::tunnel::{TunnelConfig, TunnelSupervisor};
use webhook_gateway::types::CreateSubscription;

pub const LOCAL_BASE: &str = "http://127.0.0.1:8787";

/// Supervisor that is never started; tests that exercise the tunnel build
/// their own over a fake binary.
pub fn tunnel_stub() -> TunnelSupervisor {
    TunnelSupervisor::new(TunnelConfig {
        binary: "/nonexistent/cloudflared".into(),
        local_url: LOCAL_BASE.into(),
        ready_wait: Duration::from_millis(50),
    })
}

pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    data_dir: TempDir,
}

impl TestGateway {
    pub async fn new() -> Self {
        let data_dir = tempfile::tempdir().expect("tempdir");
        let store = GatewayStore::new(data_dir.path().to_path_buf());
        Self {
            gateway: Arc::new(Gateway::new(store, tunnel_stub(), LOCAL_BASE.into(), None)),
            data_dir,
        }
    }

    pub fn data_path(&self) -> &Path {
        self.data_dir.path()
    }

    /// POST a webhook body through the router and return the status.
    pub async fn post(
        &self,
        subscription_id: &str,
        body: &[u8],
        headers: &[(&str, &str)],
    ) -> StatusCode {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/webhook/{subscription_id}"));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(Body::from(body.to_vec()))
            .expect("request builds");

        let response = http::router(Arc::clone(&self.gateway))
            .oneshot(request)
            .await
            .expect("oneshot request failed");
        response.status()
    }
}

/// A second gateway over an existing data dir, as after a restart. The
/// session channel starts empty, so previously known sessions are unknown
/// again until something registers or attaches.
pub async fn reopened_gateway(dir: &Path) -> Arc<Gateway> {
    let mut store = GatewayStore::new(dir.to_path_buf());
    store.load();
    store.rebase_urls(LOCAL_BASE);
    Arc::new(Gateway::new(store, tunnel_stub(), LOCAL_BASE.into(), None))
}

pub fn subscription(session_id: &str) -> CreateSubscription {
    CreateSubscription {
        session_id: session_id.into(),
        ..Default::default()
    }
}
