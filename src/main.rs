//! Webhook Gateway - Main Entry Point

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use webhook_gateway::config::Config;
use webhook_gateway::gateway::Gateway;
use webhook_gateway::http;
use webhook_gateway::store::GatewayStore;
use webhook_gateway::tunnel::TunnelSupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webhook_gateway=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting webhook gateway"
    );

    // Bind first: stored webhook URLs get rebased onto whatever address we
    // actually got, which matters when the port is 0.
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    let local_base = format!("http://{}", listener.local_addr()?);
    info!(address = %local_base, "ingress listening");

    let mut store = GatewayStore::new(config.data_dir.clone());
    store.load();
    if store.rebase_urls(&local_base) {
        store.save_subscriptions()?;
    }
    info!(
        subscriptions = store.subscription_count(),
        events = store.event_count(),
        data_dir = %config.data_dir.display(),
        "store loaded"
    );

    let tunnel = TunnelSupervisor::new(config.tunnel_config(local_base.clone()));
    let gateway = Arc::new(Gateway::new(
        store,
        tunnel,
        local_base,
        config.named_tunnel(),
    ));

    let app = http::router(Arc::clone(&gateway));

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        info!("received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    gateway.tunnel_stop().await;
    info!("gateway shutdown complete");

    Ok(())
}
