//! Gateway Configuration
//!
//! Loads configuration from environment variables. Everything has a
//! default; the gateway runs with no environment at all.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::tunnel::{TunnelConfig, TunnelMode};

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP ingress bind address.
    pub bind_address: String,

    /// Directory holding `subscriptions.json` and `events/`.
    pub data_dir: PathBuf,

    /// Tunnel binary to spawn (default: `cloudflared` on PATH).
    pub tunnel_binary: String,

    /// Pre-provisioned tunnel name, for named mode.
    pub tunnel_name: Option<String>,

    /// Public hostname the named tunnel routes to this gateway.
    pub tunnel_hostname: Option<String>,

    /// How long tunnel start waits for readiness before returning
    /// `Starting` (seconds).
    pub tunnel_ready_wait: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_address: env::var("GATEWAY_BIND_ADDRESS")
                .unwrap_or_else(|_| "127.0.0.1:8787".into()),
            data_dir: env::var("GATEWAY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            tunnel_binary: env::var("GATEWAY_TUNNEL_BIN")
                .unwrap_or_else(|_| "cloudflared".into()),
            tunnel_name: env::var("GATEWAY_TUNNEL_NAME").ok(),
            tunnel_hostname: env::var("GATEWAY_TUNNEL_HOSTNAME").ok(),
            tunnel_ready_wait: Duration::from_secs(
                env::var("GATEWAY_TUNNEL_WAIT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
        }
    }

    /// Named-mode tunnel, when both the name and hostname are configured.
    pub fn named_tunnel(&self) -> Option<TunnelMode> {
        match (&self.tunnel_name, &self.tunnel_hostname) {
            (Some(name), Some(hostname)) => Some(TunnelMode::Named {
                name: name.clone(),
                hostname: hostname.clone(),
            }),
            _ => None,
        }
    }

    pub fn tunnel_config(&self, local_url: String) -> TunnelConfig {
        TunnelConfig {
            binary: self.tunnel_binary.clone(),
            local_url,
            ready_wait: self.tunnel_ready_wait,
        }
    }
}
