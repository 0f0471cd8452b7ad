//! Tunnel Supervisor
//!
//! Runs the outbound-tunnel subprocess (cloudflared) that gives the gateway
//! a public ingress URL, and tracks its lifecycle:
//! `Stopped → Starting → Active`, with `Failed` on spawn errors or an
//! unexpected exit. The public URL is learned by scanning the subprocess's
//! output for its readiness line. There is no automatic restart; callers
//! observe `Failed` and decide.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::GatewayError;

/// Quick tunnels print a fresh random hostname under this domain.
const QUICK_URL_PATTERN: &str = r"https://[a-zA-Z0-9-]+\.trycloudflare\.com";

/// Named tunnels never print their hostname; this line marks readiness.
const NAMED_READY_MARKER: &str = "Registered tunnel connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Stopped,
    Starting,
    Active,
    Failed,
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TunnelMode {
    /// Ephemeral tunnel with a random public hostname.
    Quick,
    /// Pre-provisioned tunnel with a stable hostname.
    Named { name: String, hostname: String },
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Tunnel binary to spawn.
    pub binary: String,
    /// Local address quick tunnels expose.
    pub local_url: String,
    /// How long `start` waits for the readiness line before handing the
    /// still-`Starting` status back to the caller.
    pub ready_wait: Duration,
}

struct Inner {
    child: Option<Child>,
    /// Bumped on every spawn and stop; output-scanner tasks from earlier
    /// generations compare against it and stand down.
    epoch: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    status_tx: watch::Sender<TunnelStatus>,
}

pub struct TunnelSupervisor {
    config: TunnelConfig,
    shared: Arc<Shared>,
}

impl TunnelSupervisor {
    pub fn new(config: TunnelConfig) -> Self {
        let (status_tx, _) = watch::channel(TunnelStatus {
            state: TunnelState::Stopped,
            url: None,
        });
        Self {
            config,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    child: None,
                    epoch: 0,
                }),
                status_tx,
            }),
        }
    }

    /// Start the tunnel, or return the cached URL if it is already up.
    ///
    /// Single-flight: the spawn happens under the supervisor lock, so
    /// concurrent callers share one subprocess. Waits up to
    /// `config.ready_wait` for the readiness line; if none appears the
    /// returned status is still `Starting` and the caller polls.
    pub async fn start(&self, mode: TunnelMode) -> Result<TunnelStatus, GatewayError> {
        {
            let mut inner = self.shared.inner.lock().await;
            let current = self.shared.status_tx.borrow().clone();
            match current.state {
                TunnelState::Active => return Ok(current),
                TunnelState::Starting => {}
                TunnelState::Stopped | TunnelState::Failed => {
                    self.spawn_locked(&mut inner, &mode)?;
                }
            }
        }
        Ok(self.wait_ready().await)
    }

    /// Kill the subprocess and clear the cached URL. Always lands on
    /// `Stopped`, whatever state came before.
    pub async fn stop(&self) -> TunnelStatus {
        let mut inner = self.shared.inner.lock().await;
        inner.epoch += 1;
        if let Some(mut child) = inner.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "tunnel process already gone");
            }
        }
        self.shared.status_tx.send_modify(|s| {
            s.state = TunnelState::Stopped;
            s.url = None;
        });
        info!("tunnel stopped");
        self.shared.status_tx.borrow().clone()
    }

    pub fn status(&self) -> TunnelStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.status().state == TunnelState::Active
    }

    pub fn public_url(&self) -> Option<String> {
        self.status().url
    }

    /// Watch every status transition. Used for the control-plane notice
    /// stream.
    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.shared.status_tx.subscribe()
    }

    fn spawn_locked(&self, inner: &mut Inner, mode: &TunnelMode) -> Result<(), GatewayError> {
        inner.epoch += 1;
        let epoch = inner.epoch;

        let mut cmd = Command::new(&self.config.binary);
        match mode {
            TunnelMode::Quick => {
                cmd.args(["tunnel", "--no-autoupdate", "--url", &self.config.local_url]);
            }
            TunnelMode::Named { name, .. } => {
                cmd.args(["tunnel", "--no-autoupdate", "run", name]);
            }
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.shared.status_tx.send_modify(|s| {
                    s.state = TunnelState::Failed;
                    s.url = None;
                });
                return Err(GatewayError::Tunnel(format!(
                    "failed to spawn {}: {e}",
                    self.config.binary
                )));
            }
        };

        let matcher = match mode {
            TunnelMode::Quick => LineMatcher::Quick(
                Regex::new(QUICK_URL_PATTERN).expect("readiness pattern compiles"),
            ),
            TunnelMode::Named { hostname, .. } => LineMatcher::Named {
                hostname: hostname.clone(),
            },
        };

        // cloudflared writes its readiness banner to stderr; scan both
        // streams with the same matcher.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(scan_stream(
                Arc::clone(&self.shared),
                stdout,
                matcher.clone(),
                epoch,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(scan_stream(Arc::clone(&self.shared), stderr, matcher, epoch));
        }

        inner.child = Some(child);
        self.shared.status_tx.send_modify(|s| {
            s.state = TunnelState::Starting;
            s.url = None;
        });
        info!(mode = ?mode, "tunnel starting");
        Ok(())
    }

    async fn wait_ready(&self) -> TunnelStatus {
        let mut rx = self.shared.status_tx.subscribe();
        let _ = tokio::time::timeout(
            self.config.ready_wait,
            rx.wait_for(|s| s.state != TunnelState::Starting),
        )
        .await;
        self.status()
    }
}

#[derive(Clone)]
enum LineMatcher {
    Quick(Regex),
    Named { hostname: String },
}

impl LineMatcher {
    fn url_in(&self, line: &str) -> Option<String> {
        match self {
            Self::Quick(re) => re.find(line).map(|m| m.as_str().to_string()),
            Self::Named { hostname } => line
                .contains(NAMED_READY_MARKER)
                .then(|| format!("https://{hostname}")),
        }
    }
}

async fn scan_stream<R>(shared: Arc<Shared>, stream: R, matcher: LineMatcher, epoch: u64)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    // Keep draining after the match so the pipe never backs up and EOF
    // still reports the exit.
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(url) = matcher.url_in(&line) {
            let inner = shared.inner.lock().await;
            if inner.epoch == epoch && shared.status_tx.borrow().state == TunnelState::Starting {
                info!(%url, "tunnel ready");
                shared.status_tx.send_modify(|s| {
                    s.state = TunnelState::Active;
                    s.url = Some(url);
                });
            }
        }
    }

    let mut inner = shared.inner.lock().await;
    if inner.epoch == epoch {
        let state = shared.status_tx.borrow().state;
        if matches!(state, TunnelState::Starting | TunnelState::Active) {
            warn!("tunnel process exited unexpectedly");
            inner.child = None;
            shared.status_tx.send_modify(|s| {
                s.state = TunnelState::Failed;
                s.url = None;
            });
        }
    }
}
