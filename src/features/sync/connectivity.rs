//! Connectivity tracking and reachability probing.
//!
//! The monitor holds the current online/offline state and notifies watchers
//! on transitions. It does not detect connectivity itself; the host feeds it
//! (the CLI does so from a [`HealthProbe`]).

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::FieldsyncError;

/// Current online/offline state with change notification.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Create a monitor with an initial state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self { state }
    }

    /// Whether the device is currently online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record the current state. Returns whether it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            debug!(online, "Connectivity changed");
        }
        changed
    }

    /// Watch for transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Host hook asked to schedule a background sync after reconnecting.
///
/// Requests are fire-and-forget; the host may ignore them.
pub trait BackgroundSync: Send + Sync {
    /// Ask the host to run a sync identified by `tag` when it sees fit.
    fn request(&self, tag: &str);
}

/// Background sync hook for hosts without a scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBackgroundSync;

impl BackgroundSync for LoggingBackgroundSync {
    fn request(&self, tag: &str) {
        info!(tag, "Background sync requested");
    }
}

/// Coarse link quality derived from probe latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Offline,
}

impl ConnectionQuality {
    /// Classify a successful round trip.
    #[must_use]
    pub fn from_latency(latency: Duration) -> Self {
        match latency.as_millis() {
            0..=99 => Self::Excellent,
            100..=299 => Self::Good,
            300..=999 => Self::Fair,
            _ => Self::Poor,
        }
    }

    /// Whether the server can be reached at all.
    #[must_use]
    pub const fn is_online(self) -> bool {
        !matches!(self, Self::Offline)
    }

    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one reachability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub url: String,
    pub quality: ConnectionQuality,
    /// Round trip time, when the server answered
    pub latency_ms: Option<u64>,
    /// HTTP status, when the server answered
    pub status: Option<u16>,
}

/// Measures reachability of the API with a `HEAD` request.
pub struct HealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HealthProbe {
    /// Create a probe for `{base_url}{health_path}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(server: &ServerConfig) -> Result<Self, FieldsyncError> {
        let client = reqwest::Client::builder()
            .timeout(server.probe_timeout())
            .build()
            .map_err(|e| FieldsyncError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: format!(
                "{}{}",
                server.base_url.trim_end_matches('/'),
                server.health_path
            ),
        })
    }

    /// Probe once.
    ///
    /// Answers with an error status are `Poor`. Connection failures and
    /// timeouts are `Offline`.
    pub async fn probe(&self) -> ProbeReport {
        let started = Instant::now();
        let response = self
            .client
            .head(&self.url)
            .header("X-Offline-Sync", "true")
            .send()
            .await;
        let latency = started.elapsed();

        let (quality, latency_ms, status) = match response {
            Ok(resp) => {
                let status = resp.status();
                let quality = if status.is_success() {
                    ConnectionQuality::from_latency(latency)
                } else {
                    ConnectionQuality::Poor
                };
                let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
                (quality, Some(millis), Some(status.as_u16()))
            }
            Err(e) if e.is_connect() || e.is_timeout() => {
                debug!(url = %self.url, error = %e, "Health probe failed");
                (ConnectionQuality::Offline, None, None)
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Health probe error");
                (ConnectionQuality::Poor, None, None)
            }
        };

        ProbeReport {
            url: self.url.clone(),
            quality,
            latency_ms,
            status,
        }
    }
}
