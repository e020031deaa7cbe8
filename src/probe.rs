//! Timed health probes against a single relay.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::domain::HealthCheck;
use crate::nip11::{self, RelayInformation};

/// Probe for one relay: a timed WebSocket open followed by a timed NIP-11
/// fetch, each bounded independently by the configured timeout.
#[derive(Debug, Clone)]
pub struct RelayProbe {
    timeout: Duration,
}

impl Default for RelayProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayProbe {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }

    /// Set the per-operation timeout for this probe.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run both measurements against `relay_url`.
    ///
    /// Pure measurement: never touches the store and never publishes. A
    /// failed WebSocket open aborts the probe, so the NIP-11 fetch is only
    /// attempted against relays that answered the handshake.
    pub async fn check(&self, relay_url: &str) -> ProbeReport {
        let mut report = ProbeReport::new(relay_url);

        let started = Instant::now();
        match timeout(self.timeout, connect_async(relay_url)).await {
            Ok(Ok((mut ws, _))) => {
                report.rtt_open = Some(started.elapsed().as_millis() as i32);
                report.websocket_success = true;
                info!(url = %relay_url, rtt_ms = report.rtt_open, "websocket open succeeded");
                let _ = ws.close(None).await;
            }
            Ok(Err(e)) => {
                report.websocket_error = Some(e.to_string());
                warn!(url = %relay_url, error = %e, "websocket open failed");
                return report;
            }
            Err(_) => {
                report.websocket_error =
                    Some(format!("timed out after {}s", self.timeout.as_secs()));
                warn!(url = %relay_url, "websocket open timed out");
                return report;
            }
        }

        let started = Instant::now();
        match nip11::fetch(relay_url, self.timeout).await {
            Ok(info) => {
                report.rtt_nip11 = Some(started.elapsed().as_millis() as i32);
                report.nip11_success = Some(true);
                report.info = Some(info);
                debug!(url = %relay_url, rtt_ms = report.rtt_nip11, "nip11 fetch succeeded");
            }
            Err(e) => {
                report.nip11_success = Some(false);
                report.nip11_error = Some(e.to_string());
                warn!(url = %relay_url, error = %e, "nip11 fetch failed");
            }
        }

        report
    }
}

/// Structured result of one probe run.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub relay_url: String,
    pub created_at: DateTime<Utc>,
    pub websocket_success: bool,
    pub websocket_error: Option<String>,
    pub nip11_success: Option<bool>,
    pub nip11_error: Option<String>,
    pub rtt_open: Option<i32>,
    pub rtt_nip11: Option<i32>,
    /// Parsed information document, when the NIP-11 fetch succeeded.
    pub info: Option<RelayInformation>,
}

impl ProbeReport {
    fn new(relay_url: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            created_at: Utc::now(),
            websocket_success: false,
            websocket_error: None,
            nip11_success: None,
            nip11_error: None,
            rtt_open: None,
            rtt_nip11: None,
            info: None,
        }
    }

    /// The report as a persistable health-check row.
    pub fn to_health_check(&self) -> HealthCheck {
        HealthCheck {
            relay_url: self.relay_url.clone(),
            created_at: self.created_at,
            websocket_success: self.websocket_success,
            websocket_error: self.websocket_error.clone(),
            nip11_success: self.nip11_success,
            nip11_error: self.nip11_error.clone(),
            rtt_open: self.rtt_open,
            rtt_read: None,
            rtt_write: None,
            rtt_nip11: self.rtt_nip11,
        }
    }
}
