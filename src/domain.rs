//! Catalog data model: relays and their health-check history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical record for a monitored relay endpoint.
///
/// Every metadata field mirrors the relay's NIP-11 information document and
/// is therefore optional; absent fields persist as NULL, never `""`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    /// Primary key. A `wss://` or `ws://` URL, immutable once created.
    pub url: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub pubkey: Option<String>,
    pub contact: Option<String>,
    pub supported_nips: Vec<i32>,
    pub software: Option<String>,
    pub version: Option<String>,
    pub icon: Option<String>,
    pub banner: Option<String>,
    pub privacy_policy: Option<String>,
    pub terms_of_service: Option<String>,
    pub posting_policy: Option<String>,
    /// Free-text topic tags.
    pub tags: Vec<String>,
    /// BCP-47 / ISO-639 language tags.
    pub language_tags: Vec<String>,
    pub relay_countries: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One append-only health-check observation for a relay.
///
/// At least one of `websocket_success` / `nip11_success` is meaningful for
/// any stored row; a non-null RTT implies the matching success flag, and an
/// error string implies the matching failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub relay_url: String,
    /// Observation time, set by the probe.
    pub created_at: DateTime<Utc>,
    pub websocket_success: bool,
    pub websocket_error: Option<String>,
    /// None when the NIP-11 fetch was not attempted.
    pub nip11_success: Option<bool>,
    pub nip11_error: Option<String>,
    /// Round-trip times in milliseconds.
    pub rtt_open: Option<i32>,
    pub rtt_read: Option<i32>,
    pub rtt_write: Option<i32>,
    pub rtt_nip11: Option<i32>,
}

/// A relay joined with its latest health check, the read-path projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayStatus {
    #[serde(flatten)]
    pub relay: Relay,
    /// Latest `health_checks` row by `created_at`, if any exist.
    pub last_check: Option<HealthCheck>,
}

impl RelayStatus {
    /// Whether the relay answered its most recent WebSocket probe.
    pub fn is_online(&self) -> bool {
        self.last_check
            .as_ref()
            .map(|hc| hc.websocket_success)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(ws: bool) -> HealthCheck {
        HealthCheck {
            relay_url: "wss://relay.example/".into(),
            created_at: Utc::now(),
            websocket_success: ws,
            websocket_error: None,
            nip11_success: Some(ws),
            nip11_error: None,
            rtt_open: ws.then_some(12),
            rtt_read: None,
            rtt_write: None,
            rtt_nip11: ws.then_some(34),
        }
    }

    #[test]
    fn online_reflects_latest_check() {
        let mut status = RelayStatus {
            relay: Relay {
                url: "wss://relay.example/".into(),
                ..Default::default()
            },
            last_check: None,
        };
        assert!(!status.is_online());
        status.last_check = Some(check(true));
        assert!(status.is_online());
        status.last_check = Some(check(false));
        assert!(!status.is_online());
    }
}
