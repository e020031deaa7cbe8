//! Signing and publishing of NIP-66 monitor events.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::info;

use crate::event::{sign_event, Event, Tag};
use crate::nip11::RelayInformation;

/// Kind for per-relay status announcements (parameterised replaceable).
pub const KIND_RELAY_STATUS: u32 = 30166;
/// Kind for the monitor's own announcement (replaceable).
pub const KIND_MONITOR_ANNOUNCEMENT: u32 = 10166;

/// Publishes signed monitor events to the configured announcement relay.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    private_key: String,
    relay_url: String,
    timeout: Duration,
}

impl EventPublisher {
    pub fn new(private_key: impl Into<String>, relay_url: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            relay_url: relay_url.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Set the timeout for connecting and awaiting the relay's OK.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sign and publish a kind-30166 status event for `relay_url`.
    pub async fn publish_relay_status(
        &self,
        relay_url: &str,
        rtt_open: Option<i32>,
        info: &RelayInformation,
    ) -> Result<Event> {
        let tags = relay_status_tags(relay_url, rtt_open, info);
        let ev = sign_event(
            KIND_RELAY_STATUS,
            Utc::now().timestamp() as u64,
            tags,
            String::new(),
            &self.private_key,
        )?;
        self.publish(&ev).await?;
        Ok(ev)
    }

    /// Sign and publish the kind-10166 monitor announcement.
    pub async fn publish_announcement(&self, frequency: &str, timeout_secs: u64) -> Result<Event> {
        let tags = announcement_tags(frequency, timeout_secs);
        let ev = sign_event(
            KIND_MONITOR_ANNOUNCEMENT,
            Utc::now().timestamp() as u64,
            tags,
            String::new(),
            &self.private_key,
        )?;
        self.publish(&ev).await?;
        Ok(ev)
    }

    /// Send `["EVENT", ev]` to the announcement relay and await its OK.
    pub async fn publish(&self, ev: &Event) -> Result<()> {
        tokio::time::timeout(self.timeout, self.publish_inner(ev))
            .await
            .map_err(|_| anyhow!("publishing to {} timed out", self.relay_url))?
    }

    async fn publish_inner(&self, ev: &Event) -> Result<()> {
        let (mut ws, _) = connect_async(&self.relay_url)
            .await
            .with_context(|| format!("connecting to monitor relay {}", self.relay_url))?;
        let msg = json!(["EVENT", ev]);
        ws.send(Message::Text(msg.to_string())).await?;
        while let Some(msg) = ws.next().await {
            match msg? {
                Message::Text(txt) => {
                    if let Ok(val) = serde_json::from_str::<Value>(&txt) {
                        if let Some(arr) = val.as_array() {
                            if arr.first().and_then(|v| v.as_str()) == Some("OK")
                                && arr.get(1).and_then(|v| v.as_str()) == Some(&ev.id)
                            {
                                if arr.get(2).and_then(|v| v.as_bool()) == Some(true) {
                                    info!(kind = ev.kind, id = %ev.id, "event accepted");
                                    return Ok(());
                                }
                                let reason =
                                    arr.get(3).and_then(|v| v.as_str()).unwrap_or_default();
                                return Err(anyhow!("relay rejected event {}: {reason}", ev.id));
                            }
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(anyhow!("connection closed before OK for event {}", ev.id))
    }
}

/// Assemble the kind-30166 tag set for a relay's status.
pub fn relay_status_tags(relay_url: &str, rtt_open: Option<i32>, info: &RelayInformation) -> Vec<Tag> {
    let rtt = rtt_open.unwrap_or(0).to_string();
    let mut tags = vec![
        Tag::new(["d", relay_url]),
        Tag::new(["n", "clearnet"]),
        Tag::new(["rtt-open", rtt.as_str()]),
    ];
    for nip in &info.supported_nips {
        tags.push(Tag::new(["N", nip.to_string().as_str()]));
    }
    let limitation = info.limitation.clone().unwrap_or_default();
    tags.push(requirement_tag("payment", limitation.payment_required));
    tags.push(requirement_tag("auth", limitation.auth_required));
    for topic in &info.tags {
        tags.push(Tag::new(["t", topic.as_str()]));
    }
    for lang in &info.language_tags {
        tags.push(Tag::new(["l", lang.as_str(), language_standard(lang)]));
    }
    tags
}

/// Assemble the kind-10166 tag set describing this monitor's policy.
pub fn announcement_tags(frequency: &str, timeout_secs: u64) -> Vec<Tag> {
    let timeout = timeout_secs.to_string();
    vec![
        Tag::new(["frequency", frequency]),
        Tag::new(["c", "ws"]),
        Tag::new(["c", "nip11"]),
        Tag::new(["timeout", timeout.as_str(), "open"]),
        Tag::new(["timeout", timeout.as_str(), "nip11"]),
    ]
}

/// An `R` requirement tag, negated with `!` when the requirement is absent.
fn requirement_tag(name: &str, required: Option<bool>) -> Tag {
    if required.unwrap_or(false) {
        Tag::new(["R", name])
    } else {
        Tag::new(["R", format!("!{name}").as_str()])
    }
}

/// Label a relay language tag with the standard it belongs to.
pub fn language_standard(lang: &str) -> &'static str {
    if lang == "*" {
        "BCP-47"
    } else if lang.len() == 2 {
        "ISO-639-1"
    } else if lang.len() == 3 {
        "ISO-639-2"
    } else {
        // Region-qualified tags like en-US, and anything else, are BCP-47.
        "BCP-47"
    }
}
