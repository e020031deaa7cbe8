//! Queue consumer binding probe, store, and publisher together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Settings;
use crate::metrics;
use crate::probe::RelayProbe;
use crate::publisher::EventPublisher;
use crate::queue::{
    AnnouncementPayload, HealthCheckPayload, JobHandler, QueueServer, TYPE_HEALTH_CHECK,
    TYPE_MONITOR_ANNOUNCEMENT,
};
use crate::store::RelayRepository;

/// Port of the Prometheus metrics endpoint.
const METRICS_PORT: u16 = 2112;

/// How long in-flight handlers get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Handler for `relay:healthcheck` jobs.
///
/// Probes the relay, persists the outcome, and publishes the kind-30166
/// status event. Safe to run twice: the metadata update is an upsert and
/// health-check rows are append-only.
pub struct HealthCheckHandler {
    repo: Arc<dyn RelayRepository>,
    probe: RelayProbe,
    publisher: EventPublisher,
}

impl HealthCheckHandler {
    pub fn new(
        repo: Arc<dyn RelayRepository>,
        probe: RelayProbe,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            repo,
            probe,
            publisher,
        }
    }
}

#[async_trait]
impl JobHandler for HealthCheckHandler {
    async fn handle(&self, payload: Value) -> Result<()> {
        let job: HealthCheckPayload =
            serde_json::from_value(payload).context("decoding healthcheck payload")?;
        let url = &job.relay_url;
        info!(url = %url, "health checking");

        let report = self.probe.check(url).await;

        // A relay that refuses the handshake gets no catalog write; the
        // queue's retry covers transient failures.
        if !report.websocket_success {
            return Err(anyhow!(
                "websocket open failed for {url}: {}",
                report.websocket_error.as_deref().unwrap_or("unknown error")
            ));
        }

        if let Some(info) = &report.info {
            self.repo
                .update(&info.clone().into_relay(url))
                .await
                .with_context(|| format!("updating relay info for {url}"))?;
        }

        self.repo
            .save_health_check(&report.to_health_check())
            .await
            .with_context(|| format!("saving health check for {url}"))?;

        // The observation row above is durable either way; a failed NIP-11
        // fetch still surfaces as a handler error so the queue retries.
        let Some(info) = report.info else {
            return Err(anyhow!(
                "nip11 fetch failed for {url}: {}",
                report.nip11_error.as_deref().unwrap_or("unknown error")
            ));
        };

        self.publisher
            .publish_relay_status(url, report.rtt_open, &info)
            .await
            .with_context(|| format!("publishing status event for {url}"))?;

        Ok(())
    }
}

/// Handler for `relay:announcement` jobs.
pub struct AnnouncementHandler {
    publisher: EventPublisher,
    probe_timeout: Duration,
}

impl AnnouncementHandler {
    pub fn new(publisher: EventPublisher, probe_timeout: Duration) -> Self {
        Self {
            publisher,
            probe_timeout,
        }
    }
}

#[async_trait]
impl JobHandler for AnnouncementHandler {
    async fn handle(&self, payload: Value) -> Result<()> {
        let job: AnnouncementPayload =
            serde_json::from_value(payload).context("decoding announcement payload")?;
        self.publisher
            .publish_announcement(&job.frequency, self.probe_timeout.as_secs())
            .await
            .context("publishing monitor announcement")?;
        Ok(())
    }
}

/// Long-lived worker process: metrics endpoint, queue consumers, signals.
pub struct Worker {
    settings: Settings,
    repo: Arc<dyn RelayRepository>,
}

impl Worker {
    pub fn new(settings: Settings, repo: Arc<dyn RelayRepository>) -> Self {
        Self { settings, repo }
    }

    /// Run until SIGINT/SIGTERM, then drain in-flight handlers.
    pub async fn run(&self) -> Result<()> {
        if let Ok(pubkey) = crate::event::derive_public_key(&self.settings.monitor_private_key) {
            info!(%pubkey, "monitor identity");
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let metrics_addr: SocketAddr = ([0, 0, 0, 0], METRICS_PORT).into();
        let mut metrics_shutdown = shutdown_rx.clone();
        let metrics_task = tokio::spawn(async move {
            metrics::serve_metrics(metrics_addr, async move {
                let _ = metrics_shutdown.wait_for(|stopped| *stopped).await;
            })
            .await
        });

        let probe = RelayProbe::new().with_timeout(self.settings.probe_timeout);
        let publisher = EventPublisher::new(
            self.settings.monitor_private_key.clone(),
            self.settings.monitor_relay.clone(),
        )
        .with_timeout(self.settings.probe_timeout);

        let mut server = QueueServer::connect(&self.settings.redis_url())
            .await?
            .with_concurrency(10);
        server.register(
            TYPE_HEALTH_CHECK,
            Arc::new(HealthCheckHandler::new(
                self.repo.clone(),
                probe.clone(),
                publisher.clone(),
            )),
        );
        server.register(
            TYPE_MONITOR_ANNOUNCEMENT,
            Arc::new(AnnouncementHandler::new(
                publisher,
                self.settings.probe_timeout,
            )),
        );
        let queue_task = tokio::spawn(server.run(shutdown_rx));

        wait_for_signal().await?;
        info!("shutting down worker");
        let _ = shutdown_tx.send(true);

        match tokio::time::timeout(SHUTDOWN_GRACE, queue_task).await {
            Ok(joined) => joined.context("queue server task panicked")??,
            Err(_) => warn!("grace window elapsed with handlers still in flight"),
        }
        let _ = metrics_task.await;
        info!("worker stopped");
        Ok(())
    }
}

/// Resolve on SIGINT or SIGTERM.
pub async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("installing SIGINT handler")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("installing SIGINT handler")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::store::memory::MemoryRelayStore;
    use axum::{
        extract::ws::WebSocketUpgrade, http::StatusCode, response::IntoResponse, routing::get,
        Router,
    };
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    const SK: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    /// One-port mock relay speaking both the WebSocket upgrade and NIP-11.
    async fn spawn_probed_relay(nip11_body: &'static str, nip11_status: StatusCode) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/",
            get(move |ws: Option<WebSocketUpgrade>| async move {
                match ws {
                    Some(ws) => ws.on_upgrade(|_socket| async {}).into_response(),
                    None => (nip11_status, nip11_body).into_response(),
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        format!("ws://{}/", addr)
    }

    /// Mock announcement relay accepting one EVENT and returning it.
    async fn spawn_announcement_relay() -> (String, tokio::task::JoinHandle<Event>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let event = loop {
                match ws.next().await.unwrap().unwrap() {
                    TMsg::Text(txt) => {
                        let val: Value = serde_json::from_str(&txt).unwrap();
                        break serde_json::from_value::<Event>(val[1].clone()).unwrap();
                    }
                    _ => continue,
                }
            };
            let reply = json!(["OK", event.id, true, ""]);
            ws.send(TMsg::Text(reply.to_string())).await.unwrap();
            event
        });
        (format!("ws://{}", addr), handle)
    }

    fn handler(
        repo: Arc<MemoryRelayStore>,
        monitor_relay: &str,
    ) -> HealthCheckHandler {
        HealthCheckHandler::new(
            repo,
            RelayProbe::new().with_timeout(Duration::from_secs(5)),
            EventPublisher::new(SK, monitor_relay).with_timeout(Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn happy_path_persists_and_publishes() {
        let relay_url =
            spawn_probed_relay(r#"{"name":"X","supported_nips":[1,11]}"#, StatusCode::OK).await;
        let (monitor_relay, announce) = spawn_announcement_relay().await;
        let repo = Arc::new(MemoryRelayStore::new());
        let h = handler(repo.clone(), &monitor_relay);

        h.handle(json!({ "relayURL": relay_url })).await.unwrap();

        let status = repo.find_by_url(&relay_url).await.unwrap();
        assert_eq!(status.relay.name.as_deref(), Some("X"));
        assert_eq!(status.relay.supported_nips, vec![1, 11]);
        let hc = status.last_check.unwrap();
        assert!(hc.websocket_success);
        assert_eq!(hc.nip11_success, Some(true));
        assert!(hc.rtt_open.is_some());
        assert!(hc.rtt_nip11.is_some());
        assert_eq!(repo.check_count(&relay_url), 1);

        let event = announce.await.unwrap();
        assert_eq!(event.kind, 30166);
        let tags: Vec<Vec<String>> = event.tags.iter().map(|t| t.0.clone()).collect();
        assert!(tags.contains(&vec!["d".to_string(), relay_url.clone()]));
        assert!(tags.contains(&vec!["N".to_string(), "1".to_string()]));
        assert!(tags.contains(&vec!["N".to_string(), "11".to_string()]));
    }

    #[tokio::test]
    async fn websocket_failure_writes_nothing_and_errors() {
        let repo = Arc::new(MemoryRelayStore::new());
        let h = handler(repo.clone(), "ws://127.0.0.1:1");

        let err = h
            .handle(json!({ "relayURL": "ws://127.0.0.1:1/" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("websocket open failed"));
        assert_eq!(repo.relay_count(), 0);
        assert_eq!(repo.check_count("ws://127.0.0.1:1/"), 0);
    }

    #[tokio::test]
    async fn nip11_failure_still_records_the_observation() {
        let relay_url = spawn_probed_relay("boom", StatusCode::INTERNAL_SERVER_ERROR).await;
        let repo = Arc::new(MemoryRelayStore::new());
        let h = handler(repo.clone(), "ws://127.0.0.1:1");

        let err = h.handle(json!({ "relayURL": relay_url })).await.unwrap_err();
        assert!(err.to_string().contains("nip11 fetch failed"));

        // No document, so no metadata upsert; the observation row exists.
        assert_eq!(repo.relay_count(), 0);
        assert_eq!(repo.check_count(&relay_url), 1);
    }

    #[tokio::test]
    async fn mixed_numeric_nips_are_stored_as_integers() {
        let relay_url =
            spawn_probed_relay(r#"{"supported_nips":[1,2.0,11]}"#, StatusCode::OK).await;
        let (monitor_relay, announce) = spawn_announcement_relay().await;
        let repo = Arc::new(MemoryRelayStore::new());
        let h = handler(repo.clone(), &monitor_relay);

        h.handle(json!({ "relayURL": relay_url })).await.unwrap();
        let status = repo.find_by_url(&relay_url).await.unwrap();
        assert_eq!(status.relay.supported_nips, vec![1, 2, 11]);
        announce.await.unwrap();
    }

    #[tokio::test]
    async fn bad_payload_is_an_error() {
        let repo = Arc::new(MemoryRelayStore::new());
        let h = handler(repo, "ws://127.0.0.1:1");
        assert!(h.handle(json!({ "nope": true })).await.is_err());
    }

    #[tokio::test]
    async fn announcement_handler_publishes_policy_event() {
        let (monitor_relay, announce) = spawn_announcement_relay().await;
        let h = AnnouncementHandler::new(
            EventPublisher::new(SK, monitor_relay).with_timeout(Duration::from_secs(5)),
            Duration::from_secs(10),
        );
        h.handle(json!({ "frequency": "604800" })).await.unwrap();
        let event = announce.await.unwrap();
        assert_eq!(event.kind, 10166);
        let tags: Vec<Vec<String>> = event.tags.iter().map(|t| t.0.clone()).collect();
        assert_eq!(
            tags,
            vec![
                vec!["frequency".to_string(), "604800".to_string()],
                vec!["c".to_string(), "ws".to_string()],
                vec!["c".to_string(), "nip11".to_string()],
                vec!["timeout".to_string(), "10".to_string(), "open".to_string()],
                vec!["timeout".to_string(), "10".to_string(), "nip11".to_string()],
            ]
        );
    }
}
