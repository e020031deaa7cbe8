//! Thin JSON API backing the dashboard.

use anyhow::Result;
use axum::{
    extract::{Query as AxumQuery, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tracing::error;

use crate::domain::RelayStatus;
use crate::store::{ListOptions, RelayRepository, StoreError};

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// Start the dashboard HTTP server on `addr`.
pub async fn serve_http(
    addr: SocketAddr,
    repo: Arc<dyn RelayRepository>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/relays", get(list_relays))
        .route("/relay", get(relay_detail))
        .with_state(repo);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// Row shape consumed by the dashboard table.
#[derive(Debug, Serialize, Deserialize)]
struct RelayRow {
    url: String,
    name: Option<String>,
    is_online: bool,
    websocket_success: bool,
    nip11_success: Option<bool>,
    rtt_open: Option<i32>,
    rtt_nip11: Option<i32>,
    last_check_time: Option<String>,
}

impl From<RelayStatus> for RelayRow {
    fn from(status: RelayStatus) -> Self {
        let is_online = status.is_online();
        let hc = status.last_check;
        Self {
            url: status.relay.url,
            name: status.relay.name,
            is_online,
            websocket_success: hc.as_ref().map(|h| h.websocket_success).unwrap_or(false),
            nip11_success: hc.as_ref().and_then(|h| h.nip11_success),
            rtt_open: hc.as_ref().and_then(|h| h.rtt_open),
            rtt_nip11: hc.as_ref().and_then(|h| h.rtt_nip11),
            last_check_time: hc.map(|h| h.created_at.to_rfc3339()),
        }
    }
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<i64>,
    offset: Option<i64>,
    urls: Option<String>,
}

/// List relays with their latest health checks.
async fn list_relays(
    State(repo): State<Arc<dyn RelayRepository>>,
    AxumQuery(params): AxumQuery<ListParams>,
) -> axum::response::Response {
    let urls = params.urls.map(|s| {
        s.split(',')
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect::<Vec<_>>()
    });
    let opts = ListOptions {
        limit: params.limit,
        offset: params.offset,
        urls,
    };
    match repo.list(Some(opts)).await {
        Ok(statuses) => {
            let rows: Vec<RelayRow> = statuses.into_iter().map(RelayRow::from).collect();
            (
                [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
                Json(rows),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "listing relays failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct DetailParams {
    url: String,
}

/// Full relay record with its latest health check.
async fn relay_detail(
    State(repo): State<Arc<dyn RelayRepository>>,
    AxumQuery(params): AxumQuery<DetailParams>,
) -> axum::response::Response {
    match repo.find_by_url(&params.url).await {
        Ok(status) => (
            [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
            Json(status),
        )
            .into_response(),
        Err(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(error = %e, url = %params.url, "finding relay failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HealthCheck, Relay};
    use crate::store::memory::MemoryRelayStore;
    use chrono::Utc;
    use reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN;
    use std::time::Duration;

    async fn spawn_server(repo: Arc<MemoryRelayStore>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let repo: Arc<dyn RelayRepository> = repo;
        tokio::spawn(async move {
            serve_http(addr, repo, std::future::pending()).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        format!("http://{}", addr)
    }

    async fn seeded_repo() -> Arc<MemoryRelayStore> {
        let repo = Arc::new(MemoryRelayStore::new());
        repo.create(&Relay {
            url: "wss://relay.example/".into(),
            name: Some("Example".into()),
            ..Default::default()
        })
        .await
        .unwrap();
        repo.save_health_check(&HealthCheck {
            relay_url: "wss://relay.example/".into(),
            created_at: Utc::now(),
            websocket_success: true,
            websocket_error: None,
            nip11_success: Some(true),
            nip11_error: None,
            rtt_open: Some(12),
            rtt_read: None,
            rtt_write: None,
            rtt_nip11: Some(34),
        })
        .await
        .unwrap();
        repo
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let base = spawn_server(Arc::new(MemoryRelayStore::new())).await;
        let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert!(resp.status().is_success());
        let health: Health = resp.json().await.unwrap();
        assert_eq!(health.status, "ok");
    }

    #[tokio::test]
    async fn relays_returns_rows_with_latest_check() {
        let base = spawn_server(seeded_repo().await).await;
        let resp = reqwest::get(format!("{base}/relays")).await.unwrap();
        assert_eq!(
            resp.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        let rows: Vec<RelayRow> = resp.json().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].url, "wss://relay.example/");
        assert!(rows[0].is_online);
        assert_eq!(rows[0].rtt_open, Some(12));
        assert_eq!(rows[0].rtt_nip11, Some(34));
        assert!(rows[0].last_check_time.is_some());
    }

    #[tokio::test]
    async fn relays_honors_urls_filter_order() {
        let repo = Arc::new(MemoryRelayStore::new());
        for i in 0..3 {
            repo.create(&Relay {
                url: format!("wss://r{i}.example/"),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let base = spawn_server(repo).await;
        let resp = reqwest::get(format!(
            "{base}/relays?urls=wss://r2.example/,wss://r0.example/"
        ))
        .await
        .unwrap();
        let rows: Vec<RelayRow> = resp.json().await.unwrap();
        let urls: Vec<&str> = rows.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["wss://r2.example/", "wss://r0.example/"]);
    }

    #[tokio::test]
    async fn relay_detail_round_trip() {
        let base = spawn_server(seeded_repo().await).await;
        let resp = reqwest::get(format!("{base}/relay?url=wss://relay.example/"))
            .await
            .unwrap();
        assert!(resp.status().is_success());
        let status: RelayStatus = resp.json().await.unwrap();
        assert_eq!(status.relay.name.as_deref(), Some("Example"));
        assert!(status.last_check.unwrap().websocket_success);
    }

    #[tokio::test]
    async fn missing_relay_is_404() {
        let base = spawn_server(Arc::new(MemoryRelayStore::new())).await;
        let resp = reqwest::get(format!("{base}/relay?url=wss://nope.example/"))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
