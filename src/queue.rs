//! Redis-backed task queue with at-least-once delivery and retry.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::metrics;

/// Job type for per-relay health checks.
pub const TYPE_HEALTH_CHECK: &str = "relay:healthcheck";
/// Job type for the monitor's announcement.
pub const TYPE_MONITOR_ANNOUNCEMENT: &str = "relay:announcement";

const PENDING_KEY: &str = "relaymon:tasks:pending";
const PROCESSING_KEY: &str = "relaymon:tasks:processing";
const DEAD_KEY: &str = "relaymon:tasks:dead";

/// Attempts before an envelope is parked on the dead-letter list.
const MAX_ATTEMPTS: u32 = 5;

/// Payload of a `relay:healthcheck` job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckPayload {
    #[serde(rename = "relayURL")]
    pub relay_url: String,
}

/// Payload of a `relay:announcement` job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnouncementPayload {
    /// Monitoring frequency in seconds, as decimal digits.
    pub frequency: String,
}

/// Wire envelope carried on the Redis lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub kind: String,
    pub payload: Value,
    #[serde(default)]
    pub attempt: u32,
}

/// Consumer-side job handler, one per job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<()>;
}

/// Producer-side contract used by the scheduler.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue_job(&self, kind: &str, payload: Value) -> Result<()>;
}

#[async_trait]
impl Enqueuer for TaskQueue {
    async fn enqueue_job(&self, kind: &str, payload: Value) -> Result<()> {
        self.enqueue(kind, &payload).await
    }
}

/// Producer half of the queue.
#[derive(Clone)]
pub struct TaskQueue {
    conn: ConnectionManager,
}

impl TaskQueue {
    /// Connect a producer to the queue backend.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("parsing redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connecting to redis")?;
        Ok(Self { conn })
    }

    /// Serialize `payload` and push one job of `kind` onto the queue.
    pub async fn enqueue<T: Serialize>(&self, kind: &str, payload: &T) -> Result<()> {
        let envelope = Envelope {
            kind: kind.to_string(),
            payload: serde_json::to_value(payload)?,
            attempt: 0,
        };
        let raw = serde_json::to_string(&envelope)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(PENDING_KEY, raw)
            .await
            .with_context(|| format!("enqueueing {kind} job"))?;
        Ok(())
    }
}

/// What to do with an envelope after its handler ran.
#[derive(Debug)]
enum Disposition {
    Done,
    Retry(Envelope),
    Dead(Envelope),
}

/// Run one envelope through its registered handler, maintaining the task
/// metrics around the dispatch.
async fn run_envelope(
    handlers: &HashMap<String, Arc<dyn JobHandler>>,
    mut envelope: Envelope,
) -> Disposition {
    let Some(handler) = handlers.get(&envelope.kind) else {
        warn!(kind = %envelope.kind, "no handler registered for job kind");
        return Disposition::Dead(envelope);
    };

    metrics::IN_PROGRESS_TASKS
        .with_label_values(&[&envelope.kind])
        .inc();
    let result = handler.handle(envelope.payload.clone()).await;
    metrics::IN_PROGRESS_TASKS
        .with_label_values(&[&envelope.kind])
        .dec();
    metrics::PROCESSED_TASKS
        .with_label_values(&[&envelope.kind])
        .inc();

    match result {
        Ok(()) => Disposition::Done,
        Err(e) => {
            metrics::FAILED_TASKS
                .with_label_values(&[&envelope.kind])
                .inc();
            envelope.attempt += 1;
            if envelope.attempt < MAX_ATTEMPTS {
                warn!(
                    kind = %envelope.kind,
                    attempt = envelope.attempt,
                    error = %e,
                    "job failed, requeueing"
                );
                Disposition::Retry(envelope)
            } else {
                error!(kind = %envelope.kind, error = %e, "job exhausted its attempts");
                Disposition::Dead(envelope)
            }
        }
    }
}

/// Consumer half: a pool of workers dispatching jobs by kind.
pub struct QueueServer {
    conn: ConnectionManager,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    concurrency: usize,
}

impl QueueServer {
    /// Connect a consumer with the default worker pool size of 10.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("parsing redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connecting to redis")?;
        Ok(Self {
            conn,
            handlers: HashMap::new(),
            concurrency: 10,
        })
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Register the handler for one job kind.
    pub fn register(&mut self, kind: &str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind.to_string(), handler);
    }

    /// Run the worker pool until `shutdown` flips to true, then drain
    /// in-flight handlers.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let handlers = Arc::new(self.handlers);
        let mut workers = JoinSet::new();
        for worker_id in 0..self.concurrency {
            let conn = self.conn.clone();
            let handlers = handlers.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                worker_loop(worker_id, conn, handlers, shutdown).await;
            });
        }
        info!(concurrency = self.concurrency, "queue server started");
        while workers.join_next().await.is_some() {}
        info!("queue server stopped");
        Ok(())
    }
}

/// One consumer: pop, dispatch, acknowledge, requeue on failure.
async fn worker_loop(
    worker_id: usize,
    mut conn: ConnectionManager,
    handlers: Arc<HashMap<String, Arc<dyn JobHandler>>>,
    shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        // The move to the processing list keeps the envelope recoverable if
        // this process dies mid-handler; the 1s timeout bounds shutdown lag.
        let popped: Result<Option<String>, redis::RedisError> = redis::cmd("BLMOVE")
            .arg(PENDING_KEY)
            .arg(PROCESSING_KEY)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(1.0)
            .query_async(&mut conn)
            .await;
        let raw = match popped {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                error!(worker_id, error = %e, "queue pop failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let disposition = match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) => run_envelope(&handlers, envelope).await,
            Err(e) => {
                warn!(worker_id, error = %e, "discarding undecodable envelope");
                Disposition::Dead(Envelope {
                    kind: "unknown".into(),
                    payload: Value::String(raw.clone()),
                    attempt: 0,
                })
            }
        };

        if let Err(e) = acknowledge(&mut conn, &raw, disposition).await {
            error!(worker_id, error = %e, "queue acknowledge failed");
        }
    }
}

/// Remove the processed envelope and requeue or park it per disposition.
async fn acknowledge(
    conn: &mut ConnectionManager,
    raw: &str,
    disposition: Disposition,
) -> Result<()> {
    conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, raw).await?;
    match disposition {
        Disposition::Done => {}
        Disposition::Retry(envelope) => {
            conn.lpush::<_, _, ()>(PENDING_KEY, serde_json::to_string(&envelope)?)
                .await?;
        }
        Disposition::Dead(envelope) => {
            conn.lpush::<_, _, ()>(DEAD_KEY, serde_json::to_string(&envelope)?)
                .await?;
        }
    }
    Ok(())
}
