//! Recurring job production: one timer per relay plus the announcement timer.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::queue::{Enqueuer, TYPE_HEALTH_CHECK, TYPE_MONITOR_ANNOUNCEMENT};
use crate::store::RelayRepository;

/// Pure producer: reads the relay catalog once at startup and enqueues one
/// health-check job per relay per period, plus the monitor announcement.
pub struct Scheduler {
    queue: Arc<dyn Enqueuer>,
    healthcheck_period: Duration,
    announcement_period: Duration,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn Enqueuer>,
        healthcheck_period: Duration,
        announcement_period: Duration,
    ) -> Self {
        Self {
            queue,
            healthcheck_period,
            announcement_period,
        }
    }

    /// Register all recurring jobs and run them until `shutdown` flips.
    pub async fn run(
        &self,
        repo: Arc<dyn RelayRepository>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let relays = repo.list(None).await.context("listing relays to schedule")?;
        info!(
            count = relays.len(),
            period_secs = self.healthcheck_period.as_secs(),
            "scheduling health checks"
        );

        let mut jobs = JoinSet::new();
        for status in relays {
            let url = status.relay.url;
            let queue = self.queue.clone();
            let period = self.healthcheck_period;
            let shutdown = shutdown.clone();
            jobs.spawn(async move {
                recurring(period, false, shutdown, move || {
                    let queue = queue.clone();
                    let url = url.clone();
                    async move {
                        queue
                            .enqueue_job(TYPE_HEALTH_CHECK, json!({ "relayURL": url }))
                            .await
                    }
                })
                .await;
            });
        }

        // The announcement also fires once at startup so a fresh monitor is
        // discoverable before the first full period elapses.
        let queue = self.queue.clone();
        let period = self.announcement_period;
        let frequency = period.as_secs().to_string();
        let announce_shutdown = shutdown.clone();
        jobs.spawn(async move {
            recurring(period, true, announce_shutdown, move || {
                let queue = queue.clone();
                let frequency = frequency.clone();
                async move {
                    queue
                        .enqueue_job(TYPE_MONITOR_ANNOUNCEMENT, json!({ "frequency": frequency }))
                        .await
                }
            })
            .await;
        });

        while jobs.join_next().await.is_some() {}
        info!("scheduler stopped");
        Ok(())
    }
}

/// Fire `job` every `period` until shutdown; enqueue failures are logged and
/// skipped so one bad tick never kills the timer.
async fn recurring<F, Fut>(
    period: Duration,
    immediately: bool,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut ticker = if immediately {
        interval(period)
    } else {
        interval_at(Instant::now() + period, period)
    };
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = job().await {
                    error!(error = %e, "failed to enqueue scheduled job");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
