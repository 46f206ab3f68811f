//! Retention sweeper
//!
//! Background task that periodically deletes finished jobs (files and
//! records together) once they are older than the retention horizon, and
//! trims idle rate limiter windows.

use crate::rate_limiter::SessionRateLimiter;
use crate::registry::{JobRegistry, SweepReport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use unidl_types::Settings;

pub struct RetentionSweeper {
    registry: Arc<JobRegistry>,
    limiter: Arc<SessionRateLimiter>,
    retention: chrono::Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        registry: Arc<JobRegistry>,
        limiter: Arc<SessionRateLimiter>,
        settings: &Settings,
    ) -> Self {
        // Out-of-range horizons saturate: nothing is ever old enough.
        let retention =
            chrono::Duration::from_std(settings.retention()).unwrap_or(chrono::Duration::MAX);
        Self {
            registry,
            limiter,
            retention,
            interval: settings.sweep_interval(),
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }

    /// Run one sweep against the wall clock
    pub async fn sweep_once(&self) -> SweepReport {
        self.sweep_once_at(Utc::now()).await
    }

    /// Run one sweep as if the current time were `now`
    pub async fn sweep_once_at(&self, now: DateTime<Utc>) -> SweepReport {
        let report = self.registry.reclaim_expired(now, self.retention).await;
        let purged = self.limiter.purge_idle();
        if purged > 0 {
            debug!(sessions = purged, "purged idle rate limit windows");
        }
        report
    }

    /// Spawn the interval loop. It stops when `shutdown` is canceled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(
            every_secs = self.interval.as_secs(),
            retention_hours = self.retention.num_hours(),
            "starting retention sweeper"
        );

        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("retention sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.sweep_once().await;
                        if report.removed > 0 {
                            info!(removed = report.removed, failed = report.failed, "retention sweep finished");
                        }
                    }
                }
            }
        })
    }
}
