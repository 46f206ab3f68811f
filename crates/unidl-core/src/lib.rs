//! unidl core - job orchestration
//!
//! This crate turns media URLs into downloaded files by delegating the
//! extraction itself to an `ExtractionEngine`. It owns everything around
//! that call: bounded concurrency, per-job progress, cooperative
//! cancellation, retries, per-session rate limits, and disk reclamation.

pub mod config;
pub mod engine;
mod error;
mod job;
mod pool;
mod progress;
mod rate_limiter;
mod registry;
mod retry;
mod sweeper;
mod worker;

pub use engine::{ExtractionEngine, FetchEvent, FetchRequest, HttpEngine, YtDlpEngine};
pub use error::*;
pub use job::*;
pub use pool::*;
pub use progress::*;
pub use rate_limiter::*;
pub use registry::{validate_url, JobRegistry, SweepReport, MAX_BATCH};
pub use retry::*;
pub use sweeper::*;
pub use worker::*;

use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use unidl_types::{
    kbps_to_bps, CoreEvent, HistoryExport, Job, JobRequest, JobStats, Metadata, SessionId,
    Settings,
};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, UnidlError>;

/// The main unidl core instance
#[derive(Clone)]
pub struct UnidlCore {
    settings: Arc<Settings>,
    registry: Arc<JobRegistry>,
    limiter: Arc<SessionRateLimiter>,
    sweeper: Arc<RetentionSweeper>,
    engine: Arc<dyn ExtractionEngine>,
    /// Event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
    /// Stops background tasks
    shutdown: CancellationToken,
    started_at: Instant,
}

impl UnidlCore {
    /// Create a core instance. Must be called from within a tokio runtime.
    pub async fn new(settings: Settings, engine: Arc<dyn ExtractionEngine>) -> Result<Self> {
        config::validate(&settings)?;
        tokio::fs::create_dir_all(&settings.download_folder).await?;

        let (event_tx, _) = broadcast::channel(1000);
        let limiter = Arc::new(SessionRateLimiter::from_settings(&settings));
        let runner = JobRunner::new(Arc::clone(&engine), &settings);
        let pool = WorkerPool::new(settings.max_concurrent_downloads, runner);
        let registry = Arc::new(JobRegistry::new(
            pool,
            Arc::clone(&limiter),
            settings.download_folder.clone(),
            event_tx.clone(),
        ));
        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::clone(&registry),
            Arc::clone(&limiter),
            &settings,
        ));

        info!(
            engine = engine.name(),
            capacity = settings.max_concurrent_downloads,
            folder = %settings.download_folder.display(),
            "unidl core ready"
        );

        Ok(Self {
            settings: Arc::new(settings),
            registry,
            limiter,
            sweeper,
            engine,
            event_tx,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        self.registry.pool()
    }

    pub fn limiter(&self) -> &Arc<SessionRateLimiter> {
        &self.limiter
    }

    pub fn sweeper(&self) -> &Arc<RetentionSweeper> {
        &self.sweeper
    }

    pub fn engine(&self) -> &Arc<dyn ExtractionEngine> {
        &self.engine
    }

    /// Subscribe to core events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    // ========================================================================
    // Job Operations
    // ========================================================================

    pub fn submit(&self, request: JobRequest, session: &SessionId) -> Result<Uuid> {
        self.registry.submit(request, session)
    }

    pub fn submit_batch(
        &self,
        requests: Vec<JobRequest>,
        session: &SessionId,
    ) -> Result<Vec<Result<Uuid>>> {
        self.registry.submit_batch(requests, session)
    }

    pub fn get(&self, id: Uuid) -> Result<Job> {
        self.registry.get(id)
    }

    pub fn cancel(&self, id: Uuid, session: &SessionId) -> Result<()> {
        self.registry.cancel(id, session)
    }

    pub fn list(&self, session: &SessionId) -> Vec<Job> {
        self.registry.list(session)
    }

    pub fn subscribe(&self, id: Uuid, session: &SessionId) -> Result<ProgressStream> {
        self.registry.subscribe(id, session)
    }

    pub async fn open_output(&self, id: Uuid, session: &SessionId) -> Result<(Job, File)> {
        self.registry.open_output(id, session).await
    }

    pub async fn remove(&self, id: Uuid, session: &SessionId) -> Result<()> {
        self.registry.remove(id, session).await
    }

    pub fn retry(&self, id: Uuid, session: &SessionId) -> Result<Uuid> {
        self.registry.retry(id, session)
    }

    /// Metadata for a URL without creating a job
    pub async fn probe(&self, url: &str) -> Result<Metadata> {
        validate_url(url)?;
        Ok(self.engine.probe(url.trim()).await?)
    }

    pub fn stats(&self) -> JobStats {
        self.registry.stats(self.started_at.elapsed().as_secs())
    }

    /// The session's jobs, newest first, stamped with the export time
    pub fn export_history(&self, session: &SessionId) -> HistoryExport {
        self.registry.export_history(session)
    }

    pub fn export_history_json(&self, session: &SessionId) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_history(session))?)
    }

    /// Cap download speed in KiB/s for fetches that start after this call.
    /// `None` or `Some(0)` removes the cap.
    pub fn set_speed_limit(&self, kbps: Option<u64>) {
        let bps = kbps_to_bps(kbps);
        info!(bytes_per_second = ?bps, "speed limit changed");
        self.pool().runner().set_speed_limit(bps);
    }

    /// Current cap in bytes per second
    pub fn speed_limit(&self) -> Option<u64> {
        self.pool().runner().speed_limit()
    }

    // ========================================================================
    // Background Tasks
    // ========================================================================

    /// Spawn the retention sweeper; it runs until `shutdown`
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        Arc::clone(&self.sweeper).spawn(self.shutdown.child_token())
    }

    /// Run one retention sweep now
    pub async fn sweep_now(&self) -> SweepReport {
        self.sweeper.sweep_once().await
    }

    /// Stop background tasks. Running jobs are left alone.
    pub fn shutdown(&self) {
        info!("shutting down unidl core");
        self.shutdown.cancel();
    }
}
