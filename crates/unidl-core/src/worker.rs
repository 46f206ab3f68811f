//! Job execution against the extraction engine
//!
//! One `run` call drives a job from `Running` to a terminal state:
//! probe, then fetch, with bounded retries for network-class errors and a
//! hard time limit over the whole execution. Every stream item is a
//! cancellation checkpoint.

use crate::engine::{ExtractionEngine, FetchEvent, FetchRequest};
use crate::error::EngineError;
use crate::job::JobHandle;
use crate::retry::{RetryDecision, RetryPolicy};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use unidl_types::{FailureKind, Job, JobError, Settings};
use uuid::Uuid;

/// Why an execution stopped without producing a file
#[derive(Debug)]
enum Interruption {
    Canceled,
    Failed(JobError),
}

/// Runs jobs against one engine
pub struct JobRunner {
    engine: Arc<dyn ExtractionEngine>,
    download_root: PathBuf,
    job_timeout: Duration,
    retry: RetryPolicy,
    /// Bytes per second, 0 when unlimited. Read when each attempt starts.
    speed_limit: AtomicU64,
}

impl JobRunner {
    pub fn new(engine: Arc<dyn ExtractionEngine>, settings: &Settings) -> Self {
        Self {
            engine,
            download_root: settings.download_folder.clone(),
            job_timeout: settings.job_timeout(),
            retry: RetryPolicy::from_settings(settings),
            speed_limit: AtomicU64::new(settings.speed_limit_bps().unwrap_or(0)),
        }
    }

    /// Change the cap for fetches started from now on
    pub fn set_speed_limit(&self, bytes_per_second: Option<u64>) {
        self.speed_limit
            .store(bytes_per_second.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn speed_limit(&self) -> Option<u64> {
        Some(self.speed_limit.load(Ordering::Relaxed)).filter(|bps| *bps > 0)
    }

    pub fn engine(&self) -> &Arc<dyn ExtractionEngine> {
        &self.engine
    }

    /// Directory owned by one job
    pub fn job_dir(&self, id: Uuid) -> PathBuf {
        self.download_root.join(id.to_string())
    }

    /// Execute a queued job to completion. Never returns an error: every
    /// outcome is recorded on the job itself.
    pub async fn run(&self, job: &JobHandle) {
        if !job.begin() {
            debug!(job_id = %job.id(), "job left the queue before starting");
            return;
        }

        let snapshot = job.snapshot();
        let dir = self.job_dir(job.id());
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(job_id = %job.id(), error = %e, "cannot create job directory");
            job.fail(JobError::new(
                FailureKind::Storage,
                format!("cannot create {}: {}", dir.display(), e),
            ));
            return;
        }

        let user_cancel = job.cancel_token().clone();
        // Timeouts cancel this child token so the engine stops without
        // the job looking user-canceled.
        let execution = user_cancel.child_token();

        let outcome =
            tokio::time::timeout(self.job_timeout, self.execute(job, &snapshot, &dir, &execution))
                .await;

        match outcome {
            Ok(Ok(path)) => {
                info!(job_id = %job.id(), path = %path.display(), "job completed");
                job.complete(path);
            }
            Ok(Err(Interruption::Canceled)) => {
                job.acknowledge_cancel();
            }
            Ok(Err(Interruption::Failed(error))) => {
                if user_cancel.is_cancelled() {
                    job.acknowledge_cancel();
                } else {
                    warn!(job_id = %job.id(), error = %error, "job failed");
                    job.fail(error);
                }
            }
            Err(_elapsed) => {
                execution.cancel();
                if user_cancel.is_cancelled() {
                    job.acknowledge_cancel();
                } else {
                    warn!(job_id = %job.id(), limit_secs = self.job_timeout.as_secs(), "job timed out");
                    job.fail(JobError::timeout(self.job_timeout));
                }
            }
        }
    }

    async fn execute(
        &self,
        job: &JobHandle,
        snapshot: &Job,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, Interruption> {
        let format = snapshot.quality.selector(snapshot.kind);
        let mut probed = false;

        loop {
            let attempt = job.start_attempt();
            debug!(job_id = %job.id(), attempt, "starting attempt");

            let error = match self.attempt(job, snapshot, &format, dir, cancel, &mut probed).await {
                Ok(path) => return Ok(path),
                Err(EngineError::Interrupted) => return Err(Interruption::Canceled),
                Err(_) if cancel.is_cancelled() => return Err(Interruption::Canceled),
                Err(e) => e,
            };

            match self.retry.decide(attempt, error.kind()) {
                RetryDecision::NoRetry => return Err(Interruption::Failed(error.to_job_error())),
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        job_id = %job.id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient failure, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Interruption::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        job: &JobHandle,
        snapshot: &Job,
        format: &str,
        dir: &Path,
        cancel: &CancellationToken,
        probed: &mut bool,
    ) -> Result<PathBuf, EngineError> {
        if !*probed {
            let metadata = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Interrupted),
                metadata = self.engine.probe(&snapshot.url) => metadata?,
            };
            job.set_metadata(metadata);
            *probed = true;
        }

        let request = FetchRequest {
            url: &snapshot.url,
            kind: snapshot.kind,
            format,
            destination: dir,
            speed_limit: self.speed_limit(),
        };
        let mut events = self.engine.fetch(request, cancel.clone());

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Interrupted),
                item = events.next() => item,
            };

            match item {
                Some(Ok(FetchEvent::Progress(event))) => {
                    job.record_progress(&event);
                }
                Some(Ok(FetchEvent::Finished(path))) => {
                    return Ok(if path.is_absolute() { path } else { dir.join(path) });
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(EngineError::Extraction(
                        "engine finished without producing a file".into(),
                    ))
                }
            }
        }
    }
}
