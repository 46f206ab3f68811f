//! Job registry
//!
//! The authoritative map of job id to live job handle. The map lock only
//! guards membership; per-job state is serialized by each job's own
//! progress channel, so unrelated jobs never wait on each other.

use crate::error::UnidlError;
use crate::job::{CancelOutcome, JobHandle};
use crate::pool::WorkerPool;
use crate::progress::ProgressStream;
use crate::rate_limiter::SessionRateLimiter;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use unidl_types::{CoreEvent, HistoryExport, Job, JobRequest, JobState, JobStats, SessionId};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, UnidlError>;

/// Most URLs accepted by one batch submission
pub const MAX_BATCH: usize = 10;

/// Outcome of one reclamation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs whose files and records were deleted
    pub removed: usize,
    /// Jobs kept because their files could not be deleted
    pub failed: usize,
}

pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Arc<JobHandle>>>,
    next_seq: AtomicU64,
    limiter: Arc<SessionRateLimiter>,
    pool: WorkerPool,
    download_root: PathBuf,
    events: broadcast::Sender<CoreEvent>,
}

impl JobRegistry {
    pub fn new(
        pool: WorkerPool,
        limiter: Arc<SessionRateLimiter>,
        download_root: PathBuf,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            limiter,
            pool,
            download_root,
            events,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Create a queued job and hand it to the pool. Returns immediately.
    pub fn submit(&self, request: JobRequest, session: &SessionId) -> Result<Uuid> {
        validate_url(&request.url)?;

        if !self.limiter.allow(session) {
            let retry_after = self.limiter.retry_after(session);
            info!(session = %session, "submission rejected by rate limiter");
            return Err(UnidlError::RateLimitExceeded {
                session: session.clone(),
                retry_after,
            });
        }

        let job = Job::new(request, session.clone());
        let id = job.id;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(JobHandle::new(job.clone(), seq, self.events.clone()));

        self.jobs.write().insert(id, Arc::clone(&handle));
        info!(job_id = %id, session = %session, url = %job.url, kind = %job.kind, "job submitted");
        let _ = self.events.send(CoreEvent::JobAdded { job });

        self.pool.enqueue(handle);
        Ok(id)
    }

    /// Submit several URLs at once; each one is charged and admitted independently
    pub fn submit_batch(
        &self,
        requests: Vec<JobRequest>,
        session: &SessionId,
    ) -> Result<Vec<Result<Uuid>>> {
        if requests.len() > MAX_BATCH {
            return Err(UnidlError::BatchTooLarge {
                got: requests.len(),
                max: MAX_BATCH,
            });
        }
        Ok(requests
            .into_iter()
            .map(|request| self.submit(request, session))
            .collect())
    }

    fn lookup(&self, id: Uuid) -> Result<Arc<JobHandle>> {
        self.jobs
            .read()
            .get(&id)
            .filter(|handle| !handle.is_removed())
            .cloned()
            .ok_or(UnidlError::NotFound(id))
    }

    fn owned(&self, id: Uuid, session: &SessionId) -> Result<Arc<JobHandle>> {
        let handle = self.lookup(id)?;
        if handle.is_owned_by(session) {
            Ok(handle)
        } else {
            Err(UnidlError::Forbidden(id))
        }
    }

    /// Current snapshot of a job
    pub fn get(&self, id: Uuid) -> Result<Job> {
        self.lookup(id)?
            .live_snapshot()
            .ok_or(UnidlError::NotFound(id))
    }

    /// Cancel a queued job now, or ask a running one to stop.
    ///
    /// Does not wait for the worker; poll `get` to observe `Canceled`.
    pub fn cancel(&self, id: Uuid, session: &SessionId) -> Result<()> {
        let handle = self.owned(id, session)?;
        match handle.request_cancel() {
            CancelOutcome::Canceled => {
                self.pool.withdraw(id);
                Ok(())
            }
            CancelOutcome::Signaled => Ok(()),
            CancelOutcome::AlreadyFinished(state) => Err(UnidlError::InvalidState { id, state }),
        }
    }

    /// The session's jobs, newest first
    pub fn list(&self, session: &SessionId) -> Vec<Job> {
        let handles: Vec<Arc<JobHandle>> = self
            .jobs
            .read()
            .values()
            .filter(|handle| handle.is_owned_by(session))
            .cloned()
            .collect();
        sorted_snapshots(handles)
    }

    /// Every job regardless of owner, newest first
    pub fn list_all(&self) -> Vec<Job> {
        let handles: Vec<Arc<JobHandle>> = self.jobs.read().values().cloned().collect();
        sorted_snapshots(handles)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot stream of one job, current state first
    pub fn subscribe(&self, id: Uuid, session: &SessionId) -> Result<ProgressStream> {
        Ok(self.owned(id, session)?.subscribe())
    }

    /// Open the finished file of a completed job
    pub async fn open_output(&self, id: Uuid, session: &SessionId) -> Result<(Job, File)> {
        let handle = self.owned(id, session)?;
        let job = handle.live_snapshot().ok_or(UnidlError::NotFound(id))?;
        if job.state != JobState::Completed {
            return Err(UnidlError::InvalidState {
                id,
                state: job.state,
            });
        }

        let path = job.output_path.clone().ok_or(UnidlError::NotFound(id))?;
        match File::open(&path).await {
            Ok(file) => Ok((job, file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(UnidlError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Start a new job with the same request as a failed or canceled one
    pub fn retry(&self, id: Uuid, session: &SessionId) -> Result<Uuid> {
        let job = self.owned(id, session)?.snapshot();
        match job.state {
            JobState::Failed | JobState::Canceled => self.submit(job.request(), session),
            state => Err(UnidlError::InvalidState { id, state }),
        }
    }

    /// Delete a finished job's files and record
    pub async fn remove(&self, id: Uuid, session: &SessionId) -> Result<()> {
        let handle = self.owned(id, session)?;
        let state = handle.state();
        if !state.is_terminal() {
            return Err(UnidlError::InvalidState { id, state });
        }
        self.reclaim(handle).await
    }

    fn job_dir(&self, id: Uuid) -> PathBuf {
        self.download_root.join(id.to_string())
    }

    /// Delete the job directory, then drop the record.
    ///
    /// The directory is removed while holding the job's write lock and the
    /// removed flag is set in the same critical section, so readers see
    /// either the complete record or `NotFound`. If deletion fails the
    /// record is left untouched.
    async fn reclaim(&self, handle: Arc<JobHandle>) -> Result<()> {
        let id = handle.id();
        let dir = self.job_dir(id);
        let target = Arc::clone(&handle);

        let deleted = tokio::task::spawn_blocking(move || {
            let mut result = Ok(());
            target.channel().update(|job| {
                if !job.state.is_terminal() {
                    result = Err(UnidlError::InvalidState {
                        id: job.id,
                        state: job.state,
                    });
                    return false;
                }
                if let Err(e) = remove_dir_if_present(&dir) {
                    result = Err(UnidlError::Io(e));
                    return false;
                }
                if let Some(path) = job.output_path.as_deref().filter(|p| !p.starts_with(&dir)) {
                    if let Err(e) = remove_file_if_present(path) {
                        result = Err(UnidlError::Io(e));
                        return false;
                    }
                }
                target.mark_removed();
                false
            });
            result
        })
        .await
        .map_err(|e| UnidlError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        deleted?;

        self.jobs.write().remove(&id);
        info!(job_id = %id, "job reclaimed");
        let _ = self.events.send(CoreEvent::JobRemoved { id });
        Ok(())
    }

    /// Reclaim every terminal job that finished before `now - retention`.
    ///
    /// Queued and running jobs are never touched, however old.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> SweepReport {
        let Some(horizon) = now.checked_sub_signed(retention) else {
            return SweepReport::default();
        };
        let expired: Vec<Arc<JobHandle>> = self
            .jobs
            .read()
            .values()
            .filter(|handle| {
                handle.channel().read(|job| {
                    job.state.is_terminal() && job.finished_at.is_some_and(|t| t < horizon)
                })
            })
            .cloned()
            .collect();

        let mut report = SweepReport::default();
        for handle in expired {
            let id = handle.id();
            match self.reclaim(handle).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "failed to reclaim job, will retry next sweep");
                    report.failed += 1;
                }
            }
        }
        if report.removed > 0 || report.failed > 0 {
            debug!(removed = report.removed, failed = report.failed, "reclaimed expired jobs");
        }
        report
    }

    pub fn export_history(&self, session: &SessionId) -> HistoryExport {
        HistoryExport {
            session: session.clone(),
            exported_at: Utc::now(),
            jobs: self.list(session),
        }
    }

    /// Aggregate counters over all jobs
    pub fn stats(&self, uptime_seconds: u64) -> JobStats {
        let mut stats = JobStats {
            uptime_seconds,
            ..JobStats::default()
        };
        let mut speeds = Vec::new();

        for job in self.list_all() {
            stats.total_jobs += 1;
            stats.total_downloaded_bytes += job.progress.downloaded_bytes;
            match job.state {
                JobState::Queued => stats.queued += 1,
                JobState::Running => {
                    stats.running += 1;
                    if let Some(speed) = job.progress.speed_bps {
                        speeds.push(speed);
                    }
                }
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Canceled => stats.canceled += 1,
            }
        }

        if !speeds.is_empty() {
            stats.average_speed_bps = speeds.iter().sum::<u64>() / speeds.len() as u64;
        }
        stats
    }
}

fn sorted_snapshots(handles: Vec<Arc<JobHandle>>) -> Vec<Job> {
    let mut jobs: Vec<(Job, u64)> = handles
        .into_iter()
        .filter_map(|handle| handle.live_snapshot().map(|job| (job, handle.seq())))
        .collect();
    jobs.sort_by(|(a, a_seq), (b, b_seq)| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b_seq.cmp(a_seq))
    });
    jobs.into_iter().map(|(job, _)| job).collect()
}

/// Accept only absolute http(s) URLs with a host
pub fn validate_url(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw.trim()).map_err(|e| UnidlError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some_and(|h| !h.is_empty()) => Ok(parsed),
        "http" | "https" => Err(UnidlError::InvalidUrl(format!("{}: missing host", raw))),
        scheme => Err(UnidlError::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            raw, scheme
        ))),
    }
}

fn remove_dir_if_present(path: &std::path::Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn remove_file_if_present(path: &std::path::Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        assert!(validate_url("https://www.youtube.com/watch?v=abc").is_ok());
        assert!(validate_url("  http://example.com/file.zip ").is_ok());
        assert!(matches!(
            validate_url("not a url"),
            Err(UnidlError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("file:///etc/passwd"),
            Err(UnidlError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("javascript:alert(1)"),
            Err(UnidlError::InvalidUrl(_))
        ));
    }

    #[test]
    fn missing_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("never-created");
        assert!(remove_dir_if_present(&gone).is_ok());
        assert!(remove_file_if_present(&gone.join("x.mp4")).is_ok());
    }
}
