//! Bounded worker pool
//!
//! At most `capacity` jobs run at once; the rest wait in a FIFO queue.
//! The running counter and the queue live under one lock, so admission and
//! slot release are a single critical section and the pool never
//! over-admits. Each running job holds a `SlotGuard`; dropping it (normal
//! exit, panic, or runtime teardown) hands the slot to the oldest queued job.

use crate::job::JobHandle;
use crate::worker::JobRunner;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info_span, warn, Instrument};
use unidl_types::{FailureKind, JobError, JobState};
use uuid::Uuid;

/// Fixed-capacity executor for jobs
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    capacity: usize,
    state: Mutex<PoolState>,
    runner: Arc<JobRunner>,
}

#[derive(Default)]
struct PoolState {
    running: usize,
    queue: VecDeque<Arc<JobHandle>>,
}

impl WorkerPool {
    pub fn new(capacity: usize, runner: JobRunner) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity: capacity.max(1),
                state: Mutex::new(PoolState::default()),
                runner: Arc::new(runner),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn runner(&self) -> &JobRunner {
        &self.inner.runner
    }

    /// Start the job now if a slot is free, otherwise queue it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, job: Arc<JobHandle>) {
        let admitted = {
            let mut state = self.inner.state.lock();
            if state.running < self.inner.capacity {
                state.running += 1;
                true
            } else {
                state.queue.push_back(job.clone());
                debug!(job_id = %job.id(), position = state.queue.len(), "job queued");
                false
            }
        };

        if admitted {
            self.inner.start(job);
        }
    }

    /// Jobs currently holding a slot
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Jobs waiting for a slot
    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// 1-based position in the waiting queue
    pub fn queue_position(&self, id: Uuid) -> Option<usize> {
        self.inner
            .state
            .lock()
            .queue
            .iter()
            .position(|job| job.id() == id)
            .map(|i| i + 1)
    }

    /// Remove a job from the waiting queue. Returns false if it was not queued.
    pub fn withdraw(&self, id: Uuid) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.queue.len();
        state.queue.retain(|job| job.id() != id);
        state.queue.len() != before
    }
}

impl PoolInner {
    /// Spawn `job` on a slot that has already been counted as running
    fn start(self: &Arc<Self>, job: Arc<JobHandle>) {
        let Ok(handle) = Handle::try_current() else {
            warn!(job_id = %job.id(), "no runtime available, job stays queued");
            let mut state = self.state.lock();
            state.running -= 1;
            state.queue.push_front(job);
            return;
        };

        let slot = SlotGuard {
            pool: Arc::clone(self),
        };
        handle.spawn(run_job(Arc::clone(&self.runner), job, slot));
    }

    /// A slot was freed: promote the oldest job still queued, or shrink
    fn release(self: &Arc<Self>) {
        let next = {
            let mut state = self.state.lock();
            loop {
                match state.queue.pop_front() {
                    Some(job) if job.state() == JobState::Queued => break Some(job),
                    Some(_) => continue,
                    None => {
                        state.running = state.running.saturating_sub(1);
                        break None;
                    }
                }
            }
        };

        if let Some(job) = next {
            debug!(job_id = %job.id(), "promoting queued job");
            self.start(job);
        }
    }
}

/// Holds one pool slot for the lifetime of an execution
struct SlotGuard {
    pool: Arc<PoolInner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release();
    }
}

async fn run_job(runner: Arc<JobRunner>, job: Arc<JobHandle>, slot: SlotGuard) {
    let span = info_span!("job", id = %job.id());
    let execution = tokio::spawn({
        let job = Arc::clone(&job);
        async move { runner.run(&job).await }.instrument(span)
    });

    if let Err(e) = execution.await {
        let message = if e.is_panic() {
            error!(job_id = %job.id(), "job execution panicked");
            "job execution panicked"
        } else {
            "job execution was aborted"
        };
        job.fail(JobError::new(FailureKind::Internal, message));
    }

    drop(slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExtractionEngine, FetchEvent, FetchRequest};
    use crate::error::EngineError;
    use futures::future::BoxFuture;
    use futures::stream::{self, BoxStream, StreamExt};
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;
    use unidl_types::{Job, JobRequest, Metadata, SessionId, Settings};

    /// Blocks every fetch until canceled
    struct Blocking;

    impl ExtractionEngine for Blocking {
        fn name(&self) -> &'static str {
            "blocking"
        }

        fn probe<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Metadata, EngineError>> {
            Box::pin(async { Ok(Metadata::default()) })
        }

        fn fetch<'a>(
            &'a self,
            _request: FetchRequest<'a>,
            _cancel: CancellationToken,
        ) -> BoxStream<'a, Result<FetchEvent, EngineError>> {
            stream::pending().boxed()
        }
    }

    /// Panics inside the execution task
    struct Exploding;

    impl ExtractionEngine for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn probe<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Metadata, EngineError>> {
            Box::pin(async { explode() })
        }

        fn fetch<'a>(
            &'a self,
            _request: FetchRequest<'a>,
            _cancel: CancellationToken,
        ) -> BoxStream<'a, Result<FetchEvent, EngineError>> {
            stream::empty().boxed()
        }
    }

    fn explode() -> Result<Metadata, EngineError> {
        panic!("engine bug")
    }

    fn pool(engine: Arc<dyn ExtractionEngine>, capacity: usize, dir: &std::path::Path) -> WorkerPool {
        let settings = Settings {
            download_folder: dir.to_path_buf(),
            ..Settings::default()
        };
        WorkerPool::new(capacity, JobRunner::new(engine, &settings))
    }

    fn job(seq: u64) -> Arc<JobHandle> {
        let (tx, _) = broadcast::channel(16);
        let job = Job::new(JobRequest::new("https://example.com/v"), SessionId::from("s"));
        Arc::new(JobHandle::new(job, seq, tx))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn admits_up_to_capacity_then_queues() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(Arc::new(Blocking), 2, dir.path());
        let jobs: Vec<_> = (0..4).map(job).collect();
        for j in &jobs {
            pool.enqueue(Arc::clone(j));
        }

        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.queued_count(), 2);
        assert_eq!(pool.queue_position(jobs[2].id()), Some(1));
        assert_eq!(pool.queue_position(jobs[3].id()), Some(2));
        assert_eq!(pool.queue_position(jobs[0].id()), None);

        // Canceling a running job frees its slot for the oldest queued one
        jobs[0].request_cancel();
        eventually(|| jobs[2].state() == JobState::Running).await;
        assert_eq!(jobs[0].state(), JobState::Canceled);
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.queued_count(), 1);
    }

    #[tokio::test]
    async fn withdrawn_job_is_never_started() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(Arc::new(Blocking), 1, dir.path());
        let first = job(0);
        let second = job(1);
        pool.enqueue(Arc::clone(&first));
        pool.enqueue(Arc::clone(&second));

        second.request_cancel();
        assert!(pool.withdraw(second.id()));
        assert!(!pool.withdraw(second.id()));

        first.request_cancel();
        eventually(|| pool.active_count() == 0).await;
        assert_eq!(first.state(), JobState::Canceled);
        assert_eq!(second.state(), JobState::Canceled);
        assert_eq!(second.snapshot().attempts, 0);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn panicking_execution_fails_job_and_frees_slot() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(Arc::new(Exploding), 1, dir.path());
        let first = job(0);
        pool.enqueue(Arc::clone(&first));
        eventually(|| pool.active_count() == 0).await;

        let snapshot = first.snapshot();
        assert_eq!(snapshot.state, JobState::Failed);
        assert_eq!(snapshot.error.map(|e| e.kind), Some(FailureKind::Internal));
    }
}
