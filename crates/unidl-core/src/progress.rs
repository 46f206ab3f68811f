//! Per-job progress channel
//!
//! A single writer (the worker running the job) publishes progress into a
//! `watch` channel that holds the whole job snapshot. Readers always see
//! the latest snapshot and never queue history, so a slow reader can not
//! hold the writer back.

use futures::Stream;
use tokio::sync::watch;
use unidl_types::{Job, JobState, ProgressEvent};

/// Latest-value channel holding one job's snapshot
pub struct ProgressChannel {
    tx: watch::Sender<Job>,
}

impl ProgressChannel {
    pub fn new(job: Job) -> Self {
        let (tx, _rx) = watch::channel(job);
        Self { tx }
    }

    /// Fold an engine event into the cached progress and wake readers.
    ///
    /// Ignored unless the job is `Running`. Returns true if readers were notified.
    pub fn publish(&self, event: &ProgressEvent) -> bool {
        self.tx.send_if_modified(|job| {
            job.state == JobState::Running && job.progress.apply(event)
        })
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> Job {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> JobState {
        self.tx.borrow().state
    }

    /// Run `f` against the snapshot while holding the read side of the channel
    pub fn read<R>(&self, f: impl FnOnce(&Job) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Mutate the snapshot in place. `f` returns whether anything changed.
    ///
    /// This is the only write path for a job, so it is the per-job
    /// serialization point.
    pub(crate) fn update(&self, f: impl FnOnce(&mut Job) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    /// Stream of snapshots starting at the current one
    pub fn subscribe(&self) -> ProgressStream {
        ProgressStream {
            rx: self.tx.subscribe(),
            primed: false,
            finished: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Finite sequence of job snapshots.
///
/// Yields the current snapshot first, then every newer one it observes,
/// and ends right after delivering a terminal state.
pub struct ProgressStream {
    rx: watch::Receiver<Job>,
    primed: bool,
    finished: bool,
}

impl ProgressStream {
    pub async fn next(&mut self) -> Option<Job> {
        if self.finished {
            return None;
        }

        if self.primed {
            if self.rx.changed().await.is_err() {
                // Writer is gone (job record removed)
                self.finished = true;
                return None;
            }
        } else {
            self.primed = true;
        }

        let job = self.rx.borrow_and_update().clone();
        if job.state.is_terminal() {
            self.finished = true;
        }
        Some(job)
    }

    pub fn into_stream(self) -> impl Stream<Item = Job> + Send + Unpin {
        Box::pin(futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|job| (job, stream))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use unidl_types::{JobRequest, SessionId};

    fn running_channel() -> ProgressChannel {
        let mut job = Job::new(JobRequest::new("https://example.com/a"), SessionId::from("s"));
        job.state = JobState::Running;
        ProgressChannel::new(job)
    }

    #[tokio::test]
    async fn subscriber_starts_with_current_snapshot() {
        let channel = running_channel();
        channel.publish(&ProgressEvent::new(25, Some(100)));

        let mut stream = channel.subscribe();
        let first = stream.next().await.unwrap();
        assert_eq!(first.progress.percent, 25.0);
    }

    #[tokio::test]
    async fn publish_is_ignored_unless_running() {
        let job = Job::new(JobRequest::new("https://example.com/a"), SessionId::from("s"));
        let channel = ProgressChannel::new(job);
        assert!(!channel.publish(&ProgressEvent::new(10, Some(100))));
        assert_eq!(channel.snapshot().progress.percent, 0.0);
    }

    #[tokio::test]
    async fn slow_reader_only_sees_latest() {
        let channel = running_channel();
        let mut stream = channel.subscribe();
        assert!(stream.next().await.is_some());

        for bytes in [10, 20, 30, 40] {
            channel.publish(&ProgressEvent::new(bytes, Some(100)));
        }
        let latest = stream.next().await.unwrap();
        assert_eq!(latest.progress.downloaded_bytes, 40);
    }

    #[tokio::test]
    async fn stream_ends_after_terminal_state() {
        let channel = running_channel();
        let stream = channel.subscribe().into_stream();

        channel.publish(&ProgressEvent::new(50, Some(100)));
        channel.update(|job| {
            job.state = JobState::Canceled;
            true
        });

        let seen: Vec<Job> = stream.collect().await;
        assert_eq!(seen.last().map(|j| j.state), Some(JobState::Canceled));
    }

    #[tokio::test]
    async fn resubscribing_gets_latest_snapshot() {
        let channel = running_channel();
        channel.publish(&ProgressEvent::new(70, Some(100)));
        channel.update(|job| {
            job.state = JobState::Failed;
            true
        });

        let mut first = channel.subscribe();
        assert_eq!(first.next().await.map(|j| j.state), Some(JobState::Failed));
        assert!(first.next().await.is_none());

        let mut again = channel.subscribe();
        let job = again.next().await.unwrap();
        assert_eq!(job.progress.percent, 70.0);
    }
}
