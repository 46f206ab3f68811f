//! Job handle and lifecycle state machine
//!
//! A `JobHandle` is the shared, live side of a job. All mutation goes
//! through its `ProgressChannel`, so transitions on one job are serialized
//! while different jobs never contend with each other.

use crate::progress::{ProgressChannel, ProgressStream};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;
use unidl_types::{CoreEvent, Job, JobError, JobState, Metadata, ProgressEvent, SessionId};
use uuid::Uuid;

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Job was queued and is now `Canceled`
    Canceled,
    /// Job is running; the worker was signaled and will acknowledge
    Signaled,
    /// Job had already reached this terminal state
    AlreadyFinished(JobState),
}

/// Shared handle to one job
pub struct JobHandle {
    id: Uuid,
    owner: SessionId,
    /// Submission order, used to break `created_at` ties
    seq: u64,
    channel: ProgressChannel,
    cancel: CancellationToken,
    removed: AtomicBool,
    events: broadcast::Sender<CoreEvent>,
}

impl JobHandle {
    pub(crate) fn new(job: Job, seq: u64, events: broadcast::Sender<CoreEvent>) -> Self {
        Self {
            id: job.id,
            owner: job.owner_session.clone(),
            seq,
            channel: ProgressChannel::new(job),
            cancel: CancellationToken::new(),
            removed: AtomicBool::new(false),
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner(&self) -> &SessionId {
        &self.owner
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_owned_by(&self, session: &SessionId) -> bool {
        &self.owner == session
    }

    pub fn snapshot(&self) -> Job {
        self.channel.snapshot()
    }

    pub fn state(&self) -> JobState {
        self.channel.state()
    }

    pub fn channel(&self) -> &ProgressChannel {
        &self.channel
    }

    pub fn subscribe(&self) -> ProgressStream {
        self.channel.subscribe()
    }

    /// Token observed by the worker at each checkpoint
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Snapshot, or `None` once the record has been reclaimed.
    ///
    /// The removed flag is read under the channel's read lock, so a lookup
    /// racing a sweep sees either the whole record or nothing.
    pub fn live_snapshot(&self) -> Option<Job> {
        self.channel
            .read(|job| (!self.is_removed()).then(|| job.clone()))
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Apply `from -> next` if the job is in `from` and the edge is legal.
    fn transition(&self, from: Option<JobState>, next: JobState, apply: impl FnOnce(&mut Job)) -> bool {
        let mut error = None;
        let changed = self.channel.update(|job| {
            if from.is_some_and(|f| f != job.state) || !job.state.can_transition_to(next) {
                return false;
            }
            job.state = next;
            if next.is_terminal() {
                job.finished_at = Some(Utc::now());
                job.cancel_requested = false;
            }
            apply(job);
            error = job.error.clone();
            true
        });

        if changed {
            info!(job_id = %self.id, state = %next, "job state changed");
            let _ = self.events.send(CoreEvent::JobStateChanged {
                id: self.id,
                state: next,
                error,
            });
        }
        changed
    }

    /// `Queued -> Running`. False if the job was canceled first.
    pub(crate) fn begin(&self) -> bool {
        self.transition(Some(JobState::Queued), JobState::Running, |job| {
            job.started_at = Some(Utc::now());
        })
    }

    /// Count a new extraction attempt. Returns the 1-based attempt number.
    pub(crate) fn start_attempt(&self) -> u32 {
        let mut attempt = 0;
        self.channel.update(|job| {
            job.attempts += 1;
            attempt = job.attempts;
            true
        });
        attempt
    }

    pub(crate) fn record_progress(&self, event: &ProgressEvent) -> bool {
        self.channel.publish(event)
    }

    pub(crate) fn set_metadata(&self, metadata: Metadata) {
        self.channel.update(|job| {
            if job.state != JobState::Running {
                return false;
            }
            job.metadata = Some(metadata);
            true
        });
    }

    pub(crate) fn complete(&self, output_path: PathBuf) -> bool {
        self.transition(Some(JobState::Running), JobState::Completed, |job| {
            job.progress.finish();
            job.output_path = Some(output_path);
        })
    }

    pub(crate) fn fail(&self, error: JobError) -> bool {
        self.transition(Some(JobState::Running), JobState::Failed, |job| {
            job.progress.speed_bps = None;
            job.progress.eta_seconds = None;
            job.error = Some(error);
        })
    }

    /// Worker observed the cancel signal: `Running -> Canceled`
    pub(crate) fn acknowledge_cancel(&self) -> bool {
        self.transition(Some(JobState::Running), JobState::Canceled, |job| {
            job.progress.speed_bps = None;
            job.progress.eta_seconds = None;
            job.error = Some(JobError::canceled());
        })
    }

    /// Cancel a queued job directly, or signal a running one.
    pub(crate) fn request_cancel(&self) -> CancelOutcome {
        let state = self.state();
        if state == JobState::Queued
            && self.transition(Some(JobState::Queued), JobState::Canceled, |job| {
                job.error = Some(JobError::canceled());
            })
        {
            self.cancel.cancel();
            return CancelOutcome::Canceled;
        }

        let mut outcome = CancelOutcome::AlreadyFinished(state);
        self.channel.update(|job| match job.state {
            JobState::Running => {
                outcome = CancelOutcome::Signaled;
                let first = !job.cancel_requested;
                job.cancel_requested = true;
                first
            }
            other => {
                outcome = CancelOutcome::AlreadyFinished(other);
                false
            }
        });

        if outcome == CancelOutcome::Signaled {
            info!(job_id = %self.id, "cancellation requested");
            self.cancel.cancel();
        }
        outcome
    }
}
