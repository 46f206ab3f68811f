//! Shared types for unidl
//!
//! This crate contains the data structures passed between the job
//! orchestration core and its front ends (CLI, servers, tests).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Request Types
// ============================================================================

/// Opaque identifier of the client session that owns a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the user wants out of the media URL
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested quality. `Format` pins an engine-specific format id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Best,
    High,
    Medium,
    Low,
    Format(String),
}

impl Quality {
    /// Parse a user-supplied quality string. Unknown values are treated as format ids.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "" | "best" => Quality::Best,
            "high" | "1080" | "1080p" => Quality::High,
            "medium" | "720" | "720p" => Quality::Medium,
            "low" | "480" | "480p" => Quality::Low,
            _ => Quality::Format(value.trim().to_string()),
        }
    }

    fn max_height(&self) -> Option<u32> {
        match self {
            Quality::High => Some(1080),
            Quality::Medium => Some(720),
            Quality::Low => Some(480),
            Quality::Best | Quality::Format(_) => None,
        }
    }

    /// Format selector expression handed to the extraction engine
    pub fn selector(&self, kind: MediaKind) -> String {
        if let Quality::Format(id) = self {
            return id.clone();
        }
        match (kind, self.max_height()) {
            (MediaKind::Audio, _) => "bestaudio/best".to_string(),
            (MediaKind::Video, None) => "bestvideo+bestaudio/best".to_string(),
            (MediaKind::Video, Some(h)) => {
                format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]")
            }
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Best => f.write_str("best"),
            Quality::High => f.write_str("high"),
            Quality::Medium => f.write_str("medium"),
            Quality::Low => f.write_str("low"),
            Quality::Format(id) => write!(f, "format {}", id),
        }
    }
}

/// Immutable inputs of a download job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub url: String,
    #[serde(default)]
    pub kind: MediaKind,
    #[serde(default)]
    pub quality: Quality,
}

impl JobRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: MediaKind::Video,
            quality: Quality::Best,
        }
    }

    pub fn with_kind(mut self, kind: MediaKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }
}

// ============================================================================
// Job Types
// ============================================================================

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Canceled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Canceled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental transfer report emitted by an extraction engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub speed_bps: Option<u64>,
}

impl ProgressEvent {
    pub fn new(bytes_downloaded: u64, total_bytes: Option<u64>) -> Self {
        Self {
            bytes_downloaded,
            total_bytes,
            speed_bps: None,
        }
    }

    pub fn with_speed(mut self, speed_bps: u64) -> Self {
        self.speed_bps = Some(speed_bps);
        self
    }
}

/// Aggregate progress of a job, as shown to pollers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// 0..=100, never decreases during the job's lifetime
    pub percent: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed_bps: Option<u64>,
    pub eta_seconds: Option<u64>,
}

impl JobProgress {
    /// Fold an engine event into the aggregate. Returns true if anything changed.
    pub fn apply(&mut self, event: &ProgressEvent) -> bool {
        let before = self.clone();

        self.downloaded_bytes = event.bytes_downloaded;
        if event.total_bytes.is_some() {
            self.total_bytes = event.total_bytes;
        }
        self.speed_bps = event.speed_bps;

        if let Some(total) = self.total_bytes.filter(|t| *t > 0) {
            let percent = (event.bytes_downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
            self.percent = self.percent.max(percent);
            self.eta_seconds = match self.speed_bps {
                Some(speed) if speed > 0 => {
                    Some(total.saturating_sub(event.bytes_downloaded) / speed)
                }
                _ => None,
            };
        }

        *self != before
    }

    /// Mark the transfer as done
    pub fn finish(&mut self) {
        self.percent = 100.0;
        self.speed_bps = None;
        self.eta_seconds = Some(0);
        if let Some(total) = self.total_bytes {
            self.downloaded_bytes = self.downloaded_bytes.max(total);
        }
    }
}

/// Structured reason a job ended in `Failed` or `Canceled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnsupportedUrl,
    NotFound,
    Network,
    Timeout,
    Storage,
    Extraction,
    Internal,
    /// Stopped on request; the only kind a `Canceled` job carries
    Interrupted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::UnsupportedUrl => "unsupported_url",
            FailureKind::NotFound => "not_found",
            FailureKind::Network => "network",
            FailureKind::Timeout => "timeout",
            FailureKind::Storage => "storage",
            FailureKind::Extraction => "extraction",
            FailureKind::Internal => "internal",
            FailureKind::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn canceled() -> Self {
        Self::new(FailureKind::Interrupted, "canceled by user")
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("job exceeded the {}s time limit", limit.as_secs()),
        )
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One downloadable format reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub format_id: String,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub note: Option<String>,
    pub filesize: Option<u64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub fps: Option<f64>,
    pub abr: Option<f64>,
}

/// What the engine knows about a URL before downloading it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub title: Option<String>,
    pub uploader: Option<String>,
    /// Seconds
    pub duration: Option<u64>,
    pub thumbnail_url: Option<String>,
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub available_formats: Vec<FormatInfo>,
}

/// Point-in-time copy of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub url: String,
    pub kind: MediaKind,
    pub quality: Quality,
    pub owner_session: SessionId,
    pub state: JobState,
    pub progress: JobProgress,
    pub metadata: Option<Metadata>,
    /// Set only on `Completed`
    pub output_path: Option<PathBuf>,
    /// Set only on `Failed`
    pub error: Option<JobError>,
    /// Number of extraction attempts started so far
    pub attempts: u32,
    /// A cancel was requested while running and not yet acknowledged
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff `state` is terminal
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(request: JobRequest, owner_session: SessionId) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: request.url,
            kind: request.kind,
            quality: request.quality,
            owner_session,
            state: JobState::Queued,
            progress: JobProgress::default(),
            metadata: None,
            output_path: None,
            error: None,
            attempts: 0,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The inputs this job was created from
    pub fn request(&self) -> JobRequest {
        JobRequest {
            url: self.url.clone(),
            kind: self.kind,
            quality: self.quality.clone(),
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.title.as_deref())
    }

    /// File name of the finished output, if any
    pub fn filename(&self) -> Option<String> {
        self.output_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to front ends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    JobAdded {
        job: Job,
    },
    JobStateChanged {
        id: Uuid,
        state: JobState,
        error: Option<JobError>,
    },
    JobRemoved {
        id: Uuid,
    },
}

/// Aggregate counters over all known jobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub total_jobs: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    pub total_downloaded_bytes: u64,
    /// Mean speed over running jobs that report one
    pub average_speed_bps: u64,
    pub uptime_seconds: u64,
}

/// A session's job list as written by history export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryExport {
    pub session: SessionId,
    pub exported_at: DateTime<Utc>,
    /// Newest first
    pub jobs: Vec<Job>,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Longest accepted retention horizon (ten years)
pub const MAX_RETENTION_HOURS: u64 = 24 * 365 * 10;

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Worker pool capacity
    pub max_concurrent_downloads: usize,
    /// How long terminal jobs and their files are kept
    pub job_retention_hours: u64,
    /// Trailing window of the per-session rate limiter
    pub rate_limit_window_seconds: u64,
    /// Submissions allowed per session within one window
    pub rate_limit_max_requests: usize,
    /// Root for all output files; each job writes under `<root>/<job id>/`
    pub download_folder: PathBuf,
    /// Maximum `Running` duration before a job is failed with a timeout
    pub job_timeout_seconds: u64,
    /// How often the retention sweeper runs
    pub sweep_interval_seconds: u64,
    /// Retries for transient engine errors (attempts = retries + 1)
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_seconds: u64,
    /// Per-download speed cap in KiB/s. `None` or `0` means unlimited.
    pub download_speed_limit_kbps: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 5,
            job_retention_hours: 24,
            rate_limit_window_seconds: 60,
            rate_limit_max_requests: 10,
            download_folder: dirs::download_dir()
                .map(|p| p.join("unidl"))
                .unwrap_or_else(|| PathBuf::from("downloads")),
            job_timeout_seconds: 3600,
            sweep_interval_seconds: 300,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_seconds: 30,
            download_speed_limit_kbps: None,
        }
    }
}

impl Settings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_hours.saturating_mul(3600))
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Speed cap in bytes per second
    pub fn speed_limit_bps(&self) -> Option<u64> {
        kbps_to_bps(self.download_speed_limit_kbps)
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_downloads == 0 {
            return Err("max_concurrent_downloads must be at least 1".into());
        }
        if self.job_retention_hours > MAX_RETENTION_HOURS {
            return Err(format!(
                "job_retention_hours must be at most {}",
                MAX_RETENTION_HOURS
            ));
        }
        if self.rate_limit_max_requests == 0 {
            return Err("rate_limit_max_requests must be at least 1".into());
        }
        if self.rate_limit_window_seconds == 0 {
            return Err("rate_limit_window_seconds must be at least 1".into());
        }
        if self.job_timeout_seconds == 0 {
            return Err("job_timeout_seconds must be at least 1".into());
        }
        if self.sweep_interval_seconds == 0 {
            return Err("sweep_interval_seconds must be at least 1".into());
        }
        if self.download_folder.as_os_str().is_empty() {
            return Err("download_folder must not be empty".into());
        }
        Ok(())
    }
}

/// KiB/s to bytes/s; zero disables the cap
pub fn kbps_to_bps(kbps: Option<u64>) -> Option<u64> {
    kbps.filter(|kb| *kb > 0).map(|kb| kb.saturating_mul(1024))
}
