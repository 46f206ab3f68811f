//! Progress bars for running jobs

use crate::output::{format_bytes, format_duration, truncate};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use unidl_types::{Job, JobState};

/// One bar per job, stacked in a shared `MultiProgress`
pub struct JobBars {
    multi: MultiProgress,
    style: ProgressStyle,
}

impl JobBars {
    pub fn new() -> Self {
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg:32!} [{bar:40.cyan/blue}] {pos:>3}% {prefix}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  ");
        Self {
            multi: MultiProgress::new(),
            style,
        }
    }

    /// Create a bar for a job URL
    pub fn add(&self, url: &str) -> JobBar {
        let bar = self.multi.add(ProgressBar::new(100));
        bar.set_style(self.style.clone());
        bar.set_message(truncate(url, 32));
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        JobBar { bar }
    }

    /// Print a line above the bars without tearing them
    pub fn println(&self, line: impl AsRef<str>) {
        let _ = self.multi.println(line);
    }
}

impl Default for JobBars {
    fn default() -> Self {
        Self::new()
    }
}

pub struct JobBar {
    bar: ProgressBar,
}

impl JobBar {
    /// Redraw from a fresh snapshot
    pub fn update(&self, job: &Job) {
        if let Some(title) = job.title() {
            self.bar.set_message(truncate(title, 32));
        }
        self.bar.set_position(job.progress.percent.floor() as u64);

        let mut detail = format_bytes(job.progress.downloaded_bytes);
        if let Some(total) = job.progress.total_bytes {
            detail = format!("{} / {}", detail, format_bytes(total));
        }
        if let Some(speed) = job.progress.speed_bps {
            detail = format!("{} ({}/s", detail, format_bytes(speed));
            match job.progress.eta_seconds {
                Some(eta) => detail = format!("{}, {})", detail, format_duration(eta)),
                None => detail.push(')'),
            }
        }
        self.bar.set_prefix(detail);

        if job.is_terminal() {
            self.finish(job);
        }
    }

    fn finish(&self, job: &Job) {
        let name = job
            .title()
            .map(str::to_string)
            .or_else(|| job.filename())
            .unwrap_or_else(|| job.url.clone());

        match job.state {
            JobState::Completed => self.bar.finish_with_message(format!(
                "{} {}",
                style("✓").green().bold(),
                truncate(&name, 30)
            )),
            JobState::Failed => self.bar.abandon_with_message(format!(
                "{} {}",
                style("✗").red().bold(),
                job.error
                    .as_ref()
                    .map(|e| truncate(&e.message, 30))
                    .unwrap_or_else(|| "failed".to_string())
            )),
            JobState::Canceled => {
                self.bar
                    .abandon_with_message(format!("{} canceled", style("○").dim()))
            }
            JobState::Queued | JobState::Running => {}
        }
    }
}
