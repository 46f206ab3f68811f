//! CLI command implementations

use crate::output::{format_bytes, format_duration, or_dash, truncate};
use crate::progress::JobBars;
use crate::{ConfigAction, EngineChoice, OutputFormat};
use anyhow::{Context, Result};
use console::style;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use unidl_core::{config, ExtractionEngine, HttpEngine, UnidlCore, YtDlpEngine};
use unidl_types::{Job, JobRequest, JobState, MediaKind, Quality, SessionId, Settings};
use uuid::Uuid;

/// Values from flags and environment that win over the config file
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub download_folder: Option<PathBuf>,
    pub max_downloads: Option<usize>,
    pub speed_limit_kbps: Option<u64>,
}

pub struct GetOptions {
    pub audio: bool,
    pub quality: String,
    pub engine: EngineChoice,
    pub history: Option<PathBuf>,
}

impl Overrides {
    fn config_path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => Ok(config::config_path()?),
        }
    }

    fn load_settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) if path.exists() => config::load_from(path)?,
            Some(_) => Settings::default(),
            None => config::load_or_init()?,
        };

        if let Some(folder) = &self.download_folder {
            settings.download_folder = folder.clone();
        }
        if let Some(max) = self.max_downloads {
            settings.max_concurrent_downloads = max;
        }
        if let Some(kbps) = self.speed_limit_kbps {
            settings.download_speed_limit_kbps = Some(kbps);
        }
        config::validate(&settings)?;
        Ok(settings)
    }
}

fn build_engine(choice: EngineChoice) -> Result<Arc<dyn ExtractionEngine>> {
    Ok(match choice {
        EngineChoice::YtDlp => Arc::new(YtDlpEngine::default()),
        EngineChoice::Http => Arc::new(HttpEngine::new()?),
    })
}

async fn start_core(overrides: &Overrides, engine: EngineChoice) -> Result<UnidlCore> {
    let settings = overrides.load_settings()?;
    let core = UnidlCore::new(settings, build_engine(engine)?)
        .await
        .context("failed to start unidl core")?;
    Ok(core)
}

// ============================================================================
// Download Commands
// ============================================================================

#[derive(Serialize)]
struct GetResult {
    url: String,
    id: Option<Uuid>,
    state: Option<JobState>,
    output_path: Option<PathBuf>,
    error: Option<String>,
}

impl GetResult {
    fn rejected(url: String, error: impl ToString) -> Self {
        Self {
            url,
            id: None,
            state: None,
            output_path: None,
            error: Some(error.to_string()),
        }
    }

    fn from_job(job: Job) -> Self {
        Self {
            url: job.url,
            id: Some(job.id),
            state: Some(job.state),
            output_path: job.output_path,
            error: job.error.map(|e| e.message),
        }
    }

    fn succeeded(&self) -> bool {
        self.state == Some(JobState::Completed)
    }
}

/// Download every URL and wait for all jobs to finish.
///
/// Returns whether every job completed.
pub async fn get(
    overrides: &Overrides,
    urls: Vec<String>,
    options: GetOptions,
    format: OutputFormat,
) -> Result<bool> {
    let core = start_core(overrides, options.engine).await?;
    let session = SessionId::new(format!("cli-{}", std::process::id()));
    let kind = if options.audio {
        MediaKind::Audio
    } else {
        MediaKind::Video
    };
    let quality = Quality::parse(&options.quality);

    let requests: Vec<JobRequest> = urls
        .iter()
        .map(|url| {
            JobRequest::new(url.clone())
                .with_kind(kind)
                .with_quality(quality.clone())
        })
        .collect();
    let submitted = core.submit_batch(requests, &session)?;

    let bars = JobBars::new();
    let mut results = Vec::new();
    let mut watchers = Vec::new();
    let mut ids = Vec::new();

    for (url, outcome) in urls.into_iter().zip(submitted) {
        match outcome {
            Ok(id) => {
                let mut stream = core.subscribe(id, &session)?;
                let bar = bars.add(&url);
                ids.push(id);
                watchers.push(tokio::spawn(async move {
                    let mut last = None;
                    while let Some(job) = stream.next().await {
                        bar.update(&job);
                        last = Some(job);
                    }
                    last
                }));
            }
            Err(e) => {
                bars.println(format!("{} {}: {}", style("✗").red(), url, e));
                results.push(GetResult::rejected(url, e));
            }
        }
    }

    let interrupt = {
        let core = core.clone();
        let session = session.clone();
        let ids = ids.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, canceling {} job(s)", ids.len());
                for id in ids {
                    if let Err(e) = core.cancel(id, &session) {
                        debug!(%id, "cancel skipped: {}", e);
                    }
                }
            }
        })
    };

    for (id, watcher) in ids.iter().zip(watchers) {
        let job = match watcher.await {
            Ok(Some(job)) => job,
            _ => core.get(*id)?,
        };
        results.push(GetResult::from_job(job));
    }
    interrupt.abort();

    if let Some(path) = &options.history {
        let json = core.export_history_json(&session)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("cannot write history to {}", path.display()))?;
        debug!(path = %path.display(), "wrote job history");
    }

    let all_ok = results.iter().all(GetResult::succeeded);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Human => {
            for result in &results {
                match (result.state, &result.output_path) {
                    (_, Some(path)) => println!("{}", path.display()),
                    (Some(JobState::Canceled), None) => {
                        eprintln!("{} {}: canceled", style("○").dim(), result.url)
                    }
                    _ => eprintln!(
                        "{} {}: {}",
                        style("✗").red().bold(),
                        result.url,
                        style(result.error.as_deref().unwrap_or("failed")).red()
                    ),
                }
            }
        }
    }

    core.shutdown();
    Ok(all_ok)
}

// ============================================================================
// Probe Commands
// ============================================================================

pub async fn probe(
    overrides: &Overrides,
    url: &str,
    engine: EngineChoice,
    format: OutputFormat,
) -> Result<()> {
    let core = start_core(overrides, engine).await?;
    let metadata = core.probe(url).await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    println!(
        "{}",
        style(metadata.title.as_deref().unwrap_or("(untitled)")).bold()
    );
    if let Some(ref uploader) = metadata.uploader {
        println!("  Uploader: {}", uploader);
    }
    if let Some(duration) = metadata.duration {
        println!("  Duration: {}", format_duration(duration));
    }
    if let Some(ref thumbnail) = metadata.thumbnail_url {
        println!("  Thumbnail: {}", thumbnail);
    }

    if metadata.available_formats.is_empty() {
        println!("{}", style("No formats reported").dim());
        return Ok(());
    }

    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct FormatRow {
        id: String,
        ext: String,
        resolution: String,
        size: String,
        codecs: String,
        note: String,
    }

    let rows: Vec<FormatRow> = metadata
        .available_formats
        .iter()
        .map(|f| FormatRow {
            id: f.format_id.clone(),
            ext: or_dash(f.ext.clone()),
            resolution: or_dash(f.resolution.clone()),
            size: or_dash(f.filesize.map(format_bytes)),
            codecs: format!(
                "{} / {}",
                f.vcodec.as_deref().unwrap_or("-"),
                f.acodec.as_deref().unwrap_or("-")
            ),
            note: truncate(f.note.as_deref().unwrap_or(""), 24),
        })
        .collect();

    println!();
    println!("{}", Table::new(rows));
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub fn config_action(
    overrides: &Overrides,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = overrides.load_settings()?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                OutputFormat::Human => {
                    println!("unidl configuration:");
                    println!();
                    println!("  Download folder: {}", settings.download_folder.display());
                    println!(
                        "  Max concurrent downloads: {}",
                        settings.max_concurrent_downloads
                    );
                    println!(
                        "  Rate limit: {} per {}",
                        settings.rate_limit_max_requests,
                        format_duration(settings.rate_limit_window_seconds)
                    );
                    println!("  Job retention: {}h", settings.job_retention_hours);
                    println!(
                        "  Job timeout: {}",
                        format_duration(settings.job_timeout_seconds)
                    );
                    println!("  Retries: {}", settings.max_retries);
                    println!(
                        "  Speed limit: {}",
                        settings
                            .speed_limit_bps()
                            .map(|bps| format!("{}/s", format_bytes(bps)))
                            .unwrap_or_else(|| "Unlimited".to_string())
                    );
                }
            }
        }

        Some(ConfigAction::Path) => {
            println!("{}", overrides.config_path()?.display());
        }

        Some(ConfigAction::Init) => {
            let path = overrides.config_path()?;
            if path.exists() {
                println!(
                    "{} Config already exists at {}",
                    style("•").dim(),
                    path.display()
                );
            } else {
                config::save_to(&path, &Settings::default())?;
                println!(
                    "{} Wrote default config to {}",
                    style("✓").green().bold(),
                    path.display()
                );
            }
        }
    }

    Ok(())
}
