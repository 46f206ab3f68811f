//! yt-dlp engine adapter
//!
//! Runs the `yt-dlp` executable as a child process. `probe` parses the
//! `-J` JSON dump, `fetch` reads a machine-readable progress template from
//! stdout, one line per update.

use super::{ExtractionEngine, FetchEvent, FetchRequest};
use crate::error::EngineError;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use unidl_types::{FormatInfo, MediaKind, Metadata, ProgressEvent};

const PROGRESS_PREFIX: &str = "unidl-progress:";

const PROGRESS_TEMPLATE: &str = "download:unidl-progress:%(progress.downloaded_bytes)s:%(progress.total_bytes)s:%(progress.total_bytes_estimate)s:%(progress.speed)s";

const OUTPUT_TEMPLATE: &str = "%(title).120s [%(id)s].%(ext)s";

/// Cap on captured stderr, enough for the final error lines
const STDERR_LIMIT: usize = 64 * 1024;

/// Engine backed by the yt-dlp executable
#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    program: PathBuf,
    extra_args: Vec<OsString>,
}

impl Default for YtDlpEngine {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl YtDlpEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    /// Arguments passed to every invocation (cookies, proxies, ...)
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, error: std::io::Error) -> EngineError {
        if error.kind() == std::io::ErrorKind::NotFound {
            EngineError::Extraction(format!(
                "{} executable not found",
                self.program.display()
            ))
        } else {
            EngineError::Extraction(format!("failed to start {}: {}", self.program.display(), error))
        }
    }

    async fn run_probe(&self, url: &str) -> Result<Metadata, EngineError> {
        let output = self
            .command()
            .args(["-J", "--no-playlist", "--no-warnings", "--"])
            .arg(url)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(classify_stderr(&String::from_utf8_lossy(&output.stderr)));
        }

        let info: RawInfo = serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::Extraction(format!("unreadable metadata: {}", e)))?;
        Ok(info.into_metadata())
    }
}

impl ExtractionEngine for YtDlpEngine {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Metadata, EngineError>> {
        Box::pin(self.run_probe(url))
    }

    fn fetch<'a>(
        &'a self,
        request: FetchRequest<'a>,
        cancel: CancellationToken,
    ) -> BoxStream<'a, Result<FetchEvent, EngineError>> {
        let mut cmd = self.command();
        cmd.args(fetch_args(&request));

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return stream::once(futures::future::ready(Err(self.spawn_error(e)))).boxed(),
        };
        debug!(url = request.url, format = request.format, "spawned yt-dlp");

        let Some(stdout) = child.stdout.take() else {
            return stream::once(futures::future::ready(Err(EngineError::Extraction(
                "yt-dlp stdout not captured".into(),
            ))))
            .boxed();
        };
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = (&mut pipe).take(STDERR_LIMIT as u64).read_to_end(&mut buf).await;
                // Keep draining so the child never blocks on a full pipe
                let _ = tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let state = FetchState {
            child,
            lines: BufReader::new(stdout).lines(),
            stderr,
            output: None,
            cancel,
            done: false,
        };
        stream::unfold(state, FetchState::next_event).boxed()
    }
}

/// Command-line arguments of a fetch, without the program and extra args
pub fn fetch_args(request: &FetchRequest<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-f".into(),
        request.format.into(),
        "--no-playlist".into(),
        "--no-warnings".into(),
        "--newline".into(),
        "--progress".into(),
        "--progress-template".into(),
        PROGRESS_TEMPLATE.into(),
        "--print".into(),
        "after_move:filepath".into(),
        "-o".into(),
        request.destination.join(OUTPUT_TEMPLATE).into_os_string(),
    ];

    match request.kind {
        MediaKind::Audio => {
            args.extend(
                ["-x", "--audio-format", "mp3", "--audio-quality", "192K"].map(OsString::from),
            );
        }
        MediaKind::Video => {
            args.extend(["--merge-output-format", "mp4"].map(OsString::from));
        }
    }

    if let Some(limit) = request.speed_limit {
        args.push("--limit-rate".into());
        args.push(limit.to_string().into());
    }

    args.push("--".into());
    args.push(request.url.into());
    args
}

struct FetchState {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr: Option<JoinHandle<String>>,
    output: Option<PathBuf>,
    cancel: CancellationToken,
    done: bool,
}

impl FetchState {
    async fn next_event(mut self) -> Option<(Result<FetchEvent, EngineError>, Self)> {
        if self.done {
            return None;
        }

        loop {
            let line = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.done = true;
                    let _ = self.child.start_kill();
                    return Some((Err(EngineError::Interrupted), self));
                }
                line = self.lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    if let Some(event) = parse_progress_line(&line) {
                        return Some((Ok(FetchEvent::Progress(event)), self));
                    }
                    let line = line.trim();
                    if !line.is_empty() {
                        // `--print after_move:filepath` is the only other stdout output
                        self.output = Some(PathBuf::from(line));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.done = true;
                    return Some((
                        Err(EngineError::Extraction(format!("reading yt-dlp output: {}", e))),
                        self,
                    ));
                }
            }
        }

        self.done = true;
        let status = self.child.wait().await;
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        let result = match status {
            Err(e) => Err(EngineError::Extraction(format!("waiting for yt-dlp: {}", e))),
            Ok(status) if !status.success() => Err(classify_stderr(&stderr)),
            Ok(_) => match self.output.take() {
                Some(path) => Ok(FetchEvent::Finished(path)),
                None => Err(EngineError::Extraction(
                    "yt-dlp did not report an output file".into(),
                )),
            },
        };
        Some((result, self))
    }
}

/// Parse one line produced by the progress template
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let mut fields = rest.split(':').map(parse_number);

    let downloaded = fields.next()??;
    let total = fields.next().flatten();
    let estimate = fields.next().flatten();
    let speed = fields.next().flatten();

    Some(ProgressEvent {
        bytes_downloaded: downloaded,
        total_bytes: total.or(estimate),
        speed_bps: speed,
    })
}

fn parse_number(field: &str) -> Option<u64> {
    let value: f64 = field.trim().parse().ok()?;
    (value.is_finite() && value >= 0.0).then(|| value as u64)
}

/// Map yt-dlp's stderr to an engine error with a readable message
pub fn classify_stderr(stderr: &str) -> EngineError {
    let message = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| stderr.lines().rev().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("")
        .trim_start_matches("ERROR:")
        .trim()
        .to_string();
    let lowered = message.to_lowercase();

    if lowered.contains("unsupported url") {
        return EngineError::UnsupportedUrl(message);
    }
    if lowered.contains("sign in to confirm you\u{2019}re not a bot")
        || lowered.contains("sign in to confirm you're not a bot")
    {
        return EngineError::NotFound(
            "The site blocked this request and wants verification. Provide cookies from a signed-in browser and retry."
                .into(),
        );
    }
    if lowered.contains("private video") || lowered.contains("this video is private") {
        return EngineError::NotFound(
            "This video is private. Ask the uploader for access before downloading.".into(),
        );
    }
    if lowered.contains("members-only") {
        return EngineError::NotFound(
            "This video is for channel members only. Sign in with an account that has access."
                .into(),
        );
    }
    if lowered.contains("premium") || lowered.contains("requires payment") {
        return EngineError::NotFound(
            "This content requires a paid subscription. Provide cookies from an account with access."
                .into(),
        );
    }
    if lowered.contains("404") || lowered.contains("video unavailable") {
        return EngineError::NotFound(message);
    }
    if lowered.contains("timed out")
        || lowered.contains("connection reset")
        || lowered.contains("connection refused")
        || lowered.contains("temporary failure in name resolution")
        || lowered.contains("unable to download")
        || lowered.contains("http error 5")
        || lowered.contains("http error 429")
    {
        return EngineError::Network(message);
    }
    if message.is_empty() {
        return EngineError::Extraction("yt-dlp failed without an error message".into());
    }
    EngineError::Extraction(message)
}

// ============================================================================
// yt-dlp JSON
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<RawThumbnail>,
    webpage_url: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: String,
    ext: Option<String>,
    resolution: Option<String>,
    format_note: Option<String>,
    filesize: Option<u64>,
    filesize_approx: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    fps: Option<f64>,
    abr: Option<f64>,
}

impl RawInfo {
    fn into_metadata(self) -> Metadata {
        let thumbnail = self
            .thumbnail
            .or_else(|| self.thumbnails.into_iter().rev().find_map(|t| t.url))
            .map(|url| match url.strip_prefix("http://") {
                Some(rest) => format!("https://{}", rest),
                None => url,
            });

        Metadata {
            title: self.title,
            uploader: self.uploader,
            duration: self.duration.map(|d| d.round() as u64),
            thumbnail_url: thumbnail,
            webpage_url: self.webpage_url,
            available_formats: self
                .formats
                .into_iter()
                .map(|f| FormatInfo {
                    filesize: f.filesize.or(f.filesize_approx.map(|s| s as u64)),
                    format_id: f.format_id,
                    ext: f.ext,
                    resolution: f.resolution,
                    note: f.format_note,
                    vcodec: f.vcodec,
                    acodec: f.acodec,
                    fps: f.fps,
                    abr: f.abr,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn parses_progress_template_line() {
        let event = parse_progress_line("unidl-progress:1024:4096:NA:512.5").unwrap();
        assert_eq!(event.bytes_downloaded, 1024);
        assert_eq!(event.total_bytes, Some(4096));
        assert_eq!(event.speed_bps, Some(512));
    }

    #[test]
    fn falls_back_to_estimated_total() {
        let event = parse_progress_line("unidl-progress:10:NA:2000.7:NA").unwrap();
        assert_eq!(event.total_bytes, Some(2000));
        assert_eq!(event.speed_bps, None);
    }

    #[test]
    fn other_lines_are_not_progress() {
        assert!(parse_progress_line("/tmp/job/video.mp4").is_none());
        assert!(parse_progress_line("unidl-progress:NA:NA:NA:NA").is_none());
    }

    #[test]
    fn audio_args_extract_mp3() {
        let dest = Path::new("/downloads/job");
        let args = fetch_args(&FetchRequest {
            url: "https://example.com/watch?v=1",
            kind: MediaKind::Audio,
            format: "bestaudio/best",
            destination: dest,
            speed_limit: None,
        });
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.windows(2).any(|w| w == ["--audio-format", "mp3"]));
        assert!(args.windows(2).any(|w| w == ["-f", "bestaudio/best"]));
        assert!(args.contains(&"/downloads/job/%(title).120s [%(id)s].%(ext)s".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/watch?v=1"));
    }

    #[test]
    fn video_args_merge_to_mp4() {
        let args = fetch_args(&FetchRequest {
            url: "https://example.com/v",
            kind: MediaKind::Video,
            format: "bestvideo+bestaudio/best",
            destination: Path::new("/d"),
            speed_limit: None,
        });
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.windows(2).any(|w| w == ["--merge-output-format", "mp4"]));
        assert!(!args.contains(&"-x".to_string()));
        assert!(!args.contains(&"--limit-rate".to_string()));
    }

    #[test]
    fn speed_limit_is_passed_before_url() {
        let args = fetch_args(&FetchRequest {
            url: "https://example.com/v",
            kind: MediaKind::Video,
            format: "best",
            destination: Path::new("/d"),
            speed_limit: Some(51_200),
        });
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        let at = args.iter().position(|a| a == "--limit-rate").unwrap();
        assert_eq!(args[at + 1], "51200");
        assert!(at < args.iter().position(|a| a == "--").unwrap());
    }

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify_stderr("ERROR: Unsupported URL: https://example.com"),
            EngineError::UnsupportedUrl(_)
        ));
        assert!(matches!(
            classify_stderr("WARNING: x\nERROR: [youtube] abc: Private video. Sign in"),
            EngineError::NotFound(_)
        ));
        assert!(matches!(
            classify_stderr("ERROR: Unable to download webpage: The read operation timed out"),
            EngineError::Network(_)
        ));
        assert!(matches!(
            classify_stderr("ERROR: Postprocessing: ffprobe and ffmpeg not found"),
            EngineError::Extraction(_)
        ));
        assert!(matches!(classify_stderr(""), EngineError::Extraction(_)));
    }

    #[test]
    fn bot_check_gets_friendly_message() {
        match classify_stderr("ERROR: [youtube] x: Sign in to confirm you're not a bot") {
            EngineError::NotFound(msg) => assert!(msg.contains("verification")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn metadata_prefers_https_thumbnail() {
        let json = r#"{
            "title": "Clip",
            "duration": 61.6,
            "thumbnails": [{"url": "http://img/low.jpg"}, {"url": "http://img/high.jpg"}],
            "formats": [{"format_id": "18", "ext": "mp4", "filesize_approx": 1000.0}]
        }"#;
        let info: RawInfo = serde_json::from_str(json).unwrap();
        let meta = info.into_metadata();
        assert_eq!(meta.title.as_deref(), Some("Clip"));
        assert_eq!(meta.duration, Some(62));
        assert_eq!(meta.thumbnail_url.as_deref(), Some("https://img/high.jpg"));
        assert_eq!(meta.available_formats[0].filesize, Some(1000));
    }
}
