//! Direct HTTP engine adapter
//!
//! Handles plain file links: `probe` issues a HEAD request, `fetch`
//! streams the GET body into the job directory.

use super::throttle::Throttle;
use super::{ExtractionEngine, FetchEvent, FetchRequest};
use crate::error::EngineError;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use unidl_types::{FormatInfo, Metadata, ProgressEvent};

/// Minimum gap between two progress events
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Engine for direct file URLs
#[derive(Debug, Clone)]
pub struct HttpEngine {
    client: Client,
}

impl HttpEngine {
    pub fn new() -> Result<Self, EngineError> {
        let client = Client::builder()
            .user_agent(concat!("unidl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::Extraction(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn run_probe(&self, url: &str) -> Result<Metadata, EngineError> {
        let parsed = check_scheme(url)?;
        debug!(url, "probing direct link");

        let response = self
            .client
            .head(parsed.as_str())
            .send()
            .await
            .map_err(request_error)?;
        let response = check_status(response)?;

        let filename = filename_for(response.url(), response.headers());
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let ext = Path::new(&filename)
            .extension()
            .map(|e| e.to_string_lossy().to_string());

        Ok(Metadata {
            title: Some(filename),
            uploader: None,
            duration: None,
            thumbnail_url: None,
            webpage_url: Some(response.url().to_string()),
            available_formats: vec![FormatInfo {
                format_id: "direct".to_string(),
                ext,
                note: content_type,
                filesize: response.content_length(),
                ..FormatInfo::default()
            }],
        })
    }
}

impl ExtractionEngine for HttpEngine {
    fn name(&self) -> &'static str {
        "http"
    }

    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Metadata, EngineError>> {
        Box::pin(self.run_probe(url))
    }

    fn fetch<'a>(
        &'a self,
        request: FetchRequest<'a>,
        cancel: CancellationToken,
    ) -> BoxStream<'a, Result<FetchEvent, EngineError>> {
        let transfer = Transfer {
            client: self.client.clone(),
            url: request.url.to_string(),
            destination: request.destination.to_path_buf(),
            speed_limit: request.speed_limit,
            cancel,
            phase: Phase::Connect,
        };
        stream::unfold(transfer, Transfer::next_event).boxed()
    }
}

struct Transfer {
    client: Client,
    url: String,
    destination: PathBuf,
    speed_limit: Option<u64>,
    cancel: CancellationToken,
    phase: Phase,
}

enum Phase {
    Connect,
    Body(Body),
    Finishing(PathBuf),
    Done,
}

struct Body {
    response: Response,
    file: File,
    path: PathBuf,
    downloaded: u64,
    total: Option<u64>,
    started: Instant,
    last_emit: Instant,
    throttle: Option<Throttle>,
}

impl Body {
    fn event(&self) -> ProgressEvent {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let speed = (elapsed_ms > 0).then(|| self.downloaded.saturating_mul(1000) / elapsed_ms);
        ProgressEvent {
            bytes_downloaded: self.downloaded,
            total_bytes: self.total,
            speed_bps: speed,
        }
    }
}

impl Transfer {
    async fn next_event(mut self) -> Option<(Result<FetchEvent, EngineError>, Self)> {
        if matches!(self.phase, Phase::Done) {
            return None;
        }

        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Interrupted),
            result = self.advance() => result,
        };

        match result {
            Ok(Some(event)) => Some((Ok(event), self)),
            Ok(None) => None,
            Err(e) => {
                self.phase = Phase::Done;
                Some((Err(e), self))
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<FetchEvent>, EngineError> {
        loop {
            match &mut self.phase {
                Phase::Connect => {
                    check_scheme(&self.url)?;
                    let response = self
                        .client
                        .get(&self.url)
                        .send()
                        .await
                        .map_err(request_error)?;
                    let response = check_status(response)?;

                    let filename = filename_for(response.url(), response.headers());
                    let path = self.destination.join(filename);
                    let file = File::create(&path).await?;
                    debug!(path = %path.display(), "writing direct download");

                    let now = Instant::now();
                    self.phase = Phase::Body(Body {
                        total: response.content_length(),
                        response,
                        file,
                        path,
                        downloaded: 0,
                        started: now,
                        last_emit: now,
                        throttle: self.speed_limit.map(Throttle::new),
                    });
                }
                Phase::Body(body) => match body.response.chunk().await.map_err(request_error)? {
                    Some(chunk) => {
                        body.file.write_all(&chunk).await?;
                        body.downloaded += chunk.len() as u64;
                        if let Some(throttle) = body.throttle.as_mut() {
                            throttle.consume(chunk.len() as u64).await;
                        }
                        if body.last_emit.elapsed() >= PROGRESS_INTERVAL {
                            body.last_emit = Instant::now();
                            return Ok(Some(FetchEvent::Progress(body.event())));
                        }
                    }
                    None => {
                        body.file.flush().await?;
                        let mut event = body.event();
                        if event.total_bytes.is_none() {
                            event.total_bytes = Some(body.downloaded);
                        }
                        let path = body.path.clone();
                        self.phase = Phase::Finishing(path);
                        return Ok(Some(FetchEvent::Progress(event)));
                    }
                },
                Phase::Finishing(path) => {
                    let path = std::mem::take(path);
                    self.phase = Phase::Done;
                    return Ok(Some(FetchEvent::Finished(path)));
                }
                Phase::Done => return Ok(None),
            }
        }
    }
}

fn check_scheme(url: &str) -> Result<url::Url, EngineError> {
    let parsed = url::Url::parse(url).map_err(|e| EngineError::UnsupportedUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(EngineError::UnsupportedUrl(format!(
            "{} links are not supported",
            other
        ))),
    }
}

fn check_status(response: Response) -> Result<Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(status_error(status))
    }
}

fn status_error(status: StatusCode) -> EngineError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            EngineError::NotFound(format!("server returned {}", status))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            EngineError::Network(format!("server returned {}", status))
        }
        s if s.is_server_error() => EngineError::Network(format!("server returned {}", status)),
        s => EngineError::Extraction(format!("server returned {}", s)),
    }
}

fn request_error(error: reqwest::Error) -> EngineError {
    if let Some(status) = error.status() {
        return status_error(status);
    }
    if error.is_builder() {
        return EngineError::UnsupportedUrl(error.to_string());
    }
    EngineError::Network(error.to_string())
}

/// File name from Content-Disposition, else the last path segment
fn filename_for(url: &url::Url, headers: &HeaderMap) -> String {
    let name = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.split("filename=")
                .nth(1)
                .map(|s| s.split(';').next().unwrap_or(s).trim().trim_matches('"').to_string())
        })
        .or_else(|| {
            url.path_segments()
                .and_then(|mut s| s.next_back())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        })
        .unwrap_or_default();
    sanitize_filename(&name)
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn filename_from_disposition() {
        let url = url::Url::parse("https://example.com/files/ignored.bin").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"report.pdf\"; size=10"),
        );
        assert_eq!(filename_for(&url, &headers), "report.pdf");
    }

    #[test]
    fn filename_from_path() {
        let url = url::Url::parse("https://example.com/files/movie.mkv?x=1").unwrap();
        assert_eq!(filename_for(&url, &HeaderMap::new()), "movie.mkv");

        let root = url::Url::parse("https://example.com/").unwrap();
        assert_eq!(filename_for(&root, &HeaderMap::new()), "download");
    }

    #[test]
    fn filename_cannot_escape_directory() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename(".."), "download");
    }

    #[test]
    fn status_classes() {
        assert!(matches!(status_error(StatusCode::NOT_FOUND), EngineError::NotFound(_)));
        assert!(matches!(status_error(StatusCode::BAD_GATEWAY), EngineError::Network(_)));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS),
            EngineError::Network(_)
        ));
        assert!(matches!(status_error(StatusCode::FORBIDDEN), EngineError::Extraction(_)));
    }

    #[tokio::test]
    async fn non_http_scheme_is_unsupported() {
        let engine = HttpEngine::new().unwrap();
        let err = engine.probe("ftp://example.com/file").await.unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedUrl(_)));
    }

    #[tokio::test]
    async fn fetch_writes_body_and_finishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nContent-Disposition: attachment; filename=\"hello.txt\"\r\nConnection: close\r\n\r\nhello world";
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let engine = HttpEngine::with_client(Client::builder().no_proxy().build().unwrap());
        let url = format!("http://{}/hello", addr);
        let events: Vec<_> = engine
            .fetch(
                FetchRequest {
                    url: &url,
                    kind: unidl_types::MediaKind::Video,
                    format: "direct",
                    destination: dir.path(),
                    speed_limit: None,
                },
                CancellationToken::new(),
            )
            .collect()
            .await;

        let last_progress = events
            .iter()
            .filter_map(|e| match e {
                Ok(FetchEvent::Progress(p)) => Some(*p),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_progress.bytes_downloaded, 11);
        assert_eq!(last_progress.total_bytes, Some(11));

        let path = match events.last() {
            Some(Ok(FetchEvent::Finished(path))) => path.clone(),
            other => panic!("unexpected final event: {:?}", other),
        };
        assert_eq!(path, dir.path().join("hello.txt"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello world");
    }

    #[tokio::test]
    async fn cancelled_fetch_is_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = HttpEngine::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut stream = engine.fetch(
            FetchRequest {
                url: "http://127.0.0.1:9/never",
                kind: unidl_types::MediaKind::Video,
                format: "direct",
                destination: dir.path(),
                speed_limit: None,
            },
            cancel,
        );
        assert_eq!(stream.next().await, Some(Err(EngineError::Interrupted)));
        assert!(stream.next().await.is_none());
    }
}
