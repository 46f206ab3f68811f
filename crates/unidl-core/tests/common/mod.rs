//! Shared fixtures for orchestration tests
#![allow(dead_code)]

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use unidl_core::{EngineError, ExtractionEngine, FetchEvent, FetchRequest, UnidlCore};
use unidl_types::{Job, JobState, Metadata, ProgressEvent, Settings};
use uuid::Uuid;

/// What the scripted engine does for a URL
#[derive(Clone)]
pub enum Behavior {
    /// Emit progress to 100% and write a file
    Succeed,
    /// Emit the given progress events, then succeed
    Progress(Vec<ProgressEvent>),
    /// Fail the first `n` fetches with a network error, then succeed
    FailTimes(u32),
    /// Fail every fetch with this error
    AlwaysFail(EngineError),
    /// Fail the probe with this error
    ProbeFails(EngineError),
    /// Never yield anything
    Hang,
    /// Report some progress, then wait for the gate before succeeding
    Gated(Arc<Notify>),
}

/// In-memory engine with per-URL behaviors and call counters
pub struct ScriptedEngine {
    behaviors: Mutex<HashMap<String, Behavior>>,
    fallback: Behavior,
    probes: Mutex<HashMap<String, u32>>,
    fetches: Mutex<HashMap<String, u32>>,
    tokens: Mutex<HashMap<String, Vec<CancellationToken>>>,
    limits: Mutex<HashMap<String, Vec<Option<u64>>>>,
}

impl ScriptedEngine {
    pub fn new(fallback: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(HashMap::new()),
            fallback,
            probes: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
        })
    }

    pub fn script(&self, url: &str, behavior: Behavior) {
        self.behaviors.lock().insert(url.to_string(), behavior);
    }

    pub fn probe_count(&self, url: &str) -> u32 {
        self.probes.lock().get(url).copied().unwrap_or(0)
    }

    pub fn fetch_count(&self, url: &str) -> u32 {
        self.fetches.lock().get(url).copied().unwrap_or(0)
    }

    /// Speed limit handed to each fetch of `url`, in call order
    pub fn speed_limits(&self, url: &str) -> Vec<Option<u64>> {
        self.limits.lock().get(url).cloned().unwrap_or_default()
    }

    /// Whether every cancellation token handed to fetches of `url` was canceled
    pub fn all_fetches_signaled(&self, url: &str) -> bool {
        self.tokens
            .lock()
            .get(url)
            .map(|tokens| !tokens.is_empty() && tokens.iter().all(|t| t.is_cancelled()))
            .unwrap_or(false)
    }

    fn behavior(&self, url: &str) -> Behavior {
        self.behaviors
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

fn write_output(destination: &Path) -> Result<std::path::PathBuf, EngineError> {
    let path = destination.join("media.mp4");
    std::fs::write(&path, b"media bytes")?;
    Ok(path)
}

fn finished_stream<'a>(
    events: Vec<ProgressEvent>,
    destination: &Path,
) -> BoxStream<'a, Result<FetchEvent, EngineError>> {
    let finished = write_output(destination).map(FetchEvent::Finished);
    stream::iter(
        events
            .into_iter()
            .map(|e| Ok(FetchEvent::Progress(e)))
            .chain(std::iter::once(finished)),
    )
    .boxed()
}

fn full_progress() -> Vec<ProgressEvent> {
    (1..=4)
        .map(|i| ProgressEvent::new(i * 100, Some(400)).with_speed(1000))
        .collect()
}

impl ExtractionEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Metadata, EngineError>> {
        *self.probes.lock().entry(url.to_string()).or_default() += 1;
        let behavior = self.behavior(url);
        Box::pin(async move {
            match behavior {
                Behavior::ProbeFails(e) => Err(e),
                _ => Ok(Metadata {
                    title: Some(format!("title of {}", url)),
                    duration: Some(60),
                    ..Metadata::default()
                }),
            }
        })
    }

    fn fetch<'a>(
        &'a self,
        request: FetchRequest<'a>,
        cancel: CancellationToken,
    ) -> BoxStream<'a, Result<FetchEvent, EngineError>> {
        let count = {
            let mut fetches = self.fetches.lock();
            let count = fetches.entry(request.url.to_string()).or_default();
            *count += 1;
            *count
        };
        self.tokens
            .lock()
            .entry(request.url.to_string())
            .or_default()
            .push(cancel.clone());
        self.limits
            .lock()
            .entry(request.url.to_string())
            .or_default()
            .push(request.speed_limit);

        match self.behavior(request.url) {
            Behavior::Succeed | Behavior::ProbeFails(_) => {
                finished_stream(full_progress(), request.destination)
            }
            Behavior::Progress(events) => finished_stream(events, request.destination),
            Behavior::FailTimes(n) if count <= n => stream::once(async {
                Err::<FetchEvent, _>(EngineError::Network("connection reset by peer".into()))
            })
            .boxed(),
            Behavior::FailTimes(_) => finished_stream(full_progress(), request.destination),
            Behavior::AlwaysFail(e) => stream::once(async move { Err::<FetchEvent, _>(e) }).boxed(),
            Behavior::Hang => stream::pending().boxed(),
            Behavior::Gated(gate) => {
                let destination = request.destination.to_path_buf();
                let first = stream::once(async {
                    Ok(FetchEvent::Progress(ProgressEvent::new(10, Some(100))))
                });
                let rest = stream::once(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(EngineError::Interrupted),
                        _ = gate.notified() => write_output(&destination).map(FetchEvent::Finished),
                    }
                });
                first.chain(rest).boxed()
            }
        }
    }
}

/// Settings pointing at `dir`, with fast retries
pub fn settings(dir: &Path) -> Settings {
    Settings {
        download_folder: dir.to_path_buf(),
        retry_base_delay_ms: 10,
        retry_max_delay_seconds: 1,
        ..Settings::default()
    }
}

pub async fn core(engine: Arc<ScriptedEngine>, settings: Settings) -> UnidlCore {
    UnidlCore::new(settings, engine).await.unwrap()
}

/// Poll `check` every 10ms until it holds or `limit` elapses
pub async fn eventually_within(limit: Duration, mut check: impl FnMut() -> bool) {
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while waited <= limit {
        if check() {
            return;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    panic!("condition not reached within {:?}", limit);
}

pub async fn eventually(check: impl FnMut() -> bool) {
    eventually_within(Duration::from_secs(5), check).await
}

/// Wait until the job reaches `state` and return its snapshot
pub async fn wait_for_state(core: &UnidlCore, id: Uuid, state: JobState) -> Job {
    wait_for_state_within(core, id, state, Duration::from_secs(5)).await
}

pub async fn wait_for_state_within(
    core: &UnidlCore,
    id: Uuid,
    state: JobState,
    limit: Duration,
) -> Job {
    eventually_within(limit, || {
        core.get(id).map(|job| job.state == state).unwrap_or(false)
    })
    .await;
    core.get(id).unwrap()
}
