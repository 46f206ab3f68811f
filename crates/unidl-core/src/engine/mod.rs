//! Extraction engines
//!
//! The orchestrator treats media extraction as an opaque capability:
//! - `probe` resolves a URL into metadata
//! - `fetch` writes the media into a directory and streams progress
//!
//! Two adapters ship with the crate: `YtDlpEngine` drives the yt-dlp
//! executable, `HttpEngine` downloads direct file links.

mod http;
mod throttle;
mod ytdlp;

pub use http::*;
pub use ytdlp::*;

use crate::error::EngineError;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use unidl_types::{MediaKind, Metadata, ProgressEvent};

/// Item of a fetch stream
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    Progress(ProgressEvent),
    /// Final event of a successful fetch, naming the produced file
    Finished(PathBuf),
}

/// Inputs of one fetch
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub kind: MediaKind,
    /// Engine format selector
    pub format: &'a str,
    /// Directory the output must be written into
    pub destination: &'a Path,
    /// Bytes per second; `None` is unlimited
    pub speed_limit: Option<u64>,
}

/// A media extraction backend
///
/// Dropping a fetch stream must stop the underlying transfer.
pub trait ExtractionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Metadata, EngineError>>;

    fn fetch<'a>(
        &'a self,
        request: FetchRequest<'a>,
        cancel: CancellationToken,
    ) -> BoxStream<'a, Result<FetchEvent, EngineError>>;
}
