pub mod progress;
pub mod ytdlp;

use async_trait::async_trait;
use tracing::debug;

use crate::{
    audio::entry::{Cancellation, Entry, LoadResult},
    error::{PipelineError, SourceError},
};

pub use ytdlp::{Site, YtDlpContext, YtDlpDownloader};

/// Trabajo diferido que descarga el material de una entrada.
///
/// Runs later inside the pipeline. Implementations write files under
/// `entry.path()`, report progress through `entry.set_load_msg`, and return
/// [`PipelineError::Cancelled`] (not a hard error) when `cancel` fires.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, entry: &Entry, cancel: &Cancellation) -> Result<LoadResult, PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub video: bool,
    pub audio: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

pub struct DownloadResult {
    pub title: String,
    pub original_url: String,
    /// Whether Discord can embed `original_url` directly.
    pub embeddable: bool,
    pub loader: Box<dyn Loader>,
}

impl std::fmt::Debug for DownloadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadResult")
            .field("title", &self.title)
            .field("original_url", &self.original_url)
            .field("embeddable", &self.embeddable)
            .finish_non_exhaustive()
    }
}

/// Fuente de videos para un sitio.
#[async_trait]
pub trait Downloader: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, url: &str) -> bool;

    /// Sources without a video track reject requests that ask for one.
    fn audio_only(&self) -> bool {
        false
    }

    /// Validates the URL and fetches metadata. The download itself is
    /// deferred to the returned loader.
    async fn resolve(&self, url: &str, options: LoadOptions) -> Result<DownloadResult, SourceError>;
}

/// Downloaders in registration order; the first one that matches wins.
#[derive(Default)]
pub struct Downloaders {
    downloaders: Vec<Box<dyn Downloader>>,
}

impl Downloaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, downloader: impl Downloader + 'static) -> Self {
        self.downloaders.push(Box::new(downloader));
        self
    }

    /// bilibili, NicoNico, SoundCloud, YouTube.
    pub fn standard(ctx: YtDlpContext) -> Self {
        Site::ALL
            .into_iter()
            .fold(Self::new(), |set, site| set.register(YtDlpDownloader::new(site, ctx.clone())))
    }

    pub fn find(&self, url: &str) -> Option<&dyn Downloader> {
        let found = self.downloaders.iter().find(|d| d.matches(url)).map(|d| d.as_ref());
        if let Some(d) = found {
            debug!("🔗 {} -> {}", url, d.name());
        }
        found
    }

    /// Resolves `url` with the first matching downloader, asking for video
    /// unless the site only serves audio.
    pub async fn resolve(&self, url: &str) -> Result<DownloadResult, SourceError> {
        let downloader = self.find(url).ok_or(SourceError::Unrecognized)?;
        let options = LoadOptions {
            video: !downloader.audio_only(),
            audio: true,
        };
        downloader.resolve(url, options).await
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.downloaders.iter().map(|d| d.name()).collect()
    }
}
