//! A single queued karaoke video and its processing state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serenity::model::id::UserId;
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::KaraQueue;
use crate::{
    error::{EntryError, PipelineError},
    sources::Loader,
};

pub type EntryId = u64;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Archivos crudos descargados para una entrada (rutas relativas a su directorio).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadResult {
    pub video_path: Option<PathBuf>,
    pub audio_path: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
}

impl LoadResult {
    /// Folds the partial result of another loader into this one. Fields the
    /// other loader left empty never clear what an earlier loader produced.
    pub fn merge(&mut self, other: LoadResult) {
        if other.video_path.is_some() {
            self.video_path = other.video_path;
        }
        if other.audio_path.is_some() {
            self.audio_path = other.audio_path;
        }
        if other.width != 0 {
            self.width = other.width;
        }
        if other.height != 0 {
            self.height = other.height;
        }
    }

    pub fn has_dimensions(&self) -> bool {
        self.width != 0 && self.height != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Fresh,
    Downloading,
    Transcoding,
    Processed,
    Failed,
    Cancelled,
}

/// What a finished pipeline produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Nothing was transcoded; the source URL is played as is.
    Original { media_path: PathBuf },
    /// A generated file plus the page that embeds it.
    Generated {
        media_path: PathBuf,
        page_url: String,
        cache_token: String,
    },
}

impl Artifact {
    pub fn media_path(&self) -> &Path {
        match self {
            Artifact::Original { media_path } | Artifact::Generated { media_path, .. } => {
                media_path
            }
        }
    }
}

/// Every signal a pipeline run must respect; any one of them aborts the run.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    tokens: Vec<CancellationToken>,
}

impl Cancellation {
    pub fn new(tokens: Vec<CancellationToken>) -> Self {
        Self { tokens }
    }

    pub fn is_cancelled(&self) -> bool {
        self.tokens.iter().any(|t| t.is_cancelled())
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves as soon as any of the tokens is cancelled.
    pub async fn cancelled(&self) {
        if self.tokens.is_empty() {
            return std::future::pending().await;
        }
        let waits = self.tokens.iter().map(|t| Box::pin(t.cancelled()));
        futures::future::select_all(waits).await;
    }

    /// Drives `fut` unless cancellation fires first, in which case `fut` is
    /// dropped (killing any child process it owns).
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, PipelineError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(PipelineError::Cancelled),
            out = fut => Ok(out),
        }
    }
}

/// Ticket handed to the pipeline by [`Entry::begin_processing`].
#[derive(Debug, Clone)]
pub struct ProcessingRun {
    pub generation: u64,
    pub cancel: Cancellation,
}

/// Snapshot used by the status message while an entry is loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStatus {
    pub state: ProcessState,
    pub load_msg: String,
    pub error_msg: String,
}

/// Datos con los que se crea una entrada.
pub struct NewEntry {
    pub path: PathBuf,
    pub title: String,
    pub original_url: String,
    pub embeddable: bool,
    pub user_id: UserId,
    pub pitch_shift: i32,
    pub offset_ms: i64,
    pub loaders: Vec<Box<dyn Loader>>,
}

#[derive(Debug)]
struct EntryState {
    pitch_shift: i32,
    offset_ms: i64,
    process: ProcessState,
    generation: u64,
    run_token: Option<CancellationToken>,
    load_msg: String,
    error_msg: String,
    load_result: Option<LoadResult>,
    artifact: Option<Artifact>,
    deleted: bool,
}

pub struct Entry {
    id: EntryId,
    path: PathBuf,
    title: String,
    original_url: String,
    embeddable: bool,
    user_id: UserId,
    added_at: DateTime<Utc>,
    loaders: Vec<Box<dyn Loader>>,
    queue: Weak<KaraQueue>,
    state: Mutex<EntryState>,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("path", &self.path)
            .field("state", &self.state.lock().process)
            .finish()
    }
}

impl Entry {
    /// `queue` is a non-owning handle used to read the queue-wide offset.
    pub fn new(fields: NewEntry, queue: Weak<KaraQueue>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            path: fields.path,
            title: fields.title,
            original_url: fields.original_url,
            embeddable: fields.embeddable,
            user_id: fields.user_id,
            added_at: Utc::now(),
            loaders: fields.loaders,
            queue,
            state: Mutex::new(EntryState {
                pitch_shift: fields.pitch_shift,
                offset_ms: fields.offset_ms,
                process: ProcessState::Fresh,
                generation: 0,
                run_token: None,
                load_msg: String::new(),
                error_msg: String::new(),
                load_result: None,
                artifact: None,
                deleted: false,
            }),
        })
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Working directory owned by this entry.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn original_url(&self) -> &str {
        &self.original_url
    }

    pub fn embeddable(&self) -> bool {
        self.embeddable
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn loaders(&self) -> &[Box<dyn Loader>] {
        &self.loaders
    }

    pub fn pitch_shift(&self) -> i32 {
        self.state.lock().pitch_shift
    }

    pub fn offset_ms(&self) -> i64 {
        self.state.lock().offset_ms
    }

    /// Entry offset plus the owning queue's global offset.
    pub fn effective_offset_ms(&self) -> i64 {
        let global = self
            .queue
            .upgrade()
            .map(|q| q.global_offset_ms())
            .unwrap_or(0);
        self.offset_ms() + global
    }

    /// Título con el pitch y el offset si no son cero.
    pub fn name(&self) -> String {
        let state = self.state.lock();
        let mut name = self.title.clone();
        if state.pitch_shift != 0 {
            name.push_str(&format!(" [{:+}]", state.pitch_shift));
        }
        if state.offset_ms != 0 {
            name.push_str(&format!(" [{:+}ms]", state.offset_ms));
        }
        name
    }

    /// Returns true if the value changed. Callers follow up with [`Entry::reset`].
    pub fn set_pitch_shift(&self, pitch_shift: i32) -> bool {
        let mut state = self.state.lock();
        let changed = state.pitch_shift != pitch_shift;
        state.pitch_shift = pitch_shift;
        changed
    }

    pub fn set_offset_ms(&self, offset_ms: i64) -> bool {
        let mut state = self.state.lock();
        let changed = state.offset_ms != offset_ms;
        state.offset_ms = offset_ms;
        changed
    }

    pub fn status(&self) -> EntryStatus {
        let state = self.state.lock();
        EntryStatus {
            state: state.process,
            load_msg: state.load_msg.clone(),
            error_msg: state.error_msg.clone(),
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state.lock().process
    }

    pub fn processed(&self) -> bool {
        self.state.lock().process == ProcessState::Processed
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// Whether the background processor may pick this entry up.
    pub fn needs_processing(&self) -> bool {
        let state = self.state.lock();
        !state.deleted && state.process == ProcessState::Fresh
    }

    pub fn set_load_msg(&self, msg: impl Into<String>) {
        self.state.lock().load_msg = msg.into();
    }

    /// Playable link for this entry.
    ///
    /// The original URL when nothing had to be transcoded, otherwise the
    /// generated page with the cache-busting token of the last completed run.
    pub fn url(&self) -> Result<String, EntryError> {
        let state = self.state.lock();
        if state.deleted {
            return Err(EntryError::Deleted);
        }
        match (&state.process, &state.artifact) {
            (ProcessState::Processed, Some(Artifact::Original { .. })) => {
                Ok(self.original_url.clone())
            }
            (
                ProcessState::Processed,
                Some(Artifact::Generated {
                    page_url,
                    cache_token,
                    ..
                }),
            ) => Ok(format!("{}?{}", page_url, cache_token)),
            _ => Err(EntryError::NotProcessed),
        }
    }

    /// Local path of the playable file.
    pub fn video_path(&self) -> Result<PathBuf, EntryError> {
        let state = self.state.lock();
        if state.deleted {
            return Err(EntryError::Deleted);
        }
        match (&state.process, &state.artifact) {
            (ProcessState::Processed, Some(artifact)) => Ok(artifact.media_path().to_path_buf()),
            _ => Err(EntryError::NotProcessed),
        }
    }

    /// A change that requires reprocessing was made.
    ///
    /// Cancels the in-flight run, if any, and puts the entry back into
    /// `Fresh`. The downloaded media stays cached so only the transcode reruns.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        Self::reset_locked(&mut state);
        debug!("🔄 Entrada {} marcada para reprocesar", self.id);
    }

    /// Like [`Entry::reset`], but also forgets the downloaded media so the
    /// next run downloads again. Stale files are cleared by that run.
    pub fn reload(&self) {
        let mut state = self.state.lock();
        Self::reset_locked(&mut state);
        state.load_result = None;
        drop(state);
        info!("♻️ Recargando {}", self.title);
    }

    fn reset_locked(state: &mut EntryState) {
        if let Some(token) = state.run_token.take() {
            token.cancel();
        }
        state.generation += 1;
        state.process = ProcessState::Fresh;
        state.artifact = None;
        state.load_msg.clear();
        state.error_msg.clear();
    }

    /// Deletes everything associated with this entry, including its
    /// working directory.
    pub async fn delete(&self) {
        {
            let mut state = self.state.lock();
            if let Some(token) = state.run_token.take() {
                token.cancel();
            }
            state.generation += 1;
            state.deleted = true;
            state.artifact = None;
        }

        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => debug!("🗑️ Directorio eliminado: {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("No se pudo eliminar {}: {}", self.path.display(), e),
        }
    }

    /// Starts a new run: cancels any stale one and hands out a fresh token.
    /// Returns `None` for deleted entries.
    pub fn begin_processing(&self, shutdown: &CancellationToken) -> Option<ProcessingRun> {
        let mut state = self.state.lock();
        if state.deleted {
            return None;
        }
        if let Some(stale) = state.run_token.take() {
            warn!("⚠️ Entrada {} tenía una tarea previa, cancelándola", self.id);
            stale.cancel();
        }
        let token = CancellationToken::new();
        state.run_token = Some(token.clone());
        state.error_msg.clear();
        Some(ProcessingRun {
            generation: state.generation,
            cancel: Cancellation::new(vec![token, shutdown.clone()]),
        })
    }

    /// Moves the state machine forward, unless the run was superseded.
    pub(crate) fn advance_state(&self, generation: u64, next: ProcessState) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || state.deleted {
            return false;
        }
        state.process = next;
        true
    }

    pub(crate) fn cached_load_result(&self) -> Option<LoadResult> {
        self.state.lock().load_result.clone()
    }

    pub(crate) fn store_load_result(&self, generation: u64, result: LoadResult) {
        let mut state = self.state.lock();
        if state.generation == generation && !state.deleted {
            state.load_result = Some(result);
        }
    }

    /// Commits the outcome of a run. Returns false if the run was superseded
    /// by an edit, a reload or a delete, in which case nothing changes.
    pub fn finish(
        &self,
        generation: u64,
        outcome: Result<Artifact, PipelineError>,
        shutting_down: bool,
    ) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || state.deleted {
            debug!("Resultado obsoleto para entrada {}, descartado", self.id);
            return false;
        }
        state.run_token = None;

        match outcome {
            Ok(artifact) => {
                state.process = ProcessState::Processed;
                state.artifact = Some(artifact);
                info!("✅ Procesado: {}", self.original_url);
            }
            Err(PipelineError::Cancelled) => {
                state.load_msg.clear();
                state.process = if shutting_down {
                    ProcessState::Cancelled
                } else {
                    ProcessState::Fresh
                };
                debug!("⏹️ Procesamiento cancelado: {}", self.original_url);
            }
            Err(e) => {
                warn!("❌ Error procesando {}: {}", self.original_url, e);
                state.process = ProcessState::Failed;
                state.error_msg = format!("Error: {}", e);
            }
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn new_entry(dir: &Path, title: &str, user: u64) -> NewEntry {
        NewEntry {
            path: dir.to_path_buf(),
            title: title.to_string(),
            original_url: format!("https://www.youtube.com/watch?v={}", title),
            embeddable: true,
            user_id: UserId::new(user),
            pitch_shift: 0,
            offset_ms: 0,
            loaders: Vec::new(),
        }
    }

    pub fn detached(dir: &Path, title: &str, user: u64) -> Arc<Entry> {
        Entry::new(new_entry(dir, title, user), Weak::new())
    }
}
