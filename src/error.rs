//! Error taxonomy for the karaoke core.
//!
//! User input problems ([`QueueError`], [`RegistryError`]) are reported back to
//! whoever issued the command and never touch queue state. Pipeline problems
//! ([`PipelineError`]) end up as the entry's `error_msg`, except for
//! [`PipelineError::Cancelled`], which is not an error at all.

use serenity::model::id::GuildId;
use thiserror::Error;

/// Errores de operaciones sobre una cola.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is full! Delete some items with `/delete` (max {max})")]
    QueueFull { max: usize },

    #[error("Each user may only have {max} songs in the queue!")]
    UserLimit { max: usize },

    #[error("Invalid index!")]
    InvalidIndex(usize),

    #[error("No song currently playing!")]
    NothingPlaying,

    #[error("No songs in queue!")]
    Empty,

    #[error("Slow down! The queue was just advanced.")]
    Debounced,

    #[error("That song is no longer in the queue.")]
    EntryNotFound,

    #[error("Pitch shift must be between -{max} and {max} semitones.")]
    PitchOutOfRange { max: i32 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("guild {0} is not allowed to use this bot")]
    Unauthorized(GuildId),
}

/// Acceso a una entrada que todavía no está lista (o ya no existe).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntryError {
    #[error("entry has not been processed")]
    NotProcessed,

    #[error("entry was deleted")]
    Deleted,
}

/// Fallo de un binario externo (ffmpeg, sox, yt-dlp...).
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("could not start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{binary} exited with code {}: {stderr}", code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Exit {
        binary: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Load(String),

    #[error("could not read video dimensions: {0}")]
    Probe(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("processing task crashed")]
    Panicked,
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

/// Errores al resolver una URL con un [`Downloader`](crate::sources::Downloader).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Unrecognized url!")]
    Unrecognized,

    #[error("Please only queue videos shorter than {limit_mins} minutes.")]
    TooLong { limit_mins: u64 },

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Unsupported(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("could not parse video info: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("player request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("could not launch player: {0}")]
    Launch(#[from] std::io::Error),
}

/// Lo que puede fallar al ejecutar un comando del bot.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("could not prepare a working directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Local playback is not configured.")]
    NoPlayer,
}
