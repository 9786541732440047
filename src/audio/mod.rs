//! # Audio Module
//!
//! Karaoke queues and the machinery that turns queued links into playable
//! videos with the requested pitch and audio offset.
//!
//! ## Architecture
//!
//! ### [`queue`] and [`registry`]
//! - One [`queue::KaraQueue`] per (guild, channel), created on first use
//! - Structural edits happen under a single async lock per queue
//!
//! ### [`entry`]
//! - A queued video, its settings and its processing lifecycle
//! - Generation counter so that results of superseded runs are discarded
//!
//! ### [`pipeline`] and [`processor`]
//! - Download, pitch shift (sox), mux (ffmpeg) and page generation
//! - A single background worker processes one entry at a time
//!
//! ### [`player`], [`monitor`] and [`manager`]
//! - Optional local playback through MPC-HC's web interface
//! - Command hooks used by the Discord layer

pub mod entry;
pub mod manager;
pub mod monitor;
pub mod pipeline;
pub mod player;
pub mod processor;
pub mod queue;
pub mod registry;

pub use entry::{Entry, EntryId};
pub use manager::{KaraokeManager, QueueEvent, QueueSnapshot};
