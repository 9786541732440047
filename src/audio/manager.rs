use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    entry::{Entry, EntryId, NewEntry, ProcessState},
    monitor::{MonitorOutcome, PlayerMonitor, PollSchedule},
    pipeline::ArtifactLayout,
    player::Player,
    processor::WorkSignal,
    queue::{KaraQueue, QueueGuard},
    registry::QueueRegistry,
};
use crate::{
    error::{CommandError, EntryError, QueueError},
    sources::Downloaders,
};

const PROCESSED_POLL: Duration = Duration::from_millis(500);

/// Largest pitch shift accepted in either direction, in semitones.
pub const MAX_PITCH_SHIFT: i32 = 12;

fn check_pitch(pitch_shift: i32) -> Result<(), QueueError> {
    if (-MAX_PITCH_SHIFT..=MAX_PITCH_SHIFT).contains(&pitch_shift) {
        Ok(())
    } else {
        Err(QueueError::PitchOutOfRange { max: MAX_PITCH_SHIFT })
    }
}

/// Avisos para la capa de Discord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// The local player finished a song and the queue moved on by itself.
    Advanced {
        guild_id: GuildId,
        channel_id: ChannelId,
        entry_id: EntryId,
    },
}

/// Read-only view of a queue taken under its lock.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub current: Option<Arc<Entry>>,
    pub pending: Vec<Arc<Entry>>,
    pub rendered: String,
    pub global_offset_ms: i64,
    pub local_mode: bool,
}

/// Target of `/pitch`, `/offset` and `/reload`: 0 is the song playing now,
/// 1.. are positions in the queue.
fn target(guard: &QueueGuard<'_>, index: usize) -> Result<Arc<Entry>, QueueError> {
    if index == 0 {
        return guard.current().cloned().ok_or(QueueError::NothingPlaying);
    }
    guard
        .get(index - 1)
        .cloned()
        .map_err(|_| QueueError::InvalidIndex(index))
}

/// Hooks the command surface uses to drive the queues.
///
/// Every operation that adds or invalidates processable work signals the
/// background processor exactly once.
pub struct KaraokeManager {
    registry: Arc<QueueRegistry>,
    signal: Arc<WorkSignal>,
    layout: ArtifactLayout,
    downloaders: Downloaders,
    player: Option<Arc<dyn Player>>,
    schedule: PollSchedule,
    debounce: Duration,
    shutdown: CancellationToken,
    events: broadcast::Sender<QueueEvent>,
}

impl KaraokeManager {
    pub fn new(
        registry: Arc<QueueRegistry>,
        signal: Arc<WorkSignal>,
        layout: ArtifactLayout,
        downloaders: Downloaders,
        shutdown: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            registry,
            signal,
            layout,
            downloaders,
            player: None,
            schedule: PollSchedule::default(),
            debounce: Duration::ZERO,
            shutdown,
            events,
        }
    }

    pub fn with_player(mut self, player: Arc<dyn Player>, schedule: PollSchedule) -> Self {
        self.player = Some(player);
        self.schedule = schedule;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn has_player(&self) -> bool {
        self.player.is_some()
    }

    pub fn queue(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<KaraQueue>, CommandError> {
        Ok(self.registry.get_or_create(guild_id, channel_id)?)
    }

    /// Resolves `url` and queues it for `user`.
    ///
    /// Limits are checked before the (slow) metadata lookup and again when
    /// the entry is appended.
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        user: UserId,
        url: &str,
        pitch_shift: i32,
    ) -> Result<Arc<Entry>, CommandError> {
        check_pitch(pitch_shift)?;
        let queue = self.queue(guild_id, channel_id)?;
        queue.lock().await.check_can_append(user)?;

        let result = self.downloaders.resolve(url.trim()).await?;

        let dir = self.layout.create_entry_dir()?;
        let entry = Entry::new(
            NewEntry {
                path: dir,
                title: result.title,
                original_url: result.original_url,
                embeddable: result.embeddable,
                user_id: user,
                pitch_shift,
                offset_ms: 0,
                loaders: vec![result.loader],
            },
            Arc::downgrade(&queue),
        );

        let appended = queue.lock().await.append(entry.clone());
        if let Err(e) = appended {
            entry.delete().await;
            return Err(e.into());
        }
        self.signal.notify();
        Ok(entry)
    }

    pub async fn snapshot(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<QueueSnapshot, CommandError> {
        let queue = self.queue(guild_id, channel_id)?;
        let guard = queue.lock().await;
        Ok(QueueSnapshot {
            current: guard.current().cloned(),
            pending: guard.iter().cloned().collect(),
            rendered: guard.render(),
            global_offset_ms: queue.global_offset_ms(),
            local_mode: guard.local_mode(),
        })
    }

    /// `/next`: deletes the current song and promotes the next one.
    pub async fn advance(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<Entry>, CommandError> {
        let queue = self.queue(guild_id, channel_id)?;
        let mut guard = queue.lock().await;
        let next = guard.advance(self.debounce).await?;
        let local = guard.local_mode();
        if local {
            self.start_local_playback_locked(&queue, &mut guard);
        }
        drop(guard);
        self.signal.notify();
        Ok(next)
    }

    /// Entry at 1-based `index`, for the delete confirmation prompt.
    pub async fn entry_at(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        index: usize,
    ) -> Result<Arc<Entry>, CommandError> {
        let queue = self.queue(guild_id, channel_id)?;
        let guard = queue.lock().await;
        if index == 0 {
            return Err(QueueError::InvalidIndex(index).into());
        }
        Ok(guard
            .get(index - 1)
            .cloned()
            .map_err(|_| QueueError::InvalidIndex(index))?)
    }

    /// Removes an entry by id; the confirmation may arrive after the queue
    /// was reordered.
    pub async fn delete_entry(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        id: EntryId,
    ) -> Result<Arc<Entry>, CommandError> {
        let queue = self.queue(guild_id, channel_id)?;
        let mut guard = queue.lock().await;
        let index = guard.find_by_id(id).ok_or(QueueError::EntryNotFound)?;
        let entry = guard.remove(index)?;
        drop(guard);

        entry.delete().await;
        info!("🗑️ Eliminado de la cola: {}", entry.title());
        self.signal.notify();
        Ok(entry)
    }

    /// `/delete index` without confirmation (1-based).
    pub async fn delete(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        index: usize,
    ) -> Result<Arc<Entry>, CommandError> {
        let entry = self.entry_at(guild_id, channel_id, index).await?;
        self.delete_entry(guild_id, channel_id, entry.id()).await
    }

    /// `/move from to` (1-based).
    pub async fn move_entry(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        from: usize,
        to: usize,
    ) -> Result<(), CommandError> {
        if from == 0 {
            return Err(QueueError::InvalidIndex(from).into());
        }
        if to == 0 {
            return Err(QueueError::InvalidIndex(to).into());
        }
        let queue = self.queue(guild_id, channel_id)?;
        queue
            .lock()
            .await
            .move_entry(from - 1, to - 1)
            .map_err(|e| match e {
                QueueError::InvalidIndex(i) => QueueError::InvalidIndex(i + 1),
                other => other,
            })?;
        self.signal.notify();
        Ok(())
    }

    pub async fn set_pitch(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        index: usize,
        pitch_shift: i32,
    ) -> Result<Arc<Entry>, CommandError> {
        check_pitch(pitch_shift)?;
        self.edit(guild_id, channel_id, index, |entry| {
            entry.set_pitch_shift(pitch_shift);
            entry.reset();
        })
        .await
    }

    pub async fn set_offset(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        index: usize,
        offset_ms: i64,
    ) -> Result<Arc<Entry>, CommandError> {
        self.edit(guild_id, channel_id, index, |entry| {
            entry.set_offset_ms(offset_ms);
            entry.reset();
        })
        .await
    }

    /// `/reload`: downloads again from scratch.
    pub async fn reload(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        index: usize,
    ) -> Result<Arc<Entry>, CommandError> {
        self.edit(guild_id, channel_id, index, |entry| entry.reload()).await
    }

    async fn edit(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        index: usize,
        apply: impl FnOnce(&Entry),
    ) -> Result<Arc<Entry>, CommandError> {
        let queue = self.queue(guild_id, channel_id)?;
        let guard = queue.lock().await;
        let entry = target(&guard, index)?;
        apply(entry.as_ref());
        drop(guard);
        self.signal.notify();
        Ok(entry)
    }

    /// Marks every entry of the queue for reprocessing with one notification.
    pub async fn set_global_offset(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        offset_ms: i64,
    ) -> Result<usize, CommandError> {
        let queue = self.queue(guild_id, channel_id)?;
        let reset = queue.lock().await.set_global_offset(offset_ms);
        if reset > 0 {
            self.signal.notify();
        }
        Ok(reset)
    }

    /// Turns local playback on or off for a queue.
    pub async fn set_local_mode(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        enabled: bool,
    ) -> Result<(), CommandError> {
        if enabled && self.player.is_none() {
            return Err(CommandError::NoPlayer);
        }
        let queue = self.queue(guild_id, channel_id)?;
        let mut guard = queue.lock().await;
        guard.set_local_mode(enabled);
        if enabled {
            self.start_local_playback_locked(&queue, &mut guard);
        }
        let mode = if enabled { "activado" } else { "desactivado" };
        info!("🖥️ Modo local {} en canal {}", mode, channel_id);
        Ok(())
    }

    /// Starts the playback loop of `queue`, replacing any previous one.
    pub async fn start_local_playback(&self, queue: &Arc<KaraQueue>) {
        let mut guard = queue.lock().await;
        self.start_local_playback_locked(queue, &mut guard);
    }

    fn start_local_playback_locked(&self, queue: &Arc<KaraQueue>, guard: &mut QueueGuard<'_>) {
        let Some(player) = self.player.clone() else {
            return;
        };
        let token = self.shutdown.child_token();
        guard.replace_playback(token.clone());

        let playback = LocalPlayback {
            queue: queue.clone(),
            player: player.clone(),
            monitor: PlayerMonitor::new(player, self.schedule),
            signal: self.signal.clone(),
            debounce: self.debounce,
            events: self.events.clone(),
        };
        tokio::spawn(async move { playback.run(token).await });
    }
}

struct LocalPlayback {
    queue: Arc<KaraQueue>,
    player: Arc<dyn Player>,
    monitor: PlayerMonitor,
    signal: Arc<WorkSignal>,
    debounce: Duration,
    events: broadcast::Sender<QueueEvent>,
}

impl LocalPlayback {
    /// Espera a que la actual esté lista, la abre, vigila y avanza.
    async fn run(self, cancel: CancellationToken) {
        loop {
            let current = self.queue.lock().await.current().cloned();
            let Some(entry) = current else {
                debug!("Nada que reproducir en {}", self.queue.channel_id());
                return;
            };

            let path = loop {
                match entry.video_path() {
                    Ok(path) => break path,
                    Err(EntryError::Deleted) => return,
                    Err(EntryError::NotProcessed) => {
                        if entry.state() == ProcessState::Failed {
                            return;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(PROCESSED_POLL) => {}
                        }
                    }
                }
            };

            if let Err(e) = self.player.open(&path).await {
                warn!("⚠️ No se pudo abrir {}: {}", path.display(), e);
                return;
            }
            if self.monitor.watch(&path, &cancel).await == MonitorOutcome::Cancelled {
                return;
            }

            let mut guard = self.queue.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            match guard.advance(self.debounce).await {
                Ok(next) => {
                    drop(guard);
                    self.signal.notify();
                    let _ = self.events.send(QueueEvent::Advanced {
                        guild_id: self.queue.guild_id(),
                        channel_id: self.queue.channel_id(),
                        entry_id: next.id(),
                    });
                }
                Err(e) => {
                    debug!("Reproducción local detenida: {}", e);
                    return;
                }
            }
        }
    }
}
