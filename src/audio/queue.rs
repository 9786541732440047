use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::entry::{Entry, EntryId};
use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Pendientes + actual.
    pub max_queued: usize,
    pub max_queued_per_user: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_queued: 20,
            max_queued_per_user: 2,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Arc<Entry>>,
    current: Option<Arc<Entry>>,
    status_message: Option<MessageId>,
    local_mode: bool,
    last_advanced: Option<Instant>,
    playback: Option<CancellationToken>,
}

/// Cola de karaoke de un canal.
#[derive(Debug)]
pub struct KaraQueue {
    guild_id: GuildId,
    channel_id: ChannelId,
    limits: QueueLimits,
    global_offset_ms: AtomicI64,
    state: Mutex<QueueState>,
}

impl KaraQueue {
    pub fn new(guild_id: GuildId, channel_id: ChannelId, limits: QueueLimits) -> Arc<Self> {
        Arc::new(Self {
            guild_id,
            channel_id,
            limits,
            global_offset_ms: AtomicI64::new(0),
            state: Mutex::new(QueueState::default()),
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    /// Only written through [`QueueGuard::set_global_offset`], so it never
    /// changes without the queue lock held.
    pub fn global_offset_ms(&self) -> i64 {
        self.global_offset_ms.load(Ordering::Acquire)
    }

    pub async fn lock(&self) -> QueueGuard<'_> {
        QueueGuard {
            queue: self,
            state: self.state.lock().await,
        }
    }
}

/// Exclusive access to a queue. Every structural change goes through here.
pub struct QueueGuard<'a> {
    queue: &'a KaraQueue,
    state: tokio::sync::MutexGuard<'a, QueueState>,
}

impl<'a> QueueGuard<'a> {
    pub fn queue(&self) -> &KaraQueue {
        self.queue
    }

    /// Canciones pendientes (sin contar la actual).
    pub fn len(&self) -> usize {
        self.state.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Entry>> {
        self.state.items.iter()
    }

    pub fn total(&self) -> usize {
        self.state.items.len() + usize::from(self.state.current.is_some())
    }

    /// Entries of `user`, the one playing included.
    pub fn pending_entries_for(&self, user: UserId) -> usize {
        self.state
            .current
            .iter()
            .chain(self.state.items.iter())
            .filter(|e| e.user_id() == user)
            .count()
    }

    /// Checks both caps for a new entry of `user` without adding anything.
    pub fn check_can_append(&self, user: UserId) -> Result<(), QueueError> {
        let limits = self.queue.limits;
        if self.total() >= limits.max_queued {
            return Err(QueueError::QueueFull {
                max: limits.max_queued,
            });
        }
        if self.pending_entries_for(user) >= limits.max_queued_per_user {
            return Err(QueueError::UserLimit {
                max: limits.max_queued_per_user,
            });
        }
        Ok(())
    }

    pub fn append(&mut self, entry: Arc<Entry>) -> Result<(), QueueError> {
        self.check_can_append(entry.user_id())?;
        info!("➕ Agregado a la cola: {}", entry.title());
        self.state.items.push_back(entry);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Arc<Entry>> {
        self.state.items.pop_front()
    }

    pub fn get(&self, index: usize) -> Result<&Arc<Entry>, QueueError> {
        self.state
            .items
            .get(index)
            .ok_or(QueueError::InvalidIndex(index))
    }

    /// Replaces the entry at `index`, returning the previous one.
    pub fn set(&mut self, index: usize, entry: Arc<Entry>) -> Result<Arc<Entry>, QueueError> {
        let slot = self
            .state
            .items
            .get_mut(index)
            .ok_or(QueueError::InvalidIndex(index))?;
        Ok(std::mem::replace(slot, entry))
    }

    pub fn remove(&mut self, index: usize) -> Result<Arc<Entry>, QueueError> {
        self.state
            .items
            .remove(index)
            .ok_or(QueueError::InvalidIndex(index))
    }

    pub fn insert(&mut self, index: usize, entry: Arc<Entry>) -> Result<(), QueueError> {
        if index > self.state.items.len() {
            return Err(QueueError::InvalidIndex(index));
        }
        self.state.items.insert(index, entry);
        Ok(())
    }

    /// Moves the entry at `from` so it ends up at `to` (0-based).
    pub fn move_entry(&mut self, from: usize, to: usize) -> Result<(), QueueError> {
        let len = self.state.items.len();
        if from >= len {
            return Err(QueueError::InvalidIndex(from));
        }
        if to >= len {
            return Err(QueueError::InvalidIndex(to));
        }
        if from == to {
            return Ok(());
        }
        if let Some(entry) = self.state.items.remove(from) {
            self.state.items.insert(to, entry);
        }
        debug!("🔀 Movida entrada {} -> {}", from, to);
        Ok(())
    }

    pub fn find_by_id(&self, id: EntryId) -> Option<usize> {
        self.state.items.iter().position(|e| e.id() == id)
    }

    pub fn current(&self) -> Option<&Arc<Entry>> {
        self.state.current.as_ref()
    }

    pub fn replace_current(&mut self, entry: Option<Arc<Entry>>) -> Option<Arc<Entry>> {
        std::mem::replace(&mut self.state.current, entry)
    }

    /// Deletes the current entry and promotes the head of the queue.
    ///
    /// Fails with [`QueueError::Debounced`] inside the debounce window and
    /// with [`QueueError::Empty`] when nothing is pending (the old current is
    /// still removed in that case).
    pub async fn advance(&mut self, debounce: Duration) -> Result<Arc<Entry>, QueueError> {
        if let Some(last) = self.state.last_advanced {
            if !debounce.is_zero() && last.elapsed() < debounce {
                return Err(QueueError::Debounced);
            }
        }
        self.state.last_advanced = Some(Instant::now());

        if let Some(previous) = self.state.current.take() {
            previous.delete().await;
        }
        let next = self.state.items.pop_front().ok_or(QueueError::Empty)?;
        info!("⏭️ Siguiente: {}", next.title());
        self.state.current = Some(next.clone());
        Ok(next)
    }

    /// Entry the background processor should handle next for this queue.
    pub fn candidate(&self) -> Option<Arc<Entry>> {
        if let Some(current) = &self.state.current {
            if current.needs_processing() {
                return Some(current.clone());
            }
        }
        self.state
            .items
            .iter()
            .find(|e| e.needs_processing())
            .cloned()
    }

    /// Sets the queue-wide offset and marks every entry for reprocessing.
    /// Returns how many entries were reset; callers notify the processor once.
    pub fn set_global_offset(&mut self, offset_ms: i64) -> usize {
        self.queue
            .global_offset_ms
            .store(offset_ms, Ordering::Release);
        let mut reset = 0;
        for entry in self.state.current.iter().chain(self.state.items.iter()) {
            entry.reset();
            reset += 1;
        }
        info!("⏱️ Offset global = {}ms ({} entradas)", offset_ms, reset);
        reset
    }

    pub fn local_mode(&self) -> bool {
        self.state.local_mode
    }

    pub fn set_local_mode(&mut self, enabled: bool) {
        self.state.local_mode = enabled;
        if !enabled {
            if let Some(token) = self.state.playback.take() {
                token.cancel();
            }
        }
    }

    /// Installs the token of a new local playback loop, cancelling the old one.
    pub fn replace_playback(&mut self, token: CancellationToken) {
        if let Some(old) = self.state.playback.replace(token) {
            old.cancel();
        }
    }

    pub fn status_message(&self) -> Option<MessageId> {
        self.state.status_message
    }

    pub fn set_status_message(&mut self, message: Option<MessageId>) -> Option<MessageId> {
        std::mem::replace(&mut self.state.status_message, message)
    }

    /// Lista numerada para el mensaje de estado.
    pub fn render(&self) -> String {
        self.state
            .items
            .iter()
            .enumerate()
            .map(|(i, entry)| format!("{}. [`{}`]({})", i + 1, entry.name(), entry.original_url()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
