use dashmap::DashMap;
use parking_lot::RwLock;
use serenity::model::id::{ChannelId, GuildId};
use std::{collections::HashSet, sync::Arc};
use tracing::info;

use super::queue::{KaraQueue, QueueLimits};
use crate::error::RegistryError;

pub type QueueKey = (GuildId, ChannelId);

/// Guilds allowed to use the bot.
#[derive(Debug, Clone, Default)]
pub enum GuildAllowList {
    #[default]
    Any,
    Only(HashSet<GuildId>),
}

impl GuildAllowList {
    pub fn from_ids(ids: &[GuildId]) -> Self {
        if ids.is_empty() {
            GuildAllowList::Any
        } else {
            GuildAllowList::Only(ids.iter().copied().collect())
        }
    }

    pub fn allows(&self, guild: GuildId) -> bool {
        match self {
            GuildAllowList::Any => true,
            GuildAllowList::Only(ids) => ids.contains(&guild),
        }
    }
}

/// Todas las colas del proceso, una por canal.
///
/// Queues are created lazily and never evicted. Iteration order is creation
/// order, which is what the background processor scans.
#[derive(Debug)]
pub struct QueueRegistry {
    queues: DashMap<QueueKey, Arc<KaraQueue>>,
    order: RwLock<Vec<Arc<KaraQueue>>>,
    allow: GuildAllowList,
    limits: QueueLimits,
}

impl QueueRegistry {
    pub fn new(allow: GuildAllowList, limits: QueueLimits) -> Self {
        Self {
            queues: DashMap::new(),
            order: RwLock::new(Vec::new()),
            allow,
            limits,
        }
    }

    pub fn get_or_create(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<KaraQueue>, RegistryError> {
        if !self.allow.allows(guild_id) {
            return Err(RegistryError::Unauthorized(guild_id));
        }

        // The shard lock is held for the whole check-and-insert.
        let queue = self
            .queues
            .entry((guild_id, channel_id))
            .or_insert_with(|| {
                let queue = KaraQueue::new(guild_id, channel_id, self.limits);
                self.order.write().push(queue.clone());
                info!("📋 Nueva cola para canal {} en guild {}", channel_id, guild_id);
                queue
            })
            .clone();
        Ok(queue)
    }

    pub fn get(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<Arc<KaraQueue>> {
        self.queues
            .get(&(guild_id, channel_id))
            .map(|q| q.value().clone())
    }

    /// Queues in creation order.
    pub fn snapshot(&self) -> Vec<Arc<KaraQueue>> {
        self.order.read().clone()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
