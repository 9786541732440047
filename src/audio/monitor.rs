use std::{path::Path, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::player::{Player, PlayerStatus};

const MIN_POLL: Duration = Duration::from_millis(100);

/// Intervalo de sondeo adaptativo.
///
/// Polls at `base` by default, relaxes to `relaxed` once playback is well
/// past the start and far from the end, and shortens below `base` right before
/// the end so completion is noticed promptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub base: Duration,
    pub relaxed: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            relaxed: Duration::from_secs(5),
        }
    }
}

impl PollSchedule {
    pub fn next_interval(&self, status: Option<&PlayerStatus>) -> Duration {
        let Some(status) = status else {
            return self.base;
        };
        if status.duration_ms == 0 {
            return self.base;
        }
        let position = Duration::from_millis(status.position_ms);
        let remaining =
            Duration::from_millis(status.duration_ms.saturating_sub(status.position_ms));
        let margin = self.relaxed * 2;

        if remaining < self.base {
            remaining.max(MIN_POLL)
        } else if position >= margin && remaining > margin {
            self.relaxed
        } else {
            self.base
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    Finished,
    Cancelled,
}

/// Watches the local player until the expected file finishes.
pub struct PlayerMonitor {
    player: Arc<dyn Player>,
    schedule: PollSchedule,
}

impl PlayerMonitor {
    pub fn new(player: Arc<dyn Player>, schedule: PollSchedule) -> Self {
        Self { player, schedule }
    }

    /// Returns `Finished` once `path` reached its duration, or went back to
    /// zero after having been seen mid-playback.
    ///
    /// The end only counts after the file was seen before it: right after
    /// `open` the player may still report the previous song at its end.
    pub async fn watch(&self, path: &Path, cancel: &CancellationToken) -> MonitorOutcome {
        let mut seen_before_end = false;
        let mut seen_playing = false;
        loop {
            let status = match self.player.status().await {
                Ok(status) => status,
                Err(e) => {
                    warn!("⚠️ No se pudo leer el estado del reproductor: {}", e);
                    None
                }
            };

            if let Some(s) = status.as_ref().filter(|s| s.shows(path)) {
                if s.duration_ms > 0 && s.position_ms >= s.duration_ms {
                    if seen_before_end {
                        debug!("🏁 {} terminó", path.display());
                        return MonitorOutcome::Finished;
                    }
                } else if s.position_ms > 0 {
                    seen_before_end = true;
                    seen_playing = true;
                } else if seen_playing {
                    debug!("🏁 {} volvió a cero", path.display());
                    return MonitorOutcome::Finished;
                } else {
                    seen_before_end = true;
                }
            }

            let wait = self.schedule.next_interval(status.as_ref());
            tokio::select! {
                _ = cancel.cancelled() => return MonitorOutcome::Cancelled,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
