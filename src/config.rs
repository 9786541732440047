use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::{path::PathBuf, time::Duration};

use crate::{
    audio::{monitor::PollSchedule, processor::PolicyKind, queue::QueueLimits},
    shell::Tools,
    sources::ytdlp::SiteCredentials,
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub guild_ids: Vec<u64>, // Vacío = cualquier guild

    // Servidor de videos generados
    pub host: String,
    pub serving_dir: PathBuf,

    // Límites
    pub max_queued: usize,
    pub max_queued_per_user: usize,
    pub video_limit_mins: u64,

    // Herramientas externas
    pub ytdlp_binary: String,
    pub ffmpeg_binary: String,
    pub ffprobe_binary: String,
    pub sox_binary: String,

    // Credenciales opcionales
    pub niconico_username: Option<String>,
    pub niconico_password: Option<String>, // Ya decodificada
    pub bilibili_sessdata: Option<String>,

    // Reproductor local (MPC-HC)
    pub mpc_hc_webport: Option<u16>,
    pub mpc_hc_binary: String,
    pub player_poll_ms: u64,
    pub player_relaxed_poll_ms: u64,
    pub next_debounce_secs: u64,

    pub selection_policy: String,
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(val) if !val.trim().is_empty() => val
            .trim()
            .parse()
            .with_context(|| format!("{} inválido: {}", key, val)),
        _ => Ok(default),
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.serving_dir)
            .with_context(|| format!("No se pudo crear {}", config.serving_dir.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let guild_ids = match non_empty(&lookup, "GUILD_IDS") {
            Some(ids) => ids
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<u64>().with_context(|| format!("GUILD_IDS inválido: {}", s)))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let niconico_password = match non_empty(&lookup, "NICONICO_PASSWORD") {
            Some(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .context("NICONICO_PASSWORD debe estar en base64")?;
                Some(String::from_utf8(bytes).context("NICONICO_PASSWORD no es UTF-8")?)
            }
            None => None,
        };

        Ok(Self {
            discord_token: non_empty(&lookup, "DISCORD_TOKEN").context("Falta DISCORD_TOKEN")?,
            guild_ids,

            host: non_empty(&lookup, "HOST").unwrap_or(defaults.host),
            serving_dir: non_empty(&lookup, "SERVING_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.serving_dir),

            max_queued: parse_or(&lookup, "MAX_QUEUED", defaults.max_queued)?,
            max_queued_per_user: parse_or(
                &lookup,
                "MAX_QUEUED_PER_USER",
                defaults.max_queued_per_user,
            )?,
            video_limit_mins: parse_or(&lookup, "VIDEO_LIMIT_MINS", defaults.video_limit_mins)?,

            ytdlp_binary: non_empty(&lookup, "YTDLP_BINARY").unwrap_or(defaults.ytdlp_binary),
            ffmpeg_binary: non_empty(&lookup, "FFMPEG_BINARY").unwrap_or(defaults.ffmpeg_binary),
            ffprobe_binary: non_empty(&lookup, "FFPROBE_BINARY").unwrap_or(defaults.ffprobe_binary),
            sox_binary: non_empty(&lookup, "SOX_BINARY").unwrap_or(defaults.sox_binary),

            niconico_username: non_empty(&lookup, "NICONICO_USERNAME"),
            niconico_password,
            bilibili_sessdata: non_empty(&lookup, "BILIBILI_SESSDATA"),

            mpc_hc_webport: match non_empty(&lookup, "MPC_HC_WEBPORT") {
                Some(port) => Some(port.parse().context("MPC_HC_WEBPORT inválido")?),
                None => None,
            },
            mpc_hc_binary: non_empty(&lookup, "MPC_HC_BINARY").unwrap_or(defaults.mpc_hc_binary),
            player_poll_ms: parse_or(&lookup, "PLAYER_POLL_MS", defaults.player_poll_ms)?,
            player_relaxed_poll_ms: parse_or(
                &lookup,
                "PLAYER_RELAXED_POLL_MS",
                defaults.player_relaxed_poll_ms,
            )?,
            next_debounce_secs: parse_or(
                &lookup,
                "NEXT_DEBOUNCE_SECS",
                defaults.next_debounce_secs,
            )?,

            selection_policy: non_empty(&lookup, "SELECTION_POLICY")
                .unwrap_or(defaults.selection_policy),
        })
    }

    /// Sanity checks on the loaded values.
    pub fn validate(&self) -> Result<()> {
        if self.max_queued == 0 {
            anyhow::bail!("MAX_QUEUED must be greater than 0");
        }
        if self.max_queued_per_user == 0 {
            anyhow::bail!("MAX_QUEUED_PER_USER must be greater than 0");
        }
        if self.max_queued_per_user > self.max_queued {
            anyhow::bail!(
                "MAX_QUEUED_PER_USER ({}) cannot exceed MAX_QUEUED ({})",
                self.max_queued_per_user,
                self.max_queued
            );
        }
        if self.video_limit_mins == 0 {
            anyhow::bail!("VIDEO_LIMIT_MINS must be greater than 0");
        }
        if self.player_poll_ms == 0 {
            anyhow::bail!("PLAYER_POLL_MS must be greater than 0");
        }
        if self.player_relaxed_poll_ms < self.player_poll_ms {
            anyhow::bail!(
                "PLAYER_RELAXED_POLL_MS ({}) must be at least PLAYER_POLL_MS ({})",
                self.player_relaxed_poll_ms,
                self.player_poll_ms
            );
        }
        if PolicyKind::parse(&self.selection_policy).is_none() {
            anyhow::bail!("Unknown SELECTION_POLICY: {}", self.selection_policy);
        }
        if self.niconico_username.is_some() != self.niconico_password.is_some() {
            anyhow::bail!("NICONICO_USERNAME and NICONICO_PASSWORD must be set together");
        }
        Ok(())
    }

    /// Resumen sin secretos para el log de arranque.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: guilds {}\n  \
            Serving: https://{}/ from {}\n  \
            Limits: {} queued, {} per user, {} min videos\n  \
            Tools: {}, {}, {}, {}\n  \
            Player: {}\n  \
            Scheduling: {}, next debounce {}s",
            if self.guild_ids.is_empty() {
                "any".to_string()
            } else {
                format!("{:?}", self.guild_ids)
            },
            self.host,
            self.serving_dir.display(),
            self.max_queued,
            self.max_queued_per_user,
            self.video_limit_mins,
            self.ytdlp_binary,
            self.ffmpeg_binary,
            self.ffprobe_binary,
            self.sox_binary,
            self.mpc_hc_webport
                .map_or("disabled".to_string(), |p| format!("MPC-HC on port {}", p)),
            self.selection_policy,
            self.next_debounce_secs,
        )
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.guild_ids.iter().copied().map(GuildId::new).collect()
    }

    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            max_queued: self.max_queued,
            max_queued_per_user: self.max_queued_per_user,
        }
    }

    pub fn tools(&self) -> Tools {
        Tools {
            ffmpeg: self.ffmpeg_binary.clone(),
            ffprobe: self.ffprobe_binary.clone(),
            sox: self.sox_binary.clone(),
            ytdlp: self.ytdlp_binary.clone(),
        }
    }

    pub fn credentials(&self) -> SiteCredentials {
        SiteCredentials {
            niconico: self
                .niconico_username
                .clone()
                .zip(self.niconico_password.clone()),
            bilibili_sessdata: self.bilibili_sessdata.clone(),
        }
    }

    pub fn poll_schedule(&self) -> PollSchedule {
        PollSchedule {
            base: Duration::from_millis(self.player_poll_ms),
            relaxed: Duration::from_millis(self.player_relaxed_poll_ms),
        }
    }

    pub fn next_debounce(&self) -> Duration {
        Duration::from_secs(self.next_debounce_secs)
    }

    pub fn policy(&self) -> PolicyKind {
        PolicyKind::parse(&self.selection_policy).unwrap_or_default()
    }
}

impl Default for Config {
    fn default() -> Self {
        let tools = Tools::default();
        Self {
            discord_token: String::new(),
            guild_ids: Vec::new(),

            host: "localhost".to_string(),
            serving_dir: "_generated_videos".into(),

            max_queued: 20,
            max_queued_per_user: 2,
            video_limit_mins: 10,

            ytdlp_binary: tools.ytdlp,
            ffmpeg_binary: tools.ffmpeg,
            ffprobe_binary: tools.ffprobe,
            sox_binary: tools.sox,

            niconico_username: None,
            niconico_password: None,
            bilibili_sessdata: None,

            mpc_hc_webport: None,
            mpc_hc_binary: "mpc-hc64".to_string(),
            player_poll_ms: 1000,
            player_relaxed_poll_ms: 5000,
            next_debounce_secs: 0,

            selection_policy: "depth-first".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("DISCORD_TOKEN", "token")]).unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_queued, 20);
        assert_eq!(config.max_queued_per_user, 2);
        assert_eq!(config.video_limit_mins, 10);
        assert_eq!(config.serving_dir, PathBuf::from("_generated_videos"));
        assert_eq!(config.policy(), PolicyKind::DepthFirst);
        assert!(config.guilds().is_empty());
        assert!(!config.summary().contains("token"));
    }

    #[test]
    fn test_missing_token_fails() {
        assert!(config(&[]).is_err());
    }

    #[test]
    fn test_guild_ids_and_credentials() {
        let config = config(&[
            ("DISCORD_TOKEN", "token"),
            ("GUILD_IDS", "123, 456"),
            ("NICONICO_USERNAME", "user"),
            ("NICONICO_PASSWORD", "aHVudGVyMg=="),
            ("MPC_HC_WEBPORT", "13579"),
        ])
        .unwrap();

        assert_eq!(config.guild_ids, vec![123, 456]);
        assert_eq!(
            config.credentials().niconico,
            Some(("user".to_string(), "hunter2".to_string()))
        );
        assert_eq!(config.mpc_hc_webport, Some(13579));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let per_user = config(&[
            ("DISCORD_TOKEN", "t"),
            ("MAX_QUEUED", "2"),
            ("MAX_QUEUED_PER_USER", "3"),
        ])
        .unwrap();
        assert!(per_user.validate().is_err());

        let poll = config(&[
            ("DISCORD_TOKEN", "t"),
            ("PLAYER_POLL_MS", "2000"),
            ("PLAYER_RELAXED_POLL_MS", "500"),
        ])
        .unwrap();
        assert!(poll.validate().is_err());

        let policy = config(&[("DISCORD_TOKEN", "t"), ("SELECTION_POLICY", "lottery")]).unwrap();
        assert!(policy.validate().is_err());

        assert!(config(&[("DISCORD_TOKEN", "t"), ("MAX_QUEUED", "many")]).is_err());
    }
}
