//! # Bot Module
//!
//! Discord surface of karaqueue: slash command registration, interaction
//! dispatch and the queue status message.
//!
//! ## Architecture
//!
//! The bot is built around the [`KaraqueueBot`] struct which implements
//! Serenity's [`EventHandler`] trait. It owns:
//!
//! - The [`KaraokeManager`] whose hooks every command calls
//! - The configuration used to decide where commands are registered
//!
//! The long-running work (downloads, transcodes, local playback) lives in the
//! audio module; handlers here only translate interactions into manager calls
//! and render the results.

use anyhow::Result;
use serenity::{
    all::{Context, EventHandler, Interaction, Ready},
    async_trait,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    audio::{KaraokeManager, QueueEvent},
    config::Config,
};

/// Main Discord event handler.
///
/// ## Fields
///
/// - `config`: Bot configuration (guild allow-list, limits)
/// - `manager`: Command hooks over the karaoke queues
pub struct KaraqueueBot {
    config: Arc<Config>,
    pub manager: Arc<KaraokeManager>,
    listening: AtomicBool,
}

impl KaraqueueBot {
    pub fn new(config: Arc<Config>, manager: Arc<KaraokeManager>) -> Self {
        Self {
            config,
            manager,
            listening: AtomicBool::new(false),
        }
    }

    /// Registers slash commands with Discord.
    ///
    /// With an allow-list the commands are registered per guild (they show up
    /// immediately), otherwise globally (up to an hour to propagate).
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");

        let guilds = self.config.guilds();
        if guilds.is_empty() {
            info!("🌐 Registrando comandos globalmente");
            commands::register_global_commands(ctx).await.map_err(|e| {
                error!("❌ Error registrando comandos globales: {:?}", e);
                anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
            })?;
            info!("✅ Comandos globales registrados");
            return Ok(());
        }

        for guild_id in guilds {
            if let Err(e) = commands::register_guild_commands(ctx, guild_id).await {
                // Una guild sin permisos no impide registrar el resto
                warn!("⚠️ No se pudieron registrar comandos en guild {}: {:?}", guild_id, e);
                continue;
            }
            info!("✅ Comandos de guild registrados para: {}", guild_id);
        }

        Ok(())
    }

    /// Forwards manager events (local playback advancing by itself) to the
    /// channels they belong to. Started once, on the first `ready`.
    fn spawn_event_listener(&self, ctx: &Context) {
        if self.listening.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut events = self.manager.subscribe();
        let manager = self.manager.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(QueueEvent::Advanced {
                        guild_id,
                        channel_id,
                        entry_id,
                    }) => {
                        debug!("📣 Avance automático en {} (entrada {})", channel_id, entry_id);
                        if let Err(e) = handlers::announce_local_advance(
                            &ctx,
                            &manager,
                            guild_id,
                            channel_id,
                        )
                        .await
                        {
                            warn!("⚠️ No se pudo anunciar la siguiente canción: {:?}", e);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("⚠️ Se perdieron {} eventos de la cola", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[async_trait]
impl EventHandler for KaraqueueBot {
    /// Registers commands and starts the event listener.
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }

        self.spawn_event_listener(&ctx);
    }

    /// Dispatches slash commands, button clicks and modal submissions.
    ///
    /// Errors are logged but don't crash the bot.
    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        match interaction {
            Interaction::Command(command) => {
                if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                    error!("Error manejando comando: {:?}", e);
                }
            }
            Interaction::Component(component) => {
                if let Err(e) = handlers::handle_component(&ctx, component, self).await {
                    error!("Error manejando componente: {:?}", e);
                }
            }
            Interaction::Modal(modal) => {
                if let Err(e) = handlers::handle_modal(&ctx, modal, self).await {
                    error!("Error manejando modal: {:?}", e);
                }
            }
            _ => {}
        }
    }
}
