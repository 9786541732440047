use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod audio;
mod bot;
mod config;
mod error;
mod shell;
mod sources;
mod ui;

use crate::audio::{
    manager::KaraokeManager,
    pipeline::{ArtifactLayout, Pipeline},
    player::MpcHcPlayer,
    processor::{BackgroundProcessor, WorkSignal},
    registry::{GuildAllowList, QueueRegistry},
};
use crate::bot::KaraqueueBot;
use crate::config::Config;
use crate::shell::{TokioShell, Tools};
use crate::sources::{Downloaders, YtDlpContext};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("karaqueue=debug".parse()?)
                .add_directive("serenity=info".parse()?),
        )
        .init();

    info!("🎤 Iniciando karaqueue v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Arc::new(Config::load()?);
    info!("⚙️ Configuración:\n{}", config.summary());

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config.tools()).await;
    }

    let shutdown = CancellationToken::new();
    let shell = Arc::new(TokioShell);
    let layout = ArtifactLayout::new(config.serving_dir.clone(), config.host.clone());

    let registry = Arc::new(QueueRegistry::new(
        GuildAllowList::from_ids(&config.guilds()),
        config.queue_limits(),
    ));
    let signal = Arc::new(WorkSignal::new());
    let pipeline = Arc::new(Pipeline::new(shell.clone(), config.tools(), layout.clone()));

    let ytdlp = YtDlpContext::new(shell, config.tools(), config.video_limit_mins)
        .with_credentials(config.credentials());
    let downloaders = Downloaders::standard(ytdlp);
    info!("🔗 Fuentes: {}", downloaders.names().join(", "));

    let mut manager = KaraokeManager::new(
        registry.clone(),
        signal.clone(),
        layout,
        downloaders,
        shutdown.clone(),
    )
    .with_debounce(config.next_debounce());

    if let Some(port) = config.mpc_hc_webport {
        match MpcHcPlayer::new(port, config.mpc_hc_binary.clone()) {
            Ok(player) => {
                info!("🖥️ Reproductor local MPC-HC en puerto {}", port);
                manager = manager.with_player(Arc::new(player), config.poll_schedule());
            }
            Err(e) => warn!("⚠️ Reproductor local deshabilitado: {}", e),
        }
    }
    let manager = Arc::new(manager);

    // Procesador en segundo plano
    let processor = BackgroundProcessor::new(registry, signal, pipeline, config.policy().build());
    let processor_handle = tokio::spawn(processor.run(shutdown.clone()));

    // Sólo interacciones: no hace falta leer mensajes
    let intents = GatewayIntents::GUILDS;
    let handler = KaraqueueBot::new(config.clone(), manager);
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        signal_shutdown.cancel();
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    shutdown.cancel();
    if let Err(e) = processor_handle.await {
        error!("El procesador terminó con error: {:?}", e);
    }
    info!("👋 karaqueue detenido");

    Ok(())
}

async fn health_check(tools: &Tools) -> Result<()> {
    // Verificar dependencias críticas
    let checks = [
        (&tools.ytdlp, "--version"),
        (&tools.ffmpeg, "-version"),
        (&tools.ffprobe, "-version"),
        (&tools.sox, "--version"),
    ];

    let mut missing = Vec::new();
    for (binary, flag) in checks {
        let ok = async_process::Command::new(binary)
            .arg(flag)
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false);
        if !ok {
            missing.push(binary.as_str());
        }
    }

    if missing.is_empty() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes: {}", missing.join(", "));
    }
}
