use anyhow::Result;
use serenity::{
    builder::{
        CreateActionRow, CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage,
        CreateMessage, EditInteractionResponse,
    },
    model::{
        application::{CommandInteraction, ComponentInteraction, ModalInteraction},
        channel::Message,
        id::{ChannelId, GuildId},
    },
    prelude::Context,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        entry::{Entry, ProcessState},
        KaraokeManager,
    },
    bot::KaraqueueBot,
    error::{CommandError, QueueError},
    ui::{buttons, embeds},
};

const NOW_PLAYING_POLL: Duration = Duration::from_millis(100);

/// Polls between two spinner frames, so the message is edited about once a second.
const SPINNER_TICKS: usize = 10;

/// Cualquier interacción a la que se puede responder y luego editar.
#[derive(Clone)]
enum Responder {
    Command(CommandInteraction),
    Component(ComponentInteraction),
    Modal(ModalInteraction),
}

impl Responder {
    async fn respond(
        &self,
        ctx: &Context,
        message: CreateInteractionResponseMessage,
    ) -> Result<()> {
        let response = CreateInteractionResponse::Message(message);
        match self {
            Self::Command(i) => i.create_response(&ctx.http, response).await?,
            Self::Component(i) => i.create_response(&ctx.http, response).await?,
            Self::Modal(i) => i.create_response(&ctx.http, response).await?,
        }
        Ok(())
    }

    async fn edit(&self, ctx: &Context, edit: EditInteractionResponse) -> Result<Message> {
        let message = match self {
            Self::Command(i) => i.edit_response(&ctx.http, edit).await?,
            Self::Component(i) => i.edit_response(&ctx.http, edit).await?,
            Self::Modal(i) => i.edit_response(&ctx.http, edit).await?,
        };
        Ok(message)
    }

    async fn get_response(&self, ctx: &Context) -> Result<Message> {
        let message = match self {
            Self::Command(i) => i.get_response(&ctx.http).await?,
            Self::Component(i) => i.get_response(&ctx.http).await?,
            Self::Modal(i) => i.get_response(&ctx.http).await?,
        };
        Ok(message)
    }

    async fn delete(&self, ctx: &Context) -> Result<()> {
        match self {
            Self::Command(i) => i.delete_response(&ctx.http).await?,
            Self::Component(i) => i.delete_response(&ctx.http).await?,
            Self::Modal(i) => i.delete_response(&ctx.http).await?,
        }
        Ok(())
    }

    async fn say(&self, ctx: &Context, content: impl Into<String>, ephemeral: bool) -> Result<()> {
        self.respond(
            ctx,
            CreateInteractionResponseMessage::new()
                .content(content)
                .ephemeral(ephemeral),
        )
        .await
    }

    async fn fail(&self, ctx: &Context, err: &CommandError) -> Result<()> {
        self.respond(
            ctx,
            CreateInteractionResponseMessage::new()
                .embed(embeds::create_warning_embed(&user_error(err)))
                .ephemeral(true),
        )
        .await
    }
}

/// Texto que ve el usuario. I/O problems are ours, not theirs.
fn user_error(err: &CommandError) -> String {
    match err {
        CommandError::Io(e) => {
            error!("❌ Error de E/S atendiendo un comando: {}", e);
            "Something went wrong, please try again.".to_string()
        }
        other => other.to_string(),
    }
}

fn int_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_i64())
}

fn index_option(command: &CommandInteraction, name: &str) -> Result<usize, CommandError> {
    let raw = int_option(command, name).unwrap_or(0);
    usize::try_from(raw).map_err(|_| QueueError::InvalidIndex(0).into())
}

/// Mensaje de estado de la cola, con botones.
struct StatusMessage {
    content: Option<String>,
    embed: Option<CreateEmbed>,
    components: Vec<CreateActionRow>,
}

impl StatusMessage {
    async fn build(
        manager: &KaraokeManager,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Self, CommandError> {
        let snapshot = manager.snapshot(guild_id, channel_id).await?;
        Ok(match embeds::create_queue_embed(&snapshot) {
            Some(embed) => Self {
                content: None,
                embed: Some(embed),
                components: buttons::create_queue_buttons(true),
            },
            None => Self {
                content: Some(QueueError::Empty.to_string()),
                embed: None,
                components: buttons::create_queue_buttons(false),
            },
        })
    }

    fn into_channel_message(self) -> CreateMessage {
        let mut message = CreateMessage::new().components(self.components);
        if let Some(content) = self.content {
            message = message.content(content);
        }
        if let Some(embed) = self.embed {
            message = message.embed(embed);
        }
        message
    }

    fn into_response(self) -> CreateInteractionResponseMessage {
        let mut message = CreateInteractionResponseMessage::new().components(self.components);
        if let Some(content) = self.content {
            message = message.content(content);
        }
        if let Some(embed) = self.embed {
            message = message.embed(embed);
        }
        message
    }
}

/// Borra el mensaje de estado anterior y publica uno nuevo, as the reply to
/// `via` when given or as a plain channel message otherwise.
async fn repost_status(
    ctx: &Context,
    manager: &KaraokeManager,
    guild_id: GuildId,
    channel_id: ChannelId,
    via: Option<&Responder>,
) -> Result<()> {
    let status = StatusMessage::build(manager, guild_id, channel_id).await?;
    let queue = manager.queue(guild_id, channel_id)?;
    let mut guard = queue.lock().await;

    if let Some(old) = guard.set_status_message(None) {
        if let Err(e) = channel_id.delete_message(&ctx.http, old).await {
            debug!("Mensaje de estado {} ya no existe: {:?}", old, e);
        }
    }

    let message = match via {
        Some(responder) => {
            responder.respond(ctx, status.into_response()).await?;
            responder.get_response(ctx).await?
        }
        None => {
            channel_id
                .send_message(&ctx.http, status.into_channel_message())
                .await?
        }
    };
    guard.set_status_message(Some(message.id));
    Ok(())
}

/// Lo que hay que mostrar mientras se procesa la canción actual.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Progress {
    Pending(String),
    Failed(String),
    Ready,
    Gone,
}

fn progress_of(entry: &Entry, tick: usize) -> Progress {
    if entry.is_deleted() {
        return Progress::Gone;
    }
    let status = entry.status();
    match status.state {
        ProcessState::Processed => Progress::Ready,
        ProcessState::Cancelled => Progress::Gone,
        ProcessState::Failed => Progress::Failed(status.error_msg),
        _ if !status.load_msg.is_empty() => Progress::Pending(status.load_msg),
        _ => Progress::Pending(embeds::spinner_line(&entry.name(), tick / SPINNER_TICKS)),
    }
}

/// Edits the response with download progress until the entry is ready, then
/// shows the "Now playing" embed.
async fn follow_processing(
    ctx: &Context,
    responder: &Responder,
    entry: &Arc<Entry>,
    local_mode: bool,
) -> Result<()> {
    let mut shown = String::new();
    let mut interval = tokio::time::interval(NOW_PLAYING_POLL);
    let mut tick = 0usize;

    loop {
        interval.tick().await;
        match progress_of(entry, tick) {
            Progress::Ready => break,
            Progress::Gone => return Ok(()),
            Progress::Failed(msg) => {
                responder
                    .edit(ctx, EditInteractionResponse::new().content(msg))
                    .await?;
                return Ok(());
            }
            Progress::Pending(content) => {
                if content != shown {
                    responder
                        .edit(ctx, EditInteractionResponse::new().content(content.as_str()))
                        .await?;
                    shown = content;
                }
            }
        }
        tick += 1;
    }

    let embed = if local_mode {
        embeds::create_local_playback_embed(entry)
    } else {
        match entry.url() {
            Ok(url) => embeds::create_now_playing_embed(entry, &url),
            Err(e) => {
                debug!("Entrada {} ya no disponible: {}", entry.id(), e);
                return Ok(());
            }
        }
    };
    responder
        .edit(ctx, EditInteractionResponse::new().content("").embed(embed))
        .await?;
    info!("🎤 Mostrando: {}", entry.name());
    Ok(())
}

/// "Loading..." → progress → "Now playing" for the current entry.
async fn show_current(
    ctx: &Context,
    bot: &KaraqueueBot,
    responder: &Responder,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> Result<()> {
    let snapshot = bot.manager.snapshot(guild_id, channel_id).await?;
    let Some(entry) = snapshot.current else {
        return responder.fail(ctx, &QueueError::NothingPlaying.into()).await;
    };

    responder
        .say(ctx, format!("Loading `{}`...", entry.name()), false)
        .await?;
    repost_status(ctx, &bot.manager, guild_id, channel_id, None).await?;
    follow_processing(ctx, responder, &entry, snapshot.local_mode).await
}

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &KaraqueueBot,
) -> Result<()> {
    let Some(guild_id) = command.guild_id else {
        return Responder::Command(command)
            .say(ctx, "This bot only works in servers.", true)
            .await;
    };
    let channel_id = command.channel_id;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    let name = command.data.name.clone();
    let responder = Responder::Command(command.clone());
    let outcome: Result<(), CommandError> = match name.as_str() {
        "help" | "commands" => {
            responder
                .respond(
                    ctx,
                    CreateInteractionResponseMessage::new()
                        .embed(embeds::create_help_embed())
                        .ephemeral(true),
                )
                .await?;
            Ok(())
        }
        "q" | "add" | "load" => {
            command
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Modal(buttons::create_add_song_modal()),
                )
                .await?;
            Ok(())
        }
        "list" => match bot.manager.queue(guild_id, channel_id) {
            Ok(_) => {
                repost_status(ctx, &bot.manager, guild_id, channel_id, Some(&responder)).await?;
                Ok(())
            }
            Err(e) => Err(e),
        },
        "next" => return handle_next(ctx, bot, &responder, guild_id, channel_id).await,
        "delete" | "remove" => {
            handle_delete(ctx, &command, bot, &responder, guild_id, channel_id).await
        }
        "move" => handle_move(ctx, &command, bot, &responder, guild_id, channel_id).await,
        "pitch" | "offset" | "reload" => {
            handle_edit(ctx, &command, bot, &responder, guild_id, channel_id).await
        }
        "globaloffset" => {
            handle_global_offset(ctx, &command, bot, &responder, guild_id, channel_id).await
        }
        "local" => handle_local(ctx, &command, bot, &responder, guild_id, channel_id).await,
        _ => {
            responder.say(ctx, "❌ Unknown command", true).await?;
            Ok(())
        }
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("/{} rechazado: {}", name, e);
            responder.fail(ctx, &e).await
        }
    }
}

async fn handle_next(
    ctx: &Context,
    bot: &KaraqueueBot,
    responder: &Responder,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> Result<()> {
    match bot.manager.advance(guild_id, channel_id).await {
        Ok(_) => show_current(ctx, bot, responder, guild_id, channel_id).await,
        Err(CommandError::Queue(QueueError::Empty)) => {
            responder.say(ctx, QueueError::Empty.to_string(), false).await?;
            repost_status(ctx, &bot.manager, guild_id, channel_id, None).await
        }
        Err(e) => responder.fail(ctx, &e).await,
    }
}

async fn handle_delete(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &KaraqueueBot,
    responder: &Responder,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> Result<(), CommandError> {
    let index = index_option(command, "index")?;
    let entry = bot.manager.entry_at(guild_id, channel_id, index).await?;

    let prompt = CreateInteractionResponseMessage::new()
        .content(format!("Deleting `{}`, are you sure?", entry.title()))
        .components(vec![buttons::create_delete_confirmation_buttons(entry.id())]);
    if let Err(e) = responder.respond(ctx, prompt).await {
        warn!("⚠️ No se pudo mostrar la confirmación: {:?}", e);
    }
    Ok(())
}

async fn handle_move(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &KaraqueueBot,
    responder: &Responder,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> Result<(), CommandError> {
    let from = index_option(command, "from")?;
    let to = index_option(command, "to")?;
    bot.manager.move_entry(guild_id, channel_id, from, to).await?;

    if let Err(e) = repost_status(ctx, &bot.manager, guild_id, channel_id, Some(responder)).await {
        warn!("⚠️ No se pudo publicar la cola: {:?}", e);
    }
    Ok(())
}

/// `/pitch`, `/offset` y `/reload`: same target rules, different edit.
async fn handle_edit(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &KaraqueueBot,
    responder: &Responder,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> Result<(), CommandError> {
    let index = index_option(command, "index")?;
    let entry = match command.data.name.as_str() {
        "pitch" => {
            let raw = int_option(command, "pitch").unwrap_or(0);
            let pitch = i32::try_from(raw).unwrap_or(i32::MAX);
            bot.manager.set_pitch(guild_id, channel_id, index, pitch).await?
        }
        "offset" => {
            let ms = int_option(command, "ms").unwrap_or(0);
            bot.manager.set_offset(guild_id, channel_id, index, ms).await?
        }
        _ => bot.manager.reload(guild_id, channel_id, index).await?,
    };
    debug!("✏️ Editada entrada {}", entry.name());

    let shown = if index == 0 {
        show_current(ctx, bot, responder, guild_id, channel_id).await
    } else {
        repost_status(ctx, &bot.manager, guild_id, channel_id, Some(responder)).await
    };
    if let Err(e) = shown {
        warn!("⚠️ No se pudo actualizar el mensaje: {:?}", e);
    }
    Ok(())
}

async fn handle_global_offset(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &KaraqueueBot,
    responder: &Responder,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> Result<(), CommandError> {
    let ms = int_option(command, "ms").unwrap_or(0);
    let reset = bot.manager.set_global_offset(guild_id, channel_id, ms).await?;

    let embed = embeds::create_success_embed(
        "Global offset",
        &format!(
            "Audio offset for this channel is now {}. {} song(s) will be processed again.",
            embeds::format_offset(ms),
            reset
        ),
    );
    let shown = async {
        responder
            .respond(ctx, CreateInteractionResponseMessage::new().embed(embed))
            .await?;
        repost_status(ctx, &bot.manager, guild_id, channel_id, None).await
    };
    if let Err(e) = shown.await {
        warn!("⚠️ No se pudo actualizar el mensaje: {:?}", e);
    }
    Ok(())
}

async fn handle_local(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &KaraqueueBot,
    responder: &Responder,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> Result<(), CommandError> {
    let enabled = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "enabled")
        .and_then(|opt| opt.value.as_bool())
        .unwrap_or(false);
    bot.manager.set_local_mode(guild_id, channel_id, enabled).await?;

    let description = if enabled {
        "Songs in this channel will play on the local player."
    } else {
        "Local playback stopped. Songs will be posted as links."
    };
    if let Err(e) = responder
        .respond(
            ctx,
            CreateInteractionResponseMessage::new()
                .embed(embeds::create_success_embed("Local playback", description)),
        )
        .await
    {
        warn!("⚠️ No se pudo responder /local: {:?}", e);
    }
    Ok(())
}

/// Maneja interacciones con componentes (botones)
pub async fn handle_component(
    ctx: &Context,
    component: ComponentInteraction,
    bot: &KaraqueueBot,
) -> Result<()> {
    let Some(guild_id) = component.guild_id else {
        return Ok(());
    };
    let channel_id = component.channel_id;

    info!(
        "🔘 Botón {} presionado por {} en guild {}",
        component.data.custom_id, component.user.name, guild_id
    );

    let custom_id = component.data.custom_id.clone();
    let responder = Responder::Component(component.clone());

    if let Some(entry_id) = buttons::parse_delete_confirm(&custom_id) {
        let content = match bot.manager.delete_entry(guild_id, channel_id, entry_id).await {
            Ok(entry) => format!("Successfully deleted `{}` from the queue.", entry.title()),
            Err(e) => user_error(&e),
        };
        component
            .create_response(
                &ctx.http,
                CreateInteractionResponse::UpdateMessage(
                    CreateInteractionResponseMessage::new()
                        .content(content)
                        .components(vec![]),
                ),
            )
            .await?;
        return repost_status(ctx, &bot.manager, guild_id, channel_id, None).await;
    }

    match custom_id.as_str() {
        buttons::button_ids::DELETE_CANCEL => {
            component
                .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
                .await?;
            component.message.delete(&ctx.http).await?;
        }
        buttons::button_ids::ADD_SONG => {
            component
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Modal(buttons::create_add_song_modal()),
                )
                .await?;
        }
        buttons::button_ids::NEXT => {
            handle_next(ctx, bot, &responder, guild_id, channel_id).await?;
        }
        other => {
            debug!("Componente desconocido: {}", other);
        }
    }

    Ok(())
}

/// Envío del modal "Add Song".
pub async fn handle_modal(
    ctx: &Context,
    modal: ModalInteraction,
    bot: &KaraqueueBot,
) -> Result<()> {
    if modal.data.custom_id != buttons::modal_ids::ADD_SONG {
        return Ok(());
    }
    let responder = Responder::Modal(modal.clone());
    let Some(guild_id) = modal.guild_id else {
        return responder.say(ctx, "This bot only works in servers.", true).await;
    };
    let channel_id = modal.channel_id;

    let form = match buttons::parse_add_song_modal(&modal.data.components) {
        Ok(form) => form,
        Err(msg) => return responder.say(ctx, msg, true).await,
    };
    info!("➕ {} agrega {} (pitch {})", modal.user.name, form.url, form.pitch_shift);

    responder
        .say(ctx, format!("Loading `{}`...", form.url), true)
        .await?;

    match bot
        .manager
        .enqueue(guild_id, channel_id, modal.user.id, &form.url, form.pitch_shift)
        .await
    {
        Ok(entry) => {
            debug!("Encolada entrada {} ({})", entry.id(), entry.title());
            repost_status(ctx, &bot.manager, guild_id, channel_id, None).await?;
            responder.delete(ctx).await?;
        }
        Err(e) => {
            responder
                .edit(ctx, EditInteractionResponse::new().content(user_error(&e)))
                .await?;
        }
    }
    Ok(())
}

/// The local player moved on by itself: say what is playing now and refresh
/// the queue message.
pub async fn announce_local_advance(
    ctx: &Context,
    manager: &KaraokeManager,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> Result<()> {
    let snapshot = manager.snapshot(guild_id, channel_id).await?;
    if let Some(entry) = snapshot.current {
        channel_id
            .send_message(
                &ctx.http,
                CreateMessage::new().embed(embeds::create_local_playback_embed(&entry)),
            )
            .await?;
    }
    repost_status(ctx, manager, guild_id, channel_id, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::entry::{testing::detached, Artifact};
    use crate::error::PipelineError;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_progress_spinner_then_load_msg() {
        let dir = tempfile::tempdir().unwrap();
        let entry = detached(dir.path(), "Song", 1);

        assert_eq!(
            progress_of(&entry, 0),
            Progress::Pending("Loading `Song`...\n`||||`".to_string())
        );
        assert_eq!(
            progress_of(&entry, SPINNER_TICKS),
            Progress::Pending("Loading `Song`...\n`////`".to_string())
        );

        entry.set_load_msg("Loading youtube video `Song`...\nShifting pitch...");
        assert_eq!(
            progress_of(&entry, 0),
            Progress::Pending("Loading youtube video `Song`...\nShifting pitch...".to_string())
        );
    }

    #[test]
    fn test_progress_terminal_states() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();

        let failed = detached(dir.path(), "Bad", 1);
        let run = failed.begin_processing(&shutdown).unwrap();
        failed.finish(run.generation, Err(PipelineError::Load("boom".into())), false);
        let progress = progress_of(&failed, 0);
        assert!(matches!(progress, Progress::Failed(msg) if msg.starts_with("Error: ")));

        let ready = detached(dir.path(), "Good", 1);
        let run = ready.begin_processing(&shutdown).unwrap();
        ready.finish(
            run.generation,
            Ok(Artifact::Original { media_path: dir.path().join("download.mp4") }),
            false,
        );
        assert_eq!(progress_of(&ready, 0), Progress::Ready);
    }

    #[tokio::test]
    async fn test_progress_gone_after_delete() {
        let dir = tempfile::tempdir().unwrap();
        let entry = detached(&dir.path().join("entry"), "Song", 1);
        entry.delete().await;
        assert_eq!(progress_of(&entry, 0), Progress::Gone);
    }

    #[test]
    fn test_user_error_hides_io_details() {
        let err = CommandError::Io(std::io::Error::other("disk on fire"));
        assert_eq!(user_error(&err), "Something went wrong, please try again.");
        assert_eq!(user_error(&QueueError::InvalidIndex(3).into()), "Invalid index!");
    }
}
