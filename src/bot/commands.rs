use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

use crate::audio::manager::MAX_PITCH_SHIFT;

/// Todos los comandos slash del bot
pub fn all_commands() -> Vec<CreateCommand> {
    vec![
        help_command("help"),
        help_command("commands"),
        add_command("q"),
        add_command("add"),
        add_command("load"),
        list_command(),
        next_command(),
        delete_command("delete"),
        delete_command("remove"),
        move_command(),
        pitch_command(),
        offset_command(),
        globaloffset_command(),
        reload_command(),
        local_command(),
    ]
}

/// Registra comandos globales
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }

    Ok(())
}

/// Registra comandos para una guild específica
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;

    Ok(())
}

fn index_option(description: &str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::Integer, "index", description).min_int_value(0)
}

// Comandos de cola

fn help_command(name: &str) -> CreateCommand {
    CreateCommand::new(name).description("Show the available commands")
}

fn add_command(name: &str) -> CreateCommand {
    CreateCommand::new(name).description("Add a song to the queue")
}

fn list_command() -> CreateCommand {
    CreateCommand::new("list").description("Show the queue")
}

fn next_command() -> CreateCommand {
    CreateCommand::new("next").description("Play the next song")
}

fn delete_command(name: &str) -> CreateCommand {
    CreateCommand::new(name)
        .description("Delete a song from the queue")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "index", "Position in the queue")
                .min_int_value(1)
                .required(true),
        )
}

fn move_command() -> CreateCommand {
    CreateCommand::new("move")
        .description("Change the position of a song in the queue")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "from", "Current position")
                .min_int_value(1)
                .required(true),
        )
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "to", "New position")
                .min_int_value(1)
                .required(true),
        )
}

// Comandos de audio

fn pitch_command() -> CreateCommand {
    CreateCommand::new("pitch")
        .description("Change the pitch of a song")
        .add_option(
            // min_int_value no admite negativos; el rango se valida al editar
            CreateCommandOption::new(
                CommandOptionType::Integer,
                "pitch",
                "Semitones, from -12 to 12",
            )
            .max_int_value(MAX_PITCH_SHIFT as u64)
            .required(true),
        )
        .add_option(index_option("Position in the queue, 0 for the current song"))
}

fn offset_command() -> CreateCommand {
    CreateCommand::new("offset")
        .description("Shift the audio of a song relative to its video")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Integer,
                "ms",
                "Milliseconds, positive delays the audio",
            )
            .required(true),
        )
        .add_option(index_option("Position in the queue, 0 for the current song"))
}

fn globaloffset_command() -> CreateCommand {
    CreateCommand::new("globaloffset")
        .description("Audio offset applied to every song in this channel")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Integer,
                "ms",
                "Milliseconds, positive delays the audio",
            )
            .required(true),
        )
}

fn reload_command() -> CreateCommand {
    CreateCommand::new("reload")
        .description("Download a song again from scratch")
        .add_option(index_option("Position in the queue, 0 for the current song"))
}

fn local_command() -> CreateCommand {
    CreateCommand::new("local")
        .description("Play songs on the local player")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Boolean, "enabled", "On or off")
                .required(true),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_alias_is_registered() {
        let names: Vec<String> = all_commands()
            .iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .filter_map(|v| v["name"].as_str().map(str::to_string))
            .collect();
        for name in [
            "help", "commands", "q", "add", "load", "list", "next", "delete", "remove", "move",
            "pitch", "offset", "globaloffset", "reload", "local",
        ] {
            assert!(names.iter().any(|n| n == name), "missing /{}", name);
        }
    }

    #[test]
    fn test_pitch_option_bounds() {
        let pitch = serde_json::to_value(pitch_command()).unwrap();
        let option = &pitch["options"][0];
        assert_eq!(option["name"], "pitch");
        assert_eq!(option["max_value"], 12);
        assert!(option.get("min_value").map_or(true, |v| v.is_null()));
    }
}
