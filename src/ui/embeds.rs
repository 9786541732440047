use chrono::Utc;
use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::audio::{Entry, QueueSnapshot};

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const KARAOKE_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎤 karaqueue";

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

/// Línea animada mientras una entrada aún no tiene mensaje de carga.
pub fn spinner_line(name: &str, frame: usize) -> String {
    let c = SPINNER[frame % SPINNER.len()];
    format!("Loading `{}`...\n`{}`", name, c.to_string().repeat(4))
}

/// "+250ms", "-1200ms", "0ms".
pub fn format_offset(offset_ms: i64) -> String {
    if offset_ms > 0 {
        format!("+{}ms", offset_ms)
    } else {
        format!("{}ms", offset_ms)
    }
}

fn format_pitch(pitch: i32) -> String {
    if pitch > 0 {
        format!("+{}", pitch)
    } else {
        pitch.to_string()
    }
}

/// Tiempo transcurrido desde que se agregó, redondeado a segundos.
fn waited(entry: &Entry) -> String {
    let secs = (Utc::now() - entry.added_at()).num_seconds().max(0) as u64;
    humantime::format_duration(Duration::from_secs(secs)).to_string()
}

/// Crea el embed "Now playing" con la URL reproducible
pub fn create_now_playing_embed(entry: &Entry, playable_url: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title("Now playing")
        .description(format!(
            "[`{}`]({})\n{}",
            entry.name(),
            entry.original_url(),
            playable_url
        ))
        .color(colors::KARAOKE_PURPLE)
        .field("👤 Requested by", format!("<@{}>", entry.user_id()), true)
        .field("🎚️ Pitch", format_pitch(entry.pitch_shift()), true)
        .field("⏱️ Offset", format_offset(entry.effective_offset_ms()), true)
        .field("⌛ Waited", waited(entry), true)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea el embed para reproducción en el reproductor local
pub fn create_local_playback_embed(entry: &Entry) -> CreateEmbed {
    CreateEmbed::default()
        .title("Now playing (local)")
        .description(format!("[`{}`]({})", entry.name(), entry.original_url()))
        .color(colors::KARAOKE_PURPLE)
        .field("👤 Requested by", format!("<@{}>", entry.user_id()), true)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Descripción de la cola: título y cuerpo, o `None` si está vacía.
pub fn queue_description(snapshot: &QueueSnapshot) -> Option<String> {
    if snapshot.pending.is_empty() {
        return None;
    }
    let mut description = snapshot.rendered.clone();
    if snapshot.global_offset_ms != 0 {
        description.push_str(&format!(
            "\n\nGlobal offset: {}",
            format_offset(snapshot.global_offset_ms)
        ));
    }
    Some(description)
}

/// Crea el embed "Up Next" con la lista de la cola
pub fn create_queue_embed(snapshot: &QueueSnapshot) -> Option<CreateEmbed> {
    let description = queue_description(snapshot)?;
    let mut footer = format!("{} • {} in queue", STANDARD_FOOTER, snapshot.pending.len());
    if snapshot.local_mode {
        footer.push_str(" • local playback");
    }
    Some(
        CreateEmbed::default()
            .title("Up Next")
            .description(description)
            .color(colors::INFO_BLUE)
            .footer(CreateEmbedFooter::new(footer)),
    )
}

pub const HELP_LINES: &[&str] = &[
    "`/q`: queue a video. Also `/add` or `/load`.",
    "`/list`: show the current playlist.",
    "`/next`: play the next entry on the playlist.",
    "`/delete index`: delete an entry from the playlist. Also `/remove`.",
    "`/move from to`: change the position of an entry in the playlist.",
    "`/pitch pitch [index]`: change the pitch of a video on the playlist. Leave out index to change currently playing video.",
    "`/offset ms [index]`: delay the audio (positive) or the video (negative) of a video.",
    "`/globaloffset ms`: audio offset applied to every video in this channel.",
    "`/reload [index]`: download a video again from scratch.",
    "`/local on|off`: play videos on the local player instead of posting links.",
];

/// Crea el embed de ayuda con todos los comandos
pub fn create_help_embed() -> CreateEmbed {
    CreateEmbed::default()
        .title("Commands")
        .description(HELP_LINES.join("\n"))
        .color(colors::INFO_BLUE)
        .field(
            "Sources",
            "YouTube • NicoNico • bilibili • SoundCloud (audio only)",
            false,
        )
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}

/// Crea un embed de error estandarizado
pub fn create_error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {}", title))
        .description(description)
        .color(colors::ERROR_RED)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed de éxito estandarizado
pub fn create_success_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("✅ {}", title))
        .description(description)
        .color(colors::SUCCESS_GREEN)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn create_warning_embed(description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .description(format!("⚠️ {}", description))
        .color(colors::WARNING_ORANGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::entry::testing::detached;
    use pretty_assertions::assert_eq;

    fn snapshot(pending: Vec<std::sync::Arc<Entry>>, rendered: &str, offset: i64) -> QueueSnapshot {
        QueueSnapshot {
            current: None,
            pending,
            rendered: rendered.to_string(),
            global_offset_ms: offset,
            local_mode: false,
        }
    }

    #[test]
    fn test_spinner_cycles() {
        assert_eq!(spinner_line("Song", 0), "Loading `Song`...\n`||||`");
        assert_eq!(spinner_line("Song", 3), "Loading `Song`...\n`\\\\\\\\`");
        assert_eq!(spinner_line("Song", 5), "Loading `Song`...\n`////`");
    }

    #[test]
    fn test_format_offset() {
        assert_eq!(format_offset(250), "+250ms");
        assert_eq!(format_offset(-40), "-40ms");
        assert_eq!(format_offset(0), "0ms");
    }

    #[test]
    fn test_queue_description() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(queue_description(&snapshot(vec![], "", 0)), None);

        let entry = detached(dir.path(), "Song", 1);
        let rendered = "1. [`Song`](https://www.youtube.com/watch?v=Song)";
        assert_eq!(
            queue_description(&snapshot(vec![entry.clone()], rendered, 0)).unwrap(),
            rendered
        );
        assert_eq!(
            queue_description(&snapshot(vec![entry], rendered, -300)).unwrap(),
            format!("{}\n\nGlobal offset: -300ms", rendered)
        );
    }
}
