use serenity::{
    all::{ActionRow, ActionRowComponent, ButtonStyle, InputTextStyle},
    builder::{CreateActionRow, CreateButton, CreateInputText, CreateModal},
};

use crate::audio::EntryId;

/// IDs personalizados para los botones
pub mod button_ids {
    pub const ADD_SONG: &str = "add_song";
    pub const NEXT: &str = "next";
    pub const DELETE_CONFIRM_PREFIX: &str = "delete_confirm:";
    pub const DELETE_CANCEL: &str = "delete_cancel";
}

/// IDs del modal para agregar canciones
pub mod modal_ids {
    pub const ADD_SONG: &str = "add_song_modal";
    pub const URL: &str = "url";
    pub const PITCH: &str = "pitch";
}

/// Botones del mensaje de estado de la cola: siempre "Add Song", y "Next"
/// cuando hay canciones esperando.
pub fn create_queue_buttons(has_pending: bool) -> Vec<CreateActionRow> {
    let add_btn = CreateButton::new(button_ids::ADD_SONG)
        .label("Add Song")
        .style(ButtonStyle::Success);

    let mut row = vec![add_btn];
    if has_pending {
        row.push(
            CreateButton::new(button_ids::NEXT)
                .label("Next")
                .style(ButtonStyle::Primary),
        );
    }
    vec![CreateActionRow::Buttons(row)]
}

/// Crea botones de confirmación para borrar una entrada
pub fn create_delete_confirmation_buttons(entry_id: EntryId) -> CreateActionRow {
    let confirm_id = format!("{}{}", button_ids::DELETE_CONFIRM_PREFIX, entry_id);
    let confirm_btn = CreateButton::new(confirm_id)
        .label("Delete")
        .style(ButtonStyle::Danger);

    let cancel_btn = CreateButton::new(button_ids::DELETE_CANCEL)
        .label("Cancel")
        .style(ButtonStyle::Secondary);

    CreateActionRow::Buttons(vec![confirm_btn, cancel_btn])
}

/// Entry id carried by a delete confirmation button.
pub fn parse_delete_confirm(custom_id: &str) -> Option<EntryId> {
    custom_id
        .strip_prefix(button_ids::DELETE_CONFIRM_PREFIX)?
        .parse()
        .ok()
}

/// Modal "Add Song": URL y pitch opcional
pub fn create_add_song_modal() -> CreateModal {
    let url = CreateInputText::new(InputTextStyle::Short, "URL", modal_ids::URL).required(true);
    let pitch = CreateInputText::new(
        InputTextStyle::Short,
        "Pitch Shift (optional)",
        modal_ids::PITCH,
    )
    .required(false);

    CreateModal::new(modal_ids::ADD_SONG, "Add Song").components(vec![
        CreateActionRow::InputText(url),
        CreateActionRow::InputText(pitch),
    ])
}

/// Values submitted through the add-song modal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddSongForm {
    pub url: String,
    pub pitch_shift: i32,
}

/// Lee el modal enviado. A blank pitch means no shift.
pub fn parse_add_song_modal(rows: &[ActionRow]) -> Result<AddSongForm, String> {
    let mut url = None;
    let mut pitch = None;
    for component in rows.iter().flat_map(|row| row.components.iter()) {
        if let ActionRowComponent::InputText(input) = component {
            match input.custom_id.as_str() {
                modal_ids::URL => url = input.value.clone(),
                modal_ids::PITCH => pitch = input.value.clone(),
                _ => {}
            }
        }
    }

    let url = url
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| "Please enter a URL.".to_string())?;
    let pitch_shift = parse_pitch(pitch.as_deref().unwrap_or(""))?;
    Ok(AddSongForm { url, pitch_shift })
}

pub fn parse_pitch(raw: &str) -> Result<i32, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    raw.trim_start_matches('+')
        .parse()
        .map_err(|_| format!("Invalid pitch `{}`, expected a whole number of semitones.", raw))
}
