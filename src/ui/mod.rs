//! Embeds, botones y modales de la interfaz de Discord.

pub mod buttons;
pub mod embeds;
