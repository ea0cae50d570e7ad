//! Persistent configuration and on-disk layout

pub mod layout;
pub mod settings;
