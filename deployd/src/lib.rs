//! deployd library
//!
//! Revision-tracked deployment of git working trees onto remote filesystems.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod progress;
pub mod source;
pub mod storage;
pub mod target;
pub mod utils;
pub mod workers;
