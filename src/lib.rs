#![forbid(unsafe_code)]

//! Shared building blocks for the `tubepulse` service binary.

pub mod cache;
pub mod config;
pub mod logging;
pub mod security;
pub mod settings;
pub mod tool;
pub mod worker;
pub mod ytdlp;
