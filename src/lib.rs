#![cfg_attr(target_os = "none", no_std)]

pub mod console;
pub mod metadata;
pub mod settings;
pub mod telemetry;

#[cfg(target_os = "none")]
pub mod hardware;
