//! Media engine seam.
//!
//! The player drives exactly one engine instance. Every `load` gets a fresh
//! [`LoadId`]; terminal notifications carry that id so the player can drop
//! events that belong to a file it has already replaced or stopped.

use std::path::Path;

use async_trait::async_trait;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadId(pub u64);

/// Unsolicited notifications from the engine's own IO task.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Playback reached the end of the file. Sent at most once per load.
    EndReached(LoadId),
    /// The engine gave up on the file (decode error, unreadable file).
    Failed(LoadId, String),
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Load a file, replacing whatever was loaded before. Does not unpause.
    async fn load(&self, source: &Path) -> Result<LoadId, EngineError>;

    async fn play(&self) -> Result<(), EngineError>;

    async fn pause(&self) -> Result<(), EngineError>;

    /// Stop playback and drop the engine's reference to the loaded file.
    async fn stop(&self) -> Result<(), EngineError>;

    /// Absolute seek; out-of-range targets are clamped by the engine.
    async fn seek(&self, seconds: f64) -> Result<(), EngineError>;

    async fn set_volume(&self, level: u8) -> Result<(), EngineError>;

    fn volume(&self) -> u8;

    fn position(&self) -> f64;

    fn duration(&self) -> f64;

    fn is_playing(&self) -> bool;

    fn has_media(&self) -> bool;

    /// Tear the engine down at process exit.
    async fn shutdown(&self);
}
