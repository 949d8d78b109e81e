//! Player: the single owner of what is currently audible.
//!
//! All mutators (`play`, `pause`, `stop`, `next`, `seek`, `set_volume`) and
//! the engine's end-of-file handling are serialized behind one async mutex
//! that is held across engine calls. A `next(retry = true)` that finds every
//! queue empty releases the lock while it waits; it re-checks `epoch` on
//! each attempt and gives up once another mutator has loaded a track or
//! stopped playback.
//!
//! Audio bytes are written to a temp file for mpv to read. Exactly one such
//! file is live: the previous one is dropped (and unlinked) only after the
//! engine has been pointed at its replacement, on `stop`, or once the track
//! has ended. A track that ended with nothing cached leaves the player `Idle`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rmp_proto::config::PlayerConfig;
use rmp_proto::protocol::{PlaybackStatus, PlayerView, TrackRef};
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{DownloadedTrack, PrefetchCache};
use crate::catalog::{Catalog, CoverImage};
use crate::engine::{EngineEvent, LoadId, MediaEngine};
use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub next_retry_delay: Duration,
    pub now_playing_interval: Duration,
    pub scratch_dir: PathBuf,
}

impl From<&PlayerConfig> for PlayerSettings {
    fn from(config: &PlayerConfig) -> Self {
        Self {
            next_retry_delay: config.next_retry_delay(),
            now_playing_interval: config.now_playing_interval(),
            scratch_dir: config.scratch_dir(),
        }
    }
}

/// The current track minus its audio, which now belongs to the engine.
#[derive(Debug, Clone)]
pub struct NowPlaying {
    pub track: TrackRef,
    pub cover: Option<CoverImage>,
    pub lyrics: Option<String>,
}

#[derive(Default)]
struct PlaybackState {
    status: PlaybackStatus,
    current: Option<NowPlaying>,
    /// Unix seconds at which `current` was loaded.
    started_at: Option<i64>,
    /// Engine load backing `current`; cleared once its end event is handled.
    load: Option<LoadId>,
    resource: Option<NamedTempFile>,
    /// Bumped whenever a track is loaded or playback is stopped.
    epoch: u64,
}

impl PlaybackState {
    /// The engine is done with the current track: drop it and go idle.
    fn release_finished(&mut self) -> Option<(NowPlaying, Option<i64>)> {
        self.load = None;
        self.resource = None;
        self.status = PlaybackStatus::Idle;
        let started_at = self.started_at.take();
        self.current.take().map(|np| (np, started_at))
    }
}

pub struct Player {
    engine: Arc<dyn MediaEngine>,
    cache: Arc<PrefetchCache>,
    catalog: Arc<dyn Catalog>,
    settings: PlayerSettings,
    state: Mutex<PlaybackState>,
    cancel: CancellationToken,
}

impl Player {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        cache: Arc<PrefetchCache>,
        catalog: Arc<dyn Catalog>,
        settings: PlayerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            cache,
            catalog,
            settings,
            state: Mutex::new(PlaybackState::default()),
            cancel,
        }
    }

    // ── mutators ──────────────────────────────────────────────────────────────

    /// Resume the loaded track, or start the next one if nothing is loaded.
    pub async fn play(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().await;
            if state.current.is_some() {
                if state.status != PlaybackStatus::Playing {
                    self.engine.play().await?;
                    state.status = PlaybackStatus::Playing;
                }
                return Ok(());
            }
        }
        self.next(false).await.map(|_| ())
    }

    pub async fn pause(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.current.is_none() || state.status == PlaybackStatus::Paused {
            return Ok(());
        }
        self.engine.pause().await?;
        state.status = PlaybackStatus::Paused;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        // supersede any auto-advance that is waiting for the cache
        state.epoch += 1;
        if state.current.is_none() && state.resource.is_none() {
            return Ok(());
        }

        info!("Stopping playback");
        let result = self.engine.stop().await;
        state.resource = None;
        state.current = None;
        state.started_at = None;
        state.load = None;
        state.status = PlaybackStatus::Stopped;
        result
    }

    /// Start the next cached track. Returns whether a track was started.
    ///
    /// With `retry`, keeps polling the cache every `next_retry_delay` until a
    /// track is available or the attempt is superseded.
    pub async fn next(&self, retry: bool) -> Result<bool, EngineError> {
        self.advance(retry, None).await
    }

    pub async fn seek(&self, seconds: u32) -> Result<(), EngineError> {
        let state = self.state.lock().await;
        if state.current.is_none() {
            return Ok(());
        }
        debug!("Seek to: {}", seconds);
        self.engine.seek(f64::from(seconds)).await
    }

    pub async fn set_volume(&self, level: u8) -> Result<(), EngineError> {
        let _state = self.state.lock().await;
        self.engine.set_volume(level.min(100)).await
    }

    // ── reads ─────────────────────────────────────────────────────────────────

    pub fn volume(&self) -> u8 {
        self.engine.volume()
    }

    pub fn has_media(&self) -> bool {
        self.engine.has_media()
    }

    pub fn is_playing(&self) -> bool {
        self.engine.is_playing()
    }

    pub fn position(&self) -> u32 {
        self.engine.position().max(0.0) as u32
    }

    pub fn duration(&self) -> u32 {
        self.engine.duration().max(0.0) as u32
    }

    pub fn position_percent(&self) -> u8 {
        let duration = self.engine.duration();
        if !duration.is_finite() || duration <= 0.0 {
            return 0;
        }
        (self.engine.position() / duration * 100.0).clamp(0.0, 100.0) as u8
    }

    pub async fn status(&self) -> PlaybackStatus {
        self.state.lock().await.status
    }

    pub async fn now_playing(&self) -> Option<NowPlaying> {
        self.state.lock().await.current.clone()
    }

    pub async fn started_at(&self) -> Option<i64> {
        self.state.lock().await.started_at
    }

    pub async fn view(&self) -> PlayerView {
        let status = self.status().await;
        PlayerView {
            status,
            has_media: self.has_media(),
            is_playing: self.is_playing(),
            position: self.position(),
            position_percent: self.position_percent(),
            duration: self.duration(),
            volume: self.volume(),
        }
    }

    // ── advancing ─────────────────────────────────────────────────────────────

    /// `expected` is the epoch this attempt belongs to; `None` takes the
    /// current one on the first locked pass.
    async fn advance(&self, retry: bool, mut expected: Option<u64>) -> Result<bool, EngineError> {
        loop {
            {
                let mut state = self.state.lock().await;
                let epoch = *expected.get_or_insert(state.epoch);
                if state.epoch != epoch {
                    debug!("next: superseded by another playback change");
                    return Ok(false);
                }

                match self.pick() {
                    Some(download) => match self.start(&mut state, download).await {
                        Ok(()) => return Ok(true),
                        Err(e) if retry => warn!("Failed to load track, trying another: {}", e),
                        Err(e) => return Err(e),
                    },
                    None if retry => info!("No cached track available, retrying"),
                    None => {
                        info!("No cached track available");
                        return Ok(false);
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.settings.next_retry_delay) => {}
            }
        }
    }

    fn pick(&self) -> Option<DownloadedTrack> {
        let playlist = self.cache.select_next_playlist()?;
        self.cache.take(&playlist)
    }

    async fn start(
        &self,
        state: &mut PlaybackState,
        download: DownloadedTrack,
    ) -> Result<(), EngineError> {
        let DownloadedTrack {
            track,
            audio,
            cover,
            lyrics,
        } = download;

        let file = materialize(&self.settings.scratch_dir, &audio)?;
        drop(audio);
        let load = self.engine.load(file.path()).await?;

        // The engine now reads the new file; the old one can go.
        if let Some(previous) = state.resource.replace(file) {
            debug!("releasing {}", previous.path().display());
        }

        info!("Playing track: {}", track.display_title());
        state.current = Some(NowPlaying {
            track,
            cover,
            lyrics,
        });
        state.started_at = Some(chrono::Utc::now().timestamp());
        state.load = Some(load);
        state.epoch += 1;

        match self.engine.play().await {
            Ok(()) => state.status = PlaybackStatus::Playing,
            Err(e) => {
                warn!("Track loaded but engine refused to play: {}", e);
                state.status = PlaybackStatus::Paused;
            }
        }
        Ok(())
    }

    // ── engine events ─────────────────────────────────────────────────────────

    pub async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::EndReached(id) => self.on_end_reached(id).await,
            EngineEvent::Failed(id, reason) => self.on_failed(id, reason).await,
        }
    }

    async fn on_end_reached(&self, id: LoadId) {
        let (epoch, finished) = {
            let mut state = self.state.lock().await;
            if state.load != Some(id) {
                debug!("ignoring end of stale load {:?}", id);
                return;
            }
            let finished = state
                .release_finished()
                .and_then(|(np, started_at)| Some((np.track.path, started_at?)));
            (state.epoch, finished)
        };

        info!("Media ended, play next");
        if let Some((path, started_at)) = finished {
            let catalog = Arc::clone(&self.catalog);
            tokio::spawn(async move {
                if let Err(e) = catalog.report_played(&path, started_at).await {
                    warn!("Failed to submit played for {}: {}", path, e);
                }
            });
        }

        if let Err(e) = self.advance(true, Some(epoch)).await {
            error!("Auto-advance failed: {}", e);
        }
    }

    async fn on_failed(&self, id: LoadId, reason: String) {
        let epoch = {
            let mut state = self.state.lock().await;
            if state.load != Some(id) {
                return;
            }
            let path = state
                .release_finished()
                .map(|(np, _)| np.track.path)
                .unwrap_or_default();
            warn!("Engine failed to play {}: {}", path, reason);
            state.epoch
        };

        if let Err(e) = self.advance(true, Some(epoch)).await {
            error!("Auto-advance failed: {}", e);
        }
    }

    // ── background tasks ──────────────────────────────────────────────────────

    /// Feed engine events into the player until the channel closes or the
    /// daemon shuts down.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<EngineEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let player = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = player.cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(event) => player.handle_engine_event(event).await,
                    None => {
                        warn!("engine event channel closed");
                        break;
                    }
                }
            }
        })
    }

    pub fn spawn_now_playing_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let player = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(player.settings.now_playing_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = player.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                player.report_now_playing().await;
            }
        })
    }

    async fn report_now_playing(&self) {
        let report = {
            let state = self.state.lock().await;
            match state.current.as_ref() {
                Some(np) if self.engine.has_media() => Some((
                    np.track.path.clone(),
                    state.status != PlaybackStatus::Playing,
                )),
                _ => None,
            }
        };

        if let Some((path, paused)) = report {
            let progress = self.position_percent();
            if let Err(e) = self
                .catalog
                .report_now_playing(&path, progress, paused)
                .await
            {
                warn!("Failed to submit now playing info: {}", e);
            }
        }
    }

    /// Stop the engine and release the transient file. Used at exit.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        if state.current.is_some() {
            if let Err(e) = self.engine.stop().await {
                warn!("engine stop during shutdown failed: {}", e);
            }
        }
        state.resource = None;
        state.current = None;
        state.load = None;
        state.status = PlaybackStatus::Stopped;
        self.engine.shutdown().await;
    }
}

fn materialize(dir: &Path, audio: &[u8]) -> Result<NamedTempFile, EngineError> {
    let mut file = tempfile::Builder::new()
        .prefix("rmp-playback-")
        .tempfile_in(dir)?;
    file.write_all(audio)?;
    file.flush()?;
    Ok(file)
}
