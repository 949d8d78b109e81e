//! Per-playlist prefetch cache.
//!
//! One FIFO of fully downloaded tracks per enabled playlist, kept topped up
//! by a perpetual refill loop. All queue, cursor and enabled-set state lives
//! in one `CacheState` behind a single mutex; the lock is never held across
//! a catalog call.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rmp_proto::config::{CacheConfig, OptionalFetchPolicy};
use rmp_proto::protocol::TrackRef;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, CoverImage};
use crate::error::CatalogError;

/// A track with everything needed to play and display it, no network required.
#[derive(Debug, Clone)]
pub struct DownloadedTrack {
    pub track: TrackRef,
    pub audio: Vec<u8>,
    pub cover: Option<CoverImage>,
    pub lyrics: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Total tracks buffered across all enabled playlists.
    pub size: usize,
    pub refill_interval: Duration,
    pub retry_backoff: Duration,
    pub optional_fetch_failure: OptionalFetchPolicy,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            size: config.size,
            refill_interval: config.refill_interval(),
            retry_backoff: config.retry_backoff(),
            optional_fetch_failure: config.optional_fetch_failure,
        }
    }
}

#[derive(Default)]
struct CacheState {
    /// Rotation order; no duplicates.
    enabled: Vec<String>,
    /// Queues survive disabling so a re-enabled playlist starts warm.
    queues: HashMap<String, VecDeque<DownloadedTrack>>,
    /// Playlist chosen by the previous `select_next_playlist`.
    cursor: Option<String>,
    /// Playlists whose last download failed are skipped until this instant.
    retry_after: HashMap<String, Instant>,
}

impl CacheState {
    fn capacity(&self, size: usize) -> usize {
        match self.enabled.len() {
            0 => 0,
            n => size.div_ceil(n),
        }
    }

    fn queue_len(&self, playlist: &str) -> usize {
        self.queues.get(playlist).map_or(0, VecDeque::len)
    }
}

pub struct PrefetchCache {
    catalog: Arc<dyn Catalog>,
    settings: CacheSettings,
    state: Mutex<CacheState>,
}

impl PrefetchCache {
    pub fn new(catalog: Arc<dyn Catalog>, settings: CacheSettings) -> Self {
        Self {
            catalog,
            settings,
            state: Mutex::new(CacheState::default()),
        }
    }

    // A refill pass that panicked must not take the cache down with it.
    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the enabled set. Queued tracks of dropped playlists are kept.
    pub fn set_enabled_playlists(&self, names: Vec<String>) {
        let mut deduped: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            if !deduped.contains(&name) {
                deduped.push(name);
            }
        }

        let mut state = self.state();
        info!(
            "cache: enabled playlists {:?} → {:?} (capacity {} each)",
            state.enabled,
            deduped,
            match deduped.len() {
                0 => 0,
                n => self.settings.size.div_ceil(n),
            }
        );
        state.enabled = deduped;
    }

    pub fn enabled_playlists(&self) -> Vec<String> {
        self.state().enabled.clone()
    }

    /// Per-playlist target length for the current enabled set.
    pub fn capacity(&self) -> usize {
        self.state().capacity(self.settings.size)
    }

    pub fn queue_len(&self, playlist: &str) -> usize {
        self.state().queue_len(playlist)
    }

    /// Pop the oldest cached track of `playlist`. Never fetches.
    pub fn take(&self, playlist: &str) -> Option<DownloadedTrack> {
        let mut state = self.state();
        let track = state.queues.get_mut(playlist)?.pop_front();
        if let Some(ref t) = track {
            debug!(
                "cache[{}]: took {} ({} left)",
                playlist,
                t.track.path,
                state.queue_len(playlist)
            );
        }
        track
    }

    /// Advance the rotation cursor over the current enabled list.
    ///
    /// If the previous choice has since been disabled, rotation restarts at
    /// the first enabled playlist.
    pub fn select_next_playlist(&self) -> Option<String> {
        let mut state = self.state();
        if state.enabled.is_empty() {
            debug!("cache: no playlists enabled");
            return None;
        }

        let next_idx = state
            .cursor
            .as_ref()
            .and_then(|prev| state.enabled.iter().position(|p| p == prev))
            .map_or(0, |idx| (idx + 1) % state.enabled.len());

        let chosen = state.enabled[next_idx].clone();
        state.cursor = Some(chosen.clone());
        debug!("cache: chosen playlist {}", chosen);
        Some(chosen)
    }

    /// Whether `playlist` should get a download in this pass. Re-reads the
    /// live enabled set so a playlist disabled mid-pass is skipped.
    fn wants_refill(&self, playlist: &str) -> bool {
        let state = self.state();
        if !state.enabled.iter().any(|p| p == playlist) {
            return false;
        }
        if let Some(until) = state.retry_after.get(playlist) {
            if Instant::now() < *until {
                return false;
            }
        }
        state.queue_len(playlist) < state.capacity(self.settings.size)
    }

    fn push(&self, playlist: &str, track: DownloadedTrack) {
        let mut state = self.state();
        state.retry_after.remove(playlist);
        let capacity = state.capacity(self.settings.size);
        let queue = state.queues.entry(playlist.to_string()).or_default();
        if queue.len() >= capacity {
            // enabled set grew while downloading
            debug!(
                "cache[{}]: discarding {}, queue already at capacity {}",
                playlist, track.track.path, capacity
            );
            return;
        }
        queue.push_back(track);
        debug!("cache[{}]: {} / {} cached", playlist, queue.len(), capacity);
    }

    fn back_off(&self, playlist: &str) {
        let until = Instant::now() + self.settings.retry_backoff;
        self.state().retry_after.insert(playlist.to_string(), until);
    }

    /// Download at most one track for every enabled playlist that is below
    /// capacity. A failing playlist is backed off without delaying the rest.
    pub async fn refill_pass(&self) {
        let playlists = self.enabled_playlists();
        for playlist in playlists {
            if !self.wants_refill(&playlist) {
                continue;
            }
            match self.download(&playlist).await {
                Ok(track) => self.push(&playlist, track),
                Err(e) => {
                    warn!("cache[{}]: failed to download track: {}", playlist, e);
                    self.back_off(&playlist);
                }
            }
        }
    }

    async fn download(&self, playlist: &str) -> Result<DownloadedTrack, CatalogError> {
        let track = self.catalog.choose_track(playlist).await?;
        info!("cache[{}]: downloading {}", playlist, track.path);

        let audio = self.catalog.fetch_audio(&track).await?;
        let cover = self.optional(&track, "cover", self.catalog.fetch_cover(&track).await)?;
        let lyrics = self
            .optional(&track, "lyrics", self.catalog.fetch_lyrics(&track).await)?
            .flatten();

        Ok(DownloadedTrack {
            track,
            audio,
            cover,
            lyrics,
        })
    }

    fn optional<T>(
        &self,
        track: &TrackRef,
        what: &str,
        result: Result<T, CatalogError>,
    ) -> Result<Option<T>, CatalogError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) => match self.settings.optional_fetch_failure {
                OptionalFetchPolicy::KeepTrack => {
                    warn!("cache: no {} for {}: {}", what, track.path, e);
                    Ok(None)
                }
                OptionalFetchPolicy::DropTrack => Err(e),
            },
        }
    }

    /// Run `refill_pass` every `refill_interval` until cancelled. Each pass
    /// runs in its own task so a panic inside it is logged, not fatal.
    pub fn spawn_refill_loop(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            info!("cache: refill loop started");
            loop {
                let pass = {
                    let cache = Arc::clone(&cache);
                    tokio::spawn(async move { cache.refill_pass().await })
                };
                let abort = pass.abort_handle();

                tokio::select! {
                    _ = cancel.cancelled() => {
                        abort.abort();
                        break;
                    }
                    result = pass => {
                        if let Err(e) = result {
                            error!("cache: refill pass aborted: {}", e);
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(cache.settings.refill_interval) => {}
                }
            }
            info!("cache: refill loop stopped");
        })
    }
}
