//! In-memory catalog and engine used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rmp_proto::protocol::TrackRef;
use tokio::sync::{mpsc, Notify};

use crate::catalog::{Catalog, CoverImage};
use crate::engine::{EngineEvent, LoadId, MediaEngine};
use crate::error::{CatalogError, EngineError};

fn unavailable(endpoint: &str) -> CatalogError {
    CatalogError::Status {
        endpoint: endpoint.to_string(),
        status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
    }
}

// ── catalog ───────────────────────────────────────────────────────────────────

type ChooseHook = (String, Box<dyn FnOnce() + Send>);

#[derive(Default)]
pub struct FakeCatalog {
    known: Vec<String>,
    counters: Mutex<HashMap<String, u32>>,
    failing: Mutex<HashSet<String>>,
    panic_once: Mutex<HashSet<String>>,
    cover_fails: Mutex<bool>,
    reports_fail: Mutex<bool>,
    on_choose: Mutex<Option<ChooseHook>>,
    now_playing: Mutex<Vec<(String, u8, bool)>>,
    played: Mutex<Vec<(String, i64)>>,
    pub played_notify: Notify,
}

impl FakeCatalog {
    pub fn new(known: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            known: known.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    pub fn set_failing(&self, playlist: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(playlist.to_string());
        } else {
            set.remove(playlist);
        }
    }

    pub fn panic_once(&self, playlist: &str) {
        self.panic_once.lock().unwrap().insert(playlist.to_string());
    }

    pub fn set_cover_fails(&self, fails: bool) {
        *self.cover_fails.lock().unwrap() = fails;
    }

    /// Make `report_now_playing` and `report_played` fail without recording.
    pub fn set_reports_fail(&self, fails: bool) {
        *self.reports_fail.lock().unwrap() = fails;
    }

    /// Run `hook` once, the next time a track is chosen from `playlist`.
    pub fn on_choose(&self, playlist: &str, hook: impl FnOnce() + Send + 'static) {
        *self.on_choose.lock().unwrap() = Some((playlist.to_string(), Box::new(hook)));
    }

    /// How many tracks were chosen from `playlist`.
    pub fn chosen(&self, playlist: &str) -> u32 {
        self.counters.lock().unwrap().get(playlist).copied().unwrap_or(0)
    }

    pub fn now_playing_reports(&self) -> Vec<(String, u8, bool)> {
        self.now_playing.lock().unwrap().clone()
    }

    pub fn played_reports(&self) -> Vec<(String, i64)> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    fn known_playlists(&self) -> Vec<String> {
        self.known.clone()
    }

    async fn choose_track(&self, playlist: &str) -> Result<TrackRef, CatalogError> {
        if self.panic_once.lock().unwrap().remove(playlist) {
            panic!("choose_track exploded for {}", playlist);
        }
        let hook = {
            let mut slot = self.on_choose.lock().unwrap();
            match slot.take() {
                Some((name, hook)) if name == playlist => Some(hook),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(hook) = hook {
            hook();
        }
        if self.failing.lock().unwrap().contains(playlist) {
            return Err(unavailable("choose_track"));
        }
        let n = {
            let mut counters = self.counters.lock().unwrap();
            let n = counters.entry(playlist.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        Ok(TrackRef {
            path: format!("{}/{}.mp3", playlist, n),
            duration: 180,
            title: Some(format!("{} track {}", playlist, n)),
            ..Default::default()
        })
    }

    async fn fetch_audio(&self, track: &TrackRef) -> Result<Vec<u8>, CatalogError> {
        Ok(format!("audio:{}", track.path).into_bytes())
    }

    async fn fetch_cover(&self, track: &TrackRef) -> Result<CoverImage, CatalogError> {
        if *self.cover_fails.lock().unwrap() {
            return Err(unavailable("cover"));
        }
        Ok(CoverImage {
            data: format!("cover:{}", track.path).into_bytes(),
            content_type: "image/webp".to_string(),
        })
    }

    async fn fetch_lyrics(&self, track: &TrackRef) -> Result<Option<String>, CatalogError> {
        Ok(Some(format!("lyrics for {}", track.path)))
    }

    async fn report_now_playing(
        &self,
        path: &str,
        progress: u8,
        paused: bool,
    ) -> Result<(), CatalogError> {
        if *self.reports_fail.lock().unwrap() {
            return Err(unavailable("now_playing"));
        }
        self.now_playing
            .lock()
            .unwrap()
            .push((path.to_string(), progress, paused));
        Ok(())
    }

    async fn report_played(&self, path: &str, started_at: i64) -> Result<(), CatalogError> {
        if *self.reports_fail.lock().unwrap() {
            self.played_notify.notify_one();
            return Err(unavailable("played"));
        }
        self.played
            .lock()
            .unwrap()
            .push((path.to_string(), started_at));
        self.played_notify.notify_one();
        Ok(())
    }
}

// ── engine ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct EngineState {
    loaded: Option<(LoadId, PathBuf)>,
    paused: bool,
    position: f64,
    duration: f64,
    volume: u8,
    calls: Vec<String>,
    fail_next_load: bool,
}

pub struct FakeEngine {
    state: Mutex<EngineState>,
    next_id: AtomicU64,
    events: mpsc::Sender<EngineEvent>,
}

impl FakeEngine {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let engine = Arc::new(Self {
            state: Mutex::new(EngineState {
                volume: 50,
                ..Default::default()
            }),
            next_id: AtomicU64::new(1),
            events: tx,
        });
        (engine, rx)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn loaded_path(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().loaded.as_ref().map(|(_, p)| p.clone())
    }

    pub fn current_load(&self) -> Option<LoadId> {
        self.state.lock().unwrap().loaded.as_ref().map(|(id, _)| *id)
    }

    pub fn set_timeline(&self, position: f64, duration: f64) {
        let mut st = self.state.lock().unwrap();
        st.position = position;
        st.duration = duration;
    }

    pub fn fail_next_load(&self) {
        self.state.lock().unwrap().fail_next_load = true;
    }

    /// Simulate mpv reaching the end of the current file.
    pub async fn finish_current(&self) -> LoadId {
        let id = {
            let mut st = self.state.lock().unwrap();
            let (id, _) = st.loaded.take().expect("nothing loaded");
            st.paused = false;
            id
        };
        self.events.send(EngineEvent::EndReached(id)).await.unwrap();
        id
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn load(&self, source: &Path) -> Result<LoadId, EngineError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("load {}", source.display()));
        if std::mem::take(&mut st.fail_next_load) {
            return Err(EngineError::Ipc("loadfile failed".into()));
        }
        assert!(source.exists(), "engine asked to load a missing file");
        let id = LoadId(self.next_id.fetch_add(1, Ordering::Relaxed));
        st.loaded = Some((id, source.to_path_buf()));
        st.paused = true;
        st.position = 0.0;
        Ok(id)
    }

    async fn play(&self) -> Result<(), EngineError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("play".into());
        st.paused = false;
        Ok(())
    }

    async fn pause(&self) -> Result<(), EngineError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("pause".into());
        st.paused = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("stop".into());
        st.loaded = None;
        Ok(())
    }

    async fn seek(&self, seconds: f64) -> Result<(), EngineError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("seek {}", seconds));
        st.position = seconds.clamp(0.0, st.duration.max(0.0));
        Ok(())
    }

    async fn set_volume(&self, level: u8) -> Result<(), EngineError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("volume {}", level));
        st.volume = level;
        Ok(())
    }

    fn volume(&self) -> u8 {
        self.state.lock().unwrap().volume
    }

    fn position(&self) -> f64 {
        self.state.lock().unwrap().position
    }

    fn duration(&self) -> f64 {
        self.state.lock().unwrap().duration
    }

    fn is_playing(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.loaded.is_some() && !st.paused
    }

    fn has_media(&self) -> bool {
        self.state.lock().unwrap().loaded.is_some()
    }

    async fn shutdown(&self) {
        self.state.lock().unwrap().calls.push("shutdown".into());
    }
}
