/// mpv-backed [`MediaEngine`] over JSON IPC.
///
/// ```text
///   MpvEngine::start()
///         │
///         ├── writer_task   ← MpvRequest via mpsc, serialised → socket
///         ├── reader_task   ← JSON lines from socket
///         │                      ├── response (has request_id) → matched oneshot::Sender
///         │                      └── event / property-change   → raw event channel
///         └── event_task    ← folds property changes into `Observed`,
///                             turns `end-file` into EngineEvent
/// ```
///
/// Reads (`position`, `volume`, ...) come from the observed snapshot and
/// never touch the socket.
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use rmp_proto::config::MpvConfig;
use rmp_proto::platform;

use crate::engine::{EngineEvent, LoadId, MediaEngine};
use crate::error::EngineError;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

const OBS_PAUSE: u64 = 1;
const OBS_IDLE: u64 = 2;
const OBS_TIME_POS: u64 = 3;
const OBS_DURATION: u64 = 4;
const OBS_VOLUME: u64 = 5;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, EngineError>>>>>;

struct MpvRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<Result<Value, EngineError>>,
}

// ── handle ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct MpvHandle {
    tx: mpsc::Sender<MpvRequest>,
}

impl MpvHandle {
    async fn send(&self, command: Value) -> Result<Value, EngineError> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = msg.to_string();
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(MpvRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::Ipc("writer task gone".into()))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| EngineError::Ipc(format!("timeout for req={}", req_id)))?
            .map_err(|_| EngineError::Ipc(format!("reply channel dropped req={}", req_id)))?
    }

    async fn set_property(&self, name: &str, value: Value) -> Result<(), EngineError> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    async fn observe_properties(&self) {
        let props = [
            (OBS_PAUSE, "pause"),
            (OBS_IDLE, "idle-active"),
            (OBS_TIME_POS, "time-pos"),
            (OBS_DURATION, "duration"),
            (OBS_VOLUME, "volume"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

fn start_io_tasks(stream: UnixStream, raw_tx: mpsc::Sender<Value>) -> MpvHandle {
    let (read_half, write_half) = stream.into_split();
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<MpvRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, raw_tx));

    MpvHandle { tx: cmd_tx }
}

// ── observed state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Observed {
    paused: bool,
    idle: bool,
    time_pos: f64,
    duration: f64,
    volume: f64,
}

impl Default for Observed {
    fn default() -> Self {
        Self {
            paused: false,
            idle: true,
            time_pos: 0.0,
            duration: 0.0,
            volume: 0.0,
        }
    }
}

/// mpv playlist entry of a load.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Entry {
    /// `loadfile` sent, reply not seen yet; `previous` is the entry it replaces.
    Pending { previous: Option<i64> },
    Known(Option<i64>),
}

/// Which mpv playlist entry belongs to which [`LoadId`].
#[derive(Debug, Default)]
struct LoadTracker {
    current: Option<(Entry, LoadId)>,
}

impl LoadTracker {
    /// Register `id` before `loadfile` goes out. Returns the load it replaces.
    fn begin(&mut self, id: LoadId) -> Option<(Entry, LoadId)> {
        let previous = match self.current {
            Some((Entry::Known(entry), _)) => entry,
            _ => None,
        };
        self.current.replace((Entry::Pending { previous }, id))
    }

    /// Pin the entry id from the `loadfile` reply, unless the load already ended.
    fn confirm(&mut self, id: LoadId, entry: Option<i64>) {
        if matches!(self.current, Some((Entry::Pending { .. }, current)) if current == id) {
            self.current = Some((Entry::Known(entry), id));
        }
    }

    /// `loadfile` was rejected: mpv still has the replaced load.
    fn abort(&mut self, id: LoadId, replaced: Option<(Entry, LoadId)>) {
        if matches!(self.current, Some((_, current)) if current == id) {
            self.current = replaced;
        }
    }

    /// Claim the current load if `entry` refers to it. At most once per load.
    fn claim(&mut self, entry: Option<i64>) -> Option<LoadId> {
        let matches = match self.current? {
            (Entry::Known(known), _) => known.is_none() || entry.is_none() || known == entry,
            (Entry::Pending { previous }, _) => entry.is_none() || entry != previous,
        };
        if matches {
            self.current.take().map(|(_, id)| id)
        } else {
            None
        }
    }
}

fn apply_event(
    raw: &Value,
    observed: &mut Observed,
    loads: &mut LoadTracker,
) -> Option<EngineEvent> {
    match raw.get("event")?.as_str()? {
        "property-change" => {
            let data = raw.get("data").unwrap_or(&Value::Null);
            match raw.get("id")?.as_u64()? {
                OBS_PAUSE => observed.paused = data.as_bool().unwrap_or(false),
                OBS_IDLE => observed.idle = data.as_bool().unwrap_or(true),
                OBS_TIME_POS => observed.time_pos = data.as_f64().unwrap_or(0.0),
                OBS_DURATION => observed.duration = data.as_f64().unwrap_or(0.0),
                OBS_VOLUME => observed.volume = data.as_f64().unwrap_or(observed.volume),
                _ => {}
            }
            None
        }
        "end-file" => {
            let reason = raw.get("reason").and_then(Value::as_str).unwrap_or("");
            let entry = raw.get("playlist_entry_id").and_then(Value::as_i64);
            match reason {
                "eof" => loads.claim(entry).map(EngineEvent::EndReached),
                "error" => {
                    let detail = raw
                        .get("file_error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string();
                    loads.claim(entry).map(|id| EngineEvent::Failed(id, detail))
                }
                // stop / quit / redirect: the player already moved on
                _ => None,
            }
        }
        _ => None,
    }
}

async fn event_task(
    mut raw_rx: mpsc::Receiver<Value>,
    observed: Arc<StdMutex<Observed>>,
    loads: Arc<StdMutex<LoadTracker>>,
    events: mpsc::Sender<EngineEvent>,
) {
    while let Some(raw) = raw_rx.recv().await {
        let event = {
            let mut observed = observed.lock().unwrap_or_else(|e| e.into_inner());
            let mut loads = loads.lock().unwrap_or_else(|e| e.into_inner());
            apply_event(&raw, &mut observed, &mut loads)
        };
        if let Some(event) = event {
            debug!("mpv: {:?}", event);
            if events.send(event).await.is_err() {
                break;
            }
        }
    }
    debug!("mpv event task: exiting");
}

// ── engine ────────────────────────────────────────────────────────────────────

pub struct MpvEngine {
    handle: MpvHandle,
    process: Mutex<Option<tokio::process::Child>>,
    socket_path: PathBuf,
    observed: Arc<StdMutex<Observed>>,
    loads: Arc<StdMutex<LoadTracker>>,
    next_load: AtomicU64,
    /// Last pause state we asked mpv for.
    want_paused: AtomicBool,
}

impl MpvEngine {
    /// Spawn mpv idle and paused-on-load, connect to its IPC socket.
    pub async fn start(
        config: &MpvConfig,
        volume: u8,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>), EngineError> {
        let socket_path = platform::mpv_socket_path();
        let _ = tokio::fs::remove_file(&socket_path).await;

        let mpv_binary = config
            .binary
            .clone()
            .or_else(platform::find_mpv_binary)
            .ok_or(EngineError::BinaryNotFound)?;
        info!("mpv: spawning {}", mpv_binary.display());

        let child = tokio::process::Command::new(&mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--no-terminal")
            .arg(platform::mpv_socket_arg(&socket_path))
            .arg(format!("--volume={}", volume.min(100)))
            .args(&config.extra_args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            return Err(EngineError::Spawn("mpv IPC socket did not appear".into()));
        }

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");

        let (engine, events) = Self::attach(stream, Some(child), socket_path, volume);
        engine.handle.observe_properties().await;
        Ok((engine, events))
    }

    fn attach(
        stream: UnixStream,
        child: Option<tokio::process::Child>,
        socket_path: PathBuf,
        volume: u8,
    ) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (raw_tx, raw_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(16);
        let handle = start_io_tasks(stream, raw_tx);

        let observed = Arc::new(StdMutex::new(Observed {
            volume: f64::from(volume),
            ..Default::default()
        }));
        let loads = Arc::new(StdMutex::new(LoadTracker::default()));
        tokio::spawn(event_task(raw_rx, observed.clone(), loads.clone(), event_tx));

        let engine = Self {
            handle,
            process: Mutex::new(child),
            socket_path,
            observed,
            loads,
            next_load: AtomicU64::new(1),
            want_paused: AtomicBool::new(false),
        };
        (engine, event_rx)
    }

    fn snapshot(&self) -> Observed {
        self.observed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn loads(&self) -> MutexGuard<'_, LoadTracker> {
        self.loads.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn set_pause(&self, paused: bool) -> Result<(), EngineError> {
        self.handle.set_property("pause", json!(paused)).await?;
        self.want_paused.store(paused, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for MpvEngine {
    async fn load(&self, source: &Path) -> Result<LoadId, EngineError> {
        let was_paused = self.want_paused.load(Ordering::Relaxed);
        self.set_pause(true).await?;

        // registered up front: mpv may report end-file before the reply
        let id = LoadId(self.next_load.fetch_add(1, Ordering::Relaxed));
        let replaced = self.loads().begin(id);

        let path = source.to_string_lossy();
        let resp = match self
            .handle
            .send(json!(["loadfile", path, "replace"]))
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!("mpv: loadfile {} failed: {}", path, e);
                self.loads().abort(id, replaced);
                if !was_paused {
                    if let Err(e) = self.set_pause(false).await {
                        warn!("mpv: failed to resume previous track: {}", e);
                    }
                }
                return Err(e);
            }
        };

        let entry = resp
            .get("data")
            .and_then(|d| d.get("playlist_entry_id"))
            .and_then(Value::as_i64);
        self.loads().confirm(id, entry);
        debug!("mpv: loaded {} as {:?} (entry {:?})", path, id, entry);
        Ok(id)
    }

    async fn play(&self) -> Result<(), EngineError> {
        self.set_pause(false).await
    }

    async fn pause(&self) -> Result<(), EngineError> {
        self.set_pause(true).await
    }

    async fn stop(&self) -> Result<(), EngineError> {
        self.loads().current = None;
        self.handle.send(json!(["stop"])).await?;
        Ok(())
    }

    async fn seek(&self, seconds: f64) -> Result<(), EngineError> {
        let duration = self.snapshot().duration;
        let target = if duration > 0.0 {
            seconds.clamp(0.0, duration)
        } else {
            seconds.max(0.0)
        };
        self.handle.set_property("time-pos", json!(target)).await
    }

    async fn set_volume(&self, level: u8) -> Result<(), EngineError> {
        self.handle
            .set_property("volume", json!(level.min(100)))
            .await
    }

    fn volume(&self) -> u8 {
        self.snapshot().volume.round().clamp(0.0, 100.0) as u8
    }

    fn position(&self) -> f64 {
        self.snapshot().time_pos
    }

    fn duration(&self) -> f64 {
        self.snapshot().duration
    }

    fn is_playing(&self) -> bool {
        let obs = self.snapshot();
        !obs.idle && !obs.paused
    }

    fn has_media(&self) -> bool {
        !self.snapshot().idle
    }

    async fn shutdown(&self) {
        let _ = self.handle.send(json!(["quit"])).await;
        if let Some(mut p) = self.process.lock().await.take() {
            let _ = p.kill().await;
        }
        let _ = tokio::fs::remove_file(&self.socket_path).await;
        info!("mpv: shut down");
    }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: Pending, raw_tx: mpsc::Sender<Value>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(Value::as_u64) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error");
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(EngineError::Ipc(err.to_string()))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else if raw_tx.send(val).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, &format!("read error: {}", e)).await;
                break;
            }
        }
    }
}

async fn fail_pending(pending: &Pending, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(EngineError::Ipc(reason.to_string())));
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<MpvRequest>, pending: Pending)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // register before writing so the reader can match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(EngineError::Ipc(format!("write error: {}", e))));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}
