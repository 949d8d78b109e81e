//! Remote catalog client (Raphson music server).
//!
//! The daemon only talks to the catalog through the [`Catalog`] trait so the
//! cache and player can be exercised against an in-memory fake.

use std::sync::RwLock;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, Response, Url};
use rmp_proto::config::CatalogConfig;
use rmp_proto::protocol::TrackRef;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::CatalogError;

const USER_AGENT: &str = "rmp-playback-server";

/// Cover art plus the content type the server labelled it with.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverImage {
    pub data: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Playlist names the server reported at login.
    fn known_playlists(&self) -> Vec<String>;

    async fn choose_track(&self, playlist: &str) -> Result<TrackRef, CatalogError>;

    async fn fetch_audio(&self, track: &TrackRef) -> Result<Vec<u8>, CatalogError>;

    async fn fetch_cover(&self, track: &TrackRef) -> Result<CoverImage, CatalogError>;

    async fn fetch_lyrics(&self, track: &TrackRef) -> Result<Option<String>, CatalogError>;

    /// `progress` is a percentage, 0..=100.
    async fn report_now_playing(
        &self,
        path: &str,
        progress: u8,
        paused: bool,
    ) -> Result<(), CatalogError>;

    /// `started_at` is unix epoch seconds.
    async fn report_played(&self, path: &str, started_at: i64) -> Result<(), CatalogError>;
}

// ── wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct PlaylistEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum LyricsResponse {
    #[serde(rename = "none")]
    Missing,
    Plain { text: String },
    Synced { text: Vec<SyncedLine> },
}

#[derive(Debug, Deserialize)]
struct SyncedLine {
    #[allow(dead_code)]
    start_time: f64,
    text: String,
}

/// Flatten a lyrics response to plain text; synced lines lose their timing.
fn lyrics_text(value: Value) -> Result<Option<String>, serde_json::Error> {
    let text = match serde_json::from_value::<LyricsResponse>(value)? {
        LyricsResponse::Missing => None,
        LyricsResponse::Plain { text } => Some(text),
        LyricsResponse::Synced { text } => Some(
            text.into_iter()
                .map(|line| line.text)
                .collect::<Vec<_>>()
                .join("\n"),
        ),
    };
    Ok(text.filter(|t| !t.trim().is_empty()))
}

// ── client ────────────────────────────────────────────────────────────────────

pub struct RaphsonClient {
    base: Url,
    http: Client,
    player_id: String,
    session: RwLock<Session>,
    playlists: RwLock<Vec<String>>,
}

#[derive(Default)]
struct Session {
    token: Option<String>,
    csrf: Option<String>,
}

impl RaphsonClient {
    pub fn new(config: &CatalogConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.server)
            .map_err(|e| anyhow::anyhow!("invalid catalog.server {:?}: {}", config.server, e))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("catalog.server {:?} is not an http(s) URL", config.server);
        }

        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .build()?;

        let player_id = format!("{:032x}", rand::thread_rng().gen::<u128>());

        Ok(Self {
            base,
            http,
            player_id,
            session: RwLock::new(Session::default()),
            playlists: RwLock::new(Vec::new()),
        })
    }

    /// Log in, fetch the CSRF token and the playlist list.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), CatalogError> {
        info!("catalog: logging in as {}", username);
        let url = self.endpoint(&["auth", "login"])?;
        let resp: TokenResponse = self
            .post(url, json!({ "username": username, "password": password }))
            .await?
            .json()
            .await?;
        self.session_mut().token = Some(resp.token);

        debug!("catalog: getting CSRF token");
        let url = self.endpoint(&["auth", "get_csrf"])?;
        let resp: TokenResponse = self.get(url).await?.json().await?;
        self.session_mut().csrf = Some(resp.token);

        self.update_playlists().await
    }

    pub async fn update_playlists(&self) -> Result<(), CatalogError> {
        let url = self.endpoint(&["playlist", "list"])?;
        let entries: Vec<PlaylistEntry> = self.get(url).await?.json().await?;
        let names: Vec<String> = entries.into_iter().map(|p| p.name).collect();
        info!("catalog: {} playlists available", names.len());
        *self
            .playlists
            .write()
            .unwrap_or_else(|e| e.into_inner()) = names;
        Ok(())
    }

    fn csrf(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .csrf
            .clone()
    }

    fn session_mut(&self) -> std::sync::RwLockWriteGuard<'_, Session> {
        self.session.write().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, CatalogError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| CatalogError::Decode {
                endpoint: self.base.to_string(),
                reason: "server URL cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `/track/<path...>/<action>`; the catalog path keeps its slashes.
    fn track_endpoint(&self, track: &TrackRef, action: &str) -> Result<Url, CatalogError> {
        let mut segments = vec!["track"];
        segments.extend(track.path.split('/').filter(|s| !s.is_empty()));
        segments.push(action);
        self.endpoint(&segments)
    }

    fn with_cookie(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let session = self.session.read().unwrap_or_else(|e| e.into_inner());
        match session.token.as_deref() {
            Some(token) => req.header(reqwest::header::COOKIE, format!("token={}", token)),
            None => req,
        }
    }

    async fn get(&self, url: Url) -> Result<Response, CatalogError> {
        let endpoint = url.path().to_string();
        let resp = self.with_cookie(self.http.get(url)).send().await?;
        check_status(endpoint, resp)
    }

    async fn post(&self, url: Url, mut body: Value) -> Result<Response, CatalogError> {
        if let (Some(csrf), Some(obj)) = (self.csrf(), body.as_object_mut()) {
            obj.insert("csrf".to_string(), Value::String(csrf));
        }
        let endpoint = url.path().to_string();
        let resp = self
            .with_cookie(self.http.post(url))
            .json(&body)
            .send()
            .await?;
        check_status(endpoint, resp)
    }

    /// POSTs that change server state require a CSRF token.
    async fn post_authenticated(&self, url: Url, body: Value) -> Result<Response, CatalogError> {
        if self.csrf().is_none() {
            return Err(CatalogError::NotLoggedIn);
        }
        self.post(url, body).await
    }
}

fn check_status(endpoint: String, resp: Response) -> Result<Response, CatalogError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(CatalogError::Status { endpoint, status });
    }
    Ok(resp)
}

#[async_trait]
impl Catalog for RaphsonClient {
    fn known_playlists(&self) -> Vec<String> {
        self.playlists
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn choose_track(&self, playlist: &str) -> Result<TrackRef, CatalogError> {
        let url = self.endpoint(&["playlist", playlist, "choose_track"])?;
        let track: TrackRef = self.post_authenticated(url, json!({})).await?.json().await?;
        Ok(track)
    }

    async fn fetch_audio(&self, track: &TrackRef) -> Result<Vec<u8>, CatalogError> {
        let mut url = self.track_endpoint(track, "audio")?;
        url.query_pairs_mut().append_pair("type", "webm_opus_high");
        Ok(self.get(url).await?.bytes().await?.to_vec())
    }

    async fn fetch_cover(&self, track: &TrackRef) -> Result<CoverImage, CatalogError> {
        let mut url = self.track_endpoint(track, "cover")?;
        url.query_pairs_mut().append_pair("quality", "high");
        let resp = self.get(url).await?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = resp.bytes().await?.to_vec();
        Ok(CoverImage { data, content_type })
    }

    async fn fetch_lyrics(&self, track: &TrackRef) -> Result<Option<String>, CatalogError> {
        let url = self.track_endpoint(track, "lyrics")?;
        let endpoint = url.path().to_string();
        let value: Value = self.get(url).await?.json().await?;
        lyrics_text(value).map_err(|e| CatalogError::Decode {
            endpoint,
            reason: e.to_string(),
        })
    }

    async fn report_now_playing(
        &self,
        path: &str,
        progress: u8,
        paused: bool,
    ) -> Result<(), CatalogError> {
        debug!("catalog: submit now playing {} {}%", path, progress);
        let url = self.endpoint(&["activity", "now_playing"])?;
        self.post_authenticated(
            url,
            json!({
                "player_id": self.player_id,
                "track": path,
                "paused": paused,
                "progress": progress,
            }),
        )
        .await?;
        Ok(())
    }

    async fn report_played(&self, path: &str, started_at: i64) -> Result<(), CatalogError> {
        debug!("catalog: submit played {}", path);
        let url = self.endpoint(&["activity", "played"])?;
        self.post_authenticated(url, json!({ "track": path, "timestamp": started_at }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    fn client(server: &str) -> RaphsonClient {
        RaphsonClient::new(&CatalogConfig {
            server: server.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_encodes_playlist_name() {
        let c = client("https://music.example.org/");
        let url = c.endpoint(&["playlist", "Jazz & Blues", "choose_track"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://music.example.org/playlist/Jazz%20&%20Blues/choose_track"
        );
    }

    #[test]
    fn test_track_endpoint_keeps_path_segments() {
        let c = client("https://music.example.org/base");
        let track = TrackRef {
            path: "DK/Artist/01 Song #1.opus".into(),
            ..Default::default()
        };
        let url = c.track_endpoint(&track, "cover").unwrap();
        assert_eq!(
            url.as_str(),
            "https://music.example.org/base/track/DK/Artist/01%20Song%20%231.opus/cover"
        );
    }

    #[test]
    fn test_lyrics_variants() {
        assert_eq!(lyrics_text(json!({ "type": "none" })).unwrap(), None);
        assert_eq!(
            lyrics_text(json!({ "type": "plain", "source": "x", "text": "la la" })).unwrap(),
            Some("la la".to_string())
        );
        let synced = json!({
            "type": "synced",
            "text": [
                { "start_time": 1.5, "text": "first" },
                { "start_time": 3.0, "text": "second" }
            ]
        });
        assert_eq!(
            lyrics_text(synced).unwrap(),
            Some("first\nsecond".to_string())
        );
        assert_eq!(
            lyrics_text(json!({ "type": "plain", "text": "  " })).unwrap(),
            None
        );
        assert!(lyrics_text(json!({ "type": "karaoke" })).is_err());
    }

    #[tokio::test]
    async fn test_report_before_login_is_rejected() {
        let c = client("http://127.0.0.1:9");
        let err = c.report_played("DK/a.mp3", 0).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotLoggedIn));
    }

    async fn spawn_fake_server() -> String {
        async fn choose(
            Path(playlist): Path<String>,
            Json(body): Json<Value>,
        ) -> Result<Json<Value>, axum::http::StatusCode> {
            if body["csrf"] != "csrf-123" {
                return Err(axum::http::StatusCode::FORBIDDEN);
            }
            Ok(Json(json!({
                "path": format!("{}/track.mp3", playlist),
                "duration": 200,
                "title": "Track",
                "album": null,
                "album_artist": null,
                "year": 2001,
                "artists": ["Someone"]
            })))
        }

        let app = Router::new()
            .route(
                "/auth/login",
                post(|| async { Json(json!({ "token": "tok" })) }),
            )
            .route(
                "/auth/get_csrf",
                get(|| async { Json(json!({ "token": "csrf-123" })) }),
            )
            .route(
                "/playlist/list",
                get(|| async { Json(json!([{ "name": "DK" }, { "name": "JK" }])) }),
            )
            .route("/playlist/:name/choose_track", post(choose));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_login_then_choose_track() {
        let server = spawn_fake_server().await;
        let c = client(&server);
        c.login("me", "secret").await.unwrap();
        assert_eq!(c.known_playlists(), vec!["DK", "JK"]);

        let track = c.choose_track("DK").await.unwrap();
        assert_eq!(track.path, "DK/track.mp3");
        assert_eq!(track.year, Some(2001));
        assert_eq!(track.display_title(), "Someone - Track");
    }
}
