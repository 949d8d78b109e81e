use crate::cache::PrefetchCache;
use crate::catalog::Catalog;
use crate::error::{ControlError, EngineError};
use crate::player::Player;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rmp_proto::protocol::{PlaylistsView, StateView};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct HttpState {
    pub player: Arc<Player>,
    pub cache: Arc<PrefetchCache>,
    pub catalog: Arc<dyn Catalog>,
}

enum ApiError {
    Control(ControlError),
    Engine(EngineError),
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError::Control(e)
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Control(e) => {
                warn!("HTTP API: rejected request: {}", e);
                (StatusCode::BAD_REQUEST, e.to_string()).into_response()
            }
            ApiError::Engine(e) => {
                error!("HTTP API: engine error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}

type ApiResult = Result<&'static str, ApiError>;

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/image", get(get_image))
        .route("/lyrics", get(get_lyrics))
        .route("/play", post(play))
        .route("/pause", post(pause))
        .route("/stop", post(stop))
        .route("/next", post(next))
        .route("/seek", post(seek))
        .route("/volume", post(set_volume))
        .route("/playlists", post(set_playlists))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: HttpState,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("HTTP server error: {}", e);
        }
    })
}

// ── reads ─────────────────────────────────────────────────────────────────────

async fn get_state(State(state): State<HttpState>) -> Json<StateView> {
    let currently_playing = state.player.now_playing().await.map(|np| np.track);
    Json(StateView {
        playlists: PlaylistsView {
            all: state.catalog.known_playlists(),
            enabled: state.cache.enabled_playlists(),
        },
        player: state.player.view().await,
        currently_playing,
    })
}

async fn get_image(State(state): State<HttpState>) -> Response {
    match state.player.now_playing().await.and_then(|np| np.cover) {
        Some(cover) => ([(header::CONTENT_TYPE, cover.content_type)], cover.data).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_lyrics(State(state): State<HttpState>) -> Response {
    match state.player.now_playing().await.and_then(|np| np.lyrics) {
        Some(text) => text.into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

// ── controls ──────────────────────────────────────────────────────────────────

async fn play(State(state): State<HttpState>) -> ApiResult {
    info!("HTTP API: Play");
    state.player.play().await?;
    Ok("ok")
}

async fn pause(State(state): State<HttpState>) -> ApiResult {
    info!("HTTP API: Pause");
    state.player.pause().await?;
    Ok("ok")
}

async fn stop(State(state): State<HttpState>) -> ApiResult {
    info!("HTTP API: Stop");
    state.player.stop().await?;
    Ok("ok")
}

async fn next(State(state): State<HttpState>) -> ApiResult {
    info!("HTTP API: Next");
    state.player.next(false).await?;
    Ok("ok")
}

async fn seek(State(state): State<HttpState>, body: String) -> ApiResult {
    let seconds: u32 = body
        .trim()
        .parse()
        .map_err(|_| ControlError::BadRequest(format!("invalid seek position {:?}", body)))?;
    info!("HTTP API: Seek to {}s", seconds);
    state.player.seek(seconds).await?;
    Ok("ok")
}

async fn set_volume(State(state): State<HttpState>, body: String) -> ApiResult {
    let volume = parse_volume(&body)?;
    info!("HTTP API: Set volume to {}%", volume);
    state.player.set_volume(volume).await?;
    Ok("ok")
}

async fn set_playlists(State(state): State<HttpState>, body: String) -> ApiResult {
    let playlists = parse_playlists(&body, &state.catalog.known_playlists())?;
    info!("HTTP API: Changed enabled playlists: {:?}", playlists);
    state.cache.set_enabled_playlists(playlists);
    Ok("ok")
}

fn parse_volume(body: &str) -> Result<u8, ControlError> {
    match body.trim().parse::<u8>() {
        Ok(v) if v <= 100 => Ok(v),
        _ => Err(ControlError::BadRequest(format!("invalid volume {:?}", body))),
    }
}

/// Decode a JSON array of playlist names, all of which must be known.
fn parse_playlists(body: &str, known: &[String]) -> Result<Vec<String>, ControlError> {
    let names: Vec<String> = serde_json::from_str(body)
        .map_err(|e| ControlError::BadRequest(format!("expected a JSON array of names: {}", e)))?;
    if let Some(unknown) = names.iter().find(|n| !known.contains(n)) {
        return Err(ControlError::UnknownPlaylist(unknown.clone()));
    }
    Ok(names)
}
