use serde::{Deserialize, Serialize};

/// A track as returned by the catalog's `choose_track` endpoint.
///
/// `path` is the opaque catalog identifier; everything else is display
/// metadata and may be missing for badly tagged files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TrackRef {
    pub path: String,
    /// Length in whole seconds.
    #[serde(default)]
    pub duration: u32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub album_artist: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub artists: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl TrackRef {
    /// "Artist A, Artist B - Title", falling back to the catalog path when
    /// the track has no title tag.
    pub fn display_title(&self) -> String {
        let title = match self.title.as_deref() {
            Some(t) if !t.trim().is_empty() => t,
            _ => return self.path.clone(),
        };
        match self.artists.as_deref() {
            Some(artists) if !artists.is_empty() => format!("{} - {}", artists.join(", "), title),
            _ => title.to_string(),
        }
    }
}

/// Playback state machine status, owned by the daemon's player.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    #[default]
    Idle, // nothing loaded yet
    Playing,
    Paused,
    Stopped, // explicitly stopped, resource released
}

/// Aggregate snapshot served by `GET /state`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StateView {
    pub playlists: PlaylistsView,
    pub player: PlayerView,
    pub currently_playing: Option<TrackRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlaylistsView {
    /// Every playlist the catalog knows about.
    pub all: Vec<String>,
    /// Playlists currently being prefetched, in rotation order.
    pub enabled: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub status: PlaybackStatus,
    pub has_media: bool,
    pub is_playing: bool,
    /// Seconds into the current track.
    pub position: u32,
    pub position_percent: u8,
    /// Track length in seconds, 0 when unknown.
    pub duration: u32,
    pub volume: u8,
}
