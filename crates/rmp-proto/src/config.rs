use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
}

/// Connection details for the remote music server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Upper bound for a single catalog request, including audio downloads.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// What to do with a downloaded track whose cover or lyrics fetch failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptionalFetchPolicy {
    /// Cache the track anyway, with the failed field absent.
    #[default]
    KeepTrack,
    /// Treat the whole download as failed and back off.
    DropTrack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total number of tracks buffered, split evenly over enabled playlists.
    #[serde(default = "default_cache_size")]
    pub size: usize,
    /// Playlists enabled at startup.
    #[serde(default)]
    pub default_playlists: Vec<String>,
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub optional_fetch_failure: OptionalFetchPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Volume applied to mpv at startup, 0..=100.
    #[serde(default = "default_volume")]
    pub default_volume: u8,
    /// Wait between attempts when auto-advance finds every queue empty.
    #[serde(default = "default_next_retry_delay_ms")]
    pub next_retry_delay_ms: u64,
    #[serde(default = "default_now_playing_interval_secs")]
    pub now_playing_interval_secs: u64,
    /// Where transient audio files are written. Defaults to the system temp dir.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MpvConfig {
    /// Explicit mpv binary; otherwise looked up beside the exe and on PATH.
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            username: String::new(),
            password: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: default_cache_size(),
            default_playlists: Vec::new(),
            refill_interval_ms: default_refill_interval_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            optional_fetch_failure: OptionalFetchPolicy::default(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            next_retry_delay_ms: default_next_retry_delay_ms(),
            now_playing_interval_secs: default_now_playing_interval_secs(),
            scratch_dir: None,
        }
    }
}

fn default_server() -> String {
    "http://localhost:8080".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8181
}

fn default_cache_size() -> usize {
    4
}

fn default_refill_interval_ms() -> u64 {
    1000
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_volume() -> u8 {
    50
}

fn default_next_retry_delay_ms() -> u64 {
    5000
}

fn default_now_playing_interval_secs() -> u64 {
    10
}

impl CatalogConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CacheConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl PlayerConfig {
    pub fn next_retry_delay(&self) -> Duration {
        Duration::from_millis(self.next_retry_delay_ms)
    }

    pub fn now_playing_interval(&self) -> Duration {
        Duration::from_secs(self.now_playing_interval_secs)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(platform::scratch_dir)
    }
}

impl Config {
    /// Load from the default location, writing a default file on first run.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.size == 0 {
            anyhow::bail!("cache.size must be at least 1");
        }
        if self.player.default_volume > 100 {
            anyhow::bail!(
                "player.default_volume must be 0..=100, got {}",
                self.player.default_volume
            );
        }
        if self.player.now_playing_interval_secs == 0 {
            anyhow::bail!("player.now_playing_interval_secs must be non-zero");
        }
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8181);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.cache.size, 4);
        assert_eq!(config.cache.refill_interval(), Duration::from_secs(1));
        assert_eq!(config.player.now_playing_interval(), Duration::from_secs(10));
        assert_eq!(
            config.cache.optional_fetch_failure,
            OptionalFetchPolicy::KeepTrack
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
            [catalog]
            server = "https://music.example.org"
            username = "me"
            password = "secret"

            [cache]
            size = 6
            default_playlists = ["DK", "JK"]
            optional_fetch_failure = "drop_track"
            "#,
        )
        .unwrap();
        assert_eq!(config.catalog.server, "https://music.example.org");
        assert_eq!(config.catalog.timeout_secs, 60);
        assert_eq!(config.cache.size, 6);
        assert_eq!(config.cache.default_playlists, vec!["DK", "JK"]);
        assert_eq!(
            config.cache.optional_fetch_failure,
            OptionalFetchPolicy::DropTrack
        );
        assert_eq!(config.player.default_volume, 50);
        assert!(config.mpv.binary.is_none());
    }

    #[test]
    fn test_zero_cache_size_rejected() {
        let err = Config::from_toml_str("[cache]\nsize = 0\n").unwrap_err();
        assert!(err.to_string().contains("cache.size"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("rmp-config-test-{}", std::process::id()));
        let path = dir.join("config.toml");
        let mut config = Config::default();
        config.cache.default_playlists = vec!["DK".into()];
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.cache.default_playlists, vec!["DK"]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
