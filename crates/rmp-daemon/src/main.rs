mod cache;
mod catalog;
mod engine;
mod error;
mod http;
mod mpv;
mod player;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rmp_proto::config::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::{CacheSettings, PrefetchCache};
use crate::catalog::{Catalog, RaphsonClient};
use crate::engine::MediaEngine;
use crate::mpv::MpvEngine;
use crate::player::{Player, PlayerSettings};

#[derive(Parser, Debug)]
#[command(name = "rmp-daemon")]
#[command(about = "Headless Raphson playback daemon")]
#[command(version)]
struct Args {
    /// Path to config.toml (defaults to the platform config dir)
    #[arg(long, env = "RMP_CONFIG")]
    config: Option<PathBuf>,
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup file logging + stderr
    let data_dir = rmp_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,rmp_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = match args.config {
        Some(path) => {
            info!("Config loaded from: {:?}", path);
            Config::load_from(&path)?
        }
        None => {
            info!("Config loaded from: {:?}", Config::config_path());
            Config::load()?
        }
    };

    // Catalog session: login, CSRF, playlist list
    let catalog = Arc::new(RaphsonClient::new(&config.catalog)?);
    catalog
        .login(&config.catalog.username, &config.catalog.password)
        .await
        .with_context(|| format!("logging in to {}", config.catalog.server))?;

    let cancel = CancellationToken::new();

    let cache = Arc::new(PrefetchCache::new(
        catalog.clone(),
        CacheSettings::from(&config.cache),
    ));
    let known = catalog.known_playlists();
    let defaults: Vec<String> = config
        .cache
        .default_playlists
        .iter()
        .filter(|name| {
            let ok = known.contains(*name);
            if !ok {
                warn!("default playlist {:?} is not known to the catalog, skipping", name);
            }
            ok
        })
        .cloned()
        .collect();
    cache.set_enabled_playlists(defaults);
    let refill_handle = cache.spawn_refill_loop(cancel.clone());

    let scratch_dir = config.player.scratch_dir();
    std::fs::create_dir_all(&scratch_dir)
        .with_context(|| format!("creating {}", scratch_dir.display()))?;

    let (engine, engine_events) = MpvEngine::start(&config.mpv, config.player.default_volume)
        .await
        .context("starting mpv")?;
    let engine: Arc<dyn MediaEngine> = Arc::new(engine);

    let player = Arc::new(Player::new(
        engine,
        cache.clone(),
        catalog.clone(),
        PlayerSettings::from(&config.player),
        cancel.clone(),
    ));
    player.set_volume(config.player.default_volume).await?;
    let pump_handle = player.spawn_event_pump(engine_events);
    let now_playing_handle = player.spawn_now_playing_loop();

    let http_handle = if config.http.enabled {
        Some(http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                player: player.clone(),
                cache: cache.clone(),
                catalog: catalog.clone(),
            },
            cancel.clone(),
        ))
    } else {
        info!("HTTP API disabled");
        None
    };

    info!("Daemon initialised");
    shutdown_signal().await;

    info!("Shutting down");
    cancel.cancel();
    player.shutdown().await;
    for handle in [Some(refill_handle), Some(pump_handle), Some(now_playing_handle), http_handle]
        .into_iter()
        .flatten()
    {
        let _ = handle.await;
    }
    info!("Bye");
    Ok(())
}
