mod backends;
mod config;
mod config_persistence;
mod db_manager;
mod integration_keyring;
mod integration_uri;
mod play_window;
mod playlist_manager;
mod protocol;
mod track_resolver;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info, warn, LevelFilter};

use crate::backends::spotify::SpotifyAdapter;
use crate::backends::tunegenie::TuneGenieAdapter;
use crate::backends::CatalogCredentials;
use crate::config::{validate_config, Config, ConfigError};
use crate::db_manager::DbManager;
use crate::playlist_manager::PlaylistManager;

/// Keeps daily and cumulative Spotify playlists in sync with a station's plays.
#[derive(Parser, Debug)]
#[command(name = "radiosync")]
#[command(version)]
struct Cli {
    /// Config file; defaults to <config_dir>/radiosync/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log detail (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log level when no -v is given (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "RADIOSYNC_LOG")]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run one sync for the previous day (default)
    Sync,
    /// Print cache counters
    Stats,
    /// Delete cached "not found" results not seen recently
    EvictStale {
        /// Age in days; defaults to cache.unresolved_retention_days
        #[arg(long)]
        days: Option<u32>,
    },
    /// Write a config template if none exists
    InitConfig,
    /// Save a Spotify refresh token in the OS keyring
    StoreToken { token: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenSource {
    ConfigFile,
    Keyring,
}

fn log_level(cli: &Cli) -> LevelFilter {
    match cli.verbose {
        0 => cli.log_level.unwrap_or(LevelFilter::Info),
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn load_checked_config(path: &Path) -> Result<Config, ConfigError> {
    let config = config_persistence::load_config(path)?;
    validate_config(&config)?;
    Ok(config)
}

fn open_cache(config: &Config) -> Result<DbManager, Box<dyn Error>> {
    let cache_path = config_persistence::resolve_cache_path(config)?;
    info!("Using cache {}", cache_path.display());
    Ok(DbManager::new(&cache_path)?)
}

fn load_credentials(config: &Config) -> Result<(CatalogCredentials, TokenSource), Box<dyn Error>> {
    let spotify = &config.spotify;
    let configured = spotify.refresh_token.trim();
    let (refresh_token, source) = if configured.is_empty() {
        let stored = integration_keyring::get_refresh_token(&spotify.client_id)?;
        let Some(stored) = stored else {
            return Err("no refresh token configured; set spotify.refresh_token or run `radiosync store-token`".into());
        };
        (stored, TokenSource::Keyring)
    } else {
        (configured.to_string(), TokenSource::ConfigFile)
    };
    Ok((
        CatalogCredentials {
            client_id: spotify.client_id.clone(),
            client_secret: spotify.client_secret.clone(),
            refresh_token,
        },
        source,
    ))
}

fn persist_rotated_token(
    config: &Config,
    config_path: &Path,
    source: TokenSource,
    refresh_token: &str,
) {
    let result = match source {
        TokenSource::Keyring => {
            integration_keyring::set_refresh_token(&config.spotify.client_id, refresh_token)
        }
        TokenSource::ConfigFile => {
            config_persistence::update_refresh_token(config_path, refresh_token)
                .map_err(|err| err.to_string())
        }
    };
    if let Err(err) = result {
        warn!("Failed to save rotated refresh token: {}", err);
    }
}

fn run_sync(config_path: &Path) -> Result<(), Box<dyn Error>> {
    let config = load_checked_config(config_path)?;
    let (credentials, token_source) = load_credentials(&config)?;
    let db_manager = open_cache(&config)?;
    let catalog = SpotifyAdapter::new(&config.spotify, &config.http);
    let feed = TuneGenieAdapter::new(&config.tunegenie, &config.http);

    let mut playlist_manager =
        PlaylistManager::new(&config, &db_manager, &catalog, &feed, credentials);
    let result = playlist_manager.run();
    if let Some(rotated) = playlist_manager.rotated_refresh_token() {
        persist_rotated_token(&config, config_path, token_source, rotated);
    }
    result?;

    let evicted = db_manager.evict_stale(config.cache.unresolved_retention_days)?;
    if evicted > 0 {
        info!("Evicted {} stale unresolved cache entries", evicted);
    }
    Ok(())
}

fn run_stats(config_path: &Path) -> Result<(), Box<dyn Error>> {
    let config = config_persistence::load_config(config_path)?;
    let db_manager = open_cache(&config)?;
    let stats = db_manager.stats()?;
    info!("Resolved mappings:   {}", stats.resolved_count);
    info!("Unresolved mappings: {}", stats.unresolved_count);
    info!("Managed playlists:   {}", stats.playlist_count);
    info!("Playlist entries:    {}", stats.total_membership_count);
    Ok(())
}

fn run_evict_stale(config_path: &Path, days: Option<u32>) -> Result<(), Box<dyn Error>> {
    let config = config_persistence::load_config(config_path)?;
    let days = days.unwrap_or(config.cache.unresolved_retention_days);
    let db_manager = open_cache(&config)?;
    let evicted = db_manager.evict_stale(days)?;
    info!("Evicted {} unresolved entries older than {} days", evicted, days);
    Ok(())
}

fn run_store_token(config_path: &Path, token: &str) -> Result<(), Box<dyn Error>> {
    let config = config_persistence::load_config(config_path)?;
    let token = token.trim();
    if token.is_empty() {
        return Err("refresh token must not be empty".into());
    }
    if config.spotify.client_id.trim().is_empty() || config.spotify.client_id.contains("YOUR_") {
        return Err("set spotify.client_id before storing a token".into());
    }
    integration_keyring::set_refresh_token(&config.spotify.client_id, token)?;
    info!("Stored refresh token for client {}", config.spotify.client_id);
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config_path = match cli.config {
        Some(path) => path,
        None => config_persistence::default_config_path()?,
    };
    match cli.command.unwrap_or(Command::Sync) {
        Command::Sync => run_sync(&config_path),
        Command::Stats => run_stats(&config_path),
        Command::EvictStale { days } => run_evict_stale(&config_path, days),
        Command::InitConfig => {
            if !config_persistence::write_default_config(&config_path)? {
                warn!("Not overwriting existing config {}", config_path.display());
            }
            Ok(())
        }
        Command::StoreToken { token } => run_store_token(&config_path, &token),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut clog = colog::default_builder();
    clog.filter(None, log_level(&cli));
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
