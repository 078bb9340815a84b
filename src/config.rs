//! Configuration model, defaults and validation.

use std::collections::BTreeMap;

use crate::integration_uri::parse_playlist_id;
use crate::play_window::parse_utc_offset;

const PLACEHOLDER_MARKER: &str = "YOUR_";
const MAX_REMOTE_BATCH_SIZE: usize = 100;
const MAX_APPEND_BATCH_SIZE: usize = 50;

/// Failure while loading or validating configuration. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("config file {path} was not updated: {reason}")]
    Edit { path: String, reason: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("could not determine a default location for {0}; pass it explicitly")]
    NoDefaultLocation(&'static str),
}

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Destination catalog credentials and managed playlists.
    pub spotify: SpotifyConfig,
    /// Source feed endpoint and window settings.
    pub tunegenie: TuneGenieConfig,
    /// Local cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// HTTP transport settings shared by all remote calls.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Destination catalog credentials and playlist targets.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Empty means the token is read from the OS keyring.
    #[serde(default)]
    pub refresh_token: String,
    pub daily_playlist_id: String,
    #[serde(default = "default_daily_playlist_name")]
    pub daily_playlist_name: String,
    /// Empty disables the cumulative playlist.
    #[serde(default)]
    pub cumulative_playlist_id: String,
    #[serde(default = "default_cumulative_playlist_name")]
    pub cumulative_playlist_name: String,
    #[serde(default = "default_max_cumulative_tracks")]
    pub max_cumulative_tracks: usize,
    #[serde(default = "default_replace_batch_size")]
    pub replace_batch_size: usize,
    #[serde(default = "default_append_batch_size")]
    pub append_batch_size: usize,
    #[serde(default = "default_search_requests_per_second")]
    pub search_requests_per_second: u32,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_accounts_base_url")]
    pub accounts_base_url: String,
}

/// Source feed settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TuneGenieConfig {
    pub api_url: String,
    pub api_id: String,
    pub brand: String,
    /// UTC offset the play window is computed in, e.g. `-04:00`.
    #[serde(default = "default_timezone_offset")]
    pub timezone_offset: String,
    /// Additional query parameters sent with every feed request.
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
}

/// Local cache settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CacheConfig {
    /// Empty means `<data_dir>/radiosync/cache.db`.
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_unresolved_retention_days")]
    pub unresolved_retention_days: u32,
}

/// HTTP transport settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Attempts per request for rate-limited, 5xx and timed-out calls.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl SpotifyConfig {
    /// Cumulative playlist id, when one is configured.
    pub fn cumulative_playlist(&self) -> Option<&str> {
        let trimmed = self.cumulative_playlist_id.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: "YOUR_CLIENT_ID".to_string(),
            client_secret: "YOUR_CLIENT_SECRET".to_string(),
            refresh_token: String::new(),
            daily_playlist_id: "YOUR_DAILY_PLAYLIST_ID".to_string(),
            daily_playlist_name: default_daily_playlist_name(),
            cumulative_playlist_id: String::new(),
            cumulative_playlist_name: default_cumulative_playlist_name(),
            max_cumulative_tracks: default_max_cumulative_tracks(),
            replace_batch_size: default_replace_batch_size(),
            append_batch_size: default_append_batch_size(),
            search_requests_per_second: default_search_requests_per_second(),
            api_base_url: default_api_base_url(),
            accounts_base_url: default_accounts_base_url(),
        }
    }
}

impl Default for TuneGenieConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.tunegenie.com/v2/brand/nowplaying/".to_string(),
            api_id: "YOUR_API_ID".to_string(),
            brand: "YOUR_BRAND".to_string(),
            timezone_offset: default_timezone_offset(),
            extra_params: BTreeMap::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            unresolved_retention_days: default_unresolved_retention_days(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_daily_playlist_name() -> String {
    "Daily".to_string()
}

fn default_cumulative_playlist_name() -> String {
    "Cumulative".to_string()
}

fn default_max_cumulative_tracks() -> usize {
    1000
}

fn default_replace_batch_size() -> usize {
    100
}

fn default_append_batch_size() -> usize {
    50
}

fn default_search_requests_per_second() -> u32 {
    10
}

fn default_api_base_url() -> String {
    "https://api.spotify.com/v1".to_string()
}

fn default_accounts_base_url() -> String {
    "https://accounts.spotify.com".to_string()
}

fn default_timezone_offset() -> String {
    "-04:00".to_string()
}

fn default_unresolved_retention_days() -> u32 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

/// Clamps numeric settings into supported ranges and normalizes playlist locators.
pub fn sanitize_config(config: Config) -> Config {
    let mut config = config;
    let spotify = &mut config.spotify;
    spotify.replace_batch_size = spotify.replace_batch_size.clamp(1, MAX_REMOTE_BATCH_SIZE);
    spotify.append_batch_size = spotify.append_batch_size.clamp(1, MAX_APPEND_BATCH_SIZE);
    spotify.search_requests_per_second = spotify.search_requests_per_second.clamp(1, 100);
    spotify.max_cumulative_tracks = spotify.max_cumulative_tracks.max(1);
    spotify.api_base_url = spotify.api_base_url.trim().trim_end_matches('/').to_string();
    spotify.accounts_base_url = spotify
        .accounts_base_url
        .trim()
        .trim_end_matches('/')
        .to_string();
    if let Some(id) = parse_playlist_id(&spotify.daily_playlist_id) {
        spotify.daily_playlist_id = id;
    }
    if let Some(id) = parse_playlist_id(&spotify.cumulative_playlist_id) {
        spotify.cumulative_playlist_id = id;
    }
    config.tunegenie.timezone_offset = config.tunegenie.timezone_offset.trim().to_string();
    config.http.connect_timeout_secs = config.http.connect_timeout_secs.max(1);
    config.http.read_timeout_secs = config.http.read_timeout_secs.max(1);
    config.http.max_attempts = config.http.max_attempts.clamp(1, 10);
    config
}

fn require_value(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("`{field}` is required")));
    }
    if trimmed.contains(PLACEHOLDER_MARKER) {
        return Err(ConfigError::Invalid(format!(
            "`{field}` still holds the template placeholder `{trimmed}`"
        )));
    }
    Ok(())
}

/// Rejects missing values, template placeholders and malformed locators.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let spotify = &config.spotify;
    require_value("spotify.client_id", &spotify.client_id)?;
    require_value("spotify.client_secret", &spotify.client_secret)?;
    if spotify.refresh_token.contains(PLACEHOLDER_MARKER) {
        return Err(ConfigError::Invalid(
            "`spotify.refresh_token` still holds the template placeholder; leave it empty to use the keyring"
                .to_string(),
        ));
    }
    require_value("spotify.daily_playlist_id", &spotify.daily_playlist_id)?;
    if parse_playlist_id(&spotify.daily_playlist_id).is_none() {
        return Err(ConfigError::Invalid(format!(
            "`spotify.daily_playlist_id` is not a playlist id or link: {}",
            spotify.daily_playlist_id
        )));
    }
    if let Some(cumulative) = spotify.cumulative_playlist() {
        if parse_playlist_id(cumulative).is_none() {
            return Err(ConfigError::Invalid(format!(
                "`spotify.cumulative_playlist_id` is not a playlist id or link: {cumulative}"
            )));
        }
        if parse_playlist_id(cumulative) == parse_playlist_id(&spotify.daily_playlist_id) {
            return Err(ConfigError::Invalid(
                "daily and cumulative playlists must be different playlists".to_string(),
            ));
        }
    }

    let tunegenie = &config.tunegenie;
    require_value("tunegenie.api_url", &tunegenie.api_url)?;
    require_value("tunegenie.api_id", &tunegenie.api_id)?;
    require_value("tunegenie.brand", &tunegenie.brand)?;
    if parse_utc_offset(&tunegenie.timezone_offset).is_none() {
        return Err(ConfigError::Invalid(format!(
            "`tunegenie.timezone_offset` must look like -04:00 or +01:00, got `{}`",
            tunegenie.timezone_offset
        )));
    }
    Ok(())
}
