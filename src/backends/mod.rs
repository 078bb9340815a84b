//! Remote service abstractions and concrete implementations.
//!
//! `CatalogBackend` is the destination catalog (token refresh, search and
//! playlist reads/writes); `SourceFeed` is the service reporting recent plays.

pub mod spotify;
pub mod tunegenie;

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, warn};

use crate::config::HttpConfig;
use crate::play_window::PlayWindow;
use crate::protocol::{CatalogTrack, RemotePlaylistPage, RemotePlaylistTrack, SourceEvent};

/// Largest batch the catalog accepts for a single playlist write.
pub const MAX_PLAYLIST_WRITE_BATCH: usize = 100;

const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Failure of a remote call. Never cached.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{service} request failed with HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("{service} request failed: {message}")]
    Transport {
        service: &'static str,
        message: String,
        timed_out: bool,
    },
    #[error("{service} returned an unexpected response: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },
}

impl BackendError {
    /// True when the service refused the request because of rate limiting.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Status { status: 429, .. })
    }

    /// True for failures worth retrying: rate limits, 5xx and timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500 | 502 | 503 | 504),
            Self::Transport { timed_out, .. } => *timed_out,
            Self::InvalidResponse { .. } => false,
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        if let Self::Status {
            retry_after: Some(retry_after),
            ..
        } = self
        {
            return (*retry_after).min(MAX_RETRY_DELAY);
        }
        let factor = 1u32 << attempt.saturating_sub(1).min(6);
        BASE_RETRY_DELAY.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }

    pub(crate) fn from_ureq(service: &'static str, error: ureq::Error) -> Self {
        match error {
            ureq::Error::Status(status, response) => {
                let retry_after = response
                    .header("Retry-After")
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                let body = response.into_string().unwrap_or_default();
                Self::Status {
                    service,
                    status,
                    body,
                    retry_after,
                }
            }
            ureq::Error::Transport(transport) => {
                let message = transport.to_string();
                let lowered = message.to_ascii_lowercase();
                Self::Transport {
                    service,
                    timed_out: lowered.contains("timed out") || lowered.contains("timeout"),
                    message,
                }
            }
        }
    }

    pub(crate) fn invalid(service: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            service,
            message: message.into(),
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, or `max_attempts`
/// is used up. `retry_if` decides which failures are retried.
pub(crate) fn execute_with_backoff<T, F, R>(
    label: &str,
    max_attempts: u32,
    retry_if: R,
    mut operation: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Result<T, BackendError>,
    R: Fn(&BackendError) -> bool,
{
    let mut attempt = 1u32;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) if retry_if(&error) && attempt < max_attempts => {
                let backoff = error.retry_delay(attempt);
                warn!(
                    "{} attempt {} failed ({}), retrying in {:?}",
                    label, attempt, error, backoff
                );
                std::thread::sleep(backoff);
                attempt = attempt.saturating_add(1);
            }
            Err(error) => return Err(error),
        }
    }
}

/// Builds the blocking HTTP agent shared by one adapter.
pub(crate) fn build_http_agent(http: &HttpConfig) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(http.connect_timeout_secs))
        .timeout_read(Duration::from_secs(http.read_timeout_secs))
        .timeout_write(Duration::from_secs(http.read_timeout_secs))
        .user_agent(concat!("radiosync/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Credentials exchanged for a short-lived access token.
#[derive(Debug, Clone)]
pub struct CatalogCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

/// Result of a token refresh.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub access_token: String,
    /// Set when the identity provider rotated the refresh token.
    pub rotated_refresh_token: Option<String>,
}

/// Bearer credential attached to catalog requests for one run.
#[derive(Debug, Clone)]
pub struct CatalogSession {
    pub access_token: String,
}

/// Interface implemented by destination catalog adapters.
pub trait CatalogBackend {
    fn refresh_access_token(
        &self,
        credentials: &CatalogCredentials,
    ) -> Result<AccessGrant, BackendError>;

    /// Best single match for a search query, if any.
    fn search_track(
        &self,
        session: &CatalogSession,
        query: &str,
    ) -> Result<Option<CatalogTrack>, BackendError>;

    /// One page of a playlist listing; `page` counts from 0.
    fn fetch_playlist_page(
        &self,
        session: &CatalogSession,
        playlist_id: &str,
        page: usize,
    ) -> Result<RemotePlaylistPage, BackendError>;

    /// Appends up to [`MAX_PLAYLIST_WRITE_BATCH`] uris to a playlist.
    fn add_tracks(
        &self,
        session: &CatalogSession,
        playlist_id: &str,
        uris: &[String],
    ) -> Result<(), BackendError>;

    /// Removes every occurrence of up to [`MAX_PLAYLIST_WRITE_BATCH`] uris.
    fn remove_tracks(
        &self,
        session: &CatalogSession,
        playlist_id: &str,
        uris: &[String],
    ) -> Result<(), BackendError>;

    /// Reads a whole playlist, following pages until none is left.
    fn fetch_playlist_tracks(
        &self,
        session: &CatalogSession,
        playlist_id: &str,
    ) -> Result<Vec<RemotePlaylistTrack>, BackendError> {
        let mut tracks = Vec::new();
        let mut page = 0usize;
        loop {
            let next_page = self.fetch_playlist_page(session, playlist_id, page)?;
            tracks.extend(next_page.tracks);
            if !next_page.has_next {
                break;
            }
            page = page.saturating_add(1);
        }
        debug!(
            "Read {} tracks from playlist {} over {} page(s)",
            tracks.len(),
            playlist_id,
            page + 1
        );
        Ok(tracks)
    }

    /// Replaces a playlist's contents: delete everything, then add `uris` in order.
    fn replace_playlist_tracks(
        &self,
        session: &CatalogSession,
        playlist_id: &str,
        uris: &[String],
        batch_size: usize,
    ) -> Result<(), BackendError> {
        let batch_size = batch_size.clamp(1, MAX_PLAYLIST_WRITE_BATCH);
        let existing = self.fetch_playlist_tracks(session, playlist_id)?;
        let mut seen = HashSet::new();
        let existing_uris: Vec<String> = existing
            .into_iter()
            .map(|remote| remote.track.uri)
            .filter(|uri| seen.insert(uri.clone()))
            .collect();
        for batch in existing_uris.chunks(batch_size) {
            self.remove_tracks(session, playlist_id, batch)?;
        }
        for batch in uris.chunks(batch_size) {
            self.add_tracks(session, playlist_id, batch)?;
        }
        Ok(())
    }
}

/// Interface implemented by recently-played feeds.
pub trait SourceFeed {
    /// Plays inside `window`, in source order. No data is an empty list.
    fn fetch_events(&self, window: &PlayWindow) -> Result<Vec<SourceEvent>, BackendError>;
}
