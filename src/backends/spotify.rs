//! Spotify Web API adapter backed by `ureq`.

use std::num::NonZeroU32;
use std::time::Duration;

use base64::Engine;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;
use serde_json::{json, Value};

use crate::backends::{
    build_http_agent, execute_with_backoff, AccessGrant, BackendError, CatalogBackend,
    CatalogCredentials, CatalogSession, MAX_PLAYLIST_WRITE_BATCH,
};
use crate::config::{HttpConfig, SpotifyConfig};
use crate::protocol::{CatalogTrack, RemotePlaylistPage, RemotePlaylistTrack};

const SERVICE_NAME: &str = "Spotify";
const PLAYLIST_PAGE_SIZE: usize = 50;
const PLAYLIST_ITEM_FIELDS: &str =
    "items(added_at,track(uri,name,artists(name),album(name))),next";

/// Spotify adapter. Search calls are throttled by a local rate limiter.
pub struct SpotifyAdapter {
    http_client: ureq::Agent,
    api_base_url: String,
    accounts_base_url: String,
    max_attempts: u32,
    search_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl SpotifyAdapter {
    /// Creates a new adapter from the catalog and transport settings.
    pub fn new(spotify: &SpotifyConfig, http: &HttpConfig) -> Self {
        let per_second = NonZeroU32::new(spotify.search_requests_per_second.max(1))
            .unwrap_or(NonZeroU32::MIN);
        Self {
            http_client: build_http_agent(http),
            api_base_url: spotify.api_base_url.trim_end_matches('/').to_string(),
            accounts_base_url: spotify.accounts_base_url.trim_end_matches('/').to_string(),
            max_attempts: http.max_attempts.max(1),
            search_limiter: RateLimiter::direct(Quota::per_second(per_second)),
        }
    }

    fn wait_for_search_slot(&self) {
        while self.search_limiter.check().is_err() {
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn playlist_tracks_url(&self, playlist_id: &str) -> String {
        format!(
            "{}/playlists/{}/tracks",
            self.api_base_url,
            urlencoding::encode(playlist_id)
        )
    }

    fn bearer(session: &CatalogSession) -> String {
        format!("Bearer {}", session.access_token)
    }

    fn get_json(
        &self,
        session: &CatalogSession,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, BackendError> {
        let mut request = self
            .http_client
            .get(url)
            .set("Authorization", &Self::bearer(session))
            .set("Accept", "application/json");
        for (key, value) in query {
            request = request.query(key, value);
        }
        let response = request
            .call()
            .map_err(|error| BackendError::from_ureq(SERVICE_NAME, error))?;
        response
            .into_json()
            .map_err(|error| BackendError::invalid(SERVICE_NAME, format!("invalid JSON: {error}")))
    }

    fn parse_track(value: &Value) -> Option<CatalogTrack> {
        let uri = value.get("uri")?.as_str()?.trim().to_string();
        if uri.is_empty() {
            return None;
        }
        let title = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let artist = value
            .get("artists")
            .and_then(Value::as_array)
            .map(|artists| {
                artists
                    .iter()
                    .filter_map(|artist| artist.get("name").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        let album = value
            .get("album")
            .and_then(|album| album.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(CatalogTrack {
            uri,
            artist,
            title,
            album,
        })
    }

    fn parse_added_at(value: Option<&Value>) -> Option<i64> {
        let raw = value?.as_str()?;
        chrono::DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|added_at| added_at.timestamp_millis())
    }

    fn parse_search_payload(payload: &Value) -> Option<CatalogTrack> {
        payload
            .get("tracks")
            .and_then(|tracks| tracks.get("items"))
            .and_then(Value::as_array)
            .and_then(|items| items.iter().find_map(Self::parse_track))
    }

    fn parse_playlist_page(payload: &Value) -> Result<RemotePlaylistPage, BackendError> {
        let items = payload
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| BackendError::invalid(SERVICE_NAME, "playlist page has no items"))?;
        let tracks = items
            .iter()
            .filter_map(|item| {
                let track = Self::parse_track(item.get("track")?)?;
                Some(RemotePlaylistTrack {
                    track,
                    added_at_unix_ms: Self::parse_added_at(item.get("added_at")),
                })
            })
            .collect();
        let has_next = payload.get("next").is_some_and(|next| !next.is_null());
        Ok(RemotePlaylistPage { tracks, has_next })
    }

    fn check_batch(uris: &[String]) -> Result<(), BackendError> {
        if uris.len() > MAX_PLAYLIST_WRITE_BATCH {
            return Err(BackendError::invalid(
                SERVICE_NAME,
                format!(
                    "batch of {} exceeds the {} item limit",
                    uris.len(),
                    MAX_PLAYLIST_WRITE_BATCH
                ),
            ));
        }
        Ok(())
    }
}

impl CatalogBackend for SpotifyAdapter {
    fn refresh_access_token(
        &self,
        credentials: &CatalogCredentials,
    ) -> Result<AccessGrant, BackendError> {
        let url = format!("{}/api/token", self.accounts_base_url);
        let basic = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            credentials.client_id, credentials.client_secret
        ));
        let payload: Value = execute_with_backoff(
            "Spotify token refresh",
            self.max_attempts,
            BackendError::is_transient,
            || {
                self.http_client
                    .post(&url)
                    .set("Authorization", &format!("Basic {basic}"))
                    .send_form(&[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", credentials.refresh_token.as_str()),
                    ])
                    .map_err(|error| BackendError::from_ureq(SERVICE_NAME, error))?
                    .into_json()
                    .map_err(|error| {
                        BackendError::invalid(SERVICE_NAME, format!("invalid JSON: {error}"))
                    })
            },
        )?;
        let access_token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| BackendError::invalid(SERVICE_NAME, "token response missing access_token"))?
            .to_string();
        let rotated_refresh_token = payload
            .get("refresh_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty() && *token != credentials.refresh_token)
            .map(ToOwned::to_owned);
        Ok(AccessGrant {
            access_token,
            rotated_refresh_token,
        })
    }

    fn search_track(
        &self,
        session: &CatalogSession,
        query: &str,
    ) -> Result<Option<CatalogTrack>, BackendError> {
        let url = format!("{}/search", self.api_base_url);
        let payload = execute_with_backoff(
            "Spotify search",
            self.max_attempts,
            BackendError::is_transient,
            || {
                self.wait_for_search_slot();
                self.get_json(
                    session,
                    &url,
                    &[("q", query), ("type", "track"), ("limit", "1")],
                )
            },
        )?;
        let track = Self::parse_search_payload(&payload);
        debug!(
            "Spotify search '{}' -> {}",
            query,
            track.as_ref().map_or("no match", |track| track.uri.as_str())
        );
        Ok(track)
    }

    fn fetch_playlist_page(
        &self,
        session: &CatalogSession,
        playlist_id: &str,
        page: usize,
    ) -> Result<RemotePlaylistPage, BackendError> {
        let url = self.playlist_tracks_url(playlist_id);
        let offset = page.saturating_mul(PLAYLIST_PAGE_SIZE).to_string();
        let limit = PLAYLIST_PAGE_SIZE.to_string();
        let payload = execute_with_backoff(
            "Spotify playlist read",
            self.max_attempts,
            BackendError::is_transient,
            || {
                self.get_json(
                    session,
                    &url,
                    &[
                        ("fields", PLAYLIST_ITEM_FIELDS),
                        ("limit", limit.as_str()),
                        ("offset", offset.as_str()),
                    ],
                )
            },
        )?;
        Self::parse_playlist_page(&payload)
    }

    fn add_tracks(
        &self,
        session: &CatalogSession,
        playlist_id: &str,
        uris: &[String],
    ) -> Result<(), BackendError> {
        Self::check_batch(uris)?;
        if uris.is_empty() {
            return Ok(());
        }
        let url = self.playlist_tracks_url(playlist_id);
        // Only rate-limit rejections are retried; a timed-out add may have landed.
        execute_with_backoff(
            "Spotify playlist add",
            self.max_attempts,
            BackendError::is_rate_limited,
            || {
                self.http_client
                    .post(&url)
                    .set("Authorization", &Self::bearer(session))
                    .send_json(json!({ "uris": uris }))
                    .map(|_| ())
                    .map_err(|error| BackendError::from_ureq(SERVICE_NAME, error))
            },
        )
    }

    fn remove_tracks(
        &self,
        session: &CatalogSession,
        playlist_id: &str,
        uris: &[String],
    ) -> Result<(), BackendError> {
        Self::check_batch(uris)?;
        if uris.is_empty() {
            return Ok(());
        }
        let url = self.playlist_tracks_url(playlist_id);
        let tracks: Vec<Value> = uris.iter().map(|uri| json!({ "uri": uri })).collect();
        execute_with_backoff(
            "Spotify playlist remove",
            self.max_attempts,
            BackendError::is_transient,
            || {
                self.http_client
                    .delete(&url)
                    .set("Authorization", &Self::bearer(session))
                    .send_json(json!({ "tracks": tracks }))
                    .map(|_| ())
                    .map_err(|error| BackendError::from_ureq(SERVICE_NAME, error))
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::SpotifyAdapter;

    #[test]
    fn test_parse_search_payload_takes_first_track() {
        let payload = json!({
            "tracks": {
                "items": [
                    {
                        "uri": "spotify:track:4uLU6hMCjMI75M1A2tKUQC",
                        "name": "Never Gonna Give You Up",
                        "artists": [{ "name": "Rick Astley" }],
                        "album": { "name": "Whenever You Need Somebody" }
                    },
                    {
                        "uri": "spotify:track:0VjIjW4GlUZAMYd2vXMi3b",
                        "name": "Blinding Lights",
                        "artists": [{ "name": "The Weeknd" }],
                        "album": { "name": "After Hours" }
                    }
                ]
            }
        });

        let track = SpotifyAdapter::parse_search_payload(&payload).expect("match expected");

        assert_eq!(track.uri, "spotify:track:4uLU6hMCjMI75M1A2tKUQC");
        assert_eq!(track.artist, "Rick Astley");
        assert_eq!(track.album, "Whenever You Need Somebody");
    }

    #[test]
    fn test_parse_search_payload_without_items_is_no_match() {
        let payload = json!({ "tracks": { "items": [] } });
        assert!(SpotifyAdapter::parse_search_payload(&payload).is_none());
    }

    #[test]
    fn test_parse_playlist_page_reads_added_at_and_next() {
        let payload = json!({
            "items": [
                {
                    "added_at": "2024-03-09T14:00:00Z",
                    "track": {
                        "uri": "spotify:track:4uLU6hMCjMI75M1A2tKUQC",
                        "name": "Song",
                        "artists": [{ "name": "A" }, { "name": "B" }],
                        "album": { "name": "Album" }
                    }
                },
                { "added_at": "2024-03-09T15:00:00Z", "track": null }
            ],
            "next": "https://api.spotify.com/v1/playlists/x/tracks?offset=50"
        });

        let page = SpotifyAdapter::parse_playlist_page(&payload).expect("page should parse");

        assert!(page.has_next);
        assert_eq!(page.tracks.len(), 1);
        assert_eq!(page.tracks[0].track.artist, "A, B");
        assert_eq!(page.tracks[0].added_at_unix_ms, Some(1_709_992_800_000));
    }

    #[test]
    fn test_parse_playlist_page_last_page() {
        let payload = json!({ "items": [], "next": null });
        let page = SpotifyAdapter::parse_playlist_page(&payload).expect("page should parse");
        assert!(!page.has_next);
        assert!(page.tracks.is_empty());
    }
}
