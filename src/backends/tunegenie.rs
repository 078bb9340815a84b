//! TuneGenie "on air" feed adapter.

use log::{debug, info, warn};
use serde_json::Value;

use crate::backends::{build_http_agent, execute_with_backoff, BackendError, SourceFeed};
use crate::config::{HttpConfig, TuneGenieConfig};
use crate::play_window::PlayWindow;
use crate::protocol::SourceEvent;

const SERVICE_NAME: &str = "TuneGenie";

/// Reads recently played songs for one station brand.
pub struct TuneGenieAdapter {
    http_client: ureq::Agent,
    api_url: String,
    query: Vec<(String, String)>,
    max_attempts: u32,
}

impl TuneGenieAdapter {
    pub fn new(tunegenie: &TuneGenieConfig, http: &HttpConfig) -> Self {
        let mut query = vec![
            ("apiid".to_string(), tunegenie.api_id.clone()),
            ("b".to_string(), tunegenie.brand.clone()),
        ];
        query.extend(
            tunegenie
                .extra_params
                .iter()
                .filter(|(key, _)| !matches!(key.as_str(), "apiid" | "b" | "since" | "until"))
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        Self {
            http_client: build_http_agent(http),
            api_url: tunegenie.api_url.trim().to_string(),
            query,
            max_attempts: http.max_attempts.max(1),
        }
    }

    /// Converts a feed payload into events. Anything other than a top-level
    /// array is rejected; items without both `artist` and `song` are dropped.
    fn parse_events(payload: &Value) -> Result<Vec<SourceEvent>, BackendError> {
        let items = payload.as_array().ok_or_else(|| {
            BackendError::invalid(SERVICE_NAME, "expected a JSON array of plays")
        })?;
        let mut events = Vec::with_capacity(items.len());
        for item in items {
            let (Some(artist), Some(title)) = (text_field(item, "artist"), text_field(item, "song"))
            else {
                debug!("Skipping feed item without artist/song: {}", item);
                continue;
            };
            let played_at = text_field(item, "played_at").unwrap_or_default();
            let external_id = id_field(item, "sid")
                .or_else(|| id_field(item, "id"))
                .unwrap_or_else(|| fallback_external_id(&played_at, &artist, &title));
            events.push(SourceEvent {
                external_id,
                artist,
                title,
                played_at,
            });
        }
        Ok(events)
    }
}

fn text_field(item: &Value, key: &str) -> Option<String> {
    item.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn id_field(item: &Value, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

/// Deterministic id for plays the feed reports without one.
fn fallback_external_id(played_at: &str, artist: &str, title: &str) -> String {
    let seed = format!(
        "{}|{}|{}",
        played_at.trim(),
        artist.trim().to_lowercase(),
        title.trim().to_lowercase()
    );
    format!("tg-{:x}", md5::compute(seed.as_bytes()))
}

impl SourceFeed for TuneGenieAdapter {
    fn fetch_events(&self, window: &PlayWindow) -> Result<Vec<SourceEvent>, BackendError> {
        let since = window.since_param();
        let until = window.until_param();
        info!("Fetching plays from {} to {}", since, until);
        let payload: Value = execute_with_backoff(
            "TuneGenie fetch",
            self.max_attempts,
            BackendError::is_transient,
            || {
                let mut request = self
                    .http_client
                    .get(&self.api_url)
                    .set("Accept", "application/json");
                for (key, value) in &self.query {
                    request = request.query(key, value);
                }
                request
                    .query("since", &since)
                    .query("until", &until)
                    .call()
                    .map_err(|error| BackendError::from_ureq(SERVICE_NAME, error))?
                    .into_json()
                    .map_err(|error| {
                        BackendError::invalid(SERVICE_NAME, format!("invalid JSON: {error}"))
                    })
            },
        )?;
        let events = Self::parse_events(&payload)?;
        let total = payload.as_array().map_or(0, Vec::len);
        if events.len() < total {
            warn!(
                "Dropped {} of {} feed items missing artist or song",
                total - events.len(),
                total
            );
        }
        info!("Fetched {} plays", events.len());
        Ok(events)
    }
}
