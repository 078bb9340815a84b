//! Catalog uri and playlist locator helpers.

const TRACK_URI_PREFIX: &str = "spotify:track:";
const PLAYLIST_URI_PREFIX: &str = "spotify:playlist:";
const PLAYLIST_URL_MARKER: &str = "open.spotify.com/playlist/";
const CATALOG_ID_LEN: usize = 22;

fn is_catalog_id(value: &str) -> bool {
    value.len() == CATALOG_ID_LEN && value.chars().all(|ch| ch.is_ascii_alphanumeric())
}

/// Returns true if `uri` has the shape of a catalog track uri.
pub fn is_valid_track_uri(uri: &str) -> bool {
    uri.strip_prefix(TRACK_URI_PREFIX)
        .is_some_and(is_catalog_id)
}

/// Extracts a playlist id from a bare id, a `spotify:playlist:` uri, or a
/// share url (`https://open.spotify.com/playlist/<id>?si=...`).
pub fn parse_playlist_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if let Some(rest) = trimmed.strip_prefix(PLAYLIST_URI_PREFIX) {
        rest.to_string()
    } else if let Some((_, rest)) = trimmed.split_once(PLAYLIST_URL_MARKER) {
        let path_part = rest.split(['?', '#', '/']).next().unwrap_or_default();
        urlencoding::decode(path_part).ok()?.into_owned()
    } else {
        trimmed.to_string()
    };
    is_catalog_id(&candidate).then_some(candidate)
}
