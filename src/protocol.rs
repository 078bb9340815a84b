//! Data types shared by the cache store, resolver, backends and reconciler.
//!
//! Nothing in here talks to the network or the database; these are the
//! payloads passed between those layers during one sync run.

use std::fmt;

/// Role of a managed playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistKind {
    /// Fully replaced on every run.
    Daily,
    /// Append-only, size-bounded by oldest-first eviction.
    Cumulative,
}

impl PlaylistKind {
    /// Value stored in the `playlists.kind` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Cumulative => "cumulative",
        }
    }

    /// Parses the stored column value back into a kind.
    pub fn from_stored(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(Self::Daily),
            "cumulative" => Some(Self::Cumulative),
            _ => None,
        }
    }
}

impl fmt::Display for PlaylistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One play reported by the source feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEvent {
    /// Source id, or a deterministic fallback when the source has none.
    pub external_id: String,
    pub artist: String,
    pub title: String,
    /// Raw play timestamp as reported by the source.
    pub played_at: String,
}

impl SourceEvent {
    /// Normalized dedup key for this event.
    pub fn search_key(&self) -> String {
        search_key(&self.artist, &self.title)
    }
}

/// Builds the best-effort dedup key `lower(artist)_lower(title)`.
pub fn search_key(artist: &str, title: &str) -> String {
    format!(
        "{}_{}",
        artist.trim().to_lowercase(),
        title.trim().to_lowercase()
    )
}

/// Track as known by the destination catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogTrack {
    pub uri: String,
    pub artist: String,
    pub title: String,
    pub album: String,
}

/// Track entry read back from a remote playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePlaylistTrack {
    pub track: CatalogTrack,
    /// Remote add-time, when the service reports one.
    pub added_at_unix_ms: Option<i64>,
}

/// One page of a remote playlist listing.
#[derive(Debug, Clone, Default)]
pub struct RemotePlaylistPage {
    pub tracks: Vec<RemotePlaylistTrack>,
    pub has_next: bool,
}

/// Result of a cache lookup by external id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// No resolution was ever attempted for this id.
    Miss,
    /// A previous search found nothing.
    NotFound,
    /// A previous search resolved to this catalog uri.
    Found(String),
}

/// Full cached mapping row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMapping {
    pub external_id: String,
    pub external_artist: String,
    pub external_title: String,
    pub catalog_uri: Option<String>,
    pub catalog_artist: Option<String>,
    pub catalog_title: Option<String>,
    pub catalog_album: Option<String>,
    pub search_key: String,
    pub created_at_unix_ms: i64,
    pub last_seen_at_unix_ms: i64,
}

/// Membership row input for a full playlist rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEntry {
    pub uri: String,
    /// Explicit add-time; local time is used when absent.
    pub added_at_unix_ms: Option<i64>,
}

impl MembershipEntry {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            added_at_unix_ms: None,
        }
    }
}

/// Membership row input for an incremental append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntry {
    pub external_id: String,
    pub added_at_unix_ms: Option<i64>,
}

/// Cached record of one managed playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistRecord {
    pub playlist_id: String,
    pub display_name: String,
    pub kind: PlaylistKind,
    pub last_synced_at_unix_ms: i64,
}

/// Aggregate cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub resolved_count: usize,
    pub unresolved_count: usize,
    pub playlist_count: usize,
    pub total_membership_count: usize,
}

/// Counters collected by the resolver during one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    /// Cache answered with a catalog uri.
    pub cache_hits: usize,
    /// Cache answered with a stored negative result.
    pub cached_misses: usize,
    /// Remote search found a match.
    pub remote_hits: usize,
    /// Remote search found nothing.
    pub remote_misses: usize,
    /// Remote search failed; nothing was cached.
    pub remote_failures: usize,
}

impl ResolverStats {
    /// Lookups answered without a remote call.
    pub fn total_cache_hits(&self) -> usize {
        self.cache_hits + self.cached_misses
    }

    /// Lookups that had to go to the catalog.
    pub fn total_cache_misses(&self) -> usize {
        self.remote_hits + self.remote_misses + self.remote_failures
    }
}

/// Summary of one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub events_fetched: usize,
    pub unique_events: usize,
    pub resolved_tracks: usize,
    pub resolver: ResolverStats,
    pub daily_track_count: usize,
    pub cumulative_added: usize,
    pub cumulative_trimmed: usize,
    pub cumulative_track_count: Option<usize>,
}
