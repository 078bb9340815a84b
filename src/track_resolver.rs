//! Cache-first resolution of source plays to catalog uris.

use log::{debug, warn};

use crate::backends::{BackendError, CatalogBackend, CatalogSession};
use crate::db_manager::{DbManager, StorageError};
use crate::protocol::{CacheLookup, ResolverStats};

/// Failure to resolve one play.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Remote search failed; nothing was cached and the play may be retried later.
    #[error("catalog search failed: {0}")]
    Remote(#[from] BackendError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Builds the catalog search query for a play.
///
/// Whitespace runs collapse to a single space and double quotes are dropped,
/// since the catalog treats them as phrase delimiters.
pub fn search_query(artist: &str, title: &str) -> String {
    format!("artist:{} track:{}", normalize_term(artist), normalize_term(title))
}

fn normalize_term(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolves plays through the cache, falling back to catalog search.
pub struct TrackResolver<'a> {
    db_manager: &'a DbManager,
    catalog: &'a dyn CatalogBackend,
    session: &'a CatalogSession,
    stats: ResolverStats,
}

impl<'a> TrackResolver<'a> {
    pub fn new(
        db_manager: &'a DbManager,
        catalog: &'a dyn CatalogBackend,
        session: &'a CatalogSession,
    ) -> Self {
        Self {
            db_manager,
            catalog,
            session,
            stats: ResolverStats::default(),
        }
    }

    /// Returns the catalog uri for a play, or `None` when the catalog has no
    /// match. Both outcomes are cached; a remote failure is not.
    pub fn resolve(
        &mut self,
        external_id: &str,
        artist: &str,
        title: &str,
    ) -> Result<Option<String>, ResolveError> {
        match self.db_manager.lookup(external_id)? {
            CacheLookup::Found(uri) => {
                self.stats.cache_hits += 1;
                return Ok(Some(uri));
            }
            CacheLookup::NotFound => {
                self.stats.cached_misses += 1;
                return Ok(None);
            }
            CacheLookup::Miss => {}
        }

        let query = search_query(artist, title);
        let found = match self.catalog.search_track(self.session, &query) {
            Ok(found) => found,
            Err(error) => {
                self.stats.remote_failures += 1;
                warn!("Search failed for '{} - {}': {}", artist, title, error);
                return Err(ResolveError::Remote(error));
            }
        };
        self.db_manager
            .record(external_id, artist, title, found.as_ref())?;
        match found {
            Some(track) => {
                self.stats.remote_hits += 1;
                debug!("Resolved '{} - {}' to {}", artist, title, track.uri);
                Ok(Some(track.uri))
            }
            None => {
                self.stats.remote_misses += 1;
                debug!("No catalog match for '{} - {}'", artist, title);
                Ok(None)
            }
        }
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats
    }
}
