//! Per-run reconciliation of the managed playlists.
//!
//! A run walks a fixed sequence: authenticate, bootstrap the cache from the
//! remote playlists when it knows none, fetch yesterday's plays, deduplicate
//! and resolve them, replace the daily playlist, then merge into and trim the
//! cumulative playlist. The daily step is all-or-nothing; the cumulative step
//! is best-effort per batch.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::backends::{
    BackendError, CatalogBackend, CatalogCredentials, CatalogSession, SourceFeed,
    MAX_PLAYLIST_WRITE_BATCH,
};
use crate::config::Config;
use crate::db_manager::{DbManager, StorageError};
use crate::integration_uri::is_valid_track_uri;
use crate::play_window::{parse_utc_offset, PlayWindow};
use crate::protocol::{AppendEntry, MembershipEntry, PlaylistKind, RunReport, SourceEvent};
use crate::track_resolver::{ResolveError, TrackResolver};

/// Cumulative trimming removes this many tracks beyond the limit so the next
/// few runs can append without trimming again.
const TRIM_HEADROOM: usize = 50;

/// Fatal failure of a sync run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Authenticate(#[source] BackendError),
    #[error("failed to bootstrap cache from playlist {playlist_id}: {source}")]
    Bootstrap {
        playlist_id: String,
        #[source]
        source: BackendError,
    },
    #[error("failed to fetch plays: {0}")]
    SourceFetch(#[source] BackendError),
    #[error("failed to replace daily playlist {playlist_id}: {source}")]
    DailyReplace {
        playlist_id: String,
        #[source]
        source: BackendError,
    },
    #[error("invalid timezone offset `{0}`")]
    InvalidOffset(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A play that resolved to a catalog uri, kept in run order.
#[derive(Debug, Clone)]
struct ResolvedTrack {
    external_id: String,
    uri: String,
}

pub struct PlaylistManager<'a> {
    config: &'a Config,
    db_manager: &'a DbManager,
    catalog: &'a dyn CatalogBackend,
    feed: &'a dyn SourceFeed,
    credentials: CatalogCredentials,
    rotated_refresh_token: Option<String>,
}

impl<'a> PlaylistManager<'a> {
    pub fn new(
        config: &'a Config,
        db_manager: &'a DbManager,
        catalog: &'a dyn CatalogBackend,
        feed: &'a dyn SourceFeed,
        credentials: CatalogCredentials,
    ) -> Self {
        Self {
            config,
            db_manager,
            catalog,
            feed,
            credentials,
            rotated_refresh_token: None,
        }
    }

    /// Refresh token handed out by the last authentication, if it changed.
    pub fn rotated_refresh_token(&self) -> Option<&str> {
        self.rotated_refresh_token.as_deref()
    }

    /// Runs one sync for the previous calendar day.
    pub fn run(&mut self) -> Result<RunReport, SyncError> {
        self.run_at(Utc::now())
    }

    pub fn run_at(&mut self, now: DateTime<Utc>) -> Result<RunReport, SyncError> {
        let session = self.authenticate()?;
        self.bootstrap_if_needed(&session)?;

        let offset_raw = &self.config.tunegenie.timezone_offset;
        let offset = parse_utc_offset(offset_raw)
            .ok_or_else(|| SyncError::InvalidOffset(offset_raw.clone()))?;
        let window = PlayWindow::previous_day(now, offset);
        let events = self
            .feed
            .fetch_events(&window)
            .map_err(SyncError::SourceFetch)?;

        let mut report = RunReport {
            events_fetched: events.len(),
            ..RunReport::default()
        };
        if events.is_empty() {
            info!("No plays reported for the window; nothing to update");
            self.log_report(&report)?;
            return Ok(report);
        }

        let resolved = self.resolve_unique(&session, &events, &mut report)?;
        report.resolved_tracks = resolved.len();
        if resolved.is_empty() {
            warn!("None of the {} plays resolved to a catalog track", report.unique_events);
            self.log_report(&report)?;
            return Ok(report);
        }

        report.daily_track_count = self.replace_daily(&session, &resolved)?;
        if let Some(cumulative_id) = self.config.spotify.cumulative_playlist() {
            self.merge_cumulative(&session, cumulative_id, &resolved, &mut report)?;
        }
        self.log_report(&report)?;
        Ok(report)
    }

    fn authenticate(&mut self) -> Result<CatalogSession, SyncError> {
        let grant = self
            .catalog
            .refresh_access_token(&self.credentials)
            .map_err(SyncError::Authenticate)?;
        if let Some(rotated) = grant.rotated_refresh_token {
            info!("Catalog issued a new refresh token");
            self.credentials.refresh_token = rotated.clone();
            self.rotated_refresh_token = Some(rotated);
        }
        info!("Authenticated with the catalog");
        Ok(CatalogSession {
            access_token: grant.access_token,
        })
    }

    fn managed_playlists(&self) -> Vec<(&'a str, &'a str, PlaylistKind)> {
        let config: &'a Config = self.config;
        let spotify = &config.spotify;
        let mut playlists = vec![(
            spotify.daily_playlist_id.as_str(),
            spotify.daily_playlist_name.as_str(),
            PlaylistKind::Daily,
        )];
        if let Some(cumulative_id) = spotify.cumulative_playlist() {
            playlists.push((
                cumulative_id,
                spotify.cumulative_playlist_name.as_str(),
                PlaylistKind::Cumulative,
            ));
        }
        playlists
    }

    fn bootstrap_if_needed(&self, session: &CatalogSession) -> Result<(), SyncError> {
        if self.db_manager.playlist_count()? > 0 {
            return Ok(());
        }
        info!("Cache knows no playlists; importing current remote contents");
        for (playlist_id, display_name, kind) in self.managed_playlists() {
            let imported = self.import_remote_playlist(session, playlist_id).map_err(
                |error| match error {
                    ImportError::Remote(source) => SyncError::Bootstrap {
                        playlist_id: playlist_id.to_string(),
                        source,
                    },
                    ImportError::Storage(error) => SyncError::Storage(error),
                },
            )?;
            self.db_manager
                .upsert_playlist(playlist_id, display_name, kind)?;
            info!(
                "Imported {} tracks from {} playlist {}",
                imported.len(),
                kind,
                playlist_id
            );
        }
        Ok(())
    }

    /// Lists a remote playlist, seeds mappings for its tracks and rewrites the
    /// cached membership to match. Returns the remote uris in order.
    fn import_remote_playlist(
        &self,
        session: &CatalogSession,
        playlist_id: &str,
    ) -> Result<Vec<String>, ImportError> {
        let remote = self
            .catalog
            .fetch_playlist_tracks(session, playlist_id)
            .map_err(ImportError::Remote)?;
        self.db_manager.seed_remote_tracks(&remote)?;
        let entries: Vec<MembershipEntry> = remote
            .iter()
            .map(|remote_track| MembershipEntry {
                uri: remote_track.track.uri.clone(),
                added_at_unix_ms: remote_track.added_at_unix_ms,
            })
            .collect();
        self.db_manager.replace_membership(playlist_id, &entries)?;
        Ok(entries.into_iter().map(|entry| entry.uri).collect())
    }

    fn resolve_unique(
        &self,
        session: &CatalogSession,
        events: &[SourceEvent],
        report: &mut RunReport,
    ) -> Result<Vec<ResolvedTrack>, SyncError> {
        let mut resolver = TrackResolver::new(self.db_manager, self.catalog, session);
        let mut seen_keys = HashSet::new();
        let mut seen_uris = HashSet::new();
        let mut resolved = Vec::new();
        for event in events {
            if !seen_keys.insert(event.search_key()) {
                debug!("Skipping repeat play of '{} - {}'", event.artist, event.title);
                continue;
            }
            report.unique_events += 1;
            match resolver.resolve(&event.external_id, &event.artist, &event.title) {
                Ok(Some(uri)) => {
                    if seen_uris.insert(uri.clone()) {
                        resolved.push(ResolvedTrack {
                            external_id: event.external_id.clone(),
                            uri,
                        });
                    } else {
                        debug!("'{} - {}' resolved to an already queued track", event.artist, event.title);
                    }
                }
                Ok(None) => {}
                Err(ResolveError::Remote(_)) => {}
                Err(ResolveError::Storage(error)) => return Err(error.into()),
            }
        }
        report.resolver = resolver.stats();
        info!(
            "Resolved {} of {} unique plays ({} from cache)",
            resolved.len(),
            report.unique_events,
            report.resolver.total_cache_hits()
        );
        Ok(resolved)
    }

    fn replace_daily(
        &self,
        session: &CatalogSession,
        resolved: &[ResolvedTrack],
    ) -> Result<usize, SyncError> {
        let spotify = &self.config.spotify;
        let playlist_id = spotify.daily_playlist_id.as_str();
        let uris: Vec<String> = resolved.iter().map(|track| track.uri.clone()).collect();
        self.catalog
            .replace_playlist_tracks(session, playlist_id, &uris, spotify.replace_batch_size)
            .map_err(|source| SyncError::DailyReplace {
                playlist_id: playlist_id.to_string(),
                source,
            })?;
        let entries: Vec<MembershipEntry> =
            uris.iter().map(|uri| MembershipEntry::new(uri.as_str())).collect();
        let written = self.db_manager.replace_membership(playlist_id, &entries)?;
        self.db_manager
            .upsert_playlist(playlist_id, &spotify.daily_playlist_name, PlaylistKind::Daily)?;
        info!("Daily playlist now holds {} tracks", written);
        Ok(written)
    }

    fn merge_cumulative(
        &self,
        session: &CatalogSession,
        playlist_id: &str,
        resolved: &[ResolvedTrack],
        report: &mut RunReport,
    ) -> Result<(), SyncError> {
        let spotify = &self.config.spotify;
        let mut resynced = false;
        let existing: HashSet<String> = if self.db_manager.track_count(playlist_id)? == 0 {
            match self.import_remote_playlist(session, playlist_id) {
                Ok(remote_uris) => {
                    info!(
                        "Resynced {} cumulative tracks from the remote playlist",
                        remote_uris.len()
                    );
                    resynced = true;
                    remote_uris.into_iter().collect()
                }
                Err(ImportError::Remote(error)) => {
                    warn!("Skipping cumulative merge; could not list playlist {}: {}", playlist_id, error);
                    return Ok(());
                }
                Err(ImportError::Storage(error)) => return Err(error.into()),
            }
        } else {
            self.db_manager
                .playlist_membership(playlist_id)?
                .into_iter()
                .collect()
        };

        let mut new_tracks = Vec::new();
        for track in resolved.iter().filter(|track| !existing.contains(&track.uri)) {
            if is_valid_track_uri(&track.uri) {
                new_tracks.push(track);
            } else {
                warn!("Skipping malformed catalog uri {}", track.uri);
            }
        }

        let mut appended = Vec::new();
        for batch in new_tracks.chunks(spotify.append_batch_size.max(1)) {
            let uris: Vec<String> = batch.iter().map(|track| track.uri.clone()).collect();
            match self.catalog.add_tracks(session, playlist_id, &uris) {
                Ok(()) => appended.extend(batch.iter().map(|track| AppendEntry {
                    external_id: track.external_id.clone(),
                    added_at_unix_ms: None,
                })),
                Err(error) => warn!(
                    "Failed to append {} tracks to cumulative playlist: {}",
                    uris.len(),
                    error
                ),
            }
        }
        if !appended.is_empty() {
            report.cumulative_added = self.db_manager.append_membership(playlist_id, &appended)?;
        }
        if resynced || !appended.is_empty() {
            self.db_manager.upsert_playlist(
                playlist_id,
                &spotify.cumulative_playlist_name,
                PlaylistKind::Cumulative,
            )?;
        }
        info!("Added {} tracks to the cumulative playlist", report.cumulative_added);

        report.cumulative_trimmed = self.trim_cumulative(session, playlist_id)?;
        report.cumulative_track_count = Some(self.db_manager.track_count(playlist_id)?);
        Ok(())
    }

    /// Evicts the oldest tracks once the cumulative playlist exceeds its limit.
    fn trim_cumulative(
        &self,
        session: &CatalogSession,
        playlist_id: &str,
    ) -> Result<usize, SyncError> {
        let max_tracks = self.config.spotify.max_cumulative_tracks;
        let count = self.db_manager.track_count(playlist_id)?;
        if count <= max_tracks {
            return Ok(0);
        }
        let evict = (count - max_tracks + TRIM_HEADROOM).min(count);
        info!(
            "Cumulative playlist holds {} tracks (limit {}); evicting {} oldest",
            count, max_tracks, evict
        );
        let oldest = self.db_manager.oldest(playlist_id, evict)?;
        let mut trimmed = 0usize;
        for batch in oldest.chunks(MAX_PLAYLIST_WRITE_BATCH) {
            match self.catalog.remove_tracks(session, playlist_id, batch) {
                Ok(()) => {
                    let removed: HashSet<String> = batch.iter().cloned().collect();
                    trimmed += self.db_manager.remove_membership(playlist_id, &removed)?;
                }
                Err(error) => warn!(
                    "Failed to remove {} tracks from cumulative playlist: {}",
                    batch.len(),
                    error
                ),
            }
        }
        Ok(trimmed)
    }

    fn log_report(&self, report: &RunReport) -> Result<(), SyncError> {
        let stats = self.db_manager.stats()?;
        info!(
            "Run complete: {} plays fetched, {} unique, {} resolved",
            report.events_fetched, report.unique_events, report.resolved_tracks
        );
        info!(
            "Resolver: {} cache hits, {} cached misses, {} found remotely, {} not found, {} failed",
            report.resolver.cache_hits,
            report.resolver.cached_misses,
            report.resolver.remote_hits,
            report.resolver.remote_misses,
            report.resolver.remote_failures
        );
        info!("Daily playlist: {} tracks", report.daily_track_count);
        if let Some(cumulative_count) = report.cumulative_track_count {
            info!(
                "Cumulative playlist: {} tracks ({} added, {} trimmed)",
                cumulative_count, report.cumulative_added, report.cumulative_trimmed
            );
        }
        info!(
            "Cache: {} resolved, {} unresolved, {} playlists, {} memberships",
            stats.resolved_count,
            stats.unresolved_count,
            stats.playlist_count,
            stats.total_membership_count
        );
        Ok(())
    }
}

#[derive(Debug)]
enum ImportError {
    Remote(BackendError),
    Storage(StorageError),
}

impl From<StorageError> for ImportError {
    fn from(error: StorageError) -> Self {
        Self::Storage(error)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};

    use super::{PlaylistManager, SyncError};
    use crate::backends::{
        AccessGrant, BackendError, CatalogBackend, CatalogCredentials, CatalogSession, SourceFeed,
    };
    use crate::config::Config;
    use crate::db_manager::DbManager;
    use crate::play_window::PlayWindow;
    use crate::protocol::{
        CatalogTrack, PlaylistKind, RemotePlaylistPage, RemotePlaylistTrack, SourceEvent,
    };
    use crate::track_resolver::search_query;

    const DAILY_ID: &str = "37i9dQZF1DXcBWIGoYBM5M";
    const CUMULATIVE_ID: &str = "0VjIjW4GlUZAMYd2vXMi3b";
    const FAKE_PAGE_SIZE: usize = 50;

    fn uri(n: usize) -> String {
        format!("spotify:track:{n:0>22}")
    }

    fn failure(status: u16) -> BackendError {
        BackendError::Status {
            service: "fake",
            status,
            body: String::new(),
            retry_after: None,
        }
    }

    #[derive(Default)]
    struct FakeCatalog {
        playlists: RefCell<HashMap<String, Vec<String>>>,
        search_results: HashMap<String, String>,
        searches: Cell<usize>,
        fail_auth: bool,
        fail_add: Option<(String, String)>,
        fail_remove: Option<String>,
        fail_list: Option<String>,
        add_calls: RefCell<Vec<(String, Vec<String>)>>,
        rotate_to: Option<String>,
    }

    impl FakeCatalog {
        fn with_playlist(self, playlist_id: &str, uris: Vec<String>) -> Self {
            self.playlists
                .borrow_mut()
                .insert(playlist_id.to_string(), uris);
            self
        }

        fn with_match(mut self, artist: &str, title: &str, uri: String) -> Self {
            self.search_results.insert(search_query(artist, title), uri);
            self
        }

        fn remote(&self, playlist_id: &str) -> Vec<String> {
            self.playlists
                .borrow()
                .get(playlist_id)
                .cloned()
                .unwrap_or_default()
        }
    }

    impl CatalogBackend for FakeCatalog {
        fn refresh_access_token(
            &self,
            _credentials: &CatalogCredentials,
        ) -> Result<AccessGrant, BackendError> {
            if self.fail_auth {
                return Err(failure(400));
            }
            Ok(AccessGrant {
                access_token: "access".to_string(),
                rotated_refresh_token: self.rotate_to.clone(),
            })
        }

        fn search_track(
            &self,
            _session: &CatalogSession,
            query: &str,
        ) -> Result<Option<CatalogTrack>, BackendError> {
            self.searches.set(self.searches.get() + 1);
            Ok(self.search_results.get(query).map(|uri| CatalogTrack {
                uri: uri.clone(),
                artist: "artist".to_string(),
                title: "title".to_string(),
                album: "album".to_string(),
            }))
        }

        fn fetch_playlist_page(
            &self,
            _session: &CatalogSession,
            playlist_id: &str,
            page: usize,
        ) -> Result<RemotePlaylistPage, BackendError> {
            if self.fail_list.as_deref() == Some(playlist_id) {
                return Err(failure(503));
            }
            let all = self.remote(playlist_id);
            let start = (page * FAKE_PAGE_SIZE).min(all.len());
            let end = (start + FAKE_PAGE_SIZE).min(all.len());
            let tracks = all[start..end]
                .iter()
                .enumerate()
                .map(|(index, uri)| RemotePlaylistTrack {
                    track: CatalogTrack {
                        uri: uri.clone(),
                        artist: format!("remote artist {uri}"),
                        title: format!("remote title {uri}"),
                        album: String::new(),
                    },
                    added_at_unix_ms: Some(1_000 + (start + index) as i64),
                })
                .collect();
            Ok(RemotePlaylistPage {
                tracks,
                has_next: end < all.len(),
            })
        }

        fn add_tracks(
            &self,
            _session: &CatalogSession,
            playlist_id: &str,
            uris: &[String],
        ) -> Result<(), BackendError> {
            self.add_calls
                .borrow_mut()
                .push((playlist_id.to_string(), uris.to_vec()));
            if let Some((fail_playlist, fail_uri)) = &self.fail_add {
                if fail_playlist == playlist_id && uris.contains(fail_uri) {
                    return Err(failure(500));
                }
            }
            self.playlists
                .borrow_mut()
                .entry(playlist_id.to_string())
                .or_default()
                .extend(uris.iter().cloned());
            Ok(())
        }

        fn remove_tracks(
            &self,
            _session: &CatalogSession,
            playlist_id: &str,
            uris: &[String],
        ) -> Result<(), BackendError> {
            if let Some(fail_uri) = &self.fail_remove {
                if uris.contains(fail_uri) {
                    return Err(failure(500));
                }
            }
            if let Some(tracks) = self.playlists.borrow_mut().get_mut(playlist_id) {
                tracks.retain(|uri| !uris.contains(uri));
            }
            Ok(())
        }
    }

    struct FakeFeed {
        events: Vec<SourceEvent>,
        fail: bool,
        windows: RefCell<Vec<PlayWindow>>,
    }

    impl FakeFeed {
        fn new(events: Vec<SourceEvent>) -> Self {
            Self {
                events,
                fail: false,
                windows: RefCell::new(Vec::new()),
            }
        }
    }

    impl SourceFeed for FakeFeed {
        fn fetch_events(&self, window: &PlayWindow) -> Result<Vec<SourceEvent>, BackendError> {
            self.windows.borrow_mut().push(*window);
            if self.fail {
                return Err(failure(502));
            }
            Ok(self.events.clone())
        }
    }

    fn event(external_id: &str, artist: &str, title: &str) -> SourceEvent {
        SourceEvent {
            external_id: external_id.to_string(),
            artist: artist.to_string(),
            title: title.to_string(),
            played_at: "2024-03-09T08:00:00-04:00".to_string(),
        }
    }

    fn config(cumulative: bool) -> Config {
        let mut config = Config::default();
        config.spotify.client_id = "client".to_string();
        config.spotify.client_secret = "secret".to_string();
        config.spotify.daily_playlist_id = DAILY_ID.to_string();
        if cumulative {
            config.spotify.cumulative_playlist_id = CUMULATIVE_ID.to_string();
        }
        config
    }

    fn credentials() -> CatalogCredentials {
        CatalogCredentials {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "refresh".to_string(),
        }
    }

    fn run(
        config: &Config,
        store: &DbManager,
        catalog: &FakeCatalog,
        feed: &FakeFeed,
    ) -> Result<crate::protocol::RunReport, SyncError> {
        let mut manager = PlaylistManager::new(config, store, catalog, feed, credentials());
        manager.run_at(Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap())
    }

    fn standard_catalog() -> FakeCatalog {
        FakeCatalog::default()
            .with_playlist(DAILY_ID, vec![uri(900)])
            .with_playlist(CUMULATIVE_ID, vec![uri(901)])
            .with_match("Artist A", "Song A", uri(1))
            .with_match("Artist B", "Song B", uri(2))
    }

    fn standard_events() -> Vec<SourceEvent> {
        vec![
            event("tg-a", "Artist A", "Song A"),
            event("tg-a2", "artist a", "SONG A"),
            event("tg-b", "Artist B", "Song B"),
            event("tg-x", "Nobody", "Nothing"),
        ]
    }

    #[test]
    fn test_run_replaces_daily_and_appends_cumulative() {
        let config = config(true);
        let store = DbManager::new_in_memory().expect("in-memory store");
        let catalog = standard_catalog();
        let feed = FakeFeed::new(standard_events());

        let report = run(&config, &store, &catalog, &feed).expect("run succeeds");

        assert_eq!(report.events_fetched, 4);
        assert_eq!(report.unique_events, 3);
        assert_eq!(report.resolved_tracks, 2);
        assert_eq!(catalog.searches.get(), 3);
        assert_eq!(catalog.remote(DAILY_ID), vec![uri(1), uri(2)]);
        assert_eq!(
            store.playlist_membership(DAILY_ID).expect("daily membership"),
            vec![uri(1), uri(2)]
        );
        assert_eq!(catalog.remote(CUMULATIVE_ID), vec![uri(901), uri(1), uri(2)]);
        assert_eq!(
            store.playlist_membership(CUMULATIVE_ID).expect("cumulative membership"),
            vec![uri(901), uri(1), uri(2)]
        );
        assert_eq!(report.cumulative_added, 2);
        assert_eq!(report.cumulative_track_count, Some(3));
        let record = store
            .playlist_record(CUMULATIVE_ID)
            .expect("record lookup")
            .expect("cumulative record");
        assert_eq!(record.kind, PlaylistKind::Cumulative);

        let windows = feed.windows.borrow();
        assert_eq!(windows[0].since_param(), "2024-03-09T00:00:00.00-04:00");
    }

    #[test]
    fn test_second_run_uses_cache_and_does_not_duplicate() {
        let config = config(true);
        let store = DbManager::new_in_memory().expect("in-memory store");
        let catalog = standard_catalog();
        let feed = FakeFeed::new(standard_events());

        run(&config, &store, &catalog, &feed).expect("first run");
        let report = run(&config, &store, &catalog, &feed).expect("second run");

        assert_eq!(catalog.searches.get(), 3);
        assert_eq!(report.resolver.total_cache_misses(), 0);
        assert_eq!(report.resolver.cached_misses, 1);
        assert_eq!(report.cumulative_added, 0);
        assert_eq!(catalog.remote(CUMULATIVE_ID), vec![uri(901), uri(1), uri(2)]);
        assert_eq!(catalog.remote(DAILY_ID), vec![uri(1), uri(2)]);
    }

    #[test]
    fn test_two_keys_resolving_to_one_track_are_added_once() {
        let config = config(false);
        let store = DbManager::new_in_memory().expect("in-memory store");
        let catalog = FakeCatalog::default()
            .with_match("Artist A", "Song A", uri(1))
            .with_match("Artist A feat. C", "Song A", uri(1));
        let feed = FakeFeed::new(vec![
            event("tg-1", "Artist A", "Song A"),
            event("tg-2", "Artist A feat. C", "Song A"),
        ]);

        let report = run(&config, &store, &catalog, &feed).expect("run succeeds");

        assert_eq!(report.unique_events, 2);
        assert_eq!(report.resolved_tracks, 1);
        assert_eq!(catalog.remote(DAILY_ID), vec![uri(1)]);
        assert_eq!(report.cumulative_track_count, None);
    }

    #[test]
    fn test_cumulative_resyncs_from_remote_when_cache_is_empty() {
        let config = config(true);
        let store = DbManager::new_in_memory().expect("in-memory store");
        store
            .upsert_playlist(DAILY_ID, "Daily", PlaylistKind::Daily)
            .expect("daily record");
        let catalog = FakeCatalog::default()
            .with_playlist(CUMULATIVE_ID, vec![uri(1)])
            .with_match("Artist A", "Song A", uri(1))
            .with_match("Artist B", "Song B", uri(2));
        let feed = FakeFeed::new(vec![
            event("tg-a", "Artist A", "Song A"),
            event("tg-b", "Artist B", "Song B"),
        ]);

        let report = run(&config, &store, &catalog, &feed).expect("run succeeds");

        assert_eq!(report.cumulative_added, 1);
        assert_eq!(catalog.remote(CUMULATIVE_ID), vec![uri(1), uri(2)]);
        assert_eq!(
            store.playlist_membership(CUMULATIVE_ID).expect("membership"),
            vec![uri(1), uri(2)]
        );
    }

    #[test]
    fn test_cumulative_listing_failure_skips_merge() {
        let config = config(true);
        let store = DbManager::new_in_memory().expect("in-memory store");
        store
            .upsert_playlist(DAILY_ID, "Daily", PlaylistKind::Daily)
            .expect("daily record");
        let mut catalog = FakeCatalog::default()
            .with_playlist(CUMULATIVE_ID, vec![uri(1)])
            .with_match("Artist A", "Song A", uri(1));
        catalog.fail_list = Some(CUMULATIVE_ID.to_string());
        let feed = FakeFeed::new(vec![event("tg-a", "Artist A", "Song A")]);

        let report = run(&config, &store, &catalog, &feed).expect("run still succeeds");

        assert_eq!(report.daily_track_count, 1);
        assert_eq!(report.cumulative_added, 0);
        assert_eq!(report.cumulative_track_count, None);
        assert_eq!(catalog.remote(CUMULATIVE_ID), vec![uri(1)]);
    }

    #[test]
    fn test_trim_evicts_oldest_down_to_headroom() {
        let mut config = config(true);
        config.spotify.max_cumulative_tracks = 100;
        let store = DbManager::new_in_memory().expect("in-memory store");
        let remote: Vec<String> = (0..145).map(uri).collect();
        let catalog = FakeCatalog::default()
            .with_playlist(CUMULATIVE_ID, remote.clone())
            .with_match("Artist Z", "Song Z", uri(144));
        let feed = FakeFeed::new(vec![event("tg-z", "Artist Z", "Song Z")]);

        let report = run(&config, &store, &catalog, &feed).expect("run succeeds");

        assert_eq!(report.cumulative_added, 0);
        assert_eq!(report.cumulative_trimmed, 95);
        assert_eq!(report.cumulative_track_count, Some(50));
        assert_eq!(catalog.remote(CUMULATIVE_ID), remote[95..].to_vec());
        assert_eq!(
            store.playlist_membership(CUMULATIVE_ID).expect("membership"),
            remote[95..].to_vec()
        );
    }

    #[test]
    fn test_failed_trim_batch_keeps_its_tracks_cached() {
        let mut config = config(true);
        config.spotify.max_cumulative_tracks = 100;
        let store = DbManager::new_in_memory().expect("in-memory store");
        let remote: Vec<String> = (0..250).map(uri).collect();
        let mut catalog = FakeCatalog::default()
            .with_playlist(CUMULATIVE_ID, remote.clone())
            .with_match("Artist Z", "Song Z", uri(249));
        catalog.fail_remove = Some(uri(150));
        let feed = FakeFeed::new(vec![event("tg-z", "Artist Z", "Song Z")]);

        let report = run(&config, &store, &catalog, &feed).expect("run succeeds");

        // 200 evictions in two batches of 100; the batch holding 100..200 is rejected.
        assert_eq!(report.cumulative_trimmed, 100);
        assert_eq!(report.cumulative_track_count, Some(150));
        assert_eq!(catalog.remote(CUMULATIVE_ID), remote[100..].to_vec());
        assert_eq!(
            store.playlist_membership(CUMULATIVE_ID).expect("membership"),
            remote[100..].to_vec()
        );
    }

    #[test]
    fn test_run_without_resolved_tracks_leaves_playlists_alone() {
        let mut config = config(true);
        config.spotify.max_cumulative_tracks = 100;
        let store = DbManager::new_in_memory().expect("in-memory store");
        let remote: Vec<String> = (0..145).map(uri).collect();
        let catalog = FakeCatalog::default()
            .with_playlist(DAILY_ID, vec![uri(900)])
            .with_playlist(CUMULATIVE_ID, remote.clone());
        let feed = FakeFeed::new(vec![event("tg-x", "Nobody", "Nothing")]);

        let report = run(&config, &store, &catalog, &feed).expect("run succeeds");

        assert_eq!(report.resolved_tracks, 0);
        assert_eq!(report.cumulative_trimmed, 0);
        assert_eq!(report.cumulative_track_count, None);
        assert_eq!(catalog.remote(DAILY_ID), vec![uri(900)]);
        assert_eq!(catalog.remote(CUMULATIVE_ID), remote);
        assert_eq!(store.track_count(CUMULATIVE_ID).expect("count"), 145);
    }

    #[test]
    fn test_malformed_uri_is_never_appended_to_cumulative() {
        let config = config(true);
        let store = DbManager::new_in_memory().expect("in-memory store");
        let catalog = standard_catalog().with_match(
            "Artist Bad",
            "Song Bad",
            "spotify:track:bad".to_string(),
        );
        let feed = FakeFeed::new(vec![
            event("tg-a", "Artist A", "Song A"),
            event("tg-bad", "Artist Bad", "Song Bad"),
            event("tg-b", "Artist B", "Song B"),
        ]);

        let report = run(&config, &store, &catalog, &feed).expect("run succeeds");

        assert_eq!(
            catalog.remote(DAILY_ID),
            vec![uri(1), "spotify:track:bad".to_string(), uri(2)]
        );
        assert!(catalog
            .add_calls
            .borrow()
            .iter()
            .filter(|(playlist_id, _)| playlist_id == CUMULATIVE_ID)
            .all(|(_, uris)| !uris.iter().any(|uri| uri == "spotify:track:bad")));
        assert_eq!(report.cumulative_added, 2);
        assert_eq!(catalog.remote(CUMULATIVE_ID), vec![uri(901), uri(1), uri(2)]);
        assert_eq!(
            store.playlist_membership(CUMULATIVE_ID).expect("membership"),
            vec![uri(901), uri(1), uri(2)]
        );
    }

    #[test]
    fn test_daily_failure_is_fatal_and_leaves_cache_untouched() {
        let config = config(true);
        let store = DbManager::new_in_memory().expect("in-memory store");
        let mut catalog = standard_catalog();
        catalog.fail_add = Some((DAILY_ID.to_string(), uri(1)));
        let feed = FakeFeed::new(standard_events());

        let result = run(&config, &store, &catalog, &feed);

        assert!(matches!(result, Err(SyncError::DailyReplace { .. })));
        assert_eq!(
            store.playlist_membership(DAILY_ID).expect("daily membership"),
            vec![uri(900)]
        );
        assert_eq!(catalog.remote(CUMULATIVE_ID), vec![uri(901)]);
    }

    #[test]
    fn test_failed_append_batch_is_skipped() {
        let mut config = config(true);
        config.spotify.append_batch_size = 1;
        let store = DbManager::new_in_memory().expect("in-memory store");
        let mut catalog = standard_catalog();
        catalog.fail_add = Some((CUMULATIVE_ID.to_string(), uri(1)));
        let feed = FakeFeed::new(standard_events());

        let report = run(&config, &store, &catalog, &feed).expect("run succeeds");

        assert_eq!(report.cumulative_added, 1);
        assert_eq!(catalog.remote(CUMULATIVE_ID), vec![uri(901), uri(2)]);
        assert_eq!(
            store.playlist_membership(CUMULATIVE_ID).expect("membership"),
            vec![uri(901), uri(2)]
        );
    }

    #[test]
    fn test_empty_window_changes_nothing() {
        let config = config(true);
        let store = DbManager::new_in_memory().expect("in-memory store");
        let catalog = standard_catalog();
        let feed = FakeFeed::new(Vec::new());

        let report = run(&config, &store, &catalog, &feed).expect("run succeeds");

        assert_eq!(report.events_fetched, 0);
        assert_eq!(catalog.remote(DAILY_ID), vec![uri(900)]);
        assert_eq!(catalog.searches.get(), 0);
    }

    #[test]
    fn test_fatal_remote_failures() {
        let config = config(false);
        let store = DbManager::new_in_memory().expect("in-memory store");
        let catalog = FakeCatalog {
            fail_auth: true,
            ..FakeCatalog::default()
        };
        let feed = FakeFeed::new(standard_events());
        assert!(matches!(
            run(&config, &store, &catalog, &feed),
            Err(SyncError::Authenticate(_))
        ));

        let catalog = FakeCatalog {
            fail_list: Some(DAILY_ID.to_string()),
            ..FakeCatalog::default()
        };
        assert!(matches!(
            run(&config, &store, &catalog, &feed),
            Err(SyncError::Bootstrap { .. })
        ));

        let catalog = FakeCatalog::default();
        let mut feed = FakeFeed::new(Vec::new());
        feed.fail = true;
        assert!(matches!(
            run(&config, &store, &catalog, &feed),
            Err(SyncError::SourceFetch(_))
        ));
    }

    #[test]
    fn test_rotated_refresh_token_is_exposed() {
        let config = config(false);
        let store = DbManager::new_in_memory().expect("in-memory store");
        let catalog = FakeCatalog {
            rotate_to: Some("new-refresh".to_string()),
            ..FakeCatalog::default()
        };
        let feed = FakeFeed::new(Vec::new());

        let mut manager = PlaylistManager::new(&config, &store, &catalog, &feed, credentials());
        manager
            .run_at(Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap())
            .expect("run succeeds");

        assert_eq!(manager.rotated_refresh_token(), Some("new-refresh"));
    }
}
