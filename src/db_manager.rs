//! SQLite cache of track resolutions and managed playlist membership.
//!
//! The cache owns three relations: `playlists`, `tracks` (external id to
//! catalog uri mappings, including negative results) and `playlist_tracks`
//! (ordered membership). Every mutating call runs in its own transaction.

use std::collections::HashSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::protocol::{
    search_key, AppendEntry, CacheLookup, CacheStats, CatalogTrack, MembershipEntry,
    PlaylistKind, PlaylistRecord, RemotePlaylistTrack, TrackMapping,
};

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;
const REMOTE_SEED_ID_PREFIX: &str = "remote:";

/// Failure raised by the cache store. Callers treat it as fatal.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to prepare cache directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Persistent cache store.
pub struct DbManager {
    conn: Connection,
}

impl DbManager {
    /// Opens (and creates if needed) the cache database at `path`.
    pub fn new(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(path)?;
        let db_manager = Self { conn };
        db_manager.initialize_schema()?;
        Ok(db_manager)
    }

    /// Opens a throwaway in-memory cache.
    pub fn new_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let db_manager = Self { conn };
        db_manager.initialize_schema()?;
        Ok(db_manager)
    }

    fn initialize_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS playlists (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                last_synced_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tracks (
                external_id TEXT PRIMARY KEY,
                external_artist TEXT NOT NULL,
                external_title TEXT NOT NULL,
                catalog_uri TEXT,
                catalog_artist TEXT,
                catalog_title TEXT,
                catalog_album TEXT,
                search_key TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS playlist_tracks (
                playlist_id TEXT NOT NULL,
                external_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                added_at INTEGER NOT NULL,
                PRIMARY KEY (playlist_id, external_id),
                FOREIGN KEY (playlist_id) REFERENCES playlists (id),
                FOREIGN KEY (external_id) REFERENCES tracks (external_id)
            );
            CREATE INDEX IF NOT EXISTS idx_tracks_search_key ON tracks (search_key);
            CREATE INDEX IF NOT EXISTS idx_tracks_catalog_uri ON tracks (catalog_uri);
            CREATE INDEX IF NOT EXISTS idx_playlist_tracks_playlist ON playlist_tracks (playlist_id);",
        )?;
        Ok(())
    }

    /// Looks up a cached resolution. Any hit refreshes `last_seen_at`.
    pub fn lookup(&self, external_id: &str) -> Result<CacheLookup, StorageError> {
        let cached: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT catalog_uri FROM tracks WHERE external_id = ?1",
                params![external_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(catalog_uri) = cached else {
            return Ok(CacheLookup::Miss);
        };
        self.conn.execute(
            "UPDATE tracks SET last_seen_at = ?1 WHERE external_id = ?2",
            params![now_unix_ms(), external_id],
        )?;
        Ok(match catalog_uri {
            Some(uri) => CacheLookup::Found(uri),
            None => CacheLookup::NotFound,
        })
    }

    /// Upserts the outcome of a resolution attempt. `None` records a negative result.
    pub fn record(
        &self,
        external_id: &str,
        external_artist: &str,
        external_title: &str,
        catalog: Option<&CatalogTrack>,
    ) -> Result<(), StorageError> {
        let now = now_unix_ms();
        self.conn.execute(
            "INSERT INTO tracks (
                external_id, external_artist, external_title, catalog_uri, catalog_artist,
                catalog_title, catalog_album, search_key, created_at, last_seen_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT (external_id) DO UPDATE SET
                external_artist = excluded.external_artist,
                external_title = excluded.external_title,
                catalog_uri = excluded.catalog_uri,
                catalog_artist = excluded.catalog_artist,
                catalog_title = excluded.catalog_title,
                catalog_album = excluded.catalog_album,
                search_key = excluded.search_key,
                created_at = excluded.created_at,
                last_seen_at = excluded.last_seen_at",
            params![
                external_id,
                external_artist,
                external_title,
                catalog.map(|track| track.uri.as_str()),
                catalog.map(|track| track.artist.as_str()),
                catalog.map(|track| track.title.as_str()),
                catalog.map(|track| track.album.as_str()),
                search_key(external_artist, external_title),
                now,
            ],
        )?;
        Ok(())
    }

    /// Returns the full mapping row for an external id.
    pub fn mapping(&self, external_id: &str) -> Result<Option<TrackMapping>, StorageError> {
        let mapping = self
            .conn
            .query_row(
                "SELECT external_id, external_artist, external_title, catalog_uri, catalog_artist,
                        catalog_title, catalog_album, search_key, created_at, last_seen_at
                 FROM tracks WHERE external_id = ?1",
                params![external_id],
                Self::mapping_from_row,
            )
            .optional()?;
        Ok(mapping)
    }

    fn mapping_from_row(row: &Row<'_>) -> rusqlite::Result<TrackMapping> {
        Ok(TrackMapping {
            external_id: row.get(0)?,
            external_artist: row.get(1)?,
            external_title: row.get(2)?,
            catalog_uri: row.get(3)?,
            catalog_artist: row.get(4)?,
            catalog_title: row.get(5)?,
            catalog_album: row.get(6)?,
            search_key: row.get(7)?,
            created_at_unix_ms: row.get(8)?,
            last_seen_at_unix_ms: row.get(9)?,
        })
    }

    /// Creates `remote:<uri>` mappings for remote tracks no mapping resolves to yet.
    ///
    /// Existing mappings for a uri are never touched. Returns the number of
    /// mappings created.
    pub fn seed_remote_tracks(&self, tracks: &[RemotePlaylistTrack]) -> Result<usize, StorageError> {
        let now = now_unix_ms();
        let tx = self.conn.unchecked_transaction()?;
        let mut seeded = 0usize;
        {
            let mut known = tx.prepare("SELECT 1 FROM tracks WHERE catalog_uri = ?1 LIMIT 1")?;
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO tracks (
                    external_id, external_artist, external_title, catalog_uri, catalog_artist,
                    catalog_title, catalog_album, search_key, created_at, last_seen_at
                ) VALUES (?1, ?2, ?3, ?4, ?2, ?3, ?5, ?6, ?7, ?7)",
            )?;
            for remote in tracks {
                let track = &remote.track;
                if known.exists(params![track.uri])? {
                    continue;
                }
                seeded += insert.execute(params![
                    format!("{REMOTE_SEED_ID_PREFIX}{}", track.uri),
                    track.artist,
                    track.title,
                    track.uri,
                    track.album,
                    search_key(&track.artist, &track.title),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        if seeded > 0 {
            debug!("Cache: seeded {} mappings from remote playlist data", seeded);
        }
        Ok(seeded)
    }

    /// Inserts or updates a managed playlist record and stamps `last_synced_at`.
    pub fn upsert_playlist(
        &self,
        playlist_id: &str,
        display_name: &str,
        kind: PlaylistKind,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO playlists (id, name, kind, last_synced_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                last_synced_at = excluded.last_synced_at",
            params![playlist_id, display_name, kind.as_str(), now_unix_ms()],
        )?;
        Ok(())
    }

    /// Returns the cached record for a playlist, if any.
    pub fn playlist_record(&self, playlist_id: &str) -> Result<Option<PlaylistRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, name, kind, last_synced_at FROM playlists WHERE id = ?1",
                params![playlist_id],
                |row| {
                    let kind: String = row.get(2)?;
                    Ok((row.get(0)?, row.get(1)?, kind, row.get(3)?))
                },
            )
            .optional()?;
        Ok(record.and_then(|(playlist_id, display_name, kind, last_synced_at_unix_ms)| {
            PlaylistKind::from_stored(&kind).map(|kind| PlaylistRecord {
                playlist_id,
                display_name,
                kind,
                last_synced_at_unix_ms,
            })
        }))
    }

    /// Number of managed playlists known to the cache.
    pub fn playlist_count(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM playlists", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Catalog uris of a playlist, ordered by position.
    pub fn playlist_membership(&self, playlist_id: &str) -> Result<Vec<String>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT t.catalog_uri
             FROM playlist_tracks pt
             JOIN tracks t ON t.external_id = pt.external_id
             WHERE pt.playlist_id = ?1 AND t.catalog_uri IS NOT NULL
             ORDER BY pt.position ASC",
        )?;
        let uris = stmt.query_map(params![playlist_id], |row| row.get::<_, String>(0))?;
        let mut membership = Vec::new();
        for uri in uris {
            membership.push(uri?);
        }
        Ok(membership)
    }

    /// Atomically rewrites a playlist's membership in the given order.
    ///
    /// Uris without a resolved mapping are skipped, as are repeats of a uri
    /// already written. Returns the number of rows written.
    pub fn replace_membership(
        &self,
        playlist_id: &str,
        entries: &[MembershipEntry],
    ) -> Result<usize, StorageError> {
        let now = now_unix_ms();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM playlist_tracks WHERE playlist_id = ?1",
            params![playlist_id],
        )?;
        let mut position: i64 = 0;
        {
            let mut find_mapping = tx.prepare(
                "SELECT external_id FROM tracks
                 WHERE catalog_uri = ?1
                 ORDER BY created_at ASC, external_id ASC
                 LIMIT 1",
            )?;
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO playlist_tracks (playlist_id, external_id, position, added_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entry in entries {
                let external_id: Option<String> = find_mapping
                    .query_row(params![entry.uri], |row| row.get(0))
                    .optional()?;
                let Some(external_id) = external_id else {
                    debug!(
                        "Cache: skipping unmapped uri {} for playlist {}",
                        entry.uri, playlist_id
                    );
                    continue;
                };
                let inserted = insert.execute(params![
                    playlist_id,
                    external_id,
                    position,
                    entry.added_at_unix_ms.unwrap_or(now),
                ])?;
                if inserted > 0 {
                    position += 1;
                }
            }
        }
        tx.commit()?;
        Ok(position as usize)
    }

    /// Appends memberships after the current last position.
    ///
    /// Pairs already present are left as they are, and ids without a
    /// resolved mapping are skipped. Returns the number of rows appended.
    pub fn append_membership(
        &self,
        playlist_id: &str,
        entries: &[AppendEntry],
    ) -> Result<usize, StorageError> {
        let now = now_unix_ms();
        let tx = self.conn.unchecked_transaction()?;
        let max_position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), -1) FROM playlist_tracks WHERE playlist_id = ?1",
            params![playlist_id],
            |row| row.get(0),
        )?;
        let mut next_position = max_position + 1;
        let mut appended = 0usize;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO playlist_tracks (playlist_id, external_id, position, added_at)
                 SELECT ?1, external_id, ?3, ?4 FROM tracks
                 WHERE external_id = ?2 AND catalog_uri IS NOT NULL",
            )?;
            for entry in entries {
                let inserted = insert.execute(params![
                    playlist_id,
                    entry.external_id,
                    next_position,
                    entry.added_at_unix_ms.unwrap_or(now),
                ])?;
                if inserted > 0 {
                    next_position += 1;
                    appended += 1;
                }
            }
        }
        tx.commit()?;
        Ok(appended)
    }

    /// Number of membership rows for a playlist.
    pub fn track_count(&self, playlist_id: &str) -> Result<usize, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM playlist_tracks WHERE playlist_id = ?1",
            params![playlist_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// The `limit` oldest uris of a playlist by `(added_at, position)`.
    pub fn oldest(&self, playlist_id: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT t.catalog_uri
             FROM playlist_tracks pt
             JOIN tracks t ON t.external_id = pt.external_id
             WHERE pt.playlist_id = ?1 AND t.catalog_uri IS NOT NULL
             ORDER BY pt.added_at ASC, pt.position ASC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let uris = stmt.query_map(params![playlist_id, limit], |row| row.get::<_, String>(0))?;
        let mut oldest = Vec::new();
        for uri in uris {
            oldest.push(uri?);
        }
        Ok(oldest)
    }

    /// Deletes memberships whose mapping resolves to one of `uris`, then
    /// renumbers the remaining positions from 0. Returns rows removed.
    pub fn remove_membership(
        &self,
        playlist_id: &str,
        uris: &HashSet<String>,
    ) -> Result<usize, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut removed = 0usize;
        {
            let mut delete = tx.prepare(
                "DELETE FROM playlist_tracks
                 WHERE playlist_id = ?1
                 AND external_id IN (SELECT external_id FROM tracks WHERE catalog_uri = ?2)",
            )?;
            for uri in uris {
                removed += delete.execute(params![playlist_id, uri])?;
            }
        }
        if removed > 0 {
            Self::compact_positions(&tx, playlist_id)?;
        }
        tx.commit()?;
        Ok(removed)
    }

    fn compact_positions(conn: &Connection, playlist_id: &str) -> Result<(), StorageError> {
        let mut select = conn.prepare(
            "SELECT external_id FROM playlist_tracks WHERE playlist_id = ?1 ORDER BY position ASC",
        )?;
        let ids = select.query_map(params![playlist_id], |row| row.get::<_, String>(0))?;
        let mut ordered = Vec::new();
        for id in ids {
            ordered.push(id?);
        }
        let mut update = conn.prepare(
            "UPDATE playlist_tracks SET position = ?1 WHERE playlist_id = ?2 AND external_id = ?3",
        )?;
        for (position, external_id) in ordered.iter().enumerate() {
            update.execute(params![position as i64, playlist_id, external_id])?;
        }
        Ok(())
    }

    /// Aggregate counters over the whole cache.
    pub fn stats(&self) -> Result<CacheStats, StorageError> {
        let count = |sql: &str| -> Result<usize, StorageError> {
            let value: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(value as usize)
        };
        Ok(CacheStats {
            resolved_count: count("SELECT COUNT(*) FROM tracks WHERE catalog_uri IS NOT NULL")?,
            unresolved_count: count("SELECT COUNT(*) FROM tracks WHERE catalog_uri IS NULL")?,
            playlist_count: count("SELECT COUNT(*) FROM playlists")?,
            total_membership_count: count("SELECT COUNT(*) FROM playlist_tracks")?,
        })
    }

    /// Deletes negative results not seen for more than `max_age_days`.
    /// Resolved mappings are never evicted.
    pub fn evict_stale(&self, max_age_days: u32) -> Result<usize, StorageError> {
        let cutoff = now_unix_ms() - i64::from(max_age_days) * MS_PER_DAY;
        let deleted = self.conn.execute(
            "DELETE FROM tracks WHERE catalog_uri IS NULL AND last_seen_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}
