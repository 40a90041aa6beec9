//! The embedded relational catalog store: archives, base
//! backups, tablespaces, streams, backup profiles, retention policies,
//! connections, and worker-process rows, all multiplexed through one
//! `rusqlite` connection with one transaction per write.

use camino::Utf8PathBuf;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::config::CompressionKind;

/// The schema version this build of the crate expects, stored as
/// `PRAGMA user_version`, a magic number identifying the schema shape.
const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog schema version {found} does not match expected {expected}")]
    SchemaMismatch { found: i64, expected: i64 },
    #[error("row not found: {0}")]
    RowNotFound(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("catalog opened in the wrong mode for this operation")]
    WrongOpenMode,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRow {
    pub id: i64,
    pub name: String,
    pub directory: Utf8PathBuf,
    pub compression: CompressionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    InProgress,
    AwaitingWal,
    Ready,
    Aborted,
}

impl BackupStatus {
    fn as_str(self) -> &'static str {
        match self {
            BackupStatus::InProgress => "in-progress",
            BackupStatus::AwaitingWal => "awaiting-wal",
            BackupStatus::Ready => "ready",
            BackupStatus::Aborted => "aborted",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "in-progress" => BackupStatus::InProgress,
            "awaiting-wal" => BackupStatus::AwaitingWal,
            "ready" => BackupStatus::Ready,
            "aborted" => BackupStatus::Aborted,
            other => return Err(CatalogError::Integrity(format!("unknown backup status {other:?}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRow {
    pub id: i64,
    pub archive_id: i64,
    pub xlogpos: u64,
    pub xlogposend: Option<u64>,
    pub timeline: u32,
    pub label: String,
    pub fsentry: Utf8PathBuf,
    pub started: i64,
    pub stopped: Option<i64>,
    pub pinned: bool,
    pub status: BackupStatus,
    pub systemid: i64,
    pub wal_segment_size: u64,
    pub used_profile: Option<String>,
    pub pg_version_num: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Identified,
    Streaming,
    Shutdown,
    Failed,
    TimelineSwitch,
}

impl StreamStatus {
    fn as_str(self) -> &'static str {
        match self {
            StreamStatus::Identified => "identified",
            StreamStatus::Streaming => "streaming",
            StreamStatus::Shutdown => "shutdown",
            StreamStatus::Failed => "failed",
            StreamStatus::TimelineSwitch => "timeline-switch",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "identified" => StreamStatus::Identified,
            "streaming" => StreamStatus::Streaming,
            "shutdown" => StreamStatus::Shutdown,
            "failed" => StreamStatus::Failed,
            "timeline-switch" => StreamStatus::TimelineSwitch,
            other => return Err(CatalogError::Integrity(format!("unknown stream status {other:?}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRow {
    pub id: i64,
    pub archive_id: i64,
    pub slot_name: Option<String>,
    pub systemid: i64,
    pub timeline: u32,
    pub xlogpos: u64,
    pub status: StreamStatus,
    pub register_date: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablespaceRow {
    pub backup_id: i64,
    pub spcoid: u32,
    pub spclocation: String,
    pub spcsize: u64,
}

/// An embedded relational catalog store over a single SQLite file.
pub struct Catalog {
    conn: Connection,
    mode: OpenMode,
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS archive (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    directory TEXT NOT NULL,
    compression TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backup (
    id INTEGER PRIMARY KEY,
    archive_id INTEGER NOT NULL REFERENCES archive(id),
    xlogpos INTEGER NOT NULL,
    xlogposend INTEGER,
    timeline INTEGER NOT NULL,
    label TEXT NOT NULL,
    fsentry TEXT NOT NULL,
    started INTEGER NOT NULL,
    stopped INTEGER,
    pinned INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    systemid INTEGER NOT NULL,
    wal_segment_size INTEGER NOT NULL,
    used_profile TEXT,
    pg_version_num INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS stream (
    id INTEGER PRIMARY KEY,
    archive_id INTEGER NOT NULL REFERENCES archive(id),
    stype TEXT NOT NULL DEFAULT 'physical',
    slot_name TEXT,
    systemid INTEGER NOT NULL,
    timeline INTEGER NOT NULL,
    xlogpos INTEGER NOT NULL,
    dbname TEXT,
    status TEXT NOT NULL,
    register_date INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS backup_profiles (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    compression TEXT NOT NULL,
    max_rate INTEGER,
    label_template TEXT,
    fast_checkpoint INTEGER NOT NULL DEFAULT 0,
    include_wal INTEGER NOT NULL DEFAULT 0,
    wait_for_wal INTEGER NOT NULL DEFAULT 0,
    verify_checksums INTEGER NOT NULL DEFAULT 0,
    manifest INTEGER NOT NULL DEFAULT 0,
    manifest_checksum_algorithm TEXT
);

CREATE TABLE IF NOT EXISTS backup_tablespaces (
    backup_id INTEGER NOT NULL REFERENCES backup(id),
    spcoid INTEGER NOT NULL,
    spclocation TEXT NOT NULL,
    spcsize INTEGER NOT NULL,
    PRIMARY KEY (backup_id, spcoid)
);

CREATE TABLE IF NOT EXISTS procs (
    pid INTEGER PRIMARY KEY,
    archive_id INTEGER NOT NULL REFERENCES archive(id),
    type TEXT NOT NULL,
    started INTEGER NOT NULL,
    state TEXT NOT NULL,
    shm_key INTEGER,
    shm_id INTEGER
);

CREATE TABLE IF NOT EXISTS connections (
    archive_id INTEGER NOT NULL REFERENCES archive(id),
    type TEXT NOT NULL,
    dsn TEXT,
    pghost TEXT,
    pgport INTEGER,
    pguser TEXT,
    pgdatabase TEXT
);

CREATE TABLE IF NOT EXISTS retention (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS retention_rules (
    retention_id INTEGER NOT NULL REFERENCES retention(id),
    type TEXT NOT NULL,
    value TEXT
);
"#;

impl Catalog {
    /// Opens (creating if necessary, in `ReadWrite` mode) the catalog at
    /// `path` and ensures the schema exists at the expected version.
    pub fn open(path: &Utf8PathBuf, mode: OpenMode) -> Result<Self> {
        let conn = match mode {
            OpenMode::ReadWrite => Connection::open(path.as_std_path())?,
            OpenMode::ReadOnly => Connection::open_with_flags(
                path.as_std_path(),
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
            )?,
        };
        let catalog = Catalog { conn, mode };
        if mode == OpenMode::ReadWrite {
            catalog.init_schema()?;
        } else {
            catalog.check_schema_version()?;
        }
        Ok(catalog)
    }

    fn init_schema(&self) -> Result<()> {
        let version: i64 = self.conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version == 0 {
            self.conn.execute_batch(SCHEMA_SQL)?;
            self.conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
        } else if version != SCHEMA_VERSION {
            return Err(CatalogError::SchemaMismatch { found: version, expected: SCHEMA_VERSION });
        }
        Ok(())
    }

    fn check_schema_version(&self) -> Result<()> {
        let version: i64 = self.conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version != SCHEMA_VERSION {
            return Err(CatalogError::SchemaMismatch { found: version, expected: SCHEMA_VERSION });
        }
        Ok(())
    }

    fn require_read_write(&self) -> Result<()> {
        if self.mode != OpenMode::ReadWrite {
            return Err(CatalogError::WrongOpenMode);
        }
        Ok(())
    }

    // -- archives --------------------------------------------------------

    pub fn exists_by_name(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM archive WHERE name = ?1",
            params![name],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn create_archive(&mut self, name: &str, directory: &Utf8PathBuf, compression: CompressionKind) -> Result<i64> {
        self.require_read_write()?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO archive (name, directory, compression) VALUES (?1, ?2, ?3)",
            params![name, directory.as_str(), compression_str(compression)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Unregisters an archive. Rejected if any backup row
    /// under it is still referenced by a running worker — callers are
    /// expected to check `worker_registry` themselves and pass
    /// `force = false` in the normal path; this method only enforces the
    /// catalog-visible half of the invariant (no non-terminal backups).
    pub fn drop_archive(&mut self, archive_id: i64) -> Result<()> {
        self.require_read_write()?;
        let tx = self.conn.transaction()?;
        let in_flight: i64 = tx.query_row(
            "SELECT COUNT(*) FROM backup WHERE archive_id = ?1 AND status = 'in-progress'",
            params![archive_id],
            |r| r.get(0),
        )?;
        if in_flight > 0 {
            return Err(CatalogError::Integrity(format!(
                "archive {archive_id} has {in_flight} in-progress backups"
            )));
        }
        tx.execute("DELETE FROM connections WHERE archive_id = ?1", params![archive_id])?;
        tx.execute("DELETE FROM archive WHERE id = ?1", params![archive_id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_archive_by_name(&self, name: &str) -> Result<ArchiveRow> {
        self.conn
            .query_row(
                "SELECT id, name, directory, compression FROM archive WHERE name = ?1",
                params![name],
                row_to_archive,
            )
            .optional()?
            .ok_or_else(|| CatalogError::RowNotFound(format!("archive {name:?}")))?
    }

    // -- backups -----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn begin_backup(
        &mut self,
        archive_id: i64,
        label: &str,
        xlogpos: u64,
        timeline: u32,
        fsentry: &Utf8PathBuf,
        started: i64,
        systemid: i64,
        wal_segment_size: u64,
        used_profile: Option<&str>,
        pg_version_num: i32,
    ) -> Result<i64> {
        self.require_read_write()?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO backup (archive_id, xlogpos, xlogposend, timeline, label, fsentry, started, stopped, \
             pinned, status, systemid, wal_segment_size, used_profile, pg_version_num) \
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, NULL, 0, ?7, ?8, ?9, ?10, ?11)",
            params![
                archive_id,
                xlogpos as i64,
                timeline,
                label,
                fsentry.as_str(),
                started,
                BackupStatus::InProgress.as_str(),
                systemid,
                wal_segment_size as i64,
                used_profile,
                pg_version_num,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Transitions a backup to `ready` (or, if `wait_for_wal` applies, to
    /// `awaiting-wal`), per the Open Question resolution in DESIGN.md.
    pub fn finish_backup(&mut self, backup_id: i64, xlogposend: u64, stopped: i64, wait_for_wal: bool) -> Result<()> {
        self.require_read_write()?;
        let tx = self.conn.transaction()?;
        let status = if wait_for_wal { BackupStatus::AwaitingWal } else { BackupStatus::Ready };
        let changed = tx.execute(
            "UPDATE backup SET xlogposend = ?1, stopped = ?2, status = ?3 \
             WHERE id = ?4 AND status = 'in-progress'",
            params![xlogposend as i64, stopped, status.as_str(), backup_id],
        )?;
        if changed == 0 {
            return Err(CatalogError::Integrity(format!(
                "backup {backup_id} was not in-progress when finish_backup was called"
            )));
        }
        tx.commit()?;
        Ok(())
    }

    /// Resolves an `awaiting-wal` backup to `ready` once the WAL Streamer
    /// has reported a flush position ≥ the backup's `xlogposend`.
    pub fn wal_streamer_flushed_upto(&mut self, archive_id: i64, flushed: u64) -> Result<Vec<i64>> {
        self.require_read_write()?;
        let tx = self.conn.transaction()?;
        let mut resolved = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id FROM backup WHERE archive_id = ?1 AND status = 'awaiting-wal' AND xlogposend <= ?2",
            )?;
            let mut rows = stmt.query(params![archive_id, flushed as i64])?;
            while let Some(row) = rows.next()? {
                resolved.push(row.get::<_, i64>(0)?);
            }
        }
        for id in &resolved {
            tx.execute(
                "UPDATE backup SET status = 'ready' WHERE id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(resolved)
    }

    pub fn abort_backup(&mut self, backup_id: i64, stopped: i64) -> Result<()> {
        self.require_read_write()?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE backup SET status = 'aborted', stopped = ?1 WHERE id = ?2",
            params![stopped, backup_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_pinned(&mut self, backup_id: i64, pinned: bool) -> Result<()> {
        self.require_read_write()?;
        self.conn.execute(
            "UPDATE backup SET pinned = ?1 WHERE id = ?2",
            params![pinned as i64, backup_id],
        )?;
        Ok(())
    }

    pub fn delete_backup(&mut self, backup_id: i64) -> Result<()> {
        self.require_read_write()?;
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM backup_tablespaces WHERE backup_id = ?1", params![backup_id])?;
        tx.execute("DELETE FROM backup WHERE id = ?1", params![backup_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Lists backups for an archive, newest-first, matching the ordering
    /// the Retention Engine expects.
    pub fn backup_list(&self, archive_id: i64) -> Result<Vec<BackupRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, archive_id, xlogpos, xlogposend, timeline, label, fsentry, started, stopped, \
             pinned, status, systemid, wal_segment_size, used_profile, pg_version_num \
             FROM backup WHERE archive_id = ?1 ORDER BY started DESC",
        )?;
        let rows = stmt.query_map(params![archive_id], row_to_backup)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<Result<Vec<_>>>()
    }

    pub fn get_backup(&self, backup_id: i64) -> Result<BackupRow> {
        self.conn
            .query_row(
                "SELECT id, archive_id, xlogpos, xlogposend, timeline, label, fsentry, started, stopped, \
                 pinned, status, systemid, wal_segment_size, used_profile, pg_version_num \
                 FROM backup WHERE id = ?1",
                params![backup_id],
                row_to_backup,
            )
            .optional()?
            .ok_or_else(|| CatalogError::RowNotFound(format!("backup {backup_id}")))?
    }

    pub fn add_tablespace(&mut self, row: &TablespaceRow) -> Result<()> {
        self.require_read_write()?;
        self.conn.execute(
            "INSERT INTO backup_tablespaces (backup_id, spcoid, spclocation, spcsize) VALUES (?1, ?2, ?3, ?4)",
            params![row.backup_id, row.spcoid, row.spclocation, row.spcsize as i64],
        )?;
        Ok(())
    }

    // -- streams -----------------------------------------------------------

    pub fn register_stream(
        &mut self,
        archive_id: i64,
        slot_name: Option<&str>,
        systemid: i64,
        timeline: u32,
        xlogpos: u64,
        register_date: i64,
    ) -> Result<i64> {
        self.require_read_write()?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO stream (archive_id, slot_name, systemid, timeline, xlogpos, status, register_date) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                archive_id,
                slot_name,
                systemid,
                timeline,
                xlogpos as i64,
                StreamStatus::Identified.as_str(),
                register_date
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn set_stream_status(&mut self, stream_id: i64, status: StreamStatus) -> Result<()> {
        self.require_read_write()?;
        self.conn.execute(
            "UPDATE stream SET status = ?1 WHERE id = ?2",
            params![status.as_str(), stream_id],
        )?;
        Ok(())
    }

    pub fn update_stream_position(&mut self, stream_id: i64, timeline: u32, xlogpos: u64) -> Result<()> {
        self.require_read_write()?;
        self.conn.execute(
            "UPDATE stream SET timeline = ?1, xlogpos = ?2 WHERE id = ?3",
            params![timeline, xlogpos as i64, stream_id],
        )?;
        Ok(())
    }

    pub fn get_stream(&self, stream_id: i64) -> Result<StreamRow> {
        self.conn
            .query_row(
                "SELECT id, archive_id, slot_name, systemid, timeline, xlogpos, status, register_date \
                 FROM stream WHERE id = ?1",
                params![stream_id],
                row_to_stream,
            )
            .optional()?
            .ok_or_else(|| CatalogError::RowNotFound(format!("stream {stream_id}")))?
    }
}

fn compression_str(c: CompressionKind) -> &'static str {
    match c {
        CompressionKind::None => "none",
        CompressionKind::Gzip => "gzip",
    }
}

fn compression_from_str(s: &str) -> Result<CompressionKind> {
    Ok(match s {
        "none" => CompressionKind::None,
        "gzip" => CompressionKind::Gzip,
        other => return Err(CatalogError::Integrity(format!("unknown compression kind {other:?}"))),
    })
}

fn row_to_archive(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ArchiveRow>> {
    let compression: String = row.get(3)?;
    Ok((|| {
        Ok(ArchiveRow {
            id: row.get(0)?,
            name: row.get(1)?,
            directory: Utf8PathBuf::from(row.get::<_, String>(2)?),
            compression: compression_from_str(&compression)?,
        })
    })())
}

fn row_to_backup(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<BackupRow>> {
    let status: String = row.get(10)?;
    Ok((|| {
        Ok(BackupRow {
            id: row.get(0)?,
            archive_id: row.get(1)?,
            xlogpos: row.get::<_, i64>(2)? as u64,
            xlogposend: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
            timeline: row.get(4)?,
            label: row.get(5)?,
            fsentry: Utf8PathBuf::from(row.get::<_, String>(6)?),
            started: row.get(7)?,
            stopped: row.get(8)?,
            pinned: row.get::<_, i64>(9)? != 0,
            status: BackupStatus::parse(&status)?,
            systemid: row.get(11)?,
            wal_segment_size: row.get::<_, i64>(12)? as u64,
            used_profile: row.get(13)?,
            pg_version_num: row.get(14)?,
        })
    })())
}

fn row_to_stream(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<StreamRow>> {
    let status: String = row.get(6)?;
    Ok((|| {
        Ok(StreamRow {
            id: row.get(0)?,
            archive_id: row.get(1)?,
            slot_name: row.get(2)?,
            systemid: row.get(3)?,
            timeline: row.get(4)?,
            xlogpos: row.get::<_, i64>(5)? as u64,
            status: StreamStatus::parse(&status)?,
            register_date: row.get(7)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    fn open_test_catalog() -> (camino_tempfile::Utf8TempDir, Catalog) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.sqlite").to_owned();
        let catalog = Catalog::open(&path, OpenMode::ReadWrite).unwrap();
        (dir, catalog)
    }

    #[test]
    fn create_archive_then_exists_by_name() {
        let (_dir, mut catalog) = open_test_catalog();
        assert!(!catalog.exists_by_name("main").unwrap());
        catalog
            .create_archive("main", &Utf8PathBuf::from("/var/lib/pgarc/main"), CompressionKind::None)
            .unwrap();
        assert!(catalog.exists_by_name("main").unwrap());
    }

    #[test]
    fn drop_archive_rejects_in_progress_backups() {
        let (_dir, mut catalog) = open_test_catalog();
        let archive_id = catalog
            .create_archive("main", &Utf8PathBuf::from("/var/lib/pgarc/main"), CompressionKind::None)
            .unwrap();
        catalog
            .begin_backup(archive_id, "b1", 0, 1, &Utf8PathBuf::from("/x"), 0, 42, 16 * 1024 * 1024, None, 150000)
            .unwrap();
        let err = catalog.drop_archive(archive_id).unwrap_err();
        assert!(matches!(err, CatalogError::Integrity(_)));
    }

    #[test]
    fn backup_lifecycle_monotonic_to_ready() {
        let (_dir, mut catalog) = open_test_catalog();
        let archive_id = catalog
            .create_archive("main", &Utf8PathBuf::from("/var/lib/pgarc/main"), CompressionKind::None)
            .unwrap();
        let backup_id = catalog
            .begin_backup(archive_id, "b1", 0, 1, &Utf8PathBuf::from("/x"), 100, 42, 16 * 1024 * 1024, None, 150000)
            .unwrap();
        catalog.finish_backup(backup_id, 1000, 200, false).unwrap();
        let row = catalog.get_backup(backup_id).unwrap();
        assert_eq!(row.status, BackupStatus::Ready);
        assert_eq!(row.xlogposend, Some(1000));
    }

    #[test]
    fn wait_for_wal_backup_becomes_ready_only_after_flush_reported() {
        let (_dir, mut catalog) = open_test_catalog();
        let archive_id = catalog
            .create_archive("main", &Utf8PathBuf::from("/var/lib/pgarc/main"), CompressionKind::None)
            .unwrap();
        let backup_id = catalog
            .begin_backup(archive_id, "b1", 0, 1, &Utf8PathBuf::from("/x"), 100, 42, 16 * 1024 * 1024, None, 150000)
            .unwrap();
        catalog.finish_backup(backup_id, 1000, 200, true).unwrap();
        assert_eq!(catalog.get_backup(backup_id).unwrap().status, BackupStatus::AwaitingWal);

        let resolved = catalog.wal_streamer_flushed_upto(archive_id, 500).unwrap();
        assert!(resolved.is_empty());
        assert_eq!(catalog.get_backup(backup_id).unwrap().status, BackupStatus::AwaitingWal);

        let resolved = catalog.wal_streamer_flushed_upto(archive_id, 1000).unwrap();
        assert_eq!(resolved, vec![backup_id]);
        assert_eq!(catalog.get_backup(backup_id).unwrap().status, BackupStatus::Ready);
    }

    #[test]
    fn pinned_backup_flag_round_trips() {
        let (_dir, mut catalog) = open_test_catalog();
        let archive_id = catalog
            .create_archive("main", &Utf8PathBuf::from("/var/lib/pgarc/main"), CompressionKind::None)
            .unwrap();
        let backup_id = catalog
            .begin_backup(archive_id, "b1", 0, 1, &Utf8PathBuf::from("/x"), 100, 42, 16 * 1024 * 1024, None, 150000)
            .unwrap();
        catalog.set_pinned(backup_id, true).unwrap();
        assert!(catalog.get_backup(backup_id).unwrap().pinned);
    }

    #[test]
    fn backup_list_is_newest_first() {
        let (_dir, mut catalog) = open_test_catalog();
        let archive_id = catalog
            .create_archive("main", &Utf8PathBuf::from("/var/lib/pgarc/main"), CompressionKind::None)
            .unwrap();
        let _b1 = catalog
            .begin_backup(archive_id, "b1", 0, 1, &Utf8PathBuf::from("/x"), 100, 42, 16 * 1024 * 1024, None, 150000)
            .unwrap();
        let b2 = catalog
            .begin_backup(archive_id, "b2", 0, 1, &Utf8PathBuf::from("/x"), 200, 42, 16 * 1024 * 1024, None, 150000)
            .unwrap();
        let list = catalog.backup_list(archive_id).unwrap();
        assert_eq!(list[0].id, b2);
    }

    #[test]
    fn reopening_mismatched_schema_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.sqlite").to_owned();
        {
            let catalog = Catalog::open(&path, OpenMode::ReadWrite).unwrap();
            catalog.conn.execute_batch("PRAGMA user_version = 999").unwrap();
        }
        let err = Catalog::open(&path, OpenMode::ReadWrite).unwrap_err();
        assert!(matches!(err, CatalogError::SchemaMismatch { found: 999, expected: SCHEMA_VERSION }));
    }
}
