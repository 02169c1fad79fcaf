//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::ledger;
use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Timestamps are stored as sortable UTC text so range filters can compare strings.
const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] refinery::Error),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("Not found")]
    NotFound,
    #[error("database lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
///
/// All access goes through one connection behind a mutex, so writes for the
/// same channel never interleave.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// A write transaction scoped to [`Store::transaction`].
pub struct StoreTx<'a> {
    tx: Transaction<'a>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Run embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        let report = embedded::migrations::runner().run(&mut *conn)?;
        for migration in report.applied_migrations() {
            tracing::info!("Applied migration {}", migration);
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Run `f` inside a single transaction. Commits only if `f` succeeds;
    /// any error rolls back every write made through the [`StoreTx`].
    pub fn transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<T, DbError>,
    {
        let mut conn = self.conn()?;
        let store_tx = StoreTx {
            tx: conn.transaction()?,
        };
        let out = f(&store_tx)?;
        store_tx.tx.commit()?;
        Ok(out)
    }

    // --- Sources ---

    /// Insert a new source. The id is supplied by the caller.
    pub fn add_source(&self, source: &Source) -> Result<(), DbError> {
        let maintenance = serde_json::to_string(&source.maintenance)
            .map_err(|e| DbError::InvalidData(e.to_string()))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sources (id, name, base_url, username, password, active, maintenance, exclude_pattern, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                source.id,
                source.name,
                source.base_url,
                source.username,
                source.password,
                source.active,
                maintenance,
                source.exclude_pattern,
                format_db_time(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Update an existing source.
    pub fn update_source(&self, source: &Source) -> Result<(), DbError> {
        let maintenance = serde_json::to_string(&source.maintenance)
            .map_err(|e| DbError::InvalidData(e.to_string()))?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sources SET name=?1, base_url=?2, username=?3, password=?4, active=?5, maintenance=?6, exclude_pattern=?7
             WHERE id=?8",
            params![
                source.name,
                source.base_url,
                source.username,
                source.password,
                source.active,
                maintenance,
                source.exclude_pattern,
                source.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all sources.
    pub fn get_sources(&self) -> Result<Vec<Source>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, base_url, username, password, active, maintenance, exclude_pattern
             FROM sources ORDER BY created_at ASC, id ASC",
        )?;
        let sources = stmt
            .query_map([], source_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(sources)
    }

    /// Get the sources the scheduler should poll.
    pub fn get_active_sources(&self) -> Result<Vec<Source>, DbError> {
        Ok(self.get_sources()?.into_iter().filter(|s| s.active).collect())
    }

    /// Get a source by id.
    pub fn get_source(&self, id: &str) -> Result<Source, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, base_url, username, password, active, maintenance, exclude_pattern
             FROM sources WHERE id = ?1",
            params![id],
            source_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a source together with everything recorded for it.
    pub fn delete_source(&self, id: &str) -> Result<(), DbError> {
        self.transaction(|tx| {
            tx.tx.execute("DELETE FROM outage_events WHERE source_id = ?1", params![id])?;
            tx.tx.execute("DELETE FROM channel_status WHERE source_id = ?1", params![id])?;
            tx.tx.execute("DELETE FROM monitored_channels WHERE source_id = ?1", params![id])?;
            tx.tx.execute("DELETE FROM sources WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    // --- Monitored channels ---

    /// Register channels not seen before for this source (enabled) and refresh
    /// the names of known ones. Returns how many channels were new.
    pub fn discover_channels(
        &self,
        source_id: &str,
        observations: &[ChannelObservation],
        now: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        if observations.is_empty() {
            return Ok(0);
        }

        self.transaction(|tx| {
            let mut discovered = 0;
            let mut insert = tx.tx.prepare(
                "INSERT OR IGNORE INTO monitored_channels (source_id, channel_id, channel_name, enabled, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
            )?;
            let mut rename = tx.tx.prepare(
                "UPDATE monitored_channels SET channel_name = ?3, updated_at = ?4
                 WHERE source_id = ?1 AND channel_id = ?2 AND channel_name <> ?3",
            )?;
            let now = format_db_time(now);

            for obs in observations {
                let inserted = insert.execute(params![source_id, obs.channel_id, obs.channel_name, now])?;
                if inserted > 0 {
                    discovered += 1;
                } else {
                    rename.execute(params![source_id, obs.channel_id, obs.channel_name, now])?;
                }
            }
            Ok(discovered)
        })
    }

    /// Get the channel inventory of a source.
    pub fn get_monitored_channels(&self, source_id: &str) -> Result<Vec<MonitoredChannel>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source_id, channel_id, channel_name, enabled, updated_at
             FROM monitored_channels WHERE source_id = ?1 ORDER BY channel_name ASC",
        )?;
        let channels = stmt
            .query_map(params![source_id], |row| {
                Ok(MonitoredChannel {
                    source_id: row.get(0)?,
                    channel_id: row.get(1)?,
                    channel_name: row.get(2)?,
                    enabled: row.get(3)?,
                    updated_at: time_column(row, 4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(channels)
    }

    /// Switch monitoring of one channel on or off.
    pub fn set_channel_enabled(&self, source_id: &str, channel_id: &str, enabled: bool) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE monitored_channels SET enabled = ?3, updated_at = ?4 WHERE source_id = ?1 AND channel_id = ?2",
            params![source_id, channel_id, enabled, format_db_time(Utc::now())],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Channel status ---

    /// Get the status record of one channel.
    pub fn get_status(&self, channel_id: &str, source_id: &str) -> Result<Option<ChannelStatusRecord>, DbError> {
        let conn = self.conn()?;
        select_status(&conn, channel_id, source_id)
    }

    /// Get status records, optionally restricted to one source.
    pub fn get_statuses(&self, source_id: Option<&str>) -> Result<Vec<ChannelStatusRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT channel_id, source_id, channel_name, status, fail_count, is_down, down_since,
                    online_since, offline_since, last_check_at, updated_at
             FROM channel_status WHERE (?1 IS NULL OR source_id = ?1)
             ORDER BY source_id ASC, channel_name ASC",
        )?;
        let records = stmt
            .query_map(params![source_id], status_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }

    // --- Notification destinations ---

    /// Add a destination and return its id.
    pub fn add_destination(&self, destination: &mut Destination) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notification_destinations (kind, config) VALUES (?1, ?2)",
            params![destination.kind, destination.config.to_string()],
        )?;
        destination.id = conn.last_insert_rowid();
        Ok(destination.id)
    }

    /// Get all destinations.
    pub fn get_destinations(&self) -> Result<Vec<Destination>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, kind, config FROM notification_destinations ORDER BY id ASC")?;
        let destinations = stmt
            .query_map([], |row| {
                let raw: String = row.get(2)?;
                let config = serde_json::from_str(&raw).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
                })?;
                Ok(Destination {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    config,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(destinations)
    }

    /// Delete a destination.
    pub fn delete_destination(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM notification_destinations WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Settings ---

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, DbError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

impl StoreTx<'_> {
    pub fn get_status(&self, channel_id: &str, source_id: &str) -> Result<Option<ChannelStatusRecord>, DbError> {
        select_status(&self.tx, channel_id, source_id)
    }

    /// Overwrite the full record. Transition logic never lives in SQL.
    pub fn upsert_status(&self, record: &ChannelStatusRecord) -> Result<(), DbError> {
        write_status(&self.tx, record)
    }

    pub fn find_open_outage(&self, channel_id: &str, source_id: &str) -> Result<Option<OutageEvent>, DbError> {
        ledger::find_open_outage(&self.tx, channel_id, source_id)
    }

    pub fn open_outage(
        &self,
        channel_id: &str,
        channel_name: &str,
        source_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        ledger::open_outage(&self.tx, channel_id, channel_name, source_id, started_at)
    }

    pub fn close_outage(
        &self,
        channel_id: &str,
        source_id: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<OutageEvent>, DbError> {
        ledger::close_outage(&self.tx, channel_id, source_id, ended_at)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.tx
    }
}

pub(crate) fn select_status(
    conn: &Connection,
    channel_id: &str,
    source_id: &str,
) -> Result<Option<ChannelStatusRecord>, DbError> {
    Ok(conn
        .query_row(
            "SELECT channel_id, source_id, channel_name, status, fail_count, is_down, down_since,
                    online_since, offline_since, last_check_at, updated_at
             FROM channel_status WHERE channel_id = ?1 AND source_id = ?2",
            params![channel_id, source_id],
            status_from_row,
        )
        .optional()?)
}

fn write_status(conn: &Connection, r: &ChannelStatusRecord) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO channel_status (channel_id, source_id, channel_name, status, fail_count, is_down, down_since,
                                     online_since, offline_since, last_check_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(channel_id, source_id) DO UPDATE SET
            channel_name = excluded.channel_name,
            status = excluded.status,
            fail_count = excluded.fail_count,
            is_down = excluded.is_down,
            down_since = excluded.down_since,
            online_since = excluded.online_since,
            offline_since = excluded.offline_since,
            last_check_at = excluded.last_check_at,
            updated_at = excluded.updated_at",
        params![
            r.channel_id,
            r.source_id,
            r.channel_name,
            r.status,
            r.fail_count,
            r.is_down,
            r.down_since.map(format_db_time),
            r.online_since.map(format_db_time),
            r.offline_since.map(format_db_time),
            format_db_time(r.last_check_at),
            format_db_time(r.updated_at),
        ],
    )?;
    Ok(())
}

fn status_from_row(row: &Row<'_>) -> SqlResult<ChannelStatusRecord> {
    Ok(ChannelStatusRecord {
        channel_id: row.get(0)?,
        source_id: row.get(1)?,
        channel_name: row.get(2)?,
        status: row.get(3)?,
        fail_count: row.get(4)?,
        is_down: row.get(5)?,
        down_since: opt_time_column(row, 6)?,
        online_since: opt_time_column(row, 7)?,
        offline_since: opt_time_column(row, 8)?,
        last_check_at: time_column(row, 9)?,
        updated_at: time_column(row, 10)?,
    })
}

fn source_from_row(row: &Row<'_>) -> SqlResult<Source> {
    let raw: String = row.get(6)?;
    let maintenance = if raw.trim().is_empty() {
        MaintenanceWindow::default()
    } else {
        serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?
    };

    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        username: row.get(3)?,
        password: row.get(4)?,
        active: row.get(5)?,
        maintenance,
        exclude_pattern: row.get(7)?,
    })
}

pub(crate) fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format(DB_TIME_FORMAT).to_string()
}

pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("bad timestamp: {}", raw).into(),
        )
    })
}

pub(crate) fn opt_time_column(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(_) => time_column(row, idx).map(Some),
        None => Ok(None),
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    /// A store on a fresh temp file. Keep the file handle alive for the test.
    pub(crate) fn temp_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    pub(crate) fn sample_source(id: &str) -> Source {
        Source {
            id: id.to_string(),
            name: format!("Server {}", id),
            base_url: "http://127.0.0.1:8089".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            active: true,
            maintenance: MaintenanceWindow::default(),
            exclude_pattern: None,
        }
    }

    fn observation(channel_id: &str, name: &str) -> ChannelObservation {
        ChannelObservation {
            source_id: "s1".to_string(),
            channel_id: channel_id.to_string(),
            channel_name: name.to_string(),
            status: ChannelState::Online,
        }
    }

    #[test]
    fn test_source_crud() {
        let (_tmp, store) = temp_store();

        let mut source = sample_source("s1");
        source.maintenance.enabled = true;
        source.exclude_pattern = Some("^Radio".to_string());
        store.add_source(&source).unwrap();

        let fetched = store.get_source("s1").unwrap();
        assert_eq!(fetched.name, "Server s1");
        assert!(fetched.maintenance.enabled);
        assert_eq!(fetched.exclude_pattern.as_deref(), Some("^Radio"));

        let mut updated = fetched;
        updated.active = false;
        store.update_source(&updated).unwrap();
        assert!(store.get_active_sources().unwrap().is_empty());
        assert_eq!(store.get_sources().unwrap().len(), 1);

        store.delete_source("s1").unwrap();
        assert!(matches!(store.get_source("s1"), Err(DbError::NotFound)));
        assert!(matches!(store.update_source(&updated), Err(DbError::NotFound)));
    }

    #[test]
    fn test_discover_channels() {
        let (_tmp, store) = temp_store();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        let first = vec![observation("1", "News"), observation("2", "Sports")];
        assert_eq!(store.discover_channels("s1", &first, now).unwrap(), 2);

        store.set_channel_enabled("s1", "2", false).unwrap();

        let second = vec![observation("2", "Sports HD"), observation("3", "Movies")];
        assert_eq!(store.discover_channels("s1", &second, now).unwrap(), 1);

        let channels = store.get_monitored_channels("s1").unwrap();
        assert_eq!(channels.len(), 3);
        let sports = channels.iter().find(|c| c.channel_id == "2").unwrap();
        assert_eq!(sports.channel_name, "Sports HD");
        assert!(!sports.enabled, "rediscovery must not re-enable a channel");

        assert!(matches!(
            store.set_channel_enabled("s1", "99", true),
            Err(DbError::NotFound)
        ));
    }

    #[test]
    fn test_status_upsert_overwrites() {
        let (_tmp, store) = temp_store();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        let mut record = ChannelStatusRecord {
            channel_id: "c1".to_string(),
            source_id: "s1".to_string(),
            channel_name: "News".to_string(),
            status: ChannelState::Offline,
            fail_count: 1,
            is_down: false,
            down_since: None,
            online_since: None,
            offline_since: Some(t0),
            last_check_at: t0,
            updated_at: t0,
        };
        store.transaction(|tx| tx.upsert_status(&record)).unwrap();

        record.fail_count = 3;
        record.is_down = true;
        record.down_since = Some(t0);
        store.transaction(|tx| tx.upsert_status(&record)).unwrap();

        let fetched = store.get_status("c1", "s1").unwrap().unwrap();
        assert_eq!(fetched, record);
        assert_eq!(store.get_statuses(Some("s1")).unwrap().len(), 1);
        assert!(store.get_statuses(Some("other")).unwrap().is_empty());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let (_tmp, store) = temp_store();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        let result: Result<(), DbError> = store.transaction(|tx| {
            tx.open_outage("c1", "News", "s1", t0)?;
            Err(DbError::InvalidData("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(store.transaction(|tx| tx.find_open_outage("c1", "s1")).unwrap().is_none());
    }

    #[test]
    fn test_destinations_and_settings() {
        let (_tmp, store) = temp_store();

        let mut dest = Destination {
            id: 0,
            kind: "telegram".to_string(),
            config: serde_json::json!({"bot_token": "t", "chat_id": "42"}),
        };
        let id = store.add_destination(&mut dest).unwrap();
        assert!(id > 0);
        let all = store.get_destinations().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].config["chat_id"], "42");
        store.delete_destination(id).unwrap();
        assert!(store.get_destinations().unwrap().is_empty());

        assert_eq!(store.get_setting("template.down").unwrap(), None);
        store.set_setting("template.down", "a").unwrap();
        store.set_setting("template.down", "b").unwrap();
        assert_eq!(store.get_setting("template.down").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_parse_db_time() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_db_time(&format_db_time(dt)), Some(dt));
        assert_eq!(parse_db_time("2024-01-02T03:04:05Z"), Some(dt));
        assert_eq!(parse_db_time("garbage"), None);
    }
}
