//! Outage ledger: append-only history of confirmed outages.
//!
//! Rows are opened when a channel is confirmed down and closed when it
//! recovers. Double opens and double closes are silent no-ops.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row, ToSql};

use super::models::*;
use super::store::{format_db_time, opt_time_column, time_column, DbError, Store};

/// Default row limit for history queries.
pub const DEFAULT_QUERY_LIMIT: usize = 500;

const TOP_CHANNELS: i64 = 10;

const FILTER_CLAUSE: &str = "(?1 IS NULL OR o.started_at >= ?1)
      AND (?2 IS NULL OR o.started_at < ?2)
      AND (?3 IS NULL OR o.source_id = ?3)
      AND (?4 IS NULL OR o.channel_id = ?4)";

pub(crate) fn find_open_outage(
    conn: &Connection,
    channel_id: &str,
    source_id: &str,
) -> Result<Option<OutageEvent>, DbError> {
    Ok(conn
        .query_row(
            "SELECT id, channel_id, channel_name, source_id, started_at, ended_at, duration_seconds
             FROM outage_events
             WHERE channel_id = ?1 AND source_id = ?2 AND ended_at IS NULL
             ORDER BY id ASC LIMIT 1",
            params![channel_id, source_id],
            outage_from_row,
        )
        .optional()?)
}

/// Open an outage row. Returns `false` without writing if one is already open.
pub(crate) fn open_outage(
    conn: &Connection,
    channel_id: &str,
    channel_name: &str,
    source_id: &str,
    started_at: DateTime<Utc>,
) -> Result<bool, DbError> {
    if find_open_outage(conn, channel_id, source_id)?.is_some() {
        tracing::debug!(
            "Ledger: outage already open for channel={} source={}, skipping",
            channel_id,
            source_id
        );
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO outage_events (channel_id, channel_name, source_id, started_at) VALUES (?1, ?2, ?3, ?4)",
        params![channel_id, channel_name, source_id, format_db_time(started_at)],
    )?;
    Ok(true)
}

/// Close the open outage row for the pair and return it, or `None` if nothing
/// was open. Duration is whole seconds, truncated.
pub(crate) fn close_outage(
    conn: &Connection,
    channel_id: &str,
    source_id: &str,
    ended_at: DateTime<Utc>,
) -> Result<Option<OutageEvent>, DbError> {
    let Some(mut open) = find_open_outage(conn, channel_id, source_id)? else {
        tracing::debug!(
            "Ledger: no open outage for channel={} source={}, nothing to close",
            channel_id,
            source_id
        );
        return Ok(None);
    };

    let duration = (ended_at - open.started_at).num_seconds().max(0);
    conn.execute(
        "UPDATE outage_events SET ended_at = ?1, duration_seconds = ?2 WHERE id = ?3",
        params![format_db_time(ended_at), duration, open.id],
    )?;

    open.ended_at = Some(ended_at);
    open.duration_seconds = Some(duration);
    Ok(Some(open))
}

fn query_report(conn: &Connection, filter: &OutageFilter, limit: usize) -> Result<OutageReport, DbError> {
    let start = filter.start.map(format_db_time);
    let end = filter.end.map(format_db_time);
    let filter_values: [&dyn ToSql; 4] = [&start, &end, &filter.source_id, &filter.channel_id];
    let filter_params = &filter_values[..];

    let mut stmt = conn.prepare(&format!(
        "SELECT o.id, o.channel_id, o.channel_name, o.source_id, o.started_at, o.ended_at, o.duration_seconds
         FROM outage_events o WHERE {FILTER_CLAUSE}
         ORDER BY o.started_at DESC, o.id DESC LIMIT ?5"
    ))?;
    let events = stmt
        .query_map(
            params![start, end, filter.source_id, filter.channel_id, limit as i64],
            outage_from_row,
        )?
        .collect::<SqlResult<Vec<_>>>()?;

    let (total_count, total_downtime_seconds, open_count) = conn.query_row(
        &format!(
            "SELECT COUNT(*),
                    COALESCE(SUM(o.duration_seconds), 0),
                    COALESCE(SUM(CASE WHEN o.ended_at IS NULL THEN 1 ELSE 0 END), 0)
             FROM outage_events o WHERE {FILTER_CLAUSE}"
        ),
        filter_params,
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    // Ties go to the channel whose first outage was recorded earliest.
    let mut stmt = conn.prepare(&format!(
        "SELECT o.channel_id, o.source_id, {LATEST_NAME}, COUNT(*) AS cnt, MIN(o.id) AS first_id
         FROM outage_events o WHERE {FILTER_CLAUSE}
         GROUP BY o.channel_id, o.source_id
         ORDER BY cnt DESC, first_id ASC LIMIT {TOP_CHANNELS}"
    ))?;
    let top_by_count = stmt
        .query_map(filter_params, |row| {
            Ok(ChannelOutageCount {
                channel_id: row.get(0)?,
                source_id: row.get(1)?,
                channel_name: row.get(2)?,
                count: row.get(3)?,
            })
        })?
        .collect::<SqlResult<Vec<_>>>()?;

    let mut stmt = conn.prepare(&format!(
        "SELECT o.channel_id, o.source_id, {LATEST_NAME}, SUM(COALESCE(o.duration_seconds, 0)) AS total, MIN(o.id) AS first_id
         FROM outage_events o WHERE {FILTER_CLAUSE}
         GROUP BY o.channel_id, o.source_id
         HAVING total > 0
         ORDER BY total DESC, first_id ASC LIMIT {TOP_CHANNELS}"
    ))?;
    let top_by_downtime = stmt
        .query_map(filter_params, |row| {
            Ok(ChannelDowntime {
                channel_id: row.get(0)?,
                source_id: row.get(1)?,
                channel_name: row.get(2)?,
                downtime_seconds: row.get(3)?,
            })
        })?
        .collect::<SqlResult<Vec<_>>>()?;

    Ok(OutageReport {
        events,
        total_count,
        total_downtime_seconds,
        open_count,
        top_by_count,
        top_by_downtime,
    })
}

/// Most recent name recorded for the grouped pair.
const LATEST_NAME: &str = "(SELECT l.channel_name FROM outage_events l
      WHERE l.channel_id = o.channel_id AND l.source_id = o.source_id
      ORDER BY l.id DESC LIMIT 1)";

fn count_history(conn: &Connection, scope: &ResetScope) -> Result<ResetCounts, DbError> {
    let count = |table: &str| -> Result<usize, DbError> {
        let n: i64 = match scope {
            ResetScope::All => conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?,
            ResetScope::Source(id) => conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE source_id = ?1"),
                params![id],
                |r| r.get(0),
            )?,
        };
        Ok(n as usize)
    };

    Ok(ResetCounts {
        outage_events: count("outage_events")?,
        channel_status: count("channel_status")?,
    })
}

fn delete_history(conn: &Connection, scope: &ResetScope) -> Result<ResetCounts, DbError> {
    let delete = |table: &str| -> Result<usize, DbError> {
        let n = match scope {
            ResetScope::All => conn.execute(&format!("DELETE FROM {table}"), [])?,
            ResetScope::Source(id) => {
                conn.execute(&format!("DELETE FROM {table} WHERE source_id = ?1"), params![id])?
            }
        };
        Ok(n)
    };

    Ok(ResetCounts {
        outage_events: delete("outage_events")?,
        channel_status: delete("channel_status")?,
    })
}

fn outage_from_row(row: &Row<'_>) -> SqlResult<OutageEvent> {
    Ok(OutageEvent {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        channel_name: row.get(2)?,
        source_id: row.get(3)?,
        started_at: time_column(row, 4)?,
        ended_at: opt_time_column(row, 5)?,
        duration_seconds: row.get(6)?,
    })
}

impl Store {
    /// Open an outage outside of a tick transaction. No-op if one is open.
    pub fn open_outage(
        &self,
        channel_id: &str,
        channel_name: &str,
        source_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let conn = self.conn()?;
        open_outage(&conn, channel_id, channel_name, source_id, started_at)
    }

    /// Close the open outage for the pair. No-op if none is open.
    pub fn close_outage(
        &self,
        channel_id: &str,
        source_id: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<OutageEvent>, DbError> {
        let conn = self.conn()?;
        close_outage(&conn, channel_id, source_id, ended_at)
    }

    /// Query outage history, newest first, with rollups over the filtered set.
    pub fn query_outages(&self, filter: &OutageFilter, limit: Option<usize>) -> Result<OutageReport, DbError> {
        let conn = self.conn()?;
        query_report(&conn, filter, limit.unwrap_or(DEFAULT_QUERY_LIMIT))
    }

    /// Count what [`Store::reset_history`] would delete.
    pub fn count_history(&self, scope: &ResetScope) -> Result<ResetCounts, DbError> {
        let conn = self.conn()?;
        count_history(&conn, scope)
    }

    /// Irreversibly delete outage and status rows in scope.
    ///
    /// Callers are responsible for confirming intent before calling this.
    pub fn reset_history(&self, scope: &ResetScope) -> Result<ResetCounts, DbError> {
        let counts = self.transaction(|tx| delete_history(tx.connection(), scope))?;
        tracing::warn!(
            "History reset: scope={} outage_events={} channel_status={}",
            scope,
            counts.outage_events,
            counts.channel_status
        );
        Ok(counts)
    }
}
