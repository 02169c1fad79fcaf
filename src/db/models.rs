//! Database model types.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Raw liveness reported by a sampler for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Online,
    Offline,
    Degraded,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Online => "online",
            ChannelState::Offline => "offline",
            ChannelState::Degraded => "degraded",
        }
    }

    /// Offline and degraded both count as failing.
    pub fn is_online(&self) -> bool {
        matches!(self, ChannelState::Online)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(ChannelState::Online),
            "offline" => Ok(ChannelState::Offline),
            "degraded" => Ok(ChannelState::Degraded),
            other => Err(format!("unknown channel state: {}", other)),
        }
    }
}

impl ToSql for ChannelState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ChannelState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// One channel as seen by a sampler during a single tick. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelObservation {
    pub source_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub status: ChannelState,
}

/// Current debounce state of one `(channel_id, source_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatusRecord {
    pub channel_id: String,
    pub source_id: String,
    pub channel_name: String,
    pub status: ChannelState,
    /// Consecutive failing observations since the last online one.
    pub fail_count: u32,
    pub is_down: bool,
    pub down_since: Option<DateTime<Utc>>,
    pub online_since: Option<DateTime<Utc>>,
    pub offline_since: Option<DateTime<Utc>>,
    pub last_check_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A confirmed outage interval. Open while `ended_at` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutageEvent {
    pub id: i64,
    pub channel_id: String,
    pub channel_name: String,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl OutageEvent {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Recurring silence window attached to a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceWindow {
    pub enabled: bool,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    /// 0 = Sunday .. 6 = Saturday. Empty means every day.
    pub days_of_week: Vec<u8>,
    pub timezone: Tz,
    pub silence_down: bool,
    pub silence_up: bool,
}

impl Default for MaintenanceWindow {
    fn default() -> Self {
        Self {
            enabled: false,
            start_time: NaiveTime::MIN,
            end_time: NaiveTime::MIN,
            days_of_week: Vec::new(),
            timezone: Tz::UTC,
            silence_down: true,
            silence_up: true,
        }
    }
}

/// `HH:MM` (or `HH:MM:SS`) wall-clock times.
mod hhmm {
    use chrono::{NaiveTime, Timelike};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Seconds are written only when set, so stored windows round-trip.
    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        let format = if time.second() == 0 { "%H:%M" } else { "%H:%M:%S" };
        s.serialize_str(&time.format(format).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M"))
            .map_err(serde::de::Error::custom)
    }
}

/// A monitored upstream server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub maintenance: MaintenanceWindow,
    /// Channels whose name matches this regex are never monitored.
    #[serde(default)]
    pub exclude_pattern: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Per-source channel inventory with its monitoring switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoredChannel {
    pub source_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// A configured notification destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    #[serde(default)]
    pub id: i64,
    pub kind: String,
    pub config: serde_json::Value,
}

/// Filters for outage history queries. All bounds apply to `started_at`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutageFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub source_id: Option<String>,
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelOutageCount {
    pub channel_id: String,
    pub source_id: String,
    pub channel_name: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelDowntime {
    pub channel_id: String,
    pub source_id: String,
    pub channel_name: String,
    pub downtime_seconds: i64,
}

/// Outage rows plus rollups over the whole filtered set.
#[derive(Debug, Clone, Serialize)]
pub struct OutageReport {
    pub events: Vec<OutageEvent>,
    pub total_count: i64,
    pub total_downtime_seconds: i64,
    pub open_count: i64,
    pub top_by_count: Vec<ChannelOutageCount>,
    pub top_by_downtime: Vec<ChannelDowntime>,
}

/// Which records a history reset touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetScope {
    All,
    Source(String),
}

impl ResetScope {
    /// `"all"` selects everything, anything else is a source id.
    /// Blank input names no scope and is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "" => None,
            "all" => Some(ResetScope::All),
            id => Some(ResetScope::Source(id.to_string())),
        }
    }
}

impl fmt::Display for ResetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetScope::All => f.write_str("all"),
            ResetScope::Source(id) => write!(f, "source={}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ResetCounts {
    pub outage_events: usize,
    pub channel_status: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_state_parse() {
        assert_eq!("ONLINE".parse::<ChannelState>().unwrap(), ChannelState::Online);
        assert_eq!("degraded".parse::<ChannelState>().unwrap(), ChannelState::Degraded);
        assert!("stopped".parse::<ChannelState>().is_err());
        assert!(!ChannelState::Degraded.is_online());
    }

    #[test]
    fn test_maintenance_window_json() {
        let window: MaintenanceWindow = serde_json::from_str(
            r#"{"enabled":true,"start_time":"23:00","end_time":"05:00","days_of_week":[0,6],"timezone":"America/Sao_Paulo","silence_up":false}"#,
        )
        .unwrap();
        assert!(window.enabled);
        assert_eq!(window.start_time, NaiveTime::from_hms_opt(23, 0, 0).unwrap());
        assert_eq!(window.timezone, chrono_tz::America::Sao_Paulo);
        assert!(window.silence_down);
        assert!(!window.silence_up);

        let json = serde_json::to_value(&window).unwrap();
        assert_eq!(json["end_time"], "05:00");
    }

    #[test]
    fn test_maintenance_window_keeps_seconds() {
        let window: MaintenanceWindow =
            serde_json::from_str(r#"{"enabled":true,"start_time":"22:15:30","end_time":"06:00"}"#).unwrap();
        assert_eq!(window.start_time, NaiveTime::from_hms_opt(22, 15, 30).unwrap());

        let stored = serde_json::to_string(&window).unwrap();
        let reloaded: MaintenanceWindow = serde_json::from_str(&stored).unwrap();
        assert_eq!(reloaded.start_time, window.start_time);
        assert_eq!(serde_json::to_value(&reloaded).unwrap()["start_time"], "22:15:30");
    }

    #[test]
    fn test_reset_scope_parse() {
        assert_eq!(ResetScope::parse("all"), Some(ResetScope::All));
        assert_eq!(ResetScope::parse(" s1 "), Some(ResetScope::Source("s1".to_string())));
        assert_eq!(ResetScope::parse(""), None);
        assert_eq!(ResetScope::parse("   "), None);
    }
}
