//! Configuration module for the signal monitor.
//!
//! Loads configuration from environment variables with sensible defaults.

use chrono_tz::Tz;
use std::env;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the admin API (default: 3001)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "signal-monitor.db")
    pub db_path: String,
    /// Time between poll cycles (default: 30s)
    pub poll_interval: Duration,
    /// Consecutive failing observations before a channel is confirmed down (default: 3)
    pub fail_threshold: u32,
    /// Upper bound on one source fetch (default: 15s)
    pub sampler_timeout: Duration,
    /// Upper bound on one notification send (default: 10s)
    pub notify_timeout: Duration,
    /// Timezone used for times shown in notifications (default: America/Sao_Paulo)
    pub display_timezone: Tz,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 3001,
            db_path: "signal-monitor.db".to_string(),
            poll_interval: Duration::from_secs(30),
            fail_threshold: 3,
            sampler_timeout: Duration::from_secs(15),
            notify_timeout: Duration::from_secs(10),
            display_timezone: chrono_tz::America::Sao_Paulo,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SIGNAL_MONITOR_HTTP_PORT`: HTTP port (default: 3001)
    /// - `SIGNAL_MONITOR_DB_PATH`: Database file path (default: "signal-monitor.db")
    /// - `SIGNAL_MONITOR_POLL_INTERVAL_SECS`: Poll interval in seconds (default: 30)
    /// - `SIGNAL_MONITOR_FAIL_THRESHOLD`: Confirmation threshold, at least 1 (default: 3)
    /// - `SIGNAL_MONITOR_SAMPLER_TIMEOUT_SECS`: Fetch timeout in seconds (default: 15)
    /// - `SIGNAL_MONITOR_NOTIFY_TIMEOUT_SECS`: Notification send timeout in seconds (default: 10)
    /// - `SIGNAL_MONITOR_DISPLAY_TIMEZONE`: IANA timezone name (default: America/Sao_Paulo)
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = parse_var(&lookup, "SIGNAL_MONITOR_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("SIGNAL_MONITOR_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "SIGNAL_MONITOR_POLL_INTERVAL_SECS") {
            if secs > 0 {
                cfg.poll_interval = Duration::from_secs(secs);
            } else {
                tracing::warn!("Config: SIGNAL_MONITOR_POLL_INTERVAL_SECS must be positive, keeping default");
            }
        }

        if let Some(threshold) = parse_var::<u32, _>(&lookup, "SIGNAL_MONITOR_FAIL_THRESHOLD") {
            cfg.fail_threshold = threshold.max(1);
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "SIGNAL_MONITOR_SAMPLER_TIMEOUT_SECS") {
            if secs > 0 {
                cfg.sampler_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "SIGNAL_MONITOR_NOTIFY_TIMEOUT_SECS") {
            if secs > 0 {
                cfg.notify_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(tz) = parse_var(&lookup, "SIGNAL_MONITOR_DISPLAY_TIMEZONE") {
            cfg.display_timezone = tz;
        }

        cfg
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Config: ignoring invalid value {:?} for {}", raw, key);
            None
        }
    }
}
