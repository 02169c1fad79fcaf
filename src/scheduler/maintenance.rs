//! Maintenance windows: recurring per-source silence periods.

use chrono::{DateTime, Datelike, NaiveTime, Utc};

use super::engine::ChannelEvent;
use crate::db::{MaintenanceWindow, Source};

impl MaintenanceWindow {
    /// Whether the window covers `now`, evaluated in the window's timezone.
    ///
    /// `start > end` wraps past midnight. `start == end` is an empty window.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }

        let local = now.with_timezone(&self.timezone);
        if !self.days_of_week.is_empty() {
            let weekday = local.weekday().num_days_from_sunday() as u8;
            if !self.days_of_week.contains(&weekday) {
                return false;
            }
        }

        covers(self.start_time, self.end_time, local.time())
    }
}

fn covers(start: NaiveTime, end: NaiveTime, t: NaiveTime) -> bool {
    if start < end {
        start <= t && t < end
    } else if start > end {
        t >= start || t < end
    } else {
        false
    }
}

/// Whether `source` is inside its maintenance window at `now`.
pub fn in_window(source: &Source, now: DateTime<Utc>) -> bool {
    source.maintenance.is_active_at(now)
}

/// Events dropped by [`filter_events`], per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Suppressed {
    pub down: usize,
    pub recovered: usize,
}

/// Drop one source's events for this tick according to its window.
///
/// The decision is all-or-nothing per direction: an active window with
/// `silence_down` drops every down event, with `silence_up` every recovery.
pub fn filter_events(
    source: &Source,
    events: Vec<ChannelEvent>,
    now: DateTime<Utc>,
) -> (Vec<ChannelEvent>, Suppressed) {
    let mut suppressed = Suppressed::default();
    if events.is_empty() || !in_window(source, now) {
        return (events, suppressed);
    }

    let window = &source.maintenance;
    let kept: Vec<ChannelEvent> = events
        .into_iter()
        .filter(|event| {
            let silenced = if event.is_down() {
                window.silence_down
            } else {
                window.silence_up
            };
            if silenced {
                if event.is_down() {
                    suppressed.down += 1;
                } else {
                    suppressed.recovered += 1;
                }
            }
            !silenced
        })
        .collect();

    if suppressed != Suppressed::default() {
        tracing::info!(
            "Maintenance: source=\"{}\" suppressed {} down and {} recovered notifications",
            source.name,
            suppressed.down,
            suppressed.recovered
        );
    }

    (kept, suppressed)
}
