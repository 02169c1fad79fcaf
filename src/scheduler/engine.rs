//! Debounce engine: turns raw per-tick observations into confirmed
//! down / recovered transitions.
//!
//! A channel is confirmed down only after `fail_threshold` consecutive failing
//! observations (offline and degraded count the same). Confirmation opens an
//! outage in the ledger and emits one `Down` event; the first online
//! observation afterwards closes it and emits one `Recovered` event. Streaks
//! that end before the threshold emit nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{ChannelObservation, ChannelState, ChannelStatusRecord, DbError, Source, Store};

/// Identifies the channel an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelRef {
    pub channel_id: String,
    pub channel_name: String,
    pub source_id: String,
    pub source_name: String,
}

/// A confirmed transition, emitted at most once per outage in each direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    Down {
        channel: ChannelRef,
        down_since: DateTime<Utc>,
    },
    Recovered {
        channel: ChannelRef,
        down_since: DateTime<Utc>,
        downtime_seconds: i64,
    },
}

impl ChannelEvent {
    pub fn channel(&self) -> &ChannelRef {
        match self {
            ChannelEvent::Down { channel, .. } | ChannelEvent::Recovered { channel, .. } => channel,
        }
    }

    pub fn is_down(&self) -> bool {
        matches!(self, ChannelEvent::Down { .. })
    }
}

/// What a single observation did to the confirmed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    ConfirmedDown,
    Recovered { down_since: DateTime<Utc> },
}

/// Result of evaluating one observation against the prior record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub record: ChannelStatusRecord,
    pub signal: Option<Signal>,
}

/// Applies the consecutive-failure rule.
#[derive(Debug, Clone, Copy)]
pub struct DebounceEngine {
    fail_threshold: u32,
}

impl DebounceEngine {
    /// `fail_threshold` below 1 is treated as 1.
    pub fn new(fail_threshold: u32) -> Self {
        Self {
            fail_threshold: fail_threshold.max(1),
        }
    }

    pub fn fail_threshold(&self) -> u32 {
        self.fail_threshold
    }

    /// Compute the next record for one observation. Pure: no I/O.
    pub fn evaluate(
        &self,
        obs: &ChannelObservation,
        prior: Option<&ChannelStatusRecord>,
        now: DateTime<Utc>,
    ) -> Transition {
        let was_online = prior.map(|p| p.status.is_online());
        let mut record = match prior {
            Some(p) => ChannelStatusRecord {
                channel_name: obs.channel_name.clone(),
                status: obs.status,
                last_check_at: now,
                updated_at: now,
                ..p.clone()
            },
            None => ChannelStatusRecord {
                channel_id: obs.channel_id.clone(),
                source_id: obs.source_id.clone(),
                channel_name: obs.channel_name.clone(),
                status: obs.status,
                fail_count: 0,
                is_down: false,
                down_since: None,
                online_since: None,
                offline_since: None,
                last_check_at: now,
                updated_at: now,
            },
        };

        let mut signal = None;

        if obs.status.is_online() {
            if record.is_down {
                signal = Some(Signal::Recovered {
                    down_since: record.down_since.unwrap_or(now),
                });
            }
            record.fail_count = 0;
            record.is_down = false;
            record.down_since = None;
            if was_online != Some(true) {
                record.online_since = Some(now);
            }
            record.offline_since = None;
        } else {
            record.fail_count = record.fail_count.saturating_add(1);
            if !record.is_down && record.fail_count >= self.fail_threshold {
                record.is_down = true;
                record.down_since = Some(now);
                signal = Some(Signal::ConfirmedDown);
            }
            if was_online != Some(false) {
                record.offline_since = Some(now);
            }
            record.online_since = None;
        }

        Transition { record, signal }
    }

    /// Apply one source's snapshot in a single transaction and return the
    /// events it produced. On error nothing from this snapshot is persisted.
    ///
    /// Channels absent from `observations` are not touched.
    pub fn apply_snapshot(
        &self,
        store: &Store,
        source: &Source,
        observations: &[ChannelObservation],
        now: DateTime<Utc>,
    ) -> Result<Vec<ChannelEvent>, DbError> {
        store.transaction(|tx| {
            let mut events = Vec::new();

            for obs in observations {
                let prior = tx.get_status(&obs.channel_id, &source.id)?;
                let transition = self.evaluate(obs, prior.as_ref(), now);
                let record = &transition.record;
                let channel = || ChannelRef {
                    channel_id: obs.channel_id.clone(),
                    channel_name: obs.channel_name.clone(),
                    source_id: source.id.clone(),
                    source_name: source.name.clone(),
                };

                match transition.signal {
                    Some(Signal::ConfirmedDown) => {
                        tx.open_outage(&obs.channel_id, &obs.channel_name, &source.id, now)?;
                        tracing::info!(
                            "Rule: channel=\"{}\" id={} source=\"{}\" status={} fail_count={} => CONFIRMED DOWN",
                            obs.channel_name,
                            obs.channel_id,
                            source.name,
                            obs.status,
                            record.fail_count
                        );
                        events.push(ChannelEvent::Down {
                            channel: channel(),
                            down_since: now,
                        });
                    }
                    Some(Signal::Recovered { down_since }) => {
                        let closed = tx.close_outage(&obs.channel_id, &source.id, now)?;
                        let downtime_seconds = closed
                            .and_then(|o| o.duration_seconds)
                            .unwrap_or_else(|| (now - down_since).num_seconds().max(0));
                        tracing::info!(
                            "Rule: channel=\"{}\" id={} source=\"{}\" status=online => RECOVERED after {}s",
                            obs.channel_name,
                            obs.channel_id,
                            source.name,
                            downtime_seconds
                        );
                        events.push(ChannelEvent::Recovered {
                            channel: channel(),
                            down_since,
                            downtime_seconds,
                        });
                    }
                    None => log_steady_state(obs, prior.as_ref(), record, &source.name),
                }

                tx.upsert_status(record)?;
            }

            Ok(events)
        })
    }
}

fn log_steady_state(
    obs: &ChannelObservation,
    prior: Option<&ChannelStatusRecord>,
    record: &ChannelStatusRecord,
    source_name: &str,
) {
    match obs.status {
        ChannelState::Online => {
            if let Some(p) = prior.filter(|p| p.fail_count > 0) {
                tracing::info!(
                    "Rule: channel=\"{}\" id={} source=\"{}\" status=online fail_count={} => reset before threshold",
                    obs.channel_name,
                    obs.channel_id,
                    source_name,
                    p.fail_count
                );
            }
        }
        ChannelState::Offline | ChannelState::Degraded => {
            tracing::debug!(
                "Rule: channel=\"{}\" id={} source=\"{}\" status={} fail_count={} is_down={}",
                obs.channel_name,
                obs.channel_id,
                source_name,
                obs.status,
                record.fail_count,
                record.is_down
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{sample_source, temp_store, OutageFilter};
    use chrono::{Duration, TimeZone};

    fn obs(status: ChannelState) -> ChannelObservation {
        ChannelObservation {
            source_id: "s1".to_string(),
            channel_id: "c1".to_string(),
            channel_name: "News".to_string(),
            status,
        }
    }

    fn tick(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap() + Duration::seconds(30 * n)
    }

    /// Feed statuses through `evaluate`, returning the signals and final record.
    fn run(engine: &DebounceEngine, statuses: &[ChannelState]) -> (Vec<Option<Signal>>, ChannelStatusRecord) {
        let mut record: Option<ChannelStatusRecord> = None;
        let mut signals = Vec::new();
        for (i, status) in statuses.iter().enumerate() {
            let t = engine.evaluate(&obs(*status), record.as_ref(), tick(i as i64));
            assert_eq!(t.record.is_down, t.record.down_since.is_some());
            signals.push(t.signal);
            record = Some(t.record);
        }
        (signals, record.unwrap())
    }

    use ChannelState::{Degraded, Offline, Online};

    #[test]
    fn test_near_miss_emits_nothing() {
        let engine = DebounceEngine::new(3);
        let mut record: Option<ChannelStatusRecord> = None;
        for (i, status) in [Offline, Degraded, Online].iter().enumerate() {
            let t = engine.evaluate(&obs(*status), record.as_ref(), tick(i as i64));
            assert!(t.signal.is_none());
            assert!(!t.record.is_down);
            record = Some(t.record);
        }
        assert_eq!(record.unwrap().fail_count, 0);
    }

    #[test]
    fn test_single_confirmation() {
        let engine = DebounceEngine::new(3);
        let (signals, record) = run(&engine, &[Offline, Offline, Offline, Offline, Degraded, Offline]);
        assert_eq!(
            signals,
            vec![None, None, Some(Signal::ConfirmedDown), None, None, None]
        );
        assert!(record.is_down);
        assert_eq!(record.down_since, Some(tick(2)));
        assert_eq!(record.fail_count, 6);
    }

    #[test]
    fn test_recovery_once() {
        let engine = DebounceEngine::new(2);
        let (signals, record) = run(&engine, &[Offline, Offline, Online, Online]);
        assert_eq!(
            signals,
            vec![
                None,
                Some(Signal::ConfirmedDown),
                Some(Signal::Recovered { down_since: tick(1) }),
                None
            ]
        );
        assert!(!record.is_down);
        assert_eq!(record.fail_count, 0);
        assert_eq!(record.down_since, None);
    }

    #[test]
    fn test_threshold_is_configurable() {
        let engine = DebounceEngine::new(7);
        let (signals, _) = run(&engine, &[Offline; 7]);
        assert_eq!(signals.iter().filter(|s| s.is_some()).count(), 1);
        assert_eq!(signals[6], Some(Signal::ConfirmedDown));

        assert_eq!(DebounceEngine::new(0).fail_threshold(), 1);
    }

    #[test]
    fn test_since_timestamps_follow_raw_transitions() {
        let engine = DebounceEngine::new(3);

        let first = engine.evaluate(&obs(Online), None, tick(0));
        assert_eq!(first.record.online_since, Some(tick(0)));
        assert_eq!(first.record.offline_since, None);

        let still = engine.evaluate(&obs(Online), Some(&first.record), tick(1));
        assert_eq!(still.record.online_since, Some(tick(0)));

        let off = engine.evaluate(&obs(Offline), Some(&still.record), tick(2));
        assert_eq!(off.record.offline_since, Some(tick(2)));
        assert_eq!(off.record.online_since, None);

        // Degraded after offline keeps the first offline_since.
        let degraded = engine.evaluate(&obs(Degraded), Some(&off.record), tick(3));
        assert_eq!(degraded.record.offline_since, Some(tick(2)));

        let back = engine.evaluate(&obs(Online), Some(&degraded.record), tick(4));
        assert_eq!(back.record.online_since, Some(tick(4)));
        assert_eq!(back.record.offline_since, None);
        assert_eq!(back.record.last_check_at, tick(4));

        let new_offline = engine.evaluate(&obs(Offline), None, tick(5));
        assert_eq!(new_offline.record.offline_since, Some(tick(5)));
        assert_eq!(new_offline.record.fail_count, 1);
    }

    #[test]
    fn test_snapshot_end_to_end() {
        let (_tmp, store) = temp_store();
        let source = sample_source("s1");
        let engine = DebounceEngine::new(3);

        let mut kinds = Vec::new();
        for (i, status) in [Offline, Offline, Offline, Online].iter().enumerate() {
            let events = engine
                .apply_snapshot(&store, &source, &[obs(*status)], tick(i as i64))
                .unwrap();
            assert!(events.len() <= 1);
            kinds.push(events.first().map(|e| if e.is_down() { "down" } else { "recovered" }));
        }
        assert_eq!(kinds, vec![None, None, Some("down"), Some("recovered")]);

        let report = store.query_outages(&OutageFilter::default(), None).unwrap();
        assert_eq!(report.total_count, 1);
        let outage = &report.events[0];
        assert_eq!(outage.started_at, tick(2));
        assert_eq!(outage.ended_at, Some(tick(3)));
        assert_eq!(outage.duration_seconds, Some(30));

        let record = store.get_status("c1", "s1").unwrap().unwrap();
        assert_eq!(record.status, Online);
        assert!(!record.is_down);
    }

    #[test]
    fn test_recovered_event_carries_downtime() {
        let (_tmp, store) = temp_store();
        let source = sample_source("s1");
        let engine = DebounceEngine::new(1);

        let down = engine.apply_snapshot(&store, &source, &[obs(Offline)], tick(0)).unwrap();
        assert_eq!(
            down,
            vec![ChannelEvent::Down {
                channel: ChannelRef {
                    channel_id: "c1".to_string(),
                    channel_name: "News".to_string(),
                    source_id: "s1".to_string(),
                    source_name: "Server s1".to_string(),
                },
                down_since: tick(0),
            }]
        );

        let up = engine.apply_snapshot(&store, &source, &[obs(Online)], tick(10)).unwrap();
        match &up[..] {
            [ChannelEvent::Recovered { down_since, downtime_seconds, .. }] => {
                assert_eq!(*down_since, tick(0));
                assert_eq!(*downtime_seconds, 300);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_at_most_one_open_outage() {
        let (_tmp, store) = temp_store();
        let source = sample_source("s1");
        let engine = DebounceEngine::new(2);

        let pattern = [
            Offline, Offline, Offline, Online, Offline, Online, Offline, Offline, Degraded, Offline, Online, Online,
        ];
        for (i, status) in pattern.iter().enumerate() {
            engine
                .apply_snapshot(&store, &source, &[obs(*status)], tick(i as i64))
                .unwrap();
            let report = store.query_outages(&OutageFilter::default(), None).unwrap();
            assert!(report.open_count <= 1, "more than one open outage after tick {}", i);
        }

        let report = store.query_outages(&OutageFilter::default(), None).unwrap();
        assert_eq!(report.total_count, 2);
        assert_eq!(report.open_count, 0);
    }

    #[test]
    fn test_absent_channel_is_frozen() {
        let (_tmp, store) = temp_store();
        let source = sample_source("s1");
        let engine = DebounceEngine::new(3);

        engine.apply_snapshot(&store, &source, &[obs(Offline)], tick(0)).unwrap();
        let before = store.get_status("c1", "s1").unwrap().unwrap();

        // Channel vanishes from the listing for several ticks.
        for i in 1..5 {
            let events = engine.apply_snapshot(&store, &source, &[], tick(i)).unwrap();
            assert!(events.is_empty());
        }

        let after = store.get_status("c1", "s1").unwrap().unwrap();
        assert_eq!(before, after);
    }
}
