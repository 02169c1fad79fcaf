//! Scheduler module: runs the poll cycle on a fixed interval.
//!
//! One cycle fetches every active source, runs the debounce engine over each
//! snapshot, applies maintenance windows and sends at most one "down" and one
//! "recovered" message covering all sources.

mod engine;
mod maintenance;

pub use engine::*;
pub use maintenance::*;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::db::{ChannelObservation, DbError, Source, Store};
use crate::notify::{
    build_messages, DispatchReport, MessageContext, Notifier, DOWN_TEMPLATE_KEY, RECOVERED_TEMPLATE_KEY,
};
use crate::sampler::{normalize_channel_id, ChannelSampler, SamplerError};

/// Errors that abort processing of a single source within a cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("sampler failed: {0}")]
    Sampler(#[from] SamplerError),
    #[error("store failed: {0}")]
    Store(#[from] DbError),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub poll_interval: Duration,
    pub fail_threshold: u32,
    pub sampler_timeout: Duration,
    pub display_timezone: Tz,
}

impl From<&ServerConfig> for SchedulerOptions {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval,
            fail_threshold: cfg.fail_threshold,
            sampler_timeout: cfg.sampler_timeout,
            display_timezone: cfg.display_timezone,
        }
    }
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub sources_polled: usize,
    pub sources_failed: usize,
    pub observations: usize,
    /// Events that survived maintenance suppression.
    pub events: Vec<ChannelEvent>,
    pub suppressed: Suppressed,
    pub dispatch: DispatchReport,
}

/// Which channels of a source are monitored this cycle.
struct ChannelFilter {
    disabled: HashSet<String>,
    exclude: Option<Regex>,
}

impl ChannelFilter {
    fn load(store: &Store, source: &Source) -> Result<Self, DbError> {
        let disabled = store
            .get_monitored_channels(&source.id)?
            .into_iter()
            .filter(|c| !c.enabled)
            .map(|c| c.channel_id)
            .collect();

        let exclude = match source.exclude_pattern.as_deref().map(str::trim) {
            Some(pattern) if !pattern.is_empty() => match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(
                        "Scheduler: ignoring invalid exclude pattern for source \"{}\": {}",
                        source.name,
                        e
                    );
                    None
                }
            },
            _ => None,
        };

        Ok(Self { disabled, exclude })
    }

    fn allows(&self, obs: &ChannelObservation) -> bool {
        if self.disabled.contains(&obs.channel_id) {
            return false;
        }
        !self.exclude.as_ref().is_some_and(|re| re.is_match(&obs.channel_name))
    }
}

/// The poll loop.
pub struct Scheduler {
    store: Arc<Store>,
    sampler: Arc<dyn ChannelSampler>,
    notifier: Notifier,
    engine: DebounceEngine,
    options: SchedulerOptions,
    cycle_permit: Arc<Semaphore>,
    stop_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        sampler: Arc<dyn ChannelSampler>,
        notifier: Notifier,
        options: SchedulerOptions,
    ) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            store,
            sampler,
            notifier,
            engine: DebounceEngine::new(options.fail_threshold),
            options,
            cycle_permit: Arc::new(Semaphore::new(1)),
            stop_tx,
        }
    }

    /// Spawn the poll loop. The first cycle runs immediately.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        tracing::info!(
            "Starting scheduler: interval={:?} fail_threshold={}",
            self.options.poll_interval,
            self.engine.fail_threshold()
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.options.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.recv() => {
                        break;
                    }
                    _ = interval.tick() => {
                        let permit = match this.cycle_permit.clone().try_acquire_owned() {
                            Ok(p) => p,
                            Err(_) => {
                                tracing::warn!("Skipping poll cycle due to overlap with the previous one");
                                continue;
                            }
                        };

                        let this = this.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            this.run_cycle(Utc::now()).await;
                        });
                    }
                }
            }

            tracing::info!("Scheduler: poll loop stopped");
        })
    }

    /// Stop the loop and wait for an in-flight cycle to finish.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(());
        if self.cycle_permit.acquire().await.is_ok() {
            tracing::info!("Scheduler: stopped");
        }
    }

    /// Run one cycle now unless another is in flight.
    pub async fn try_run_cycle(&self, now: DateTime<Utc>) -> Option<CycleReport> {
        let Ok(_permit) = self.cycle_permit.try_acquire() else {
            tracing::warn!("Skipping poll cycle due to overlap with the previous one");
            return None;
        };
        Some(self.run_cycle(now).await)
    }

    async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();

        let sources = match self.store.get_active_sources() {
            Ok(sources) => sources,
            Err(e) => {
                tracing::error!("Scheduler: failed to load sources: {}", e);
                return report;
            }
        };

        for source in &sources {
            report.sources_polled += 1;
            match self.poll_source(source, now).await {
                Ok((observed, events, suppressed)) => {
                    report.observations += observed;
                    report.events.extend(events);
                    report.suppressed.down += suppressed.down;
                    report.suppressed.recovered += suppressed.recovered;
                }
                Err(e) => {
                    report.sources_failed += 1;
                    tracing::error!("Scheduler: source \"{}\" ({}) skipped: {}", source.name, source.id, e);
                }
            }
        }

        if !report.events.is_empty() {
            report.dispatch = self.notify(&report.events, now).await;
        }

        let down = report.events.iter().filter(|e| e.is_down()).count();
        tracing::info!(
            "Cycle: sources={} failed={} observations={} down={} recovered={} suppressed={}",
            report.sources_polled,
            report.sources_failed,
            report.observations,
            down,
            report.events.len() - down,
            report.suppressed.down + report.suppressed.recovered
        );

        report
    }

    async fn poll_source(
        &self,
        source: &Source,
        now: DateTime<Utc>,
    ) -> Result<(usize, Vec<ChannelEvent>, Suppressed), CycleError> {
        let fetched = tokio::time::timeout(self.options.sampler_timeout, self.sampler.fetch_observations(source))
            .await
            .map_err(|_| CycleError::Timeout(self.options.sampler_timeout))??;

        let mut seen = HashSet::new();
        let mut observations: Vec<ChannelObservation> = fetched
            .into_iter()
            .map(|mut obs| {
                obs.source_id = source.id.clone();
                obs.channel_id = normalize_channel_id(&obs.channel_id);
                obs
            })
            .filter(|obs| seen.insert(obs.channel_id.clone()))
            .collect();
        let observed = observations.len();

        let discovered = self.store.discover_channels(&source.id, &observations, now)?;
        if discovered > 0 {
            tracing::info!("Scheduler: discovered {} new channels on \"{}\"", discovered, source.name);
        }

        let filter = ChannelFilter::load(&self.store, source)?;
        observations.retain(|obs| filter.allows(obs));

        let events = self.engine.apply_snapshot(&self.store, source, &observations, now)?;
        let (events, suppressed) = filter_events(source, events, now);
        Ok((observed, events, suppressed))
    }

    async fn notify(&self, events: &[ChannelEvent], now: DateTime<Utc>) -> DispatchReport {
        let ctx = MessageContext {
            fail_threshold: self.engine.fail_threshold(),
            poll_interval: self.options.poll_interval,
            timezone: self.options.display_timezone,
            down_template: self.template(DOWN_TEMPLATE_KEY),
            recovered_template: self.template(RECOVERED_TEMPLATE_KEY),
        };
        let messages = build_messages(events, &ctx, now);

        let destinations = self.store.get_destinations().unwrap_or_else(|e| {
            tracing::error!("Scheduler: failed to load destinations: {}", e);
            Vec::new()
        });
        let senders = self.notifier.resolve(&destinations);
        if senders.is_empty() {
            tracing::warn!("Scheduler: {} messages not sent, no destinations configured", messages.len());
            return DispatchReport::default();
        }

        self.notifier.dispatch(&senders, &messages).await
    }

    fn template(&self, key: &str) -> Option<String> {
        match self.store.get_setting(key) {
            Ok(value) => value.filter(|v| !v.trim().is_empty()),
            Err(e) => {
                tracing::warn!("Scheduler: failed to load {}: {}", key, e);
                None
            }
        }
    }
}
