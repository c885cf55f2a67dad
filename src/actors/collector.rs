//! DataCollector - Polls the weather service for every registered location
//!
//! Sensors never talk to the weather service themselves. The collector
//! fetches each registered location once per interval and keeps the latest
//! bundle in a shared cache that sensors read without blocking.
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → fetch location 1..N (sequential) → write cache entry
//!     ↑                                                  │
//!     └─── Commands (PollNow, Shutdown)                  └──→ CollectorHandle::get_value (readers)
//! ```
//!
//! ## Failure Handling
//!
//! A failed fetch keeps the previous bundle and bumps the location's
//! consecutive failure counter. Stale data is served until the counter
//! exceeds `max_failures`; after that the location reads as unavailable until
//! the next successful fetch.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::sensors::{Location, Measurement, MeasurementSource};
use crate::weather::{WeatherBundle, WeatherSource};

use super::messages::{CollectorCommand, PollSummary};

/// Cached state of a single location
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
    /// Most recent successfully fetched bundle
    pub bundle: Option<WeatherBundle>,

    /// When `bundle` was fetched
    pub fetched_at: Option<DateTime<Utc>>,

    /// Failed fetches since the last successful one
    pub consecutive_failures: u32,
}

type LocationCache = Arc<RwLock<HashMap<Location, CacheEntry>>>;

/// Builder side of the collector
///
/// Locations are registered here. [`DataCollector::start`] consumes the
/// collector, so no location can be added once the loop runs.
pub struct DataCollector {
    locations: Vec<Location>,
    source: Arc<dyn WeatherSource>,
    interval: Duration,
    max_failures: u32,
}

impl DataCollector {
    pub fn new(source: Arc<dyn WeatherSource>, interval: Duration, max_failures: u32) -> Self {
        Self {
            locations: Vec::new(),
            source,
            interval,
            max_failures,
        }
    }

    /// Register a location; registering it again is a no-op
    pub fn add_location(&mut self, location: Location) {
        if self.locations.contains(&location) {
            trace!("location {location} already registered");
            return;
        }

        debug!("registered location {location}");
        self.locations.push(location);
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    /// Spawn the polling loop and return a handle to it
    pub fn start(self, cancel: CancellationToken) -> CollectorHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let cache: LocationCache = Arc::new(RwLock::new(
            self.locations
                .iter()
                .map(|location| (location.clone(), CacheEntry::default()))
                .collect(),
        ));

        let actor = CollectorActor {
            locations: self.locations,
            source: self.source,
            cache: cache.clone(),
            command_rx: cmd_rx,
            interval_duration: self.interval,
            max_failures: self.max_failures,
            cancel,
        };

        tokio::spawn(actor.run());

        CollectorHandle {
            sender: cmd_tx,
            cache,
            max_failures: self.max_failures,
        }
    }
}

/// Actor owning the fetch loop; the only writer of the location cache
struct CollectorActor {
    locations: Vec<Location>,
    source: Arc<dyn WeatherSource>,
    cache: LocationCache,
    command_rx: mpsc::Receiver<CollectorCommand>,
    interval_duration: Duration,
    max_failures: u32,
    cancel: CancellationToken,
}

impl CollectorActor {
    /// Run the actor's main loop
    ///
    /// Runs until cancelled, a Shutdown command is received or the command
    /// channel is closed.
    #[instrument(skip(self), fields(locations = self.locations.len()))]
    async fn run(mut self) {
        info!(
            "starting data collector with interval {:?}",
            self.interval_duration
        );

        let mut ticker = interval(self.interval_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("collector cancelled");
                    break;
                }

                // Timer tick - fetch all locations
                _ = ticker.tick() => {
                    self.poll_locations().await;
                }

                // Handle commands
                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        CollectorCommand::PollNow { respond_to } => {
                            debug!("received PollNow command");
                            let summary = self.poll_locations().await;
                            // the next scheduled pass is one full interval away
                            ticker.reset();
                            let _ = respond_to.send(summary);
                        }

                        CollectorCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                // Command channel closed - exit
                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("data collector stopped");
    }

    /// Fetch every location once, in registration order
    ///
    /// A failing location never stops the pass.
    async fn poll_locations(&self) -> PollSummary {
        let mut summary = PollSummary::default();

        for location in &self.locations {
            // fetch outside of the lock, readers must not wait for the network
            match self.source.fetch(location).await {
                Ok(bundle) => {
                    trace!("{location}: fetched {bundle:?}");
                    self.update(location, |entry| {
                        entry.bundle = Some(bundle);
                        entry.fetched_at = Some(Utc::now());
                        entry.consecutive_failures = 0;
                    });
                    summary.fetched += 1;
                }
                Err(e) => {
                    let failures = self.update(location, |entry| {
                        entry.consecutive_failures += 1;
                    });

                    if failures == self.max_failures + 1 {
                        error!(
                            "{location}: {failures} consecutive fetch failures, data is unavailable: {e}"
                        );
                    } else {
                        warn!("{location}: failed to fetch weather data ({failures} in a row): {e}");
                    }
                    summary.failed += 1;
                }
            }
        }

        debug!(
            "poll finished: {} fetched, {} failed",
            summary.fetched, summary.failed
        );
        summary
    }

    /// Apply `change` to a location's entry, returning its failure count
    fn update(&self, location: &Location, change: impl FnOnce(&mut CacheEntry)) -> u32 {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.entry(location.clone()).or_default();
        change(entry);
        entry.consecutive_failures
    }
}

/// Handle for reading the cache and controlling the collector
///
/// Cheap to clone and safe to share across tasks.
#[derive(Clone)]
pub struct CollectorHandle {
    sender: mpsc::Sender<CollectorCommand>,
    cache: LocationCache,
    max_failures: u32,
}

impl CollectorHandle {
    /// Last cached value for `location`, `None` if unavailable
    ///
    /// Never waits for a fetch in flight; the write lock is only held for the
    /// duration of a map update.
    pub fn get_value(&self, location: &Location, measurement: &Measurement) -> Option<f64> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.get(location)?;

        if entry.consecutive_failures > self.max_failures {
            return None;
        }

        entry.bundle.as_ref()?.value(measurement)
    }

    /// Copy of a location's cache entry
    pub fn entry(&self, location: &Location) -> Option<CacheEntry> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache.get(location).cloned()
    }

    /// Trigger an immediate fetch of all locations
    ///
    /// The regular schedule restarts afterwards, so no location is fetched
    /// more than once per interval.
    pub async fn poll_now(&self) -> Result<PollSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CollectorCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("failed to receive response")
    }

    /// Gracefully shut down the collector
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(CollectorCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}

impl MeasurementSource for CollectorHandle {
    fn value(&self, location: &Location, measurement: &Measurement) -> Option<f64> {
        self.get_value(location, measurement)
    }
}
