//! SensorEvaluator - turns measurements into debounced state changes
//!
//! ## Debounce State Machine
//!
//! Each sensor owns a committed trigger state plus an optional pending
//! transition:
//!
//! ```text
//! intended == committed:
//!   pending                       → cancel (the crossing did not last)
//!
//! intended != committed:
//!   no pending                    → start pending at this cycle
//!   pending for < alert_delay     → keep waiting
//!   pending for >= alert_delay    → commit, emit state change
//! ```
//!
//! An `alert_delay` of zero commits in the cycle that first sees the
//! crossing. Committed events are sent in order; events that could not be
//! sent stay queued and are retried first on the next cycle. An event the
//! server rejects is dropped, retrying it would only be rejected again.
//! Sending stops once a cycle has spent its poll interval on it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::ConnectionError;
use crate::sensors::{MeasurementSource, PollingSensor, TriggerState};

use super::messages::StateChange;

/// Most state changes kept while the server is unreachable
pub const BACKLOG_CAPACITY: usize = 64;

/// Receiver of committed state changes
#[async_trait]
pub trait StateChangeSink: Send + Sync {
    async fn send_state_change(&self, change: &StateChange) -> Result<(), ConnectionError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pending {
    target: TriggerState,
    since: Instant,
}

/// Per-sensor evaluation state
#[derive(Debug)]
struct SensorSlot {
    sensor: PollingSensor,

    /// Committed state, only ever changed by [`SensorEvaluator::poll_cycle`]
    trigger_state: TriggerState,

    pending: Option<Pending>,
}

impl SensorSlot {
    /// Advance the state machine; returns the new state when a transition is committed
    fn evaluate(&mut self, intended: TriggerState, now: Instant) -> Option<TriggerState> {
        if intended == self.trigger_state {
            if self.pending.take().is_some() {
                debug!(sensor = self.sensor.id, "crossing reverted before the alert delay, cancelled");
            }
            return None;
        }

        let pending = match self.pending {
            Some(pending) if pending.target == intended => pending,
            _ => {
                trace!(sensor = self.sensor.id, "pending {intended}");
                let pending = Pending {
                    target: intended,
                    since: now,
                };
                self.pending = Some(pending);
                pending
            }
        };

        if now.saturating_duration_since(pending.since) < self.sensor.alert_delay {
            return None;
        }

        self.pending = None;
        self.trigger_state = intended;
        Some(intended)
    }

    fn should_emit(&self, state: TriggerState) -> bool {
        match state {
            TriggerState::Triggered => self.sensor.trigger_alert,
            TriggerState::Normal => self.sensor.trigger_alert && self.sensor.trigger_alert_normal,
        }
    }
}

/// The main evaluation loop
pub struct SensorEvaluator {
    slots: Vec<SensorSlot>,
    source: Arc<dyn MeasurementSource>,
    sink: Arc<dyn StateChangeSink>,
    poll_interval: Duration,
    backlog: VecDeque<StateChange>,
}

impl SensorEvaluator {
    pub fn new(
        sensors: Vec<PollingSensor>,
        source: Arc<dyn MeasurementSource>,
        sink: Arc<dyn StateChangeSink>,
        poll_interval: Duration,
    ) -> Self {
        let slots = sensors
            .into_iter()
            .map(|sensor| SensorSlot {
                sensor,
                trigger_state: TriggerState::Normal,
                pending: None,
            })
            .collect();

        Self {
            slots,
            source,
            sink,
            poll_interval,
            backlog: VecDeque::new(),
        }
    }

    /// Committed state of a sensor
    pub fn trigger_state(&self, sensor_id: u32) -> Option<TriggerState> {
        self.slots
            .iter()
            .find(|slot| slot.sensor.id == sensor_id)
            .map(|slot| slot.trigger_state)
    }

    /// State changes still waiting to be sent
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Run until `cancel` fires
    #[instrument(skip_all, fields(sensors = self.slots.len()))]
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("starting sensor evaluator, polling every {:?}", self.poll_interval);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("cancellation requested");
                    break;
                }

                _ = ticker.tick() => {
                    self.poll_cycle(Instant::now()).await;
                }
            }
        }

        if !self.backlog.is_empty() {
            warn!("{} state changes were never sent", self.backlog.len());
        }
        debug!("sensor evaluator stopped");
    }

    /// Evaluate every sensor once
    ///
    /// Returns the state changes committed in this cycle, whether or not
    /// they could be sent yet.
    pub async fn poll_cycle(&mut self, now: Instant) -> Vec<StateChange> {
        let mut committed = Vec::new();

        for slot in &mut self.slots {
            let Some(value) = slot.sensor.current_value(self.source.as_ref()) else {
                trace!(sensor = slot.sensor.id, "no measurement available, skipping");
                continue;
            };

            let intended = slot.sensor.check_state(value);
            let Some(state) = slot.evaluate(intended, now) else {
                continue;
            };

            info!(
                sensor = slot.sensor.id,
                "'{}' is now {state} (value {value})", slot.sensor.description
            );

            if !slot.should_emit(state) {
                debug!(sensor = slot.sensor.id, "alerting disabled for {state}, not sent");
                continue;
            }

            committed.push(StateChange {
                sensor_id: slot.sensor.id,
                state,
                alert_level: match state {
                    TriggerState::Triggered => slot.sensor.crossed_level(value),
                    TriggerState::Normal => None,
                },
                value,
                timestamp: Utc::now(),
            });
        }

        for change in &committed {
            self.enqueue(change.clone());
        }
        self.flush().await;

        committed
    }

    fn enqueue(&mut self, change: StateChange) {
        self.backlog.push_back(change);

        if self.backlog.len() > BACKLOG_CAPACITY
            && let Some(dropped) = self.backlog.pop_front()
        {
            warn!(
                sensor = dropped.sensor_id,
                "state change backlog full, dropped {} from {}", dropped.state, dropped.timestamp
            );
        }
    }

    /// Send queued state changes in order
    ///
    /// Stops at the first transient failure or when the poll interval is
    /// used up. Rejected changes are dropped.
    async fn flush(&mut self) {
        let deadline = Instant::now() + self.poll_interval;

        while let Some(change) = self.backlog.front() {
            let Ok(result) = timeout_at(deadline, self.sink.send_state_change(change)).await else {
                debug!(
                    "send budget of {:?} used up, {} queued for the next cycle",
                    self.poll_interval,
                    self.backlog.len()
                );
                break;
            };

            match result {
                Ok(()) => {
                    self.backlog.pop_front();
                }
                Err(ConnectionError::Rejected(reason)) => {
                    error!(
                        sensor = change.sensor_id,
                        "server rejected state change to {} ({reason}), dropped", change.state
                    );
                    self.backlog.pop_front();
                }
                Err(e) => {
                    debug!(
                        "sending state change failed ({e}), {} queued for retry",
                        self.backlog.len()
                    );
                    break;
                }
            }
        }
    }
}
