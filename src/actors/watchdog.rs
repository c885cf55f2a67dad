//! ConnectionWatchdog - keeps the alert server connection alive
//!
//! ## Escalation
//!
//! ```text
//! ping ok                     → failures = 0, "restored" once if escalated
//! ping fails, reconnect ok    → same as ping ok
//! ping fails, reconnect fails → failures += 1, "degraded(failures)" every 5th
//! ```
//!
//! The watchdog never gives up. The start-up connect loop in
//! [`connect_with_retry`] follows the same escalation rule but runs before
//! the watchdog exists and blocks until the first connection succeeds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::alerts::NotificationSink;
use crate::error::ConnectionError;

/// Consecutive failures between two escalation notifications
pub const ESCALATION_THRESHOLD: u32 = 5;

/// Connection primitives the watchdog drives
#[async_trait]
pub trait SupervisedConnection: Send + Sync {
    /// First connect, keeping the failure reason
    async fn initialize(&self) -> Result<(), ConnectionError>;

    async fn ping(&self) -> bool;

    async fn reconnect(&self) -> bool;
}

/// Consecutive failure bookkeeping shared by the watchdog and start-up
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Escalation {
    failures: u32,
    escalated: bool,
}

impl Escalation {
    /// Record a failure; returns the count to escalate with, if any
    fn failed(&mut self) -> Option<u32> {
        self.failures += 1;

        if self.failures % ESCALATION_THRESHOLD == 0 {
            self.escalated = true;
            Some(self.failures)
        } else {
            None
        }
    }

    /// Record a success; returns whether a "restored" notification is due
    fn succeeded(&mut self) -> bool {
        let restored = self.escalated;
        *self = Self::default();
        restored
    }
}

/// Supervisory loop probing the connection at a fixed interval
pub struct ConnectionWatchdog {
    connection: Arc<dyn SupervisedConnection>,
    notifier: Option<Arc<dyn NotificationSink>>,
    ping_interval: Duration,
    escalation: Escalation,
}

impl ConnectionWatchdog {
    pub fn new(
        connection: Arc<dyn SupervisedConnection>,
        notifier: Option<Arc<dyn NotificationSink>>,
        ping_interval: Duration,
    ) -> Self {
        Self {
            connection,
            notifier,
            ping_interval,
            escalation: Escalation::default(),
        }
    }

    /// Consecutive failed reconnects since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.escalation.failures
    }

    /// Run until `cancel` fires
    #[instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("starting connection watchdog, pinging every {:?}", self.ping_interval);

        let mut ticker = tokio::time::interval(self.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the connection was just established, first probe after one interval
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("cancellation requested");
                    break;
                }

                _ = ticker.tick() => {
                    self.cycle().await;
                }
            }
        }

        debug!("connection watchdog stopped");
    }

    /// One probe, reconnecting if the probe fails
    pub async fn cycle(&mut self) {
        if self.connection.ping().await {
            self.on_success().await;
            return;
        }

        warn!("server did not answer ping, reconnecting");

        if self.connection.reconnect().await {
            info!("reconnected to the server");
            self.on_success().await;
            return;
        }

        let escalate = self.escalation.failed();
        warn!(
            "reconnecting failed ({} consecutive failures)",
            self.escalation.failures
        );

        if let Some(failures) = escalate {
            error!("connection to the server lost for {failures} attempts");
            notify_degraded(self.notifier.as_deref(), failures).await;
        }
    }

    async fn on_success(&mut self) {
        if self.escalation.succeeded() {
            notify_restored(self.notifier.as_deref()).await;
        }
    }
}

/// How the start-up connect loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    Connected,
    /// Shutdown was requested before a connection was made
    Cancelled,
}

/// Block until the first connection succeeds
///
/// Retries with a fixed delay. Errors that retrying cannot fix (protocol
/// mismatch, rejected credentials) are returned immediately.
#[instrument(skip_all)]
pub async fn connect_with_retry(
    connection: &dyn SupervisedConnection,
    notifier: Option<&dyn NotificationSink>,
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<Startup, ConnectionError> {
    let mut escalation = Escalation::default();

    loop {
        match connection.initialize().await {
            Ok(()) => {
                if escalation.succeeded() {
                    notify_restored(notifier).await;
                }
                return Ok(Startup::Connected);
            }
            Err(e) if e.is_fatal_at_startup() => {
                error!("connecting to the server failed permanently: {e}");
                return Err(e);
            }
            Err(e) => {
                let escalate = escalation.failed();
                warn!(
                    "connecting to the server failed ({e}), attempt {}, retrying in {delay:?}",
                    escalation.failures
                );

                if let Some(failures) = escalate {
                    notify_degraded(notifier, failures).await;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("start-up cancelled before the server was reached");
                return Ok(Startup::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn notify_degraded(notifier: Option<&dyn NotificationSink>, failures: u32) {
    match notifier {
        Some(notifier) => notifier.notify_connectivity_degraded(failures).await,
        None => debug!("no notification channel configured"),
    }
}

async fn notify_restored(notifier: Option<&dyn NotificationSink>) {
    if let Some(notifier) = notifier {
        notifier.notify_connectivity_restored().await;
    }
}
