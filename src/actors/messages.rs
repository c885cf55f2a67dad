//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to specific actors via mpsc
//! 2. **Events**: State changes produced by the evaluator, consumed by the connection
//! 3. **Immutability**: All events are cloneable so failed sends can be retried

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::sensors::TriggerState;

/// Commands that can be sent to the data collector
#[derive(Debug)]
pub enum CollectorCommand {
    /// Fetch every location immediately (bypassing the interval timer)
    ///
    /// Used for testing and manual refresh operations.
    PollNow {
        /// Channel to send the result back
        respond_to: oneshot::Sender<PollSummary>,
    },

    /// Gracefully shut down the collector
    ///
    /// The actor will finish any in-flight poll and then exit.
    Shutdown,
}

/// Outcome of one pass over all registered locations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Locations fetched successfully
    pub fetched: usize,

    /// Locations whose fetch failed (previous value retained)
    pub failed: usize,
}

/// A committed sensor state transition
///
/// Produced only by the sensor evaluator and transmitted to the alert server.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// Client-side sensor id
    pub sensor_id: u32,

    /// New committed state
    pub state: TriggerState,

    /// Highest alert level crossed by `value` (none when returning to normal)
    pub alert_level: Option<i32>,

    /// Measurement that caused the transition
    pub value: f64,

    /// When the transition was committed
    pub timestamp: DateTime<Utc>,
}
