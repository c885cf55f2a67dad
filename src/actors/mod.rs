//! Long-running loops of the sensor client
//!
//! Each loop runs as an independent async task and stops when its
//! [`CancellationToken`](tokio_util::sync::CancellationToken) fires.
//!
//! ## Architecture Overview
//!
//! ```text
//!   ┌──────────────────┐  fetch   ┌────────────────┐
//!   │  DataCollector   │ ───────→ │ weather source │
//!   └────────┬─────────┘          └────────────────┘
//!            │ location cache (RwLock, copy on read)
//!   ┌────────▼─────────┐  StateChange  ┌──────────────────┐
//!   │ SensorEvaluator  │ ────────────→ │ ServerConnection │
//!   └──────────────────┘               └────────▲─────────┘
//!                                               │ ping / reconnect
//!                                     ┌─────────┴──────────┐  degraded / restored
//!                                     │ ConnectionWatchdog │ ───────────────────→ NotificationSink
//!                                     └────────────────────┘
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: the collector has an mpsc command channel for control messages
//! 2. **Request/Response**: oneshot channels for synchronous queries
//! 3. **Shared reads**: sensors read the collector's cache without messaging

pub mod collector;
pub mod evaluator;
pub mod messages;
pub mod watchdog;
