//! Persistent connection to the alert server
//!
//! ## Locking
//!
//! The transport lives behind a single async mutex. Reconnects (watchdog)
//! wait for it; pings wait up to the request timeout; state change sends
//! (evaluator) fail fast. A send has one deadline, `send_timeout` after the
//! call, shared by the lock wait, the write and the response:
//!
//! ```text
//! send_state_change ── state != Authenticated ──→ Err(NotConnected)   (no waiting)
//!        │
//!        └─ lock before deadline? ── no ──→ Err(Busy)
//!                    │
//!                    └─ write + response before deadline? ── no ──→ Err(Timeout)
//! ```
//!
//! An exchange abandoned half way (the caller dropped the future) leaves the
//! session `Degraded`, so the next probe reconnects instead of reading a
//! stale response.
//!
//! ## Session states
//!
//! ```text
//! Disconnected ──reconnect──→ Handshaking ──ok──→ Authenticated ──probe fails──→ Degraded
//!      ↑                           │                                              │
//!      └──────────fail─────────────┘←───────────────reconnect────────────────────┘
//! ```

pub mod protocol;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::actors::evaluator::StateChangeSink;
use crate::actors::messages::StateChange;
use crate::actors::watchdog::SupervisedConnection;
use crate::error::{ConnectionError, ProtocolError};

use self::protocol::{
    AuthenticationRequest, Direction, Frame, MAX_FRAME_LENGTH, MessageKind, RegistrationRequest,
    ResponsePayload, ResponseResult, SensorRegistration, StateChangeRequest, check_version,
};
use self::transport::{BoxedStream, Dialer};

type Transport = Framed<BoxedStream, LinesCodec>;

/// Lifecycle of the authenticated session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Handshaking,
    Authenticated,
    /// Transport still open, but the last probe or send failed
    Degraded,
}

/// Credentials and timeouts of the connection
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub username: String,
    pub password: String,
    /// Sent during registration
    pub hostname: String,
    /// TCP connect plus TLS handshake
    pub connect_timeout: Duration,
    /// Handshake messages and pings
    pub request_timeout: Duration,
    /// Waiting for the transport plus the state change exchange
    pub send_timeout: Duration,
}

/// The single connection to the alert server
pub struct ServerConnection {
    dialer: Arc<dyn Dialer>,
    settings: ConnectionSettings,
    sensors: Vec<SensorRegistration>,
    transport: Mutex<Option<Transport>>,
    state: watch::Sender<SessionState>,
}

impl ServerConnection {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        settings: ConnectionSettings,
        sensors: Vec<SensorRegistration>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);

        Self {
            dialer,
            settings,
            sensors,
            transport: Mutex::new(None),
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe session state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Connect, authenticate and register all sensors
    ///
    /// Failures are logged and reported as `false`.
    pub async fn initialize_communication(&self) -> bool {
        match self.try_initialize().await {
            Ok(()) => true,
            Err(e) => {
                error!("initializing communication with the server failed: {e}");
                false
            }
        }
    }

    /// Like [`initialize_communication`](Self::initialize_communication) but
    /// keeps the reason, so start-up can tell fatal errors from transient ones
    pub async fn try_initialize(&self) -> Result<(), ConnectionError> {
        self.connect().await
    }

    /// Tear down the current transport and run the full handshake again
    pub async fn reconnect(&self) -> bool {
        match self.connect().await {
            Ok(()) => true,
            Err(e) => {
                warn!("reconnecting to the server failed: {e}");
                false
            }
        }
    }

    #[instrument(skip(self))]
    async fn connect(&self) -> Result<(), ConnectionError> {
        let mut guard = self.transport.lock().await;

        if guard.take().is_some() {
            debug!("closed previous transport");
        }

        self.set_state(SessionState::Handshaking);

        match self.handshake().await {
            Ok(transport) => {
                *guard = Some(transport);
                self.set_state(SessionState::Authenticated);
                info!(
                    "connected to the server, {} sensors registered",
                    self.sensors.len()
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<Transport, ConnectionError> {
        let stream = timeout(self.settings.connect_timeout, self.dialer.dial())
            .await
            .map_err(|_| ConnectionError::Timeout("connect"))??;

        let mut transport = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
        let request_timeout = self.settings.request_timeout;

        let authentication =
            AuthenticationRequest::new(&self.settings.username, &self.settings.password);
        let response = request(
            &mut transport,
            MessageKind::Authentication,
            &authentication,
            Instant::now() + request_timeout,
        )
        .await?;

        let server_version = response.version.ok_or_else(|| {
            ProtocolError::Malformed("authentication response without version".to_string())
        })?;
        check_version(server_version)?;
        accepted(response)?;
        debug!("authenticated as '{}'", self.settings.username);

        let registration = RegistrationRequest {
            hostname: self.settings.hostname.clone(),
            persistent: 1,
            sensors: self.sensors.clone(),
        };
        let response = request(
            &mut transport,
            MessageKind::Registration,
            &registration,
            Instant::now() + request_timeout,
        )
        .await?;
        accepted(response)?;

        Ok(transport)
    }

    /// Liveness probe; waits at most the request timeout for the transport
    /// and again for the answer
    #[instrument(skip(self))]
    pub async fn ping(&self) -> bool {
        let request_timeout = self.settings.request_timeout;

        let Ok(mut guard) = timeout(request_timeout, self.transport.lock()).await else {
            warn!("ping could not acquire the transport");
            return false;
        };

        let Some(transport) = guard.as_mut() else {
            debug!("ping without transport");
            return false;
        };

        let result = request(
            transport,
            MessageKind::Ping,
            &serde_json::json!({}),
            Instant::now() + request_timeout,
        )
        .await
        .and_then(accepted);

        match result {
            Ok(()) => {
                trace!("ping answered");
                self.set_state(SessionState::Authenticated);
                true
            }
            Err(e) => {
                warn!("ping failed: {e}");
                self.set_state(SessionState::Degraded);
                false
            }
        }
    }

    /// Transmit one state change
    ///
    /// Never blocks longer than the send timeout in total and fails
    /// immediately while the session is not authenticated.
    #[instrument(skip(self, change), fields(sensor = change.sensor_id, state = %change.state))]
    pub async fn send_state_change(&self, change: &StateChange) -> Result<(), ConnectionError> {
        if self.state() != SessionState::Authenticated {
            return Err(ConnectionError::NotConnected);
        }

        let deadline = Instant::now() + self.settings.send_timeout;
        let mut guard = timeout_at(deadline, self.transport.lock())
            .await
            .map_err(|_| ConnectionError::Busy)?;

        // a reconnect may have run while we were waiting
        if self.state() != SessionState::Authenticated {
            return Err(ConnectionError::NotConnected);
        }
        let transport = guard.as_mut().ok_or(ConnectionError::NotConnected)?;

        let mut in_flight = InFlight {
            state: &self.state,
            finished: false,
        };
        let result = request(
            transport,
            MessageKind::StateChange,
            &StateChangeRequest::from(change),
            deadline,
        )
        .await
        .and_then(accepted);
        in_flight.finished = true;

        match &result {
            Ok(()) => debug!("state change sent"),
            Err(ConnectionError::Rejected(reason)) => {
                warn!("server rejected state change: {reason}");
            }
            Err(e) => {
                warn!("sending state change failed: {e}");
                self.set_state(SessionState::Degraded);
            }
        }

        result
    }

    fn set_state(&self, new: SessionState) {
        let old = self.state.send_replace(new);
        if old != new {
            debug!("session state {old:?} -> {new:?}");
        }
    }
}

/// Degrades the session when dropped before the exchange finished
struct InFlight<'a> {
    state: &'a watch::Sender<SessionState>,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("state change exchange abandoned, transport marked degraded");
            self.state.send_replace(SessionState::Degraded);
        }
    }
}

/// Send a request and wait for the matching response
///
/// Server pings arriving in between are answered. The send and the wait
/// together must finish before `deadline`.
async fn request(
    transport: &mut Transport,
    message: MessageKind,
    payload: &impl Serialize,
    deadline: Instant,
) -> Result<ResponsePayload, ConnectionError> {
    let line = Frame::request(message, payload)?.encode()?;

    timeout_at(deadline, transport.send(line))
        .await
        .map_err(|_| ConnectionError::Timeout("send"))??;

    timeout_at(deadline, read_response(transport, message))
        .await
        .map_err(|_| ConnectionError::Timeout("response"))?
}

async fn read_response(
    transport: &mut Transport,
    expected: MessageKind,
) -> Result<ResponsePayload, ConnectionError> {
    loop {
        let line = transport.next().await.ok_or(ConnectionError::Closed)??;
        let frame = Frame::decode(&line)?;

        match (frame.message, frame.direction) {
            (message, Direction::Response) if message == expected => {
                return Ok(frame.payload_as()?);
            }
            (MessageKind::Ping, Direction::Request) => {
                trace!("answering server ping");
                let pong = Frame::response(MessageKind::Ping, &ResponsePayload::ok())?.encode()?;
                transport.send(pong).await?;
            }
            (message, direction) => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: expected.to_string(),
                    got: format!("{message} {direction:?}"),
                }
                .into());
            }
        }
    }
}

fn accepted(response: ResponsePayload) -> Result<(), ConnectionError> {
    match response.result {
        ResponseResult::Ok => Ok(()),
        ResponseResult::Error => Err(ConnectionError::Rejected(
            response
                .error
                .unwrap_or_else(|| "no reason given".to_string()),
        )),
    }
}

#[async_trait]
impl StateChangeSink for ServerConnection {
    async fn send_state_change(&self, change: &StateChange) -> Result<(), ConnectionError> {
        ServerConnection::send_state_change(self, change).await
    }
}

#[async_trait]
impl SupervisedConnection for ServerConnection {
    async fn initialize(&self) -> Result<(), ConnectionError> {
        self.try_initialize().await
    }

    async fn ping(&self) -> bool {
        ServerConnection::ping(self).await
    }

    async fn reconnect(&self) -> bool {
        ServerConnection::reconnect(self).await
    }
}
