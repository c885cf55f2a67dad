//! Error types for the sensor client
//!
//! Three families, matching how each one is handled at run time:
//!
//! - [`ConfigError`]: fatal, surfaced before any loop starts
//! - [`ConnectionError`]: alert server I/O; transient except for protocol
//!   errors and credential rejection during start-up
//! - [`FetchError`]: weather source failures; always transient
//!
//! A missing measurement is not an error at all, it is `None`.

use std::path::PathBuf;

/// Result type alias for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading and validating the configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no sensors configured")]
    NoSensors,

    #[error("id of sensor {0} is already taken")]
    DuplicateSensorId(u32),

    #[error("description of sensor {0} is empty")]
    EmptyDescription(u32),

    #[error("'trigger_alert' of sensor {0} has to be enabled when 'trigger_alert_normal' is enabled")]
    TriggerAlertNormalWithoutTriggerAlert(u32),

    #[error("day {day} of sensor {id} is not valid (expected 0 to 2)")]
    InvalidForecastDay { id: u32, day: i64 },

    #[error("forecast temperature sensor {0} requires 'extreme' to be either high or low")]
    MissingForecastExtreme(u32),

    #[error("sensor {0} has an empty country or city")]
    EmptyLocation(u32),

    #[error("{what} does not exist: {path}")]
    MissingFile { what: &'static str, path: PathBuf },

    #[error("invalid {what} in {path}: {reason}")]
    InvalidPem {
        what: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("'{0}' is not a valid log level")]
    InvalidLogLevel(String),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("send timeout {send_timeout:?} must be shorter than the evaluator poll interval {poll_interval:?}")]
    SendTimeoutTooLong {
        send_timeout: std::time::Duration,
        poll_interval: std::time::Duration,
    },

    #[error("{0} must not be empty")]
    EmptyField(&'static str),
}

/// Errors of the alert server wire protocol
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("server protocol version {server} is not compatible with client version {client}")]
    VersionMismatch { server: f32, client: f32 },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("expected a '{expected}' response, got '{got}'")]
    UnexpectedMessage { expected: String, got: String },
}

/// Errors of the persistent alert server connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The session is not authenticated
    #[error("not connected to the alert server")]
    NotConnected,

    /// The transport is held by another operation (e.g. a reconnect)
    #[error("connection is busy")]
    Busy,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("connection closed by the server")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server rejected the request: {0}")]
    Rejected(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<tokio_util::codec::LinesCodecError> for ConnectionError {
    fn from(err: tokio_util::codec::LinesCodecError) -> Self {
        match err {
            tokio_util::codec::LinesCodecError::Io(err) => ConnectionError::Io(err),
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                ConnectionError::Protocol(ProtocolError::Malformed(
                    "frame exceeds maximum length".to_string(),
                ))
            }
        }
    }
}

impl ConnectionError {
    /// Whether the start-up connect loop should give up instead of retrying
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            ConnectionError::Protocol(_) | ConnectionError::Rejected(_)
        )
    }
}

/// Errors of a single weather fetch
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP error: {0}")]
    Status(reqwest::StatusCode),

    #[error("weather service error: {0}")]
    Api(String),

    #[error("malformed weather data: {0}")]
    Malformed(String),
}
