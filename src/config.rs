use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{level_filters::LevelFilter, trace};

use crate::error::{ConfigError, ConfigResult};
use crate::sensors::{Extreme, Location, Measurement, PollingSensor};
use crate::util::make_path;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    pub credentials: Credentials,
    pub collector: CollectorConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    pub notification: Option<Alert>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ca_file: String,
    /// Seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Milliseconds, shorter than the evaluator poll interval
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ClientConfig {
    pub certificate: Option<CertificateConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CertificateConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Clone, serde::Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CollectorConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Seconds between two fetches of the same location
    #[serde(default = "default_collector_interval")]
    pub interval: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// HTTP timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alert {
    Discord(Discord),
    Webhook(Webhook),
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Webhook {
    pub url: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Discord {
    pub url: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SensorConfig {
    pub id: u32,
    pub description: String,
    /// Seconds
    #[serde(default)]
    pub alert_delay: u64,
    #[serde(default)]
    pub alert_levels: Vec<i32>,
    #[serde(default = "default_true")]
    pub trigger_alert: bool,
    #[serde(default)]
    pub trigger_alert_normal: bool,
    pub weather: WeatherConfig,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WeatherConfig {
    pub country: String,
    pub city: String,
    #[serde(rename = "type")]
    pub kind: WeatherKind,
    pub day: Option<i64>,
    pub extreme: Option<Extreme>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherKind {
    Temperature,
    Humidity,
    ForecastTemperature,
    ForecastRain,
}

/// Validated, immutable settings handed to the run-time loops
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub log_level: LevelFilter,
    pub log_file: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub ca_file: PathBuf,
    pub client_certificate: Option<(PathBuf, PathBuf)>,
    pub username: String,
    pub password: String,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub send_timeout: Duration,
    pub api_key: String,
    pub base_url: String,
    pub collector_interval: Duration,
    pub max_failures: u32,
    pub http_timeout: Duration,
    pub poll_interval: Duration,
    pub notification: Option<Alert>,
    pub sensors: Vec<PollingSensor>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ping_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    10
}

fn default_send_timeout_ms() -> u64 {
    500
}

fn default_base_url() -> String {
    "https://api.wunderground.com".to_string()
}

fn default_collector_interval() -> u64 {
    600
}

fn default_max_failures() -> u32 {
    5
}

fn default_http_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

pub fn parse_log_level(level: &str) -> ConfigResult<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        _ => Err(ConfigError::InvalidLogLevel(level.to_string())),
    }
}

pub fn read_config_file(path: &Path) -> ConfigResult<Config> {
    let file_content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> ConfigResult<Config> {
    serde_json::from_str::<Config>(content)
        .map_err(ConfigError::from)
        .inspect(|config| trace!("loaded config: {config:?}"))
}

impl SensorConfig {
    fn into_sensor(self) -> ConfigResult<PollingSensor> {
        let WeatherConfig {
            country,
            city,
            kind,
            day,
            extreme,
        } = self.weather;

        let day = day.unwrap_or(0);
        let measurement = match kind {
            WeatherKind::Temperature => Measurement::Temperature,
            WeatherKind::Humidity => Measurement::Humidity,
            WeatherKind::ForecastTemperature => Measurement::ForecastTemperature {
                day,
                extreme: extreme.ok_or(ConfigError::MissingForecastExtreme(self.id))?,
            },
            WeatherKind::ForecastRain => Measurement::ForecastRain { day },
        };

        let sensor = PollingSensor {
            id: self.id,
            description: self.description,
            alert_delay: Duration::from_secs(self.alert_delay),
            alert_levels: self.alert_levels,
            trigger_alert: self.trigger_alert,
            trigger_alert_normal: self.trigger_alert_normal,
            location: Location::new(country.trim(), city.trim()),
            measurement,
        };
        sensor.initialize()?;

        Ok(sensor)
    }
}

/// Check that every sensor is valid and ids are unique
pub fn validate_sensors(sensors: Vec<SensorConfig>) -> ConfigResult<Vec<PollingSensor>> {
    if sensors.is_empty() {
        return Err(ConfigError::NoSensors);
    }

    let mut ids = HashSet::new();
    sensors
        .into_iter()
        .map(|sensor| {
            if !ids.insert(sensor.id) {
                return Err(ConfigError::DuplicateSensorId(sensor.id));
            }
            sensor.into_sensor()
        })
        .collect()
}

fn seconds(value: u64, name: &'static str) -> ConfigResult<Duration> {
    if value == 0 {
        return Err(ConfigError::ZeroInterval(name));
    }
    Ok(Duration::from_secs(value))
}

fn existing_file(path: &str, base_dir: &Path, what: &'static str) -> ConfigResult<PathBuf> {
    let path = make_path(path, base_dir);
    if !path.is_file() {
        return Err(ConfigError::MissingFile { what, path });
    }
    Ok(path)
}

impl Config {
    /// Validate the configuration
    ///
    /// Relative paths are resolved against `base_dir`, the directory of the
    /// configuration file.
    pub fn into_settings(self, base_dir: &Path) -> ConfigResult<ClientSettings> {
        let log_level = parse_log_level(&self.general.log_level)?;

        if self.server.host.trim().is_empty() {
            return Err(ConfigError::EmptyField("server host"));
        }
        if self.credentials.username.trim().is_empty() {
            return Err(ConfigError::EmptyField("username"));
        }
        if self.collector.api_key.trim().is_empty() {
            return Err(ConfigError::EmptyField("api key"));
        }

        let ca_file = existing_file(&self.server.ca_file, base_dir, "server CA")?;
        let client_certificate = match &self.client.certificate {
            Some(certificate) => Some((
                existing_file(&certificate.cert_file, base_dir, "client certificate")?,
                existing_file(&certificate.key_file, base_dir, "client key")?,
            )),
            None => None,
        };

        let sensors = validate_sensors(self.sensors)?;

        let poll_interval = seconds(self.evaluator.poll_interval, "evaluator poll interval")?;
        if self.server.send_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval("send timeout"));
        }
        let send_timeout = Duration::from_millis(self.server.send_timeout_ms);
        if send_timeout >= poll_interval {
            return Err(ConfigError::SendTimeoutTooLong {
                send_timeout,
                poll_interval,
            });
        }

        Ok(ClientSettings {
            log_level,
            log_file: self.general.log_file.map(|f| make_path(&f, base_dir)),
            host: self.server.host,
            port: self.server.port,
            ca_file,
            client_certificate,
            username: self.credentials.username,
            password: self.credentials.password,
            ping_interval: seconds(self.server.ping_interval, "ping interval")?,
            connect_timeout: seconds(self.server.connect_timeout, "connect timeout")?,
            request_timeout: seconds(self.server.request_timeout, "request timeout")?,
            send_timeout,
            api_key: self.collector.api_key,
            base_url: self.collector.base_url,
            collector_interval: seconds(self.collector.interval, "collector interval")?,
            max_failures: self.collector.max_failures,
            http_timeout: seconds(self.collector.timeout, "collector timeout")?,
            poll_interval,
            notification: self.notification,
            sensors,
        })
    }
}
