//! Polling sensors
//!
//! A [`PollingSensor`] is a typed view over the data collector's location
//! cache. All four weather variants share one struct; the variant only
//! decides which value of the cached bundle the sensor reads.
//!
//! ## Level semantics
//!
//! Alert levels double as thresholds. A level is crossed when the measured
//! value is greater than or equal to it. When several levels are crossed the
//! numerically highest one wins:
//!
//! ```text
//! levels [10, 20, 30], value 25  → crossed level 20 → Triggered
//! levels [10, 20, 30], value 30  → crossed level 30 → Triggered
//! levels [10, 20, 30], value 9.5 → no level        → Normal
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Valid forecast day offsets (today, tomorrow, the day after)
pub const FORECAST_DAYS: std::ops::RangeInclusive<i64> = 0..=2;

/// Committed state of a sensor, the only state the server ever sees
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TriggerState {
    #[default]
    Normal,
    Triggered,
}

impl TriggerState {
    /// Numeric representation used on the wire
    pub fn as_wire(self) -> u8 {
        match self {
            TriggerState::Normal => 0,
            TriggerState::Triggered => 1,
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerState::Normal => write!(f, "normal"),
            TriggerState::Triggered => write!(f, "triggered"),
        }
    }
}

/// Key of the location cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    pub city: String,
}

impl Location {
    pub fn new(country: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            city: city.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.country, self.city)
    }
}

/// Which end of the forecast temperature range a sensor reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Extreme {
    High,
    Low,
}

/// The value of a weather bundle a sensor is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measurement {
    Temperature,
    Humidity,
    ForecastTemperature { day: i64, extreme: Extreme },
    ForecastRain { day: i64 },
}

impl Measurement {
    fn forecast_day(&self) -> Option<i64> {
        match self {
            Measurement::ForecastTemperature { day, .. } | Measurement::ForecastRain { day } => {
                Some(*day)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measurement::Temperature => write!(f, "temperature"),
            Measurement::Humidity => write!(f, "humidity"),
            Measurement::ForecastTemperature { day, extreme } => {
                write!(f, "forecast {extreme:?} temperature (day {day})")
            }
            Measurement::ForecastRain { day } => write!(f, "forecast rain (day {day})"),
        }
    }
}

/// Read access to cached measurements
///
/// Implemented by the data collector handle. Lookups must never block on
/// network I/O; `None` means no usable measurement exists right now.
pub trait MeasurementSource: Send + Sync {
    fn value(&self, location: &Location, measurement: &Measurement) -> Option<f64>;
}

/// A sensor backed by the weather data collector
#[derive(Debug, Clone, PartialEq)]
pub struct PollingSensor {
    pub id: u32,
    pub description: String,
    /// Minimum time a threshold crossing has to persist before it is committed
    pub alert_delay: Duration,
    pub alert_levels: Vec<i32>,
    pub trigger_alert: bool,
    pub trigger_alert_normal: bool,
    pub location: Location,
    pub measurement: Measurement,
}

impl PollingSensor {
    /// Validate the sensor's static configuration
    ///
    /// Performs no I/O.
    pub fn initialize(&self) -> ConfigResult<()> {
        if self.description.trim().is_empty() {
            return Err(ConfigError::EmptyDescription(self.id));
        }

        if self.trigger_alert_normal && !self.trigger_alert {
            return Err(ConfigError::TriggerAlertNormalWithoutTriggerAlert(self.id));
        }

        if self.location.country.is_empty() || self.location.city.is_empty() {
            return Err(ConfigError::EmptyLocation(self.id));
        }

        if let Some(day) = self.measurement.forecast_day()
            && !FORECAST_DAYS.contains(&day)
        {
            return Err(ConfigError::InvalidForecastDay { id: self.id, day });
        }

        Ok(())
    }

    /// Current measurement, or `None` if nothing has been fetched yet
    pub fn current_value(&self, source: &dyn MeasurementSource) -> Option<f64> {
        source.value(&self.location, &self.measurement)
    }

    /// Highest configured level that `value` reaches
    pub fn crossed_level(&self, value: f64) -> Option<i32> {
        self.alert_levels
            .iter()
            .copied()
            .filter(|level| value >= f64::from(*level))
            .max()
    }

    /// State the sensor should be in for `value`
    pub fn check_state(&self, value: f64) -> TriggerState {
        match self.crossed_level(value) {
            Some(_) => TriggerState::Triggered,
            None => TriggerState::Normal,
        }
    }
}
