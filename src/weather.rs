//! External weather data source
//!
//! The collector talks to the weather service through [`WeatherSource`], so
//! tests can swap the HTTP implementation for an in-memory one. The HTTP
//! implementation understands the Wunderground `conditions/forecast` JSON
//! layout.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{instrument, trace};

use crate::error::FetchError;
use crate::sensors::{Extreme, Location, Measurement};

/// Number of forecast days kept per bundle
pub const FORECAST_DAY_COUNT: usize = 3;

/// Current conditions at a location
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentConditions {
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
}

/// Forecast for a single day
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastDay {
    pub high: f64,
    pub low: f64,
    /// Probability of precipitation in percent
    pub rain_probability: f64,
}

/// Everything one fetch returns for a location
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherBundle {
    pub current: CurrentConditions,
    /// Today first, at most [`FORECAST_DAY_COUNT`] entries
    pub forecast: Vec<ForecastDay>,
}

impl WeatherBundle {
    /// Pick the value a sensor is interested in
    pub fn value(&self, measurement: &Measurement) -> Option<f64> {
        match *measurement {
            Measurement::Temperature => Some(self.current.temperature),
            Measurement::Humidity => Some(self.current.humidity),
            Measurement::ForecastTemperature { day, extreme } => {
                let day = self.forecast_day(day)?;
                Some(match extreme {
                    Extreme::High => day.high,
                    Extreme::Low => day.low,
                })
            }
            Measurement::ForecastRain { day } => {
                self.forecast_day(day).map(|day| day.rain_probability)
            }
        }
    }

    fn forecast_day(&self, day: i64) -> Option<&ForecastDay> {
        usize::try_from(day).ok().and_then(|day| self.forecast.get(day))
    }
}

/// Fetch-by-location weather API
#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn fetch(&self, location: &Location) -> Result<WeatherBundle, FetchError>;
}

/// Weather source backed by the Wunderground HTTP API
#[derive(Debug, Clone)]
pub struct HttpWeatherSource {
    /// HTTP client (reused across requests)
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpWeatherSource {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, location: &Location) -> String {
        format!(
            "{}/api/{}/conditions/forecast/q/{}/{}.json",
            self.base_url,
            self.api_key,
            location.country.replace(' ', "_"),
            location.city.replace(' ', "_"),
        )
    }
}

#[async_trait]
impl WeatherSource for HttpWeatherSource {
    #[instrument(skip(self), fields(location = %location))]
    async fn fetch(&self, location: &Location) -> Result<WeatherBundle, FetchError> {
        let response = self.client.get(self.url(location)).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        let body = response.text().await?;
        trace!("received {} bytes of weather data", body.len());

        parse_bundle(&body)
    }
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    response: Option<RawMeta>,
    current_observation: Option<RawObservation>,
    forecast: Option<RawForecast>,
}

#[derive(Debug, Deserialize)]
struct RawMeta {
    error: Option<RawApiError>,
}

#[derive(Debug, Deserialize)]
struct RawApiError {
    #[serde(rename = "type")]
    kind: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawObservation {
    temp_c: Value,
    relative_humidity: Value,
}

#[derive(Debug, Deserialize)]
struct RawForecast {
    simpleforecast: RawSimpleForecast,
}

#[derive(Debug, Deserialize)]
struct RawSimpleForecast {
    forecastday: Vec<RawForecastDay>,
}

#[derive(Debug, Deserialize)]
struct RawForecastDay {
    high: RawTemperature,
    low: RawTemperature,
    pop: Value,
}

#[derive(Debug, Deserialize)]
struct RawTemperature {
    celsius: Value,
}

/// Parse a `conditions/forecast` response body
pub fn parse_bundle(body: &str) -> Result<WeatherBundle, FetchError> {
    let raw: RawResponse =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    if let Some(error) = raw.response.and_then(|meta| meta.error) {
        let kind = error.kind.unwrap_or_else(|| "unknown".to_string());
        let description = error.description.unwrap_or_default();
        return Err(FetchError::Api(format!("{kind}: {description}")));
    }

    let observation = raw
        .current_observation
        .ok_or_else(|| FetchError::Malformed("missing current_observation".to_string()))?;
    let forecast = raw
        .forecast
        .ok_or_else(|| FetchError::Malformed("missing forecast".to_string()))?;

    let current = CurrentConditions {
        temperature: number(&observation.temp_c, "temp_c")?,
        humidity: number(&observation.relative_humidity, "relative_humidity")?,
    };

    let forecast = forecast
        .simpleforecast
        .forecastday
        .iter()
        .take(FORECAST_DAY_COUNT)
        .map(|day| {
            Ok(ForecastDay {
                high: number(&day.high.celsius, "high.celsius")?,
                low: number(&day.low.celsius, "low.celsius")?,
                rain_probability: number(&day.pop, "pop")?,
            })
        })
        .collect::<Result<Vec<_>, FetchError>>()?;

    Ok(WeatherBundle { current, forecast })
}

/// The API mixes numbers, numeric strings and percentages ("65%")
fn number(value: &Value, field: &str) -> Result<f64, FetchError> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    };

    parsed.ok_or_else(|| FetchError::Malformed(format!("field '{field}' is not numeric: {value}")))
}
