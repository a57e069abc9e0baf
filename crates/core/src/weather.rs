//! Weather lookups: the backend seam, the OpenWeather client and an adapter
//! that reaches the weather tool server through the connection manager.

use crate::{
    error::{BackendError, ToolServerError},
    tools::{ToolInvoker, WEATHER_SERVER, joined_text},
};
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

pub const DEFAULT_GEO_URL: &str = "https://api.openweathermap.org/geo/1.0/direct";
pub const DEFAULT_DATA_URL: &str = "https://api.openweathermap.org/data/2.5";

/// Cities recognised in an utterance when the classifier extracted none.
pub const CITY_GAZETTEER: &[&str] = &[
    "北京", "上海", "广州", "深圳", "杭州", "南京", "成都", "重庆", "武汉", "西安", "天津", "青岛",
    "大连", "厦门", "苏州", "无锡", "宁波", "长沙", "郑州", "沈阳",
];

/// The first gazetteer city mentioned in `text`.
pub fn find_known_city(text: &str) -> Option<&'static str> {
    CITY_GAZETTEER
        .iter()
        .filter_map(|city| text.find(city).map(|pos| (pos, *city)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, city)| city)
}

/// Which weather query to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeatherQuery {
    /// Current conditions.
    Now,
    /// Today's aggregated forecast.
    Today,
    /// Multi-day forecast.
    Forecast,
}

impl WeatherQuery {
    /// Maps a time entity onto a query. Anything that is not "now" or
    /// "today" asks for the multi-day forecast.
    pub fn from_qualifier(qualifier: Option<&str>) -> Self {
        match qualifier.map(|q| q.trim().to_lowercase()).as_deref() {
            Some("现在" | "当前" | "此刻" | "now" | "current") => WeatherQuery::Now,
            Some("今天" | "今日" | "today") => WeatherQuery::Today,
            _ => WeatherQuery::Forecast,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            WeatherQuery::Now => "now",
            WeatherQuery::Today => "today",
            WeatherQuery::Forecast => "forecast",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    pub location: String,
    /// Local time of the observation, `YYYY-MM-DD HH:MM`.
    pub observed_at: String,
    pub temperature: f64,
    pub feels_like: f64,
    pub condition: String,
    pub humidity: f64,
    pub wind_speed: f64,
    pub pressure: f64,
    pub clouds: f64,
    pub visibility: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyForecast {
    /// Local calendar date, `YYYY-MM-DD`.
    pub date: String,
    pub temp_max: f64,
    pub temp_min: f64,
    pub feels_like: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub visibility: Option<f64>,
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeatherReport {
    Current(CurrentConditions),
    Forecast {
        location: String,
        days: Vec<DailyForecast>,
    },
}

/// Source of weather reports.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WeatherBackend: Send + Sync {
    async fn get_weather(
        &self,
        location: &str,
        query: WeatherQuery,
    ) -> Result<WeatherReport, BackendError>;
}

#[derive(Debug, Deserialize)]
struct GeoCity {
    name: String,
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp: f64,
    feels_like: f64,
    temp_min: f64,
    temp_max: f64,
    pressure: f64,
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct Description {
    description: String,
}

#[derive(Debug, Deserialize)]
struct Wind {
    speed: f64,
}

#[derive(Debug, Default, Deserialize)]
struct Clouds {
    all: f64,
}

#[derive(Debug, Deserialize)]
struct CurrentResponse {
    name: String,
    dt: i64,
    #[serde(default)]
    timezone: i64,
    main: MainBlock,
    #[serde(default)]
    weather: Vec<Description>,
    wind: Wind,
    #[serde(default)]
    clouds: Clouds,
    visibility: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ForecastCity {
    name: String,
    #[serde(default)]
    timezone: i64,
}

#[derive(Debug, Deserialize)]
struct ForecastEntry {
    dt: i64,
    main: MainBlock,
    #[serde(default)]
    weather: Vec<Description>,
    wind: Wind,
    visibility: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    city: ForecastCity,
    list: Vec<ForecastEntry>,
}

fn local_time(timestamp: i64, offset_secs: i64, format: &str) -> String {
    DateTime::from_timestamp(timestamp + offset_secs, 0)
        .map(|t| t.naive_utc().format(format).to_string())
        .unwrap_or_default()
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| round1(sum / count as f64))
}

impl From<CurrentResponse> for CurrentConditions {
    fn from(data: CurrentResponse) -> Self {
        Self {
            observed_at: local_time(data.dt, data.timezone, "%Y-%m-%d %H:%M"),
            location: data.name,
            temperature: data.main.temp,
            feels_like: data.main.feels_like,
            condition: data
                .weather
                .into_iter()
                .map(|w| w.description)
                .collect::<Vec<_>>()
                .join("，"),
            humidity: data.main.humidity,
            wind_speed: data.wind.speed,
            pressure: data.main.pressure,
            clouds: data.clouds.all,
            visibility: data.visibility,
        }
    }
}

/// Groups three-hourly forecast entries into local calendar days, in order
/// of first appearance.
fn aggregate_daily(entries: &[ForecastEntry], offset_secs: i64) -> Vec<DailyForecast> {
    let mut groups: Vec<(String, Vec<&ForecastEntry>)> = Vec::new();
    for entry in entries {
        let date = local_time(entry.dt, offset_secs, "%Y-%m-%d");
        match groups.iter_mut().find(|(d, _)| *d == date) {
            Some((_, items)) => items.push(entry),
            None => groups.push((date, vec![entry])),
        }
    }

    groups
        .into_iter()
        .map(|(date, items)| {
            let mut conditions: Vec<&str> = Vec::new();
            for part in items
                .iter()
                .flat_map(|i| i.weather.iter())
                .flat_map(|w| w.description.split('，'))
                .map(str::trim)
                .filter(|p| !p.is_empty())
            {
                if !conditions.contains(&part) {
                    conditions.push(part);
                }
            }
            DailyForecast {
                date,
                temp_max: items
                    .iter()
                    .map(|i| i.main.temp_max)
                    .fold(f64::NEG_INFINITY, f64::max),
                temp_min: items
                    .iter()
                    .map(|i| i.main.temp_min)
                    .fold(f64::INFINITY, f64::min),
                feels_like: mean(items.iter().map(|i| i.main.feels_like)).unwrap_or_default(),
                humidity: mean(items.iter().map(|i| i.main.humidity)).unwrap_or_default(),
                wind_speed: mean(items.iter().map(|i| i.wind.speed)).unwrap_or_default(),
                visibility: mean(items.iter().filter_map(|i| i.visibility)),
                condition: conditions.join("，"),
            }
        })
        .collect()
}

/// Client for the OpenWeather geocoding, current-weather and forecast APIs.
pub struct OpenWeatherClient {
    http: reqwest::Client,
    api_key: String,
    geo_url: String,
    data_url: String,
    country: String,
    units: String,
    lang: String,
}

impl OpenWeatherClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_key: api_key.into(),
            geo_url: DEFAULT_GEO_URL.to_string(),
            data_url: DEFAULT_DATA_URL.to_string(),
            country: "CN".to_string(),
            units: "metric".to_string(),
            lang: "zh_cn".to_string(),
        }
    }

    /// Points the client at different endpoints, e.g. a local mock server.
    pub fn with_base_urls(mut self, geo_url: impl Into<String>, data_url: impl Into<String>) -> Self {
        self.geo_url = geo_url.into();
        self.data_url = data_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_locale(
        mut self,
        country: impl Into<String>,
        units: impl Into<String>,
        lang: impl Into<String>,
    ) -> Self {
        self.country = country.into();
        self.units = units.into();
        self.lang = lang.into();
        self
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BackendError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Unavailable(format!("HTTP {status}")));
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| BackendError::Malformed(e.to_string()))
    }

    async fn resolve_city(&self, location: &str) -> Result<GeoCity, BackendError> {
        let q = format!("{location},{}", self.country);
        let request = self
            .http
            .get(&self.geo_url)
            .query(&[("q", q.as_str()), ("limit", "1"), ("appid", self.api_key.as_str())]);
        let cities: Vec<GeoCity> = self.fetch(request).await?;
        let city = cities
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::LocationNotFound(location.to_string()))?;
        debug!(location, resolved = %city.name, lat = city.lat, lon = city.lon, "Resolved city");
        Ok(city)
    }

    fn data_request(&self, endpoint: &str, city: &GeoCity) -> RequestBuilder {
        self.http
            .get(format!("{}/{endpoint}", self.data_url))
            .query(&[
                ("lat", city.lat.to_string()),
                ("lon", city.lon.to_string()),
                ("appid", self.api_key.clone()),
                ("units", self.units.clone()),
                ("lang", self.lang.clone()),
            ])
    }
}

#[async_trait]
impl WeatherBackend for OpenWeatherClient {
    async fn get_weather(
        &self,
        location: &str,
        query: WeatherQuery,
    ) -> Result<WeatherReport, BackendError> {
        let city = self.resolve_city(location).await?;
        let report = match query {
            WeatherQuery::Now => {
                let data: CurrentResponse = self.fetch(self.data_request("weather", &city)).await?;
                WeatherReport::Current(data.into())
            }
            WeatherQuery::Today | WeatherQuery::Forecast => {
                let data: ForecastResponse =
                    self.fetch(self.data_request("forecast", &city)).await?;
                let mut days = aggregate_daily(&data.list, data.city.timezone);
                if query == WeatherQuery::Today {
                    days.truncate(1);
                }
                WeatherReport::Forecast {
                    location: data.city.name,
                    days,
                }
            }
        };
        info!(location, query = query.label(), "Fetched weather");
        Ok(report)
    }
}

/// Reaches the weather tool server's `query_weather` tool.
pub struct ToolServerWeather {
    tools: Arc<dyn ToolInvoker>,
}

impl ToolServerWeather {
    pub fn new(tools: Arc<dyn ToolInvoker>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl WeatherBackend for ToolServerWeather {
    async fn get_weather(
        &self,
        location: &str,
        query: WeatherQuery,
    ) -> Result<WeatherReport, BackendError> {
        let tools = self.tools.clone();
        let mut arguments = serde_json::Map::new();
        arguments.insert("city".into(), json!(location));
        arguments.insert("time".into(), json!(query.label()));

        let outcome = tokio::task::spawn_blocking(move || {
            tools.call_tool(WEATHER_SERVER, "query_weather", arguments)
        })
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let contents = outcome.map_err(|e| match e {
            ToolServerError::ToolError { message, .. } if message.contains("location not found") => {
                BackendError::LocationNotFound(location.to_string())
            }
            other => BackendError::Unavailable(other.to_string()),
        })?;
        serde_json::from_str(&joined_text(&contents))
            .map_err(|e| BackendError::Malformed(e.to_string()))
    }
}
