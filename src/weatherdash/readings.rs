// weatherdash - Dashboard backend for a personal weather station
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Chart series built from archive rows, one shape per dashboard panel.
//!
//! Each series takes the rows for the requested range in ascending time order. Rows that
//! are missing a column the series needs are skipped. Derived values (pressure trend,
//! compass heading, "recently active" flags) are only attached to the newest reading.

use crate::config::AlertsConfig;
use crate::source::ArchiveRecord;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Barometer change (inHg per hour) considered rapid.
const RAPID_CHANGE: f64 = 0.06;
/// Barometer change (inHg per hour) considered a slow rise or fall.
const SLOW_CHANGE: f64 = 0.02;
/// Readings back from the newest used for the pressure trend. With five minute archive
/// intervals this spans 25 minutes, hence the 2.4 scaling to get a change per hour.
const TREND_LOOKBACK: usize = 5;
const TREND_HOURLY_SCALE: f64 = 2.4;
const HIGH_PRESSURE: f64 = 30.20;
const LOW_PRESSURE: f64 = 29.80;

const HEAT_INDEX_MIN_TEMP: f64 = 80.0;
const WIND_CHILL_MAX_TEMP: f64 = 50.0;

const COMPASS_POINTS: [&str; 16] = [
    "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW", "NW", "NNW",
];

/// How long "recently active" looks back for rain or lightning.
pub fn activity_window() -> Duration {
    Duration::minutes(10)
}

/// Time span covered by a series request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Range {
    #[default]
    Day,
    Week,
    Month,
}

impl Range {
    /// Parse a `range` query parameter. Anything unrecognized is a day.
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(str::to_ascii_lowercase).as_deref() {
            Some("week") => Range::Week,
            Some("month") => Range::Month,
            _ => Range::Day,
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            Range::Day => Duration::hours(24),
            Range::Week => Duration::days(7),
            Range::Month => Duration::days(30),
        }
    }

    /// Epoch seconds of the oldest row in range, relative to `now`.
    pub fn since(self, now: DateTime<Utc>) -> i64 {
        (now - self.duration()).timestamp()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SeriesQuery {
    pub range: Option<String>,
}

fn timestamp(r: &ArchiveRecord) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(r.date_time, 0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherReading {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub dewpoint: f64,
}

pub fn weather(rows: &[ArchiveRecord]) -> Vec<WeatherReading> {
    rows.iter()
        .filter_map(|r| {
            Some(WeatherReading {
                timestamp: timestamp(r)?,
                temperature: r.out_temp?,
                dewpoint: r.dewpoint?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PressureTrend {
    RapidRise,
    SlowRise,
    Steady,
    SlowFall,
    RapidFall,
}

impl PressureTrend {
    fn from_change(change: f64) -> Self {
        let hourly = change.abs() * TREND_HOURLY_SCALE;
        if change > 0.0 {
            if hourly >= RAPID_CHANGE {
                PressureTrend::RapidRise
            } else if hourly >= SLOW_CHANGE {
                PressureTrend::SlowRise
            } else {
                PressureTrend::Steady
            }
        } else if change < 0.0 {
            if hourly >= RAPID_CHANGE {
                PressureTrend::RapidFall
            } else if hourly >= SLOW_CHANGE {
                PressureTrend::SlowFall
            } else {
                PressureTrend::Steady
            }
        } else {
            PressureTrend::Steady
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    High,
    Normal,
    Low,
}

impl PressureLevel {
    fn from_pressure(p: f64) -> Self {
        if p > HIGH_PRESSURE {
            PressureLevel::High
        } else if p < LOW_PRESSURE {
            PressureLevel::Low
        } else {
            PressureLevel::Normal
        }
    }
}

fn forecast(level: PressureLevel, trend: PressureTrend) -> &'static str {
    use PressureLevel::*;
    use PressureTrend::*;

    match (level, trend) {
        (High, Steady | SlowRise) => "Fair weather",
        (High, RapidRise) => "Fair, improving",
        (High, SlowFall) => "Cloudy later",
        (High, RapidFall) => "Warmer, cloudier",
        (Normal, Steady | SlowRise) => "Conditions continue",
        (Normal, RapidRise) => "Improving",
        (Normal, SlowFall) => "Minor changes",
        (Normal, RapidFall) => "Rain/snow likely",
        (Low, Steady | SlowRise) => "Cooler, clearing",
        (Low, RapidRise) => "Improving quickly",
        (Low, SlowFall) => "Rain coming",
        (Low, RapidFall) => "Stormy weather",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarometerReading {
    pub timestamp: DateTime<Utc>,
    pub pressure: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<PressureTrend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<PressureLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast: Option<&'static str>,
}

pub fn barometer(rows: &[ArchiveRecord]) -> Vec<BarometerReading> {
    let mut readings: Vec<BarometerReading> = rows
        .iter()
        .filter_map(|r| {
            Some(BarometerReading {
                timestamp: timestamp(r)?,
                pressure: r.barometer?,
                trend: None,
                level: None,
                forecast: None,
            })
        })
        .collect();

    let len = readings.len();
    if len >= TREND_LOOKBACK {
        let prior = readings[len - TREND_LOOKBACK].pressure;
        let latest = &mut readings[len - 1];
        let level = PressureLevel::from_pressure(latest.pressure);
        let trend = PressureTrend::from_change(latest.pressure - prior);

        latest.level = Some(level);
        latest.trend = Some(trend);
        latest.forecast = Some(forecast(level, trend));
    }

    readings
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeelsLikeSource {
    Heat,
    Chill,
    Air,
}

impl FeelsLikeSource {
    fn label(self) -> &'static str {
        match self {
            FeelsLikeSource::Heat => "Heat Index",
            FeelsLikeSource::Chill => "Wind Chill",
            FeelsLikeSource::Air => "Air Temp",
        }
    }
}

/// Pick which of heat index, wind chill or air temperature best describes how it feels.
pub fn pick_feels_like(temp: f64, heat_index: f64, wind_chill: f64) -> (f64, FeelsLikeSource) {
    let usable = |v: f64| !v.is_nan() && v != 0.0;

    if usable(heat_index) && temp >= HEAT_INDEX_MIN_TEMP {
        (heat_index, FeelsLikeSource::Heat)
    } else if usable(wind_chill) && temp <= WIND_CHILL_MAX_TEMP {
        (wind_chill, FeelsLikeSource::Chill)
    } else {
        (temp, FeelsLikeSource::Air)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeelsLikeReading {
    pub timestamp: DateTime<Utc>,
    pub heat_index: f64,
    pub wind_chill: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_source: Option<FeelsLikeSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_label: Option<&'static str>,
}

pub fn feels_like(rows: &[ArchiveRecord]) -> Vec<FeelsLikeReading> {
    let mut latest_temp = None;
    let mut readings: Vec<FeelsLikeReading> = rows
        .iter()
        .filter_map(|r| {
            let reading = FeelsLikeReading {
                timestamp: timestamp(r)?,
                heat_index: r.heat_index?,
                wind_chill: r.wind_chill?,
                active_value: None,
                active_source: None,
                active_label: None,
            };
            latest_temp = r.out_temp;
            Some(reading)
        })
        .collect();

    if let (Some(latest), Some(temp)) = (readings.last_mut(), latest_temp) {
        let (value, source) = pick_feels_like(temp, latest.heat_index, latest.wind_chill);
        latest.active_value = Some(value);
        latest.active_source = Some(source);
        latest.active_label = Some(source.label());
    }

    readings
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HumidityReading {
    pub timestamp: DateTime<Utc>,
    pub humidity: f64,
}

pub fn humidity(rows: &[ArchiveRecord]) -> Vec<HumidityReading> {
    rows.iter()
        .filter_map(|r| {
            Some(HumidityReading {
                timestamp: timestamp(r)?,
                humidity: r.out_humidity?,
            })
        })
        .collect()
}

/// 16 point compass name for a heading in degrees, `--` if there isn't one.
pub fn compass(degrees: f64) -> &'static str {
    if !degrees.is_finite() {
        return "--";
    }

    let index = (degrees.rem_euclid(360.0) / 22.5).round() as usize % COMPASS_POINTS.len();
    COMPASS_POINTS[index]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindReading {
    pub timestamp: DateTime<Utc>,
    pub speed: f64,
    pub gust: f64,
    /// Heading in degrees, null when calm
    pub direction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compass: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strong: Option<bool>,
}

pub fn wind(rows: &[ArchiveRecord], alerts: &AlertsConfig) -> Vec<WindReading> {
    let mut readings: Vec<WindReading> = rows
        .iter()
        .filter_map(|r| {
            Some(WindReading {
                timestamp: timestamp(r)?,
                speed: r.wind_speed?,
                gust: r.wind_gust?,
                direction: r.wind_dir,
                compass: None,
                strong: None,
            })
        })
        .collect();

    if let Some(latest) = readings.last_mut() {
        latest.compass = Some(latest.direction.map(compass).unwrap_or("--"));
        latest.strong = Some(latest.speed >= alerts.wind_speed || latest.gust >= alerts.wind_gust);
    }

    readings
}

/// Whether any reading within the activity window before `now` satisfies `active`.
/// Readings are expected oldest first.
fn recently_active<T, F, A>(readings: &[T], now: DateTime<Utc>, ts: F, active: A) -> bool
where
    F: Fn(&T) -> DateTime<Utc>,
    A: Fn(&T) -> bool,
{
    let cutoff = now - activity_window();
    readings
        .iter()
        .rev()
        .take_while(|r| ts(r) >= cutoff)
        .any(active)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RainReading {
    pub timestamp: DateTime<Utc>,
    pub rate: f64,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recently_active: Option<bool>,
}

pub fn rain(rows: &[ArchiveRecord], now: DateTime<Utc>) -> Vec<RainReading> {
    let mut readings: Vec<RainReading> = rows
        .iter()
        .filter_map(|r| {
            Some(RainReading {
                timestamp: timestamp(r)?,
                rate: r.rain_rate?,
                amount: r.rain?,
                recently_active: None,
            })
        })
        .collect();

    let active = recently_active(&readings, now, |r| r.timestamp, |r| r.rate > 0.0 || r.amount > 0.0);
    if let Some(latest) = readings.last_mut() {
        latest.recently_active = Some(active);
    }

    readings
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LightningReading {
    pub timestamp: DateTime<Utc>,
    pub strikes: f64,
    /// Distance to the most recent strike, null when the sensor didn't report one
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recently_active: Option<bool>,
}

pub fn lightning(rows: &[ArchiveRecord], now: DateTime<Utc>) -> Vec<LightningReading> {
    let mut readings: Vec<LightningReading> = rows
        .iter()
        .filter_map(|r| {
            Some(LightningReading {
                timestamp: timestamp(r)?,
                strikes: r.lightning_strike_count?,
                distance: r.lightning_distance,
                recently_active: None,
            })
        })
        .collect();

    let active = recently_active(&readings, now, |r| r.timestamp, |r| r.strikes > 0.0);
    if let Some(latest) = readings.last_mut() {
        latest.recently_active = Some(active);
    }

    readings
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsideTemperature {
    pub timestamp: DateTime<Utc>,
    pub inside_temp_f: f64,
}

pub fn inside_temperature(rows: &[ArchiveRecord]) -> Vec<InsideTemperature> {
    rows.iter()
        .filter_map(|r| {
            Some(InsideTemperature {
                timestamp: timestamp(r)?,
                inside_temp_f: r.in_temp?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsideHumidity {
    pub timestamp: DateTime<Utc>,
    pub inside_humidity: f64,
}

pub fn inside_humidity(rows: &[ArchiveRecord]) -> Vec<InsideHumidity> {
    rows.iter()
        .filter_map(|r| {
            Some(InsideHumidity {
                timestamp: timestamp(r)?,
                inside_humidity: r.in_humidity?,
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::{
        barometer, compass, feels_like, lightning, pick_feels_like, rain, weather, wind, FeelsLikeSource,
        PressureLevel, PressureTrend, Range,
    };
    use crate::config::AlertsConfig;
    use crate::source::ArchiveRecord;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    const BASE: i64 = 1_717_243_200;

    fn row(offset_minutes: i64) -> ArchiveRecord {
        ArchiveRecord {
            date_time: BASE + offset_minutes * 60,
            ..Default::default()
        }
    }

    fn at(offset_minutes: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(BASE + offset_minutes * 60, 0).unwrap()
    }

    fn pressures(values: &[f64]) -> Vec<ArchiveRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, p)| ArchiveRecord {
                barometer: Some(*p),
                ..row(i as i64 * 5)
            })
            .collect()
    }

    #[test]
    fn test_range_parse() {
        assert_eq!(Range::Day, Range::parse(None));
        assert_eq!(Range::Week, Range::parse(Some("WEEK")));
        assert_eq!(Range::Month, Range::parse(Some("month")));
        assert_eq!(Range::Day, Range::parse(Some("year")));
        assert_eq!(Duration::days(30), Range::Month.duration());
    }

    #[test]
    fn test_weather_skips_incomplete_rows() {
        let rows = vec![
            ArchiveRecord {
                out_temp: Some(85.1),
                dewpoint: Some(40.2),
                ..row(0)
            },
            ArchiveRecord {
                out_temp: Some(85.4),
                ..row(5)
            },
        ];

        let readings = weather(&rows);
        assert_eq!(1, readings.len());
        assert_eq!(at(0), readings[0].timestamp);
        assert_eq!(85.1, readings[0].temperature);
    }

    #[test]
    fn test_barometer_needs_five_readings_for_trend() {
        let readings = barometer(&pressures(&[30.0, 30.01, 30.02, 30.03]));
        assert_eq!(4, readings.len());
        assert!(readings.iter().all(|r| r.trend.is_none()));
    }

    #[test]
    fn test_barometer_rapid_fall_low() {
        // 0.04 over 25 minutes is ~0.096 per hour
        let readings = barometer(&pressures(&[29.80, 29.79, 29.78, 29.77, 29.76]));
        let latest = readings.last().unwrap();

        assert_eq!(Some(PressureTrend::RapidFall), latest.trend);
        assert_eq!(Some(PressureLevel::Low), latest.level);
        assert_eq!(Some("Stormy weather"), latest.forecast);
        assert!(readings[0].trend.is_none());
    }

    #[test]
    fn test_barometer_slow_rise_high() {
        let readings = barometer(&pressures(&[30.21, 30.25, 30.22, 30.23, 30.22]));
        let latest = readings.last().unwrap();

        // 0.01 rise over the window, 0.024 per hour
        assert_eq!(Some(PressureTrend::SlowRise), latest.trend);
        assert_eq!(Some(PressureLevel::High), latest.level);
        assert_eq!(Some("Fair weather"), latest.forecast);
    }

    #[test]
    fn test_barometer_json() {
        let readings = barometer(&pressures(&[30.0, 30.0, 30.0, 30.0, 30.0]));
        let json = serde_json::to_value(&readings).unwrap();

        assert!(json[0].get("trend").is_none());
        assert_eq!("steady", json[4]["trend"]);
        assert_eq!("normal", json[4]["level"]);
        assert_eq!("Conditions continue", json[4]["forecast"]);
    }

    #[test]
    fn test_pick_feels_like() {
        assert_eq!((104.0, FeelsLikeSource::Heat), pick_feels_like(95.0, 104.0, 95.0));
        assert_eq!((30.0, FeelsLikeSource::Chill), pick_feels_like(38.0, 38.0, 30.0));
        assert_eq!((65.0, FeelsLikeSource::Air), pick_feels_like(65.0, 65.0, 65.0));
        // Zero means the station didn't compute a value
        assert_eq!((85.0, FeelsLikeSource::Air), pick_feels_like(85.0, 0.0, 85.0));
    }

    #[test]
    fn test_feels_like_latest_only() {
        let rows = vec![
            ArchiveRecord {
                out_temp: Some(96.0),
                heat_index: Some(101.0),
                wind_chill: Some(96.0),
                ..row(0)
            },
            ArchiveRecord {
                out_temp: Some(97.0),
                heat_index: Some(102.5),
                wind_chill: Some(97.0),
                ..row(5)
            },
        ];

        let readings = feels_like(&rows);
        assert_eq!(None, readings[0].active_value);
        assert_eq!(Some(102.5), readings[1].active_value);
        assert_eq!(Some("Heat Index"), readings[1].active_label);

        let json = serde_json::to_value(&readings).unwrap();
        assert_eq!("heat", json[1]["activeSource"]);
        assert_eq!(102.5, json[1]["heatIndex"]);
    }

    #[test]
    fn test_compass() {
        assert_eq!("N", compass(0.0));
        assert_eq!("N", compass(355.0));
        assert_eq!("NNE", compass(22.5));
        assert_eq!("SW", compass(225.0));
        assert_eq!("--", compass(f64::NAN));
    }

    #[test]
    fn test_wind_strong() {
        let alerts = AlertsConfig::default();
        let rows = vec![
            ArchiveRecord {
                wind_speed: Some(4.0),
                wind_gust: Some(6.0),
                wind_dir: Some(180.0),
                ..row(0)
            },
            ArchiveRecord {
                wind_speed: Some(12.0),
                wind_gust: Some(26.0),
                wind_dir: None,
                ..row(5)
            },
        ];

        let readings = wind(&rows, &alerts);
        assert_eq!(None, readings[0].compass);
        assert_eq!(Some("--"), readings[1].compass);
        assert_eq!(Some(true), readings[1].strong);
    }

    #[test]
    fn test_rain_recently_active() {
        let rows = vec![
            ArchiveRecord {
                rain_rate: Some(0.1),
                rain: Some(0.01),
                ..row(0)
            },
            ArchiveRecord {
                rain_rate: Some(0.0),
                rain: Some(0.0),
                ..row(5)
            },
        ];

        assert_eq!(Some(true), rain(&rows, at(10)).last().unwrap().recently_active);
        // First reading is now outside the window
        assert_eq!(Some(false), rain(&rows, at(11)).last().unwrap().recently_active);
    }

    #[test]
    fn test_lightning_recently_active() {
        let rows = vec![
            ArchiveRecord {
                lightning_strike_count: Some(3.0),
                lightning_distance: Some(12.0),
                ..row(0)
            },
            ArchiveRecord {
                lightning_distance: Some(8.0),
                ..row(5)
            },
        ];

        let readings = lightning(&rows, at(6));
        assert_eq!(1, readings.len());
        assert_eq!(Some(true), readings[0].recently_active);

        let json = serde_json::to_value(&readings).unwrap();
        assert_eq!(true, json[0]["recentlyActive"]);
        assert_eq!(12.0, json[0]["distance"]);
    }
}
