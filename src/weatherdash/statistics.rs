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

//! Summary statistics over a range of archive rows, reported both for the whole range and
//! for the part of it since local midnight.

use crate::source::ArchiveRecord;
use serde::Serialize;

const MISSING: &str = "--";

/// Aggregates shown in the statistics panel. Every pair has a `*Today` value covering rows
/// since local midnight and a `*Range` value covering the requested range.
///
/// High/low pairs are formatted as `"hi / lo"`, and values with no data as `"--"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsData {
    pub rain_today: f64,
    pub rain_range: f64,
    pub strikes_today: u64,
    pub strikes_range: u64,
    pub temp_today: String,
    pub temp_range: String,
    pub feels_today: String,
    pub feels_range: String,
    pub windchill_today: String,
    pub windchill_range: String,
    pub dew_today: String,
    pub dew_range: String,
    pub humidity_today: String,
    pub humidity_range: String,
    pub barometer_today: String,
    pub barometer_range: String,
    pub wind_avg_today: String,
    pub wind_avg_range: String,
    pub wind_max_today: String,
    pub wind_max_range: String,
    pub wind_rms_today: String,
    pub wind_rms_range: String,
    pub wind_vector_today: String,
    pub wind_vector_range: String,
    pub wind_vector_dir_today: String,
    pub wind_vector_dir_range: String,
    pub rain_rate_today: String,
    pub rain_rate_range: String,
    pub lightning_dist_today: String,
    pub lightning_dist_range: String,
    pub inside_temp_today: String,
    pub inside_temp_range: String,
    pub inside_hum_today: String,
    pub inside_hum_range: String,
}

/// Summarize `rows` (ascending, all within the requested range). Rows at or after
/// `midnight` (epoch seconds) also count towards the "today" values.
pub fn statistics(rows: &[ArchiveRecord], midnight: i64) -> StatisticsData {
    let mut range = Window::default();
    let mut today = Window::default();

    for row in rows {
        range.observe(row);
        if row.date_time >= midnight {
            today.observe(row);
        }
    }

    StatisticsData {
        rain_today: today.rain,
        rain_range: range.rain,
        strikes_today: today.strikes,
        strikes_range: range.strikes,
        temp_today: today.temp.format(1),
        temp_range: range.temp.format(1),
        feels_today: today.feels.format(1),
        feels_range: range.feels.format(1),
        windchill_today: format_opt(today.wind_chill.lo, 1),
        windchill_range: format_opt(range.wind_chill.lo, 1),
        dew_today: today.dewpoint.format(1),
        dew_range: range.dewpoint.format(1),
        humidity_today: today.humidity.format(0),
        humidity_range: range.humidity.format(0),
        barometer_today: today.barometer.format(2),
        barometer_range: range.barometer.format(2),
        wind_avg_today: format_opt(today.wind.average(), 0),
        wind_avg_range: format_opt(range.wind.average(), 0),
        wind_max_today: today.wind.max_gust(),
        wind_max_range: range.wind.max_gust(),
        wind_rms_today: format_opt(today.wind.rms(), 0),
        wind_rms_range: format_opt(range.wind.rms(), 0),
        wind_vector_today: format_opt(today.wind.vector().map(|(speed, _)| speed), 0),
        wind_vector_range: format_opt(range.wind.vector().map(|(speed, _)| speed), 0),
        wind_vector_dir_today: format_opt(today.wind.vector().map(|(_, dir)| dir), 0),
        wind_vector_dir_range: format_opt(range.wind.vector().map(|(_, dir)| dir), 0),
        rain_rate_today: format!("{:.2}", today.max_rain_rate),
        rain_rate_range: format!("{:.2}", range.max_rain_rate),
        lightning_dist_today: format_opt(today.closest_lightning, 1),
        lightning_dist_range: format_opt(range.closest_lightning, 1),
        inside_temp_today: today.inside_temp.format(1),
        inside_temp_range: range.inside_temp.format(1),
        inside_hum_today: today.inside_humidity.format(0),
        inside_hum_range: range.inside_humidity.format(0),
    }
}

fn format_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", precision, v),
        None => MISSING.to_owned(),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Extremes {
    hi: Option<f64>,
    lo: Option<f64>,
}

impl Extremes {
    fn observe(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.hi = Some(self.hi.map_or(v, |hi| hi.max(v)));
            self.lo = Some(self.lo.map_or(v, |lo| lo.min(v)));
        }
    }

    fn format(&self, precision: usize) -> String {
        match (self.hi, self.lo) {
            (Some(hi), Some(lo)) => format!("{:.*} / {:.*}", precision, hi, precision, lo),
            _ => MISSING.to_owned(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WindStats {
    count: u32,
    sum: f64,
    sum_squares: f64,
    // Components of the speed-weighted direction vector
    x: f64,
    y: f64,
    max_gust: f64,
    max_gust_dir: Option<f64>,
}

impl WindStats {
    fn observe(&mut self, row: &ArchiveRecord) {
        if let Some(speed) = row.wind_speed {
            self.count += 1;
            self.sum += speed;
            self.sum_squares += speed * speed;

            if let Some(dir) = row.wind_dir {
                let rad = dir.to_radians();
                self.x += speed * rad.cos();
                self.y += speed * rad.sin();
            }
        }

        if let Some(gust) = row.wind_gust.filter(|g| *g > self.max_gust) {
            self.max_gust = gust;
            if row.wind_dir.is_some() {
                self.max_gust_dir = row.wind_dir;
            }
        }
    }

    fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / f64::from(self.count))
    }

    fn rms(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.sum_squares / f64::from(self.count)).sqrt())
    }

    /// Mean wind vector as (speed, direction in degrees). `None` without any directional
    /// samples or when they cancel out exactly.
    fn vector(&self) -> Option<(f64, f64)> {
        if self.count == 0 || (self.x == 0.0 && self.y == 0.0) {
            return None;
        }

        let speed = self.x.hypot(self.y) / f64::from(self.count);
        let dir = self.y.atan2(self.x).to_degrees().rem_euclid(360.0);
        Some((speed, dir))
    }

    /// Strongest gust with its direction, e.g. `"35 • 270"`.
    fn max_gust(&self) -> String {
        if self.max_gust <= 0.0 {
            return MISSING.to_owned();
        }

        match self.max_gust_dir {
            Some(dir) => format!("{:.0} • {:.0}", self.max_gust, dir),
            None => format!("{:.0}", self.max_gust),
        }
    }
}

#[derive(Debug, Default)]
struct Window {
    rain: f64,
    strikes: u64,
    max_rain_rate: f64,
    closest_lightning: Option<f64>,
    temp: Extremes,
    feels: Extremes,
    wind_chill: Extremes,
    dewpoint: Extremes,
    humidity: Extremes,
    barometer: Extremes,
    inside_temp: Extremes,
    inside_humidity: Extremes,
    wind: WindStats,
}

impl Window {
    fn observe(&mut self, row: &ArchiveRecord) {
        self.rain += row.rain.unwrap_or_default();
        self.strikes += row.lightning_strike_count.map_or(0, |c| c.max(0.0) as u64);

        if let Some(rate) = row.rain_rate {
            self.max_rain_rate = self.max_rain_rate.max(rate);
        }

        // Zero distance means no strike was detected
        if let Some(d) = row.lightning_distance.filter(|d| *d > 0.0) {
            self.closest_lightning = Some(self.closest_lightning.map_or(d, |c| c.min(d)));
        }

        self.temp.observe(row.out_temp);
        self.feels.observe(row.heat_index.or(row.wind_chill).or(row.out_temp));
        self.wind_chill.observe(row.wind_chill);
        self.dewpoint.observe(row.dewpoint);
        self.humidity.observe(row.out_humidity);
        self.barometer.observe(row.barometer);
        self.inside_temp.observe(row.in_temp);
        self.inside_humidity.observe(row.in_humidity);
        self.wind.observe(row);
    }
}

#[cfg(test)]
mod test {
    use super::statistics;
    use crate::source::ArchiveRecord;

    const MIDNIGHT: i64 = 1_717_225_200;

    fn row(minutes_after_midnight: i64) -> ArchiveRecord {
        ArchiveRecord {
            date_time: MIDNIGHT + minutes_after_midnight * 60,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_rows() {
        let stats = statistics(&[], MIDNIGHT);
        assert_eq!(0.0, stats.rain_range);
        assert_eq!(0, stats.strikes_today);
        assert_eq!("--", stats.temp_range);
        assert_eq!("--", stats.wind_avg_today);
        assert_eq!("--", stats.wind_max_range);
        assert_eq!("--", stats.lightning_dist_range);
        assert_eq!("0.00", stats.rain_rate_today);
    }

    #[test]
    fn test_today_is_a_subset_of_range() {
        let rows = vec![
            ArchiveRecord {
                out_temp: Some(70.3),
                out_humidity: Some(40.0),
                barometer: Some(29.851),
                rain: Some(0.10),
                lightning_strike_count: Some(3.0),
                rain_rate: Some(0.5),
                ..row(-60)
            },
            ArchiveRecord {
                out_temp: Some(88.0),
                out_humidity: Some(12.4),
                barometer: Some(29.92),
                rain: Some(0.02),
                lightning_strike_count: Some(2.0),
                rain_rate: Some(0.12),
                ..row(0)
            },
            ArchiveRecord {
                out_temp: Some(95.5),
                out_humidity: Some(9.0),
                barometer: Some(30.004),
                ..row(60)
            },
        ];

        let stats = statistics(&rows, MIDNIGHT);
        assert!((stats.rain_range - 0.12).abs() < 1e-9);
        assert!((stats.rain_today - 0.02).abs() < 1e-9);
        assert_eq!(5, stats.strikes_range);
        assert_eq!(2, stats.strikes_today);
        assert_eq!("95.5 / 70.3", stats.temp_range);
        assert_eq!("95.5 / 88.0", stats.temp_today);
        assert_eq!("40 / 9", stats.humidity_range);
        assert_eq!("30.00 / 29.85", stats.barometer_range);
        assert_eq!("30.00 / 29.92", stats.barometer_today);
        assert_eq!("0.50", stats.rain_rate_range);
        assert_eq!("0.12", stats.rain_rate_today);
    }

    #[test]
    fn test_feels_like_prefers_heat_index_then_wind_chill() {
        let rows = vec![
            ArchiveRecord {
                out_temp: Some(98.0),
                heat_index: Some(104.0),
                ..row(10)
            },
            ArchiveRecord {
                out_temp: Some(40.0),
                wind_chill: Some(33.0),
                ..row(20)
            },
            ArchiveRecord {
                out_temp: Some(60.0),
                ..row(30)
            },
        ];

        let stats = statistics(&rows, MIDNIGHT);
        assert_eq!("104.0 / 33.0", stats.feels_today);
        assert_eq!("33.0", stats.windchill_today);
        assert_eq!("98.0 / 40.0", stats.temp_today);
    }

    #[test]
    fn test_wind() {
        let rows = vec![
            ArchiveRecord {
                wind_speed: Some(10.0),
                wind_dir: Some(90.0),
                wind_gust: Some(18.0),
                ..row(5)
            },
            ArchiveRecord {
                wind_speed: Some(20.0),
                wind_dir: Some(90.0),
                wind_gust: Some(31.4),
                ..row(10)
            },
            ArchiveRecord {
                wind_speed: Some(0.0),
                wind_gust: Some(25.0),
                ..row(15)
            },
        ];

        let stats = statistics(&rows, MIDNIGHT);
        assert_eq!("10", stats.wind_avg_today);
        // sqrt((100 + 400 + 0) / 3)
        assert_eq!("13", stats.wind_rms_today);
        assert_eq!("10", stats.wind_vector_today);
        assert_eq!("90", stats.wind_vector_dir_today);
        assert_eq!("31 • 90", stats.wind_max_today);
    }

    #[test]
    fn test_wind_vector_wraps_to_compass_degrees() {
        let rows = vec![ArchiveRecord {
            wind_speed: Some(8.0),
            wind_dir: Some(270.0),
            ..row(5)
        }];

        let stats = statistics(&rows, MIDNIGHT);
        assert_eq!("8", stats.wind_vector_range);
        assert_eq!("270", stats.wind_vector_dir_range);
        assert_eq!("--", stats.wind_max_range);
    }

    #[test]
    fn test_closest_lightning_ignores_zero_distance() {
        let rows = vec![
            ArchiveRecord {
                lightning_distance: Some(6.0),
                ..row(-30)
            },
            ArchiveRecord {
                lightning_distance: Some(0.0),
                ..row(5)
            },
            ArchiveRecord {
                lightning_distance: Some(11.5),
                ..row(10)
            },
        ];

        let stats = statistics(&rows, MIDNIGHT);
        assert_eq!("6.0", stats.lightning_dist_range);
        assert_eq!("11.5", stats.lightning_dist_today);
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(statistics(&[], MIDNIGHT)).unwrap();
        assert!(json.get("rainToday").is_some());
        assert!(json.get("windVectorDirRange").is_some());
        assert!(json.get("insideHumToday").is_some());
        assert!(json.get("lightningDistRange").is_some());
    }
}
