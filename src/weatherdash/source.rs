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

//! Access to the weewx `archive` table.
//!
//! The broker and the HTTP handlers only depend on the [`WeatherSource`] trait so
//! they can be exercised against in-memory fakes. [`MySqlArchive`] is the production
//! implementation backed by a `sqlx` connection pool.

use serde::Serialize;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("unable to connect to database: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("malformed data: {0}")]
    Malformed(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// One row of the archive table. Every sensor field is independently nullable.
///
/// When serialized, `dateTime` becomes `timestamp` and null fields are omitted so
/// that browsers only overwrite values the station actually reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct ArchiveRecord {
    #[serde(rename = "timestamp")]
    #[sqlx(rename = "dateTime")]
    pub date_time: i64,
    #[serde(rename = "outTemp", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "outTemp")]
    pub out_temp: Option<f64>,
    #[serde(rename = "dewpoint", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "dewpoint")]
    pub dewpoint: Option<f64>,
    #[serde(rename = "barometer", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "barometer")]
    pub barometer: Option<f64>,
    #[serde(rename = "outHumidity", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "outHumidity")]
    pub out_humidity: Option<f64>,
    #[serde(rename = "windSpeed", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "windSpeed")]
    pub wind_speed: Option<f64>,
    #[serde(rename = "windGust", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "windGust")]
    pub wind_gust: Option<f64>,
    #[serde(rename = "windDir", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "windDir")]
    pub wind_dir: Option<f64>,
    #[serde(rename = "rainRate", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "rainRate")]
    pub rain_rate: Option<f64>,
    #[serde(rename = "rain", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "rain")]
    pub rain: Option<f64>,
    #[serde(rename = "lightning_strike_count", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "lightning_strike_count")]
    pub lightning_strike_count: Option<f64>,
    #[serde(rename = "lightning_distance", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "lightning_distance")]
    pub lightning_distance: Option<f64>,
    #[serde(rename = "inTemp", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "inTemp")]
    pub in_temp: Option<f64>,
    #[serde(rename = "inHumidity", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "inHumidity")]
    pub in_humidity: Option<f64>,
    #[serde(rename = "heatindex", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "heatindex")]
    pub heat_index: Option<f64>,
    #[serde(rename = "windchill", skip_serializing_if = "Option::is_none")]
    #[sqlx(rename = "windchill")]
    pub wind_chill: Option<f64>,
}

/// Read access to archived station readings.
pub trait WeatherSource: Send + Sync + 'static {
    /// Verify that the source is reachable.
    fn ping(&self) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// The newest change marker (max `dateTime`), or `None` if there are no rows yet.
    fn latest_marker(&self) -> impl Future<Output = Result<Option<i64>, SourceError>> + Send;

    /// The most recent full row.
    fn latest_record(&self) -> impl Future<Output = Result<ArchiveRecord, SourceError>> + Send;

    /// All rows with `dateTime >= since`, oldest first.
    fn records_since(&self, since: i64) -> impl Future<Output = Result<Vec<ArchiveRecord>, SourceError>> + Send;
}

const RECORD_COLUMNS: &str = "CAST(dateTime AS SIGNED) AS dateTime, outTemp, dewpoint, barometer, outHumidity, \
     windSpeed, windGust, windDir, rainRate, rain, lightning_strike_count, lightning_distance, \
     inTemp, inHumidity, heatindex, windchill";

#[derive(Debug, Clone)]
pub struct MySqlArchive {
    pool: MySqlPool,
}

impl MySqlArchive {
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SourceError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .connect(url)
            .await
            .map_err(SourceError::Connection)?;

        Ok(Self { pool })
    }
}

impl WeatherSource for MySqlArchive {
    async fn ping(&self) -> Result<(), SourceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SourceError::Query)?;
        Ok(())
    }

    async fn latest_marker(&self) -> Result<Option<i64>, SourceError> {
        sqlx::query_scalar::<_, Option<i64>>("SELECT CAST(MAX(dateTime) AS SIGNED) FROM archive")
            .fetch_one(&self.pool)
            .await
            .map_err(SourceError::Query)
    }

    async fn latest_record(&self) -> Result<ArchiveRecord, SourceError> {
        let sql = format!(
            "SELECT {} FROM archive WHERE dateTime IS NOT NULL ORDER BY dateTime DESC LIMIT 1",
            RECORD_COLUMNS
        );

        sqlx::query_as::<_, ArchiveRecord>(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(SourceError::Query)?
            .ok_or_else(|| SourceError::Malformed("archive has no rows".to_owned()))
    }

    async fn records_since(&self, since: i64) -> Result<Vec<ArchiveRecord>, SourceError> {
        let sql = format!(
            "SELECT {} FROM archive WHERE dateTime >= ? ORDER BY dateTime ASC",
            RECORD_COLUMNS
        );

        sqlx::query_as::<_, ArchiveRecord>(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(SourceError::Query)
    }
}

#[cfg(test)]
mod test {
    use super::ArchiveRecord;

    #[test]
    fn test_record_serialization_omits_nulls() {
        let record = ArchiveRecord {
            date_time: 1717243200,
            out_temp: Some(91.5),
            wind_dir: None,
            lightning_strike_count: Some(0.0),
            ..Default::default()
        };

        let json = serde_json::to_value(&record).unwrap();
        let obj = json.as_object().unwrap();

        assert_eq!(3, obj.len());
        assert_eq!(1717243200, obj["timestamp"]);
        assert_eq!(91.5, obj["outTemp"]);
        assert_eq!(0.0, obj["lightning_strike_count"]);
        assert!(!obj.contains_key("windDir"));
    }
}
