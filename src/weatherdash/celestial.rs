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

//! Daily sun and moon data for the station location, cached until the next local
//! midnight and refreshed in the background shortly after each midnight.

use crate::astro::{self, Body, Coordinates, RiseSet};
use crate::cache::{Clock, ComputeCache, ComputeError};
use crate::metrics::CacheMetrics;
use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Minutes after local midnight that the background refresh runs.
const REFRESH_MINUTES_AFTER_MIDNIGHT: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CelestialError {
    #[error("invalid coordinates: latitude {0}, longitude {1}")]
    InvalidCoordinates(f64, f64),
    #[error("date {0} cannot be resolved in timezone {1}")]
    InvalidDate(NaiveDate, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CelestialKey {
    pub date: NaiveDate,
    pub timezone: Tz,
}

impl CelestialKey {
    pub fn new(date: NaiveDate, timezone: Tz) -> Self {
        CelestialKey { date, timezone }
    }
}

impl fmt::Display for CelestialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.date.format("%Y-%m-%d"), self.timezone.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoonPhaseData {
    pub fraction: f64,
    pub elongation: f64,
    pub waxing: bool,
    pub name: &'static str,
    pub percentage: u32,
}

/// Sun and moon events for a single local day. Every instant is given both as a UTC
/// timestamp and as a local `HH:MM` string. Events that don't happen that day are left out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CelestialData {
    pub date: String,
    pub timezone: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sunrise: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sunrise24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sunset: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sunset24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daylight_hours: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daylight_hours_formatted: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub moonrise: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moonrise24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moonset: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moonset24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moon_phase: Option<MoonPhaseData>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub civil_dawn: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub civil_dawn24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub civil_dusk: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub civil_dusk24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nautical_dawn: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nautical_dawn24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nautical_dusk: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nautical_dusk24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub astronomical_dawn: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub astronomical_dawn24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub astronomical_dusk: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub astronomical_dusk24: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub golden_hour_morning_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub golden_hour_morning_start24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub golden_hour_morning_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub golden_hour_morning_end24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub golden_hour_evening_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub golden_hour_evening_start24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub golden_hour_evening_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub golden_hour_evening_end24: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub blue_hour_morning_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blue_hour_morning_start24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blue_hour_morning_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blue_hour_morning_end24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blue_hour_evening_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blue_hour_evening_start24: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blue_hour_evening_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blue_hour_evening_end24: Option<String>,
}

/// Resolve a wall clock time on `date` in `tz` to an instant. Ambiguous times (clocks
/// going back) resolve to the earlier instant, skipped times (clocks going forward)
/// to an hour later.
pub fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    let resolved = match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => tz.from_local_datetime(&(naive + Duration::hours(1))).earliest(),
    };

    resolved.map(|t| t.with_timezone(&Utc))
}

pub fn local_midnight(tz: Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    local_instant(tz, date, NaiveTime::from_hms_opt(0, 0, 0)?)
}

/// Instant at which data for `key` goes stale: the start of the following local day.
pub fn expiry(key: &CelestialKey) -> DateTime<Utc> {
    key.date
        .succ_opt()
        .and_then(|next| local_midnight(key.timezone, next))
        // Unrepresentable dates are never kept
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Next time the background refresh should run after `now`.
pub fn next_refresh(tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let run_at = NaiveTime::from_hms_opt(0, REFRESH_MINUTES_AFTER_MIDNIGHT, 0)?;
    let today = now.with_timezone(&tz).date_naive();
    let candidate = local_instant(tz, today, run_at)?;

    if candidate > now {
        Some(candidate)
    } else {
        local_instant(tz, today.succ_opt()?, run_at)
    }
}

fn clock_time(t: Option<DateTime<Utc>>, tz: Tz) -> Option<String> {
    t.map(|t| t.with_timezone(&tz).format("%H:%M").to_string())
}

fn format_hours(hours: f64) -> String {
    let whole = hours.trunc() as u32;
    let minutes = ((hours - hours.trunc()) * 60.0) as u32;
    format!("{}h {}m", whole, minutes)
}

/// Compute all sun and moon events for the local day `date` in `tz`.
pub fn compute_celestial(coords: Coordinates, date: NaiveDate, tz: Tz) -> Result<CelestialData, CelestialError> {
    if !coords.is_valid() {
        return Err(CelestialError::InvalidCoordinates(coords.latitude, coords.longitude));
    }

    let invalid = || CelestialError::InvalidDate(date, tz.name());
    let start = local_midnight(tz, date).ok_or_else(invalid)?;
    let end = date
        .succ_opt()
        .and_then(|next| local_midnight(tz, next))
        .ok_or_else(invalid)?;
    let noon = NaiveTime::from_hms_opt(12, 0, 0)
        .and_then(|t| local_instant(tz, date, t))
        .ok_or_else(invalid)?;

    let sun = |threshold: f64| astro::crossings(Body::Sun, coords, start, end, threshold);
    let sunrise = sun(astro::SUNRISE_ALTITUDE);
    let civil = sun(astro::CIVIL_TWILIGHT);
    let nautical = sun(astro::NAUTICAL_TWILIGHT);
    let astronomical = sun(astro::ASTRONOMICAL_TWILIGHT);
    let golden_low = sun(astro::GOLDEN_HOUR_LOW);
    let golden_high = sun(astro::GOLDEN_HOUR_HIGH);
    let blue_low = sun(astro::BLUE_HOUR_LOW);
    let moon = astro::crossings(Body::Moon, coords, start, end, astro::MOONRISE_ALTITUDE);
    let phase = astro::moon_phase(noon);

    let daylight_hours = match (sunrise.rise, sunrise.set) {
        (Some(rise), Some(set)) if set > rise => Some((set - rise).num_seconds() as f64 / 3600.0),
        (None, None) if astro::altitude(Body::Sun, coords, noon) > astro::SUNRISE_ALTITUDE => Some(24.0),
        (None, None) => Some(0.0),
        _ => None,
    };

    // Both ends of a window have to happen for the window to be reported
    let window = |a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>| match (a, b) {
        (Some(a), Some(b)) => (Some(a), Some(b)),
        _ => (None, None),
    };
    let (golden_morning_start, golden_morning_end) = window(golden_low.rise, golden_high.rise);
    let (golden_evening_start, golden_evening_end) = window(golden_high.set, golden_low.set);
    let (blue_morning_start, blue_morning_end) = window(blue_low.rise, golden_low.rise);
    let (blue_evening_start, blue_evening_end) = window(golden_low.set, blue_low.set);

    let hm = |t: Option<DateTime<Utc>>| clock_time(t, tz);
    let RiseSet { rise: sunrise_at, set: sunset_at } = sunrise;

    Ok(CelestialData {
        date: date.format("%Y-%m-%d").to_string(),
        timezone: tz.name().to_owned(),
        sunrise: sunrise_at,
        sunrise24: hm(sunrise_at),
        sunset: sunset_at,
        sunset24: hm(sunset_at),
        daylight_hours,
        daylight_hours_formatted: daylight_hours.map(format_hours),
        moonrise: moon.rise,
        moonrise24: hm(moon.rise),
        moonset: moon.set,
        moonset24: hm(moon.set),
        moon_phase: Some(MoonPhaseData {
            fraction: phase.fraction,
            elongation: phase.elongation,
            waxing: phase.waxing,
            name: phase.name,
            percentage: (phase.fraction * 100.0) as u32,
        }),
        civil_dawn: civil.rise,
        civil_dawn24: hm(civil.rise),
        civil_dusk: civil.set,
        civil_dusk24: hm(civil.set),
        nautical_dawn: nautical.rise,
        nautical_dawn24: hm(nautical.rise),
        nautical_dusk: nautical.set,
        nautical_dusk24: hm(nautical.set),
        astronomical_dawn: astronomical.rise,
        astronomical_dawn24: hm(astronomical.rise),
        astronomical_dusk: astronomical.set,
        astronomical_dusk24: hm(astronomical.set),
        golden_hour_morning_start: golden_morning_start,
        golden_hour_morning_start24: hm(golden_morning_start),
        golden_hour_morning_end: golden_morning_end,
        golden_hour_morning_end24: hm(golden_morning_end),
        golden_hour_evening_start: golden_evening_start,
        golden_hour_evening_start24: hm(golden_evening_start),
        golden_hour_evening_end: golden_evening_end,
        golden_hour_evening_end24: hm(golden_evening_end),
        blue_hour_morning_start: blue_morning_start,
        blue_hour_morning_start24: hm(blue_morning_start),
        blue_hour_morning_end: blue_morning_end,
        blue_hour_morning_end24: hm(blue_morning_end),
        blue_hour_evening_start: blue_evening_start,
        blue_hour_evening_start24: hm(blue_evening_start),
        blue_hour_evening_end: blue_evening_end,
        blue_hour_evening_end24: hm(blue_evening_end),
    })
}

/// Cached access to celestial data for one location.
#[derive(Debug)]
pub struct CelestialService {
    cache: ComputeCache<CelestialKey, CelestialData>,
    coords: Coordinates,
    tz: Tz,
}

impl CelestialService {
    pub fn new(coords: Coordinates, tz: Tz, clock: Arc<dyn Clock>, metrics: CacheMetrics) -> Self {
        CelestialService {
            cache: ComputeCache::new(clock, metrics),
            coords,
            tz,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Current date at the station location.
    pub fn today(&self) -> NaiveDate {
        self.cache.clock().now().with_timezone(&self.tz).date_naive()
    }

    pub fn cached_days(&self) -> usize {
        self.cache.len()
    }

    /// Celestial data for `date`, computing it at most once per day no matter how many
    /// callers ask at the same time. `force` recomputes even if there is a cached value.
    pub async fn get(&self, date: NaiveDate, force: bool) -> Result<CelestialData, ComputeError> {
        let key = CelestialKey::new(date, self.tz);
        let coords = self.coords;
        let tz = self.tz;

        self.cache
            .get_or_generate(
                key,
                force,
                move || async move {
                    // Sampling a whole day is CPU bound, keep it off the async workers
                    match tokio::task::spawn_blocking(move || compute_celestial(coords, date, tz)).await {
                        Ok(Ok(data)) => Ok(data),
                        Ok(Err(e)) => Err(ComputeError::Failed(e.to_string())),
                        Err(e) if e.is_cancelled() => Err(ComputeError::Cancelled),
                        Err(e) => Err(ComputeError::Failed(e.to_string())),
                    }
                },
                expiry,
            )
            .await
    }

    /// Recompute today and tomorrow and drop stale days from the cache.
    pub async fn refresh(&self) {
        let today = self.today();
        let days = [Some(today), today.succ_opt()];

        for date in days.into_iter().flatten() {
            match self.get(date, true).await {
                Ok(_) => tracing::info!(message = "refreshed celestial data", date = %date),
                Err(e) => tracing::warn!(message = "failed to refresh celestial data", date = %date, error = %e),
            }
        }

        let purged = self.cache.purge_expired();
        if purged > 0 {
            tracing::debug!(message = "purged expired celestial data", entries = purged);
        }
    }

    /// Run `refresh` shortly after every local midnight until `cancel` fires.
    pub async fn run_daily_refresh(&self, cancel: CancellationToken) {
        loop {
            let now = self.cache.clock().now();
            let next = match next_refresh(self.tz, now) {
                Some(next) => next,
                None => {
                    tracing::error!(message = "unable to schedule celestial refresh", now = %now);
                    return;
                }
            };

            let wait = (next - now).to_std().unwrap_or_default();
            tracing::info!(
                message = "next celestial refresh scheduled",
                at = %next.with_timezone(&self.tz),
                wait_secs = wait.as_secs(),
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(message = "stopping celestial refresh");
                    return;
                }
                _ = tokio::time::sleep(wait) => self.refresh().await,
            }
        }
    }
}
