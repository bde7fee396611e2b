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

//! Low precision sun and moon positions, good to about a minute for rise and set
//! times at mid latitudes.
//!
//! Positions use the abbreviated series from the Astronomical Almanac. Events (rise,
//! set, twilight boundaries) are found by sampling a body's altitude over a window and
//! interpolating where it crosses a threshold, which works the same for every body and
//! handles days where an event doesn't happen at all.

use chrono::{DateTime, Duration, Utc};
use std::f64::consts::PI;

/// Sun altitude at sunrise/sunset: refraction plus the solar semi-diameter.
pub const SUNRISE_ALTITUDE: f64 = -0.833;
pub const CIVIL_TWILIGHT: f64 = -6.0;
pub const NAUTICAL_TWILIGHT: f64 = -12.0;
pub const ASTRONOMICAL_TWILIGHT: f64 = -18.0;
/// Golden hour is while the sun is between these altitudes.
pub const GOLDEN_HOUR_LOW: f64 = -4.0;
pub const GOLDEN_HOUR_HIGH: f64 = 6.0;
/// Blue hour is while the sun is between these altitudes.
pub const BLUE_HOUR_LOW: f64 = -6.0;
pub const BLUE_HOUR_HIGH: f64 = -4.0;
/// Moon altitude at moonrise/moonset, accounting for mean parallax, refraction and
/// semi-diameter.
pub const MOONRISE_ALTITUDE: f64 = 0.125;

const SAMPLE_MINUTES: i64 = 5;
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const J2000_JD: f64 = 2_451_545.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    /// Degrees, north positive
    pub latitude: f64,
    /// Degrees, east positive
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Coordinates { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    Sun,
    Moon,
}

/// First upward and first downward crossing of an altitude within a window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RiseSet {
    pub rise: Option<DateTime<Utc>>,
    pub set: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoonPhase {
    /// Illuminated fraction of the disk, 0 to 1
    pub fraction: f64,
    /// Angular distance between the sun and moon, 0 to 180 degrees
    pub elongation: f64,
    pub waxing: bool,
    pub name: &'static str,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    right_ascension: f64,
    declination: f64,
    ecliptic_longitude: f64,
}

fn sin_deg(d: f64) -> f64 {
    d.to_radians().sin()
}

fn normalize_degrees(d: f64) -> f64 {
    d.rem_euclid(360.0)
}

pub fn julian_day(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 86_400_000.0 + UNIX_EPOCH_JD
}

fn obliquity(n: f64) -> f64 {
    (23.439 - 0.000_000_4 * n).to_radians()
}

fn sun_position(jd: f64) -> Position {
    let n = jd - J2000_JD;
    let mean_longitude = normalize_degrees(280.460 + 0.985_647_4 * n);
    let mean_anomaly = normalize_degrees(357.528 + 0.985_600_3 * n).to_radians();
    let lambda = (mean_longitude + 1.915 * mean_anomaly.sin() + 0.020 * (2.0 * mean_anomaly).sin()).to_radians();
    let eps = obliquity(n);

    Position {
        right_ascension: (eps.cos() * lambda.sin()).atan2(lambda.cos()),
        declination: (eps.sin() * lambda.sin()).asin(),
        ecliptic_longitude: normalize_degrees(lambda.to_degrees()),
    }
}

fn moon_position(jd: f64) -> Position {
    let n = jd - J2000_JD;
    let t = n / 36_525.0;

    let lambda = 218.32 + 481_267.881 * t + 6.29 * sin_deg(135.0 + 477_198.87 * t)
        - 1.27 * sin_deg(259.3 - 413_335.36 * t)
        + 0.66 * sin_deg(235.7 + 890_534.22 * t)
        + 0.21 * sin_deg(269.9 + 954_397.74 * t)
        - 0.19 * sin_deg(357.5 + 35_999.05 * t)
        - 0.11 * sin_deg(186.5 + 966_404.03 * t);
    let beta = 5.13 * sin_deg(93.3 + 483_202.02 * t) + 0.28 * sin_deg(228.2 + 960_400.89 * t)
        - 0.28 * sin_deg(318.3 + 6_003.15 * t)
        - 0.17 * sin_deg(217.6 - 407_332.21 * t);

    let eps = obliquity(n);
    let l = lambda.to_radians();
    let b = beta.to_radians();

    Position {
        right_ascension: (l.sin() * eps.cos() - b.tan() * eps.sin()).atan2(l.cos()),
        declination: (b.sin() * eps.cos() + b.cos() * eps.sin() * l.sin()).asin(),
        ecliptic_longitude: normalize_degrees(lambda),
    }
}

fn position(body: Body, jd: f64) -> Position {
    match body {
        Body::Sun => sun_position(jd),
        Body::Moon => moon_position(jd),
    }
}

/// Geometric altitude of `body` above the horizon at `t`, in degrees.
pub fn altitude(body: Body, coords: Coordinates, t: DateTime<Utc>) -> f64 {
    let jd = julian_day(t);
    let pos = position(body, jd);
    let gmst = normalize_degrees(280.460_618_37 + 360.985_647_366_29 * (jd - J2000_JD));
    let hour_angle = (gmst + coords.longitude).to_radians() - pos.right_ascension;
    let lat = coords.latitude.to_radians();

    (lat.sin() * pos.declination.sin() + lat.cos() * pos.declination.cos() * hour_angle.cos())
        .asin()
        .to_degrees()
}

/// Find the first time `body` rises through and the first time it sets through
/// `threshold` degrees of altitude between `start` and `end`.
pub fn crossings(body: Body, coords: Coordinates, start: DateTime<Utc>, end: DateTime<Utc>, threshold: f64) -> RiseSet {
    let step = Duration::minutes(SAMPLE_MINUTES);
    let mut out = RiseSet::default();

    let mut prev_t = start;
    let mut prev = altitude(body, coords, start) - threshold;

    while prev_t < end && (out.rise.is_none() || out.set.is_none()) {
        let t = if prev_t + step > end { end } else { prev_t + step };
        let cur = altitude(body, coords, t) - threshold;

        if out.rise.is_none() && prev < 0.0 && cur >= 0.0 {
            out.rise = Some(interpolate(prev_t, t, prev, cur));
        }
        if out.set.is_none() && prev >= 0.0 && cur < 0.0 {
            out.set = Some(interpolate(prev_t, t, prev, cur));
        }

        prev = cur;
        prev_t = t;
    }

    out
}

fn interpolate(t0: DateTime<Utc>, t1: DateTime<Utc>, a0: f64, a1: f64) -> DateTime<Utc> {
    let span = (t1 - t0).num_milliseconds() as f64;
    let frac = if a1 == a0 { 0.0 } else { -a0 / (a1 - a0) };
    t0 + Duration::milliseconds((span * frac).round() as i64)
}

/// Phase of the moon at `t`.
pub fn moon_phase(t: DateTime<Utc>) -> MoonPhase {
    let jd = julian_day(t);
    let sun = sun_position(jd);
    let moon = moon_position(jd);

    // Difference in ecliptic longitude: 0 new, 90 first quarter, 180 full, 270 last quarter
    let age = normalize_degrees(moon.ecliptic_longitude - sun.ecliptic_longitude);
    let fraction = (1.0 - (age * PI / 180.0).cos()) / 2.0;
    let elongation = if age > 180.0 { 360.0 - age } else { age };

    MoonPhase {
        fraction,
        elongation,
        waxing: age < 180.0,
        name: phase_name(age),
    }
}

fn phase_name(age: f64) -> &'static str {
    match age {
        a if !(22.5..337.5).contains(&a) => "New Moon",
        a if a < 67.5 => "Waxing Crescent",
        a if a < 112.5 => "First Quarter",
        a if a < 157.5 => "Waxing Gibbous",
        a if a < 202.5 => "Full Moon",
        a if a < 247.5 => "Waning Gibbous",
        a if a < 292.5 => "Last Quarter",
        _ => "Waning Crescent",
    }
}

#[cfg(test)]
mod test {
    use super::{altitude, crossings, moon_phase, Body, Coordinates, MOONRISE_ALTITUDE, SUNRISE_ALTITUDE};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    const RITA_RANCH: Coordinates = Coordinates {
        latitude: 32.093174,
        longitude: -110.777557,
    };

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn assert_near(expected: DateTime<Utc>, actual: Option<DateTime<Utc>>) {
        let actual = actual.expect("expected an event");
        let diff = (actual - expected).num_seconds().abs();
        assert!(diff <= 180, "expected {} got {} ({}s off)", expected, actual, diff);
    }

    #[test]
    fn test_sunrise_sunset_arizona_summer() {
        // Local midnight in Arizona (UTC-7, no DST)
        let start = utc(2024, 6, 1, 7, 0);
        let res = crossings(Body::Sun, RITA_RANCH, start, start + Duration::days(1), SUNRISE_ALTITUDE);

        // 05:17 and 19:25 local
        assert_near(utc(2024, 6, 1, 12, 17), res.rise);
        assert_near(utc(2024, 6, 2, 2, 25), res.set);
    }

    #[test]
    fn test_moonrise_moonset_arizona() {
        let start = utc(2024, 6, 1, 7, 0);
        let res = crossings(Body::Moon, RITA_RANCH, start, start + Duration::days(1), MOONRISE_ALTITUDE);

        // 01:54 and 14:29 local
        assert_near(utc(2024, 6, 1, 8, 54), res.rise);
        assert_near(utc(2024, 6, 1, 21, 29), res.set);
    }

    #[test]
    fn test_polar_day_has_no_sunrise() {
        let tromso = Coordinates::new(69.65, 18.96);
        let start = utc(2024, 6, 20, 22, 0);
        let res = crossings(Body::Sun, tromso, start, start + Duration::days(1), SUNRISE_ALTITUDE);

        assert_eq!(None, res.rise);
        assert_eq!(None, res.set);
        assert!(altitude(Body::Sun, tromso, start) > 0.0);
    }

    #[test]
    fn test_moon_phase_new_and_full() {
        let new = moon_phase(utc(2024, 6, 6, 19, 0));
        assert_eq!("New Moon", new.name);
        assert!(new.fraction < 0.01);

        let full = moon_phase(utc(2024, 6, 22, 19, 0));
        assert_eq!("Full Moon", full.name);
        assert!(full.fraction > 0.98);
        assert!(full.elongation > 170.0);
    }

    #[test]
    fn test_moon_phase_waning_crescent() {
        let phase = moon_phase(utc(2024, 6, 1, 19, 0));
        assert_eq!("Waning Crescent", phase.name);
        assert!(!phase.waxing);
        assert!((phase.fraction - 0.27).abs() < 0.02);
    }

    #[test]
    fn test_coordinates_validation() {
        assert!(RITA_RANCH.is_valid());
        assert!(!Coordinates::new(91.0, 0.0).is_valid());
        assert!(!Coordinates::new(0.0, f64::NAN).is_valid());
    }
}
