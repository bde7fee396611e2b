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

//! Dashboard backend for a personal weather station
//!
//! ## Features
//!
//! `weatherdash` serves the data behind a browser dashboard for a [weewx] weather station. It reads
//! the weewx `archive` table from MySQL and exposes it over HTTP.
//!
//! * Chart series for temperature, pressure, humidity, wind, rain, lightning and indoor sensors
//!   over the last day, week or month.
//! * Highs, lows, totals and wind averages for the range and for today so far.
//! * Live updates pushed to every open dashboard over server-sent events as soon as weewx
//!   writes a new archive row.
//! * Sunrise, sunset, twilight, golden hour, blue hour, moonrise and moon phase for the
//!   station location, computed once per day and cached until local midnight.
//! * Prometheus metrics about connected streams, polling and the celestial cache.
//!
//! [weewx]: https://weewx.com/
//!
//! ## Build
//!
//! `weatherdash` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Configuration
//!
//! `weatherdash` reads a YAML configuration file, `config.yaml` in the current directory by
//! default. See `config.example.yaml` for every available setting.
//!
//! ```yaml
//! db:
//!   user: weewx
//!   password: secret
//!   host: localhost
//!   port: 3306
//!   name: weewx
//! server:
//!   port: 8081
//!   sse_poll_seconds: 60
//!   client_poll_seconds: 60
//! location:
//!   name: Rita Ranch
//!   latitude: 32.093174
//!   longitude: -110.777557
//!   timezone: America/Phoenix
//! alerts:
//!   wind_speed: 20
//!   wind_gust: 25
//! ```
//!
//! ### Run
//!
//! The database must be reachable when `weatherdash` starts, otherwise it exits immediately.
//!
//! ```text
//! ./weatherdash --config /etc/weatherdash/config.yaml
//! ```
//!
//! ### Live updates
//!
//! Browsers connect to `/api/stream`. Every `sse_poll_seconds` the server checks for a newer
//! archive row and sends it to each connected browser as an `update` event containing the
//! row as JSON. Browsers that fall behind miss updates rather than slowing anyone else down.
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed at `/metrics` on the same port as the dashboard API.
//!

pub mod astro;
pub mod auth;
pub mod broker;
pub mod cache;
pub mod celestial;
pub mod config;
pub mod http;
pub mod metrics;
pub mod readings;
pub mod source;
pub mod statistics;
