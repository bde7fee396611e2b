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

//! HTTP API for the dashboard: chart series, celestial data, live updates over
//! server-sent events, health checks and Prometheus metrics.

use crate::auth::UserRole;
use crate::broker::UpdateBroker;
use crate::cache::{Clock, ComputeError};
use crate::celestial::{local_midnight, CelestialData, CelestialService};
use crate::config::AppConfig;
use crate::readings::{self, Range, SeriesQuery};
use crate::source::{ArchiveRecord, SourceError, WeatherSource};
use crate::statistics::{self, StatisticsData};
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use futures::stream::{self, Stream, StreamExt};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// State shared by every request handler.
pub struct AppContext<S> {
    pub broker: Arc<UpdateBroker<S>>,
    pub celestial: Arc<CelestialService>,
    pub config: AppConfig,
    pub registry: Registry,
    pub clock: Arc<dyn Clock>,
    /// Cancelled when the server is shutting down, ending every open stream
    pub shutdown: CancellationToken,
}

impl<S> AppContext<S>
where
    S: WeatherSource,
{
    pub fn new(
        broker: Arc<UpdateBroker<S>>,
        celestial: Arc<CelestialService>,
        config: AppConfig,
        registry: Registry,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        AppContext {
            broker,
            celestial,
            config,
            registry,
            clock,
            shutdown,
        }
    }

    async fn rows(&self, query: &SeriesQuery) -> Result<Vec<ArchiveRecord>, HttpError> {
        let range = Range::parse(query.range.as_deref());
        let since = range.since(self.clock.now());
        Ok(self.broker.source().records_since(since).await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("data source error: {0}")]
    Source(#[from] SourceError),
    #[error("celestial calculation error: {0}")]
    Celestial(#[from] ComputeError),
    #[error("invalid date {0}")]
    InvalidDate(String),
    #[error("admin role required")]
    Forbidden,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            HttpError::Source(e) => {
                tracing::error!(message = "data source error", error = %e);
                (StatusCode::INTERNAL_SERVER_ERROR, "DB error")
            }
            HttpError::Celestial(e) => {
                tracing::error!(message = "error computing celestial data", error = %e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Celestial calculation error")
            }
            HttpError::InvalidDate(date) => {
                tracing::debug!(message = "invalid date parameter", date = %date);
                (StatusCode::BAD_REQUEST, "Invalid date format (use YYYY-MM-DD)")
            }
            HttpError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden: Admin access required"),
        };

        (status, body).into_response()
    }
}

/// Build the router for all dashboard endpoints.
pub fn router<S>(context: Arc<AppContext<S>>) -> Router
where
    S: WeatherSource,
{
    Router::new()
        .route("/health", get(health::<S>))
        .route("/metrics", get(metrics::<S>))
        .route("/api/ping", get(ping))
        .route("/api/dashboard", get(dashboard::<S>))
        .route("/api/weather", get(weather::<S>))
        .route("/api/barometer", get(barometer::<S>))
        .route("/api/feelslike", get(feels_like::<S>))
        .route("/api/humidity", get(humidity::<S>))
        .route("/api/wind", get(wind::<S>))
        .route("/api/rain", get(rain::<S>))
        .route("/api/lightning", get(lightning::<S>))
        .route("/api/insideTemp", get(inside_temperature::<S>))
        .route("/api/insideHumidity", get(inside_humidity::<S>))
        .route("/api/statistics", get(summary::<S>))
        .route("/api/celestial", get(celestial::<S>))
        .route("/api/stream", get(stream::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "message": "pong" }))
}

async fn health<S: WeatherSource>(State(ctx): State<Arc<AppContext<S>>>) -> Response {
    match ctx.broker.source().ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            tracing::warn!(message = "health check failed", error = %e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "error": "database unreachable" })),
            )
                .into_response()
        }
    }
}

async fn metrics<S: WeatherSource>(State(ctx): State<Arc<AppContext<S>>>) -> Response {
    let mut buf = String::new();

    match encode(&mut buf, &ctx.registry) {
        Ok(()) => {
            tracing::debug!(
                message = "encoded prometheus metrics to text format",
                num_bytes = buf.len(),
            );
            ([(CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Settings the browser needs to render the dashboard.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DashboardSettings {
    client_poll_ms: u64,
    location_name: String,
    latitude: f64,
    longitude: f64,
    timezone: String,
    extreme_heat: f64,
    extreme_cold: f64,
    wind_speed: f64,
    wind_gust: f64,
    is_admin: bool,
    user_role: String,
}

async fn dashboard<S: WeatherSource>(State(ctx): State<Arc<AppContext<S>>>, role: UserRole) -> Json<DashboardSettings> {
    let cfg = &ctx.config;

    Json(DashboardSettings {
        client_poll_ms: cfg.server.client_poll_seconds * 1000,
        location_name: cfg.location.name.clone(),
        latitude: cfg.location.latitude,
        longitude: cfg.location.longitude,
        timezone: cfg.location.timezone.clone(),
        extreme_heat: cfg.alerts.extreme_heat,
        extreme_cold: cfg.alerts.extreme_cold,
        wind_speed: cfg.alerts.wind_speed,
        wind_gust: cfg.alerts.wind_gust,
        is_admin: role.is_admin(),
        user_role: role.role,
    })
}

async fn weather<S: WeatherSource>(
    State(ctx): State<Arc<AppContext<S>>>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<Vec<readings::WeatherReading>>, HttpError> {
    let rows = ctx.rows(&query).await?;
    Ok(Json(readings::weather(&rows)))
}

async fn barometer<S: WeatherSource>(
    State(ctx): State<Arc<AppContext<S>>>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<Vec<readings::BarometerReading>>, HttpError> {
    let rows = ctx.rows(&query).await?;
    Ok(Json(readings::barometer(&rows)))
}

async fn feels_like<S: WeatherSource>(
    State(ctx): State<Arc<AppContext<S>>>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<Vec<readings::FeelsLikeReading>>, HttpError> {
    let rows = ctx.rows(&query).await?;
    Ok(Json(readings::feels_like(&rows)))
}

async fn humidity<S: WeatherSource>(
    State(ctx): State<Arc<AppContext<S>>>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<Vec<readings::HumidityReading>>, HttpError> {
    let rows = ctx.rows(&query).await?;
    Ok(Json(readings::humidity(&rows)))
}

async fn wind<S: WeatherSource>(
    State(ctx): State<Arc<AppContext<S>>>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<Vec<readings::WindReading>>, HttpError> {
    let rows = ctx.rows(&query).await?;
    Ok(Json(readings::wind(&rows, &ctx.config.alerts)))
}

async fn rain<S: WeatherSource>(
    State(ctx): State<Arc<AppContext<S>>>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<Vec<readings::RainReading>>, HttpError> {
    let rows = ctx.rows(&query).await?;
    Ok(Json(readings::rain(&rows, ctx.clock.now())))
}

async fn lightning<S: WeatherSource>(
    State(ctx): State<Arc<AppContext<S>>>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<Vec<readings::LightningReading>>, HttpError> {
    let rows = ctx.rows(&query).await?;
    Ok(Json(readings::lightning(&rows, ctx.clock.now())))
}

async fn inside_temperature<S: WeatherSource>(
    State(ctx): State<Arc<AppContext<S>>>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<Vec<readings::InsideTemperature>>, HttpError> {
    let rows = ctx.rows(&query).await?;
    Ok(Json(readings::inside_temperature(&rows)))
}

async fn inside_humidity<S: WeatherSource>(
    State(ctx): State<Arc<AppContext<S>>>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<Vec<readings::InsideHumidity>>, HttpError> {
    let rows = ctx.rows(&query).await?;
    Ok(Json(readings::inside_humidity(&rows)))
}

/// Range and since-midnight aggregates. "Today" starts at local midnight at the station.
async fn summary<S: WeatherSource>(
    State(ctx): State<Arc<AppContext<S>>>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<StatisticsData>, HttpError> {
    let rows = ctx.rows(&query).await?;
    let midnight = local_midnight(ctx.celestial.timezone(), ctx.celestial.today())
        .map_or_else(|| ctx.clock.now().timestamp(), |m| m.timestamp());

    Ok(Json(statistics::statistics(&rows, midnight)))
}

#[derive(Debug, Default, Deserialize)]
struct CelestialQuery {
    date: Option<String>,
    refresh: Option<String>,
}

async fn celestial<S: WeatherSource>(
    State(ctx): State<Arc<AppContext<S>>>,
    role: UserRole,
    Query(query): Query<CelestialQuery>,
) -> Result<Json<CelestialData>, HttpError> {
    let date = match query.date.as_deref().filter(|d| !d.is_empty()) {
        Some(d) => NaiveDate::parse_from_str(d, "%Y-%m-%d").map_err(|_| HttpError::InvalidDate(d.to_owned()))?,
        None => ctx.celestial.today(),
    };

    let force = matches!(query.refresh.as_deref(), Some("true") | Some("1"));
    if force && !role.is_admin() {
        return Err(HttpError::Forbidden);
    }

    Ok(Json(ctx.celestial.get(date, force).await?))
}

/// Live updates: a `connected` comment, then one `update` event carrying the newest
/// archive row each time the broker sees one. Ends when the client goes away (the
/// subscription is dropped with the stream) or the server shuts down.
async fn stream<S: WeatherSource>(
    State(ctx): State<Arc<AppContext<S>>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let sub = ctx.broker.subscribe();
    let cancel = ctx.shutdown.clone();
    tracing::debug!(message = "opening update stream", subscriber = sub.id());

    let connected = stream::once(async { Ok::<_, Infallible>(Event::default().comment(" connected")) });
    let updates = stream::unfold((sub, cancel), |(mut sub, cancel)| async move {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            msg = sub.recv() => msg,
        }?;

        let event = Event::default().event("update").data(&msg.payload);
        Some((Ok(event), (sub, cancel)))
    });

    Sse::new(connected.chain(updates)).keep_alive(KeepAlive::default())
}
