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

use clap::Parser;
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use weatherdash::astro::Coordinates;
use weatherdash::broker::UpdateBroker;
use weatherdash::cache::{Clock, SystemClock};
use weatherdash::celestial::CelestialService;
use weatherdash::config::AppConfig;
use weatherdash::http::{router, AppContext};
use weatherdash::metrics::{new_registry, BrokerMetrics, CacheMetrics};
use weatherdash::source::{MySqlArchive, WeatherSource};

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_MAX_CONNECTIONS: u32 = 8;

#[derive(Debug, Parser)]
#[clap(name = "weatherdash", version = clap::crate_version!())]
struct WeatherDashApplication {
    /// Path to the YAML configuration file
    #[clap(long, default_value_t = DEFAULT_CONFIG_PATH.into())]
    config: String,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to bind to. By default, weatherdash binds to all addresses on the port from
    /// the `server` section of the configuration file
    #[clap(long)]
    bind: Option<SocketAddr>,

    /// Maximum number of connections to the MySQL database
    #[clap(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = WeatherDashApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let config = AppConfig::load(&opts.config).unwrap_or_else(|e| {
        tracing::error!(message = "unable to load configuration", path = %opts.config, error = %e);
        process::exit(1)
    });

    let tz = config.location.tz().unwrap_or_else(|e| {
        tracing::error!(message = "invalid location timezone", error = %e);
        process::exit(1)
    });

    let archive = MySqlArchive::connect(&config.db.url(), opts.max_connections)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(message = "unable to connect to database", host = %config.db.host, error = %e);
            process::exit(1)
        });

    // Read the newest archive row before serving anything. This verifies the database is
    // usable and gives the broker a starting point so the row every browser already loaded
    // isn't pushed to them again on the first poll.
    let baseline = archive.latest_marker().await.unwrap_or_else(|e| {
        tracing::error!(message = "unable to read archive", error = %e);
        process::exit(1)
    });
    tracing::info!(message = "verified archive access", latest = ?baseline);

    let mut registry = new_registry();
    let broker_metrics = BrokerMetrics::register(&mut registry);
    let cache_metrics = CacheMetrics::register(&mut registry);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let broker = Arc::new(UpdateBroker::new(archive, broker_metrics).with_baseline(baseline));
    let celestial = Arc::new(CelestialService::new(
        Coordinates::new(config.location.latitude, config.location.longitude),
        tz,
        Arc::clone(&clock),
        cache_metrics,
    ));

    let shutdown = CancellationToken::new();
    let poller = Arc::clone(&broker).start_polling(config.server.sse_poll_interval(), shutdown.clone());
    let refresher = tokio::spawn({
        let celestial = Arc::clone(&celestial);
        let shutdown = shutdown.clone();
        async move { celestial.run_daily_refresh(shutdown).await }
    });

    let bind = opts
        .bind
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.server.port)));
    let context = Arc::new(AppContext::new(
        broker,
        celestial,
        config,
        registry,
        clock,
        shutdown.clone(),
    ));

    let server = axum::Server::try_bind(&bind)
        .unwrap_or_else(|e| {
            tracing::error!(message = "error binding to address", address = %bind, error = %e);
            process::exit(1)
        })
        .serve(router(context).into_make_service())
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                // Wait for either SIGTERM or SIGINT to shutdown
                tokio::select! {
                    _ = sigterm() => {}
                    _ = sigint() => {}
                }

                // Open event streams only end once this fires
                shutdown.cancel();
            }
        });

    tracing::info!(message = "server started", address = %bind);
    if let Err(e) = server.await {
        tracing::error!(message = "server error", error = %e);
    }

    shutdown.cancel();
    let _ = tokio::join!(poller, refresher);

    tracing::info!("server shutdown");
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
