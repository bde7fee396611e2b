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

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

pub const NAMESPACE: &str = "weatherdash";

/// Holder for metrics describing the live update broker.
///
/// Metrics are plain handles so a broker created without calling `register` (as in
/// tests) still counts, it just isn't exported anywhere.
#[derive(Debug, Clone, Default)]
pub struct BrokerMetrics {
    pub stream_clients: Gauge,
    pub polls: Counter,
    pub poll_errors: Counter,
    pub changes: Counter,
    pub deliveries: Counter,
    pub dropped: Counter,
}

impl BrokerMetrics {
    /// Create broker metrics and register each of them with the provided `Registry`.
    pub fn register(reg: &mut Registry) -> Self {
        let m = Self::default();
        reg.register(
            "stream_clients",
            "Number of connected live update streams",
            m.stream_clients.clone(),
        );
        reg.register("polls", "Polls of the archive for new rows", m.polls.clone());
        reg.register("poll_errors", "Polls that failed", m.poll_errors.clone());
        reg.register("changes", "New archive rows detected", m.changes.clone());
        reg.register(
            "deliveries",
            "Updates queued for a connected stream",
            m.deliveries.clone(),
        );
        reg.register(
            "dropped",
            "Updates dropped because a stream's queue was full",
            m.dropped.clone(),
        );
        m
    }
}

/// Holder for metrics describing a `ComputeCache`.
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    pub hits: Counter,
    pub misses: Counter,
    pub computations: Counter,
    pub failures: Counter,
}

impl CacheMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let m = Self::default();
        reg.register("cache_hits", "Cache lookups served from a valid entry", m.hits.clone());
        reg.register("cache_misses", "Cache lookups without a valid entry", m.misses.clone());
        reg.register(
            "cache_computations",
            "Computations started by the cache",
            m.computations.clone(),
        );
        reg.register(
            "cache_failures",
            "Computations that returned an error",
            m.failures.clone(),
        );
        m
    }
}

/// Create the registry shared by every exported metric.
pub fn new_registry() -> Registry {
    Registry::with_prefix(NAMESPACE)
}

#[cfg(test)]
mod test {
    use super::{new_registry, BrokerMetrics, CacheMetrics};
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registered_metrics_are_encoded() {
        let mut reg = new_registry();
        let broker = BrokerMetrics::register(&mut reg);
        let cache = CacheMetrics::register(&mut reg);

        broker.stream_clients.set(3);
        cache.hits.inc();

        let mut buf = String::new();
        encode(&mut buf, &reg).unwrap();

        assert!(buf.contains("weatherdash_stream_clients 3"));
        assert!(buf.contains("weatherdash_cache_hits_total 1"));
    }
}
