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

//! Live update broadcasting.
//!
//! A single poller watches the archive for a new change marker (max `dateTime`) and,
//! when one shows up, fetches the newest row, encodes it once, and hands a shared copy
//! to every connected stream. Each stream owns a small bounded queue. Delivery never
//! waits on a stream: if its queue is full the update is dropped for that stream only.
//! Clients that can't keep up lose intermediate updates and get no notice of it.

use crate::metrics::BrokerMetrics;
use crate::source::{SourceError, WeatherSource};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Number of updates a stream may have queued before new ones are dropped for it
pub const SUBSCRIBER_CAPACITY: usize = 4;

/// Snapshot of the newest archive row, JSON encoded once and shared by every subscriber.
#[derive(Debug, PartialEq)]
pub struct BroadcastMessage {
    pub marker: i64,
    pub payload: String,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<Arc<BroadcastMessage>>>,
}

#[derive(Debug)]
struct Shared {
    registry: Mutex<Registry>,
    metrics: BrokerMetrics,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Nothing panics while holding the lock, recover the map if something ever does
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: u64) -> bool {
        let mut registry = self.registry();
        let removed = registry.subscribers.remove(&id).is_some();
        if removed {
            self.metrics.stream_clients.set(registry.subscribers.len() as i64);
        }
        removed
    }
}

/// Receiving end of one stream's queue.
///
/// Dropping the subscription removes it from the broker, so a stream that ends for any
/// reason (client went away, server shutting down, error writing) is always cleaned up.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<BroadcastMessage>>,
    shared: Arc<Shared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next update. Returns `None` once the subscription has been removed
    /// from the broker and any already queued updates have been read.
    pub async fn recv(&mut self) -> Option<Arc<BroadcastMessage>> {
        self.rx.recv().await
    }

    /// Return a queued update without waiting, if there is one.
    pub fn try_recv(&mut self) -> Option<Arc<BroadcastMessage>> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.shared.remove(self.id) {
            tracing::debug!(
                message = "stream client disconnected",
                subscriber = self.id,
                total = self.shared.registry().subscribers.len(),
            );
        }
    }
}

/// Polls a `WeatherSource` for new rows and fans them out to subscribers.
#[derive(Debug)]
pub struct UpdateBroker<S> {
    source: S,
    shared: Arc<Shared>,
    // Only the poller writes this. The async lock also keeps concurrent `poll_once`
    // calls from interleaving their read-compare-write.
    last_marker: tokio::sync::Mutex<Option<i64>>,
}

impl<S> UpdateBroker<S>
where
    S: WeatherSource,
{
    pub fn new(source: S, metrics: BrokerMetrics) -> Self {
        UpdateBroker {
            source,
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                metrics,
            }),
            last_marker: tokio::sync::Mutex::new(None),
        }
    }

    /// Treat `marker` as already broadcast so the first poll only reports newer rows.
    pub fn with_baseline(mut self, marker: Option<i64>) -> Self {
        self.last_marker = tokio::sync::Mutex::new(marker);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Register a new bounded queue for a stream.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let (id, total) = {
            let mut registry = self.shared.registry();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.subscribers.insert(id, tx);
            (id, registry.subscribers.len())
        };

        self.shared.metrics.stream_clients.set(total as i64);
        tracing::debug!(message = "stream client connected", subscriber = id, total = total);

        Subscription {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Remove a subscription's queue from the broker. Calling this more than once, or
    /// for a subscription that was already dropped, does nothing.
    pub fn unsubscribe(&self, sub: &Subscription) {
        if self.shared.remove(sub.id) {
            tracing::debug!(message = "stream client unsubscribed", subscriber = sub.id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.registry().subscribers.len()
    }

    /// The last change marker that was broadcast (or used as the baseline).
    pub async fn last_marker(&self) -> Option<i64> {
        *self.last_marker.lock().await
    }

    /// Check the source for a new change marker and broadcast the newest row if there
    /// is one. Returns `true` if a broadcast happened.
    ///
    /// Errors leave the last seen marker untouched so the next poll retries from the
    /// same baseline.
    pub async fn poll_once(&self) -> Result<bool, SourceError> {
        let metrics = &self.shared.metrics;
        metrics.polls.inc();

        let res = self.poll_inner().await;
        if res.is_err() {
            metrics.poll_errors.inc();
        }

        res
    }

    async fn poll_inner(&self) -> Result<bool, SourceError> {
        let mut last = self.last_marker.lock().await;

        let marker = match self.source.latest_marker().await? {
            Some(m) => m,
            None => {
                tracing::debug!(message = "no rows in archive");
                return Ok(false);
            }
        };

        if *last == Some(marker) {
            tracing::debug!(message = "no change", marker = marker);
            return Ok(false);
        }

        tracing::debug!(message = "change detected, loading latest row", marker = marker, last = ?*last);
        let record = self.source.latest_record().await?;
        let payload = serde_json::to_string(&record).map_err(|e| SourceError::Malformed(e.to_string()))?;

        // Update the marker before anyone can see the broadcast for it
        *last = Some(marker);
        self.shared.metrics.changes.inc();

        let size = payload.len();
        let delivered = self.broadcast(Arc::new(BroadcastMessage { marker, payload }));
        tracing::info!(
            message = "broadcast new update",
            marker = marker,
            payload_bytes = size,
            delivered = delivered,
        );

        Ok(true)
    }

    /// Offer `msg` to every registered subscriber without waiting. Returns the number of
    /// subscribers the message was queued for.
    pub fn broadcast(&self, msg: Arc<BroadcastMessage>) -> usize {
        let metrics = &self.shared.metrics;
        let registry = self.shared.registry();
        let mut delivered = 0;

        for (id, tx) in registry.subscribers.iter() {
            match tx.try_send(Arc::clone(&msg)) {
                Ok(()) => {
                    delivered += 1;
                    metrics.deliveries.inc();
                }
                Err(TrySendError::Full(_)) => {
                    metrics.dropped.inc();
                    tracing::debug!(message = "dropping update for slow stream", subscriber = *id);
                }
                // Receiver is mid-drop and will remove itself
                Err(TrySendError::Closed(_)) => {}
            }
        }

        delivered
    }

    /// Poll immediately and then once per `interval` until `cancel` fires. A poll that
    /// is already running when cancellation happens is allowed to finish.
    pub async fn run_polling(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(message = "archive poller started", interval = ?interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(message = "archive poller stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!(message = "failed to poll archive", error = %e);
                    }
                }
            }
        }
    }

    /// Spawn `run_polling` as a background task.
    pub fn start_polling(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_polling(interval, cancel).await })
    }
}
