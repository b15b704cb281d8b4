//! Metrics aggregation daemon.
//!
//! Runs as an independent task: receives [`MetricEvent`]s from the
//! channel, bumps counters and publishes a snapshot to a shared handle.
//! The daemon is the only writer; readers never block event processing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event::MetricEvent;

/// Interval between snapshot publications.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Shared read handle onto the aggregated counters.
pub type SharedMetricsState = Arc<RwLock<AggregatedCounters>>;

/// Counters aggregated per `(pool, label)` and `(pool, channel)`.
#[derive(Debug, Clone, Default)]
pub struct AggregatedCounters {
    /// `Set*Request` calls per (pool, label).
    pub set_request_total: HashMap<(String, String), u64>,
    /// `Set*Actual` calls per (pool, label).
    pub set_actual_total: HashMap<(String, String), u64>,
    /// Subscriptions opened per (pool, channel).
    pub subscriptions_total: HashMap<(String, String), u64>,
    /// Emissions delivered per (pool, channel).
    pub emissions_delivered_total: HashMap<(String, String), u64>,
    /// Emissions dropped on timeout per (pool, channel).
    pub emissions_failed_total: HashMap<(String, String), u64>,
    /// Slow publishes per pool.
    pub slow_publish_total: HashMap<String, u64>,
}

impl AggregatedCounters {
    fn bump(map: &mut HashMap<(String, String), u64>, a: &str, b: &str) {
        *map.entry((a.to_string(), b.to_string())).or_insert(0) += 1;
    }

    /// Total emissions dropped on timeout, across all pools.
    pub fn total_failed_emissions(&self) -> u64 {
        self.emissions_failed_total.values().sum()
    }

    /// Total emissions delivered, across all pools.
    pub fn total_delivered_emissions(&self) -> u64 {
        self.emissions_delivered_total.values().sum()
    }
}

/// The metrics aggregation daemon.
pub struct MetricsDaemon {
    rx: mpsc::UnboundedReceiver<MetricEvent>,
    counters: AggregatedCounters,
    shared: SharedMetricsState,
}

impl MetricsDaemon {
    pub fn new(rx: mpsc::UnboundedReceiver<MetricEvent>) -> Self {
        Self {
            rx,
            counters: AggregatedCounters::default(),
            shared: Arc::new(RwLock::new(AggregatedCounters::default())),
        }
    }

    /// Returns the handle readers use to observe the counters.
    pub fn state_handle(&self) -> SharedMetricsState {
        Arc::clone(&self.shared)
    }

    /// Runs the daemon until shutdown is signaled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::debug!("metrics daemon starting");

        let mut publish_interval = tokio::time::interval(PUBLISH_INTERVAL);
        publish_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    break;
                }

                Some(event) = self.rx.recv() => {
                    self.process_event(event);
                }

                _ = publish_interval.tick() => {
                    self.publish();
                }
            }
        }

        self.publish();
        tracing::debug!("metrics daemon stopped");
    }

    fn process_event(&mut self, event: MetricEvent) {
        match event {
            MetricEvent::SetRequest { pool, label } => {
                AggregatedCounters::bump(&mut self.counters.set_request_total, pool, &label);
            }
            MetricEvent::SetActual { pool, label } => {
                AggregatedCounters::bump(&mut self.counters.set_actual_total, pool, &label);
            }
            MetricEvent::Subscribed { pool, channel } => {
                AggregatedCounters::bump(
                    &mut self.counters.subscriptions_total,
                    pool,
                    channel.as_str(),
                );
            }
            MetricEvent::Delivered { pool, channel, .. } => {
                AggregatedCounters::bump(
                    &mut self.counters.emissions_delivered_total,
                    pool,
                    channel.as_str(),
                );
            }
            MetricEvent::DeliveryTimeout { pool, channel, .. } => {
                AggregatedCounters::bump(
                    &mut self.counters.emissions_failed_total,
                    pool,
                    channel.as_str(),
                );
            }
            MetricEvent::SlowPublish { pool } => {
                *self
                    .counters
                    .slow_publish_total
                    .entry(pool.to_string())
                    .or_insert(0) += 1;
            }
        }
    }

    fn publish(&self) {
        if let Ok(mut guard) = self.shared.write() {
            *guard = self.counters.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::event::Channel;

    fn create_daemon() -> (MetricsDaemon, mpsc::UnboundedSender<MetricEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MetricsDaemon::new(rx), tx)
    }

    #[test]
    fn test_process_set_events() {
        let (mut daemon, _tx) = create_daemon();

        daemon.process_event(MetricEvent::SetRequest {
            pool: "loc",
            label: "m1/L1".into(),
        });
        daemon.process_event(MetricEvent::SetRequest {
            pool: "loc",
            label: "m1/L1".into(),
        });
        daemon.process_event(MetricEvent::SetActual {
            pool: "loc",
            label: "m1/L1".into(),
        });

        let key = ("loc".to_string(), "m1/L1".to_string());
        assert_eq!(daemon.counters.set_request_total[&key], 2);
        assert_eq!(daemon.counters.set_actual_total[&key], 1);
    }

    #[test]
    fn test_process_emission_events() {
        let (mut daemon, _tx) = create_daemon();

        daemon.process_event(MetricEvent::Subscribed {
            pool: "output",
            channel: Channel::Actual,
        });
        daemon.process_event(MetricEvent::Delivered {
            pool: "output",
            channel: Channel::Actual,
            label: "m1/O7".into(),
        });
        daemon.process_event(MetricEvent::DeliveryTimeout {
            pool: "output",
            channel: Channel::Actual,
            label: "m1/O7".into(),
        });

        assert_eq!(daemon.counters.total_delivered_emissions(), 1);
        assert_eq!(daemon.counters.total_failed_emissions(), 1);
        let key = ("output".to_string(), "actual".to_string());
        assert_eq!(daemon.counters.subscriptions_total[&key], 1);
    }

    #[tokio::test]
    async fn test_daemon_run_and_shutdown() {
        let (tx, rx) = mpsc::unbounded_channel();
        let daemon = MetricsDaemon::new(rx);
        let handle = daemon.state_handle();
        let shutdown = CancellationToken::new();

        tx.send(MetricEvent::SlowPublish { pool: "clock" }).unwrap();

        let shutdown_clone = shutdown.clone();
        let task = tokio::spawn(async move {
            daemon.run(shutdown_clone).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        task.await.unwrap();

        let snapshot = handle.read().unwrap();
        assert_eq!(snapshot.slow_publish_total["clock"], 1);
    }
}
