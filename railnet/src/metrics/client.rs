//! Metrics emission layer.
//!
//! The [`MetricsClient`] is the interface the pools use to record events.
//! It is cheap to clone (a channel sender) and fire-and-forget: it never
//! blocks and silently drops events once the daemon has shut down.

use tokio::sync::mpsc;

use super::event::{Channel, MetricEvent};

/// Client for emitting metric events to the metrics daemon.
#[derive(Clone)]
pub struct MetricsClient {
    tx: Option<mpsc::UnboundedSender<MetricEvent>>,
}

impl MetricsClient {
    /// Creates a client backed by the given channel sender.
    pub fn new(tx: mpsc::UnboundedSender<MetricEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Creates a client that discards every event. Used in tests and in
    /// tools that do not run the daemon.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    #[inline]
    fn send(&self, event: MetricEvent) {
        if let Some(tx) = &self.tx {
            // Ignore send errors - daemon may have shut down
            let _ = tx.send(event);
        }
    }

    /// Records a `Set*Request` on a pool.
    #[inline]
    pub fn set_request(&self, pool: &'static str, label: &str) {
        self.send(MetricEvent::SetRequest {
            pool,
            label: label.to_string(),
        });
    }

    /// Records a `Set*Actual` on a pool.
    #[inline]
    pub fn set_actual(&self, pool: &'static str, label: &str) {
        self.send(MetricEvent::SetActual {
            pool,
            label: label.to_string(),
        });
    }

    /// Records a new subscription on a pool channel.
    #[inline]
    pub fn subscribed(&self, pool: &'static str, channel: Channel) {
        self.send(MetricEvent::Subscribed { pool, channel });
    }

    /// Records one delivered subscriber emission.
    #[inline]
    pub fn delivered(&self, pool: &'static str, channel: Channel, label: &str) {
        self.send(MetricEvent::Delivered {
            pool,
            channel,
            label: label.to_string(),
        });
    }

    /// Records one emission dropped on the delivery timeout.
    #[inline]
    pub fn delivery_timeout(&self, pool: &'static str, channel: Channel, label: &str) {
        self.send(MetricEvent::DeliveryTimeout {
            pool,
            channel,
            label: label.to_string(),
        });
    }

    /// Records a publish that exceeded the publish guard.
    #[inline]
    pub fn slow_publish(&self, pool: &'static str) {
        self.send(MetricEvent::SlowPublish { pool });
    }
}

impl std::fmt::Debug for MetricsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsClient")
            .field("enabled", &self.tx.is_some())
            .finish()
    }
}
