//! Metric event definitions.

/// The pool channel an emission travelled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Request,
    Actual,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Request => "request",
            Channel::Actual => "actual",
        }
    }
}

/// An observable event emitted by the pools.
///
/// `pool` is the static pool name (`loc`, `output`, ...); `label` is the
/// per-entity label (an address or a worker ID).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricEvent {
    /// A `Set*Request` landed in a pool.
    SetRequest { pool: &'static str, label: String },
    /// A `Set*Actual` landed in a pool.
    SetActual { pool: &'static str, label: String },
    /// A new subscription was opened on a channel.
    Subscribed { pool: &'static str, channel: Channel },
    /// One value was delivered to one subscriber.
    Delivered {
        pool: &'static str,
        channel: Channel,
        label: String,
    },
    /// One value was dropped because a subscriber did not consume it
    /// within the delivery timeout.
    DeliveryTimeout {
        pool: &'static str,
        channel: Channel,
        label: String,
    },
    /// A publish exceeded the publish wall-clock guard.
    SlowPublish { pool: &'static str },
}
