//! Pub/sub fan-out primitive underneath every typed pool.
//!
//! A [`Fanout`] owns one channel (request or actual) of one pool. Each
//! subscriber gets an ordered hand-off queue plus a forwarder task that
//! moves values into the subscriber's bounded channel with a per-emission
//! timeout. Publishing therefore never blocks on a slow consumer: the
//! publisher enqueues clones, the forwarder enforces the delivery budget,
//! and a timed-out emission is dropped and counted while the subscription
//! stays alive.
//!
//! Replay for late joiners is injected through the same queue, so replayed
//! values travel the same filter/stamp/timeout path as live ones.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics::{Channel, MetricsClient};

/// Budget for delivering one emission to one subscriber.
pub const CHAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Wall-clock guard for a single publish across all subscribers.
pub const PUB_TIMEOUT: Duration = Duration::from_millis(20);

/// Predicate deciding whether a subscriber receives a value.
pub type FilterFn<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

/// Mutation applied to each value just before it is handed to a
/// subscriber (e.g. stamping a fresh unixtime).
pub type StampFn<V> = Arc<dyn Fn(&mut V) + Send + Sync>;

/// Extracts the metrics/log label (address or ID) from a value.
pub type LabelFn<V> = Arc<dyn Fn(&V) -> String + Send + Sync>;

/// Accepts every value.
pub fn accept_all<V>() -> FilterFn<V> {
    Arc::new(|_| true)
}

struct FanoutSubscriber<V> {
    id: u64,
    queue: mpsc::UnboundedSender<V>,
    filter: FilterFn<V>,
}

/// One pub/sub channel of a pool.
pub struct Fanout<V> {
    pool: &'static str,
    channel: Channel,
    subscribers: Arc<Mutex<Vec<FanoutSubscriber<V>>>>,
    next_id: AtomicU64,
    metrics: MetricsClient,
    label: LabelFn<V>,
    stamp: Option<StampFn<V>>,
}

impl<V: Clone + Send + 'static> Fanout<V> {
    /// Creates a fan-out channel for `pool`.
    ///
    /// `label` names a value in metrics and delivery-failure logs.
    /// `stamp`, when set, mutates every outgoing value right before the
    /// hand-off to the subscriber.
    pub fn new(
        pool: &'static str,
        channel: Channel,
        metrics: MetricsClient,
        label: LabelFn<V>,
        stamp: Option<StampFn<V>>,
    ) -> Self {
        Self {
            pool,
            channel,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            metrics,
            label,
            stamp,
        }
    }

    /// Publishes a value to every subscriber whose filter matches.
    ///
    /// The hand-off is a clone into each subscriber's queue; actual
    /// delivery happens on the subscriber's forwarder task. A publish
    /// that still exceeds [`PUB_TIMEOUT`] is logged as pathological.
    pub fn publish(&self, value: &V) {
        let start = Instant::now();
        {
            let subs = self
                .subscribers
                .lock()
                .expect("fanout subscriber list poisoned");
            for sub in subs.iter() {
                if (sub.filter)(value) {
                    let _ = sub.queue.send(value.clone());
                }
            }
        }
        let elapsed = start.elapsed();
        if elapsed > PUB_TIMEOUT {
            tracing::error!(
                pool = self.pool,
                channel = self.channel.as_str(),
                timeout_ms = PUB_TIMEOUT.as_millis() as u64,
                actual_ms = elapsed.as_millis() as u64,
                "publish into pool took too long"
            );
            self.metrics.slow_publish(self.pool);
        }
    }

    /// Subscribes to this channel.
    ///
    /// With `enabled = false` the returned subscription is inert: it never
    /// yields and cancelling it merely closes the stream. This keeps call
    /// sites uniform when a watch option disables one side.
    pub fn subscribe(&self, enabled: bool, timeout: Duration, filter: FilterFn<V>) -> Subscription<V> {
        self.metrics.subscribed(self.pool, self.channel);
        if !enabled {
            let (tx, rx) = mpsc::channel(1);
            return Subscription {
                receiver: rx,
                token: CancellationToken::new(),
                inert_tx: Some(tx),
                injector: None,
                unregister: None,
            };
        }

        let (out_tx, out_rx) = mpsc::channel::<V>(1);
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<V>();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut subs = self
                .subscribers
                .lock()
                .expect("fanout subscriber list poisoned");
            subs.push(FanoutSubscriber {
                id,
                queue: queue_tx.clone(),
                filter: filter.clone(),
            });
        }

        let token = CancellationToken::new();
        let forward_token = token.clone();
        let metrics = self.metrics.clone();
        let label = Arc::clone(&self.label);
        let stamp = self.stamp.clone();
        let pool = self.pool;
        let channel = self.channel;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = forward_token.cancelled() => break,

                    item = queue_rx.recv() => {
                        let Some(mut value) = item else { break };
                        if let Some(stamp) = &stamp {
                            (stamp)(&mut value);
                        }
                        let lbl = (label)(&value);
                        match tokio::time::timeout(timeout, out_tx.send(value)).await {
                            Ok(Ok(())) => metrics.delivered(pool, channel, &lbl),
                            // Receiver side is gone; the subscription is over.
                            Ok(Err(_)) => break,
                            Err(_) => {
                                tracing::error!(
                                    pool,
                                    channel = channel.as_str(),
                                    timeout_ms = timeout.as_millis() as u64,
                                    label = %lbl,
                                    "failed to deliver value to subscriber"
                                );
                                metrics.delivery_timeout(pool, channel, &lbl);
                            }
                        }
                    }
                }
            }
        });

        let subscribers = Arc::clone(&self.subscribers);
        let unregister = Box::new(move || {
            if let Ok(mut subs) = subscribers.lock() {
                subs.retain(|s| s.id != id);
            }
        });

        Subscription {
            receiver: out_rx,
            token,
            inert_tx: None,
            injector: Some((queue_tx, filter)),
            unregister: Some(unregister),
        }
    }
}

/// A live subscription onto a pool channel.
///
/// Dropping (or explicitly cancelling) the subscription unregisters the
/// subscriber, stops its forwarder task and closes the stream; no further
/// publish results in a send on the cancelled channel.
pub struct Subscription<V> {
    receiver: mpsc::Receiver<V>,
    token: CancellationToken,
    inert_tx: Option<mpsc::Sender<V>>,
    injector: Option<(mpsc::UnboundedSender<V>, FilterFn<V>)>,
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl<V> Subscription<V> {
    /// Receives the next value; `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<V> {
        self.receiver.recv().await
    }

    /// Non-blocking receive, for draining in tests.
    pub fn try_recv(&mut self) -> Result<V, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Injects a replayed value. It passes through the same filter and
    /// delivery path as live emissions; the call itself never blocks.
    pub(crate) fn replay(&self, value: V) {
        if let Some((queue, filter)) = &self.injector {
            if (filter)(&value) {
                let _ = queue.send(value);
            }
        }
    }

    /// Cancels the subscription.
    pub fn cancel(mut self) {
        self.cancel_inner();
    }

    fn cancel_inner(&mut self) {
        self.token.cancel();
        self.inert_tx = None;
        self.injector = None;
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
        self.receiver.close();
    }
}

impl<V> Drop for Subscription<V> {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}
