//! Power pool.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{Power, PowerState};
use crate::metrics::{Channel, MetricsClient};

use super::fanout::{accept_all, Fanout, LabelFn, Subscription};

const POOL: &str = "power";

/// The singleton track power pool.
///
/// Power is not addressed; setters update one side and emit the combined
/// snapshot on the matching channel.
pub struct PowerPool {
    power: Mutex<Power>,
    request_changes: Fanout<Power>,
    actual_changes: Fanout<Power>,
    metrics: MetricsClient,
}

impl PowerPool {
    pub fn new(metrics: MetricsClient) -> Self {
        let label: LabelFn<Power> = Arc::new(|_: &Power| POOL.to_string());
        Self {
            power: Mutex::new(Power::default()),
            request_changes: Fanout::new(
                POOL,
                Channel::Request,
                metrics.clone(),
                Arc::clone(&label),
                None,
            ),
            actual_changes: Fanout::new(POOL, Channel::Actual, metrics.clone(), label, None),
            metrics,
        }
    }

    pub fn set_request(&self, x: PowerState) {
        self.metrics.set_request(POOL, POOL);
        let mut power = self.power.lock().expect("power pool poisoned");
        power.request.enabled = x.enabled;
        let snapshot = power.clone();
        self.request_changes.publish(&snapshot);
    }

    pub fn set_actual(&self, x: PowerState) {
        self.metrics.set_actual(POOL, POOL);
        let mut power = self.power.lock().expect("power pool poisoned");
        power.actual.enabled = x.enabled;
        let snapshot = power.clone();
        self.actual_changes.publish(&snapshot);
    }

    pub fn get(&self) -> Power {
        self.power.lock().expect("power pool poisoned").clone()
    }

    pub fn sub_requests(&self, enabled: bool, timeout: Duration) -> Subscription<Power> {
        let sub = self.request_changes.subscribe(enabled, timeout, accept_all());
        if enabled {
            sub.replay(self.get());
        }
        sub
    }

    pub fn sub_actuals(&self, enabled: bool, timeout: Duration) -> Subscription<Power> {
        let sub = self.actual_changes.subscribe(enabled, timeout, accept_all());
        if enabled {
            sub.replay(self.get());
        }
        sub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> PowerPool {
        PowerPool::new(MetricsClient::disabled())
    }

    #[test]
    fn test_sides_are_independent() {
        let pool = pool();
        pool.set_request(PowerState { enabled: true });
        assert!(pool.get().request.enabled);
        assert!(!pool.get().actual.enabled);

        pool.set_actual(PowerState { enabled: true });
        pool.set_request(PowerState { enabled: false });
        assert!(pool.get().actual.enabled);
        assert!(!pool.get().request.enabled);
    }

    #[tokio::test]
    async fn test_subscriber_gets_combined_snapshot() {
        let pool = pool();
        pool.set_actual(PowerState { enabled: true });

        let mut sub = pool.sub_requests(true, Duration::from_secs(1));
        // Replay delivers the current snapshot immediately.
        let snapshot = sub.recv().await.unwrap();
        assert!(snapshot.actual.enabled);
        assert!(!snapshot.request.enabled);

        pool.set_request(PowerState { enabled: true });
        let snapshot = sub.recv().await.unwrap();
        assert!(snapshot.request.enabled);
        assert!(snapshot.actual.enabled);
    }
}
