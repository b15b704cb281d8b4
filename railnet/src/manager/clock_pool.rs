//! Clock pool.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{unix_now, Clock};
use crate::metrics::{Channel, MetricsClient};

use super::fanout::{accept_all, Fanout, LabelFn, StampFn, Subscription};

const POOL: &str = "clock";

/// The singleton model-time clock pool (actual only).
///
/// Every outgoing emission carries a fresh `unixtime` stamp, so late or
/// slow deliveries still let the consumer judge how stale the model time
/// is.
pub struct ClockPool {
    clock: Mutex<Clock>,
    actual_changes: Fanout<Clock>,
    metrics: MetricsClient,
}

impl ClockPool {
    pub fn new(metrics: MetricsClient) -> Self {
        let label: LabelFn<Clock> = Arc::new(|_: &Clock| POOL.to_string());
        let stamp: StampFn<Clock> = Arc::new(|clock: &mut Clock| {
            clock.unixtime = unix_now();
        });
        Self {
            clock: Mutex::new(Clock::default()),
            actual_changes: Fanout::new(POOL, Channel::Actual, metrics.clone(), label, Some(stamp)),
            metrics,
        }
    }

    pub fn set_actual(&self, x: Clock) {
        self.metrics.set_actual(POOL, POOL);
        let mut clock = self.clock.lock().expect("clock pool poisoned");
        clock.period = x.period;
        clock.hours = x.hours;
        clock.minutes = x.minutes;
        let snapshot = clock.clone();
        self.actual_changes.publish(&snapshot);
    }

    pub fn get(&self) -> Clock {
        self.clock.lock().expect("clock pool poisoned").clone()
    }

    pub fn sub_actuals(&self, enabled: bool, timeout: Duration) -> Subscription<Clock> {
        self.actual_changes.subscribe(enabled, timeout, accept_all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ClockPool {
        ClockPool::new(MetricsClient::disabled())
    }

    #[tokio::test]
    async fn test_emission_carries_fresh_unixtime() {
        let pool = pool();
        let mut sub = pool.sub_actuals(true, Duration::from_secs(1));

        pool.set_actual(Clock {
            period: 10,
            hours: 14,
            minutes: 30,
            unixtime: 0,
        });

        let got = sub.recv().await.unwrap();
        assert_eq!(got.hours, 14);
        assert_eq!(got.minutes, 30);
        assert!(got.unixtime > 0);
    }

    #[test]
    fn test_stored_clock_keeps_no_stamp() {
        let pool = pool();
        pool.set_actual(Clock {
            period: 10,
            hours: 9,
            minutes: 0,
            unixtime: 12345,
        });

        // The producer's unixtime is not taken over; stamping happens on
        // emission only.
        assert_eq!(pool.get().unixtime, 0);
        assert_eq!(pool.get().hours, 9);
    }
}
