//! Sensor pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{ObjectAddress, Sensor};
use crate::metrics::{Channel, MetricsClient};

use super::fanout::{Fanout, FilterFn, LabelFn, Subscription};
use super::filter::ModuleFilter;

const POOL: &str = "sensor";

/// Pool of sensors, keyed by address.
///
/// Sensors are created by whichever worker first reports them, so
/// `SetActual` on an unknown address creates the entry.
pub struct SensorPool {
    entries: Mutex<HashMap<ObjectAddress, Sensor>>,
    actual_changes: Fanout<Sensor>,
    metrics: MetricsClient,
}

impl SensorPool {
    pub fn new(metrics: MetricsClient) -> Self {
        let label: LabelFn<Sensor> = Arc::new(|sensor: &Sensor| sensor.address.to_string());
        Self {
            entries: Mutex::new(HashMap::new()),
            actual_changes: Fanout::new(POOL, Channel::Actual, metrics.clone(), label, None),
            metrics,
        }
    }

    pub fn set_actual(&self, x: Sensor) {
        self.metrics.set_actual(POOL, x.address.as_str());
        let mut entries = self.entries.lock().expect("sensor pool poisoned");

        let entry = entries
            .entry(x.address.clone())
            .and_modify(|e| e.actual = x.actual.clone())
            .or_insert_with(|| x.clone());
        let snapshot = entry.clone();
        self.actual_changes.publish(&snapshot);
    }

    pub fn get(&self, address: &ObjectAddress) -> Option<Sensor> {
        self.entries
            .lock()
            .expect("sensor pool poisoned")
            .get(address)
            .cloned()
    }

    pub fn sub_actuals(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<Sensor> {
        let f = filter.clone();
        let matcher: FilterFn<Sensor> = Arc::new(move |sensor: &Sensor| f.matches(&sensor.address));
        let sub = self.actual_changes.subscribe(enabled, timeout, matcher);
        if enabled {
            let entries = self.entries.lock().expect("sensor pool poisoned");
            for sensor in entries.values() {
                if sensor.actual.is_some() {
                    sub.replay(sensor.clone());
                }
            }
        }
        sub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SensorState;

    fn pool() -> SensorPool {
        SensorPool::new(MetricsClient::disabled())
    }

    #[test]
    fn test_set_actual_creates_entry() {
        let pool = pool();
        pool.set_actual(Sensor::new("m1/S4").with_actual(SensorState { value: 1 }));

        let entry = pool.get(&"m1/S4".into()).unwrap();
        assert_eq!(entry.actual.unwrap().value, 1);
    }

    #[test]
    fn test_set_actual_updates_existing_entry() {
        let pool = pool();
        pool.set_actual(Sensor::new("m1/S4").with_actual(SensorState { value: 0 }));
        pool.set_actual(Sensor::new("m1/S4").with_actual(SensorState { value: 1 }));

        assert_eq!(pool.get(&"m1/S4".into()).unwrap().actual.unwrap().value, 1);
    }

    #[tokio::test]
    async fn test_replay_goes_through_delivery_path() {
        let pool = pool();
        pool.set_actual(Sensor::new("m1/S1").with_actual(SensorState { value: 1 }));
        pool.set_actual(Sensor::new("m2/S2").with_actual(SensorState { value: 1 }));

        // The filter applies to replayed values exactly like live ones.
        let mut sub = pool.sub_actuals(true, Duration::from_secs(1), ModuleFilter::new("m1"));
        let got = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("no replay within 1s")
            .unwrap();
        assert_eq!(got.address.as_str(), "m1/S1");

        let extra = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(extra.is_err(), "filtered sensor must not be replayed");
    }
}
