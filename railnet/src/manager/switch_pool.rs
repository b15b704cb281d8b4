//! Switch pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{ObjectAddress, Switch};
use crate::metrics::{Channel, MetricsClient};

use super::fanout::{Fanout, FilterFn, LabelFn, Subscription};
use super::filter::ModuleFilter;

const POOL: &str = "switch";

/// Pool of switches, keyed by address. Shares the output pool's
/// global-address fallback on `SetActual`.
pub struct SwitchPool {
    entries: Mutex<HashMap<ObjectAddress, Switch>>,
    request_changes: Fanout<Switch>,
    actual_changes: Fanout<Switch>,
    metrics: MetricsClient,
}

impl SwitchPool {
    pub fn new(metrics: MetricsClient) -> Self {
        let label: LabelFn<Switch> = Arc::new(|sw: &Switch| sw.address.to_string());
        Self {
            entries: Mutex::new(HashMap::new()),
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

    pub fn set_request(&self, x: Switch) {
        self.metrics.set_request(POOL, x.address.as_str());
        let mut entries = self.entries.lock().expect("switch pool poisoned");

        let entry = entries
            .entry(x.address.clone())
            .and_modify(|e| e.request = x.request.clone())
            .or_insert_with(|| Switch {
                address: x.address.clone(),
                request: x.request.clone(),
                actual: None,
            });
        let snapshot = entry.clone();
        self.request_changes.publish(&snapshot);
    }

    pub fn set_actual(&self, x: Switch) {
        self.metrics.set_actual(POOL, x.address.as_str());
        let mut entries = self.entries.lock().expect("switch pool poisoned");

        let key = if entries.contains_key(&x.address) {
            x.address.clone()
        } else {
            // Check global address
            let global = x.address.to_global();
            if !entries.contains_key(&global) {
                // Apparently we do not care for this switch.
                return;
            }
            global
        };
        let entry = entries.get_mut(&key).expect("checked above");
        entry.actual = x.actual.clone();
        let snapshot = entry.clone();
        self.actual_changes.publish(&snapshot);
    }

    pub fn get(&self, address: &ObjectAddress) -> Option<Switch> {
        self.entries
            .lock()
            .expect("switch pool poisoned")
            .get(address)
            .cloned()
    }

    pub fn sub_requests(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<Switch> {
        let f = filter.clone();
        let matcher: FilterFn<Switch> =
            Arc::new(move |sw: &Switch| sw.request.is_some() && f.matches(&sw.address));
        let sub = self.request_changes.subscribe(enabled, timeout, matcher);
        if enabled {
            let entries = self.entries.lock().expect("switch pool poisoned");
            for sw in entries.values() {
                if sw.request.is_some() {
                    sub.replay(sw.clone());
                }
            }
        }
        sub
    }

    pub fn sub_actuals(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<Switch> {
        let f = filter.clone();
        let matcher: FilterFn<Switch> = Arc::new(move |sw: &Switch| f.matches(&sw.address));
        let sub = self.actual_changes.subscribe(enabled, timeout, matcher);
        if enabled {
            let entries = self.entries.lock().expect("switch pool poisoned");
            for sw in entries.values() {
                if sw.actual.is_some() {
                    sub.replay(sw.clone());
                }
            }
        }
        sub
    }
}
