//! Output pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{Output, ObjectAddress};
use crate::metrics::{Channel, MetricsClient};

use super::fanout::{Fanout, FilterFn, LabelFn, Subscription};
use super::filter::ModuleFilter;

const POOL: &str = "output";

/// Pool of outputs, keyed by address.
///
/// A `SetActual` for an unknown address falls back to the entry at
/// `global/<local>`: workers report on their own module while controllers
/// may have requested the output globally.
pub struct OutputPool {
    entries: Mutex<HashMap<ObjectAddress, Output>>,
    request_changes: Fanout<Output>,
    actual_changes: Fanout<Output>,
    metrics: MetricsClient,
}

impl OutputPool {
    pub fn new(metrics: MetricsClient) -> Self {
        let label: LabelFn<Output> = Arc::new(|output: &Output| output.address.to_string());
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

    pub fn set_request(&self, x: Output) {
        self.metrics.set_request(POOL, x.address.as_str());
        let mut entries = self.entries.lock().expect("output pool poisoned");

        let entry = entries
            .entry(x.address.clone())
            .and_modify(|e| e.request = x.request.clone())
            .or_insert_with(|| Output {
                address: x.address.clone(),
                request: x.request.clone(),
                actual: None,
            });
        let snapshot = entry.clone();
        self.request_changes.publish(&snapshot);
    }

    pub fn set_actual(&self, x: Output) {
        self.metrics.set_actual(POOL, x.address.as_str());
        let mut entries = self.entries.lock().expect("output pool poisoned");

        let key = if entries.contains_key(&x.address) {
            x.address.clone()
        } else {
            // Check global address
            let global = x.address.to_global();
            if !entries.contains_key(&global) {
                // Apparently we do not care for this output.
                return;
            }
            global
        };
        let entry = entries.get_mut(&key).expect("checked above");
        entry.actual = x.actual.clone();
        let snapshot = entry.clone();
        self.actual_changes.publish(&snapshot);
    }

    pub fn get(&self, address: &ObjectAddress) -> Option<Output> {
        self.entries
            .lock()
            .expect("output pool poisoned")
            .get(address)
            .cloned()
    }

    pub fn sub_requests(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<Output> {
        let f = filter.clone();
        let matcher: FilterFn<Output> =
            Arc::new(move |output: &Output| output.request.is_some() && f.matches(&output.address));
        let sub = self.request_changes.subscribe(enabled, timeout, matcher);
        if enabled {
            let entries = self.entries.lock().expect("output pool poisoned");
            for output in entries.values() {
                if output.request.is_some() {
                    sub.replay(output.clone());
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
    ) -> Subscription<Output> {
        let f = filter.clone();
        let matcher: FilterFn<Output> = Arc::new(move |output: &Output| f.matches(&output.address));
        let sub = self.actual_changes.subscribe(enabled, timeout, matcher);
        if enabled {
            let entries = self.entries.lock().expect("output pool poisoned");
            for output in entries.values() {
                if output.actual.is_some() {
                    sub.replay(output.clone());
                }
            }
        }
        sub
    }
}
