//! Loc pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{unix_now, Loc, ObjectAddress};
use crate::metrics::{Channel, MetricsClient};

use super::fanout::{Fanout, FilterFn, LabelFn, StampFn, Subscription};
use super::filter::ModuleFilter;

const POOL: &str = "loc";

/// Pool of locs, keyed by address.
///
/// A `SetActual` for an address nobody requested is dropped: locs only
/// exist once a controller has asked for them.
pub struct LocPool {
    entries: Mutex<HashMap<ObjectAddress, Loc>>,
    request_changes: Fanout<Loc>,
    actual_changes: Fanout<Loc>,
    metrics: MetricsClient,
}

impl LocPool {
    pub fn new(metrics: MetricsClient) -> Self {
        let label: LabelFn<Loc> = Arc::new(|loc: &Loc| loc.address.to_string());
        // Outgoing requests always carry a fresh timestamp.
        let stamp: StampFn<Loc> = Arc::new(|loc: &mut Loc| {
            if let Some(request) = &mut loc.request {
                request.unixtime = unix_now();
            }
        });
        Self {
            entries: Mutex::new(HashMap::new()),
            request_changes: Fanout::new(
                POOL,
                Channel::Request,
                metrics.clone(),
                Arc::clone(&label),
                Some(stamp),
            ),
            actual_changes: Fanout::new(POOL, Channel::Actual, metrics.clone(), label, None),
            metrics,
        }
    }

    /// Upserts the request side and publishes the entry on the request
    /// channel. Creating an entry leaves the actual side empty.
    pub fn set_request(&self, x: Loc) {
        self.metrics.set_request(POOL, x.address.as_str());
        let mut entries = self.entries.lock().expect("loc pool poisoned");

        let entry = entries
            .entry(x.address.clone())
            .and_modify(|e| e.request = x.request.clone())
            .or_insert_with(|| Loc {
                address: x.address.clone(),
                request: x.request.clone(),
                actual: None,
            });
        let snapshot = entry.clone();
        self.request_changes.publish(&snapshot);
    }

    /// Updates the actual side of an existing entry and publishes it on
    /// the actual channel. Unknown addresses are dropped.
    pub fn set_actual(&self, x: Loc) {
        self.metrics.set_actual(POOL, x.address.as_str());
        let mut entries = self.entries.lock().expect("loc pool poisoned");

        let Some(entry) = entries.get_mut(&x.address) else {
            // Apparently we do not care for this loc.
            return;
        };
        entry.actual = x.actual.clone();
        let snapshot = entry.clone();
        self.actual_changes.publish(&snapshot);
    }

    /// Read-only lookup of the canonical entry.
    pub fn get(&self, address: &ObjectAddress) -> Option<Loc> {
        self.entries
            .lock()
            .expect("loc pool poisoned")
            .get(address)
            .cloned()
    }

    pub fn sub_requests(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<Loc> {
        let f = filter.clone();
        let matcher: FilterFn<Loc> =
            Arc::new(move |loc: &Loc| loc.request.is_some() && f.matches(&loc.address));
        let sub = self.request_changes.subscribe(enabled, timeout, matcher);
        if enabled {
            let entries = self.entries.lock().expect("loc pool poisoned");
            for loc in entries.values() {
                if loc.request.is_some() {
                    sub.replay(loc.clone());
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
    ) -> Subscription<Loc> {
        let f = filter.clone();
        let matcher: FilterFn<Loc> = Arc::new(move |loc: &Loc| f.matches(&loc.address));
        let sub = self.actual_changes.subscribe(enabled, timeout, matcher);
        if enabled {
            let entries = self.entries.lock().expect("loc pool poisoned");
            for loc in entries.values() {
                if loc.actual.is_some() {
                    sub.replay(loc.clone());
                }
            }
        }
        sub
    }
}
