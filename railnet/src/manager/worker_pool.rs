//! Local worker pool.
//!
//! Holds the desired configuration (request) and last reported info
//! (actual) of every local worker, along with the peer address the
//! worker was last seen on. The request side carries a hash the manager
//! computes: a random per-process prefix plus the SHA-1 of the
//! configuration. Because the prefix changes on every manager restart,
//! workers reload after a restart even when their configuration did not
//! change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::api::{unix_now, ApiError, LocalWorker, LocalWorkerConfig, LocalWorkerInfo};
use crate::client::{WorkerClient, WorkerEndpoint};
use crate::metrics::{Channel, MetricsClient};

use super::fanout::{Fanout, FilterFn, LabelFn, StampFn, Subscription};
use super::filter::ModuleFilter;

const POOL: &str = "local_worker";

#[derive(Clone)]
struct WorkerEntry {
    worker: LocalWorker,
    remote_addr: String,
    last_updated_actual_at: Option<DateTime<Utc>>,
}

/// Pool of local workers, keyed by worker ID.
pub struct LocalWorkerPool {
    workers: Mutex<HashMap<String, WorkerEntry>>,
    requests: Fanout<LocalWorker>,
    actuals: Fanout<LocalWorker>,
    hash_prefix: String,
    metrics: MetricsClient,
}

impl LocalWorkerPool {
    pub fn new(metrics: MetricsClient) -> Self {
        let mut prefix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut prefix);

        let label: LabelFn<LocalWorker> = Arc::new(|lw: &LocalWorker| lw.id.clone());
        // Requests carry a heartbeat-style timestamp on every delivery,
        // on both channels (the actual channel re-sends the full record).
        let stamp: StampFn<LocalWorker> = Arc::new(|lw: &mut LocalWorker| {
            if let Some(request) = &mut lw.request {
                request.unixtime = unix_now();
            }
        });

        Self {
            workers: Mutex::new(HashMap::new()),
            requests: Fanout::new(
                POOL,
                Channel::Request,
                metrics.clone(),
                Arc::clone(&label),
                Some(Arc::clone(&stamp)),
            ),
            actuals: Fanout::new(POOL, Channel::Actual, metrics.clone(), label, Some(stamp)),
            hash_prefix: hex::encode(prefix),
            metrics,
        }
    }

    fn compute_hash(&self, request: &LocalWorkerConfig) -> Result<String, ApiError> {
        let mut canonical = request.clone();
        canonical.hash = String::new();
        let bytes =
            serde_json::to_vec(&canonical).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(format!(
            "{}{}",
            self.hash_prefix,
            hex::encode(Sha1::digest(&bytes))
        ))
    }

    /// Sets the requested state of a local worker, recomputing its hash.
    /// Does not touch the last-updated-actual timestamp.
    pub fn set_request(&self, lw: LocalWorker) -> Result<(), ApiError> {
        self.metrics.set_request(POOL, &lw.id);
        let Some(mut request) = lw.request else {
            return Err(ApiError::InvalidArgument("request missing".to_string()));
        };
        request.hash = self.compute_hash(&request)?;

        let mut workers = self.workers.lock().expect("worker pool poisoned");
        let entry = workers
            .entry(lw.id.clone())
            .or_insert_with(|| WorkerEntry {
                worker: LocalWorker::new(lw.id.clone()),
                remote_addr: String::new(),
                last_updated_actual_at: None,
            });
        entry.worker.request = Some(request);
        let snapshot = entry.worker.clone();
        self.requests.publish(&snapshot);
        Ok(())
    }

    /// Sets the actual state of a local worker, remembering the peer
    /// address it reported from.
    pub fn set_actual(&self, lw: LocalWorker, remote_addr: String) -> Result<(), ApiError> {
        self.metrics.set_actual(POOL, &lw.id);
        let mut workers = self.workers.lock().expect("worker pool poisoned");
        let entry = workers
            .entry(lw.id.clone())
            .or_insert_with(|| WorkerEntry {
                worker: LocalWorker::new(lw.id.clone()),
                remote_addr: String::new(),
                last_updated_actual_at: None,
            });
        entry.worker.actual = lw.actual;
        entry.remote_addr = remote_addr;
        entry.last_updated_actual_at = Some(Utc::now());
        let snapshot = entry.worker.clone();
        self.actuals.publish(&snapshot);
        Ok(())
    }

    /// Last known record for one worker.
    pub fn get(&self, id: &str) -> Option<LocalWorker> {
        self.workers
            .lock()
            .expect("worker pool poisoned")
            .get(id)
            .map(|e| e.worker.clone())
    }

    /// Last known info for one worker: `(info, remote_addr, last_updated)`.
    /// Only workers that have reported an actual are known here.
    pub fn get_info(
        &self,
        id: &str,
    ) -> Option<(LocalWorkerInfo, String, Option<DateTime<Utc>>)> {
        let workers = self.workers.lock().expect("worker pool poisoned");
        let entry = workers.get(id)?;
        let info = entry.worker.actual.clone()?;
        Some((info, entry.remote_addr.clone(), entry.last_updated_actual_at))
    }

    /// Info for all workers that have reported an actual, sorted by ID.
    pub fn get_all(&self) -> Vec<LocalWorkerInfo> {
        let workers = self.workers.lock().expect("worker pool poisoned");
        let mut result: Vec<LocalWorkerInfo> = workers
            .values()
            .filter_map(|e| e.worker.actual.clone())
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    /// Full records of all workers, sorted by ID.
    pub fn get_all_workers(&self) -> Vec<LocalWorker> {
        let workers = self.workers.lock().expect("worker pool poisoned");
        let mut result: Vec<LocalWorker> = workers.values().map(|e| e.worker.clone()).collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    /// Endpoint of the worker's own control service.
    ///
    /// Fails when the worker is unknown, never reported a peer address,
    /// or does not advertise a service port.
    pub fn client_endpoint(&self, id: &str) -> Result<WorkerEndpoint, ApiError> {
        let workers = self.workers.lock().expect("worker pool poisoned");
        let entry = workers
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("local worker [{}] not found", id)))?;
        let (port, secure) = entry
            .worker
            .actual
            .as_ref()
            .map(|a| (a.local_worker_service_port, a.local_worker_service_secure))
            .unwrap_or((0, false));
        if port == 0 {
            return Err(ApiError::Unavailable(format!(
                "local worker [{}] does not provide a service port",
                id
            )));
        }
        if entry.remote_addr.is_empty() {
            return Err(ApiError::Unavailable(format!(
                "local worker [{}] has no known address",
                id
            )));
        }
        Ok(WorkerEndpoint {
            host: entry.remote_addr.clone(),
            port,
            secure,
        })
    }

    /// Dials the worker's own control service.
    pub async fn get_client(&self, id: &str) -> Result<WorkerClient, ApiError> {
        let endpoint = self.client_endpoint(id)?;
        WorkerClient::connect(endpoint).await
    }

    /// Requests the worker with the given ID to reset itself.
    pub async fn request_reset(&self, id: &str) -> Result<(), ApiError> {
        let mut client = self.get_client(id).await?;
        client.reset().await
    }

    pub fn sub_requests(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<LocalWorker> {
        let f = filter.clone();
        let matcher: FilterFn<LocalWorker> =
            Arc::new(move |lw: &LocalWorker| lw.request.is_some() && f.matches_module_id(&lw.id));
        let sub = self.requests.subscribe(enabled, timeout, matcher);
        if enabled {
            for lw in self.get_all_workers() {
                if lw.request.is_some() {
                    sub.replay(lw);
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
    ) -> Subscription<LocalWorker> {
        let f = filter.clone();
        let matcher: FilterFn<LocalWorker> =
            Arc::new(move |lw: &LocalWorker| f.matches_module_id(&lw.id));
        let sub = self.actuals.subscribe(enabled, timeout, matcher);
        if enabled {
            for lw in self.get_all_workers() {
                if lw.actual.is_some() {
                    sub.replay(lw);
                }
            }
        }
        sub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> LocalWorkerPool {
        LocalWorkerPool::new(MetricsClient::disabled())
    }

    fn config(alias: &str) -> LocalWorkerConfig {
        LocalWorkerConfig {
            alias: alias.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_set_request_requires_request() {
        let pool = pool();
        let err = pool.set_request(LocalWorker::new("w1")).unwrap_err();
        assert!(matches!(err, ApiError::InvalidArgument(_)));
    }

    #[test]
    fn test_hash_is_stable_within_process() {
        let pool = pool();
        pool.set_request(LocalWorker::new("w1").with_request(config("a")))
            .unwrap();
        let first = pool.get("w1").unwrap().request.unwrap().hash;

        pool.set_request(LocalWorker::new("w1").with_request(config("a")))
            .unwrap();
        let second = pool.get("w1").unwrap().request.unwrap().hash;

        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn test_hash_changes_with_payload() {
        let pool = pool();
        pool.set_request(LocalWorker::new("w1").with_request(config("a")))
            .unwrap();
        let first = pool.get("w1").unwrap().request.unwrap().hash;

        pool.set_request(LocalWorker::new("w1").with_request(config("b")))
            .unwrap();
        let second = pool.get("w1").unwrap().request.unwrap().hash;

        assert_ne!(first, second);
    }

    #[test]
    fn test_hash_differs_across_pool_instances() {
        // Each pool draws a fresh random prefix, standing in for the
        // manager restart: identical payloads must hash differently.
        let a = pool();
        let b = pool();
        a.set_request(LocalWorker::new("w1").with_request(config("a")))
            .unwrap();
        b.set_request(LocalWorker::new("w1").with_request(config("a")))
            .unwrap();

        assert_ne!(
            a.get("w1").unwrap().request.unwrap().hash,
            b.get("w1").unwrap().request.unwrap().hash
        );
    }

    #[test]
    fn test_incoming_hash_is_ignored() {
        let pool = pool();
        let mut cfg = config("a");
        cfg.hash = "forged".to_string();
        pool.set_request(LocalWorker::new("w1").with_request(cfg))
            .unwrap();

        let stored = pool.get("w1").unwrap().request.unwrap().hash;
        assert_ne!(stored, "forged");
        assert!(stored.starts_with(&pool.hash_prefix));
    }

    #[test]
    fn test_set_actual_updates_address_and_timestamp() {
        let pool = pool();
        assert!(pool.get_info("w1").is_none());

        pool.set_actual(
            LocalWorker::new("w1").with_actual(LocalWorkerInfo {
                id: "w1".to_string(),
                ..Default::default()
            }),
            "10.0.0.5".to_string(),
        )
        .unwrap();

        let (info, addr, updated) = pool.get_info("w1").unwrap();
        assert_eq!(info.id, "w1");
        assert_eq!(addr, "10.0.0.5");
        assert!(updated.is_some());
    }

    #[test]
    fn test_set_request_does_not_touch_actual_timestamp() {
        let pool = pool();
        pool.set_actual(
            LocalWorker::new("w1").with_actual(LocalWorkerInfo::default()),
            "10.0.0.5".to_string(),
        )
        .unwrap();
        let (_, _, before) = pool.get_info("w1").unwrap();

        pool.set_request(LocalWorker::new("w1").with_request(config("a")))
            .unwrap();
        let (_, _, after) = pool.get_info("w1").unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_get_all_is_sorted_by_id() {
        let pool = pool();
        for id in ["w3", "w1", "w2"] {
            pool.set_actual(
                LocalWorker::new(id).with_actual(LocalWorkerInfo {
                    id: id.to_string(),
                    ..Default::default()
                }),
                "10.0.0.1".to_string(),
            )
            .unwrap();
        }

        let ids: Vec<String> = pool.get_all().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["w1", "w2", "w3"]);
    }

    #[test]
    fn test_client_endpoint_requires_port() {
        let pool = pool();
        pool.set_actual(
            LocalWorker::new("w1").with_actual(LocalWorkerInfo {
                id: "w1".to_string(),
                local_worker_service_port: 0,
                ..Default::default()
            }),
            "10.0.0.5".to_string(),
        )
        .unwrap();

        assert!(matches!(
            pool.client_endpoint("w1").unwrap_err(),
            ApiError::Unavailable(_)
        ));
        assert!(matches!(
            pool.client_endpoint("unknown").unwrap_err(),
            ApiError::NotFound(_)
        ));
    }

    #[test]
    fn test_client_endpoint_from_record() {
        let pool = pool();
        pool.set_actual(
            LocalWorker::new("w1").with_actual(LocalWorkerInfo {
                id: "w1".to_string(),
                local_worker_service_port: 8822,
                local_worker_service_secure: false,
                ..Default::default()
            }),
            "10.0.0.5".to_string(),
        )
        .unwrap();

        let endpoint = pool.client_endpoint("w1").unwrap();
        assert_eq!(endpoint.host, "10.0.0.5");
        assert_eq!(endpoint.port, 8822);
        assert!(!endpoint.secure);
    }

    #[tokio::test]
    async fn test_request_subscription_stamps_unixtime() {
        let pool = pool();
        let mut sub = pool.sub_requests(true, Duration::from_secs(1), ModuleFilter::any());

        pool.set_request(LocalWorker::new("w1").with_request(config("a")))
            .unwrap();
        let got = sub.recv().await.unwrap();
        assert!(got.request.unwrap().unixtime > 0);
    }

    #[tokio::test]
    async fn test_subscription_filters_by_worker_id() {
        let pool = pool();
        let mut sub =
            pool.sub_requests(true, Duration::from_secs(1), ModuleFilter::new("w2"));

        pool.set_request(LocalWorker::new("w1").with_request(config("a")))
            .unwrap();
        pool.set_request(LocalWorker::new("w2").with_request(config("b")))
            .unwrap();

        assert_eq!(sub.recv().await.unwrap().id, "w2");
    }
}
