//! Device discovery pool.
//!
//! Discovery is request-response over pub/sub: `trigger` publishes a
//! request on one lane, the addressed worker answers on the other, and
//! the trigger call resolves when a response for its worker ID arrives.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, DeviceDiscovery, DiscoverRequest, DiscoverResult};
use crate::metrics::{Channel, MetricsClient};

use super::fanout::{Fanout, FilterFn, LabelFn, Subscription, CHAN_TIMEOUT};

const POOL: &str = "discover";

/// Default budget for a discovery rendezvous.
pub const TRIGGER_TIMEOUT: Duration = Duration::from_secs(60);

/// Pool carrying discovery requests and responses.
///
/// There is no canonical entry map: discovery exchanges are transient and
/// are never replayed to late joiners.
pub struct DiscoverPool {
    requests: Fanout<DeviceDiscovery>,
    responses: Fanout<DeviceDiscovery>,
    metrics: MetricsClient,
}

fn id_filter(id: String) -> FilterFn<DeviceDiscovery> {
    Arc::new(move |msg: &DeviceDiscovery| id.is_empty() || msg.id == id)
}

impl DiscoverPool {
    pub fn new(metrics: MetricsClient) -> Self {
        let label: LabelFn<DeviceDiscovery> = Arc::new(|msg: &DeviceDiscovery| msg.id.clone());
        Self {
            requests: Fanout::new(
                POOL,
                Channel::Request,
                metrics.clone(),
                Arc::clone(&label),
                None,
            ),
            responses: Fanout::new(POOL, Channel::Actual, metrics.clone(), label, None),
            metrics,
        }
    }

    /// Triggers a discovery on worker `id` and waits for its response.
    ///
    /// Concurrent triggers for different IDs do not interfere. Concurrent
    /// triggers for the same ID share the response lane; any of them may
    /// consume any matching response.
    pub async fn trigger(
        &self,
        token: &CancellationToken,
        id: &str,
        timeout: Duration,
    ) -> Result<DiscoverResult, ApiError> {
        // Subscribe to responses before publishing the request so the
        // response cannot slip past us.
        let mut responses = self.sub_actuals(true, CHAN_TIMEOUT, id);

        let request_id = rand::random::<i32>();
        tracing::debug!(id, request_id, "triggering device discovery");
        self.set_discover_request(DeviceDiscovery {
            id: id.to_string(),
            request: Some(DiscoverRequest { request_id }),
            actual: None,
        });

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(ApiError::Timeout(format!(
                        "discovery for [{}] cancelled", id
                    )));
                }
                _ = &mut deadline => {
                    return Err(ApiError::Timeout(format!(
                        "no discovery response from [{}] within {:?}", id, timeout
                    )));
                }
                msg = responses.recv() => {
                    match msg {
                        Some(msg) if msg.id == id => {
                            tracing::debug!(id, "received discovery result");
                            return msg.actual.ok_or_else(|| {
                                ApiError::InvalidArgument("discover result missing".to_string())
                            });
                        }
                        Some(other) => {
                            tracing::debug!(msg_id = %other.id, "skipping response for other worker");
                        }
                        None => return Err(ApiError::StreamClosed),
                    }
                }
            }
        }
    }

    /// Publishes a discovery request.
    pub fn set_discover_request(&self, req: DeviceDiscovery) {
        self.metrics.set_request(POOL, &req.id);
        self.requests.publish(&req);
    }

    /// Called by the local worker in response to discover requests.
    pub fn set_discover_result(&self, req: DeviceDiscovery) {
        self.metrics.set_actual(POOL, &req.id);
        self.responses.publish(&req);
    }

    /// Subscribes to discovery requests, optionally limited to one
    /// worker ID (empty subscribes to all).
    pub fn sub_requests(
        &self,
        enabled: bool,
        timeout: Duration,
        id: &str,
    ) -> Subscription<DeviceDiscovery> {
        self.requests
            .subscribe(enabled, timeout, id_filter(id.to_string()))
    }

    /// Subscribes to discovery responses, optionally limited to one
    /// worker ID.
    pub fn sub_actuals(
        &self,
        enabled: bool,
        timeout: Duration,
        id: &str,
    ) -> Subscription<DeviceDiscovery> {
        self.responses
            .subscribe(enabled, timeout, id_filter(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<DiscoverPool> {
        Arc::new(DiscoverPool::new(MetricsClient::disabled()))
    }

    #[tokio::test]
    async fn test_trigger_rendezvous() {
        let pool = pool();
        let token = CancellationToken::new();

        // Worker side: wait for the request, then answer it.
        let worker_pool = Arc::clone(&pool);
        let worker = tokio::spawn(async move {
            let mut requests = worker_pool.sub_requests(true, Duration::from_secs(1), "m1");
            let req = requests.recv().await.unwrap();
            assert!(req.request.is_some());
            worker_pool.set_discover_result(DeviceDiscovery {
                id: "m1".to_string(),
                request: req.request,
                actual: Some(DiscoverResult {
                    id: "m1".to_string(),
                    addresses: vec!["0x20".to_string()],
                }),
            });
            req.request.unwrap().request_id
        });

        let result = pool
            .trigger(&token, "m1", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result.id, "m1");
        assert_eq!(result.addresses, vec!["0x20".to_string()]);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_ignores_other_ids() {
        let pool = pool();
        let token = CancellationToken::new();

        let responder = Arc::clone(&pool);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            responder.set_discover_result(DeviceDiscovery {
                id: "other".to_string(),
                request: None,
                actual: Some(DiscoverResult::default()),
            });
            responder.set_discover_result(DeviceDiscovery {
                id: "m1".to_string(),
                request: None,
                actual: Some(DiscoverResult {
                    id: "m1".to_string(),
                    addresses: vec![],
                }),
            });
        });

        let result = pool
            .trigger(&token, "m1", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result.id, "m1");
    }

    #[tokio::test]
    async fn test_trigger_times_out_without_response() {
        let pool = pool();
        let token = CancellationToken::new();

        let err = pool
            .trigger(&token, "m1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_concurrent_triggers_for_different_ids() {
        let pool = pool();
        let token = CancellationToken::new();

        let p1 = Arc::clone(&pool);
        let t1 = token.clone();
        let a = tokio::spawn(async move { p1.trigger(&t1, "a", Duration::from_secs(2)).await });
        let p2 = Arc::clone(&pool);
        let t2 = token.clone();
        let b = tokio::spawn(async move { p2.trigger(&t2, "b", Duration::from_secs(2)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.set_discover_result(DeviceDiscovery {
            id: "b".to_string(),
            request: None,
            actual: Some(DiscoverResult {
                id: "b".to_string(),
                addresses: vec![],
            }),
        });
        pool.set_discover_result(DeviceDiscovery {
            id: "a".to_string(),
            request: None,
            actual: Some(DiscoverResult {
                id: "a".to_string(),
                addresses: vec![],
            }),
        });

        assert_eq!(a.await.unwrap().unwrap().id, "a");
        assert_eq!(b.await.unwrap().unwrap().id, "b");
    }
}
