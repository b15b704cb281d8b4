//! The manager: one facade over all state pools.
//!
//! The manager composes the typed pools, owns the reconfigure pipeline
//! (registry queue in, re-published worker requests out) and pushes
//! requests directly to capable workers as a latency optimization. The
//! pool publication always remains the authoritative channel; a failed
//! push is logged and forgotten.

mod clock_pool;
mod discover_pool;
mod fanout;
mod filter;
mod loc_pool;
mod output_pool;
mod power_pool;
mod sensor_pool;
mod switch_pool;
mod worker_pool;

pub use discover_pool::TRIGGER_TIMEOUT;
pub use fanout::{Subscription, CHAN_TIMEOUT, PUB_TIMEOUT};
pub use filter::ModuleFilter;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{
    ApiError, Clock, DeviceDiscovery, DiscoverResult, Loc, LocalWorker, LocalWorkerInfo, Output,
    Power, PowerState, Sensor, Switch, GLOBAL_MODULE_ID,
};
use crate::client::WorkerClient;
use crate::metrics::MetricsClient;
use crate::registry::ConfigRegistry;

use clock_pool::ClockPool;
use discover_pool::DiscoverPool;
use loc_pool::LocPool;
use output_pool::OutputPool;
use power_pool::PowerPool;
use sensor_pool::SensorPool;
use switch_pool::SwitchPool;
use worker_pool::LocalWorkerPool;

/// Everything the manager needs from its surroundings.
pub struct ManagerDependencies {
    /// File-backed worker configuration registry.
    pub registry: Arc<dyn ConfigRegistry>,
    /// Queue of worker IDs whose on-disk configuration changed.
    pub reconfigure_rx: mpsc::Receiver<String>,
    pub metrics: MetricsClient,
}

/// The core of the network manager.
pub struct Manager {
    registry: Arc<dyn ConfigRegistry>,
    reconfigure_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    discover_pool: DiscoverPool,
    power_pool: PowerPool,
    loc_pool: LocPool,
    output_pool: OutputPool,
    sensor_pool: SensorPool,
    switch_pool: SwitchPool,
    clock_pool: ClockPool,
    local_worker_pool: Arc<LocalWorkerPool>,
}

/// A request the manager pushes directly to workers that advertise the
/// matching capability flag.
#[derive(Debug, Clone)]
enum PushRequest {
    Power(PowerState),
    Loc(Loc),
    Output(Output),
    Switch(Switch),
    Discovery(DeviceDiscovery),
}

impl PushRequest {
    fn supported_by(&self, info: &LocalWorkerInfo) -> bool {
        match self {
            Self::Power(_) => info.supports_set_power_request,
            Self::Loc(_) => info.supports_set_loc_request,
            Self::Output(_) => info.supports_set_output_request,
            Self::Switch(_) => info.supports_set_switch_request,
            Self::Discovery(_) => info.supports_set_device_discovery_request,
        }
    }

    /// Target module: `None` means every worker.
    fn module(&self) -> Option<String> {
        match self {
            Self::Power(_) => None,
            Self::Loc(x) => Some(x.address.module().to_string()),
            Self::Output(x) => Some(x.address.module().to_string()),
            Self::Switch(x) => Some(x.address.module().to_string()),
            Self::Discovery(x) => Some(x.id.clone()),
        }
    }

    fn op_name(&self) -> &'static str {
        match self {
            Self::Power(_) => "power request",
            Self::Loc(_) => "loc request",
            Self::Output(_) => "output request",
            Self::Switch(_) => "switch request",
            Self::Discovery(_) => "device discovery request",
        }
    }

    async fn send(self, client: &mut WorkerClient) -> Result<(), ApiError> {
        match self {
            Self::Power(x) => client.set_power_request(x).await,
            Self::Loc(x) => client.set_loc_request(x).await,
            Self::Output(x) => client.set_output_request(x).await,
            Self::Switch(x) => client.set_switch_request(x).await,
            Self::Discovery(x) => client.set_device_discovery_request(x).await,
        }
    }
}

impl Manager {
    pub fn new(deps: ManagerDependencies) -> Self {
        let metrics = deps.metrics;
        Self {
            registry: deps.registry,
            reconfigure_rx: tokio::sync::Mutex::new(deps.reconfigure_rx),
            discover_pool: DiscoverPool::new(metrics.clone()),
            power_pool: PowerPool::new(metrics.clone()),
            loc_pool: LocPool::new(metrics.clone()),
            output_pool: OutputPool::new(metrics.clone()),
            sensor_pool: SensorPool::new(metrics.clone()),
            switch_pool: SwitchPool::new(metrics.clone()),
            clock_pool: ClockPool::new(metrics.clone()),
            local_worker_pool: Arc::new(LocalWorkerPool::new(metrics)),
        }
    }

    /// Runs the reconfigure pipeline until the token is cancelled.
    ///
    /// Every worker ID drained from the registry queue gets its changed
    /// configuration re-read and re-published (with a recomputed hash) so
    /// every active config stream for that worker re-sends it.
    pub async fn run(&self, token: CancellationToken) {
        let mut rx = self.reconfigure_rx.lock().await;
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                id = rx.recv() => {
                    match id {
                        Some(id) => self.reconfigure_worker(&id),
                        None => break,
                    }
                }
            }
        }
        tracing::debug!("manager run finished");
    }

    fn reconfigure_worker(&self, id: &str) {
        tracing::info!(id, "reconfiguration detected");
        match self.registry.get(id) {
            Ok(config) => {
                if let Err(err) =
                    self.set_local_worker_request(LocalWorker::new(id).with_request(config))
                {
                    tracing::warn!(id, error = %err, "failed to re-publish worker configuration");
                }
            }
            Err(err) => {
                tracing::warn!(id, error = %err, "cannot load changed worker configuration");
            }
        }
    }

    /// Loads a worker's configuration from the registry into the pool if
    /// it has no request state yet, so replay can serve the first config.
    pub fn ensure_worker_config(&self, id: &str) -> Result<(), ApiError> {
        let loaded = self
            .local_worker_pool
            .get(id)
            .map_or(false, |lw| lw.request.is_some());
        if loaded {
            return Ok(());
        }
        let config = self.registry.get(id)?;
        self.local_worker_pool
            .set_request(LocalWorker::new(id).with_request(config))
    }

    fn spawn_push(&self, push: PushRequest) {
        let pool = Arc::clone(&self.local_worker_pool);
        tokio::spawn(async move {
            let targets: Vec<String> = match push.module() {
                Some(module) if module != GLOBAL_MODULE_ID => pool
                    .get_info(&module)
                    .filter(|(info, _, _)| push.supported_by(info))
                    .map(|(info, _, _)| vec![info.id])
                    .unwrap_or_default(),
                _ => pool
                    .get_all()
                    .into_iter()
                    .filter(|info| push.supported_by(info))
                    .map(|info| info.id)
                    .collect(),
            };

            for id in targets {
                match pool.get_client(&id).await {
                    Ok(mut client) => {
                        if let Err(err) = push.clone().send(&mut client).await {
                            tracing::warn!(
                                id = %id,
                                error = %err,
                                "failed to send {} to local worker",
                                push.op_name()
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!(id = %id, error = %err, "failed to get local worker client");
                    }
                }
            }
        });
    }

    // --- local workers ---

    /// Last known info for one worker: `(info, remote_addr, last_updated)`.
    pub fn get_local_worker_info(
        &self,
        id: &str,
    ) -> Option<(LocalWorkerInfo, String, Option<DateTime<Utc>>)> {
        self.local_worker_pool.get_info(id)
    }

    /// Last known info for all workers, sorted by ID.
    pub fn get_all_local_workers(&self) -> Vec<LocalWorkerInfo> {
        self.local_worker_pool.get_all()
    }

    pub fn subscribe_local_worker_requests(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<LocalWorker> {
        self.local_worker_pool.sub_requests(enabled, timeout, filter)
    }

    pub fn subscribe_local_worker_actuals(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<LocalWorker> {
        self.local_worker_pool.sub_actuals(enabled, timeout, filter)
    }

    pub fn set_local_worker_request(&self, lw: LocalWorker) -> Result<(), ApiError> {
        self.local_worker_pool.set_request(lw)
    }

    pub fn set_local_worker_actual(
        &self,
        lw: LocalWorker,
        remote_addr: String,
    ) -> Result<(), ApiError> {
        self.local_worker_pool.set_actual(lw, remote_addr)
    }

    /// Requests the worker with the given ID to reset itself.
    pub async fn request_reset_local_worker(&self, id: &str) -> Result<(), ApiError> {
        self.local_worker_pool.request_reset(id).await
    }

    // --- device discovery ---

    /// Triggers a discovery and waits for the worker's response.
    pub async fn discover(
        &self,
        token: &CancellationToken,
        id: &str,
        timeout: Duration,
    ) -> Result<DiscoverResult, ApiError> {
        self.spawn_push(PushRequest::Discovery(DeviceDiscovery {
            id: id.to_string(),
            request: None,
            actual: None,
        }));
        self.discover_pool.trigger(token, id, timeout).await
    }

    /// Publishes a discovery request without waiting for the response.
    pub fn set_device_discovery_request(&self, req: DeviceDiscovery) {
        self.discover_pool.set_discover_request(req.clone());
        self.spawn_push(PushRequest::Discovery(req));
    }

    /// Called by the local worker in response to discover requests.
    pub fn set_device_discovery_actual(&self, req: DeviceDiscovery) {
        self.discover_pool.set_discover_result(req);
    }

    pub fn subscribe_discover_requests(
        &self,
        enabled: bool,
        timeout: Duration,
        id: &str,
    ) -> Subscription<DeviceDiscovery> {
        self.discover_pool.sub_requests(enabled, timeout, id)
    }

    pub fn subscribe_discover_actuals(
        &self,
        enabled: bool,
        timeout: Duration,
        id: &str,
    ) -> Subscription<DeviceDiscovery> {
        self.discover_pool.sub_actuals(enabled, timeout, id)
    }

    // --- power ---

    pub fn set_power_request(&self, x: PowerState) {
        self.power_pool.set_request(x);
        self.spawn_push(PushRequest::Power(x));
    }

    pub fn set_power_actual(&self, x: PowerState) {
        self.power_pool.set_actual(x);
    }

    pub fn get_power(&self) -> Power {
        self.power_pool.get()
    }

    pub fn subscribe_power_requests(&self, enabled: bool, timeout: Duration) -> Subscription<Power> {
        self.power_pool.sub_requests(enabled, timeout)
    }

    pub fn subscribe_power_actuals(&self, enabled: bool, timeout: Duration) -> Subscription<Power> {
        self.power_pool.sub_actuals(enabled, timeout)
    }

    // --- locs ---

    pub fn set_loc_request(&self, x: Loc) {
        self.loc_pool.set_request(x.clone());
        self.spawn_push(PushRequest::Loc(x));
    }

    pub fn set_loc_actual(&self, x: Loc) {
        self.loc_pool.set_actual(x);
    }

    pub fn get_loc(&self, address: &crate::api::ObjectAddress) -> Option<Loc> {
        self.loc_pool.get(address)
    }

    pub fn subscribe_loc_requests(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<Loc> {
        self.loc_pool.sub_requests(enabled, timeout, filter)
    }

    pub fn subscribe_loc_actuals(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<Loc> {
        self.loc_pool.sub_actuals(enabled, timeout, filter)
    }

    // --- outputs ---

    pub fn set_output_request(&self, x: Output) {
        self.output_pool.set_request(x.clone());
        self.spawn_push(PushRequest::Output(x));
    }

    pub fn set_output_actual(&self, x: Output) {
        self.output_pool.set_actual(x);
    }

    pub fn get_output(&self, address: &crate::api::ObjectAddress) -> Option<Output> {
        self.output_pool.get(address)
    }

    pub fn subscribe_output_requests(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<Output> {
        self.output_pool.sub_requests(enabled, timeout, filter)
    }

    pub fn subscribe_output_actuals(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<Output> {
        self.output_pool.sub_actuals(enabled, timeout, filter)
    }

    // --- sensors ---

    pub fn set_sensor_actual(&self, x: Sensor) {
        self.sensor_pool.set_actual(x);
    }

    pub fn get_sensor(&self, address: &crate::api::ObjectAddress) -> Option<Sensor> {
        self.sensor_pool.get(address)
    }

    pub fn subscribe_sensor_actuals(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<Sensor> {
        self.sensor_pool.sub_actuals(enabled, timeout, filter)
    }

    // --- switches ---

    pub fn set_switch_request(&self, x: Switch) {
        self.switch_pool.set_request(x.clone());
        self.spawn_push(PushRequest::Switch(x));
    }

    pub fn set_switch_actual(&self, x: Switch) {
        self.switch_pool.set_actual(x);
    }

    pub fn get_switch(&self, address: &crate::api::ObjectAddress) -> Option<Switch> {
        self.switch_pool.get(address)
    }

    pub fn subscribe_switch_requests(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<Switch> {
        self.switch_pool.sub_requests(enabled, timeout, filter)
    }

    pub fn subscribe_switch_actuals(
        &self,
        enabled: bool,
        timeout: Duration,
        filter: ModuleFilter,
    ) -> Subscription<Switch> {
        self.switch_pool.sub_actuals(enabled, timeout, filter)
    }

    // --- clock ---

    pub fn set_clock_actual(&self, x: Clock) {
        self.clock_pool.set_actual(x);
    }

    pub fn get_clock(&self) -> Clock {
        self.clock_pool.get()
    }

    pub fn subscribe_clock_actuals(&self, enabled: bool, timeout: Duration) -> Subscription<Clock> {
        self.clock_pool.sub_actuals(enabled, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LocalWorkerConfig;
    use crate::registry::ConfigRegistry;
    use std::collections::HashMap;

    struct MapRegistry {
        configs: HashMap<String, LocalWorkerConfig>,
    }

    impl ConfigRegistry for MapRegistry {
        fn get(&self, id: &str) -> Result<LocalWorkerConfig, ApiError> {
            self.configs
                .get(id)
                .cloned()
                .ok_or_else(|| ApiError::NotFound(format!("no configuration for [{}]", id)))
        }
    }

    fn manager_with(
        configs: &[(&str, &str)],
    ) -> (Manager, mpsc::Sender<String>) {
        let configs = configs
            .iter()
            .map(|(id, alias)| {
                (
                    id.to_string(),
                    LocalWorkerConfig {
                        alias: alias.to_string(),
                        ..Default::default()
                    },
                )
            })
            .collect();
        let (tx, rx) = mpsc::channel(64);
        let manager = Manager::new(ManagerDependencies {
            registry: Arc::new(MapRegistry { configs }),
            reconfigure_rx: rx,
            metrics: MetricsClient::disabled(),
        });
        (manager, tx)
    }

    #[tokio::test]
    async fn test_reconfigure_republishes_worker_request() {
        let (manager, tx) = manager_with(&[("w1", "east")]);
        let manager = Arc::new(manager);
        let token = CancellationToken::new();

        let mut sub = manager.subscribe_local_worker_requests(
            true,
            Duration::from_secs(1),
            ModuleFilter::any(),
        );

        let run_manager = Arc::clone(&manager);
        let run_token = token.clone();
        let run = tokio::spawn(async move { run_manager.run(run_token).await });

        tx.send("w1".to_string()).await.unwrap();

        let lw = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("no reconfigure publication")
            .unwrap();
        assert_eq!(lw.id, "w1");
        let request = lw.request.unwrap();
        assert_eq!(request.alias, "east");
        assert!(!request.hash.is_empty());

        token.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconfigure_for_unknown_worker_is_logged_not_fatal() {
        let (manager, tx) = manager_with(&[]);
        let manager = Arc::new(manager);
        let token = CancellationToken::new();

        let run_manager = Arc::clone(&manager);
        let run_token = token.clone();
        let run = tokio::spawn(async move { run_manager.run(run_token).await });

        tx.send("ghost".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Manager is still alive and serving.
        assert!(manager.get_all_local_workers().is_empty());
        token.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_worker_config_loads_once() {
        let (manager, _tx) = manager_with(&[("w1", "east")]);

        manager.ensure_worker_config("w1").unwrap();
        let first_hash = manager
            .local_worker_pool
            .get("w1")
            .unwrap()
            .request
            .unwrap()
            .hash;

        // Second call is a no-op; the hash stays identical.
        manager.ensure_worker_config("w1").unwrap();
        let second_hash = manager
            .local_worker_pool
            .get("w1")
            .unwrap()
            .request
            .unwrap()
            .hash;
        assert_eq!(first_hash, second_hash);

        assert!(matches!(
            manager.ensure_worker_config("ghost").unwrap_err(),
            ApiError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_set_requests_update_pools() {
        let (manager, _tx) = manager_with(&[]);

        manager.set_power_request(PowerState { enabled: true });
        assert!(manager.get_power().request.enabled);

        manager.set_loc_request(Loc::new("m1/L1").with_request(Default::default()));
        assert!(manager.get_loc(&"m1/L1".into()).is_some());

        manager.set_switch_request(Switch::new("m1/W1").with_request(Default::default()));
        manager.set_switch_actual(Switch::new("m1/W1").with_actual(Default::default()));
        let sw = manager.get_switch(&"m1/W1".into()).unwrap();
        assert!(sw.request.is_some() && sw.actual.is_some());
    }
}
