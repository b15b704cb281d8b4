//! Per-connection frame dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, Clock, DeviceDiscovery, Loc, LocalWorker, Output, Power, Switch};
use crate::manager::{Manager, ModuleFilter, Subscription, CHAN_TIMEOUT};
use crate::wire::{ClientFrame, JsonFrameCodec, Request, ServerFrame, StreamItem, WireError};

/// Depth of the per-connection outbound frame queue.
const OUTBOUND_QUEUE: usize = 32;

/// One client connection (network controller or local worker).
pub(crate) struct Connection {
    manager: Arc<Manager>,
    /// Peer address, host part only. Workers are dialed back here.
    peer_host: String,
    token: CancellationToken,
}

impl Connection {
    pub(crate) fn new(manager: Arc<Manager>, peer_host: String, token: CancellationToken) -> Self {
        Self {
            manager,
            peer_host,
            token,
        }
    }

    pub(crate) async fn run(self, stream: TcpStream) {
        let framed: Framed<TcpStream, JsonFrameCodec<ServerFrame, ClientFrame>> =
            Framed::new(stream, JsonFrameCodec::new());
        let (mut sink, mut frames) = framed.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE);
        let writer_token = self.token.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    writer_token.cancel();
                    break;
                }
            }
        });

        // Open server streams (by correlation ID) and the per-stream
        // cancellation handles.
        let mut server_streams: HashMap<u64, CancellationToken> = HashMap::new();
        // Open client streams and the operation they were opened with.
        let mut client_streams: HashMap<u64, Request> = HashMap::new();

        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => break,

                frame = frames.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            self.handle_frame(
                                frame,
                                &out_tx,
                                &mut server_streams,
                                &mut client_streams,
                            )
                            .await;
                        }
                        Some(Err(err)) => {
                            tracing::warn!(peer = %self.peer_host, error = %err, "frame decode failed");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        self.token.cancel();
        for (_, stream_token) in server_streams {
            stream_token.cancel();
        }
        drop(out_tx);
        let _ = writer.await;
        tracing::debug!(peer = %self.peer_host, "connection closed");
    }

    async fn handle_frame(
        &self,
        frame: ClientFrame,
        out: &mpsc::Sender<ServerFrame>,
        server_streams: &mut HashMap<u64, CancellationToken>,
        client_streams: &mut HashMap<u64, Request>,
    ) {
        match frame {
            ClientFrame::Request { id, body } => {
                tracing::debug!(peer = %self.peer_host, id, op = body.op_name(), "request");
                if body.is_client_stream() {
                    client_streams.insert(id, body);
                } else if let Some(stream_token) = self.open_server_stream(id, &body, out) {
                    server_streams.insert(id, stream_token);
                } else {
                    self.handle_unary(id, body, out).await;
                }
            }
            ClientFrame::StreamItem { id, item } => {
                self.handle_stream_item(id, item, client_streams);
            }
            ClientFrame::StreamEnd { id } => {
                // Peer closed its stream of actuals: clean termination.
                if client_streams.remove(&id).is_some() {
                    let _ = out.send(ServerFrame::Response { id, error: None }).await;
                }
            }
            ClientFrame::Cancel { id } => {
                if let Some(stream_token) = server_streams.remove(&id) {
                    stream_token.cancel();
                }
            }
        }
    }

    /// Routes one element of a client stream into the matching pool.
    fn handle_stream_item(
        &self,
        id: u64,
        item: StreamItem,
        client_streams: &mut HashMap<u64, Request>,
    ) {
        match (client_streams.get(&id), item) {
            (Some(Request::SetPowerActuals), StreamItem::PowerState(x)) => {
                self.manager.set_power_actual(x);
            }
            (Some(Request::SetLocActuals), StreamItem::Loc(x)) => {
                self.manager.set_loc_actual(x);
            }
            (Some(Request::SetSensorActuals), StreamItem::Sensor(x)) => {
                self.manager.set_sensor_actual(x);
            }
            (Some(Request::SetOutputActuals), StreamItem::Output(x)) => {
                self.manager.set_output_actual(x);
            }
            (Some(Request::SetSwitchActuals), StreamItem::Switch(x)) => {
                self.manager.set_switch_actual(x);
            }
            (Some(op), _) => {
                tracing::warn!(id, op = op.op_name(), "stream item of unexpected kind");
            }
            (None, _) => {
                tracing::warn!(id, "stream item for unknown stream");
            }
        }
    }

    async fn handle_unary(&self, id: u64, body: Request, out: &mpsc::Sender<ServerFrame>) {
        // Reset requests dial the worker and may block on retries, so
        // they complete on their own task.
        let body = match body {
            Request::RequestReset(info) => {
                if info.id.is_empty() {
                    let err = ApiError::InvalidArgument("id missing".to_string());
                    let _ = out
                        .send(ServerFrame::Response {
                            id,
                            error: Some(WireError::from_api(&err)),
                        })
                        .await;
                    return;
                }
                let manager = Arc::clone(&self.manager);
                let out = out.clone();
                tokio::spawn(async move {
                    let result = manager.request_reset_local_worker(&info.id).await;
                    let error = result.err().map(|e| WireError::from_api(&e));
                    let _ = out.send(ServerFrame::Response { id, error }).await;
                });
                return;
            }
            other => other,
        };

        let result = self.dispatch_unary(body);
        let error = result.err().map(|e| WireError::from_api(&e));
        let _ = out.send(ServerFrame::Response { id, error }).await;
    }

    fn dispatch_unary(&self, body: Request) -> Result<(), ApiError> {
        let manager = &self.manager;
        match body {
            Request::Ping(info) => manager.set_local_worker_actual(
                LocalWorker::new(info.id.clone()).with_actual(info),
                self.peer_host.clone(),
            ),
            Request::SetDiscoverResult(result) => {
                if result.id.is_empty() {
                    return Err(ApiError::InvalidArgument("id missing".to_string()));
                }
                let mut discovery = DeviceDiscovery::new(result.id.clone());
                discovery.actual = Some(result);
                manager.set_device_discovery_actual(discovery);
                Ok(())
            }
            Request::SetLocalWorkerRequest(lw) => manager.set_local_worker_request(lw),
            Request::SetLocalWorkerActual(lw) => {
                manager.set_local_worker_actual(lw, self.peer_host.clone())
            }
            Request::SetPowerRequest(x) => {
                manager.set_power_request(x);
                Ok(())
            }
            Request::SetPowerActual(x) => {
                manager.set_power_actual(x);
                Ok(())
            }
            Request::SetLocRequest(x) => {
                manager.set_loc_request(x);
                Ok(())
            }
            Request::SetLocActual(x) => {
                manager.set_loc_actual(x);
                Ok(())
            }
            Request::SetSensorActual(x) => {
                manager.set_sensor_actual(x);
                Ok(())
            }
            Request::SetOutputRequest(x) => {
                manager.set_output_request(x);
                Ok(())
            }
            Request::SetOutputActual(x) => {
                manager.set_output_actual(x);
                Ok(())
            }
            Request::SetSwitchRequest(x) => {
                manager.set_switch_request(x);
                Ok(())
            }
            Request::SetSwitchActual(x) => {
                manager.set_switch_actual(x);
                Ok(())
            }
            Request::SetDeviceDiscoveryRequest(x) => {
                manager.set_device_discovery_request(x);
                Ok(())
            }
            Request::SetDeviceDiscoveryActual(x) => {
                manager.set_device_discovery_actual(x);
                Ok(())
            }
            Request::SetClockActual(x) => {
                manager.set_clock_actual(x);
                Ok(())
            }
            // This service does not host the worker-side Reset operation.
            Request::Reset => Err(ApiError::InvalidArgument(
                "reset is served by local workers".to_string(),
            )),
            other => Err(ApiError::InvalidArgument(format!(
                "{} is not a unary operation",
                other.op_name()
            ))),
        }
    }

    /// Opens a server stream for `body`, returning its cancel handle, or
    /// `None` when the operation is not a server-streaming one.
    fn open_server_stream(
        &self,
        id: u64,
        body: &Request,
        out: &mpsc::Sender<ServerFrame>,
    ) -> Option<CancellationToken> {
        let manager = &self.manager;
        match body {
            Request::GetConfig(info) => {
                if info.id.is_empty() {
                    return Some(self.fail_stream(
                        id,
                        out,
                        ApiError::InvalidArgument("id missing".to_string()),
                    ));
                }
                // Seed the pool from the registry so replay serves the
                // initial config.
                if let Err(err) = manager.ensure_worker_config(&info.id) {
                    tracing::warn!(id = %info.id, error = %err, "no stored configuration yet");
                }
                let worker_id = info.id.clone();
                let sub = manager.subscribe_local_worker_requests(
                    true,
                    CHAN_TIMEOUT,
                    ModuleFilter::new(&worker_id),
                );
                Some(self.spawn_request_stream(
                    id,
                    out,
                    sub,
                    move |lw: &LocalWorker| {
                        if lw.id == worker_id {
                            lw.request.clone().map(StreamItem::LocalWorkerConfig)
                        } else {
                            None
                        }
                    },
                    None,
                ))
            }

            Request::GetDiscoverRequests(info) => {
                let sub = manager.subscribe_discover_requests(true, CHAN_TIMEOUT, &info.id);
                Some(self.spawn_request_stream(
                    id,
                    out,
                    sub,
                    |msg: &DeviceDiscovery| Some(StreamItem::DeviceDiscovery(msg.clone())),
                    None,
                ))
            }

            Request::GetPowerRequests(opts) => {
                let sub = manager.subscribe_power_requests(true, CHAN_TIMEOUT);
                let confirm = (!opts.manual_confirm).then(|| {
                    let manager = Arc::clone(manager);
                    Box::new(move |power: &Power| manager.set_power_actual(power.request))
                        as Box<dyn Fn(&Power) + Send>
                });
                Some(self.spawn_request_stream(
                    id,
                    out,
                    sub,
                    |power: &Power| Some(StreamItem::PowerState(power.request)),
                    confirm,
                ))
            }

            Request::GetLocRequests(opts) => {
                let sub = manager.subscribe_loc_requests(
                    true,
                    CHAN_TIMEOUT,
                    ModuleFilter::from(opts.module_id.clone()),
                );
                let confirm = (!opts.manual_confirm).then(|| {
                    let manager = Arc::clone(manager);
                    Box::new(move |loc: &Loc| {
                        let mut actual = Loc::new(loc.address.clone());
                        actual.actual = loc.request.clone();
                        manager.set_loc_actual(actual);
                    }) as Box<dyn Fn(&Loc) + Send>
                });
                Some(self.spawn_request_stream(
                    id,
                    out,
                    sub,
                    |loc: &Loc| Some(StreamItem::Loc(loc.clone())),
                    confirm,
                ))
            }

            Request::GetOutputRequests(opts) => {
                let sub = manager.subscribe_output_requests(
                    true,
                    CHAN_TIMEOUT,
                    ModuleFilter::from(opts.module_id.clone()),
                );
                let confirm = (!opts.manual_confirm).then(|| {
                    let manager = Arc::clone(manager);
                    Box::new(move |output: &Output| {
                        let mut actual = Output::new(output.address.clone());
                        actual.actual = output.request.clone();
                        manager.set_output_actual(actual);
                    }) as Box<dyn Fn(&Output) + Send>
                });
                Some(self.spawn_request_stream(
                    id,
                    out,
                    sub,
                    |output: &Output| Some(StreamItem::Output(output.clone())),
                    confirm,
                ))
            }

            Request::GetSwitchRequests(opts) => {
                let sub = manager.subscribe_switch_requests(
                    true,
                    CHAN_TIMEOUT,
                    ModuleFilter::from(opts.module_id.clone()),
                );
                let confirm = (!opts.manual_confirm).then(|| {
                    let manager = Arc::clone(manager);
                    Box::new(move |sw: &Switch| {
                        let mut actual = Switch::new(sw.address.clone());
                        actual.actual = sw.request.clone();
                        manager.set_switch_actual(actual);
                    }) as Box<dyn Fn(&Switch) + Send>
                });
                Some(self.spawn_request_stream(
                    id,
                    out,
                    sub,
                    |sw: &Switch| Some(StreamItem::Switch(sw.clone())),
                    confirm,
                ))
            }

            Request::GetClock => {
                let sub = manager.subscribe_clock_actuals(true, CHAN_TIMEOUT);
                Some(self.spawn_request_stream(
                    id,
                    out,
                    sub,
                    |clock: &Clock| Some(StreamItem::Clock(clock.clone())),
                    None,
                ))
            }

            Request::WatchLocalWorkers(opts) => {
                let filter = ModuleFilter::from(opts.module_id.clone());
                let actuals = manager.subscribe_local_worker_actuals(
                    opts.watch_actual_changes,
                    CHAN_TIMEOUT,
                    filter.clone(),
                );
                let requests = manager.subscribe_local_worker_requests(
                    opts.watch_request_changes,
                    CHAN_TIMEOUT,
                    filter,
                );
                Some(self.spawn_watch(id, out, actuals, requests, StreamItem::LocalWorker))
            }

            Request::WatchDeviceDiscoveries(opts) => {
                let actuals = manager.subscribe_discover_actuals(
                    opts.watch_actual_changes,
                    CHAN_TIMEOUT,
                    &opts.module_id,
                );
                let requests = manager.subscribe_discover_requests(
                    opts.watch_request_changes,
                    CHAN_TIMEOUT,
                    &opts.module_id,
                );
                Some(self.spawn_watch(id, out, actuals, requests, StreamItem::DeviceDiscovery))
            }

            Request::WatchPower(opts) => {
                let actuals =
                    manager.subscribe_power_actuals(opts.watch_actual_changes, CHAN_TIMEOUT);
                let requests =
                    manager.subscribe_power_requests(opts.watch_request_changes, CHAN_TIMEOUT);
                Some(self.spawn_watch(id, out, actuals, requests, StreamItem::Power))
            }

            Request::WatchLocs(opts) => {
                let filter = ModuleFilter::from(opts.module_id.clone());
                let actuals = manager.subscribe_loc_actuals(
                    opts.watch_actual_changes,
                    CHAN_TIMEOUT,
                    filter.clone(),
                );
                let requests = manager.subscribe_loc_requests(
                    opts.watch_request_changes,
                    CHAN_TIMEOUT,
                    filter,
                );
                Some(self.spawn_watch(id, out, actuals, requests, StreamItem::Loc))
            }

            Request::WatchSensors(opts) => {
                let filter = ModuleFilter::from(opts.module_id.clone());
                let actuals = manager.subscribe_sensor_actuals(
                    opts.watch_actual_changes,
                    CHAN_TIMEOUT,
                    filter.clone(),
                );
                // Sensors have no request side; keep the second arm inert.
                let requests = manager.subscribe_sensor_actuals(false, CHAN_TIMEOUT, filter);
                Some(self.spawn_watch(id, out, actuals, requests, StreamItem::Sensor))
            }

            Request::WatchOutputs(opts) => {
                let filter = ModuleFilter::from(opts.module_id.clone());
                let actuals = manager.subscribe_output_actuals(
                    opts.watch_actual_changes,
                    CHAN_TIMEOUT,
                    filter.clone(),
                );
                let requests = manager.subscribe_output_requests(
                    opts.watch_request_changes,
                    CHAN_TIMEOUT,
                    filter,
                );
                Some(self.spawn_watch(id, out, actuals, requests, StreamItem::Output))
            }

            Request::WatchSwitches(opts) => {
                let filter = ModuleFilter::from(opts.module_id.clone());
                let actuals = manager.subscribe_switch_actuals(
                    opts.watch_actual_changes,
                    CHAN_TIMEOUT,
                    filter.clone(),
                );
                let requests = manager.subscribe_switch_requests(
                    opts.watch_request_changes,
                    CHAN_TIMEOUT,
                    filter,
                );
                Some(self.spawn_watch(id, out, actuals, requests, StreamItem::Switch))
            }

            Request::WatchClock(opts) => {
                let actuals =
                    manager.subscribe_clock_actuals(opts.watch_actual_changes, CHAN_TIMEOUT);
                let requests = manager.subscribe_clock_actuals(false, CHAN_TIMEOUT);
                Some(self.spawn_watch(id, out, actuals, requests, StreamItem::Clock))
            }

            _ => None,
        }
    }

    /// Immediately fails a stream operation.
    fn fail_stream(
        &self,
        id: u64,
        out: &mpsc::Sender<ServerFrame>,
        err: ApiError,
    ) -> CancellationToken {
        let out = out.clone();
        let error = Some(WireError::from_api(&err));
        tokio::spawn(async move {
            let _ = out.send(ServerFrame::StreamEnd { id, error }).await;
        });
        self.token.child_token()
    }

    /// Pumps one subscription onto the wire, optionally synthesising a
    /// matching actual after each forwarded request (`ManualConfirm`
    /// disabled).
    fn spawn_request_stream<V, F>(
        &self,
        id: u64,
        out: &mpsc::Sender<ServerFrame>,
        mut sub: Subscription<V>,
        to_item: F,
        confirm: Option<Box<dyn Fn(&V) + Send>>,
    ) -> CancellationToken
    where
        V: Send + 'static,
        F: Fn(&V) -> Option<StreamItem> + Send + 'static,
    {
        let token = self.token.child_token();
        let task_token = token.clone();
        let out = out.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = task_token.cancelled() => break,

                    msg = sub.recv() => {
                        let Some(value) = msg else { break };
                        let Some(item) = to_item(&value) else { continue };
                        if out.send(ServerFrame::StreamItem { id, item }).await.is_err() {
                            break;
                        }
                        if let Some(confirm) = &confirm {
                            (confirm)(&value);
                        }
                    }
                }
            }
            let _ = out.try_send(ServerFrame::StreamEnd { id, error: None });
        });
        token
    }

    /// Pumps the actual and request subscriptions of a watch; whichever
    /// yields first is forwarded.
    fn spawn_watch<V, F>(
        &self,
        id: u64,
        out: &mpsc::Sender<ServerFrame>,
        mut actuals: Subscription<V>,
        mut requests: Subscription<V>,
        to_item: F,
    ) -> CancellationToken
    where
        V: Send + 'static,
        F: Fn(V) -> StreamItem + Send + 'static,
    {
        let token = self.token.child_token();
        let task_token = token.clone();
        let out = out.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = task_token.cancelled() => break,

                    msg = actuals.recv() => {
                        let Some(value) = msg else { break };
                        if out.send(ServerFrame::StreamItem { id, item: to_item(value) }).await.is_err() {
                            break;
                        }
                    }

                    msg = requests.recv() => {
                        let Some(value) = msg else { break };
                        if out.send(ServerFrame::StreamItem { id, item: to_item(value) }).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = out.try_send(ServerFrame::StreamEnd { id, error: None });
        });
        token
    }
}
