//! Client for network controllers.
//!
//! Wraps one connection to the manager's network control service:
//! unary `set_*` operations, `watch_*` streams and reset requests. A
//! background task demultiplexes incoming frames onto the pending
//! operations by correlation ID, so watches and unary calls share the
//! connection freely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::api::{
    ApiError, Clock, DeviceDiscovery, Loc, LocalWorker, LocalWorkerInfo, Output, Power,
    PowerState, Sensor, Switch, WatchOptions,
};
use crate::wire::{ClientFrame, JsonFrameCodec, Request, ServerFrame, StreamItem, WireError};

/// Budget for a unary operation.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Depth of a watch stream's local buffer.
const WATCH_BUFFER: usize = 16;

enum PendingOp {
    Unary(oneshot::Sender<Option<WireError>>),
    Stream(mpsc::Sender<StreamItem>),
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingOp>>>;

/// A connection to the manager's network control service.
pub struct ControlClient {
    out_tx: mpsc::Sender<ClientFrame>,
    pending: PendingMap,
    next_id: AtomicU64,
    token: CancellationToken,
}

impl ControlClient {
    /// Connects to the manager at `host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ApiError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ApiError::Unavailable(format!("failed to dial {}:{}: {}", host, port, e)))?;
        let framed: Framed<TcpStream, JsonFrameCodec<ClientFrame, ServerFrame>> =
            Framed::new(stream, JsonFrameCodec::new());
        let (mut sink, mut frames) = framed.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(WATCH_BUFFER);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let token = CancellationToken::new();

        let writer_token = token.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    writer_token.cancel();
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = reader_token.cancelled() => break,

                    frame = frames.next() => {
                        let Some(Ok(frame)) = frame else { break };
                        route_frame(frame, &reader_pending).await;
                    }
                }
            }
            // Dropping the pending senders ends every open stream and
            // fails every in-flight unary call.
            reader_token.cancel();
            if let Ok(mut pending) = reader_pending.lock() {
                pending.clear();
            }
        });

        Ok(Self {
            out_tx,
            pending,
            next_id: AtomicU64::new(1),
            token,
        })
    }

    fn claim_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn unary(&self, body: Request) -> Result<(), ApiError> {
        let id = self.claim_id();
        let op = body.op_name();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.insert(id, PendingOp::Unary(tx));
        }

        if self
            .out_tx
            .send(ClientFrame::Request { id, body })
            .await
            .is_err()
        {
            self.forget(id);
            return Err(ApiError::Transport(format!("send {} failed", op)));
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(None)) => Ok(()),
            Ok(Ok(Some(err))) => Err(err.into_api()),
            Ok(Err(_)) => Err(ApiError::StreamClosed),
            Err(_) => {
                self.forget(id);
                Err(ApiError::Timeout(format!("{} did not complete", op)))
            }
        }
    }

    async fn open_stream<T>(
        &self,
        body: Request,
        extract: fn(StreamItem) -> Option<T>,
    ) -> Result<WatchStream<T>, ApiError> {
        let id = self.claim_id();
        let op = body.op_name();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.insert(id, PendingOp::Stream(tx));
        }

        if self
            .out_tx
            .send(ClientFrame::Request { id, body })
            .await
            .is_err()
        {
            self.forget(id);
            return Err(ApiError::Transport(format!("send {} failed", op)));
        }

        Ok(WatchStream {
            rx,
            extract,
            id,
            out_tx: self.out_tx.clone(),
        })
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    /// Closes the connection; open watches end.
    pub fn close(&self) {
        self.token.cancel();
    }

    // --- unary operations ---

    pub async fn set_local_worker_request(&self, lw: LocalWorker) -> Result<(), ApiError> {
        self.unary(Request::SetLocalWorkerRequest(lw)).await
    }

    pub async fn set_local_worker_actual(&self, lw: LocalWorker) -> Result<(), ApiError> {
        self.unary(Request::SetLocalWorkerActual(lw)).await
    }

    pub async fn set_power_request(&self, x: PowerState) -> Result<(), ApiError> {
        self.unary(Request::SetPowerRequest(x)).await
    }

    pub async fn set_power_actual(&self, x: PowerState) -> Result<(), ApiError> {
        self.unary(Request::SetPowerActual(x)).await
    }

    pub async fn set_loc_request(&self, x: Loc) -> Result<(), ApiError> {
        self.unary(Request::SetLocRequest(x)).await
    }

    pub async fn set_loc_actual(&self, x: Loc) -> Result<(), ApiError> {
        self.unary(Request::SetLocActual(x)).await
    }

    pub async fn set_sensor_actual(&self, x: Sensor) -> Result<(), ApiError> {
        self.unary(Request::SetSensorActual(x)).await
    }

    pub async fn set_output_request(&self, x: Output) -> Result<(), ApiError> {
        self.unary(Request::SetOutputRequest(x)).await
    }

    pub async fn set_output_actual(&self, x: Output) -> Result<(), ApiError> {
        self.unary(Request::SetOutputActual(x)).await
    }

    pub async fn set_switch_request(&self, x: Switch) -> Result<(), ApiError> {
        self.unary(Request::SetSwitchRequest(x)).await
    }

    pub async fn set_switch_actual(&self, x: Switch) -> Result<(), ApiError> {
        self.unary(Request::SetSwitchActual(x)).await
    }

    pub async fn set_device_discovery_request(&self, x: DeviceDiscovery) -> Result<(), ApiError> {
        self.unary(Request::SetDeviceDiscoveryRequest(x)).await
    }

    pub async fn set_device_discovery_actual(&self, x: DeviceDiscovery) -> Result<(), ApiError> {
        self.unary(Request::SetDeviceDiscoveryActual(x)).await
    }

    pub async fn set_clock_actual(&self, x: Clock) -> Result<(), ApiError> {
        self.unary(Request::SetClockActual(x)).await
    }

    /// Requests the worker with the given ID to reset itself.
    pub async fn request_reset(&self, id: &str) -> Result<(), ApiError> {
        self.unary(Request::RequestReset(LocalWorkerInfo {
            id: id.to_string(),
            ..Default::default()
        }))
        .await
    }

    // --- watch operations ---

    pub async fn watch_local_workers(
        &self,
        opts: WatchOptions,
    ) -> Result<WatchStream<LocalWorker>, ApiError> {
        self.open_stream(Request::WatchLocalWorkers(opts), |item| match item {
            StreamItem::LocalWorker(x) => Some(x),
            _ => None,
        })
        .await
    }

    pub async fn watch_device_discoveries(
        &self,
        opts: WatchOptions,
    ) -> Result<WatchStream<DeviceDiscovery>, ApiError> {
        self.open_stream(Request::WatchDeviceDiscoveries(opts), |item| match item {
            StreamItem::DeviceDiscovery(x) => Some(x),
            _ => None,
        })
        .await
    }

    pub async fn watch_power(&self, opts: WatchOptions) -> Result<WatchStream<Power>, ApiError> {
        self.open_stream(Request::WatchPower(opts), |item| match item {
            StreamItem::Power(x) => Some(x),
            _ => None,
        })
        .await
    }

    pub async fn watch_locs(&self, opts: WatchOptions) -> Result<WatchStream<Loc>, ApiError> {
        self.open_stream(Request::WatchLocs(opts), |item| match item {
            StreamItem::Loc(x) => Some(x),
            _ => None,
        })
        .await
    }

    pub async fn watch_sensors(&self, opts: WatchOptions) -> Result<WatchStream<Sensor>, ApiError> {
        self.open_stream(Request::WatchSensors(opts), |item| match item {
            StreamItem::Sensor(x) => Some(x),
            _ => None,
        })
        .await
    }

    pub async fn watch_outputs(&self, opts: WatchOptions) -> Result<WatchStream<Output>, ApiError> {
        self.open_stream(Request::WatchOutputs(opts), |item| match item {
            StreamItem::Output(x) => Some(x),
            _ => None,
        })
        .await
    }

    pub async fn watch_switches(
        &self,
        opts: WatchOptions,
    ) -> Result<WatchStream<Switch>, ApiError> {
        self.open_stream(Request::WatchSwitches(opts), |item| match item {
            StreamItem::Switch(x) => Some(x),
            _ => None,
        })
        .await
    }

    pub async fn watch_clock(&self, opts: WatchOptions) -> Result<WatchStream<Clock>, ApiError> {
        self.open_stream(Request::WatchClock(opts), |item| match item {
            StreamItem::Clock(x) => Some(x),
            _ => None,
        })
        .await
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn route_frame(frame: ServerFrame, pending: &PendingMap) {
    match frame {
        ServerFrame::Response { id, error } => {
            let op = {
                let mut pending = match pending.lock() {
                    Ok(pending) => pending,
                    Err(_) => return,
                };
                pending.remove(&id)
            };
            if let Some(PendingOp::Unary(tx)) = op {
                let _ = tx.send(error);
            }
        }
        ServerFrame::StreamItem { id, item } => {
            // Clone the sender out of the lock; delivering while holding
            // it would stall the reader on a slow watch consumer.
            let tx = {
                let pending = match pending.lock() {
                    Ok(pending) => pending,
                    Err(_) => return,
                };
                match pending.get(&id) {
                    Some(PendingOp::Stream(tx)) => Some(tx.clone()),
                    _ => None,
                }
            };
            if let Some(tx) = tx {
                if tx.send(item).await.is_err() {
                    if let Ok(mut pending) = pending.lock() {
                        pending.remove(&id);
                    }
                }
            }
        }
        ServerFrame::StreamEnd { id, .. } => {
            if let Ok(mut pending) = pending.lock() {
                pending.remove(&id);
            }
        }
    }
}

/// A live watch stream of one entity type.
///
/// Dropping the stream sends a cancel for its server-side counterpart.
pub struct WatchStream<T> {
    rx: mpsc::Receiver<StreamItem>,
    extract: fn(StreamItem) -> Option<T>,
    id: u64,
    out_tx: mpsc::Sender<ClientFrame>,
}

impl<T> WatchStream<T> {
    /// Receives the next value; `None` once the stream ended.
    pub async fn recv(&mut self) -> Option<T> {
        while let Some(item) = self.rx.recv().await {
            if let Some(value) = (self.extract)(item) {
                return Some(value);
            }
        }
        None
    }
}

impl<T> Drop for WatchStream<T> {
    fn drop(&mut self) {
        let _ = self.out_tx.try_send(ClientFrame::Cancel { id: self.id });
    }
}
