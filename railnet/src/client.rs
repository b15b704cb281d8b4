//! Client bridge to a local worker's own control service.
//!
//! The manager dials workers on demand to push requests that should not
//! wait on the streaming path. The bridge is a pure function of a worker
//! record's contents (host, port, secure flag); it holds no reference
//! back into the manager, so the manager → pool → bridge → worker chain
//! stays acyclic.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::api::{ApiError, DeviceDiscovery, Loc, Output, PowerState, Switch};
use crate::wire::{ClientFrame, JsonFrameCodec, Request, ServerFrame};

/// Initial backoff of the dial retry policy.
const DIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Maximum dial attempts.
const DIAL_ATTEMPTS: u32 = 3;

/// Budget for a single unary call once connected.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a worker's own service can be reached. Derived from the peer
/// address observed on the worker's connection plus the port and
/// security flag the worker advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl WorkerEndpoint {
    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A one-shot connection to a worker's control service.
#[derive(Debug)]
pub struct WorkerClient {
    framed: Framed<TcpStream, JsonFrameCodec<ClientFrame, ServerFrame>>,
    next_id: u64,
}

impl WorkerClient {
    /// Dials the worker with exponential retry: up to 3 attempts starting
    /// at 50 ms, retrying only unavailable-class transport failures.
    pub async fn connect(endpoint: WorkerEndpoint) -> Result<Self, ApiError> {
        let address = endpoint.address();
        let mut backoff = DIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 1..=DIAL_ATTEMPTS {
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    return Ok(Self {
                        framed: Framed::new(stream, JsonFrameCodec::new()),
                        next_id: 1,
                    });
                }
                Err(err) => {
                    tracing::debug!(
                        address = %address,
                        attempt,
                        error = %err,
                        "worker dial failed"
                    );
                    last_err = Some(err);
                    if attempt < DIAL_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(ApiError::Unavailable(format!(
            "failed to dial local worker at {}: {}",
            address,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Issues one unary operation and waits for its completion.
    async fn call(&mut self, body: Request) -> Result<(), ApiError> {
        let id = self.next_id;
        self.next_id += 1;
        let op = body.op_name();

        self.framed
            .send(ClientFrame::Request { id, body })
            .await
            .map_err(|e| ApiError::Transport(format!("send {} failed: {}", op, e)))?;

        let reply = tokio::time::timeout(CALL_TIMEOUT, async {
            loop {
                match self.framed.next().await {
                    Some(Ok(ServerFrame::Response {
                        id: reply_id,
                        error,
                    })) if reply_id == id => return Ok(error),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(ApiError::Transport(e.to_string())),
                    None => return Err(ApiError::StreamClosed),
                }
            }
        })
        .await
        .map_err(|_| ApiError::Timeout(format!("{} did not complete", op)))??;

        match reply {
            None => Ok(()),
            Some(err) => Err(err.into_api()),
        }
    }

    pub async fn set_power_request(&mut self, x: PowerState) -> Result<(), ApiError> {
        self.call(Request::SetPowerRequest(x)).await
    }

    pub async fn set_loc_request(&mut self, x: Loc) -> Result<(), ApiError> {
        self.call(Request::SetLocRequest(x)).await
    }

    pub async fn set_output_request(&mut self, x: Output) -> Result<(), ApiError> {
        self.call(Request::SetOutputRequest(x)).await
    }

    pub async fn set_switch_request(&mut self, x: Switch) -> Result<(), ApiError> {
        self.call(Request::SetSwitchRequest(x)).await
    }

    pub async fn set_device_discovery_request(
        &mut self,
        x: DeviceDiscovery,
    ) -> Result<(), ApiError> {
        self.call(Request::SetDeviceDiscoveryRequest(x)).await
    }

    /// Requests the worker to reset itself.
    pub async fn reset(&mut self) -> Result<(), ApiError> {
        self.call(Request::Reset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_worker(listener: TcpListener, fail_with: Option<&'static str>) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed: Framed<TcpStream, JsonFrameCodec<ServerFrame, ClientFrame>> =
            Framed::new(stream, JsonFrameCodec::new());
        while let Some(Ok(frame)) = framed.next().await {
            if let ClientFrame::Request { id, .. } = frame {
                let error = fail_with.map(|kind| crate::wire::WireError {
                    kind: kind.to_string(),
                    message: "nope".to_string(),
                });
                framed
                    .send(ServerFrame::Response { id, error })
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_unary_call_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(fake_worker(listener, None));

        let mut client = WorkerClient::connect(WorkerEndpoint {
            host: addr.ip().to_string(),
            port: addr.port(),
            secure: false,
        })
        .await
        .unwrap();

        client
            .set_power_request(PowerState { enabled: true })
            .await
            .unwrap();
        client.reset().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_kind() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(fake_worker(listener, Some("not_found")));

        let mut client = WorkerClient::connect(WorkerEndpoint {
            host: addr.ip().to_string(),
            port: addr.port(),
            secure: false,
        })
        .await
        .unwrap();

        let err = client.reset().await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_dial_failure_is_unavailable_after_retries() {
        // Bind and immediately drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let start = std::time::Instant::now();
        let err = WorkerClient::connect(WorkerEndpoint {
            host: addr.ip().to_string(),
            port: addr.port(),
            secure: false,
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ApiError::Unavailable(_)));
        // Two backoff sleeps: 50 ms + 100 ms.
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
