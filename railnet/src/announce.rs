//! Service announcements.
//!
//! At startup the manager registers its three service surfaces on a UDP
//! beacon so local workers can find it without pre-configured endpoints.
//! The beacon is a periodic broadcast of the service records; anything
//! beyond the record shape (port, security flag) is a transport detail
//! the workers' discovery listeners own.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::api::ApiError;

/// Interval between announcement broadcasts.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);

/// Default UDP port workers listen on for announcements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8824;

/// The three service surfaces the manager serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    LocalWorkerConfig,
    LocalWorkerControl,
    NetworkControl,
}

/// One announced service entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service: ServiceKind,
    pub port: u16,
    pub secure: bool,
}

/// Periodically broadcasts the manager's service records.
pub struct ServiceAnnouncer {
    records: Vec<ServiceRecord>,
    target: SocketAddr,
}

impl ServiceAnnouncer {
    /// Announces all three services at `api_port` on the given discovery
    /// port.
    pub fn new(api_port: u16, secure: bool, discovery_port: u16) -> Self {
        let records = [
            ServiceKind::LocalWorkerConfig,
            ServiceKind::LocalWorkerControl,
            ServiceKind::NetworkControl,
        ]
        .into_iter()
        .map(|service| ServiceRecord {
            service,
            port: api_port,
            secure,
        })
        .collect();

        Self {
            records,
            target: SocketAddr::from((Ipv4Addr::BROADCAST, discovery_port)),
        }
    }

    /// Overrides the broadcast target. Used by tests and setups with a
    /// known worker subnet.
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }

    /// Broadcasts until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<(), ApiError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        let payload =
            serde_json::to_vec(&self.records).map_err(|e| ApiError::Decode(e.to_string()))?;

        tracing::info!(target = %self.target, services = self.records.len(), "announcing services");
        loop {
            if let Err(err) = socket.send_to(&payload, self.target).await {
                tracing::debug!(error = %err, "service announcement failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {}
                _ = token.cancelled() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_cover_all_services() {
        let announcer = ServiceAnnouncer::new(8823, true, DEFAULT_DISCOVERY_PORT);
        assert_eq!(announcer.records.len(), 3);
        assert!(announcer.records.iter().all(|r| r.port == 8823 && r.secure));
    }

    #[test]
    fn test_record_serialization() {
        let record = ServiceRecord {
            service: ServiceKind::NetworkControl,
            port: 8823,
            secure: false,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["service"], "network_control");
        assert_eq!(json["port"], 8823);
    }

    #[tokio::test]
    async fn test_announcer_broadcasts_records() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let announcer = ServiceAnnouncer::new(8823, false, 0).with_target(target);
        let token = CancellationToken::new();
        let run_token = token.clone();
        let task = tokio::spawn(async move { announcer.run(run_token).await });

        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .expect("no announcement received")
            .unwrap();

        let records: Vec<ServiceRecord> = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].port, 8823);

        token.cancel();
        task.await.unwrap().unwrap();
    }
}
