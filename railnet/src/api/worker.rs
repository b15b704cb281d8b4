//! Local worker records and device discovery.

use serde::{Deserialize, Serialize};

use super::address::ObjectAddress;

/// Configuration of a hardware device attached to a local worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceConfig {
    /// Device ID, unique within the worker.
    pub id: String,
    /// Device type, e.g. `mcp23017`, `pca9685`.
    #[serde(rename = "type", default)]
    pub device_type: String,
    /// Bus address of the device, e.g. `0x20`.
    #[serde(default)]
    pub address: String,
}

/// Configuration of a controllable object wired to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ObjectConfig {
    pub address: ObjectAddress,
    /// Object type, e.g. `binary-sensor`, `servo-switch`.
    #[serde(rename = "type", default)]
    pub object_type: String,
    /// Device pin assignments, in wiring order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pins: Vec<String>,
}

/// The desired (requested) state of a local worker: its configuration.
///
/// `hash` is computed by the manager, never by producers: a random per
/// process prefix concatenated with the SHA-1 of the rest of the record.
/// Workers compare hashes to decide whether they must reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LocalWorkerConfig {
    #[serde(default)]
    pub hash: String,
    /// Human readable name for the worker.
    #[serde(default)]
    pub alias: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ObjectConfig>,
    /// Stamped by the pool on outgoing request deliveries.
    #[serde(default)]
    pub unixtime: i64,
}

/// The observed (actual) state of a local worker, as reported by the
/// worker itself through pings and actual updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LocalWorkerInfo {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    /// Uptime in seconds.
    #[serde(default)]
    pub uptime: i64,
    /// Port of the worker's own control service; 0 when not served.
    #[serde(default)]
    pub local_worker_service_port: u16,
    #[serde(default)]
    pub local_worker_service_secure: bool,
    #[serde(default)]
    pub supports_set_power_request: bool,
    #[serde(default)]
    pub supports_set_loc_request: bool,
    #[serde(default)]
    pub supports_set_output_request: bool,
    #[serde(default)]
    pub supports_set_switch_request: bool,
    #[serde(default)]
    pub supports_set_device_discovery_request: bool,
    #[serde(default)]
    pub supports_reset: bool,
}

/// A local worker with desired and observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LocalWorker {
    pub id: String,
    pub request: Option<LocalWorkerConfig>,
    pub actual: Option<LocalWorkerInfo>,
}

impl LocalWorker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            request: None,
            actual: None,
        }
    }

    pub fn with_request(mut self, request: LocalWorkerConfig) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_actual(mut self, actual: LocalWorkerInfo) -> Self {
        self.actual = Some(actual);
        self
    }
}

/// A device discovery request, correlated by a random 32-bit ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiscoverRequest {
    pub request_id: i32,
}

/// The result of a device discovery, reported by the local worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DiscoverResult {
    /// ID of the worker that performed the discovery.
    pub id: String,
    /// Bus addresses of the devices that were found.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
}

/// A device discovery exchange for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceDiscovery {
    pub id: String,
    pub request: Option<DiscoverRequest>,
    pub actual: Option<DiscoverResult>,
}

impl DeviceDiscovery {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            request: None,
            actual: None,
        }
    }
}
