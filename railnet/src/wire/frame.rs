//! Frame and operation vocabulary.

use serde::{Deserialize, Serialize};

use crate::api::{
    ApiError, Clock, DeviceDiscovery, DiscoverResult, Loc, LocalWorker, LocalWorkerConfig,
    LocalWorkerInfo, Output, Power, PowerState, RequestsOptions, Sensor, Switch, WatchOptions,
};

/// A logical operation, carried by [`ClientFrame::Request`].
///
/// `Get*`/`Watch*` operations open a server stream, `Set*Actuals`
/// operations open a client stream, everything else is unary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum Request {
    // --- local worker config service ---
    GetConfig(LocalWorkerInfo),

    // --- local worker control service ---
    Ping(LocalWorkerInfo),
    GetDiscoverRequests(LocalWorkerInfo),
    SetDiscoverResult(DiscoverResult),
    GetPowerRequests(RequestsOptions),
    GetLocRequests(RequestsOptions),
    GetOutputRequests(RequestsOptions),
    GetSwitchRequests(RequestsOptions),
    SetPowerActuals,
    SetLocActuals,
    SetSensorActuals,
    SetOutputActuals,
    SetSwitchActuals,
    GetClock,

    // --- network control service ---
    SetLocalWorkerRequest(LocalWorker),
    SetLocalWorkerActual(LocalWorker),
    SetPowerRequest(PowerState),
    SetPowerActual(PowerState),
    SetLocRequest(Loc),
    SetLocActual(Loc),
    SetSensorActual(Sensor),
    SetOutputRequest(Output),
    SetOutputActual(Output),
    SetSwitchRequest(Switch),
    SetSwitchActual(Switch),
    SetDeviceDiscoveryRequest(DeviceDiscovery),
    SetDeviceDiscoveryActual(DeviceDiscovery),
    SetClockActual(Clock),
    RequestReset(LocalWorkerInfo),
    WatchLocalWorkers(WatchOptions),
    WatchDeviceDiscoveries(WatchOptions),
    WatchPower(WatchOptions),
    WatchLocs(WatchOptions),
    WatchSensors(WatchOptions),
    WatchOutputs(WatchOptions),
    WatchSwitches(WatchOptions),
    WatchClock(WatchOptions),

    // --- worker-side service, dialed by the manager ---
    Reset,
}

impl Request {
    /// Operation name for logging.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::GetConfig(_) => "get_config",
            Self::Ping(_) => "ping",
            Self::GetDiscoverRequests(_) => "get_discover_requests",
            Self::SetDiscoverResult(_) => "set_discover_result",
            Self::GetPowerRequests(_) => "get_power_requests",
            Self::GetLocRequests(_) => "get_loc_requests",
            Self::GetOutputRequests(_) => "get_output_requests",
            Self::GetSwitchRequests(_) => "get_switch_requests",
            Self::SetPowerActuals => "set_power_actuals",
            Self::SetLocActuals => "set_loc_actuals",
            Self::SetSensorActuals => "set_sensor_actuals",
            Self::SetOutputActuals => "set_output_actuals",
            Self::SetSwitchActuals => "set_switch_actuals",
            Self::GetClock => "get_clock",
            Self::SetLocalWorkerRequest(_) => "set_local_worker_request",
            Self::SetLocalWorkerActual(_) => "set_local_worker_actual",
            Self::SetPowerRequest(_) => "set_power_request",
            Self::SetPowerActual(_) => "set_power_actual",
            Self::SetLocRequest(_) => "set_loc_request",
            Self::SetLocActual(_) => "set_loc_actual",
            Self::SetSensorActual(_) => "set_sensor_actual",
            Self::SetOutputRequest(_) => "set_output_request",
            Self::SetOutputActual(_) => "set_output_actual",
            Self::SetSwitchRequest(_) => "set_switch_request",
            Self::SetSwitchActual(_) => "set_switch_actual",
            Self::SetDeviceDiscoveryRequest(_) => "set_device_discovery_request",
            Self::SetDeviceDiscoveryActual(_) => "set_device_discovery_actual",
            Self::SetClockActual(_) => "set_clock_actual",
            Self::RequestReset(_) => "request_reset",
            Self::WatchLocalWorkers(_) => "watch_local_workers",
            Self::WatchDeviceDiscoveries(_) => "watch_device_discoveries",
            Self::WatchPower(_) => "watch_power",
            Self::WatchLocs(_) => "watch_locs",
            Self::WatchSensors(_) => "watch_sensors",
            Self::WatchOutputs(_) => "watch_outputs",
            Self::WatchSwitches(_) => "watch_switches",
            Self::WatchClock(_) => "watch_clock",
            Self::Reset => "reset",
        }
    }

    /// True for operations that open a client stream of actuals.
    pub fn is_client_stream(&self) -> bool {
        matches!(
            self,
            Self::SetPowerActuals
                | Self::SetLocActuals
                | Self::SetSensorActuals
                | Self::SetOutputActuals
                | Self::SetSwitchActuals
        )
    }
}

/// A value travelling on a stream, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StreamItem {
    Power(Power),
    PowerState(PowerState),
    Loc(Loc),
    Output(Output),
    Switch(Switch),
    Sensor(Sensor),
    Clock(Clock),
    LocalWorker(LocalWorker),
    LocalWorkerConfig(LocalWorkerConfig),
    DeviceDiscovery(DeviceDiscovery),
}

/// Serializable error, mirroring [`ApiError`] kinds across the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

impl WireError {
    pub fn from_api(err: &ApiError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn into_api(self) -> ApiError {
        match self.kind.as_str() {
            "invalid_argument" => ApiError::InvalidArgument(self.message),
            "not_found" => ApiError::NotFound(self.message),
            "timeout" => ApiError::Timeout(self.message),
            "stream_closed" => ApiError::StreamClosed,
            "decode" => ApiError::Decode(self.message),
            _ => ApiError::Unavailable(self.message),
        }
    }
}

/// Frames sent by clients (network controllers and local workers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Opens an operation under a client-chosen correlation ID.
    Request { id: u64, body: Request },
    /// One element of a client stream opened under `id`.
    StreamItem { id: u64, item: StreamItem },
    /// Clean end of a client stream.
    StreamEnd { id: u64 },
    /// Cancels a server stream.
    Cancel { id: u64 },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Completion of a unary operation or of a client stream.
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    /// One element of a server stream.
    StreamItem { id: u64, item: StreamItem },
    /// End of a server stream; `error` is absent on clean termination.
    StreamEnd {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_tagging() {
        let req = Request::SetPowerRequest(PowerState { enabled: true });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["op"], "set_power_request");
        assert_eq!(json["arg"]["enabled"], true);
    }

    #[test]
    fn test_unit_variant_roundtrip() {
        let req = Request::Reset;
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Request::Reset);
    }

    #[test]
    fn test_client_stream_classification() {
        assert!(Request::SetLocActuals.is_client_stream());
        assert!(!Request::WatchLocs(WatchOptions::all()).is_client_stream());
        assert!(!Request::Ping(LocalWorkerInfo::default()).is_client_stream());
    }

    #[test]
    fn test_wire_error_mapping() {
        let api = ApiError::NotFound("w1".to_string());
        let wire = WireError::from_api(&api);
        assert_eq!(wire.kind, "not_found");
        assert!(matches!(wire.into_api(), ApiError::NotFound(_)));
    }

    #[test]
    fn test_server_frame_skips_empty_error() {
        let frame = ServerFrame::Response { id: 1, error: None };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("error"));
    }
}
