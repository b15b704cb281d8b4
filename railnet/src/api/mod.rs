//! Entity model shared by the pools, the wire protocol and clients.
//!
//! Every controllable thing on the layout is identified by an
//! [`ObjectAddress`] and carries two independent sides of state: the
//! *request* (desired, authored by network controllers) and the *actual*
//! (observed, reported by local workers). The types here are plain data;
//! all behavior lives in the pools.

mod address;
mod entities;
mod error;
mod options;
mod worker;

pub use address::{join_module_local, ObjectAddress, GLOBAL_MODULE_ID};
pub use entities::{
    Clock, Loc, LocDirection, LocState, Output, OutputState, Power, PowerState, Sensor,
    SensorState, Switch, SwitchDirection, SwitchState,
};
pub use error::ApiError;
pub use options::{RequestsOptions, WatchOptions};
pub use worker::{
    DeviceConfig, DeviceDiscovery, DiscoverRequest, DiscoverResult, LocalWorker, LocalWorkerConfig,
    LocalWorkerInfo, ObjectConfig,
};

/// Seconds since the Unix epoch, used to stamp outgoing emissions.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
