//! RailNet - coordination core of a model-railway control network.
//!
//! A single central manager mediates between local workers (embedded
//! nodes driving tracks, switches, outputs, sensors and locomotives) and
//! network controllers (operator-facing clients). For each controllable
//! entity two logical copies of state exist, the *requested* and the
//! *actual* value, and the manager routes changes between producers and
//! subscribers with bounded latency and latest-value-wins snapshots.
//!
//! # Architecture
//!
//! - [`api`]: the entity model (addresses, dual-state records, errors).
//! - [`manager`]: the typed state pools with pub/sub fan-out and the
//!   manager facade, including the reconfigure pipeline.
//! - [`registry`]: the file-backed worker configuration registry.
//! - [`wire`] / [`server`]: the streaming control protocol and the three
//!   service surfaces exposed over it.
//! - [`client`]: the dial-out bridge to a worker's own service.
//! - [`control_client`]: the typed client for network controllers.
//! - [`announce`]: the UDP service announcement beacon.
//! - [`metrics`] / [`logging`]: observability plumbing.

pub mod announce;
pub mod api;
pub mod client;
pub mod control_client;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod wire;

/// Version of the RailNet library and CLI.
///
/// This is synchronized across all components in the workspace.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
