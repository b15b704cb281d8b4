//! Options carried by watch and request-stream operations.

use serde::{Deserialize, Serialize};

/// Options for the `Watch*` operations of the network control service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WatchOptions {
    /// Mirror the request channel onto the stream.
    #[serde(default)]
    pub watch_request_changes: bool,
    /// Mirror the actual channel onto the stream.
    #[serde(default)]
    pub watch_actual_changes: bool,
    /// Module filter; empty watches everything.
    #[serde(default)]
    pub module_id: String,
}

impl WatchOptions {
    /// Watch both channels without filtering.
    pub fn all() -> Self {
        Self {
            watch_request_changes: true,
            watch_actual_changes: true,
            module_id: String::new(),
        }
    }
}

/// Options for the `Get*Requests` operations of the local worker control
/// service.
///
/// With `manual_confirm` unset the service synthesises a matching actual
/// right after forwarding each request, for fire-and-forget entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestsOptions {
    #[serde(default)]
    pub manual_confirm: bool,
    /// Module filter; empty receives everything.
    #[serde(default)]
    pub module_id: String,
}
