use std::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{
    default_scan_services, CONNECT_DEADLINE, DIAGNOSTICS_CAPACITY, DISCOVERY_DEADLINE, EXPIRY_POLL_DELAY,
};
use crate::device::decoder::PayloadFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteAction {
    Subscribe,
    ReadOnce,
}

/// Extra router entry. Either `characteristic` or `service` must be set; a service entry
/// applies to every characteristic of that service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomRoute {
    #[serde(default)]
    pub characteristic: Option<Uuid>,
    #[serde(default)]
    pub service: Option<Uuid>,
    pub action: RouteAction,
    pub format: PayloadFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Service filter for scanning and for the connected-peripheral query
    pub scan_services: Vec<Uuid>,
    pub connect_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    pub expiry_poll_ms: u64,
    pub diagnostics_capacity: usize,
    pub custom_routes: Vec<CustomRoute>,
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn expiry_poll(&self) -> Duration {
        // a zero period would make tokio's interval panic
        Duration::from_millis(self.expiry_poll_ms.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scan_services: default_scan_services(),
            connect_timeout_ms: CONNECT_DEADLINE,
            discovery_timeout_ms: DISCOVERY_DEADLINE,
            expiry_poll_ms: EXPIRY_POLL_DELAY,
            diagnostics_capacity: DIAGNOSTICS_CAPACITY,
            custom_routes: Vec::new(),
        }
    }
}
