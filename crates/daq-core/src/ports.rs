//! Shared endpoint registry.
//!
//! An ASI controller carries the XY stage, Z drive, autofocus, turret and LED on one
//! serial line. Every driver asks this registry for the endpoint of its port so that
//! all of them share one [`SerialEndpoint`] and therefore one exchange lock.

use crate::transport::SerialEndpoint;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Module-local registry for shared endpoints.
static SHARED_ENDPOINTS: OnceLock<RwLock<HashMap<String, SerialEndpoint>>> = OnceLock::new();

fn endpoint_registry() -> &'static RwLock<HashMap<String, SerialEndpoint>> {
    SHARED_ENDPOINTS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Get an existing endpoint if one is already open for the given path.
pub fn get_existing_endpoint(port_path: &str) -> Option<SerialEndpoint> {
    let registry = endpoint_registry().read();
    registry.get(port_path).cloned()
}

/// Register an endpoint under `port_path`, replacing any previous one.
pub fn register_endpoint(port_path: &str, endpoint: SerialEndpoint) {
    let mut registry = endpoint_registry().write();
    registry.insert(port_path.to_string(), endpoint);
    tracing::info!(port = port_path, "Registered shared serial endpoint");
}

/// Remove an endpoint from the registry.
pub fn remove_endpoint(port_path: &str) -> bool {
    let mut registry = endpoint_registry().write();
    let removed = registry.remove(port_path).is_some();
    if removed {
        tracing::info!(port = port_path, "Removed shared serial endpoint");
    }
    removed
}

/// Get or open the endpoint for `port_path`.
///
/// A new port is opened 8N1 without flow control at `baud_rate`. An already registered
/// endpoint is returned as is, whatever baud rate it currently runs at.
#[cfg(feature = "serial")]
pub async fn get_or_open_endpoint(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<SerialEndpoint> {
    use crate::transport::{open_serial_async, SerialTransport};
    use std::sync::Arc;

    if let Some(endpoint) = get_existing_endpoint(port_path) {
        tracing::debug!(port = port_path, "Reusing shared serial endpoint");
        return Ok(endpoint);
    }

    let stream = open_serial_async(port_path, baud_rate, device_name).await?;
    let endpoint = SerialEndpoint::new(Arc::new(SerialTransport::new(port_path, stream, baud_rate)));

    // Another task may have opened the same port while we were blocked.
    let mut registry = endpoint_registry().write();
    let endpoint = registry
        .entry(port_path.to_string())
        .or_insert(endpoint)
        .clone();
    tracing::info!(port = port_path, baud_rate, device = device_name, "Opened serial endpoint");
    Ok(endpoint)
}

/// Close all shared endpoints (for cleanup/testing).
pub fn close_all_endpoints() {
    if let Some(registry) = SHARED_ENDPOINTS.get() {
        let mut guard = registry.write();
        let count = guard.len();
        guard.clear();
        tracing::info!(count, "Closed all shared serial endpoints");
    }
}

/// Get the number of currently registered endpoints.
pub fn endpoint_count() -> usize {
    SHARED_ENDPOINTS.get().map(|r| r.read().len()).unwrap_or(0)
}
