//! Process-wide exclusive claim on a physical port.

use std::collections::HashSet;
use std::sync::{LazyLock, Mutex};

use tracing::debug;

use super::traits::PortError;

static CLAIMED_PORTS: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Held for the lifetime of a `Connection`; released on drop.
#[derive(Debug)]
pub struct PortLock {
    name: String,
}

impl PortLock {
    /// Claim `name`, failing if another live connection holds it.
    pub fn acquire(name: &str) -> Result<Self, PortError> {
        let mut claimed = CLAIMED_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        if !claimed.insert(name.to_string()) {
            return Err(PortError::Busy {
                port: name.to_string(),
            });
        }
        debug!(port = %name, "Port claimed");
        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PortLock {
    fn drop(&mut self) {
        let mut claimed = CLAIMED_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        claimed.remove(&self.name);
        debug!(port = %self.name, "Port released");
    }
}
