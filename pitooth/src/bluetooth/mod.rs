/*!
 * Bluetooth Controller Access
 * Adapter control and the pairing agent via BlueZ D-Bus
 */

pub mod adapter;
pub mod agent;
pub mod bluez;

#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

pub use adapter::{AdapterHandle, AdapterState, Controller};
pub use agent::{AgentState, PairingAgent, Prompt};
pub use bluez::BluezController;

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const BLUEZ_ROOT_PATH: &str = "/org/bluez";
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const AGENT_INTERFACE: &str = "org.bluez.Agent1";
pub const AGENT_MANAGER_INTERFACE: &str = "org.bluez.AgentManager1";

/// libdbus' default reply timeout; we add no timeouts of our own.
pub const BUS_TIMEOUT: Duration = Duration::from_secs(25);

/// A device as the controller reports it at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: String,
    pub alias: String,
    pub connected: bool,
}

/// Canonical form of a MAC address: upper-case hex pairs separated by colons.
pub fn normalize_address(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.trim().split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 {
        return None;
    }
    if !parts
        .iter()
        .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(parts.join(":").to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_mac_addresses() {
        assert_eq!(
            normalize_address("aa:bb:cc:dd:ee:0f").as_deref(),
            Some("AA:BB:CC:DD:EE:0F")
        );
        assert_eq!(
            normalize_address("AA-BB-CC-DD-EE-FF").as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert_eq!(normalize_address(""), None);
        assert_eq!(normalize_address("AA:BB:CC:DD:EE"), None);
        assert_eq!(normalize_address("AA:BB:CC:DD:EE:GG"), None);
        assert_eq!(normalize_address("AAA:BB:CC:DD:EE:FF"), None);
    }
}
