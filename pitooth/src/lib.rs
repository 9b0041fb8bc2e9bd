/*!
 * PiTooth
 * Headless Bluetooth session manager for Raspberry Pi class hosts
 */

pub mod bluetooth;
pub mod discovery;
pub mod error;
pub mod host;
pub mod logging;
pub mod manager;
pub mod obex;

pub use bluetooth::{AdapterHandle, AdapterState, AgentState, PairingAgent};
pub use discovery::{Peer, PeerSnapshot};
pub use error::{AdapterError, Error, Result};
pub use manager::{BluetoothManager, ManagerOptions};
pub use obex::{ObexState, ObexSupervisor};
