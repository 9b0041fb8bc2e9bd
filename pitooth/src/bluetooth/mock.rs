//! Scripted in-memory controller for tests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dbus::nonblock::SyncConnection;

use super::adapter::{AdapterState, Controller};
use super::DeviceInfo;
use crate::error::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Alias,
    Powered,
    Pairable,
    Discoverable,
    StartDiscovery,
    StopDiscovery,
    Devices,
}

#[derive(Default)]
pub struct MockController {
    state: Mutex<AdapterState>,
    failing: Mutex<HashSet<Op>>,
    scans: Mutex<VecDeque<Vec<DeviceInfo>>>,
    last_scan: Mutex<Vec<DeviceInfo>>,
    calls: Mutex<Vec<String>>,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, state: AdapterState) {
        *self.state.lock().unwrap() = state;
    }

    /// What the "hardware" currently reports, regardless of the handle's cache.
    pub fn current(&self) -> AdapterState {
        self.state.lock().unwrap().clone()
    }

    pub fn fail(&self, op: Op) {
        self.failing.lock().unwrap().insert(op);
    }

    /// Successive `devices()` calls return these lists in order; the last one repeats.
    pub fn script_devices(&self, scans: Vec<Vec<DeviceInfo>>) {
        *self.scans.lock().unwrap() = scans.into();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    fn record(&self, op: Op, call: String) -> Result<(), AdapterError> {
        self.calls.lock().unwrap().push(call.clone());
        if self.failing.lock().unwrap().contains(&op) {
            return Err(AdapterError::Backend(format!("injected failure: {}", call)));
        }
        Ok(())
    }
}

pub fn device(address: &str, alias: &str, connected: bool) -> DeviceInfo {
    DeviceInfo {
        address: address.to_string(),
        alias: alias.to_string(),
        connected,
    }
}

pub fn shared() -> Arc<MockController> {
    Arc::new(MockController::new())
}

#[async_trait]
impl Controller for MockController {
    async fn state(&self) -> Result<AdapterState, AdapterError> {
        Ok(self.current())
    }

    async fn set_alias(&self, alias: &str) -> Result<(), AdapterError> {
        self.record(Op::Alias, format!("alias={}", alias))?;
        self.state.lock().unwrap().alias = alias.to_string();
        Ok(())
    }

    async fn set_powered(&self, on: bool) -> Result<(), AdapterError> {
        self.record(Op::Powered, format!("powered={}", on))?;
        let mut state = self.state.lock().unwrap();
        state.powered = on;
        if !on {
            state.discoverable = false;
            state.discovery_active = false;
        }
        Ok(())
    }

    async fn set_pairable(&self, on: bool) -> Result<(), AdapterError> {
        self.record(Op::Pairable, format!("pairable={}", on))?;
        self.state.lock().unwrap().pairable = on;
        Ok(())
    }

    async fn set_discoverable(&self, on: bool) -> Result<(), AdapterError> {
        self.record(Op::Discoverable, format!("discoverable={}", on))?;
        self.state.lock().unwrap().discoverable = on;
        Ok(())
    }

    async fn start_discovery(&self) -> Result<(), AdapterError> {
        self.record(Op::StartDiscovery, "start_discovery".to_string())?;
        self.state.lock().unwrap().discovery_active = true;
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), AdapterError> {
        self.record(Op::StopDiscovery, "stop_discovery".to_string())?;
        self.state.lock().unwrap().discovery_active = false;
        Ok(())
    }

    async fn devices(&self) -> Result<Vec<DeviceInfo>, AdapterError> {
        self.record(Op::Devices, "devices".to_string())?;
        let mut last = self.last_scan.lock().unwrap();
        if let Some(next) = self.scans.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }

    fn connection(&self) -> Option<Arc<SyncConnection>> {
        None
    }
}
