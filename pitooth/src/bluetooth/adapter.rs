/*!
 * Adapter Handle
 * Typed, serialized access to the local controller's flags
 */

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dbus::nonblock::SyncConnection;
use serde::Serialize;
use tokio::sync::Mutex;

use super::bluez::BluezController;
use super::DeviceInfo;
use crate::error::AdapterError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdapterState {
    pub powered: bool,
    pub pairable: bool,
    pub discoverable: bool,
    pub discovery_active: bool,
    pub alias: String,
}

/// Raw controller surface. `AdapterHandle` layers locking and invariants on top.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn state(&self) -> Result<AdapterState, AdapterError>;
    async fn set_alias(&self, alias: &str) -> Result<(), AdapterError>;
    async fn set_powered(&self, on: bool) -> Result<(), AdapterError>;
    async fn set_pairable(&self, on: bool) -> Result<(), AdapterError>;
    async fn set_discoverable(&self, on: bool) -> Result<(), AdapterError>;
    async fn start_discovery(&self) -> Result<(), AdapterError>;
    async fn stop_discovery(&self) -> Result<(), AdapterError>;
    async fn devices(&self) -> Result<Vec<DeviceInfo>, AdapterError>;

    /// Bus connection backing this controller, if it has one.
    fn connection(&self) -> Option<Arc<SyncConnection>>;
}

/// Cheaply cloneable handle; every clone shares the same flag lock.
#[derive(Clone)]
pub struct AdapterHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    controller: Arc<dyn Controller>,
    // Held across exactly one controller call, never across a sleep or spawn.
    state: Mutex<AdapterState>,
}

impl AdapterHandle {
    pub async fn open(controller: Arc<dyn Controller>) -> Result<Self, AdapterError> {
        let state = controller.state().await?;
        tracing::debug!(
            "Adapter opened: alias={:?} powered={} pairable={} discoverable={} discovering={}",
            state.alias,
            state.powered,
            state.pairable,
            state.discoverable,
            state.discovery_active
        );
        Ok(Self {
            inner: Arc::new(HandleInner {
                controller,
                state: Mutex::new(state),
            }),
        })
    }

    /// Opens the platform's default adapter over `conn`.
    pub async fn open_default(conn: Arc<SyncConnection>) -> Result<Self, AdapterError> {
        let controller = BluezController::default_adapter(conn).await?;
        Self::open(Arc::new(controller)).await
    }

    pub async fn state(&self) -> AdapterState {
        self.inner.state.lock().await.clone()
    }

    pub fn connection(&self) -> Option<Arc<SyncConnection>> {
        self.inner.controller.connection()
    }

    pub async fn set_alias(&self, alias: &str) -> Result<(), AdapterError> {
        if alias.is_empty() {
            return Err(AdapterError::EmptyAlias);
        }
        let mut state = self.inner.state.lock().await;
        self.inner.controller.set_alias(alias).await?;
        state.alias = alias.to_string();
        Ok(())
    }

    pub async fn set_powered(&self, on: bool) -> Result<(), AdapterError> {
        let mut state = self.inner.state.lock().await;
        self.inner.controller.set_powered(on).await?;
        state.powered = on;
        if !on {
            // the controller drops both when it powers down
            state.discoverable = false;
            state.discovery_active = false;
        }
        Ok(())
    }

    pub async fn set_pairable(&self, on: bool) -> Result<(), AdapterError> {
        let mut state = self.inner.state.lock().await;
        self.inner.controller.set_pairable(on).await?;
        state.pairable = on;
        Ok(())
    }

    pub async fn set_discoverable(&self, on: bool) -> Result<(), AdapterError> {
        let mut state = self.inner.state.lock().await;
        if on && !state.powered {
            return Err(AdapterError::NotPowered);
        }
        self.inner.controller.set_discoverable(on).await?;
        state.discoverable = on;
        Ok(())
    }

    pub async fn start_discovery(&self) -> Result<(), AdapterError> {
        let mut state = self.inner.state.lock().await;
        if !state.powered {
            return Err(AdapterError::NotPowered);
        }
        self.inner.controller.start_discovery().await?;
        state.discovery_active = true;
        Ok(())
    }

    pub async fn stop_discovery(&self) -> Result<(), AdapterError> {
        let mut state = self.inner.state.lock().await;
        self.inner.controller.stop_discovery().await?;
        state.discovery_active = false;
        Ok(())
    }

    pub async fn get_devices(&self) -> Result<Vec<DeviceInfo>, AdapterError> {
        self.inner.controller.devices().await
    }
}

impl fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterHandle").finish_non_exhaustive()
    }
}
