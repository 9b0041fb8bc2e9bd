/*!
 * BlueZ Controller
 * org.bluez.Adapter1 over the system bus
 */

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dbus::arg::{prop_cast, PropMap};
use dbus::nonblock::stdintf::org_freedesktop_dbus::{ObjectManager, Properties};
use dbus::nonblock::{Proxy, SyncConnection};
use dbus::Path;

use super::adapter::{AdapterState, Controller};
use super::{normalize_address, DeviceInfo, ADAPTER_INTERFACE, BLUEZ_SERVICE, BUS_TIMEOUT, DEVICE_INTERFACE};
use crate::error::AdapterError;

type ManagedObjects = HashMap<Path<'static>, HashMap<String, PropMap>>;

pub struct BluezController {
    conn: Arc<SyncConnection>,
    path: Path<'static>,
}

impl BluezController {
    /// Resolves the default adapter: `hci0` when present, otherwise the first one BlueZ lists.
    pub async fn default_adapter(conn: Arc<SyncConnection>) -> Result<Self, AdapterError> {
        let objects = managed_objects(&conn).await?;
        let path = pick_default_adapter(&objects).ok_or(AdapterError::NotFound)?;
        tracing::info!("Using Bluetooth adapter {}", path);
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path<'static> {
        &self.path
    }

    fn proxy(&self) -> Proxy<'static, Arc<SyncConnection>> {
        Proxy::new(BLUEZ_SERVICE, self.path.clone(), BUS_TIMEOUT, self.conn.clone())
    }

    async fn set_flag(&self, name: &'static str, value: bool) -> Result<(), AdapterError> {
        tracing::debug!("{} {} -> {}", self.path, name, value);
        self.proxy().set(ADAPTER_INTERFACE, name, value).await?;
        Ok(())
    }

    async fn call(&self, method: &'static str) -> Result<(), AdapterError> {
        tracing::debug!("{} {}()", self.path, method);
        self.proxy()
            .method_call::<(), _, _, _>(ADAPTER_INTERFACE, method, ())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Controller for BluezController {
    async fn state(&self) -> Result<AdapterState, AdapterError> {
        let props = self.proxy().get_all(ADAPTER_INTERFACE).await?;
        adapter_state(&props)
    }

    async fn set_alias(&self, alias: &str) -> Result<(), AdapterError> {
        tracing::debug!("{} Alias -> {:?}", self.path, alias);
        self.proxy()
            .set(ADAPTER_INTERFACE, "Alias", alias.to_string())
            .await?;
        Ok(())
    }

    async fn set_powered(&self, on: bool) -> Result<(), AdapterError> {
        self.set_flag("Powered", on).await
    }

    async fn set_pairable(&self, on: bool) -> Result<(), AdapterError> {
        self.set_flag("Pairable", on).await
    }

    async fn set_discoverable(&self, on: bool) -> Result<(), AdapterError> {
        self.set_flag("Discoverable", on).await
    }

    async fn start_discovery(&self) -> Result<(), AdapterError> {
        self.call("StartDiscovery").await
    }

    async fn stop_discovery(&self) -> Result<(), AdapterError> {
        self.call("StopDiscovery").await
    }

    async fn devices(&self) -> Result<Vec<DeviceInfo>, AdapterError> {
        let objects = managed_objects(&self.conn).await?;
        Ok(adapter_devices(&objects, &self.path))
    }

    fn connection(&self) -> Option<Arc<SyncConnection>> {
        Some(self.conn.clone())
    }
}

async fn managed_objects(conn: &Arc<SyncConnection>) -> Result<ManagedObjects, dbus::Error> {
    let proxy = Proxy::new(BLUEZ_SERVICE, "/", BUS_TIMEOUT, conn.clone());
    proxy.get_managed_objects().await
}

fn pick_default_adapter(objects: &ManagedObjects) -> Option<Path<'static>> {
    let mut adapters: Vec<&Path<'static>> = objects
        .iter()
        .filter(|(_, ifaces)| ifaces.contains_key(ADAPTER_INTERFACE))
        .map(|(path, _)| path)
        .collect();
    adapters.sort();

    adapters
        .iter()
        .find(|path| path.ends_with("/hci0"))
        .or_else(|| adapters.first())
        .map(|path| (*path).clone())
}

fn adapter_state(props: &PropMap) -> Result<AdapterState, AdapterError> {
    let flag = |name: &'static str| {
        prop_cast::<bool>(props, name)
            .copied()
            .ok_or(AdapterError::Property(name))
    };

    Ok(AdapterState {
        powered: flag("Powered")?,
        pairable: flag("Pairable")?,
        discoverable: flag("Discoverable")?,
        discovery_active: flag("Discovering")?,
        alias: prop_cast::<String>(props, "Alias")
            .cloned()
            .ok_or(AdapterError::Property("Alias"))?,
    })
}

/// Devices BlueZ currently tracks under `adapter`.
fn adapter_devices(objects: &ManagedObjects, adapter: &str) -> Vec<DeviceInfo> {
    objects
        .iter()
        .filter_map(|(path, ifaces)| {
            let props = ifaces.get(DEVICE_INTERFACE)?;
            let owner = props.get("Adapter").and_then(|v| v.0.as_str())?;
            if owner != adapter {
                return None;
            }
            let device = device_info(props);
            if device.is_none() {
                tracing::debug!("Skipping device {} without a usable address", path);
            }
            device
        })
        .collect()
}

fn device_info(props: &PropMap) -> Option<DeviceInfo> {
    let address = normalize_address(prop_cast::<String>(props, "Address")?)?;
    Some(DeviceInfo {
        address,
        alias: prop_cast::<String>(props, "Alias").cloned().unwrap_or_default(),
        connected: prop_cast::<bool>(props, "Connected").copied().unwrap_or(false),
    })
}
