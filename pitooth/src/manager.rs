/*!
 * Bluetooth Manager
 * One facade over host probe, adapter, agent, sessions and OBEX
 */

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dbus::nonblock::SyncConnection;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, Dispatch};

use crate::bluetooth::{AdapterHandle, PairingAgent};
use crate::discovery::{Discoverability, PeerSampler, PeerSnapshot};
use crate::error::{AdapterError, Error, Result};
use crate::host;
use crate::logging;
use crate::obex::ObexSupervisor;

/// Recognized construction options.
#[derive(Default)]
pub struct ManagerOptions {
    logger: Option<Dispatch>,
    adapter: Option<AdapterHandle>,
}

impl ManagerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logger for everything the manager and its agent emit.
    pub fn logger(mut self, logger: Dispatch) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Pre-built adapter handle, used instead of the platform default.
    pub fn adapter(mut self, adapter: AdapterHandle) -> Self {
        self.adapter = Some(adapter);
        self
    }
}

pub struct BluetoothManager {
    adapter: AdapterHandle,
    agent: PairingAgent,
    discoverability: Discoverability,
    obex: ObexSupervisor,
    logger: Dispatch,
}

impl BluetoothManager {
    /// Probes the host, opens the adapter, registers the pairing agent as the
    /// default agent, applies `alias` and powers the adapter on.
    pub async fn new(alias: &str, options: ManagerOptions) -> Result<Self> {
        // We should always set a device alias, or it gets tricky.
        if alias.is_empty() {
            return Err(Error::InvalidArgument(
                "Bluetooth device alias cannot be empty".to_string(),
            ));
        }

        let logger = options.logger.unwrap_or_else(logging::default_logger);
        Self::build(alias, options.adapter, logger.clone())
            .with_subscriber(logger)
            .await
    }

    async fn build(alias: &str, adapter: Option<AdapterHandle>, logger: Dispatch) -> Result<Self> {
        let model = host::check_host()?;
        info!("PiTooth starting on {}", model);

        let (adapter, conn) = match adapter {
            Some(adapter) => {
                let conn = match adapter.connection() {
                    Some(conn) => conn,
                    None => system_bus(&logger).map_err(|e| {
                        Error::AgentRegistration(format!("failed to connect to system bus: {}", e))
                    })?,
                };
                (adapter, conn)
            }
            None => {
                let conn = system_bus(&logger).map_err(AdapterError::from)?;
                let adapter = AdapterHandle::open_default(conn.clone()).await?;
                (adapter, conn)
            }
        };

        let agent = PairingAgent::register(conn, logger.clone()).await?;

        adapter.set_alias(alias).await?;
        adapter.set_powered(true).await?;
        info!("Adapter ready as {:?}", alias);

        Ok(Self::from_parts(adapter, agent, ObexSupervisor::new(), logger))
    }

    fn from_parts(
        adapter: AdapterHandle,
        agent: PairingAgent,
        obex: ObexSupervisor,
        logger: Dispatch,
    ) -> Self {
        Self {
            discoverability: Discoverability::new(adapter.clone()),
            adapter,
            agent,
            obex,
            logger,
        }
    }

    /// Powers on and opens the adapter for pairing. Errors are logged, not returned.
    pub async fn start(&self) {
        async {
            if let Err(e) = self.adapter.set_powered(true).await {
                error!("Failed to power on adapter: {}", e);
            }
            if let Err(e) = self.adapter.set_pairable(true).await {
                error!("Failed to make adapter pairable: {}", e);
            }
            if let Err(e) = self.adapter.set_discoverable(true).await {
                error!("Failed to make adapter discoverable: {}", e);
            }
        }
        .with_subscriber(self.logger.clone())
        .await
    }

    /// Stops discovery and turns every adapter flag off. Errors are logged, not returned.
    /// The pairing agent stays registered; see [`release_agent`](Self::release_agent).
    pub async fn stop(&self) {
        async {
            if self.adapter.state().await.discovery_active {
                if let Err(e) = self.adapter.stop_discovery().await {
                    error!("Failed to stop discovery: {}", e);
                }
            }
            if let Err(e) = self.adapter.set_discoverable(false).await {
                error!("Failed to make adapter undiscoverable: {}", e);
            }
            if let Err(e) = self.adapter.set_pairable(false).await {
                error!("Failed to make adapter unpairable: {}", e);
            }
            if let Err(e) = self.adapter.set_powered(false).await {
                error!("Failed to power off adapter: {}", e);
            }
            debug!("Adapter stopped");
        }
        .with_subscriber(self.logger.clone())
        .await
    }

    /// Opens the adapter for `window` (zero means 30 s) and returns the peers seen.
    pub async fn accept_connections(&self, window: Duration) -> Result<PeerSnapshot> {
        self.accept_connections_until(window, &CancellationToken::new())
            .await
    }

    /// Like [`accept_connections`](Self::accept_connections), ending early when `cancel` fires.
    pub async fn accept_connections_until(
        &self,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<PeerSnapshot> {
        async {
            debug!("Starting pairing...");
            let snapshot = self.discoverability.run(window, cancel).await?;
            for peer in &snapshot {
                debug!("Found device: {} : {} (connected: {})", peer.name, peer.address, peer.connected);
            }
            Ok(snapshot)
        }
        .with_subscriber(self.logger.clone())
        .await
    }

    /// Samples the adapter's devices once a second for five seconds.
    pub async fn get_nearby_devices(&self) -> Result<PeerSnapshot> {
        async {
            debug!("Collecting nearby devices...");
            let snapshot = PeerSampler::new(&self.adapter)
                .run(&CancellationToken::new())
                .await?;
            debug!("{} nearby device(s)", snapshot.len());
            for peer in &snapshot {
                debug!(
                    "Nearby device: {} : {} : {} : {}",
                    peer.name, peer.address, peer.last_seen, peer.connected
                );
            }
            Ok(snapshot)
        }
        .with_subscriber(self.logger.clone())
        .await
    }

    /// Starts the OBEX daemon receiving into `receive_dir`, or stops it.
    pub async fn control_obex_server(&self, start: bool, receive_dir: impl AsRef<Path>) -> Result<()> {
        let receive_dir = receive_dir.as_ref();
        if start && receive_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(
                "OBEX receive directory is required to start the server".to_string(),
            ));
        }
        self.obex
            .control(start, receive_dir)
            .with_subscriber(self.logger.clone())
            .await
    }

    pub fn adapter(&self) -> &AdapterHandle {
        &self.adapter
    }

    pub fn agent(&self) -> &PairingAgent {
        &self.agent
    }

    pub fn obex(&self) -> &ObexSupervisor {
        &self.obex
    }

    pub fn set_preset_pin_code(&self, code: impl Into<String>) {
        self.agent.set_preset_pin_code(code);
    }

    pub fn set_preset_passkey(&self, passkey: u32) {
        self.agent.set_preset_passkey(passkey);
    }

    /// Unregisters the pairing agent. It cannot be registered again in this process.
    pub async fn release_agent(&self) -> Result<()> {
        self.agent
            .unregister()
            .with_subscriber(self.logger.clone())
            .await
    }
}

fn system_bus(logger: &Dispatch) -> std::result::Result<Arc<SyncConnection>, dbus::Error> {
    let (resource, conn) = dbus_tokio::connection::new_system_sync()?;

    // The resource drives the connection; if it ever finishes the bus is gone.
    tokio::spawn(
        async move {
            let err = resource.await;
            error!("Lost connection to the system bus: {}", err);
        }
        .with_subscriber(logger.clone()),
    );
    Ok(conn)
}
