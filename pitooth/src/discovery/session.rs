/*!
 * Discoverability Session
 * Opens the adapter for pairing, samples peers, restores the adapter
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{PeerSampler, PeerSnapshot};
use crate::bluetooth::AdapterHandle;
use crate::error::{Error, Result};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);

pub struct Discoverability {
    adapter: AdapterHandle,
    running: AtomicBool,
}

impl Discoverability {
    pub fn new(adapter: AdapterHandle) -> Self {
        Self {
            adapter,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs one session. A zero `window` means the 30 second default.
    ///
    /// Overlapping calls fail with `Busy`. Cancelling skips straight to
    /// restoring the adapter; the snapshot gathered so far is returned.
    pub async fn run(&self, window: Duration, cancel: &CancellationToken) -> Result<PeerSnapshot> {
        let _running = RunningGuard::acquire(&self.running).ok_or(Error::Busy)?;

        let window = if window.is_zero() {
            debug!("No pairing window specified, defaulting to {:?}", DEFAULT_WINDOW);
            DEFAULT_WINDOW
        } else {
            window
        };

        self.open().await?;

        info!("Accepting connections for {:?}...", window);
        let sampled = PeerSampler::new(&self.adapter)
            .horizon(window)
            .run(cancel)
            .await;

        self.close().await;

        let snapshot = sampled?;
        info!("Pairing window closed, {} device(s) seen", snapshot.len());
        Ok(snapshot)
    }

    async fn open(&self) -> Result<()> {
        debug!("Powering on...");
        self.adapter.set_powered(true).await?;

        debug!("Setting pairable...");
        self.adapter.set_pairable(true).await?;

        debug!("Setting discoverable...");
        if let Err(e) = self.adapter.set_discoverable(true).await {
            self.restore_pairable().await;
            return Err(e.into());
        }

        debug!("Starting discovery...");
        if let Err(e) = self.adapter.start_discovery().await {
            self.restore_discoverable().await;
            self.restore_pairable().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Best effort; failures are logged and never replace the session result.
    async fn close(&self) {
        debug!("Stopping discovery...");
        if let Err(e) = self.adapter.stop_discovery().await {
            warn!("Failed to stop discovery: {}", e);
        }
        self.restore_discoverable().await;
        self.restore_pairable().await;
    }

    async fn restore_discoverable(&self) {
        debug!("Setting undiscoverable...");
        if let Err(e) = self.adapter.set_discoverable(false).await {
            warn!("Failed to make adapter undiscoverable: {}", e);
        }
    }

    async fn restore_pairable(&self) {
        debug!("Setting unpairable...");
        if let Err(e) = self.adapter.set_pairable(false).await {
            warn!("Failed to make adapter unpairable: {}", e);
        }
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
