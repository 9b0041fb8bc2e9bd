/*!
 * Peer Sampler
 * Polls the adapter's device table on a fixed cadence
 */

use std::time::Duration;

use chrono::Utc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::PeerSnapshot;
use crate::bluetooth::AdapterHandle;
use crate::error::{Error, Result};

pub const DEFAULT_HORIZON: Duration = Duration::from_secs(5);
pub const TICK: Duration = Duration::from_secs(1);

// Stand-in deadline for horizons too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// One finite sampling run. Build a new sampler for every run.
pub struct PeerSampler<'a> {
    adapter: &'a AdapterHandle,
    horizon: Duration,
    tick: Duration,
}

impl<'a> PeerSampler<'a> {
    pub fn new(adapter: &'a AdapterHandle) -> Self {
        Self {
            adapter,
            horizon: DEFAULT_HORIZON,
            tick: TICK,
        }
    }

    pub fn horizon(mut self, horizon: Duration) -> Self {
        self.horizon = horizon;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Samples until the horizon passes or `cancel` fires, then returns the snapshot.
    pub async fn run(self, cancel: &CancellationToken) -> Result<PeerSnapshot> {
        let now = Instant::now();
        let deadline = now
            .checked_add(self.horizon)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut snapshot = PeerSnapshot::new();
        let mut ticks = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Sampling cancelled after {} tick(s)", ticks);
                    break;
                }
                _ = time::sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    ticks += 1;
                    let devices = self.adapter.get_devices().await.map_err(Error::Sample)?;
                    let now = Utc::now();
                    for device in &devices {
                        debug!("Discovered device: {} : {} (connected: {})", device.alias, device.address, device.connected);
                        snapshot.upsert(device, now);
                    }
                }
            }
        }

        debug!("Sampled {} device(s) over {} tick(s)", snapshot.len(), ticks);
        Ok(snapshot)
    }
}
