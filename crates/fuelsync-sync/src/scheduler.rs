//! Background loop: an initial reference + full run, then three independent
//! interval timers until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fuelsync_adapters::PriceFeed;
use fuelsync_core::SyncMode;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::{SyncService, REFERENCE_SYNC_INTERVAL};

impl SyncService {
    /// Spawns the scheduler. Returns `None` (and logs why) when the job is
    /// disabled or has no upstream client; the loop exits once `shutdown`
    /// resolves.
    pub fn start<F>(self: Arc<Self>, shutdown: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.config.enabled {
            info!("service nsw sync disabled (set SERVICE_NSW_SYNC_ENABLED=true to enable)");
            return None;
        }
        let Some(feed) = self.feed.clone() else {
            warn!("service nsw sync disabled: missing SERVICE_NSW_API_KEY or SERVICE_NSW_API_SECRET");
            return None;
        };

        info!(
            states = %self.config.states,
            incremental_secs = self.config.incremental_interval.as_secs(),
            full_secs = self.config.full_sync_interval.as_secs(),
            "service nsw sync scheduler starting"
        );
        Some(tokio::spawn(self.run_scheduler(feed, shutdown)))
    }

    async fn run_scheduler<F>(self: Arc<Self>, feed: Arc<dyn PriceFeed>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if !self.initial_run(feed.as_ref()).await {
            return;
        }

        let mut incremental = ticker(self.config.incremental_interval);
        let mut full = ticker(self.config.full_sync_interval);
        let mut reference = ticker(REFERENCE_SYNC_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("service nsw sync scheduler stopped");
                    return;
                }
                _ = incremental.tick() => self.scheduled_run(SyncMode::Incremental, feed.as_ref()).await,
                _ = full.tick() => self.scheduled_run(SyncMode::Full, feed.as_ref()).await,
                _ = reference.tick() => self.scheduled_run(SyncMode::Reference, feed.as_ref()).await,
            }
        }
    }

    /// Reference then full, under one hold of the run lock. `false` means the
    /// system user could not be ensured and the scheduler gives up.
    async fn initial_run(&self, feed: &dyn PriceFeed) -> bool {
        let _guard = self.run_lock.lock().await;
        if let Err(err) = self.store.ensure_system_user().await {
            error!(error = %err, "service nsw sync failed to ensure system user");
            return false;
        }
        // Failures are logged and recorded by `run`; the loop still starts.
        let _ = self.run(SyncMode::Reference, feed).await;
        let _ = self.run(SyncMode::Full, feed).await;
        true
    }

    async fn scheduled_run(&self, mode: SyncMode, feed: &dyn PriceFeed) {
        let _guard = self.run_lock.lock().await;
        let _ = self.run(mode, feed).await;
    }
}

/// First tick one period from now; missed ticks are dropped, not bunched.
fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}
