//! Background publish + sync loop
//!
//! `SyncService` owns one task that, every `sync_interval`, publishes local
//! changes (if any) and then syncs every followed peer. Stopping cancels the
//! token the pipelines check between peers and between steps, then waits
//! for the task, so a step already persisting finishes first.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::content::ContentStore;
use crate::error::{SyncError, SyncResult};
use crate::publish::PublishEngine;
use crate::sync::{SyncEngine, SyncReport};

/// One pass of the loop: publish if needed, then sync everyone
pub async fn run_cycle<C: ContentStore>(
    publisher: &PublishEngine<C>,
    sync: &SyncEngine<C>,
    cancel: &CancellationToken,
) -> SyncResult<SyncReport> {
    match publisher.has_changes() {
        Ok(true) => match publisher.try_publish(cancel).await {
            Ok(report) => debug!(version = report.version, "Scheduled publish done"),
            Err(SyncError::PublishInProgress) => debug!("Publish already running, skipping"),
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => warn!(error = %e, "Scheduled publish failed"),
        },
        Ok(false) => debug!("Nothing to publish"),
        Err(e) => warn!(error = %e, "Failed to check for local changes"),
    }

    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    sync.sync_all(cancel).await
}

/// Periodic publish and sync with an explicit start/stop lifecycle
pub struct SyncService<C> {
    publisher: PublishEngine<C>,
    sync: SyncEngine<C>,
    interval: Duration,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl<C: ContentStore> SyncService<C> {
    /// Create a stopped service
    pub fn new(publisher: PublishEngine<C>, sync: SyncEngine<C>, interval: Duration) -> Self {
        Self {
            publisher,
            sync,
            interval,
            running: None,
        }
    }

    /// Whether the loop is running
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Spawn the loop. The first cycle runs immediately.
    pub fn start(&mut self) -> SyncResult<()> {
        if self.is_running() {
            return Err(SyncError::InvalidOperation(
                "sync service already running".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let publisher = self.publisher.clone();
        let sync = self.sync.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "Sync service started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match run_cycle(&publisher, &sync, &token).await {
                    Ok(report) => debug!(
                        synced = report.synced(),
                        failed = report.failures.len(),
                        "Service cycle done"
                    ),
                    Err(SyncError::Cancelled) => break,
                    Err(e) => warn!(error = %e, "Service cycle failed"),
                }
            }
            info!("Sync service stopped");
        });

        self.running = Some((cancel, handle));
        Ok(())
    }

    /// Cancel the loop and wait for it to wind down
    pub async fn stop(&mut self) {
        let Some((cancel, handle)) = self.running.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Sync service task ended abnormally");
        }
    }
}

impl<C> Drop for SyncService<C> {
    fn drop(&mut self) {
        if let Some((cancel, _)) = &self.running {
            cancel.cancel();
        }
    }
}
