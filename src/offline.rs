//! Offline coordinator: queue mutating requests while offline and replay them
//! once connectivity returns.

use crate::model::{RequestDescriptor, SyncReport, Transition};
use crate::replay::Replayer;
use crate::storage::{PendingStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("offline queuing is disabled: local store unavailable")]
    StorageUnavailable,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct OfflineCoordinator {
    store: Option<Arc<dyn PendingStore>>,
    replayer: Arc<dyn Replayer>,
    pending: watch::Sender<i64>,
    completed: broadcast::Sender<SyncReport>,
}

impl OfflineCoordinator {
    /// `store` is `None` when the local database could not be opened; the
    /// coordinator then reports offline state but queues nothing.
    pub fn new(store: Option<Arc<dyn PendingStore>>, replayer: Arc<dyn Replayer>) -> Self {
        let (pending, _) = watch::channel(0);
        let (completed, _) = broadcast::channel(16);
        Self {
            store,
            replayer,
            pending,
            completed,
        }
    }

    pub fn queuing_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Number of requests waiting to be replayed, as of the last refresh.
    pub fn pending_count(&self) -> i64 {
        *self.pending.borrow()
    }

    pub fn watch_pending(&self) -> watch::Receiver<i64> {
        self.pending.subscribe()
    }

    /// Fires after every completed sync pass.
    pub fn subscribe_sync_complete(&self) -> broadcast::Receiver<SyncReport> {
        self.completed.subscribe()
    }

    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn queue_request(&self, request: RequestDescriptor) -> Result<i64, OfflineError> {
        let store = self.store.as_ref().ok_or(OfflineError::StorageUnavailable)?;
        let id = store.enqueue(&request).await?;
        info!(id, "request queued for replay");
        self.refresh_pending_count().await;
        Ok(id)
    }

    pub async fn refresh_pending_count(&self) -> i64 {
        let Some(store) = &self.store else {
            return 0;
        };
        match store.count_pending().await {
            Ok(count) => {
                self.pending.send_replace(count);
                count
            }
            Err(err) => {
                warn!(?err, "failed to count pending requests");
                self.pending_count()
            }
        }
    }

    /// Replay every request pending at the time of the call. Failures leave
    /// the record queued; the pass always continues to the next record.
    #[instrument(skip_all)]
    pub async fn sync_pending_requests(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let Some(store) = &self.store else {
            debug!("sync skipped: queuing disabled");
            return self.complete(report);
        };

        let pending = match store.list_pending().await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(?err, "failed to list pending requests");
                report.remaining = self.pending_count();
                return self.complete(report);
            }
        };

        for record in pending {
            report.attempted += 1;
            match self.replayer.replay(&record.descriptor()).await {
                Ok(()) => match store.mark_synced(record.id).await {
                    Ok(()) => {
                        report.replayed += 1;
                        info!(id = record.id, url = %record.url, "pending request replayed");
                    }
                    Err(err) => {
                        report.failed += 1;
                        warn!(?err, id = record.id, "replayed but failed to mark synced");
                    }
                },
                Err(err) => {
                    report.failed += 1;
                    warn!(?err, id = record.id, url = %record.url, "replay failed; keeping queued");
                }
            }
        }

        report.purged = match store.purge_synced().await {
            Ok(purged) => purged,
            Err(err) => {
                warn!(?err, "failed to purge synced requests");
                0
            }
        };
        report.remaining = self.refresh_pending_count().await;
        self.complete(report)
    }

    fn complete(&self, report: SyncReport) -> SyncReport {
        let _ = self.completed.send(report.clone());
        report
    }

    /// Sync on every transition to online until the transition stream ends.
    pub fn spawn(self: &Arc<Self>, mut transitions: broadcast::Receiver<Transition>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match transitions.recv().await {
                    Ok(Transition::WentOnline) => {
                        coordinator.sync_pending_requests().await;
                    }
                    Ok(Transition::WentOffline) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed connectivity transitions; syncing");
                        coordinator.sync_pending_requests().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
