//! Sweep of abandoned upload sessions.
//!
//! Presigned and multipart flows create records before the caller uploads
//! anything, so rows stuck in `pending` or `uploading` are expected. A
//! `ReconciliationPolicy` decides how old such a row must be before it is
//! reaped; `NeverReap` keeps them forever.

use chrono::Utc;
use filevault_core::{AppError, File, FileStatus, ReconcileConfig};
use filevault_db::FileRepository;
use filevault_storage::Storage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);
const DEFAULT_BATCH_SIZE: i64 = 100;

/// Age after which a record in a given status counts as abandoned.
pub trait ReconciliationPolicy: Send + Sync {
    /// `None` disables reaping for `status`.
    fn threshold(&self, status: FileStatus) -> Option<chrono::Duration>;
}

/// Keep every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverReap;

impl ReconciliationPolicy for NeverReap {
    fn threshold(&self, _status: FileStatus) -> Option<chrono::Duration> {
        None
    }
}

/// Reap `pending` and `uploading` records once they exceed a maximum age.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxAgePolicy {
    pub pending: Option<chrono::Duration>,
    pub uploading: Option<chrono::Duration>,
}

impl MaxAgePolicy {
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self {
            pending: config
                .pending_max_age
                .and_then(|d| chrono::Duration::from_std(d).ok()),
            uploading: config
                .uploading_max_age
                .and_then(|d| chrono::Duration::from_std(d).ok()),
        }
    }
}

impl ReconciliationPolicy for MaxAgePolicy {
    fn threshold(&self, status: FileStatus) -> Option<chrono::Duration> {
        match status {
            FileStatus::Pending => self.pending,
            FileStatus::Uploading => self.uploading,
            FileStatus::Completed | FileStatus::Failed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub reaped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ReconciliationService {
    repo: Arc<dyn FileRepository>,
    storage: Arc<dyn Storage>,
    policy: Arc<dyn ReconciliationPolicy>,
    interval: Duration,
    batch_size: i64,
}

impl ReconciliationService {
    pub fn new(
        repo: Arc<dyn FileRepository>,
        storage: Arc<dyn Storage>,
        policy: Arc<dyn ReconciliationPolicy>,
    ) -> Self {
        Self {
            repo,
            storage,
            policy,
            interval: DEFAULT_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Start the background sweep.
    /// Returns a JoinHandle for graceful shutdown
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep_interval = interval(self.interval);

            loop {
                sweep_interval.tick().await;

                tracing::info!("Starting scheduled reconciliation sweep");

                match self.sweep_once().await {
                    Ok(report) => tracing::info!(
                        examined = report.examined,
                        reaped = report.reaped,
                        failed = report.failed,
                        "Reconciliation sweep completed"
                    ),
                    Err(e) => tracing::error!(error = %e, "Reconciliation sweep failed"),
                }
            }
        })
    }

    /// One pass over every status the policy reaps. Per-record failures are
    /// counted, not fatal; a failed listing aborts the pass.
    #[tracing::instrument(skip(self), fields(reconcile.operation = "sweep"))]
    pub async fn sweep_once(&self) -> Result<SweepReport, AppError> {
        let mut report = SweepReport::default();

        for status in [FileStatus::Pending, FileStatus::Uploading] {
            let Some(threshold) = self.policy.threshold(status) else {
                continue;
            };
            let older_than = Utc::now() - threshold;
            let stale = self
                .repo
                .list_stale(status, older_than, self.batch_size)
                .await?;

            for file in stale {
                report.examined += 1;
                match self.reap(&file).await {
                    Ok(()) => report.reaped += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(
                            error = %e,
                            file_id = %file.id,
                            storage_key = %file.storage_key,
                            "Failed to reap abandoned upload"
                        );
                    }
                }
            }
        }

        Ok(report)
    }

    async fn reap(&self, file: &File) -> Result<(), AppError> {
        tracing::info!(
            file_id = %file.id,
            storage_key = %file.storage_key,
            status = %file.status,
            updated_at = %file.updated_at,
            "Reaping abandoned upload"
        );

        if file.is_multipart() {
            if let Err(e) = self
                .storage
                .abort_multipart_upload(&file.storage_key, &file.upload_id)
                .await
            {
                tracing::warn!(
                    error = %e,
                    file_id = %file.id,
                    upload_id = %file.upload_id,
                    "Failed to abort multipart session"
                );
            }
        }

        // A presigned PUT may have landed after all.
        let delete_result = self.storage.delete(&file.storage_key).await;

        self.repo.soft_delete(file.id).await?;

        if let Err(e) = delete_result {
            tracing::error!(
                error = %e,
                file_id = %file.id,
                storage_key = %file.storage_key,
                "Abandoned upload reaped but its object could not be deleted; object is orphaned"
            );
        }
        Ok(())
    }
}
