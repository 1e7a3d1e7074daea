//! Periodic cleanup: expired uploads and leftover blobs
//!
//! Runs on a fixed schedule, never per-request. Guarantees that abandoned
//! uploads and blobs whose terminal-transition cleanup failed do not
//! accumulate in the staging store.

use chrono::Utc;
use std::sync::Arc;

use crate::error::Result;
use crate::staging::BlobStager;
use crate::storage::IngestDb;

/// Outcome of one sweep cycle
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    /// Expired, never-consumed uploads removed
    pub expired_removed: usize,
    /// Terminal jobs whose blob was finally deleted
    pub blobs_reconciled: usize,
}

/// Background cleanup task
pub struct CleanupSweeper {
    db: Arc<IngestDb>,
    stager: Arc<BlobStager>,
    interval: std::time::Duration,
}

impl CleanupSweeper {
    pub fn new(db: Arc<IngestDb>, stager: Arc<BlobStager>, interval: std::time::Duration) -> Self {
        Self {
            db,
            stager,
            interval,
        }
    }

    /// Run forever on the configured interval
    pub async fn run(self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Cleanup sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(report) => {
                    if report.expired_removed > 0 || report.blobs_reconciled > 0 {
                        tracing::info!(
                            expired = report.expired_removed,
                            reconciled = report.blobs_reconciled,
                            "Sweep cycle complete"
                        );
                    }
                }
                Err(e) => tracing::error!("Sweep cycle failed: {}", e),
            }
        }
    }

    /// One sweep cycle: expired uploads, then blob reconciliation
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            expired_removed: self.stager.sweep_expired(Utc::now()).await?,
            ..SweepReport::default()
        };

        // Terminal jobs whose cleanup failed at transition time
        for mut job in self.db.list_terminal_jobs_with_blobs()? {
            match self.stager.delete(job.upload_id).await {
                Ok(()) => {
                    job.blob_deleted = true;
                    self.db.update_job(&job)?;
                    report.blobs_reconciled += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        upload_id = %job.upload_id,
                        "Blob reconciliation failed, will retry next cycle: {}",
                        e
                    );
                }
            }
        }

        Ok(report)
    }
}
