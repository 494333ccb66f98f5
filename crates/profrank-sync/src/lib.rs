//! Refresh orchestration: staleness checks, run serialization, and the
//! periodic background loop.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use profrank_harvest::{
    BackoffPolicy, HarvestError, HarvestPipeline, HarvestProgress, ProfessorSource, SourceConfig,
};
use profrank_storage::{Store, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "profrank-sync";

/// Environment-driven settings for the whole service.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub database_url: String,
    pub reference_file: PathBuf,
    pub school_id: i64,
    pub http_timeout_secs: u64,
    pub refresh_interval: Duration,
}

impl RefreshConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:professors.db".to_string()),
            reference_file: std::env::var("PROFRANK_REFERENCE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("official_programs.txt")),
            school_id: std::env::var("PROFRANK_SCHOOL_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(877),
            http_timeout_secs: std::env::var("PROFRANK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            refresh_interval: Duration::from_secs(
                std::env::var("PROFRANK_REFRESH_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(7 * 24 * 3600),
            ),
        }
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            school_id: self.school_id,
            timeout: Duration::from_secs(self.http_timeout_secs),
            backoff: BackoffPolicy::default(),
            ..SourceConfig::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("a harvest run is already in progress")]
    Busy,
    #[error(transparent)]
    Harvest(#[from] HarvestError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Summary of one completed harvest run.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_records: usize,
}

/// Drives harvest runs against the store, holding a run guard so at most
/// one harvest is active at a time. Overlapping triggers are rejected,
/// not queued.
pub struct Refresher<S> {
    store: Store,
    pipeline: HarvestPipeline<S>,
    running: Mutex<()>,
}

impl<S: ProfessorSource + 'static> Refresher<S> {
    pub fn new(store: Store, pipeline: HarvestPipeline<S>) -> Self {
        Self {
            store,
            pipeline,
            running: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run one full harvest and replace the dataset. Storage is only
    /// touched after the harvest completes, so a failed or cancelled run
    /// leaves the previous dataset intact.
    pub async fn run_once(&self) -> Result<RefreshOutcome, RefreshError> {
        let _guard = self.running.try_lock().map_err(|_| RefreshError::Busy)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "starting harvest run");

        let report = |p: HarvestProgress| {
            debug!(
                records = p.records_so_far,
                partitions_done = p.partitions_done,
                partitions_total = p.partitions_total,
                "harvest progress"
            );
        };
        let records = self.pipeline.run(Some(&report)).await?;
        self.store.replace_all(&records, Utc::now()).await?;

        let outcome = RefreshOutcome {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total_records: records.len(),
        };
        info!(%run_id, records = outcome.total_records, "harvest run complete");
        Ok(outcome)
    }

    /// No-op when the stored dataset is still inside the freshness window.
    pub async fn run_if_stale(&self) -> Result<Option<RefreshOutcome>, RefreshError> {
        if self.store.is_fresh().await? {
            return Ok(None);
        }
        self.run_once().await.map(Some)
    }

    /// Periodic loop: check staleness, harvest when needed, sleep, repeat.
    /// Failures are logged and the loop continues; it never returns. Cancel
    /// by aborting the task that runs it, which is safe because persisted
    /// state is only written after a completed harvest.
    pub async fn run_periodic(&self, interval: Duration) {
        loop {
            match self.run_if_stale().await {
                Ok(Some(outcome)) => {
                    info!(records = outcome.total_records, "scheduled refresh complete");
                }
                Ok(None) => info!("dataset is fresh, skipping scheduled refresh"),
                Err(RefreshError::Busy) => {
                    warn!("scheduled refresh skipped, a harvest run is already in progress");
                }
                Err(err) => error!(error = %err, "scheduled refresh failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }
}
