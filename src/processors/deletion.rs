//! Deletion processor.
//!
//! Removes searches flagged by their owner or past the retention period.
//! File removal is best effort; the row is copied into the history table
//! and deleted regardless.

use super::retry::{FailureDomain, RetryCounters, StepError, Tick};
use super::{back_off, sleep_or_shutdown};
use crate::config::AppConfig;
use crate::searches::{Search, SearchStore};
use crate::storage::archive::find_archives;
use crate::storage::{check_storage_root, job_root};
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SECS_PER_DAY: i64 = 86_400;

pub struct DeletionProcessor {
    store: Arc<dyn SearchStore>,
    storage_root: PathBuf,
    retention_days: u64,
    poll_interval: Duration,
    counters: RetryCounters,
}

impl DeletionProcessor {
    pub fn new(store: Arc<dyn SearchStore>, config: &AppConfig) -> Self {
        Self {
            store,
            storage_root: config.storage.root.clone(),
            retention_days: config.processing.retention_days,
            poll_interval: config.processing.poll_interval(),
            counters: RetryCounters::new(&config.retries),
        }
    }

    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Deletion processor starting, removing searches older than {} days or marked as deleted",
            self.retention_days
        );

        loop {
            if !sleep_or_shutdown(self.poll_interval, &shutdown).await {
                break;
            }
            if let Err(e) = self.tick(Utc::now().timestamp()) {
                back_off("Deletion", &mut self.counters, e, &shutdown).await?;
            }
            if shutdown.is_cancelled() {
                break;
            }
        }

        info!("Deletion processor stopped");
        Ok(())
    }

    pub fn tick(&mut self, now: i64) -> Result<Tick, StepError> {
        if self.select(now)?.is_none() {
            self.counters.reset(FailureDomain::Database);
            return Ok(Tick::Idle);
        }

        check_storage_root(&self.storage_root)
            .map_err(|e| StepError::new(FailureDomain::Storage, e))?;
        self.counters.reset(FailureDomain::Storage);

        let Some(search) = self.select(now)? else {
            return Ok(Tick::Idle);
        };

        info!("Started removal of files for search {}", search.id);
        self.remove_files(&search);

        self.store
            .delete_with_history(&search, now)
            .with_context(|| format!("Failed to delete search {}", search.id))
            .map_err(|e| StepError::new(FailureDomain::Database, e))?;
        self.counters.reset(FailureDomain::Database);
        info!(
            "Deleted search {} ({})",
            search.id,
            search.state.as_str()
        );
        Ok(Tick::Worked)
    }

    fn cutoff(&self, now: i64) -> i64 {
        now - self.retention_days as i64 * SECS_PER_DAY
    }

    fn select(&mut self, now: i64) -> Result<Option<Search>, StepError> {
        let queue = self
            .store
            .list_due_for_deletion(self.cutoff(now))
            .context("Failed to retrieve the deletion queue")
            .map_err(|e| StepError::new(FailureDomain::Database, e))?;
        Ok(queue.into_iter().next())
    }

    fn remove_files(&self, search: &Search) {
        let root = job_root(&self.storage_root, search.id);
        match find_archives(&root) {
            Ok(archives) => {
                for archive in archives {
                    if let Err(e) = fs::remove_file(&archive) {
                        warn!(
                            "Could not delete archive {:?} of search {}: {}",
                            archive, search.id, e
                        );
                    }
                }
            }
            Err(e) => warn!("Could not list archives of search {}: {}", search.id, e),
        }
        if root.is_dir() {
            if let Err(e) = fs::remove_dir_all(&root) {
                warn!(
                    "Could not delete files of search {} at {:?}: {}",
                    search.id, root, e
                );
            }
        }
    }
}
