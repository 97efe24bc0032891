//! Compression processor.
//!
//! Packs the result tree of every fully downloaded search into one archive,
//! removes the loose files and notifies the owner exactly once.

use super::retry::{FailureDomain, RetryCounters, StepError, Tick};
use super::{back_off, sleep_or_shutdown};
use crate::config::AppConfig;
use crate::notifications::Notifier;
use crate::searches::{Search, SearchStore};
use crate::storage::archive::{archive_name, build_archive, find_archives, loose_files, remove_loose_files};
use crate::storage::{check_storage_root, job_root};
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct CompressionProcessor {
    store: Arc<dyn SearchStore>,
    notifier: Arc<dyn Notifier>,
    storage_root: PathBuf,
    archive_prefix: String,
    poll_interval: Duration,
    counters: RetryCounters,
}

impl CompressionProcessor {
    pub fn new(store: Arc<dyn SearchStore>, notifier: Arc<dyn Notifier>, config: &AppConfig) -> Self {
        Self {
            store,
            notifier,
            storage_root: config.storage.root.clone(),
            archive_prefix: config.storage.archive_prefix.clone(),
            poll_interval: config.processing.poll_interval(),
            counters: RetryCounters::new(&config.retries),
        }
    }

    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!("Compression processor starting");

        loop {
            if !sleep_or_shutdown(self.poll_interval, &shutdown).await {
                break;
            }
            if let Err(e) = self.tick() {
                back_off("Compression", &mut self.counters, e, &shutdown).await?;
            }
            if shutdown.is_cancelled() {
                break;
            }
        }

        info!("Compression processor stopped");
        Ok(())
    }

    pub fn tick(&mut self) -> Result<Tick, StepError> {
        let queue = self
            .store
            .list_ready_for_compression()
            .context("Failed to retrieve the compression queue")
            .map_err(|e| StepError::new(FailureDomain::Database, e))?;
        let Some(mut search) = queue.into_iter().next() else {
            self.counters.reset(FailureDomain::Database);
            return Ok(Tick::Idle);
        };

        check_storage_root(&self.storage_root)
            .map_err(|e| StepError::new(FailureDomain::Storage, e))?;
        self.counters.reset(FailureDomain::Storage);

        let now = Utc::now().timestamp();
        search
            .begin_compression(now)
            .map_err(|e| StepError::new(FailureDomain::Database, e))?;
        search.updated_at = now;
        self.store
            .save_search(&search)
            .map_err(|e| StepError::new(FailureDomain::Database, e))?;

        info!("Starting compression of search {}", search.id);
        let entries = self
            .compress(&search)
            .map_err(|e| StepError::new(FailureDomain::Filesystem, e))?;
        self.counters.reset(FailureDomain::Filesystem);
        info!(
            "Completed compression of search {} ({} files)",
            search.id, entries
        );

        let now = Utc::now().timestamp();
        let first = self
            .store
            .mark_compression_complete(search.id, now)
            .map_err(|e| StepError::new(FailureDomain::Database, e))?;
        self.counters.reset(FailureDomain::Database);
        if !first {
            debug!("Search {} was already marked complete", search.id);
            return Ok(Tick::Worked);
        }
        if search.complete_compression(now).is_ok() {
            self.notifier.notify_completed(&search);
        }
        Ok(Tick::Worked)
    }

    /// Builds the archive and drops the loose tree. Returns the number of
    /// archived files.
    fn compress(&self, search: &Search) -> Result<usize> {
        let root = job_root(&self.storage_root, search.id);
        fs::create_dir_all(&root).with_context(|| format!("Failed to create {:?}", root))?;

        // archives are renamed into place only once complete, so one left by
        // a crash during cleanup is kept and only the cleanup is finished
        if !find_archives(&root)?.is_empty() {
            info!(
                "Search {} already has an archive, skipping rebuild",
                search.id
            );
            remove_loose_files(&root).with_context(|| format!("Failed to clean up {:?}", root))?;
            return Ok(0);
        }

        let archive = root.join(archive_name(&self.archive_prefix, search.submitted_at)?);
        let entries = build_archive(&root, &archive)
            .with_context(|| format!("Failed to build archive {:?}", archive))?;

        info!("Started cleanup of loose files for search {}", search.id);
        remove_loose_files(&root).with_context(|| format!("Failed to clean up {:?}", root))?;
        Ok(entries)
    }
}
