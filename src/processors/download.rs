//! Download processor.
//!
//! Each tick picks the least recently updated search in the download queue
//! and fetches one page of its results:
//!
//! 1. select the queue, check storage, authenticate
//! 2. wait until the throttle gate opens, in short slices
//! 3. select again, the queue may have changed while waiting
//! 4. fetch the page and update the quota ledger from its headers
//! 5. write the documents, then save the progress
//!
//! Files of a page whose progress could not be saved are removed again, so
//! the page is fetched anew on the next tick. A call the API could not serve
//! right now is put off: its quota headers go into the ledger, or without
//! them the processor sits out the API backoff.

use super::retry::{FailureDomain, RetryCounters, StepError, Tick};
use super::{back_off, sleep_or_shutdown, wait_for_gate};
use crate::api::{ApiError, ContentApi, DownloadRequest, DownloadedDocument};
use crate::config::AppConfig;
use crate::formats::render;
use crate::notifications::Notifier;
use crate::rate_limit::{
    CallClass, LedgerError, RateLimitHeaders, RateLimitLedger, ThrottleGate,
};
use crate::searches::{ApiCallRecord, PageProgress, Search, SearchStore};
use crate::storage::{check_storage_root, job_root, PageWriter, ShardAllocator};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct DownloadProcessor {
    store: Arc<dyn SearchStore>,
    api: Arc<dyn ContentApi>,
    notifier: Arc<dyn Notifier>,
    gate: ThrottleGate,
    allocator: ShardAllocator,
    storage_root: PathBuf,
    page_size: i64,
    max_job_retries: i32,
    poll_interval: Duration,
    wait_slice: Duration,
    domain_backoff: Duration,
    counters: RetryCounters,
}

impl DownloadProcessor {
    pub fn new(
        store: Arc<dyn SearchStore>,
        api: Arc<dyn ContentApi>,
        notifier: Arc<dyn Notifier>,
        config: &AppConfig,
    ) -> Self {
        let ledger = RateLimitLedger::new(store.clone(), config.limit_overrides.clone());
        Self {
            store,
            api,
            notifier,
            gate: ThrottleGate::new(ledger, config.window),
            allocator: ShardAllocator::new(
                config.storage.max_files_per_dir,
                config.storage.max_sub_dirs_per_dir,
            ),
            storage_root: config.storage.root.clone(),
            page_size: config.api.page_size,
            max_job_retries: config.api.max_job_retries,
            poll_interval: config.processing.poll_interval(),
            wait_slice: config.processing.wait_slice(),
            domain_backoff: Duration::from_secs(config.retries.api.backoff_secs),
            counters: RetryCounters::new(&config.retries),
        }
    }

    /// Processes the queue until shutdown is requested or a failure domain
    /// runs out of retries.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Download processor starting (page size {}, storage {:?})",
            self.page_size, self.storage_root
        );

        loop {
            if !sleep_or_shutdown(self.poll_interval, &shutdown).await {
                break;
            }
            match self.tick(&shutdown).await {
                Ok(Tick::Shutdown) => break,
                Ok(_) => {}
                Err(e) => back_off("Download", &mut self.counters, e, &shutdown).await?,
            }
            if shutdown.is_cancelled() {
                break;
            }
        }

        info!("Download processor stopped");
        Ok(())
    }

    /// One pass through the download steps.
    pub async fn tick(&mut self, shutdown: &CancellationToken) -> Result<Tick, StepError> {
        if self.select()?.is_none() {
            self.counters.reset(FailureDomain::Database);
            return Ok(Tick::Idle);
        }

        check_storage_root(&self.storage_root)
            .map_err(|e| StepError::new(FailureDomain::Storage, e))?;
        self.counters.reset(FailureDomain::Storage);

        self.api
            .authenticate()
            .await
            .map_err(|e| StepError::new(FailureDomain::Auth, e))?;
        self.counters.reset(FailureDomain::Auth);

        if !wait_for_gate(&self.gate, CallClass::Download, self.wait_slice, shutdown).await? {
            return Ok(Tick::Shutdown);
        }

        // the search may have been deleted or finished while we waited
        let Some(mut search) = self.select()? else {
            return Ok(Tick::Idle);
        };
        self.download_page(&mut search, shutdown).await
    }

    fn select(&mut self) -> Result<Option<Search>, StepError> {
        let queue = self
            .store
            .list_download_queue()
            .context("Failed to retrieve the download queue")
            .map_err(|e| StepError::new(FailureDomain::Database, e))?;
        Ok(queue.into_iter().next())
    }

    async fn download_page(
        &mut self,
        search: &mut Search,
        shutdown: &CancellationToken,
    ) -> Result<Tick, StepError> {
        let started = Instant::now();
        info!(
            "Downloading items for search {} (skip {})",
            search.id, search.skip_value
        );

        let request = DownloadRequest::for_search(search, self.page_size);
        let response = match self.api.download(&request).await {
            Ok(response) => response,
            Err(e) => return self.handle_api_error(search, e, shutdown).await,
        };
        self.counters.reset(FailureDomain::Api);
        let now = Utc::now().timestamp();
        info!(
            "Download call for search {} returned {} of {} results (status {})",
            search.id,
            response.page.returned(),
            response.page.total,
            response.status
        );
        self.log_call(&response.request_url, Some(response.status), response.page.returned());

        match &response.rate_limits {
            Some(headers) => {
                match self
                    .gate
                    .ledger()
                    .update_limit(CallClass::Download, headers, now)
                {
                    Ok(_) => {}
                    Err(LedgerError::Malformed(e)) => {
                        warn!(
                            "Discarding page of search {}, quota headers unusable: {}",
                            search.id, e
                        );
                        return Ok(Tick::Idle);
                    }
                    Err(LedgerError::Store(e)) => {
                        return Err(StepError::new(FailureDomain::Database, e))
                    }
                }
            }
            None => warn!("Download response for search {} carried no quota headers", search.id),
        }

        let root = job_root(&self.storage_root, search.id);
        let mut writer = PageWriter::new(&self.allocator, &root, search.last_save_dir.as_deref());
        for item in &response.page.value {
            let Some(document) = DownloadedDocument::from_value(item) else {
                warn!(
                    "Skipping result of search {} without ResultId or Document.Content: {}",
                    search.id, item
                );
                continue;
            };
            let renditions: Vec<_> = search
                .formats
                .iter()
                .map(|format| (*format, render(*format, &document.content)))
                .collect();
            if let Err(e) = writer.write_document(&document.result_id, &renditions) {
                writer.rollback();
                return Err(StepError::new(
                    FailureDomain::Filesystem,
                    anyhow::Error::new(e).context(format!(
                        "Failed to save result {} of search {}",
                        document.result_id, search.id
                    )),
                ));
            }
        }

        let progress = PageProgress {
            returned: response.page.returned(),
            total_available: response.page.total,
            elapsed_secs: started.elapsed().as_secs_f64().round() as i64,
            last_save_dir: writer.last_save_dir(),
        };
        if let Err(e) = search.record_page(&progress, now) {
            writer.rollback();
            return Err(StepError::new(FailureDomain::Internal, e));
        }
        search.updated_at = now;
        if let Err(e) = self.store.save_search(search) {
            writer.rollback();
            return Err(StepError::new(
                FailureDomain::Database,
                e.context(format!("Failed to save progress of search {}", search.id)),
            ));
        }

        let written = writer.commit();
        self.counters.reset(FailureDomain::Database);
        self.counters.reset(FailureDomain::Filesystem);
        debug!("Wrote {} files for search {}", written, search.id);
        info!(
            "Search {}: {} of {} results downloaded",
            search.id, search.num_results_downloaded, search.num_results_in_search
        );
        if search.completed_download_at.is_some() {
            info!("Completed downloading all results for search {}", search.id);
        }
        Ok(Tick::Worked)
    }

    async fn handle_api_error(
        &mut self,
        search: &mut Search,
        err: ApiError,
        shutdown: &CancellationToken,
    ) -> Result<Tick, StepError> {
        if let Some(url) = err.url() {
            self.log_call(url, err.status(), 0);
        }
        match err {
            ApiError::Transient { .. } => Err(StepError::new(FailureDomain::Api, err)),
            ApiError::Auth(_) => Err(StepError::new(FailureDomain::Auth, err)),
            ApiError::Domain {
                ref rate_limits, ..
            } => {
                warn!("Download for search {} deferred: {}", search.id, err);
                let recorded = match rate_limits {
                    Some(headers) => self.record_quota(headers)?,
                    None => false,
                };
                // nothing tells the gate how long to hold off
                if !recorded {
                    debug!("Waiting {}s before the next download", self.domain_backoff.as_secs());
                    if !sleep_or_shutdown(self.domain_backoff, shutdown).await {
                        return Ok(Tick::Shutdown);
                    }
                }
                Ok(Tick::Idle)
            }
            ApiError::Rejected { ref message, .. } => {
                error!("An error occurred processing search {}: {}", search.id, err);
                let now = Utc::now().timestamp();
                let failed = search
                    .record_rejection(message, self.max_job_retries, now)
                    .map_err(|e| StepError::new(FailureDomain::Internal, e))?;
                search.updated_at = now;
                let notify = failed && !search.notified;
                if notify {
                    search.notified = true;
                }
                self.store
                    .save_search(search)
                    .map_err(|e| StepError::new(FailureDomain::Database, e))?;
                self.counters.reset(FailureDomain::Database);

                if failed {
                    warn!(
                        "Search {} failed after {} attempts",
                        search.id, search.retry_count
                    );
                }
                // only once the failure is stored
                if notify {
                    self.notifier.notify_failed(search);
                }
                Ok(Tick::Worked)
            }
        }
    }

    /// Stores the quota sent along with an error response. Returns false when
    /// the headers could not be used.
    fn record_quota(&self, headers: &RateLimitHeaders) -> Result<bool, StepError> {
        let now = Utc::now().timestamp();
        match self
            .gate
            .ledger()
            .update_limit(CallClass::Download, headers, now)
        {
            Ok(_) => Ok(true),
            Err(LedgerError::Malformed(e)) => {
                warn!("Ignoring quota headers of failed download: {}", e);
                Ok(false)
            }
            Err(LedgerError::Store(e)) => Err(StepError::new(FailureDomain::Database, e)),
        }
    }

    fn log_call(&self, request_url: &str, status: Option<u16>, num_results: i64) {
        let record = ApiCallRecord {
            class: CallClass::Download,
            request_url: request_url.to_string(),
            response_code: status,
            num_results,
            requested_at: Utc::now().timestamp(),
        };
        if let Err(e) = self.store.log_api_call(&record) {
            warn!("Failed to record API call: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiResponse;
    use crate::config::CliConfig;
    use crate::notifications::LogNotifier;
    use crate::rate_limit::{ApiLimit, RateCounter};
    use crate::searches::SqliteSearchStore;
    use async_trait::async_trait;
    use chrono::Local;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Counts calls and never returns anything. Fails with `error` when set,
    /// with a timeout otherwise.
    #[derive(Default)]
    struct CountingApi {
        downloads: AtomicUsize,
        error: Mutex<Option<ApiError>>,
    }

    impl CountingApi {
        fn failing_with(error: ApiError) -> Self {
            Self {
                downloads: AtomicUsize::new(0),
                error: Mutex::new(Some(error)),
            }
        }
    }

    #[async_trait]
    impl ContentApi for CountingApi {
        async fn authenticate(&self) -> Result<(), ApiError> {
            Ok(())
        }

        async fn download(&self, _request: &DownloadRequest) -> Result<ApiResponse, ApiError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let scripted = self.error.lock().unwrap().clone();
            Err(scripted.unwrap_or_else(|| ApiError::Transient {
                url: "test://News".to_string(),
                message: "timed out".to_string(),
            }))
        }

        async fn sources(&self, _skip: i64, _top: i64) -> Result<ApiResponse, ApiError> {
            unimplemented!()
        }

        async fn sample_quota(&self, _class: CallClass) -> Result<ApiResponse, ApiError> {
            unimplemented!()
        }
    }

    fn config(root: &std::path::Path) -> AppConfig {
        let cli = CliConfig {
            db_path: Some(root.join("db.sqlite")),
            storage_root: Some(root.to_path_buf()),
            api_base_url: None,
        };
        let mut config = AppConfig::resolve(&cli, None).unwrap();
        config.processing.poll_interval_ms = 1;
        config.processing.wait_slice_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_idle_without_searches() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteSearchStore::in_memory().unwrap());
        let api = Arc::new(CountingApi::default());
        let mut processor =
            DownloadProcessor::new(store, api.clone(), Arc::new(LogNotifier), &config(temp.path()));

        let tick = processor.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(tick, Tick::Idle);
        assert_eq!(api.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhausted_quota_waits_until_shutdown() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteSearchStore::in_memory().unwrap());
        store.create_search(&Search::new("u1", "storm", 100)).unwrap();

        let reset_at = Utc::now().timestamp() + 3600;
        let counter = RateCounter {
            limit: 10,
            remaining: 0,
            reset_at,
        };
        store
            .put_api_limit(&ApiLimit {
                class: CallClass::Download,
                per_minute: counter,
                per_hour: counter,
                per_day: counter,
                updated_at: 0,
            })
            .unwrap();

        let api = Arc::new(CountingApi::default());
        let mut processor =
            DownloadProcessor::new(store, api.clone(), Arc::new(LogNotifier), &config(temp.path()));

        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let tick = processor.tick(&shutdown).await.unwrap();
        assert_eq!(tick, Tick::Shutdown);
        assert_eq!(api.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_escalate() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteSearchStore::in_memory().unwrap());
        let id = store.create_search(&Search::new("u1", "storm", 100)).unwrap();

        let mut config = config(temp.path());
        config.retries.api.max_retries = 1;
        config.retries.api.backoff_secs = 0;
        let api = Arc::new(CountingApi::default());
        let mut processor =
            DownloadProcessor::new(store.clone(), api.clone(), Arc::new(LogNotifier), &config);

        let err = processor.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().starts_with("api failure"), "{}", err);
        assert_eq!(api.downloads.load(Ordering::SeqCst), 2);

        // not held against the search
        let search = store.get_search(id).unwrap().unwrap();
        assert_eq!(search.retry_count, 0);
        assert_eq!(search.skip_value, 0);
    }

    fn too_many_requests(rate_limits: Option<RateLimitHeaders>) -> ApiError {
        ApiError::Domain {
            url: "test://News".to_string(),
            status: Some(429),
            message: "Too Many Requests".to_string(),
            rate_limits,
        }
    }

    #[tokio::test]
    async fn test_quota_from_429_closes_gate() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteSearchStore::in_memory().unwrap());
        let id = store.create_search(&Search::new("u1", "storm", 100)).unwrap();

        let reset = Utc::now().timestamp() + 3600;
        let headers = RateLimitHeaders::new(
            "10/100/1000",
            "0/0/0",
            format!("{}/{}/{}", reset, reset, reset),
        );
        let api = Arc::new(CountingApi::failing_with(too_many_requests(Some(headers))));
        let mut processor = DownloadProcessor::new(
            store.clone(),
            api.clone(),
            Arc::new(LogNotifier),
            &config(temp.path()),
        );

        let shutdown = CancellationToken::new();
        assert_eq!(processor.tick(&shutdown).await.unwrap(), Tick::Idle);
        assert_eq!(api.downloads.load(Ordering::SeqCst), 1);

        let now = Local::now();
        let decision = processor.gate.check(CallClass::Download, now).unwrap();
        assert!(!decision.is_open(now));
        assert_eq!(decision.available_at.timestamp(), reset);

        // the next tick waits instead of calling again
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        assert_eq!(processor.tick(&shutdown).await.unwrap(), Tick::Shutdown);
        assert_eq!(api.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_search(id).unwrap().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_domain_error_without_quota_backs_off() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteSearchStore::in_memory().unwrap());
        store.create_search(&Search::new("u1", "storm", 100)).unwrap();

        let mut config = config(temp.path());
        config.retries.api.backoff_secs = 3600;
        let api = Arc::new(CountingApi::failing_with(too_many_requests(None)));
        let mut processor =
            DownloadProcessor::new(store, api.clone(), Arc::new(LogNotifier), &config);

        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        assert_eq!(processor.tick(&shutdown).await.unwrap(), Tick::Shutdown);
        assert_eq!(api.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_internal_failure() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteSearchStore::in_memory().unwrap());
        let mut config = config(temp.path());
        config.api.max_job_retries = 0;
        let mut processor = DownloadProcessor::new(
            store,
            Arc::new(CountingApi::default()),
            Arc::new(LogNotifier),
            &config,
        );

        let mut search = Search::new("u1", "storm", 100);
        search.state = crate::searches::SearchState::Completed;
        let rejected = ApiError::Rejected {
            url: "test://News".to_string(),
            status: 400,
            message: "Syntax error".to_string(),
        };
        let err = processor
            .handle_api_error(&mut search, rejected, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.domain, FailureDomain::Internal);
        assert!(err.to_string().starts_with("internal failure"), "{}", err);
    }
}
