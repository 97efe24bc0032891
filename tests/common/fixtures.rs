use anyhow::{bail, Result};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use textassembler_processor::config::{AppConfig, CliConfig};
use textassembler_processor::notifications::Notifier;
use textassembler_processor::rate_limit::{ApiLimit, CallClass};
use textassembler_processor::searches::{
    ApiCallRecord, HistoricalSearch, OutputFormat, Search, SearchStore, SqliteSearchStore,
    Source,
};
use walkdir::WalkDir;

/// Config with a fast poll and no pauses between retries.
pub fn test_config(storage_root: &Path) -> AppConfig {
    let cli = CliConfig {
        db_path: Some(storage_root.join("unused.db")),
        storage_root: Some(storage_root.to_path_buf()),
        api_base_url: None,
    };
    let mut config = AppConfig::resolve(&cli, None).unwrap();
    config.processing.poll_interval_ms = 1;
    config.processing.wait_slice_secs = 1;
    config.retries.database.backoff_secs = 0;
    config.retries.filesystem.backoff_secs = 0;
    config.retries.api.backoff_secs = 0;
    config
}

pub fn queue_search(store: &dyn SearchStore, query: &str, formats: &[OutputFormat]) -> i64 {
    let search = Search::new("user1", query, 1_700_000_000).with_formats(formats);
    store.create_search(&search).unwrap()
}

/// Regular files below `dir`, zero when it does not exist.
pub fn count_files(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub completed: Mutex<Vec<i64>>,
    pub failed: Mutex<Vec<i64>>,
}

impl Notifier for RecordingNotifier {
    fn notify_completed(&self, search: &Search) {
        self.completed.lock().unwrap().push(search.id);
    }

    fn notify_failed(&self, search: &Search) {
        self.failed.lock().unwrap().push(search.id);
    }
}

/// In-memory store whose `save_search` can be made to fail.
pub struct FlakyStore {
    inner: SqliteSearchStore,
    failing_saves: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteSearchStore::in_memory().unwrap(),
            failing_saves: AtomicUsize::new(0),
        })
    }

    /// Fails the next `count` saves.
    pub fn fail_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }
}

impl SearchStore for FlakyStore {
    fn create_search(&self, search: &Search) -> Result<i64> {
        self.inner.create_search(search)
    }

    fn get_search(&self, id: i64) -> Result<Option<Search>> {
        self.inner.get_search(id)
    }

    fn list_download_queue(&self) -> Result<Vec<Search>> {
        self.inner.list_download_queue()
    }

    fn list_ready_for_compression(&self) -> Result<Vec<Search>> {
        self.inner.list_ready_for_compression()
    }

    fn list_due_for_deletion(&self, cutoff: i64) -> Result<Vec<Search>> {
        self.inner.list_due_for_deletion(cutoff)
    }

    fn save_search(&self, search: &Search) -> Result<()> {
        let failing = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("database is locked");
        }
        self.inner.save_search(search)
    }

    fn mark_compression_complete(&self, id: i64, now: i64) -> Result<bool> {
        self.inner.mark_compression_complete(id, now)
    }

    fn delete_with_history(&self, search: &Search, now: i64) -> Result<()> {
        self.inner.delete_with_history(search, now)
    }

    fn get_history(&self, search_id: i64) -> Result<Option<HistoricalSearch>> {
        self.inner.get_history(search_id)
    }

    fn get_api_limit(&self, class: CallClass) -> Result<Option<ApiLimit>> {
        self.inner.get_api_limit(class)
    }

    fn put_api_limit(&self, limit: &ApiLimit) -> Result<()> {
        self.inner.put_api_limit(limit)
    }

    fn log_api_call(&self, record: &ApiCallRecord) -> Result<()> {
        self.inner.log_api_call(record)
    }

    fn count_api_calls(&self, class: CallClass, since: i64) -> Result<u64> {
        self.inner.count_api_calls(class, since)
    }

    fn oldest_api_call(&self, class: CallClass, since: i64) -> Result<Option<i64>> {
        self.inner.oldest_api_call(class, since)
    }

    fn stage_source(&self, source_id: &str, name: &str) -> Result<()> {
        self.inner.stage_source(source_id, name)
    }

    fn activate_staged_sources(&self) -> Result<usize> {
        self.inner.activate_staged_sources()
    }

    fn list_sources(&self, active: bool) -> Result<Vec<Source>> {
        self.inner.list_sources(active)
    }
}
