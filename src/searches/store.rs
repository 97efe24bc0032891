//! Search job storage.
//!
//! SQLite-backed storage for search jobs, their history copies, the
//! rate-limit ledger and the API call log.

use super::models::*;
use super::schema::SEARCHES_VERSIONED_SCHEMAS;
use crate::rate_limit::{ApiLimit, CallClass, RateCounter};
use crate::sqlite_persistence::{open_in_memory, open_versioned};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One external API call, kept for operator reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCallRecord {
    pub class: CallClass,
    pub request_url: String,
    pub response_code: Option<u16>,
    pub num_results: i64,
    pub requested_at: i64,
}

/// Trait for search storage operations.
///
/// Each processor only touches the searches it currently owns, which is
/// decided by their state. There is no row locking.
pub trait SearchStore: Send + Sync {
    // === Searches ===

    /// Insert a new search with its filters and formats. Returns its id.
    fn create_search(&self, search: &Search) -> Result<i64>;

    fn get_search(&self, id: i64) -> Result<Option<Search>>;

    /// Searches still downloading, least recently updated first.
    fn list_download_queue(&self) -> Result<Vec<Search>>;

    /// Searches whose download completed and that still need an archive.
    fn list_ready_for_compression(&self) -> Result<Vec<Search>>;

    /// Searches flagged as deleted, or completed/failed at or before `cutoff`.
    fn list_due_for_deletion(&self, cutoff: i64) -> Result<Vec<Search>>;

    /// Persist the mutable fields of a search.
    fn save_search(&self, search: &Search) -> Result<()>;

    /// Atomically mark compression complete and set the notified flag.
    /// Returns false if the search was already notified or is not awaiting
    /// compression, in which case nothing changes.
    fn mark_compression_complete(&self, id: i64, now: i64) -> Result<bool>;

    /// Copy the search into the history table and remove it, in one
    /// transaction.
    fn delete_with_history(&self, search: &Search, now: i64) -> Result<()>;

    fn get_history(&self, search_id: i64) -> Result<Option<HistoricalSearch>>;

    // === Rate-limit ledger ===

    fn get_api_limit(&self, class: CallClass) -> Result<Option<ApiLimit>>;

    fn put_api_limit(&self, limit: &ApiLimit) -> Result<()>;

    // === API call log ===

    fn log_api_call(&self, record: &ApiCallRecord) -> Result<()>;

    /// Number of calls of `class` made at or after `since`.
    fn count_api_calls(&self, class: CallClass, since: i64) -> Result<u64>;

    /// Time of the first call of `class` made at or after `since`.
    fn oldest_api_call(&self, class: CallClass, since: i64) -> Result<Option<i64>>;

    // === Sources ===

    /// Adds an inactive row for `source` unless the same one is already staged.
    fn stage_source(&self, source_id: &str, name: &str) -> Result<()>;

    /// Replaces the active sources with the staged ones, in one transaction.
    /// Returns the number of active sources afterwards.
    fn activate_staged_sources(&self) -> Result<usize>;

    fn list_sources(&self, active: bool) -> Result<Vec<Source>>;
}

/// SQLite implementation of [`SearchStore`].
#[derive(Clone)]
pub struct SqliteSearchStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSearchStore {
    /// Opens an existing database or creates a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, SEARCHES_VERSIONED_SCHEMAS, "searches")?;
        Ok(SqliteSearchStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = open_in_memory(SEARCHES_VERSIONED_SCHEMAS)?;
        Ok(SqliteSearchStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_search(row: &rusqlite::Row) -> rusqlite::Result<Search> {
        Ok(Search {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            query: row.get("query")?,
            filters: Vec::new(),
            formats: Vec::new(),
            state: SearchState::from_str(&row.get::<_, String>("state")?)
                .unwrap_or(SearchState::Failed),
            skip_value: row.get("skip_value")?,
            num_results_downloaded: row.get("num_results_downloaded")?,
            num_results_in_search: row.get("num_results_in_search")?,
            submitted_at: row.get("submitted_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_download_at: row.get("completed_download_at")?,
            started_compression_at: row.get("started_compression_at")?,
            completed_compression_at: row.get("completed_compression_at")?,
            failed_at: row.get("failed_at")?,
            retry_count: row.get("retry_count")?,
            error_message: row.get("error_message")?,
            notified: row.get::<_, i64>("notified")? != 0,
            run_time_seconds: row.get("run_time_seconds")?,
            last_save_dir: row.get("last_save_dir")?,
        })
    }

    /// Fill in filters and formats of searches loaded from the main table.
    fn load_children(conn: &Connection, search: &mut Search) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            "SELECT filter_name, filter_value FROM search_filters WHERE search_id = ?1 ORDER BY id",
        )?;
        search.filters = stmt
            .query_map([search.id], |row| {
                Ok(SearchFilter::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut stmt = conn
            .prepare_cached("SELECT format FROM search_formats WHERE search_id = ?1 ORDER BY id")?;
        let names: Vec<String> = stmt
            .query_map([search.id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        search.formats = names
            .iter()
            .filter_map(|name| OutputFormat::from_str(name))
            .collect();
        Ok(())
    }

    fn query_searches(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Search>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let mut searches = stmt
            .query_map(params, Self::row_to_search)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for search in searches.iter_mut() {
            Self::load_children(&conn, search)?;
        }
        Ok(searches)
    }

    fn row_to_api_limit(row: &rusqlite::Row) -> rusqlite::Result<ApiLimit> {
        let class_name: String = row.get("call_class")?;
        let class = CallClass::from_str(&class_name).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(0, class_name.clone(), rusqlite::types::Type::Text)
        })?;
        Ok(ApiLimit {
            class,
            per_minute: RateCounter {
                limit: row.get("limit_per_minute")?,
                remaining: row.get("remaining_per_minute")?,
                reset_at: row.get("reset_on_minute")?,
            },
            per_hour: RateCounter {
                limit: row.get("limit_per_hour")?,
                remaining: row.get("remaining_per_hour")?,
                reset_at: row.get("reset_on_hour")?,
            },
            per_day: RateCounter {
                limit: row.get("limit_per_day")?,
                remaining: row.get("remaining_per_day")?,
                reset_at: row.get("reset_on_day")?,
            },
            updated_at: row.get("updated_at")?,
        })
    }
}

impl SearchStore for SqliteSearchStore {
    // === Searches ===

    fn create_search(&self, search: &Search) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            r#"INSERT INTO searches (
                user_id, query, state, skip_value, num_results_downloaded,
                num_results_in_search, submitted_at, updated_at, started_at,
                completed_download_at, started_compression_at, completed_compression_at,
                failed_at, retry_count, error_message, notified, run_time_seconds,
                last_save_dir
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18
            )"#,
            params![
                search.user_id,
                search.query,
                search.state.as_str(),
                search.skip_value,
                search.num_results_downloaded,
                search.num_results_in_search,
                search.submitted_at,
                search.updated_at,
                search.started_at,
                search.completed_download_at,
                search.started_compression_at,
                search.completed_compression_at,
                search.failed_at,
                search.retry_count,
                search.error_message,
                search.notified as i64,
                search.run_time_seconds,
                search.last_save_dir,
            ],
        )?;
        let id = tx.last_insert_rowid();

        for filter in &search.filters {
            tx.execute(
                "INSERT INTO search_filters (search_id, filter_name, filter_value) VALUES (?1, ?2, ?3)",
                params![id, filter.name, filter.value],
            )?;
        }
        for format in &search.formats {
            tx.execute(
                "INSERT INTO search_formats (search_id, format) VALUES (?1, ?2)",
                params![id, format.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    fn get_search(&self, id: i64) -> Result<Option<Search>> {
        let conn = self.conn.lock().unwrap();
        let search = conn
            .query_row(
                "SELECT * FROM searches WHERE id = ?1",
                [id],
                Self::row_to_search,
            )
            .optional()?;
        match search {
            Some(mut search) => {
                Self::load_children(&conn, &mut search)?;
                Ok(Some(search))
            }
            None => Ok(None),
        }
    }

    fn list_download_queue(&self) -> Result<Vec<Search>> {
        self.query_searches(
            r#"SELECT * FROM searches
               WHERE state IN ('QUEUED', 'IN_PROGRESS')
               ORDER BY updated_at ASC, id ASC"#,
            [],
        )
    }

    fn list_ready_for_compression(&self) -> Result<Vec<Search>> {
        self.query_searches(
            r#"SELECT * FROM searches
               WHERE state = 'PREPARING_OUTPUT'
               ORDER BY updated_at ASC, id ASC"#,
            [],
        )
    }

    fn list_due_for_deletion(&self, cutoff: i64) -> Result<Vec<Search>> {
        self.query_searches(
            r#"SELECT * FROM searches
               WHERE state = 'DELETED'
                  OR (state = 'COMPLETED' AND completed_compression_at <= ?1)
                  OR (state = 'FAILED' AND failed_at <= ?1)
               ORDER BY updated_at ASC, id ASC"#,
            [cutoff],
        )
    }

    fn save_search(&self, search: &Search) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            r#"UPDATE searches SET
                state = ?2, skip_value = ?3, num_results_downloaded = ?4,
                num_results_in_search = ?5, updated_at = ?6, started_at = ?7,
                completed_download_at = ?8, started_compression_at = ?9,
                completed_compression_at = ?10, failed_at = ?11, retry_count = ?12,
                error_message = ?13, notified = ?14, run_time_seconds = ?15,
                last_save_dir = ?16
               WHERE id = ?1"#,
            params![
                search.id,
                search.state.as_str(),
                search.skip_value,
                search.num_results_downloaded,
                search.num_results_in_search,
                search.updated_at,
                search.started_at,
                search.completed_download_at,
                search.started_compression_at,
                search.completed_compression_at,
                search.failed_at,
                search.retry_count,
                search.error_message,
                search.notified as i64,
                search.run_time_seconds,
                search.last_save_dir,
            ],
        )?;
        if updated == 0 {
            anyhow::bail!("Search {} no longer exists", search.id);
        }
        Ok(())
    }

    fn mark_compression_complete(&self, id: i64, now: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            r#"UPDATE searches SET
                state = 'COMPLETED', completed_compression_at = ?2,
                notified = 1, updated_at = ?2
               WHERE id = ?1 AND state = 'PREPARING_OUTPUT' AND notified = 0"#,
            params![id, now],
        )?;
        Ok(updated == 1)
    }

    fn delete_with_history(&self, search: &Search, now: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            r#"INSERT INTO historical_searches (
                search_id, query, final_state, num_results_downloaded,
                num_results_in_search, submitted_at, started_at, completed_download_at,
                completed_compression_at, failed_at, retry_count, error_message,
                run_time_seconds, deleted_at, user_id, skip_value, updated_at,
                started_compression_at, notified, last_save_dir
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20
            )"#,
            params![
                search.id,
                search.query,
                search.state.as_str(),
                search.num_results_downloaded,
                search.num_results_in_search,
                search.submitted_at,
                search.started_at,
                search.completed_download_at,
                search.completed_compression_at,
                search.failed_at,
                search.retry_count,
                search.error_message,
                search.run_time_seconds,
                now,
                search.user_id,
                search.skip_value,
                search.updated_at,
                search.started_compression_at,
                search.notified as i64,
                search.last_save_dir,
            ],
        )?;
        tx.execute("DELETE FROM searches WHERE id = ?1", [search.id])
            .with_context(|| format!("Failed to delete search {}", search.id))?;
        tx.commit()?;
        Ok(())
    }

    fn get_history(&self, search_id: i64) -> Result<Option<HistoricalSearch>> {
        let conn = self.conn.lock().unwrap();
        let history = conn
            .query_row(
                "SELECT * FROM historical_searches WHERE search_id = ?1 ORDER BY id DESC LIMIT 1",
                [search_id],
                |row| {
                    Ok(HistoricalSearch {
                        search_id: row.get("search_id")?,
                        query: row.get("query")?,
                        final_state: SearchState::from_str(
                            &row.get::<_, String>("final_state")?,
                        )
                        .unwrap_or(SearchState::Deleted),
                        num_results_downloaded: row.get("num_results_downloaded")?,
                        num_results_in_search: row.get("num_results_in_search")?,
                        submitted_at: row.get("submitted_at")?,
                        started_at: row.get("started_at")?,
                        completed_download_at: row.get("completed_download_at")?,
                        completed_compression_at: row.get("completed_compression_at")?,
                        failed_at: row.get("failed_at")?,
                        retry_count: row.get("retry_count")?,
                        error_message: row.get("error_message")?,
                        run_time_seconds: row.get("run_time_seconds")?,
                        deleted_at: row.get("deleted_at")?,
                        user_id: row.get("user_id")?,
                        skip_value: row.get("skip_value")?,
                        updated_at: row.get("updated_at")?,
                        started_compression_at: row.get("started_compression_at")?,
                        notified: row.get::<_, i64>("notified")? != 0,
                        last_save_dir: row.get("last_save_dir")?,
                    })
                },
            )
            .optional()?;
        Ok(history)
    }

    // === Rate-limit ledger ===

    fn get_api_limit(&self, class: CallClass) -> Result<Option<ApiLimit>> {
        let conn = self.conn.lock().unwrap();
        let limit = conn
            .query_row(
                "SELECT * FROM api_limits WHERE call_class = ?1",
                [class.as_str()],
                Self::row_to_api_limit,
            )
            .optional()?;
        Ok(limit)
    }

    fn put_api_limit(&self, limit: &ApiLimit) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT OR REPLACE INTO api_limits (
                call_class, limit_per_minute, limit_per_hour, limit_per_day,
                remaining_per_minute, remaining_per_hour, remaining_per_day,
                reset_on_minute, reset_on_hour, reset_on_day, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                limit.class.as_str(),
                limit.per_minute.limit,
                limit.per_hour.limit,
                limit.per_day.limit,
                limit.per_minute.remaining,
                limit.per_hour.remaining,
                limit.per_day.remaining,
                limit.per_minute.reset_at,
                limit.per_hour.reset_at,
                limit.per_day.reset_at,
                limit.updated_at,
            ],
        )?;
        Ok(())
    }

    // === API call log ===

    fn log_api_call(&self, record: &ApiCallRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO api_call_log (
                call_class, request_url, response_code, num_results, requested_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                record.class.as_str(),
                record.request_url,
                record.response_code,
                record.num_results,
                record.requested_at,
            ],
        )?;
        Ok(())
    }

    fn count_api_calls(&self, class: CallClass, since: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM api_call_log WHERE call_class = ?1 AND requested_at >= ?2",
            params![class.as_str(), since],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn oldest_api_call(&self, class: CallClass, since: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let oldest: Option<i64> = conn.query_row(
            "SELECT MIN(requested_at) FROM api_call_log WHERE call_class = ?1 AND requested_at >= ?2",
            params![class.as_str(), since],
            |row| row.get(0),
        )?;
        Ok(oldest)
    }

    // === Sources ===

    fn stage_source(&self, source_id: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO sources (source_id, source_name, active)
               SELECT ?1, ?2, 0
               WHERE NOT EXISTS (
                   SELECT 1 FROM sources WHERE source_id = ?1 AND source_name = ?2 AND active = 0
               )"#,
            params![source_id, name],
        )?;
        Ok(())
    }

    fn activate_staged_sources(&self) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sources WHERE active = 1", [])?;
        let activated = tx.execute("UPDATE sources SET active = 1", [])?;
        tx.commit()?;
        Ok(activated)
    }

    fn list_sources(&self, active: bool) -> Result<Vec<Source>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_id, source_name, active FROM sources WHERE active = ?1 ORDER BY id",
        )?;
        let sources = stmt
            .query_map([active as i64], |row| {
                Ok(Source {
                    source_id: row.get(0)?,
                    name: row.get(1)?,
                    active: row.get::<_, i64>(2)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sources)
    }
}
