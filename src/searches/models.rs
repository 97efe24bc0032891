//! Search job models.
//!
//! A search moves through a closed set of states. The timestamps stored on
//! the row are side effects of the transitions below, never the other way
//! around.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a search job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchState {
    Queued,
    InProgress,
    PreparingOutput,
    Completed, // terminal until retention expires
    Failed,    // terminal until retention expires
    Deleted,   // flagged by the user, picked up by the deletion processor
}

impl SearchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchState::Queued => "QUEUED",
            SearchState::InProgress => "IN_PROGRESS",
            SearchState::PreparingOutput => "PREPARING_OUTPUT",
            SearchState::Completed => "COMPLETED",
            SearchState::Failed => "FAILED",
            SearchState::Deleted => "DELETED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(SearchState::Queued),
            "IN_PROGRESS" => Some(SearchState::InProgress),
            "PREPARING_OUTPUT" => Some(SearchState::PreparingOutput),
            "COMPLETED" => Some(SearchState::Completed),
            "FAILED" => Some(SearchState::Failed),
            "DELETED" => Some(SearchState::Deleted),
            _ => None,
        }
    }

    /// Returns true while the search belongs to the download queue.
    pub fn is_downloading(&self) -> bool {
        matches!(self, SearchState::Queued | SearchState::InProgress)
    }

    pub fn can_transition_to(&self, next: SearchState) -> bool {
        use SearchState::*;
        match (self, next) {
            (_, Deleted) => *self != Deleted,
            (Queued, InProgress) | (Queued, PreparingOutput) | (Queued, Failed) => true,
            (InProgress, InProgress) | (InProgress, PreparingOutput) | (InProgress, Failed) => {
                true
            }
            (PreparingOutput, Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("search {search_id}: invalid transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub search_id: i64,
    pub from: SearchState,
    pub to: SearchState,
}

/// Requested output format of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputFormat {
    Html,
    Txt,
    TxtOnly, // text extracted from the HTML body
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Html => "HTML",
            OutputFormat::Txt => "TXT",
            OutputFormat::TxtOnly => "TXT_ONLY",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "HTML" => Some(OutputFormat::Html),
            "TXT" => Some(OutputFormat::Txt),
            "TXT_ONLY" | "TXT Only" => Some(OutputFormat::TxtOnly),
            _ => None,
        }
    }

    /// Name of the per-format directory inside a shard.
    pub fn dir_name(&self) -> &'static str {
        match self {
            OutputFormat::Html => "HTML",
            OutputFormat::Txt => "TXT",
            OutputFormat::TxtOnly => "TXT_Only",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Html => "html",
            OutputFormat::Txt | OutputFormat::TxtOnly => "txt",
        }
    }
}

/// One `(name, value)` filter pair attached to a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub name: String,
    pub value: String,
}

impl SearchFilter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Progress reported by one persisted page of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageProgress {
    /// Number of items the API returned for the page.
    pub returned: i64,
    /// Total number of results the API reports for the search.
    pub total_available: i64,
    /// Seconds spent fetching and writing the page.
    pub elapsed_secs: i64,
    /// Shard directory the page was written to, relative to the job root.
    pub last_save_dir: Option<String>,
}

/// A user-submitted search and its processing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Search {
    /// Row id. Zero until the search is inserted.
    pub id: i64,
    pub user_id: String,
    pub query: String,
    /// Filters in submission order.
    pub filters: Vec<SearchFilter>,
    pub formats: Vec<OutputFormat>,
    pub state: SearchState,
    /// Pagination cursor, only ever increases.
    pub skip_value: i64,
    pub num_results_downloaded: i64,
    pub num_results_in_search: i64,
    pub submitted_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_download_at: Option<i64>,
    pub started_compression_at: Option<i64>,
    pub completed_compression_at: Option<i64>,
    pub failed_at: Option<i64>,
    /// API-level failures of this search.
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub notified: bool,
    pub run_time_seconds: i64,
    /// Relative path of the shard the last page was written to.
    pub last_save_dir: Option<String>,
}

impl Search {
    pub fn new(user_id: impl Into<String>, query: impl Into<String>, submitted_at: i64) -> Self {
        Self {
            id: 0,
            user_id: user_id.into(),
            query: query.into(),
            filters: Vec::new(),
            formats: Vec::new(),
            state: SearchState::Queued,
            skip_value: 0,
            num_results_downloaded: 0,
            num_results_in_search: 0,
            submitted_at,
            updated_at: submitted_at,
            started_at: None,
            completed_download_at: None,
            started_compression_at: None,
            completed_compression_at: None,
            failed_at: None,
            retry_count: 0,
            error_message: None,
            notified: false,
            run_time_seconds: 0,
            last_save_dir: None,
        }
    }

    pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(SearchFilter::new(name, value));
        self
    }

    pub fn with_formats(mut self, formats: &[OutputFormat]) -> Self {
        self.formats = formats.to_vec();
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.state == SearchState::Deleted
    }

    fn transition(&mut self, to: SearchState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                search_id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Marks the first time the download processor picks this search up.
    pub fn begin_download(&mut self, now: i64) -> Result<(), InvalidTransition> {
        if self.state == SearchState::InProgress {
            return Ok(());
        }
        self.transition(SearchState::InProgress)?;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// Applies one persisted page. Moves to `PreparingOutput` once every
    /// available result has been downloaded, or when the API hands back an
    /// empty page before reaching its own count.
    pub fn record_page(
        &mut self,
        progress: &PageProgress,
        now: i64,
    ) -> Result<(), InvalidTransition> {
        self.begin_download(now)?;
        self.skip_value += progress.returned;
        self.num_results_downloaded += progress.returned;
        self.num_results_in_search = progress.total_available;
        self.run_time_seconds += progress.elapsed_secs;
        if progress.last_save_dir.is_some() {
            self.last_save_dir = progress.last_save_dir.clone();
        }
        if self.num_results_downloaded >= self.num_results_in_search || progress.returned == 0 {
            self.transition(SearchState::PreparingOutput)?;
            self.completed_download_at = Some(now);
        }
        Ok(())
    }

    /// Counts an error reported by the API for this search. Returns true when
    /// the search has run out of retries and is now failed.
    pub fn record_rejection(
        &mut self,
        message: &str,
        max_retries: i32,
        now: i64,
    ) -> Result<bool, InvalidTransition> {
        self.retry_count += 1;
        self.error_message = Some(message.to_string());
        if self.retry_count > max_retries {
            self.transition(SearchState::Failed)?;
            self.failed_at = Some(now);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn begin_compression(&mut self, now: i64) -> Result<(), InvalidTransition> {
        if self.state != SearchState::PreparingOutput {
            return Err(InvalidTransition {
                search_id: self.id,
                from: self.state,
                to: SearchState::PreparingOutput,
            });
        }
        self.started_compression_at = Some(now);
        Ok(())
    }

    pub fn complete_compression(&mut self, now: i64) -> Result<(), InvalidTransition> {
        self.transition(SearchState::Completed)?;
        self.completed_compression_at = Some(now);
        self.notified = true;
        Ok(())
    }

    pub fn mark_deleted(&mut self) -> Result<(), InvalidTransition> {
        self.transition(SearchState::Deleted)
    }
}

/// Copy of a search kept after its row and files are removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSearch {
    pub search_id: i64,
    pub query: String,
    pub final_state: SearchState,
    pub num_results_downloaded: i64,
    pub num_results_in_search: i64,
    pub submitted_at: i64,
    pub started_at: Option<i64>,
    pub completed_download_at: Option<i64>,
    pub completed_compression_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub run_time_seconds: i64,
    pub deleted_at: i64,
    /// Empty for rows copied before these fields were kept.
    pub user_id: Option<String>,
    pub skip_value: i64,
    pub updated_at: Option<i64>,
    pub started_compression_at: Option<i64>,
    pub notified: bool,
    pub last_save_dir: Option<String>,
}

/// A source the API can be searched by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: String,
    pub name: String,
    pub active: bool,
}
