//! Search jobs and their persistent store.

pub mod models;
pub mod schema;
mod store;

pub use models::{
    HistoricalSearch, InvalidTransition, OutputFormat, PageProgress, Search, SearchFilter,
    SearchState, Source,
};
pub use store::{ApiCallRecord, SearchStore, SqliteSearchStore};
