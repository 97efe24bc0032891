//! Throttled batch processing of full-text searches: downloading result
//! pages within the API quota, archiving finished searches and expiring old
//! ones.

pub mod api;
pub mod config;
pub mod formats;
pub mod notifications;
pub mod processors;
pub mod rate_limit;
pub mod searches;
pub mod sqlite_persistence;
pub mod storage;
