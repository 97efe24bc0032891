//! Client side of the external content API.

mod client;
mod error;
pub mod filters;
mod models;

pub use client::HttpContentApi;
pub use error::ApiError;
pub use models::{ApiResponse, DownloadRequest, DownloadedDocument, ResultPage, SourceEntry};

use crate::rate_limit::CallClass;
use async_trait::async_trait;

/// Calls the processors make against the content API.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait ContentApi: Send + Sync {
    /// Obtains a bearer token unless the current one is still valid.
    async fn authenticate(&self) -> Result<(), ApiError>;

    /// Fetches one page of full-text results.
    async fn download(&self, request: &DownloadRequest) -> Result<ApiResponse, ApiError>;

    /// One page of the searchable sources list.
    async fn sources(&self, skip: i64, top: i64) -> Result<ApiResponse, ApiError>;

    /// Smallest possible call of `class`, made for its quota headers.
    async fn sample_quota(&self, class: CallClass) -> Result<ApiResponse, ApiError>;
}
