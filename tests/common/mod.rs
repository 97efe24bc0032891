//! Common test infrastructure
//!
//! Processors are driven tick by tick against a scripted content API and a
//! store wrapper that can fail saves on demand.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{test_config, FakeContentApi, FlakyStore, RecordingNotifier};
//!
//! #[tokio::test]
//! async fn test_download() {
//!     let temp = tempfile::TempDir::new().unwrap();
//!     let store = FlakyStore::shared();
//!     let api = FakeContentApi::shared(25);
//!     // build a DownloadProcessor from test_config(temp.path()) and tick it
//! }
//! ```

mod fake_api;
mod fixtures;

pub use fake_api::FakeContentApi;
#[allow(unused_imports)]
pub use fixtures::{count_files, queue_search, test_config, FlakyStore, RecordingNotifier};
