//! User notifications for finished and failed searches.

use crate::searches::Search;
use tracing::info;

#[cfg_attr(feature = "mock", mockall::automock)]
pub trait Notifier: Send + Sync {
    /// The archive of `search` is ready for download.
    fn notify_completed(&self, search: &Search);

    /// `search` was given up on, `search.error_message` says why.
    fn notify_failed(&self, search: &Search);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_completed(&self, search: &Search) {
        info!(
            user_id = %search.user_id,
            search_id = search.id,
            "Search {:?} is ready: {} results",
            search.query,
            search.num_results_downloaded
        );
    }

    fn notify_failed(&self, search: &Search) {
        info!(
            user_id = %search.user_id,
            search_id = search.id,
            "Search {:?} failed: {}",
            search.query,
            search.error_message.as_deref().unwrap_or("unknown error")
        );
    }
}
