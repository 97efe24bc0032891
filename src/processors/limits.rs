//! One-shot refresh of the quota ledger from the API's own headers.

use crate::api::ContentApi;
use crate::rate_limit::{ApiLimit, CallClass, RateLimitLedger};
use crate::searches::{ApiCallRecord, SearchStore};
use anyhow::{bail, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Makes one minimal call per class and stores the quota the API reports.
/// Fails only when no class could be refreshed.
pub async fn update_limits(api: &dyn ContentApi, store: Arc<dyn SearchStore>) -> Result<Vec<ApiLimit>> {
    info!("Starting refresh of API rate limits");
    if let Err(e) = api.authenticate().await {
        bail!("Could not authenticate against the API: {}", e);
    }

    let ledger = RateLimitLedger::new(store.clone(), HashMap::new());
    let mut updated = Vec::new();
    for class in CallClass::ALL {
        let now = Utc::now().timestamp();
        let response = match api.sample_quota(class).await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to get the limits for {}: {}", class.as_str(), e);
                continue;
            }
        };

        let record = ApiCallRecord {
            class,
            request_url: response.request_url.clone(),
            response_code: Some(response.status),
            num_results: 0,
            requested_at: now,
        };
        if let Err(e) = store.log_api_call(&record) {
            warn!("Failed to record API call: {:#}", e);
        }

        let Some(headers) = &response.rate_limits else {
            error!("No rate-limit headers returned for {}", class.as_str());
            continue;
        };
        match ledger.update_limit(class, headers, now) {
            Ok(limit) => {
                info!(
                    "Updated limits for {} to {}/minute, {}/hour, {}/day",
                    class.as_str(),
                    limit.per_minute.limit,
                    limit.per_hour.limit,
                    limit.per_day.limit
                );
                updated.push(limit);
            }
            Err(e) => error!("Unable to store limits for {}: {}", class.as_str(), e),
        }
    }

    if updated.is_empty() {
        bail!("No rate limits could be refreshed");
    }
    info!("Completed refresh of API rate limits");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, ApiResponse, DownloadRequest, ResultPage};
    use crate::rate_limit::RateLimitHeaders;
    use crate::searches::SqliteSearchStore;
    use async_trait::async_trait;

    struct QuotaApi;

    #[async_trait]
    impl ContentApi for QuotaApi {
        async fn authenticate(&self) -> Result<(), ApiError> {
            Ok(())
        }

        async fn download(&self, _request: &DownloadRequest) -> Result<ApiResponse, ApiError> {
            unimplemented!()
        }

        async fn sources(&self, _skip: i64, _top: i64) -> Result<ApiResponse, ApiError> {
            unimplemented!()
        }

        async fn sample_quota(&self, class: CallClass) -> Result<ApiResponse, ApiError> {
            let rate_limits = match class {
                CallClass::Search => Some(RateLimitHeaders::new("10/100/1000", "9/99/999", "60/3600/86400")),
                CallClass::Download => Some(RateLimitHeaders::new("3/50/800", "3/50/800", "60/3600/86400")),
                CallClass::Sources => None,
            };
            Ok(ApiResponse {
                request_url: format!("test://{}", class.as_str()),
                status: 200,
                page: ResultPage::default(),
                rate_limits,
            })
        }
    }

    #[tokio::test]
    async fn test_update_limits_stores_reported_quota() {
        let store = Arc::new(SqliteSearchStore::in_memory().unwrap());
        let updated = update_limits(&QuotaApi, store.clone()).await.unwrap();
        assert_eq!(updated.len(), 2);

        let download = store.get_api_limit(CallClass::Download).unwrap().unwrap();
        assert_eq!(download.per_minute.limit, 3);
        assert_eq!(download.per_hour.limit, 50);
        assert_eq!(download.per_day.limit, 800);
        assert!(store.get_api_limit(CallClass::Sources).unwrap().is_none());
        assert_eq!(store.count_api_calls(CallClass::Search, 0).unwrap(), 1);
    }
}
