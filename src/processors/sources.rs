//! One-shot refresh of the searchable sources list.
//!
//! Pages through the `Sources` resource, staging every entry next to the
//! current list. The staged rows replace the active ones in one transaction
//! once the last page is in, so searches never see a half-built list.

use super::{sleep_or_shutdown, wait_for_gate};
use crate::api::{ContentApi, SourceEntry};
use crate::config::AppConfig;
use crate::rate_limit::{CallClass, RateLimitLedger, ThrottleGate};
use crate::searches::{ApiCallRecord, SearchStore};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SOURCES_PAGE_SIZE: i64 = 100;

/// Downloads the full sources list starting at `start_skip` and makes it the
/// active one. Returns the number of active sources.
pub async fn update_sources(
    api: &dyn ContentApi,
    store: Arc<dyn SearchStore>,
    config: &AppConfig,
    shutdown: &CancellationToken,
    start_skip: i64,
) -> Result<usize> {
    info!("Starting refresh of the sources list at skip {}", start_skip);
    if let Err(e) = api.authenticate().await {
        bail!("Could not authenticate against the API: {}", e);
    }

    let gate = ThrottleGate::new(
        RateLimitLedger::new(store.clone(), config.limit_overrides.clone()),
        config.window,
    );
    let backoff = Duration::from_secs(config.retries.api.backoff_secs);
    let mut skip = start_skip;
    let mut staged = 0usize;

    loop {
        if !wait_for_gate(&gate, CallClass::Sources, config.processing.wait_slice(), shutdown).await? {
            bail!("Sources refresh interrupted at skip {}, staged rows kept", skip);
        }

        let response = match api.sources(skip, SOURCES_PAGE_SIZE).await {
            Ok(response) => response,
            Err(e) => {
                if let Some(url) = e.url() {
                    log_call(store.as_ref(), url, e.status(), 0);
                }
                if e.status() != Some(429) {
                    return Err(e).with_context(|| format!("Failed to fetch sources at skip {}", skip));
                }
                warn!("Sources quota used up at skip {}: {}", skip, e);
                let recorded = match e.rate_limits() {
                    Some(headers) => match gate.ledger().update_limit(
                        CallClass::Sources,
                        headers,
                        Utc::now().timestamp(),
                    ) {
                        Ok(_) => true,
                        Err(err) => {
                            warn!("Ignoring quota headers of failed sources call: {}", err);
                            false
                        }
                    },
                    None => false,
                };
                if !recorded && !sleep_or_shutdown(backoff, shutdown).await {
                    bail!("Sources refresh interrupted at skip {}, staged rows kept", skip);
                }
                continue;
            }
        };

        log_call(
            store.as_ref(),
            &response.request_url,
            Some(response.status),
            response.page.returned(),
        );
        match &response.rate_limits {
            Some(headers) => {
                if let Err(e) =
                    gate.ledger()
                        .update_limit(CallClass::Sources, headers, Utc::now().timestamp())
                {
                    warn!("Sources quota headers unusable: {}", e);
                }
            }
            None => warn!("Sources response carried no quota headers"),
        }

        for item in &response.page.value {
            let Some(entry) = SourceEntry::from_value(item) else {
                warn!("Skipping source without Id or Name: {}", item);
                continue;
            };
            store
                .stage_source(&entry.id, &entry.name)
                .with_context(|| format!("Failed to stage source {}", entry.id))?;
            staged += 1;
        }

        skip += response.page.returned();
        debug!("Staged {} sources, {} of {}", staged, skip, response.page.total);
        if response.page.returned() == 0 || skip >= response.page.total {
            break;
        }
    }

    let active = store
        .activate_staged_sources()
        .context("Failed to activate the refreshed sources")?;
    info!("Completed refresh of the sources list, {} active", active);
    Ok(active)
}

fn log_call(store: &dyn SearchStore, request_url: &str, status: Option<u16>, num_results: i64) {
    let record = ApiCallRecord {
        class: CallClass::Sources,
        request_url: request_url.to_string(),
        response_code: status,
        num_results,
        requested_at: Utc::now().timestamp(),
    };
    if let Err(e) = store.log_api_call(&record) {
        warn!("Failed to record API call: {:#}", e);
    }
}
