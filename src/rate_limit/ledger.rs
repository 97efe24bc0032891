//! Rate-limit ledger.
//!
//! Keeps the last quota reported by the content API for each call class.
//! Remaining counters are only ever written from response headers, the
//! ledger never decrements them locally. Configured limits are enforced on
//! top of that by counting the logged calls in each window.

use crate::config::LimitOverride;
use crate::searches::SearchStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RESET_HEADER: &str = "X-RateLimit-Reset";

/// Independently rate-limited category of API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallClass {
    Search,
    Download,
    Sources,
}

impl CallClass {
    pub const ALL: [CallClass; 3] = [CallClass::Search, CallClass::Download, CallClass::Sources];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallClass::Search => "SEARCH",
            CallClass::Download => "DOWNLOAD",
            CallClass::Sources => "SOURCES",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SEARCH" => Some(CallClass::Search),
            "DOWNLOAD" => Some(CallClass::Download),
            "SOURCES" => Some(CallClass::Sources),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    Minute,
    Hour,
    Day,
}

impl RateWindow {
    pub fn seconds(&self) -> i64 {
        match self {
            RateWindow::Minute => 60,
            RateWindow::Hour => 3_600,
            RateWindow::Day => 86_400,
        }
    }
}

/// Quota of one call class over one time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateCounter {
    pub limit: i64,
    pub remaining: i64,
    /// Unix timestamp at which `remaining` goes back to `limit`.
    pub reset_at: i64,
}

impl RateCounter {
    /// A counter whose reset time has passed is no longer exhausted, the API
    /// has replenished it even if the ledger has not been refreshed yet.
    pub fn is_exhausted(&self, now: i64) -> bool {
        self.remaining <= 0 && self.reset_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiLimit {
    pub class: CallClass,
    pub per_minute: RateCounter,
    pub per_hour: RateCounter,
    pub per_day: RateCounter,
    pub updated_at: i64,
}

impl ApiLimit {
    /// Ledger entry for a class the API has never reported on.
    pub fn unknown(class: CallClass) -> Self {
        Self {
            class,
            per_minute: RateCounter::default(),
            per_hour: RateCounter::default(),
            per_day: RateCounter::default(),
            updated_at: 0,
        }
    }

    pub fn counter_mut(&mut self, window: RateWindow) -> &mut RateCounter {
        match window {
            RateWindow::Minute => &mut self.per_minute,
            RateWindow::Hour => &mut self.per_hour,
            RateWindow::Day => &mut self.per_day,
        }
    }

    pub fn counters(&self) -> [(RateWindow, &RateCounter); 3] {
        [
            (RateWindow::Minute, &self.per_minute),
            (RateWindow::Hour, &self.per_hour),
            (RateWindow::Day, &self.per_day),
        ]
    }

    /// Earliest reset among the exhausted counters, if any is exhausted.
    pub fn earliest_exhausted_reset(&self, now: i64) -> Option<i64> {
        self.counters()
            .iter()
            .filter(|(_, c)| c.is_exhausted(now))
            .map(|(_, c)| c.reset_at)
            .min()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("malformed {header} header: {value:?}")]
    Malformed { header: &'static str, value: String },
    #[error("incomplete rate-limit headers, missing {0}")]
    Missing(&'static str),
}

/// Raw `X-RateLimit-*` header values, each a `minute/hour/day` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: String,
    pub remaining: String,
    pub reset: String,
}

impl RateLimitHeaders {
    pub fn new(
        limit: impl Into<String>,
        remaining: impl Into<String>,
        reset: impl Into<String>,
    ) -> Self {
        Self {
            limit: limit.into(),
            remaining: remaining.into(),
            reset: reset.into(),
        }
    }

    /// Extracts the three headers from a response. Returns `Ok(None)` when the
    /// response carries none of them.
    pub fn from_header_map(
        headers: &reqwest::header::HeaderMap,
    ) -> Result<Option<Self>, RateLimitError> {
        let get = |name: &'static str| -> Result<Option<String>, RateLimitError> {
            match headers.get(name) {
                None => Ok(None),
                Some(value) => value
                    .to_str()
                    .map(|s| Some(s.to_string()))
                    .map_err(|_| RateLimitError::Malformed {
                        header: name,
                        value: format!("{:?}", value),
                    }),
            }
        };

        let limit = get(LIMIT_HEADER)?;
        let remaining = get(REMAINING_HEADER)?;
        let reset = get(RESET_HEADER)?;
        match (limit, remaining, reset) {
            (None, None, None) => Ok(None),
            (Some(limit), Some(remaining), Some(reset)) => {
                Ok(Some(Self::new(limit, remaining, reset)))
            }
            (None, _, _) => Err(RateLimitError::Missing(LIMIT_HEADER)),
            (_, None, _) => Err(RateLimitError::Missing(REMAINING_HEADER)),
            (_, _, None) => Err(RateLimitError::Missing(RESET_HEADER)),
        }
    }

    fn parse(&self, class: CallClass, now: i64) -> Result<ApiLimit, RateLimitError> {
        let limit = parse_triple(LIMIT_HEADER, &self.limit)?;
        let remaining = parse_triple(REMAINING_HEADER, &self.remaining)?;
        let reset = parse_triple(RESET_HEADER, &self.reset)?;
        let counter = |i: usize| RateCounter {
            limit: limit[i],
            remaining: remaining[i],
            reset_at: reset[i],
        };
        Ok(ApiLimit {
            class,
            per_minute: counter(0),
            per_hour: counter(1),
            per_day: counter(2),
            updated_at: now,
        })
    }
}

fn parse_triple(header: &'static str, value: &str) -> Result<[i64; 3], RateLimitError> {
    let malformed = || RateLimitError::Malformed {
        header,
        value: value.to_string(),
    };
    let parts = value
        .split('/')
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| malformed())?;
    match parts.as_slice() {
        [minute, hour, day] => Ok([*minute, *hour, *day]),
        _ => Err(malformed()),
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Malformed(#[from] RateLimitError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Read/write access to the rate-limit ledger rows.
#[derive(Clone)]
pub struct RateLimitLedger {
    store: Arc<dyn SearchStore>,
    overrides: HashMap<CallClass, LimitOverride>,
}

impl RateLimitLedger {
    pub fn new(store: Arc<dyn SearchStore>, overrides: HashMap<CallClass, LimitOverride>) -> Self {
        Self { store, overrides }
    }

    /// Current ledger entry for `class`. Configured limits replace the ones
    /// reported by the API, remaining counters always come from the API.
    pub fn get_limit(&self, class: CallClass) -> anyhow::Result<ApiLimit> {
        let mut limit = self
            .store
            .get_api_limit(class)?
            .unwrap_or_else(|| ApiLimit::unknown(class));
        for (window, value) in self.overridden(class) {
            limit.counter_mut(window).limit = value;
        }
        Ok(limit)
    }

    /// Ledger entry for `class` as the gate sees it at `now`. A window with a
    /// configured limit is also exhausted once the calls logged within it
    /// reach that limit, until the oldest of them falls out of the window.
    pub fn effective_limit(&self, class: CallClass, now: i64) -> anyhow::Result<ApiLimit> {
        let mut limit = self.get_limit(class)?;
        for (window, value) in self.overridden(class) {
            let since = now - window.seconds() + 1;
            let made = self.store.count_api_calls(class, since)? as i64;
            if made < value {
                continue;
            }
            let freed_at = self
                .store
                .oldest_api_call(class, since)?
                .unwrap_or(now)
                + window.seconds();
            let counter = limit.counter_mut(window);
            let reset_at = if counter.is_exhausted(now) {
                counter.reset_at.max(freed_at)
            } else {
                freed_at
            };
            counter.remaining = 0;
            counter.reset_at = reset_at;
            debug!(
                "{} made {} calls in the last {}s, configured limit {}",
                class.as_str(),
                made,
                window.seconds(),
                value
            );
        }
        Ok(limit)
    }

    fn overridden(&self, class: CallClass) -> Vec<(RateWindow, i64)> {
        let Some(o) = self.overrides.get(&class) else {
            return Vec::new();
        };
        [
            (RateWindow::Minute, o.per_minute),
            (RateWindow::Hour, o.per_hour),
            (RateWindow::Day, o.per_day),
        ]
        .into_iter()
        .filter_map(|(window, value)| value.map(|v| (window, v)))
        .collect()
    }

    /// Overwrites the ledger row for `class` with the quota in `headers`.
    pub fn update_limit(
        &self,
        class: CallClass,
        headers: &RateLimitHeaders,
        now: i64,
    ) -> Result<ApiLimit, LedgerError> {
        let limit = headers.parse(class, now)?;
        self.store.put_api_limit(&limit)?;
        debug!(
            "{} quota remaining {}/{}/{} (min/hour/day)",
            class.as_str(),
            limit.per_minute.remaining,
            limit.per_hour.remaining,
            limit.per_day.remaining
        );
        Ok(limit)
    }
}
