//! Retry bookkeeping for infrastructure failures.
//!
//! Each failure domain keeps its own counter. A failure below the ceiling
//! means wait a fixed backoff and try the next tick, going over it stops the
//! processor. Internal failures stop it right away.

use crate::config::{RetriesSettings, RetrySettings};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureDomain {
    Storage,
    Database,
    Api,
    Auth,
    Filesystem,
    /// Broken bookkeeping invariant, e.g. an illegal state transition.
    /// Never retried.
    Internal,
}

impl FailureDomain {
    /// Domains with a configurable retry policy.
    pub const ALL: [FailureDomain; 5] = [
        FailureDomain::Storage,
        FailureDomain::Database,
        FailureDomain::Api,
        FailureDomain::Auth,
        FailureDomain::Filesystem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureDomain::Storage => "storage",
            FailureDomain::Database => "database",
            FailureDomain::Api => "api",
            FailureDomain::Auth => "auth",
            FailureDomain::Filesystem => "filesystem",
            FailureDomain::Internal => "internal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == s)
    }
}

impl fmt::Display for FailureDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A processor step that failed for reasons outside the search itself.
#[derive(Debug, Error)]
#[error("{domain} failure: {error:#}")]
pub struct StepError {
    pub domain: FailureDomain,
    pub error: anyhow::Error,
}

impl StepError {
    pub fn new(domain: FailureDomain, error: impl Into<anyhow::Error>) -> Self {
        Self {
            domain,
            error: error.into(),
        }
    }
}

/// Result of one pass through a processor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing to do, or the work was put off.
    Idle,
    /// A search moved forward.
    Worked,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures tolerated in a row before giving up.
    pub max_retries: u32,
    /// Fixed delay before the next attempt.
    pub backoff_secs: u64,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff_secs: settings.backoff_secs,
        }
    }

    /// True while `failures` consecutive failures are still within the limit.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Backoff(Duration),
    Escalate { failures: u32 },
}

/// Consecutive failure counts per domain.
#[derive(Debug, Clone)]
pub struct RetryCounters {
    policies: HashMap<FailureDomain, RetryPolicy>,
    failures: HashMap<FailureDomain, u32>,
}

impl RetryCounters {
    pub fn new(settings: &RetriesSettings) -> Self {
        let policies = FailureDomain::ALL
            .into_iter()
            .chain([FailureDomain::Internal])
            .map(|d| (d, RetryPolicy::new(&settings.get(d))))
            .collect();
        Self {
            policies,
            failures: HashMap::new(),
        }
    }

    pub fn record(&mut self, domain: FailureDomain) -> RetryDecision {
        let failures = self.failures.entry(domain).or_insert(0);
        *failures += 1;
        let policy = self.policies.get(&domain).copied().unwrap_or_default();
        if policy.should_retry(*failures) {
            RetryDecision::Backoff(policy.backoff())
        } else {
            RetryDecision::Escalate {
                failures: *failures,
            }
        }
    }

    /// Clears the counter after the domain worked again.
    pub fn reset(&mut self, domain: FailureDomain) {
        self.failures.remove(&domain);
    }

    pub fn failures(&self, domain: FailureDomain) -> u32 {
        self.failures.get(&domain).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RetriesSettings {
        let mut settings = RetriesSettings::default();
        settings.database = RetrySettings {
            max_retries: 2,
            backoff_secs: 5,
        };
        settings.storage = RetrySettings {
            max_retries: 0,
            backoff_secs: 1,
        };
        settings
    }

    #[test]
    fn test_domain_names() {
        for domain in FailureDomain::ALL {
            assert_eq!(FailureDomain::from_str(domain.as_str()), Some(domain));
        }
        assert_eq!(FailureDomain::from_str("databse"), None);
        assert_eq!(FailureDomain::from_str("internal"), None);
    }

    #[test]
    fn test_escalates_after_max_retries() {
        let mut counters = RetryCounters::new(&settings());

        assert_eq!(
            counters.record(FailureDomain::Database),
            RetryDecision::Backoff(Duration::from_secs(5))
        );
        assert_eq!(
            counters.record(FailureDomain::Database),
            RetryDecision::Backoff(Duration::from_secs(5))
        );
        assert_eq!(
            counters.record(FailureDomain::Database),
            RetryDecision::Escalate { failures: 3 }
        );
    }

    #[test]
    fn test_zero_retries_escalates_immediately() {
        let mut counters = RetryCounters::new(&settings());
        assert_eq!(
            counters.record(FailureDomain::Storage),
            RetryDecision::Escalate { failures: 1 }
        );
    }

    #[test]
    fn test_internal_failures_are_never_retried() {
        let mut settings = settings();
        settings.database.max_retries = 10;
        let mut counters = RetryCounters::new(&settings);
        assert_eq!(
            counters.record(FailureDomain::Internal),
            RetryDecision::Escalate { failures: 1 }
        );
    }

    #[test]
    fn test_domains_are_independent_and_reset() {
        let mut counters = RetryCounters::new(&settings());
        counters.record(FailureDomain::Database);
        counters.record(FailureDomain::Database);
        counters.record(FailureDomain::Api);

        assert_eq!(counters.failures(FailureDomain::Database), 2);
        assert_eq!(counters.failures(FailureDomain::Api), 1);

        counters.reset(FailureDomain::Database);
        assert_eq!(counters.failures(FailureDomain::Database), 0);
        assert_eq!(counters.failures(FailureDomain::Api), 1);
        assert!(matches!(
            counters.record(FailureDomain::Database),
            RetryDecision::Backoff(_)
        ));
    }

    #[test]
    fn test_step_error_display_keeps_context() {
        let err = StepError::new(
            FailureDomain::Storage,
            anyhow::anyhow!("disk gone").context("Storage root check failed"),
        );
        assert_eq!(
            err.to_string(),
            "storage failure: Storage root check failed: disk gone"
        );
    }
}
