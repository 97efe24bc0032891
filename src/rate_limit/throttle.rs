//! Throttle gate.
//!
//! Decides when the next call of a class may go out, from the ledger and,
//! for downloads, the processing window. The gate only reads: it never
//! touches the ledger, so a response that lands in between is respected on
//! the next check.

use super::ledger::{CallClass, RateLimitLedger, RateWindow};
use super::window::ProcessingWindow;
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Store(#[from] anyhow::Error),
    /// The ledger holds a reset time no clock can represent.
    #[error("reset timestamp {0} out of range")]
    ResetOutOfRange(i64),
    #[error("cannot resolve local time {0}")]
    UnresolvableTime(NaiveDateTime),
}

/// Outcome of a gate check, with the reasons for any wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub available_at: DateTime<Local>,
    /// Counters that are used up right now.
    pub exhausted: Vec<RateWindow>,
    /// Only ever set for downloads.
    pub outside_window: bool,
}

impl GateDecision {
    pub fn is_open(&self, now: DateTime<Local>) -> bool {
        self.available_at <= now
    }
}

#[derive(Clone)]
pub struct ThrottleGate {
    ledger: RateLimitLedger,
    window: ProcessingWindow,
}

impl ThrottleGate {
    pub fn new(ledger: RateLimitLedger, window: ProcessingWindow) -> Self {
        Self { ledger, window }
    }

    pub fn ledger(&self) -> &RateLimitLedger {
        &self.ledger
    }

    /// Time at which a call of `class` may be made. Equal to `now` when
    /// nothing blocks it.
    pub fn available_at(
        &self,
        class: CallClass,
        now: DateTime<Local>,
    ) -> Result<DateTime<Local>, GateError> {
        Ok(self.check(class, now)?.available_at)
    }

    pub fn check(&self, class: CallClass, now: DateTime<Local>) -> Result<GateDecision, GateError> {
        let ts = now.timestamp();
        let limit = self.ledger.effective_limit(class, ts)?;

        let exhausted: Vec<RateWindow> = limit
            .counters()
            .iter()
            .filter(|(_, counter)| counter.is_exhausted(ts))
            .map(|(window, _)| *window)
            .collect();

        let mut available_at = now;
        if let Some(reset) = limit.earliest_exhausted_reset(ts) {
            available_at = DateTime::from_timestamp(reset, 0)
                .ok_or(GateError::ResetOutOfRange(reset))?
                .with_timezone(&Local);
        }

        let mut outside_window = false;
        if class == CallClass::Download {
            let (inside, next_start) = self.window.in_window(now.naive_local());
            if !inside {
                outside_window = true;
                available_at = available_at.max(to_local(next_start)?);
            }
        }

        Ok(GateDecision {
            available_at,
            exhausted,
            outside_window,
        })
    }
}

/// Resolves a wall-clock time, skipping forward over a DST gap.
fn to_local(naive: NaiveDateTime) -> Result<DateTime<Local>, GateError> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            Local
                .from_local_datetime(&(naive + Duration::hours(1)))
                .earliest()
        })
        .ok_or(GateError::UnresolvableTime(naive))
}
