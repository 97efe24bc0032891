//! API quota tracking and the download schedule.

pub mod ledger;
pub mod throttle;
pub mod window;

pub use ledger::{
    ApiLimit, CallClass, LedgerError, RateCounter, RateLimitError, RateLimitHeaders,
    RateLimitLedger, RateWindow,
};
pub use throttle::{GateDecision, GateError, ThrottleGate};
pub use window::{DailyWindow, ProcessingWindow};
