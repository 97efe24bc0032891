//! The long-running processors: download queue, compression and deletion,
//! plus the one-shot quota and sources refreshes.

mod compression;
mod deletion;
mod download;
mod limits;
mod retry;
mod sources;

pub use compression::CompressionProcessor;
pub use deletion::DeletionProcessor;
pub use download::DownloadProcessor;
pub use limits::update_limits;
pub use sources::update_sources;
pub use retry::{
    FailureDomain, RetryCounters, RetryDecision, RetryPolicy, StepError, Tick,
};

use crate::rate_limit::{CallClass, GateError, ThrottleGate};
use chrono::Local;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sleeps for `duration`. Returns false when shutdown was requested first.
pub(crate) async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.cancelled() => false,
    }
}

/// Waits until a call of `class` may go out, re-checking the gate at least
/// every `wait_slice`. Returns false on shutdown.
pub(crate) async fn wait_for_gate(
    gate: &ThrottleGate,
    class: CallClass,
    wait_slice: Duration,
    shutdown: &CancellationToken,
) -> Result<bool, StepError> {
    let mut waiting = false;
    loop {
        let now = Local::now();
        let decision = gate.check(class, now).map_err(gate_failure)?;
        if decision.is_open(now) {
            if waiting {
                info!("Resuming {} calls", class.as_str());
            }
            return Ok(true);
        }
        if !waiting {
            info!(
                "No {} calls available until {} (exhausted: {:?}, outside window: {})",
                class.as_str(),
                decision.available_at.format("%A %H:%M:%S"),
                decision.exhausted,
                decision.outside_window
            );
            waiting = true;
        }
        let remaining = (decision.available_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if !sleep_or_shutdown(remaining.min(wait_slice), shutdown).await {
            return Ok(false);
        }
    }
}

/// A failed ledger read is a database failure. A ledger the gate cannot
/// interpret is internal and stops the processor.
pub(crate) fn gate_failure(err: GateError) -> StepError {
    match err {
        GateError::Store(e) => StepError::new(FailureDomain::Database, e),
        other => StepError::new(FailureDomain::Internal, other),
    }
}

/// Routes a failed step through the retry counters. Returns the error to
/// stop with once the domain has run out of retries, otherwise waits out the
/// backoff.
pub(crate) async fn back_off(
    name: &str,
    counters: &mut RetryCounters,
    err: StepError,
    shutdown: &CancellationToken,
) -> Result<(), anyhow::Error> {
    match counters.record(err.domain) {
        RetryDecision::Backoff(delay) => {
            warn!(
                "{} processor: {} (attempt {}), retrying in {}s",
                name,
                err,
                counters.failures(err.domain),
                delay.as_secs()
            );
            sleep_or_shutdown(delay, shutdown).await;
            Ok(())
        }
        RetryDecision::Escalate { failures } => {
            error!(
                "Stopping {} processor after {} consecutive {} failures: {}",
                name, failures, err.domain, err
            );
            Err(err.into())
        }
    }
}
