//! Cancellation-aware retry helpers.
//!
//! All long-running operations in the watchdog go through one of these
//! helpers so that a cancelled worker never sleeps past its own removal.
//! [`retry`] is the bounded variant used for scale operations;
//! [`retry_on_error`] retries forever and is used where giving up is not
//! an option, such as re-creating a pod watch.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Result, WatchdogError};

/// Retry predicate that never gives up on an error.
pub fn always_retry(_err: &WatchdogError) -> bool {
    true
}

/// Sleeps for `duration`, returning early with [`WatchdogError::Cancelled`]
/// if the token fires first.
pub async fn sleep_with_cancel(token: &CancellationToken, duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = token.cancelled() => Err(WatchdogError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Invokes `f` up to `attempts` times with a fixed `backoff` between failures.
///
/// Returns on the first success, when `can_retry` rejects an error, after the
/// final attempt, or when `token` is cancelled. No sleep happens after the
/// terminal attempt. A token that is already cancelled at entry returns
/// immediately without invoking `f`.
pub async fn retry<T, F, Fut, P>(
    token: &CancellationToken,
    operation: &str,
    mut f: F,
    attempts: u32,
    backoff: Duration,
    can_retry: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&WatchdogError) -> bool,
{
    let mut last_err = WatchdogError::Configuration(format!(
        "operation {:?} retried with zero attempts",
        operation
    ));
    for attempt in 1..=attempts {
        if token.is_cancelled() {
            error!(operation, "context has been cancelled, stopping retry");
            return Err(WatchdogError::Cancelled);
        }
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !can_retry(&err) {
                    error!(
                        operation,
                        attempt,
                        error = %err,
                        "exiting retry as the error is not retriable"
                    );
                    return Err(err);
                }
                if attempt < attempts {
                    debug!(
                        operation,
                        attempt,
                        error = %err,
                        "operation failed, will retry after backoff"
                    );
                    sleep_with_cancel(token, backoff).await?;
                }
                last_err = err;
            }
        }
    }
    Err(last_err)
}

/// Retries `f` until it succeeds or `token` is cancelled, sleeping `interval`
/// between failures. The caller bounds the loop through the token; there is
/// no attempt limit.
pub async fn retry_on_error<T, F, Fut>(
    token: &CancellationToken,
    operation: &str,
    mut f: F,
    interval: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        if token.is_cancelled() {
            debug!(operation, "context has been cancelled, exiting retry");
            return Err(WatchdogError::Cancelled);
        }
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                error!(operation, error = %err, "error encountered, will re-attempt");
                sleep_with_cancel(token, interval).await?;
            }
        }
    }
}
