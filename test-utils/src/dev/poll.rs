// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wait for a condition that is expected to become true eventually, such as
//! the outcome of a fire-and-forget request.

use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Result of one check of the condition
#[derive(Debug, Error)]
pub enum CondCheckError<E> {
    /// the condition does not hold yet; keep polling
    #[error("poll condition not yet ready")]
    NotYet,
    /// the condition can never become true; stop polling
    #[error("non-retryable error while polling on condition")]
    Failed(E),
}

/// Result of [`wait_for_condition`]
#[derive(Debug, Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition")]
    PermanentError(E),
}

/// Poll `cond` every `poll_interval` until it returns `Ok` or `max_wait` has
/// elapsed.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    max_wait: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        if duration > *max_wait {
            return Err(Error::TimedOut(duration));
        }

        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e))
            }
            Err(CondCheckError::NotYet) => (),
        }

        tokio::time::sleep(*poll_interval).await;
    }
}
