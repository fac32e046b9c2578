// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retry policies for calls into external collaborators.

use crate::api::Error;
use slog::{warn, Logger};
use std::future::Future;
use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Policy for collaborator calls that are expected to recover quickly, such as
/// artifact uploads. Gives up after `max_elapsed`.
pub fn collaborator_policy(max_elapsed: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(max_elapsed),
        ..policy_with_intervals(
            Duration::from_millis(50),
            Duration::from_secs(2),
        )
    }
}

/// Policy for waiting on collaborators that may be down for a long time.
/// Never gives up.
pub fn collaborator_policy_long() -> ExponentialBackoff {
    policy_with_intervals(
        Duration::from_millis(250),
        Duration::from_secs(60),
    )
}

fn policy_with_intervals(
    initial_interval: Duration,
    max_interval: Duration,
) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Runs `op` under `policy`, retrying only errors that report themselves as
/// [`Error::retryable`]. Every retry is logged with `what` as the operation.
pub async fn retry_retryable<T, F, Fut>(
    log: &Logger,
    what: &str,
    policy: ExponentialBackoff,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_notify(
        policy,
        || {
            let attempt = op();
            async move {
                attempt.await.map_err(|error| {
                    if error.retryable() {
                        BackoffError::transient(error)
                    } else {
                        BackoffError::permanent(error)
                    }
                })
            }
        },
        |error: Error, delay: Duration| {
            warn!(
                log,
                "retrying failed operation";
                "operation" => what,
                "error" => %error,
                "retry_after" => ?delay,
            );
        },
    )
    .await
}
