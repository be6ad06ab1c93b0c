// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded waits on cluster transitions.

use futures::Future;
use futures::TryFutureExt;
use std::time::Duration;
use tokio::time::Instant;

/// Error type returned from [`Timeout::timeout_at()`].
#[derive(Debug, Clone, Copy)]
pub struct Elapsed(pub Timeout);

impl Elapsed {
    /// Get the duration of the timeout that elapsed.
    pub fn duration(&self) -> Duration {
        self.0.duration()
    }
}

/// A ceiling on a blocking cluster operation, as both its starting time and
/// its duration.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    start: Instant,
    duration: Duration,
}

impl Timeout {
    /// Create a new `Timeout` with the given duration starting from
    /// [`Instant::now()`].
    pub fn from_now(duration: Duration) -> Self {
        Self { start: Instant::now(), duration }
    }

    fn end(&self) -> Instant {
        self.start + self.duration
    }

    /// Get the duration of this timeout.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Wrap a future with this timeout.
    pub fn timeout_at<T>(
        self,
        future: T,
    ) -> impl Future<Output = Result<T::Output, Elapsed>>
    where
        T: Future,
    {
        tokio::time::timeout_at(self.end(), future)
            .map_err(move |_| Elapsed(self))
    }
}

/// Result of a single check made by [`wait_for_condition`].
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// The condition does not hold yet; check again after the interval.
    NotYet,
    /// The condition can never hold; stop waiting.
    Failed(E),
}

impl<E> From<E> for CondCheckError<E> {
    fn from(err: E) -> Self {
        CondCheckError::Failed(err)
    }
}

#[derive(Debug)]
pub enum WaitError<E> {
    TimedOut(Elapsed),
    PermanentError(E),
}

/// Runs `check` every `poll_interval` until it succeeds, fails permanently,
/// or `timeout` expires.
pub async fn wait_for_condition<T, E, F, Fut>(
    mut check: F,
    poll_interval: Duration,
    timeout: Timeout,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CondCheckError<E>>>,
{
    let poll = async {
        loop {
            match check().await {
                Ok(value) => return Ok(value),
                Err(CondCheckError::NotYet) => {
                    tokio::time::sleep(poll_interval).await
                }
                Err(CondCheckError::Failed(err)) => return Err(err),
            }
        }
    };
    timeout
        .timeout_at(poll)
        .await
        .map_err(WaitError::TimedOut)?
        .map_err(WaitError::PermanentError)
}
