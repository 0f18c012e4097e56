// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retry and backoff utilities.

use std::cmp;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff state for a reconnecting loop.
///
/// The delay starts at `initial` and doubles on every failure up to `clamp`.
/// A healthy period resets the delay back to `initial`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    clamp: Duration,
    next: Duration,
}

impl Backoff {
    /// Creates a backoff that starts at `initial` and saturates at `clamp`.
    pub fn new(initial: Duration, clamp: Duration) -> Backoff {
        Backoff {
            initial,
            clamp,
            next: initial,
        }
    }

    /// Returns the next delay and advances the internal state.
    pub fn next_backoff(&mut self) -> Duration {
        let delay = self.next;
        self.next = cmp::min(self.next * 2, self.clamp);
        delay
    }

    /// Resets the delay to its initial value.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }

    /// Sleeps for the next backoff period.
    pub async fn sleep(&mut self) {
        tokio::time::sleep(self.next_backoff()).await;
    }
}

/// Configures a retry operation.
#[derive(Debug, Clone)]
pub struct Retry {
    /// The initial backoff for the retry operation.
    pub initial_backoff: Duration,
    /// The maximum backoff for the retry operation.
    pub clamp_backoff: Duration,
    /// The maximum number of tries, or `None` for no limit.
    pub max_tries: Option<usize>,
}

impl Retry {
    /// A retry configuration with sensible defaults for upstream reconnects.
    pub fn default() -> Retry {
        Retry {
            initial_backoff: Duration::from_millis(100),
            clamp_backoff: Duration::from_secs(10),
            max_tries: None,
        }
    }

    /// Sets the initial backoff.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Retry {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Sets the maximum backoff.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Retry {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Sets the maximum number of tries.
    pub fn max_tries(mut self, max_tries: usize) -> Retry {
        self.max_tries = Some(max_tries);
        self
    }

    /// Retries the asynchronous, fallible operation `f` according to this
    /// configuration, sleeping between attempts.
    pub async fn retry_async<F, Fut, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut backoff = Backoff::new(self.initial_backoff, self.clamp_backoff);
        let mut tries = 0;
        loop {
            match f().await {
                Ok(t) => return Ok(t),
                Err(e) => {
                    tries += 1;
                    if let Some(max) = self.max_tries {
                        if tries >= max {
                            return Err(e);
                        }
                    }
                    backoff.sleep().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_clamps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(b.next_backoff(), Duration::from_millis(100));
        assert_eq!(b.next_backoff(), Duration::from_millis(200));
        assert_eq!(b.next_backoff(), Duration::from_millis(400));
        for _ in 0..10 {
            b.next_backoff();
        }
        assert_eq!(b.next_backoff(), Duration::from_secs(10));
        b.reset();
        assert_eq!(b.next_backoff(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_async_gives_up_after_max_tries() {
        let mut attempts = 0;
        let res: Result<(), &str> = Retry::default()
            .max_tries(3)
            .retry_async(|| {
                attempts += 1;
                async { Err("nope") }
            })
            .await;
        assert_eq!(res, Err("nope"));
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_async_succeeds_eventually() {
        let mut attempts = 0;
        let res: Result<i32, &str> = Retry::default()
            .retry_async(|| {
                attempts += 1;
                let attempts = attempts;
                async move {
                    if attempts < 3 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(res, Ok(42));
        assert_eq!(attempts, 3);
    }
}
