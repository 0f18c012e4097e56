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

//! Named task spawning.
//!
//! Tasks must be named so that hung or leaked tasks can be attributed in
//! diagnostics; the name closure is only invoked when task instrumentation
//! is active or the task panics.

use std::future::Future;
use std::ops::{Deref, DerefMut};

use tokio::task::JoinHandle;
use tracing::error;

/// Spawns a named task on the current tokio runtime.
#[track_caller]
pub fn spawn<N, S, Fut>(name: N, fut: Fut) -> JoinHandle<Fut::Output>
where
    N: FnOnce() -> S,
    S: AsRef<str>,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = name().as_ref().to_string();
    tokio::spawn(async move {
        tracing::trace!(task = %name, "task started");
        fut.await
    })
}

/// Extension methods for [`JoinHandle`].
pub trait JoinHandleExt<T> {
    /// Converts the handle into one that aborts the task on drop.
    fn abort_on_drop(self) -> AbortOnDropHandle<T>;
}

impl<T> JoinHandleExt<T> for JoinHandle<T> {
    fn abort_on_drop(self) -> AbortOnDropHandle<T> {
        AbortOnDropHandle(self)
    }
}

/// A wrapper around a [`JoinHandle`] that aborts the task when dropped.
#[derive(Debug)]
pub struct AbortOnDropHandle<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDropHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Deref for AbortOnDropHandle<T> {
    type Target = JoinHandle<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for AbortOnDropHandle<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Spawns a named task whose errors are logged rather than returned.
///
/// Useful for fire-and-forget background work where the only sensible
/// reaction to failure is a log line.
#[track_caller]
pub fn spawn_logged<N, S, Fut, E>(name: N, fut: Fut) -> JoinHandle<()>
where
    N: FnOnce() -> S,
    S: AsRef<str>,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let name = name().as_ref().to_string();
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!("task {name} failed: {e}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_runs_to_completion() {
        let handle = spawn(|| "adder", async { 2 + 2 });
        assert_eq!(handle.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn abort_on_drop_aborts() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
        let handle = spawn(|| "sleeper", async move {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            let _ = tx.send(()).await;
        })
        .abort_on_drop();
        drop(handle);
        // The sender is dropped by the abort, closing the channel.
        assert!(rx.recv().await.is_none());
    }
}
