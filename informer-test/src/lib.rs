//! Test helpers for informers.
//!
//! [`FakeApiServer`] is an in-memory [`ListWatch`](informer_core::ListWatch) backend with
//! resource versions, a compactable event history and fault injection, so that the
//! reflector loop can be exercised without a cluster.
use std::{collections::BTreeSet, sync::Arc, time::Duration};

use informer_core::{Resource, ResourceExt};
use thiserror::Error;
use tokio::time;

mod fake;
pub mod fixtures;

pub use fake::FakeApiServer;

/// Test helper errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The polled condition did not become true in time
    #[error("condition not met after {attempts} attempts over {waited:?}")]
    Timeout {
        /// How many times the condition was checked
        attempts: usize,
        /// How long we waited in total
        waited: Duration,
    },
}

/// The interval [`wait_for`] polls at
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll `condition` every [`POLL_INTERVAL`] until it returns `true` or `timeout` elapses
///
/// Returns the number of failed attempts before the condition held.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> Result<usize, Error>
where
    F: FnMut() -> bool,
{
    let start = time::Instant::now();
    let mut attempts = 0;
    loop {
        if condition() {
            return Ok(attempts);
        }
        attempts += 1;
        let waited = start.elapsed();
        if waited >= timeout {
            tracing::debug!(attempts, ?waited, "condition not met, giving up");
            return Err(Error::Timeout { attempts, waited });
        }
        time::sleep(POLL_INTERVAL).await;
    }
}

/// The set of names of the given objects
pub fn resource_names<K: Resource>(items: &[Arc<K>]) -> BTreeSet<String> {
    items.iter().map(|obj| obj.name_any()).collect()
}

#[cfg(test)]
mod tests {
    use super::{wait_for, Error};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn wait_for_counts_attempts() {
        let mut calls = 0;
        let attempts = wait_for(Duration::from_secs(10), || {
            calls += 1;
            calls == 3
        })
        .await
        .unwrap();
        assert_eq!(attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_gives_up() {
        let res = wait_for(Duration::from_secs(1), || false).await;
        assert!(matches!(res, Err(Error::Timeout { attempts: 11, .. })));
    }
}
