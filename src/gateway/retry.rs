// Bounded polling with an injectable sleeper

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper: yields the task, never blocks the worker thread.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Re-polls after the initial observation, so a caller that already
    /// fetched once sees up to `attempts + 1` fetches in total. With the
    /// default of 5 at one second apart the whole wait stays around five
    /// seconds.
    pub attempts: u32,
    /// Fixed wait before each re-poll.
    pub interval: Duration,
    /// Upper bound on the whole wait.
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Re-run `op` until `done` accepts its value, sleeping `interval` before each
/// attempt. Returns `None` when attempts or the timeout run out.
///
/// `op` receives the 1-based attempt number and yields `None` for a failed fetch,
/// which counts as an attempt.
pub async fn poll_until<T, F, Fut, P>(
    desc: &str,
    sleeper: &dyn Sleeper,
    policy: PollPolicy,
    mut op: F,
    done: P,
) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
    P: Fn(&T) -> bool,
{
    let polling = async {
        for attempt in 1..=policy.attempts {
            sleeper.sleep(policy.interval).await;
            debug!(target: "settle", desc = %desc, attempt = attempt, max_attempts = policy.attempts, "polling");
            if let Some(value) = op(attempt).await {
                if done(&value) {
                    return Some(value);
                }
            }
        }
        None
    };

    match tokio::time::timeout(policy.timeout, polling).await {
        Ok(result) => result,
        Err(_) => {
            warn!(target: "settle", desc = %desc, timeout = ?policy.timeout, "polling timed out");
            None
        }
    }
}
