//! Bounded retry combinator
//!
//! Certificate issuance and the readiness polls share one shape: run an
//! attempt, and if it is not done yet, sleep a fixed delay and try again, up
//! to a hard attempt limit. Each attempt reports one of three outcomes:
//!
//! - `Ok(Attempt::Done(value))` stops with success
//! - `Ok(Attempt::Retry(reason))` is transient and consumes one attempt
//! - `Err(e)` is permanent and aborts immediately
//!
//! Exhaustion is turned into a domain error by the caller, so certificate
//! failures and readiness timeouts keep their own diagnostics.

use crate::error::{DeployError, Result};
use crate::host::Host;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Attempt limit plus fixed delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_secs: u64,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay_secs: u64) -> Self {
        Self {
            attempts,
            delay_secs,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    /// Longest time spent sleeping before giving up
    pub fn budget(&self) -> Duration {
        self.delay() * self.attempts.saturating_sub(1)
    }
}

/// Outcome of a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Done(T),
    Retry(String),
}

/// What the caller learns when every attempt came back `Retry`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    pub label: String,
    pub attempts: u32,
    pub waited: Duration,
    pub last_reason: String,
}

/// Run `op` until it is done, fails permanently, or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. The host sleeps `policy.delay()`
/// between attempts, never after the last one.
pub fn retry<T, F, E>(
    host: &dyn Host,
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
    on_exhausted: E,
) -> Result<T>
where
    F: FnMut(u32) -> Result<Attempt<T>>,
    E: FnOnce(Exhausted) -> DeployError,
{
    let attempts = policy.attempts.max(1);
    let mut last_reason = String::new();

    for attempt in 1..=attempts {
        match op(attempt)? {
            Attempt::Done(value) => {
                if attempt > 1 {
                    log::info!("{} succeeded on attempt {}/{}", label, attempt, attempts);
                }
                return Ok(value);
            }
            Attempt::Retry(reason) => {
                log::debug!("{} attempt {}/{}: {}", label, attempt, attempts, reason);
                last_reason = reason;
                if attempt < attempts {
                    host.sleep(policy.delay());
                }
            }
        }
    }

    log::warn!("{} gave up after {} attempt(s): {}", label, attempts, last_reason);
    Err(on_exhausted(Exhausted {
        label: label.to_string(),
        attempts,
        waited: policy.delay() * (attempts - 1),
        last_reason,
    }))
}

/// Poll a readiness probe; exhaustion is a `ReadinessTimeout` carrying `hint`.
pub fn poll_until<T, F>(
    host: &dyn Host,
    policy: &RetryPolicy,
    signal: &str,
    hint: &str,
    probe: F,
) -> Result<T>
where
    F: FnMut(u32) -> Result<Attempt<T>>,
{
    retry(host, policy, signal, probe, |exhausted| {
        DeployError::readiness_timeout(
            format!("{} (last seen: {})", exhausted.label, exhausted.last_reason),
            exhausted.waited.as_secs(),
            hint,
        )
    })
}
