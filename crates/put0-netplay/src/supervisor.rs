//! Reconnect supervisor.
//!
//! Schedules reconnection attempts with capped exponential backoff and runs
//! the resume sequence: connect, replay subscriptions, request a resync, and
//! only then flush queued commands.

use std::time::Duration;

use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{config::BackoffPolicy, error::NetplayError};

/// The ordered steps of a resume. Implemented by the session task.
#[async_trait]
pub trait ResumeSteps: Send {
    async fn connect(&mut self) -> Result<(), NetplayError>;
    async fn replay_subscriptions(&mut self) -> Result<(), NetplayError>;
    async fn request_resync(&mut self) -> Result<(), NetplayError>;
    async fn flush_commands(&mut self) -> Result<(), NetplayError>;
}

#[derive(Debug)]
pub enum ResumeOutcome {
    Resumed,
    /// Try again at the given instant.
    Retry(Instant),
    /// Budget exhausted; carries `SessionLost`.
    Lost(NetplayError),
}

pub struct ReconnectSupervisor {
    policy: BackoffPolicy,
    rng: StdRng,
    attempts: u32,
    outage_started: Option<Instant>,
}

impl ReconnectSupervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_os_rng())
    }

    /// Deterministic jitter, for tests.
    pub fn with_seed(policy: BackoffPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: BackoffPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            rng,
            attempts: 0,
            outage_started: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn in_outage(&self) -> bool {
        self.outage_started.is_some()
    }

    /// Connection lost. Returns when the first attempt should run.
    pub fn on_disconnect(&mut self, now: Instant) -> Instant {
        if self.outage_started.is_none() {
            self.outage_started = Some(now);
            self.attempts = 0;
        }
        now + self.delay_for(self.attempts)
    }

    /// Delay before attempt number `attempt` (0-based), jittered and clamped
    /// to `[base, cap]`.
    pub fn delay_for(&mut self, attempt: u32) -> Duration {
        let BackoffPolicy {
            base, cap, jitter, ..
        } = self.policy;
        let exp = base
            .checked_mul(1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX))
            .unwrap_or(cap)
            .min(cap);
        let jitter = jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + self.rng.random_range(-jitter..=jitter)
        } else {
            1.0
        };
        exp.mul_f64(factor).clamp(base, cap)
    }

    /// Count a failed attempt and schedule the next one, or give up.
    pub fn record_failure(&mut self, now: Instant) -> Result<Instant, NetplayError> {
        let started = *self.outage_started.get_or_insert(now);
        self.attempts += 1;
        let elapsed = now.saturating_duration_since(started);
        if self.attempts >= self.policy.max_attempts || elapsed >= self.policy.max_elapsed {
            return Err(NetplayError::SessionLost {
                attempts: self.attempts,
                elapsed,
            });
        }
        Ok(now + self.delay_for(self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.outage_started = None;
    }

    /// Run one resume attempt.
    pub async fn resume<S: ResumeSteps>(&mut self, steps: &mut S) -> ResumeOutcome {
        let attempt = self.attempts + 1;
        info!(attempt, "Reconnecting");
        let result = async {
            steps.connect().await?;
            steps.replay_subscriptions().await?;
            steps.request_resync().await?;
            steps.flush_commands().await
        }
        .await;

        match result {
            Ok(()) => {
                info!(attempt, "Session resumed");
                self.reset();
                ResumeOutcome::Resumed
            }
            Err(e) => {
                warn!(attempt, error = %e, "Reconnect attempt failed");
                match self.record_failure(Instant::now()) {
                    Ok(at) => ResumeOutcome::Retry(at),
                    Err(lost) => ResumeOutcome::Lost(lost),
                }
            }
        }
    }
}
