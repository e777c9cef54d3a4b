//! Bounded-retry supervision of the broker link.
//!
//! Each consecutive connection failure costs one attempt and is followed by a
//! fixed backoff. A successful connect refills the budget. Once the budget is
//! spent the supervisor gives up for good and the process is expected to
//! restart.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub restart_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_millis(2000),
            restart_delay: Duration::from_secs(30),
        }
    }
}

/// Link state as seen by the node runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting { attempt: u32 },
    Connected,
    Failed,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

#[derive(Debug)]
pub struct LinkSupervisor {
    policy: RetryPolicy,
    state: LinkState,
    failures: u32,
}

impl LinkSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: LinkState::Connecting { attempt: 1 },
            failures: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Consecutive failures since the last successful connect
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn on_connected(&mut self) {
        self.failures = 0;
        self.state = LinkState::Connected;
    }

    pub fn on_failure(&mut self) -> RetryDecision {
        if self.state == LinkState::Failed {
            return RetryDecision::GiveUp;
        }

        self.failures += 1;
        if self.failures >= self.policy.max_attempts.max(1) {
            self.state = LinkState::Failed;
            return RetryDecision::GiveUp;
        }

        self.state = LinkState::Connecting { attempt: self.failures + 1 };
        RetryDecision::Retry(self.policy.backoff)
    }
}
