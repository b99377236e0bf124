//! Control client configuration.

use std::time::Duration;

use vigil_core::config::WorkerSettings;
use vigil_core::protocol::Register;

/// Capped exponential backoff, shared by channel reconnects and pipeline
/// retries: `initial_delay * multiplier^attempt`, never above `max_delay`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Pipeline retry policy from worker settings.
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            initial_delay: Duration::from_secs(settings.retry_initial_secs),
            max_delay: Duration::from_secs(settings.retry_max_secs),
            multiplier: 2.0,
            max_attempts: settings.max_retry_attempts,
        }
    }

    /// Delay before attempt `attempt`, counting from 0.
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(63) as i32);
        self.initial_delay
            .mul_f64(factor.min(1e9))
            .min(self.max_delay)
    }

    /// Whether attempt `attempt` may still be made.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Everything the client needs to reach and register with the control plane.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub control_addr: String,
    /// Sent as REGISTER on every (re)connect.
    pub registration: Register,
    pub reconnect: ReconnectPolicy,
    /// How long to wait for REGISTERED.
    pub register_timeout: Duration,
}

impl ClientConfig {
    pub fn new(control_addr: String, registration: Register) -> Self {
        Self {
            control_addr,
            registration,
            reconnect: ReconnectPolicy::default(),
            register_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (0..8).map(|a| policy.delay_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn bounded_policy_stops_retrying() {
        let policy = ReconnectPolicy {
            max_attempts: Some(2),
            ..Default::default()
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(ReconnectPolicy::default().should_retry(u32::MAX));
    }

    #[test]
    fn retry_policy_follows_settings() {
        let settings = WorkerSettings {
            retry_initial_secs: 2,
            retry_max_secs: 10,
            max_retry_attempts: Some(4),
            ..WorkerSettings::default()
        };
        let policy = ReconnectPolicy::from_settings(&settings);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
        assert!(!policy.should_retry(4));
    }
}
