//! Reconnection backoff with a linear, capped step

use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay added per consecutive idle reconnect
    pub step: Duration,
    /// Upper bound for the sleep counter
    pub max_sleeps: u32,
    /// Upper bound for the delay
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(5),
            max_sleeps: 20,
            max_delay: Duration::from_secs(100),
        }
    }
}

/// Tracks consecutive reconnects; reset on successful login
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    sleeps: u32,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, sleeps: 0 }
    }

    /// Count one more reconnect and return how long to wait before it
    pub fn next_delay(&mut self) -> Duration {
        if self.sleeps < self.config.max_sleeps {
            self.sleeps += 1;
        }
        let delay = (self.config.step * self.sleeps).min(self.config.max_delay);
        debug!(sleeps = self.sleeps, "Next reconnect in {}s", delay.as_secs());
        delay
    }

    pub fn reset(&mut self) {
        self.sleeps = 0;
    }

    pub fn sleeps(&self) -> u32 {
        self.sleeps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_by_step() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        let delays: Vec<u64> = (0..4).map(|_| manager.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 15, 20]);
        assert_eq!(manager.sleeps(), 4);
    }

    #[test]
    fn test_delay_is_capped() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        let mut previous = Duration::ZERO;
        for _ in 0..30 {
            let delay = manager.next_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(100));
            previous = delay;
        }
        assert_eq!(manager.sleeps(), 20);
        assert_eq!(previous, Duration::from_secs(100));
    }

    #[test]
    fn test_reset_after_login() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        manager.next_delay();
        manager.next_delay();
        manager.reset();
        assert_eq!(manager.sleeps(), 0);
        assert_eq!(manager.next_delay(), Duration::from_secs(5));
    }
}
