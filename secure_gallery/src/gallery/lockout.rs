//! Cooldown after repeated failed PIN attempts

use chrono::{DateTime, Duration, Utc};
use log::warn;

use crate::config::LockoutConfig;
use crate::error::{VaultError, VaultResult};

/// Tracks consecutive failed unlocks. Not tied to any gallery, since a
/// miss never reveals which gallery (if any) was targeted.
#[derive(Debug)]
pub struct UnlockThrottle {
    config: LockoutConfig,
    failures: u32,
    last_failure: Option<DateTime<Utc>>,
}

impl UnlockThrottle {
    pub fn new(config: LockoutConfig) -> Self {
        Self {
            config,
            failures: 0,
            last_failure: None,
        }
    }

    /// Cooldown for the given number of misses:
    /// 2^(misses - max_attempts) * base, capped at 2^10 * base
    pub fn cooldown_for(&self, failures: u32) -> Option<Duration> {
        if !self.config.enabled || failures < self.config.max_attempts {
            return None;
        }
        let excess = failures - self.config.max_attempts;
        let multiplier = 2_i64.pow(excess.min(10));
        Some(Duration::seconds(self.config.base_cooldown_secs * multiplier))
    }

    /// Fail with [`VaultError::LockedOut`] while a cooldown is running
    pub fn check_at(&self, now: DateTime<Utc>) -> VaultResult<()> {
        match self.remaining_at(now) {
            Some(secs) => Err(VaultError::LockedOut { retry_after_secs: secs }),
            None => Ok(()),
        }
    }

    pub fn check(&self) -> VaultResult<()> {
        self.check_at(Utc::now())
    }

    /// Seconds left in the current cooldown
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<i64> {
        let cooldown = self.cooldown_for(self.failures)?;
        let until = self.last_failure? + cooldown;
        let remaining = (until - now).num_seconds();
        (remaining > 0).then_some(remaining)
    }

    pub fn record_failure_at(&mut self, now: DateTime<Utc>) {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(now);
        if let Some(cooldown) = self.cooldown_for(self.failures) {
            warn!(
                "{} failed unlock attempts, cooling down for {}s",
                self.failures,
                cooldown.num_seconds()
            );
        }
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Utc::now());
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.last_failure = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> UnlockThrottle {
        UnlockThrottle::new(LockoutConfig {
            max_attempts: 3,
            base_cooldown_secs: 10,
            enabled: true,
        })
    }

    #[test]
    fn test_backoff_doubles() {
        let t = throttle();
        assert_eq!(t.cooldown_for(2), None);
        assert_eq!(t.cooldown_for(3), Some(Duration::seconds(10)));
        assert_eq!(t.cooldown_for(4), Some(Duration::seconds(20)));
        assert_eq!(t.cooldown_for(100), Some(Duration::seconds(10 * 1024)));
    }

    #[test]
    fn test_cooldown_expires_and_success_resets() {
        let mut t = throttle();
        let start = Utc::now();
        for _ in 0..3 {
            t.record_failure_at(start);
        }

        assert!(matches!(
            t.check_at(start + Duration::seconds(4)),
            Err(VaultError::LockedOut { retry_after_secs: 6 })
        ));
        assert!(t.check_at(start + Duration::seconds(11)).is_ok());

        t.record_success();
        assert_eq!(t.failures(), 0);
        assert!(t.check_at(start).is_ok());
    }

    #[test]
    fn test_disabled_never_locks() {
        let mut t = UnlockThrottle::new(LockoutConfig {
            enabled: false,
            ..Default::default()
        });
        for _ in 0..50 {
            t.record_failure();
        }
        assert!(t.check().is_ok());
    }
}
