// src/engine/backoff.rs

use std::time::Duration;

use rand::Rng;

use crate::errors::{EngineError, Result};

/// Exponential restart delay for failing slots.
///
/// The n-th consecutive failure waits `min(base * factor^(n-1), max)`,
/// stretched by a random fraction of at most `jitter`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.base.is_zero() {
            return Err(EngineError::Config("backoff base must be > 0".into()));
        }
        if self.max < self.base {
            return Err(EngineError::Config(format!(
                "backoff max ({:?}) must be >= base ({:?})",
                self.max, self.base
            )));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(EngineError::Config(format!(
                "backoff factor must be >= 1 (got {})",
                self.factor
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(EngineError::Config(format!(
                "backoff jitter must be within [0, 1] (got {})",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Delay before the next attempt after `failures` consecutive failures,
    /// without jitter.
    pub fn nominal(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(64) as i32;
        let scaled = self.base.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Delay before the next attempt, jittered.
    pub fn delay(&self, failures: u32) -> Duration {
        let nominal = self.nominal(failures);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let stretch = rand::rng().random_range(0.0..=self.jitter);
        nominal.mul_f64(1.0 + stretch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        }
    }

    #[test]
    fn grows_exponentially_up_to_max() {
        let p = policy();
        assert_eq!(p.delay(1), Duration::from_secs(3));
        assert_eq!(p.delay(2), Duration::from_secs(6));
        assert_eq!(p.delay(3), Duration::from_secs(12));
        assert_eq!(p.delay(6), Duration::from_secs(60));
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn zero_failures_waits_base() {
        assert_eq!(policy().delay(0), Duration::from_secs(3));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let p = BackoffPolicy::default();
        for _ in 0..100 {
            let d = p.delay(1);
            assert!(d >= Duration::from_secs(3));
            assert!(d <= Duration::from_millis(3301));
        }
    }

    #[test]
    fn rejects_bad_settings() {
        let bad = [
            BackoffPolicy {
                base: Duration::ZERO,
                ..policy()
            },
            BackoffPolicy {
                max: Duration::from_secs(1),
                ..policy()
            },
            BackoffPolicy {
                factor: 0.5,
                ..policy()
            },
            BackoffPolicy {
                jitter: 1.5,
                ..policy()
            },
        ];
        for p in bad {
            assert!(matches!(p.validate(), Err(EngineError::Config(_))), "{p:?}");
        }
        assert!(BackoffPolicy::default().validate().is_ok());
    }
}
