use rand::Rng;
use std::time::Duration;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(800);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(15_000);
pub const DEFAULT_FACTOR: f64 = 1.7;

/// Reconnect delay policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Fraction (0.0-1.0) of each delay replaced by a uniform random sample.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            factor: DEFAULT_FACTOR,
            jitter: 0.0,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("initial reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("max reconnect delay must be >= initial reconnect delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

/// Current reconnect delay for one client. Grows on every scheduled attempt
/// and snaps back to the initial delay after a successful handshake.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current_ms: f64,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_ms: duration_ms(config.initial_delay),
            config,
        }
    }

    /// Delay the next attempt will wait, without advancing.
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms.round() as u64)
    }

    /// Take the delay for the attempt being scheduled now, then grow.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_ms;
        let max = duration_ms(self.config.max_delay);
        self.current_ms = (self.current_ms * self.config.factor).min(max);

        if self.config.jitter == 0.0 {
            return Duration::from_millis(base.round() as u64);
        }
        let randomized = rand::thread_rng().gen_range(0.0..=base);
        let blended = base * (1.0 - self.config.jitter) + randomized * self.config.jitter;
        Duration::from_millis(blended.round() as u64)
    }

    pub fn reset(&mut self) {
        self.current_ms = duration_ms(self.config.initial_delay);
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn grows_by_factor_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let delays: Vec<_> = (0..9).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                ms(800),
                ms(1360),
                ms(2312),
                ms(3930),
                ms(6682),
                ms(11359),
                ms(15000),
                ms(15000),
                ms(15000),
            ]
        );
    }

    #[test]
    fn nth_delay_matches_closed_form() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for n in 0..12 {
            let expected = (800.0 * 1.7f64.powi(n)).min(15_000.0).round() as u64;
            assert_eq!(backoff.next_delay(), ms(expected), "attempt {n}");
        }
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..4 {
            backoff.next_delay();
        }
        assert!(backoff.current() > ms(800));
        backoff.reset();
        assert_eq!(backoff.next_delay(), ms(800));
        assert_eq!(backoff.current(), ms(1360));
    }

    #[test]
    fn jitter_stays_within_base_delay() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter: 1.0,
            ..BackoffConfig::default()
        });
        for _ in 0..20 {
            assert!(backoff.next_delay() <= ms(15_000));
        }
    }

    #[test]
    fn validate_rejects_bad_configs() {
        assert!(BackoffConfig::default().validate().is_ok());
        assert!(BackoffConfig {
            factor: 0.5,
            ..BackoffConfig::default()
        }
        .validate()
        .is_err());
        assert!(BackoffConfig {
            max_delay: ms(10),
            ..BackoffConfig::default()
        }
        .validate()
        .is_err());
        assert!(BackoffConfig {
            jitter: 1.5,
            ..BackoffConfig::default()
        }
        .validate()
        .is_err());
    }
}
