//! Delay schedule between polling attempts of a blocking acquire.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// How long to sleep before the next acquire attempt.
///
/// Deserialised from the `lock.backoff` config section, e.g.
///
/// ```yaml
/// backoff:
///   kind: exponential
///   initial_ms: 50
///   max_ms: 1000
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Same delay between every attempt.
    Fixed { delay_ms: u64 },
    /// Delay grows by `multiplier` per attempt, capped at `max_ms`.
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        /// Randomise each delay within `[delay / 2, delay]` so waiters that
        /// started together spread out.
        #[serde(default = "bool_true")]
        jitter: bool,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

fn bool_true() -> bool {
    true
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 50,
            max_ms: 1_000,
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: duration_ms(delay),
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial_ms: duration_ms(initial),
            max_ms: duration_ms(max),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }

    /// Same policy with jitter switched off (no-op for `Fixed`).
    pub fn without_jitter(self) -> Self {
        match self {
            Self::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                ..
            } => Self::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                jitter: false,
            },
            fixed => fixed,
        }
    }

    /// Upper bound of the delay after failed attempt number `attempt`
    /// (zero-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                ..
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let grown = initial_ms as f64 * multiplier.powi(exponent);
                let capped = if grown.is_finite() {
                    grown.min(max_ms as f64)
                } else {
                    max_ms as f64
                };
                Duration::from_millis(capped as u64)
            }
        }
    }

    /// Delay to sleep after failed attempt number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        match self {
            Self::Exponential { jitter: true, .. } => {
                let ceiling = duration_ms(base);
                if ceiling < 2 {
                    return base;
                }
                let ms = rand::rng().random_range(ceiling / 2..=ceiling);
                Duration::from_millis(ms)
            }
            _ => base,
        }
    }

    /// Largest delay this policy can produce.
    pub fn max_delay(&self) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { initial_ms, max_ms, .. } => {
                Duration::from_millis(max_ms.max(initial_ms))
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(25));
        for attempt in [0, 1, 7, 1000] {
            assert_eq!(policy.delay(attempt), Duration::from_millis(25));
        }
    }

    #[test]
    fn exponential_grows_and_caps() {
        let policy =
            BackoffPolicy::exponential(Duration::from_millis(10), Duration::from_millis(100))
                .without_jitter();
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(2), Duration::from_millis(40));
        assert_eq!(policy.delay(3), Duration::from_millis(80));
        assert_eq!(policy.delay(4), Duration::from_millis(100));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let policy =
            BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_millis(400));
        for attempt in 0..6 {
            let base = policy.base_delay(attempt);
            for _ in 0..50 {
                let d = policy.delay(attempt);
                assert!(d <= base, "{d:?} > {base:?}");
                assert!(d >= base / 2, "{d:?} < half of {base:?}");
            }
        }
    }

    #[test]
    fn deserialize_fixed_and_exponential() {
        let fixed: BackoffPolicy = serde_yaml::from_str("kind: fixed\ndelay_ms: 30\n").unwrap();
        assert_eq!(fixed, BackoffPolicy::Fixed { delay_ms: 30 });

        let exp: BackoffPolicy =
            serde_yaml::from_str("kind: exponential\ninitial_ms: 5\nmax_ms: 500\n").unwrap();
        assert_eq!(
            exp,
            BackoffPolicy::Exponential {
                initial_ms: 5,
                max_ms: 500,
                multiplier: 2.0,
                jitter: true,
            }
        );
    }

    #[test]
    fn max_delay_reports_cap() {
        assert_eq!(BackoffPolicy::default().max_delay(), Duration::from_millis(1_000));
        assert_eq!(
            BackoffPolicy::fixed(Duration::from_millis(7)).max_delay(),
            Duration::from_millis(7)
        );
    }
}
