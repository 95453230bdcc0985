//! Exponential retry backoff

use std::time::Duration;

use rand::Rng;

/// Fraction of the nominal delay used as the jitter band (±20%)
const JITTER_FRACTION: f64 = 0.2;

/// Nominal delay before the given attempt: `min(base * 2^attempt, max)`.
///
/// `attempt` is the attempt count after the failure being rescheduled,
/// so delays grow with every consecutive transient failure.
#[must_use]
pub fn retry_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.min(20);
    let nominal = base.saturating_mul(1_u32.checked_shl(shift).unwrap_or(u32::MAX));
    nominal.min(max)
}

/// Apply ±20% jitter to a delay.
///
/// Many devices reconnecting at once after an outage would otherwise
/// retry in lockstep and hammer the server together.
#[must_use]
pub fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(2);
    const MAX: Duration = Duration::from_secs(300);

    #[test]
    fn delays_double_per_attempt() {
        assert_eq!(retry_delay(BASE, MAX, 1), Duration::from_secs(4));
        assert_eq!(retry_delay(BASE, MAX, 2), Duration::from_secs(8));
        assert_eq!(retry_delay(BASE, MAX, 3), Duration::from_secs(16));
    }

    #[test]
    fn delays_are_monotonic_and_capped() {
        let mut previous = Duration::ZERO;
        for attempt in 1..=30 {
            let delay = retry_delay(BASE, MAX, attempt);
            assert!(delay >= previous, "attempt {attempt} regressed");
            assert!(delay <= MAX);
            previous = delay;
        }
        assert_eq!(retry_delay(BASE, MAX, 30), MAX);
    }

    #[test]
    fn jitter_stays_within_band() {
        let nominal = Duration::from_secs(10);
        for _ in 0..100 {
            let delay = jittered(nominal);
            assert!(delay >= Duration::from_secs(8));
            assert!(delay <= Duration::from_secs(12));
        }
    }

    #[test]
    fn zero_delay_stays_zero_under_jitter() {
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
