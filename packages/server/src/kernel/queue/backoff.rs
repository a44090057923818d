//! Retry backoff arithmetic.
//!
//! Pure: no I/O, RNG injected so tests are deterministic. All delays are in
//! whole seconds. Non-positive `base` is treated as 1, non-positive `max`
//! as `base`.

use std::str::FromStr;

use anyhow::bail;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffPolicy {
    Fixed,
    Linear,
    Exponential,
    ExpEqualJitter,
    #[default]
    ExpFullJitter,
}

impl FromStr for BackoffPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            "exp_equal_jitter" => Ok(Self::ExpEqualJitter),
            "exp_full_jitter" => Ok(Self::ExpFullJitter),
            other => bail!("unknown backoff policy: {other}"),
        }
    }
}

/// Delay in seconds before the next attempt, given the number of attempts
/// already made.
pub fn delay_seconds(
    policy: BackoffPolicy,
    base: i64,
    max: i64,
    attempts: u32,
    rng: &mut impl Rng,
) -> i64 {
    let base = if base <= 0 { 1 } else { base };
    let max = if max <= 0 { base } else { max };

    match policy {
        BackoffPolicy::Fixed => base.min(max),
        BackoffPolicy::Linear => base
            .saturating_mul(i64::from(attempts.max(1)))
            .min(max),
        BackoffPolicy::Exponential => exponential(base, max, attempts),
        BackoffPolicy::ExpEqualJitter => {
            let delay = exponential(base, max, attempts);
            let half = delay / 2;
            half + rng.gen_range(0..=half)
        }
        BackoffPolicy::ExpFullJitter => {
            let delay = exponential(base, max, attempts);
            if delay <= 0 {
                0
            } else {
                rng.gen_range(0..=delay)
            }
        }
    }
}

fn exponential(base: i64, max: i64, attempts: u32) -> i64 {
    if attempts >= 62 {
        return max;
    }
    base.checked_mul(1i64 << attempts)
        .map(|d| d.min(max))
        .unwrap_or(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn fixed_ignores_attempts() {
        let mut r = rng();
        assert_eq!(delay_seconds(BackoffPolicy::Fixed, 5, 100, 0, &mut r), 5);
        assert_eq!(delay_seconds(BackoffPolicy::Fixed, 5, 100, 9, &mut r), 5);
        assert_eq!(delay_seconds(BackoffPolicy::Fixed, 500, 100, 1, &mut r), 100);
    }

    #[test]
    fn linear_grows_and_caps() {
        let mut r = rng();
        assert_eq!(delay_seconds(BackoffPolicy::Linear, 3, 100, 0, &mut r), 3);
        assert_eq!(delay_seconds(BackoffPolicy::Linear, 3, 100, 1, &mut r), 3);
        assert_eq!(delay_seconds(BackoffPolicy::Linear, 3, 100, 4, &mut r), 12);
        assert_eq!(delay_seconds(BackoffPolicy::Linear, 3, 100, 99, &mut r), 100);
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let mut r = rng();
        assert_eq!(
            delay_seconds(BackoffPolicy::Exponential, 2, 300, 0, &mut r),
            2
        );
        assert_eq!(
            delay_seconds(BackoffPolicy::Exponential, 2, 300, 3, &mut r),
            16
        );
        assert_eq!(
            delay_seconds(BackoffPolicy::Exponential, 2, 300, 20, &mut r),
            300
        );
        // Shift amounts past 62 must not overflow.
        assert_eq!(
            delay_seconds(BackoffPolicy::Exponential, 2, 300, 200, &mut r),
            300
        );
    }

    #[test]
    fn deterministic_policies_are_monotone_and_bounded() {
        let mut r = rng();
        for policy in [
            BackoffPolicy::Fixed,
            BackoffPolicy::Linear,
            BackoffPolicy::Exponential,
        ] {
            let mut last = 0;
            for attempts in 0..40 {
                let delay = delay_seconds(policy, 2, 600, attempts, &mut r);
                assert!(delay >= last, "{policy:?} shrank at attempt {attempts}");
                assert!(delay <= 600);
                last = delay;
            }
        }
    }

    #[test]
    fn equal_jitter_stays_in_upper_half() {
        let mut r = rng();
        for attempts in 0..20 {
            let full = exponential(4, 600, attempts);
            let delay = delay_seconds(BackoffPolicy::ExpEqualJitter, 4, 600, attempts, &mut r);
            assert!(delay >= full / 2);
            assert!(delay <= full);
        }
    }

    #[test]
    fn full_jitter_stays_in_range() {
        let mut r = rng();
        for attempts in 0..20 {
            let full = exponential(4, 600, attempts);
            let delay = delay_seconds(BackoffPolicy::ExpFullJitter, 4, 600, attempts, &mut r);
            assert!(delay >= 0);
            assert!(delay <= full);
        }
    }

    #[test]
    fn degenerate_inputs_are_normalized() {
        let mut r = rng();
        // base <= 0 behaves as 1
        assert_eq!(delay_seconds(BackoffPolicy::Fixed, 0, 10, 0, &mut r), 1);
        assert_eq!(delay_seconds(BackoffPolicy::Fixed, -5, 10, 0, &mut r), 1);
        // max <= 0 behaves as base
        assert_eq!(
            delay_seconds(BackoffPolicy::Exponential, 7, 0, 5, &mut r),
            7
        );
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!(
            "exp_full_jitter".parse::<BackoffPolicy>().unwrap(),
            BackoffPolicy::ExpFullJitter
        );
        assert!("bogus".parse::<BackoffPolicy>().is_err());
    }
}
