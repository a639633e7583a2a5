use std::time::Duration;

use rand::{Rng, RngCore};

const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// Retry bookkeeping for one session. Reset whenever the connection comes online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Retries granted since the last successful connection.
    pub attempt: u32,
    /// Delay granted for the most recent retry.
    pub next_delay_ms: u64,
    /// Number of retries granted before giving up.
    pub give_up_after: u32,
}

impl RetryState {
    pub fn new(give_up_after: u32) -> Self {
        Self {
            attempt: 0,
            next_delay_ms: 0,
            give_up_after,
        }
    }

    /// Record a granted retry.
    pub fn record(&mut self, delay: Duration) {
        self.attempt = self.attempt.saturating_add(1);
        self.next_delay_ms = delay.as_millis() as u64;
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay_ms = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.give_up_after
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Delay(Duration),
    /// Retry budget spent; give up.
    Exhausted,
}

/// Exponential backoff with jitter and a bounded number of retries.
///
/// The scheduler is pure: given the same [`RetryState`] and random source it
/// always produces the same decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryScheduler {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
    jitter_ratio: f64,
}

impl RetryScheduler {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the symmetric jitter ratio, clamped to `0.0..=1.0`.
    pub fn with_jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// A fresh state bound to this scheduler's retry budget.
    pub fn fresh_state(&self) -> RetryState {
        RetryState::new(self.max_attempts)
    }

    /// Un-jittered delay for a zero-based attempt, honoring a larger server hint.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }

    /// Upper bound of any delay returned by [`RetryScheduler::next`].
    pub fn max_jittered_delay(&self) -> Duration {
        let bound = self.max_delay_ms as f64 * (1.0 + self.jitter_ratio);
        Duration::from_millis(bound.floor() as u64)
    }

    /// Decide whether to retry after a failure.
    pub fn next<R>(
        &self,
        state: &RetryState,
        retry_after_hint_ms: Option<u64>,
        rng: &mut R,
    ) -> RetryDecision
    where
        R: RngCore + ?Sized,
    {
        if state.attempt >= state.give_up_after {
            return RetryDecision::Exhausted;
        }

        let delay = self.delay_for_attempt(state.attempt, retry_after_hint_ms);
        RetryDecision::Delay(self.apply_jitter(delay, rng))
    }

    fn apply_jitter<R>(&self, delay: Duration, rng: &mut R) -> Duration
    where
        R: RngCore + ?Sized,
    {
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let factor = rng.gen_range(-self.jitter_ratio..=self.jitter_ratio);
        let jittered = delay.as_millis() as f64 * (1.0 + factor);
        let millis = (jittered.round() as u64).min(self.max_jittered_delay().as_millis() as u64);
        Duration::from_millis(millis)
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS)
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn decide(
        scheduler: &RetryScheduler,
        state: &mut RetryState,
        rng: &mut StdRng,
    ) -> RetryDecision {
        let decision = scheduler.next(state, None, rng);
        if let RetryDecision::Delay(delay) = decision {
            state.record(delay);
        }
        decision
    }

    #[test]
    fn starts_with_base_delay() {
        let scheduler = RetryScheduler::new(250, 8_000);
        assert_eq!(
            scheduler.delay_for_attempt(0, None),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn scales_exponentially_for_attempts() {
        let scheduler = RetryScheduler::new(100, 10_000);
        assert_eq!(
            scheduler.delay_for_attempt(3, None),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn caps_delay_at_max() {
        let scheduler = RetryScheduler::new(1_000, 4_000);
        assert_eq!(
            scheduler.delay_for_attempt(5, None),
            Duration::from_millis(4_000)
        );
    }

    #[test]
    fn honors_retry_after_hint_when_larger() {
        let scheduler = RetryScheduler::default();
        assert_eq!(
            scheduler.delay_for_attempt(1, Some(10_000)),
            Duration::from_millis(10_000)
        );
        assert_eq!(
            scheduler.delay_for_attempt(0, Some(90_000)),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn zero_jitter_yields_exact_doubling_sequence() {
        let scheduler = RetryScheduler::default().with_jitter_ratio(0.0);
        let mut state = scheduler.fresh_state();
        let mut rng = StdRng::seed_from_u64(1);

        let delays: Vec<_> = (0..5)
            .map(|_| match decide(&scheduler, &mut state, &mut rng) {
                RetryDecision::Delay(delay) => delay.as_millis() as u64,
                RetryDecision::Exhausted => panic!("budget should not be spent yet"),
            })
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
    }

    #[test]
    fn exhausts_exactly_on_sixth_failure() {
        let scheduler = RetryScheduler::default();
        let mut state = scheduler.fresh_state();
        let mut rng = StdRng::seed_from_u64(7);

        for failure in 1..=5 {
            assert!(
                matches!(
                    decide(&scheduler, &mut state, &mut rng),
                    RetryDecision::Delay(_)
                ),
                "failure {failure} should still be retried"
            );
        }
        assert_eq!(
            decide(&scheduler, &mut state, &mut rng),
            RetryDecision::Exhausted
        );
        assert!(state.is_exhausted());
    }

    #[test]
    fn jittered_delays_stay_within_twenty_percent_and_cap() {
        let scheduler = RetryScheduler::new(1_000, 30_000).with_max_attempts(12);
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut state = scheduler.fresh_state();
            while let RetryDecision::Delay(delay) = scheduler.next(&state, None, &mut rng) {
                let nominal = scheduler.delay_for_attempt(state.attempt, None).as_millis() as f64;
                let actual = delay.as_millis() as f64;
                assert!(actual >= (nominal * 0.8).floor(), "seed {seed}: {actual} < 80% of {nominal}");
                assert!(actual <= (nominal * 1.2).ceil(), "seed {seed}: {actual} > 120% of {nominal}");
                assert!(delay <= scheduler.max_jittered_delay());
                state.record(delay);
            }
        }
        assert_eq!(scheduler.max_jittered_delay(), Duration::from_millis(36_000));
    }

    #[test]
    fn same_seed_reproduces_same_delays() {
        let scheduler = RetryScheduler::default();
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut state = scheduler.fresh_state();
            (0..5)
                .map(|_| decide(&scheduler, &mut state, &mut rng))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn reset_restores_full_budget() {
        let scheduler = RetryScheduler::default();
        let mut state = scheduler.fresh_state();
        state.record(Duration::from_secs(1));
        state.record(Duration::from_secs(2));
        state.reset();
        assert_eq!(state.attempt, 0);
        assert_eq!(state.next_delay_ms, 0);
        assert_eq!(state.give_up_after, 5);
    }
}
