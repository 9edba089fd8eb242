//! Reconnect backoff: exponential delay with jitter and a bounded budget.
//!
//! Delay for attempt `n` is `min(base * multiplier^n, ceiling)` widened by
//! a uniform `± jitter_ratio` and clamped back under the ceiling. Jitter
//! spreads simultaneous reconnects from many clients after a server restart
//! so they do not arrive as one thundering herd. The jitter source is a
//! crate-local xorshift64 generator; randomness here needs speed and spread,
//! not cryptographic quality.
//!
//! The budget is consumed by [`Backoff::next_delay`]; once `max_attempts`
//! delays have been handed out, [`Backoff::exhausted`] turns true and the
//! session settles in the terminal disconnected state until an explicit
//! `connect()` resets the calculator.

use std::time::Duration;

use crate::config::ReconnectPolicy;

#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    rng_state: u64,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9E37_79B9)
                | 1,
        }
    }

    /// Fast PRNG for jitter (xorshift64), uniform in [0, 1).
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    /// Delay for a given attempt with an explicit jitter sample in [-1, 1].
    /// Pure, so the bound invariant is directly testable.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let raw = (self.policy.base_delay_ms as f64) * self.policy.multiplier.powi(attempt as i32);
        let capped = raw.min(self.policy.max_delay_ms as f64);
        let jittered = capped * (1.0 + self.policy.jitter_ratio * unit.clamp(-1.0, 1.0));
        let bounded = jittered.clamp(0.0, self.policy.max_delay_ms as f64);
        Duration::from_millis(bounded.round() as u64)
    }

    /// Consume one unit of the retry budget and return the delay to wait
    /// before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let unit = self.next_random() * 2.0 - 1.0;
        let delay = self.delay_with_jitter(self.attempt, unit);
        self.attempt += 1;
        delay
    }

    /// Retries scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True once the whole retry budget has been consumed.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    /// Clear the budget after a successful connection or an explicit
    /// user-triggered connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
