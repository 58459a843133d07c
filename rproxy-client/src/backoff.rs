//! Hand-rolled exponential backoff for the control-channel dialer (spec.md §4.7).
//!
//! The policy is specific enough (double from 2s, cap at 60s, reset to 1s on the attempt *after*
//! the cap is hit, reset to 1s on success) that it doesn't match the teacher's `backoff = "0.4"`
//! dependency's generic `ExponentialBackoff`, so this is a small hand-rolled state machine
//! instead of reusing that crate (see DESIGN.md).

use std::time::Duration;

const INITIAL: Duration = Duration::from_secs(2);
const CAP: Duration = Duration::from_secs(60);
const RESET: Duration = Duration::from_secs(1);

pub struct Backoff {
    next: Duration,
    hit_cap_last_attempt: bool,
}

impl Backoff {
    pub fn new() -> Self {
        Self { next: INITIAL, hit_cap_last_attempt: false }
    }

    /// Delay to wait before the next connect attempt; advances internal state for the attempt
    /// after that.
    pub fn next_delay(&mut self) -> Duration {
        if self.hit_cap_last_attempt {
            self.hit_cap_last_attempt = false;
            self.next = RESET;
            return RESET;
        }

        let delay = self.next;
        if delay >= CAP {
            self.hit_cap_last_attempt = true;
            self.next = CAP;
        } else {
            self.next = (delay * 2).min(CAP);
        }
        delay
    }

    /// Called once a connect attempt has succeeded (spec.md §4.7: "a successful connect resets
    /// backoff to 1 s").
    pub fn reset(&mut self) {
        self.next = RESET;
        self.hit_cap_last_attempt = false;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_the_scenario_6_sequence() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 1]);
    }

    #[test]
    fn reset_returns_to_one_second() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay().as_secs(), 1);
        assert_eq!(backoff.next_delay().as_secs(), 2);
    }
}
