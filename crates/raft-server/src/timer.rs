//! # timer
//!
//! why: randomized election timeouts so split votes resolve themselves
//! relations: owned by raft.rs inside the node lock
//! what: random_election_timeout, ElectionTimer

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = (max.as_millis() as u64).max(min_ms);
    let timeout_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Restartable election deadline.
///
/// Kept inside the node's lock so a reset from an rpc handler and the
/// run-loop's expiry check can't interleave.
#[derive(Debug)]
pub struct ElectionTimer {
    min: Duration,
    max: Duration,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            deadline: Instant::now() + random_election_timeout(min, max),
        }
    }

    /// push the deadline out by a fresh random timeout
    pub fn reset(&mut self) {
        self.deadline = Instant::now() + random_election_timeout(self.min, self.max);
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_stays_in_window() {
        let min = Duration::from_millis(400);
        let max = Duration::from_millis(550);
        for _ in 0..200 {
            let t = random_election_timeout(min, max);
            assert!(t >= min && t <= max, "{t:?} outside window");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_expires_and_resets() {
        let mut timer = ElectionTimer::new(Duration::from_millis(100), Duration::from_millis(150));
        assert!(!timer.is_expired());

        tokio::time::advance(Duration::from_millis(151)).await;
        assert!(timer.is_expired());

        timer.reset();
        assert!(!timer.is_expired());
        assert!(timer.deadline() > Instant::now());
    }
}
