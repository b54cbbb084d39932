//! Jittered exponential backoff for lock contention and transient RPC
//! retries (§4.3.2: "start ~500ms, cap ~30s, jittered").

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            floor,
            cap,
            attempt: 0,
        }
    }

    /// The scheduler's default contention backoff.
    pub fn lock_contention() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }

    /// Compute the next delay and advance the attempt counter. Full jitter:
    /// uniform in `[0, min(cap, floor * 2^attempt)]`.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.floor.as_millis().saturating_mul(1u128 << self.attempt.min(20));
        let bound = exp.min(self.cap.as_millis()).max(1);
        self.attempt += 1;
        let jittered = rand::thread_rng().gen_range(0..=bound);
        Duration::from_millis(jittered as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_cap() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        for _ in 0..50 {
            let d = b.next_delay();
            assert!(d <= Duration::from_secs(30));
        }
    }
}
