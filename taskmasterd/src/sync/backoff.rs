use rand::Rng;
use std::time::Duration;

/// Exponential delay for retrying after failed cycles, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay after `failures` consecutive failed cycles. Zero failures means no delay.
    pub fn delay(&self, failures: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(failures, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = (failures - 1).min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        // Equal jitter: half fixed, half random.
        let delay_ms = if self.jitter {
            let half = exp / 2;
            half + rng.gen_range(0..=exp - half)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}
