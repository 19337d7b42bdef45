//! Simulated-time reading.

use tokio::time::Instant;

/// Monotonic simulated clock, measured from the instant the simulation was
/// built. Cheap to clone; every node and actor carries one.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    epoch: Instant,
}

impl SimClock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Simulated seconds elapsed since the simulation epoch.
    pub fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Sleep until an absolute simulated time (seconds since the epoch).
    /// Instants in the past return immediately.
    pub async fn sleep_until_secs(&self, deadline: f64) {
        let now = self.now_secs();
        if deadline > now {
            tokio::time::sleep_until(self.epoch + std::time::Duration::from_secs_f64(deadline))
                .await;
        }
    }
}
