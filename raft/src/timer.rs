use rand::Rng;
use std::{future, time::Duration};
use tokio::time::{self, Instant};

pub fn random_timeout(low_ms: u64, high_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let ms: u64 = rng.gen_range(low_ms..high_ms);
    Duration::from_millis(ms)
}

/// Completes at `deadline`, or never when the timer is stopped.
pub async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending::<()>().await,
    }
}

/// Fires when no leader has been heard from within a randomized window.
#[derive(Debug)]
pub struct ElectionTimer {
    low_ms: u64,
    high_ms: u64,
    deadline: Option<Instant>,
}

impl ElectionTimer {
    pub fn new(low_ms: u64, high_ms: u64) -> Self {
        Self {
            low_ms,
            high_ms,
            deadline: None,
        }
    }

    /// Restart with a freshly drawn timeout.
    pub fn reset_with_different_timeout(&mut self) {
        self.deadline = Some(Instant::now() + random_timeout(self.low_ms, self.high_ms));
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Fixed-interval tick that drives leader replication.
#[derive(Debug)]
pub struct HeartbeatTimer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl HeartbeatTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    pub fn reset(&mut self) {
        self.deadline = Some(Instant::now() + self.interval);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_timeout_stays_in_range() {
        for _ in 0..200 {
            let t = random_timeout(150, 300);
            assert!(t >= Duration::from_millis(150));
            assert!(t < Duration::from_millis(300));
        }
    }

    #[tokio::test]
    async fn election_timer_reset_and_stop() {
        let mut timer = ElectionTimer::new(10, 20);
        assert!(!timer.is_running());

        timer.reset_with_different_timeout();
        let deadline = timer.deadline().unwrap();
        assert!(deadline > Instant::now());
        assert!(deadline <= Instant::now() + Duration::from_millis(20));

        timer.stop();
        assert!(timer.deadline().is_none());
    }

    #[tokio::test]
    async fn stopped_timer_never_expires() {
        let fired = time::timeout(Duration::from_millis(30), expire(None)).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn heartbeat_timer_expires_after_interval() {
        let mut timer = HeartbeatTimer::new(Duration::from_millis(5));
        timer.reset();
        let fired = time::timeout(Duration::from_millis(500), expire(timer.deadline())).await;
        assert!(fired.is_ok());
    }
}
