use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("execution deadline exceeded: budget {budget:?}, elapsed {elapsed:?}")]
pub struct DeadlineExceeded {
    pub budget: Duration,
    pub elapsed: Duration,
}

/// Wall-clock budget for one sandbox run, polled by every stand-in.
#[derive(Debug, Clone)]
pub struct TimeoutChecker {
    start: Instant,
    budget: Duration,
}

impl TimeoutChecker {
    pub fn new(budget: Duration) -> Self {
        Self { start: Instant::now(), budget }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    pub fn check(&self) -> Result<(), DeadlineExceeded> {
        let elapsed = self.start.elapsed();
        if elapsed > self.budget {
            return Err(DeadlineExceeded { budget: self.budget, elapsed });
        }
        Ok(())
    }

    pub fn expired(&self) -> bool {
        self.check().is_err()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.budget.checked_sub(self.start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::TimeoutChecker;
    use std::time::Duration;

    #[test]
    fn zero_budget_expires_immediately() {
        let checker = TimeoutChecker::new(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(1));
        assert!(checker.check().is_err());
        assert!(checker.expired());
    }

    #[test]
    fn generous_budget_has_time_left() {
        let checker = TimeoutChecker::from_millis(60_000);
        assert!(checker.check().is_ok());
        assert!(checker.remaining().is_some());
    }
}
