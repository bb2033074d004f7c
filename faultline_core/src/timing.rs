use crate::config::ConfigError;
use rand::Rng;
use std::time::Duration;

/// A closed `[min, max]` range from which a concrete duration is drawn once per run.
///
/// Used both for the pre-injection delay and for the post-start timeout. The two draws are
/// independent, so a run may legitimately time out before its injection delay elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingWindow {
    min: Duration,
    max: Duration,
}

impl TimingWindow {
    /// Creates a window, rejecting `min > max`. `name` only labels the error.
    pub fn new(name: &str, min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvalidWindow {
                name: name.to_string(),
                min_ms: min.as_millis() as u64,
                max_ms: max.as_millis() as u64,
            });
        }
        Ok(Self { min, max })
    }

    pub fn from_millis(name: &str, min_ms: u64, max_ms: u64) -> Result<Self, ConfigError> {
        Self::new(
            name,
            Duration::from_millis(min_ms),
            Duration::from_millis(max_ms),
        )
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Draws a duration uniformly at millisecond granularity, both ends included.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rng.random_range(min_ms..=max_ms))
    }
}

/// The two windows that shape a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTiming {
    pub timeout: TimingWindow,
    pub injection_delay: TimingWindow,
}
