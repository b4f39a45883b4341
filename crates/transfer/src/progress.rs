use std::time::{Duration, Instant};

/// Default minimum spacing between rate samples.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);

/// Instantaneous transfer rate over the last sampling interval.
///
/// Each sample compares the cumulative byte count with the previous
/// sample; no averaging across intervals. Samples closer together than
/// the interval are folded into the next one.
#[derive(Debug, Clone)]
pub struct RateSampler {
    interval: Duration,
    last: Option<(u64, Instant)>,
    bytes_per_second: f64,
}

impl Default for RateSampler {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RateSampler {
    /// Creates a sampler. If `interval` is `None`, defaults to 250 ms.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval: interval.unwrap_or(DEFAULT_INTERVAL),
            last: None,
            bytes_per_second: 0.0,
        }
    }

    /// Records the cumulative byte count at the current instant.
    pub fn record(&mut self, total_bytes: u64) -> f64 {
        self.record_at(total_bytes, Instant::now())
    }

    /// Records the cumulative byte count at `now` and returns the rate.
    pub fn record_at(&mut self, total_bytes: u64, now: Instant) -> f64 {
        match self.last {
            None => self.last = Some((total_bytes, now)),
            Some((prev_bytes, prev_at)) => {
                let elapsed = now.saturating_duration_since(prev_at);
                if elapsed >= self.interval && !elapsed.is_zero() {
                    let delta = total_bytes.saturating_sub(prev_bytes);
                    self.bytes_per_second = delta as f64 / elapsed.as_secs_f64();
                    self.last = Some((total_bytes, now));
                }
            }
        }
        self.bytes_per_second
    }

    /// Returns the latest rate in bytes/second.
    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_per_second
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` while the rate is unknown.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        if self.bytes_per_second <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            remaining_bytes as f64 / self.bytes_per_second,
        ))
    }

    /// Forgets all samples (e.g. after a pause).
    pub fn reset(&mut self) {
        self.last = None;
        self.bytes_per_second = 0.0;
    }
}
