// Timing helpers
//
// Used for log timestamps and for measuring how long transfers take
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch
pub fn get_current_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Measures the time between `start` and `end`
pub struct StopWatch {
    sw_start: Option<Instant>,
    sw_end: Option<Instant>,
}

impl StopWatch {
    pub fn new() -> Self {
        Self {
            sw_start: None,
            sw_end: None,
        }
    }

    pub fn start(&mut self) {
        self.sw_start = Some(Instant::now());
        self.sw_end = None;
    }

    pub fn end(&mut self) {
        self.sw_end = Some(Instant::now());
    }

    /// Time elapsed between start and end
    ///
    /// If the watch is still running this is the time since start.
    pub fn get_duration(&self) -> Duration {
        match (self.sw_start, self.sw_end) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

impl Default for StopWatch {
    fn default() -> Self {
        Self::new()
    }
}
