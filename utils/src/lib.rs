// A set of helper structs for common operations
//
// Shared by strata and the quarry demo
pub mod logging;
pub mod timing;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};

/// Round `value` up to the next multiple of `align`
///
/// `align` must be a power of two.
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 16), 272);
    }

    #[test]
    fn stopwatch_measures_forward() {
        let mut sw = timing::StopWatch::new();
        sw.start();
        sw.end();
        assert!(sw.get_duration().as_nanos() < 1_000_000_000);
    }
}
