//! Wall-clock time derived from the cycle counter.
//!
//! Reading the cycle counter is far cheaper than a clock syscall, so the
//! capture path records the wall clock once at startup ([`MachineStart`])
//! and adds the elapsed cycles to it for every timestamp.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::api::CycleCounter;

const USECS_PER_SEC: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    secs: u64,
    usecs: u32,
}

impl Timestamp {
    pub const fn new(secs: u64, usecs: u32) -> Self {
        Self {
            secs: secs + usecs as u64 / USECS_PER_SEC,
            usecs: (usecs as u64 % USECS_PER_SEC) as u32,
        }
    }

    pub fn secs(&self) -> u64 {
        self.secs
    }

    pub fn usecs(&self) -> u32 {
        self.usecs
    }

    pub fn as_millis(&self) -> u64 {
        self.secs * 1000 + self.usecs as u64 / 1000
    }

    pub fn as_micros(&self) -> u64 {
        self.secs * USECS_PER_SEC + self.usecs as u64
    }
}

pub fn cycles_to_micros(cycles: u64, hz: u64) -> u64 {
    let ticks_per_us = hz / USECS_PER_SEC;
    if ticks_per_us == 0 {
        return 0;
    }
    cycles / ticks_per_us
}

pub fn cycles_to_secs(cycles: u64, hz: u64) -> u64 {
    if hz == 0 {
        return 0;
    }
    cycles / hz
}

/// Seconds elapsed since the cycle counter was reset (usually machine boot).
pub fn counter_secs(counter: &impl CycleCounter) -> u64 {
    cycles_to_secs(counter.cycles(), counter.cycles_hz())
}

/// Wall clock at the instant the cycle counter read zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MachineStart {
    start: Timestamp,
}

impl MachineStart {
    /// Samples the wall clock and rewinds it by the counter's uptime.
    pub fn record(counter: &impl CycleCounter) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = now.as_secs().saturating_sub(counter_secs(counter));
        Self {
            start: Timestamp::new(secs, now.subsec_micros()),
        }
    }

    pub const fn at(start: Timestamp) -> Self {
        Self { start }
    }

    pub fn get(&self) -> Timestamp {
        self.start
    }

    /// Wall-clock time corresponding to a counter value.
    pub fn timestamp(&self, cycles: u64, hz: u64) -> Timestamp {
        let usec = cycles_to_micros(cycles, hz) + self.start.usecs as u64;
        Timestamp {
            secs: self.start.secs + usec / USECS_PER_SEC,
            usecs: (usec % USECS_PER_SEC) as u32,
        }
    }

    pub fn now(&self, counter: &impl CycleCounter) -> Timestamp {
        self.timestamp(counter.cycles(), counter.cycles_hz())
    }
}

/// Nanosecond counter backed by the monotonic OS clock.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicCounter {
    origin: Instant,
}

impl MonotonicCounter {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleCounter for MonotonicCounter {
    fn cycles(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn cycles_hz(&self) -> u64 {
        1_000_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_conversions() {
        assert_eq!(cycles_to_micros(2_500_000, 2_500_000_000), 1000);
        assert_eq!(cycles_to_secs(5_000_000_000, 2_500_000_000), 2);
        assert_eq!(cycles_to_micros(10, 999_999), 0);
        assert_eq!(cycles_to_secs(10, 0), 0);
    }

    #[test]
    fn test_timestamp_carries_microseconds() {
        let start = MachineStart::at(Timestamp::new(100, 999_500));
        // 1 GHz counter, 1 ms of cycles
        let ts = start.timestamp(1_000_000, 1_000_000_000);
        assert_eq!(ts.secs(), 101);
        assert_eq!(ts.usecs(), 500);
        assert_eq!(ts.as_millis(), 101_000);
    }
}
