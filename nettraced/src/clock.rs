//! REALTIME/MONOTONIC clock reconciliation.
//!
//! eBPF programs stamp events with `bpf_ktime_get_ns`, which is
//! `CLOCK_MONOTONIC`. Consumers want UNIX-epoch nanoseconds, so the daemon
//! samples the offset once and adds it to every ktime it sees.

use once_cell::sync::OnceCell;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ns(clock_id: libc::clockid_t) -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, uniquely-owned out-parameter for clock_gettime.
    let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    if rc != 0 {
        // Clock access failing on Linux for these clock ids would mean a
        // broken kernel; fall back to a SystemTime read so this never panics.
        return SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
    }
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

fn sample_offset() -> i64 {
    let mut offset = 0i64;
    let mut best_delta = i64::MAX;
    for _ in 0..10 {
        let t1 = now_ns(libc::CLOCK_REALTIME);
        let t2 = now_ns(libc::CLOCK_MONOTONIC);
        let t3 = now_ns(libc::CLOCK_REALTIME);
        let delta = t3 - t1;
        if delta < best_delta {
            best_delta = delta;
            let ts = (t1 + t3) / 2;
            offset = ts - t2;
        }
    }
    offset
}

/// Cached REALTIME−MONOTONIC offset, computed once on first use.
#[derive(Debug, Default)]
pub struct KernelClock {
    offset: OnceCell<i64>,
}

impl KernelClock {
    pub const fn new() -> Self {
        Self {
            offset: OnceCell::new(),
        }
    }

    /// Offset in nanoseconds: add this to a `CLOCK_MONOTONIC` ktime value to
    /// get UNIX-epoch nanoseconds.
    pub fn offset_ns(&self) -> i64 {
        *self.offset.get_or_init(sample_offset)
    }

    /// Convert a kernel monotonic timestamp to UNIX-epoch nanoseconds.
    pub fn to_unix_ns(&self, ktime_ns: u64) -> u64 {
        (ktime_ns as i64 + self.offset_ns()).max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_is_stable_across_calls() {
        let clock = KernelClock::new();
        let a = clock.offset_ns();
        let b = clock.offset_ns();
        assert_eq!(a, b);
    }

    #[test]
    fn offset_roughly_matches_wall_clock() {
        let clock = KernelClock::new();
        let monotonic_now = now_ns(libc::CLOCK_MONOTONIC);
        let converted = clock.to_unix_ns(monotonic_now as u64);
        let wall_now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as i64;
        let drift_ms = (converted as i64 - wall_now_ns).abs() / 1_000_000;
        assert!(drift_ms < 1000, "drift too large: {drift_ms}ms");
    }
}
