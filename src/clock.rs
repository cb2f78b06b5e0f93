//! Cycle-based poll budgets.
//!
//! Timeouts are expressed in timestamp-counter cycles so the polling hot
//! path never makes a wall-clock syscall. The cycle rate is measured once
//! per session against a known sleep.

use std::time::{Duration, Instant};

/// Calibration sleep; long enough to keep the measured rate stable.
const CALIBRATE_MS: u64 = 25;

/// A calibrated cycle clock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CycleClock {
    cycles_per_sec: u64,
}

impl CycleClock {
    /// Measure the cycle rate over a fixed sleep.
    pub fn calibrate() -> Self {
        let wall = Instant::now();
        let start = Self::now();
        std::thread::sleep(Duration::from_millis(CALIBRATE_MS));
        let cycles = Self::now().wrapping_sub(start);
        let elapsed = wall.elapsed();

        let cycles_per_sec = (cycles as u128 * 1_000_000_000 / elapsed.as_nanos().max(1)) as u64;
        Self {
            cycles_per_sec: cycles_per_sec.max(1),
        }
    }

    /// Current cycle count.
    #[cfg(target_arch = "x86_64")]
    pub fn now() -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    /// Monotonic nanosecond fallback where no TSC is available.
    #[cfg(not(target_arch = "x86_64"))]
    pub fn now() -> u64 {
        use std::sync::OnceLock;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }

    /// Absolute deadline `secs` from now. A zero timeout yields a deadline
    /// that is already due, which still permits one completion sweep.
    pub fn deadline(&self, secs: u64) -> u64 {
        Self::now().saturating_add(secs.saturating_mul(self.cycles_per_sec))
    }

    pub fn expired(deadline: u64) -> bool {
        Self::now() >= deadline
    }
}
