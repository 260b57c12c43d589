use std::time::Duration;

/// Wall-clock → virtual-tick conversion with remainder accumulation.
///
/// One tick is one retired guest instruction, so the conversion rate is the
/// CPU's configured performance in MIPS (instructions per microsecond). A
/// naive integer conversion of short sleeps can round to zero ticks and
/// stall every clock entry; the converter carries the sub-tick remainder
/// across calls so fractional progress eventually lands.
#[derive(Debug, Clone)]
pub struct TickConverter {
    ticks_per_us: u64,
    remainder: u128,
}

impl TickConverter {
    const NS_PER_US: u128 = 1_000;

    pub fn new(ticks_per_us: u64) -> Self {
        Self {
            ticks_per_us,
            remainder: 0,
        }
    }

    pub fn ticks_per_us(&self) -> u64 {
        self.ticks_per_us
    }

    /// Change the conversion rate, dropping any accumulated remainder.
    pub fn set_ticks_per_us(&mut self, ticks_per_us: u64) {
        self.ticks_per_us = ticks_per_us;
        self.remainder = 0;
    }

    /// Convert an elapsed wall-clock duration into ticks, accumulating the
    /// remainder for the next call.
    pub fn wall_time_to_ticks(&mut self, elapsed: Duration) -> u64 {
        let numer =
            elapsed.as_nanos() * u128::from(self.ticks_per_us) + self.remainder;
        let ticks = numer / Self::NS_PER_US;
        self.remainder = numer % Self::NS_PER_US;
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Duration a sleep must last for `ticks` virtual ticks to elapse.
    pub fn ticks_to_wall_time(&self, ticks: u64) -> Duration {
        if self.ticks_per_us == 0 {
            return Duration::ZERO;
        }
        let ns = (u128::from(ticks) * Self::NS_PER_US) / u128::from(self.ticks_per_us);
        Duration::from_nanos(u64::try_from(ns).unwrap_or(u64::MAX))
    }
}
