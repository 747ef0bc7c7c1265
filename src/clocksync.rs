// src/clocksync.rs
// Linear mappings between MCU clock ticks and host time.

/// Snapshot of a linear tick -> time mapping:
/// `time = time_base + (ticks - chip_base) * inv_freq`.
///
/// Producers refit the mapping periodically; consumers take one snapshot per
/// batch so a refit never lands in the middle of a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSyncModel {
    pub time_base: f64,
    pub chip_base: f64,
    pub inv_freq: f64,
}

impl ClockSyncModel {
    pub fn time_of(&self, ticks: f64) -> f64 {
        self.time_base + (ticks - self.chip_base) * self.inv_freq
    }

    /// Inverse of [`ClockSyncModel::time_of`]. Returns `chip_base` for a
    /// degenerate (zero slope) model.
    pub fn ticks_of(&self, time: f64) -> f64 {
        if self.inv_freq == 0.0 {
            return self.chip_base;
        }
        self.chip_base + (time - self.time_base) / self.inv_freq
    }
}

/// Print time <-> clock conversions for one MCU, plus the last 64-bit clock
/// seen, which anchors the extension of 32-bit clocks from responses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct McuClock {
    mcu_freq: f64,
    last_clock: u64,
}

impl McuClock {
    pub fn new(mcu_freq: f64) -> Self {
        Self { mcu_freq, last_clock: 0 }
    }

    pub fn mcu_freq(&self) -> f64 {
        self.mcu_freq
    }

    pub fn last_clock(&self) -> u64 {
        self.last_clock
    }

    /// Records a clock reported by the MCU.
    pub fn note_clock(&mut self, clock: u64) {
        self.last_clock = clock;
    }

    pub fn print_time_to_clock(&self, print_time: f64) -> u64 {
        (print_time * self.mcu_freq).round().max(0.0) as u64
    }

    pub fn clock_to_print_time(&self, clock: f64) -> f64 {
        clock / self.mcu_freq
    }

    pub fn seconds_to_clock(&self, seconds: f64) -> u64 {
        (seconds * self.mcu_freq).round().max(0.0) as u64
    }

    /// Extends a 32-bit clock to the 64-bit value nearest the last clock seen.
    pub fn clock32_to_clock64(&self, clock32: u32) -> u64 {
        let last_clock = self.last_clock as i64;
        let mut clock_diff = (clock32 as i64 - (last_clock & 0xffff_ffff)) & 0xffff_ffff;
        clock_diff -= (clock_diff & 0x8000_0000) << 1;
        (last_clock + clock_diff).max(0) as u64
    }
}
