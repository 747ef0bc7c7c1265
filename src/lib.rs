// src/lib.rs

// Host side of the load cell: sample timestamping for bulk ADC sensors and
// load cell homing coordinated across one or more MCUs.

pub mod bulk_sensor;
pub mod bus;
pub mod clocksync;
pub mod configfile;
pub mod error;
pub mod mcu;
pub mod reactor;
pub mod stepper;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod trsync;

// Printer objects built on top of the core (load cell, endstop, chip table)
pub mod extras;

pub use error::{Error, Result};
