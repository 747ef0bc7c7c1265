// src/bus.rs
// Register level access to an ADC chip, used during device setup.

use log::debug;

use crate::error::{Error, Result};
use crate::mcu::TransportError;

/// One register block write: `values` starting at `register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterWrite {
    pub register: u8,
    pub values: Vec<u8>,
}

impl RegisterWrite {
    pub fn new(register: u8, values: impl Into<Vec<u8>>) -> Self {
        Self {
            register,
            values: values.into(),
        }
    }
}

/// SPI/I2C style register access. The framing is the implementor's business.
pub trait RegisterBus {
    fn write_registers(&mut self, register: u8, values: &[u8]) -> std::result::Result<(), TransportError>;
    fn read_registers(&mut self, register: u8, count: usize) -> std::result::Result<Vec<u8>, TransportError>;
}

/// Formats bytes as `[0xff, 0x1]`.
pub fn hexify(bytes: &[u8]) -> String {
    let parts: Vec<String> = bytes.iter().map(|b| format!("{:#x}", b)).collect();
    format!("[{}]", parts.join(", "))
}

/// Writes `write` and reads it back. A mismatch usually means bad wiring.
pub fn write_verified(bus: &mut dyn RegisterBus, chip: &str, write: &RegisterWrite) -> Result<()> {
    bus.write_registers(write.register, &write.values)?;
    let stored = bus.read_registers(write.register, write.values.len())?;
    let expected = hexify(&write.values);
    let observed = hexify(&stored);
    if expected != observed {
        return Err(Error::Verification {
            chip: chip.to_string(),
            register: write.register,
            expected,
            observed,
        });
    }
    debug!("{} register {:#x} set to {}", chip, write.register, expected);
    Ok(())
}
