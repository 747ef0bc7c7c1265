// src/error.rs

use thiserror::Error;

use crate::configfile::ConfigError;
use crate::mcu::TransportError;

/// Errors surfaced by the load cell sampling and homing code.
#[derive(Debug, Error)]
pub enum Error {
    /// Setup-time configuration problem. Fatal: the object is not created.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Homing requested before the load cell has a tare and a gain.
    #[error("{0}")]
    Calibration(String),

    /// At least one MCU missed its trigger window, the result of the move
    /// cannot be trusted.
    #[error("communication timeout during homing")]
    CommsTimeout,

    #[error("transport fault: {0}")]
    Transport(#[from] TransportError),

    /// The MCU restarted or disconnected under a running sensor session.
    #[error("sensor '{0}' lost its acquisition session")]
    SessionLost(String),

    #[error(
        "Failed to set {chip} register [{register:#x}] to {expected}: got {observed}. \
         This may be a connection problem (e.g. faulty wiring)"
    )]
    Verification {
        chip: String,
        register: u8,
        expected: String,
        observed: String,
    },

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
