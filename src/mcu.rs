// src/mcu.rs
// Host view of a micro-controller: the typed commands this crate sends, the
// responses it listens for, and the transport seam implemented elsewhere.

use std::fmt;

use thiserror::Error;

use crate::clocksync::McuClock;

/// Errors reported by the transport layer for a single command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("timeout waiting for response to '{0}'")]
    Timeout(String),
    #[error("mcu '{0}' disconnected")]
    Disconnected(String),
    #[error("mcu '{mcu}' shutdown: {reason}")]
    Shutdown { mcu: String, reason: String },
    #[error("unexpected response to '{command}': {response}")]
    UnexpectedResponse { command: String, response: String },
}

impl TransportError {
    /// True when the MCU side state is gone (restart, disconnect) and any
    /// running session has to be set up again.
    pub fn is_session_loss(&self) -> bool {
        matches!(self, TransportError::Disconnected(_) | TransportError::Shutdown { .. })
    }

    pub(crate) fn unexpected(command: &McuCommand, response: &McuResponse) -> Self {
        TransportError::UnexpectedResponse {
            command: command.name().to_string(),
            response: format!("{:?}", response),
        }
    }
}

/// Stop reasons reported by a trsync object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerReason {
    EndstopHit,
    CommsTimeout,
    HostRequest,
    PastEndTime,
    Other(u8),
}

impl TriggerReason {
    pub fn code(self) -> u8 {
        match self {
            TriggerReason::EndstopHit => 1,
            TriggerReason::CommsTimeout => 2,
            TriggerReason::HostRequest => 3,
            TriggerReason::PastEndTime => 4,
            TriggerReason::Other(code) => code,
        }
    }
}

impl From<u8> for TriggerReason {
    fn from(code: u8) -> Self {
        match code {
            1 => TriggerReason::EndstopHit,
            2 => TriggerReason::CommsTimeout,
            3 => TriggerReason::HostRequest,
            4 => TriggerReason::PastEndTime,
            other => TriggerReason::Other(other),
        }
    }
}

/// Commands sent to the MCU. Clock fields are the low 32 bits, as on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum McuCommand {
    ConfigLoadCellEndstop {
        oid: u8,
    },
    /// Arms the endstop. All zeros clears the trsync association.
    LoadCellEndstopHome {
        oid: u8,
        trsync_oid: u8,
        trigger_reason: u8,
        clock: u32,
        sample_count: u8,
        rest_ticks: u32,
        timeout: u32,
    },
    SetRange {
        oid: u8,
        trigger_counts: u32,
        tare_counts: i32,
    },
    QueryEndstopState {
        oid: u8,
    },
    AttachEndstop {
        oid: u8,
        endstop_oid: u8,
    },
    ConfigTrsync {
        oid: u8,
    },
    TrsyncStart {
        oid: u8,
        report_clock: u32,
        report_ticks: u32,
        expire_reason: u8,
    },
    TrsyncSetTimeout {
        oid: u8,
        clock: u32,
    },
    /// Forces a trigger; as a query it answers with the final trsync_state.
    TrsyncTrigger {
        oid: u8,
        reason: u8,
    },
    StepperStopOnTrigger {
        oid: u8,
        trsync_oid: u8,
    },
    /// Starts (rest_ticks > 0) or stops (rest_ticks == 0) bulk sampling.
    QuerySensor {
        oid: u8,
        rest_ticks: u32,
    },
    QuerySensorStatus {
        oid: u8,
    },
}

impl McuCommand {
    pub fn name(&self) -> &'static str {
        match self {
            McuCommand::ConfigLoadCellEndstop { .. } => "config_load_cell_endstop",
            McuCommand::LoadCellEndstopHome { .. } => "load_cell_endstop_home",
            McuCommand::SetRange { .. } => "set_range_load_cell_endstop",
            McuCommand::QueryEndstopState { .. } => "load_cell_endstop_query_state",
            McuCommand::AttachEndstop { .. } => "attach_load_cell_endstop",
            McuCommand::ConfigTrsync { .. } => "config_trsync",
            McuCommand::TrsyncStart { .. } => "trsync_start",
            McuCommand::TrsyncSetTimeout { .. } => "trsync_set_timeout",
            McuCommand::TrsyncTrigger { .. } => "trsync_trigger",
            McuCommand::StepperStopOnTrigger { .. } => "stepper_stop_on_trigger",
            McuCommand::QuerySensor { .. } => "query_load_cell_sensor",
            McuCommand::QuerySensorStatus { .. } => "query_load_cell_sensor_status",
        }
    }

    /// Disarm form of the home command.
    pub fn clear_home(oid: u8) -> Self {
        McuCommand::LoadCellEndstopHome {
            oid,
            trsync_oid: 0,
            trigger_reason: 0,
            clock: 0,
            sample_count: 0,
            rest_ticks: 0,
            timeout: 0,
        }
    }
}

impl fmt::Display for McuCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        match self {
            McuCommand::ConfigLoadCellEndstop { oid }
            | McuCommand::QueryEndstopState { oid }
            | McuCommand::ConfigTrsync { oid }
            | McuCommand::QuerySensorStatus { oid } => write!(f, " oid={}", oid),
            McuCommand::LoadCellEndstopHome {
                oid,
                trsync_oid,
                trigger_reason,
                clock,
                sample_count,
                rest_ticks,
                timeout,
            } => write!(
                f,
                " oid={} trsync_oid={} trigger_reason={} clock={} sample_count={} rest_ticks={} timeout={}",
                oid, trsync_oid, trigger_reason, clock, sample_count, rest_ticks, timeout
            ),
            McuCommand::SetRange { oid, trigger_counts, tare_counts } => write!(
                f,
                " oid={} trigger_counts={} tare_counts={}",
                oid, trigger_counts, tare_counts
            ),
            McuCommand::AttachEndstop { oid, endstop_oid } => {
                write!(f, " oid={} load_cell_endstop_oid={}", oid, endstop_oid)
            }
            McuCommand::TrsyncStart { oid, report_clock, report_ticks, expire_reason } => write!(
                f,
                " oid={} report_clock={} report_ticks={} expire_reason={}",
                oid, report_clock, report_ticks, expire_reason
            ),
            McuCommand::TrsyncSetTimeout { oid, clock } => write!(f, " oid={} clock={}", oid, clock),
            McuCommand::TrsyncTrigger { oid, reason } => write!(f, " oid={} reason={}", oid, reason),
            McuCommand::StepperStopOnTrigger { oid, trsync_oid } => {
                write!(f, " oid={} trsync_oid={}", oid, trsync_oid)
            }
            McuCommand::QuerySensor { oid, rest_ticks } => write!(f, " oid={} rest_ticks={}", oid, rest_ticks),
        }
    }
}

/// Messages received from the MCU.
#[derive(Debug, Clone, PartialEq)]
pub enum McuResponse {
    TrsyncState {
        oid: u8,
        can_trigger: bool,
        trigger_reason: u8,
        clock: u32,
    },
    EndstopState {
        oid: u8,
        homing: bool,
        homing_triggered: bool,
        is_triggered: bool,
        trigger_ticks: u32,
        sample: i32,
        sample_ticks: u32,
    },
    SensorBulkData {
        oid: u8,
        sequence: u16,
        data: Vec<u8>,
    },
    SensorBulkStatus {
        oid: u8,
        clock: u32,
        query_ticks: u32,
        next_sequence: u16,
        buffered: u8,
        possible_overflows: u16,
    },
}

impl McuResponse {
    pub fn kind(&self) -> ResponseKind {
        match self {
            McuResponse::TrsyncState { .. } => ResponseKind::TrsyncState,
            McuResponse::EndstopState { .. } => ResponseKind::EndstopState,
            McuResponse::SensorBulkData { .. } => ResponseKind::SensorBulkData,
            McuResponse::SensorBulkStatus { .. } => ResponseKind::SensorBulkStatus,
        }
    }

    pub fn oid(&self) -> u8 {
        match self {
            McuResponse::TrsyncState { oid, .. }
            | McuResponse::EndstopState { oid, .. }
            | McuResponse::SensorBulkData { oid, .. }
            | McuResponse::SensorBulkStatus { oid, .. } => *oid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    TrsyncState,
    EndstopState,
    SensorBulkData,
    SensorBulkStatus,
}

/// Callback for unsolicited responses. May run on the transport's thread.
pub type ResponseHandler = Box<dyn Fn(&McuResponse) + Send + Sync>;

/// Transport seam to one MCU. Implementations own the serial link, the
/// message dictionary and the clock synchronisation for that MCU.
pub trait Mcu: Send + Sync {
    fn get_name(&self) -> String;
    fn create_oid(&self) -> u8;
    fn add_config_cmd(&self, cmd: McuCommand, on_restart: bool);

    /// Queue a command, not to be transmitted before `reqclock`.
    fn send(&self, cmd: McuCommand, reqclock: u64) -> Result<(), TransportError>;
    fn send_wait_ack(&self, cmd: McuCommand) -> Result<(), TransportError>;
    fn query(&self, cmd: McuCommand) -> Result<McuResponse, TransportError>;

    /// `None` removes the handler for (`kind`, `oid`).
    fn register_response(&self, kind: ResponseKind, oid: u8, handler: Option<ResponseHandler>);

    /// Current conversion state for this MCU's clock.
    fn clock(&self) -> McuClock;

    fn print_time_to_clock(&self, print_time: f64) -> u64 {
        self.clock().print_time_to_clock(print_time)
    }

    fn clock_to_print_time(&self, clock: f64) -> f64 {
        self.clock().clock_to_print_time(clock)
    }

    fn seconds_to_clock(&self, seconds: f64) -> u64 {
        self.clock().seconds_to_clock(seconds)
    }

    fn clock32_to_clock64(&self, clock32: u32) -> u64 {
        self.clock().clock32_to_clock64(clock32)
    }
}
