// src/test_utils.rs
// Scripted MCU for driving the library without hardware.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clocksync::McuClock;
use crate::mcu::{Mcu, McuCommand, McuResponse, ResponseKind, TransportError, TriggerReason};

pub const MOCK_MCU_FREQ: f64 = 16_000_000.0;

type SharedHandler = Arc<dyn Fn(&McuResponse) + Send + Sync>;

#[derive(Default)]
struct MockState {
    next_oid: u8,
    config_cmds: Vec<(McuCommand, bool)>,
    sent: Vec<(McuCommand, u64)>,
    queried: Vec<McuCommand>,
    trsync_results: HashMap<u8, (TriggerReason, u32)>,
    endstop_states: HashMap<u8, McuResponse>,
    sensor_status: HashMap<u8, McuResponse>,
    failures: HashMap<&'static str, TransportError>,
}

/// Records everything sent to it and answers queries from scripted state.
/// Handlers registered through [`Mcu::register_response`] are invoked by
/// [`MockMcu::deliver`] on the caller's thread.
pub struct MockMcu {
    name: String,
    clock: Mutex<McuClock>,
    state: Mutex<MockState>,
    handlers: Mutex<HashMap<(ResponseKind, u8), SharedHandler>>,
}

impl MockMcu {
    pub fn new(name: &str) -> Self {
        Self::with_freq(name, MOCK_MCU_FREQ)
    }

    pub fn with_freq(name: &str, freq: f64) -> Self {
        Self {
            name: name.to_string(),
            clock: Mutex::new(McuClock::new(freq)),
            state: Mutex::new(MockState::default()),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the 64-bit reference used when extending 32-bit clocks.
    pub fn set_last_clock(&self, clock: u64) {
        self.clock.lock().note_clock(clock);
    }

    pub fn config_cmds(&self) -> Vec<(McuCommand, bool)> {
        self.state.lock().config_cmds.clone()
    }

    pub fn sent_commands(&self) -> Vec<(McuCommand, u64)> {
        self.state.lock().sent.clone()
    }

    /// Sent commands with the given wire name, in order.
    pub fn sent_named(&self, name: &str) -> Vec<McuCommand> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(cmd, _)| cmd.name() == name)
            .map(|(cmd, _)| cmd.clone())
            .collect()
    }

    pub fn queried_commands(&self) -> Vec<McuCommand> {
        self.state.lock().queried.clone()
    }

    pub fn clear_sent(&self) {
        let mut state = self.state.lock();
        state.sent.clear();
        state.queried.clear();
    }

    /// Reply to the next `trsync_trigger` query for `oid`.
    pub fn set_trsync_reason(&self, oid: u8, reason: TriggerReason, clock: u32) {
        self.state.lock().trsync_results.insert(oid, (reason, clock));
    }

    /// Reply to `load_cell_endstop_query_state`. Must be an `EndstopState`.
    pub fn set_endstop_state(&self, state: McuResponse) {
        let oid = state.oid();
        self.state.lock().endstop_states.insert(oid, state);
    }

    /// Reply to `query_load_cell_sensor_status`. Must be a `SensorBulkStatus`.
    pub fn set_sensor_status(&self, status: McuResponse) {
        let oid = status.oid();
        self.state.lock().sensor_status.insert(oid, status);
    }

    /// Every later send or query of `name` fails with `err`.
    pub fn fail_command(&self, name: &'static str, err: TransportError) {
        self.state.lock().failures.insert(name, err);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn has_handler(&self, kind: ResponseKind, oid: u8) -> bool {
        self.handlers.lock().contains_key(&(kind, oid))
    }

    /// Routes `resp` to its registered handler. Returns false if none.
    pub fn deliver(&self, resp: McuResponse) -> bool {
        let handler = self.handlers.lock().get(&(resp.kind(), resp.oid())).cloned();
        match handler {
            Some(handler) => {
                handler(&resp);
                true
            }
            None => false,
        }
    }

    fn check_failure(&self, cmd: &McuCommand) -> Result<(), TransportError> {
        match self.state.lock().failures.get(cmd.name()) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl Mcu for MockMcu {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    fn create_oid(&self) -> u8 {
        let mut state = self.state.lock();
        let oid = state.next_oid;
        state.next_oid += 1;
        oid
    }

    fn add_config_cmd(&self, cmd: McuCommand, on_restart: bool) {
        self.state.lock().config_cmds.push((cmd, on_restart));
    }

    fn send(&self, cmd: McuCommand, reqclock: u64) -> Result<(), TransportError> {
        self.check_failure(&cmd)?;
        self.state.lock().sent.push((cmd, reqclock));
        Ok(())
    }

    fn send_wait_ack(&self, cmd: McuCommand) -> Result<(), TransportError> {
        self.send(cmd, 0)
    }

    fn query(&self, cmd: McuCommand) -> Result<McuResponse, TransportError> {
        self.check_failure(&cmd)?;
        let mut state = self.state.lock();
        state.queried.push(cmd.clone());
        match cmd {
            McuCommand::TrsyncTrigger { oid, reason } => {
                let (reason, clock) = state
                    .trsync_results
                    .get(&oid)
                    .copied()
                    .unwrap_or((TriggerReason::from(reason), 0));
                Ok(McuResponse::TrsyncState {
                    oid,
                    can_trigger: false,
                    trigger_reason: reason.code(),
                    clock,
                })
            }
            McuCommand::QueryEndstopState { oid } => Ok(state.endstop_states.get(&oid).cloned().unwrap_or(
                McuResponse::EndstopState {
                    oid,
                    homing: false,
                    homing_triggered: false,
                    is_triggered: false,
                    trigger_ticks: 0,
                    sample: 0,
                    sample_ticks: 0,
                },
            )),
            McuCommand::QuerySensorStatus { oid } => Ok(state.sensor_status.get(&oid).cloned().unwrap_or(
                McuResponse::SensorBulkStatus {
                    oid,
                    clock: 0,
                    query_ticks: 0,
                    next_sequence: 0,
                    buffered: 0,
                    possible_overflows: 0,
                },
            )),
            other => Err(TransportError::UnexpectedResponse {
                command: other.name().to_string(),
                response: "no scripted reply".to_string(),
            }),
        }
    }

    fn register_response(&self, kind: ResponseKind, oid: u8, handler: Option<crate::mcu::ResponseHandler>) {
        let mut handlers = self.handlers.lock();
        match handler {
            Some(handler) => {
                handlers.insert((kind, oid), Arc::from(handler));
            }
            None => {
                handlers.remove(&(kind, oid));
            }
        }
    }

    fn clock(&self) -> McuClock {
        *self.clock.lock()
    }
}
