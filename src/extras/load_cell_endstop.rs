// src/extras/load_cell_endstop.rs
// Load cell as a homing endstop. The MCU compares samples against the
// trigger range and fires a trsync; the host arms, waits, and recovers the
// exact tick of the triggering sample.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::configfile::Configfile;
use crate::error::{Error, Result};
use crate::extras::load_cell::LoadCell;
use crate::mcu::{Mcu, McuCommand, McuResponse, TransportError, TriggerReason};
use crate::stepper::StepperRef;
use crate::trsync::{PendingTrigger, TriggerOutcome, TriggerSync};

pub const DEFAULT_SAMPLE_COUNT: i64 = 2;
/// Missed sample periods the MCU tolerates before failing the home.
pub const WATCHDOG_MAX: u32 = 3;
const DEFAULT_WAIT_TIMEOUT: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingState {
    Idle,
    Armed,
    Waiting,
    Resolved,
}

impl fmt::Display for HomingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HomingState::Idle => "idle",
            HomingState::Armed => "armed",
            HomingState::Waiting => "waiting",
            HomingState::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

/// Result of [`LoadCellEndstop::home_wait`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HomingResult {
    /// Print time of the first sample past the trigger threshold.
    Triggered(f64),
    NoTrigger,
    /// An MCU missed its trsync deadline. The move has to be retried or
    /// aborted.
    Indeterminate,
}

impl HomingResult {
    pub fn trigger_time(&self) -> Result<Option<f64>> {
        match self {
            HomingResult::Triggered(t) => Ok(Some(*t)),
            HomingResult::NoTrigger => Ok(None),
            HomingResult::Indeterminate => Err(Error::CommsTimeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndstopStatus {
    pub trigger_counts: u32,
    pub tare_counts: i32,
    pub sample_count: u8,
}

/// Reply to `load_cell_endstop_query_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndstopState {
    pub homing: bool,
    pub homing_triggered: bool,
    pub is_triggered: bool,
    pub trigger_ticks: u32,
    pub sample: i32,
    pub sample_ticks: u32,
}

pub struct LoadCellEndstop {
    name: String,
    mcu: Arc<dyn Mcu>,
    oid: u8,
    load_cell: Arc<Mutex<LoadCell>>,
    trsync: TriggerSync,
    state: HomingState,
    pending: Option<PendingTrigger>,
    trigger_counts: u32,
    tare_counts: i32,
    sample_count: u8,
    wait_timeout: Duration,
    home_start_time: f64,
    last_trigger_time: Option<f64>,
}

impl LoadCellEndstop {
    pub fn new(config: &Configfile, section: &str, load_cell: Arc<Mutex<LoadCell>>) -> Result<Self> {
        let sample_count = config.getint(section, "sample_count", Some(DEFAULT_SAMPLE_COUNT), Some(1), Some(5))? as u8;
        let wait_timeout = config.getfloat(section, "homing_wait_timeout", Some(DEFAULT_WAIT_TIMEOUT), Some(0.1), None)?;
        let (mcu, name) = {
            let lc = load_cell.lock();
            (lc.get_mcu(), lc.get_name().to_string())
        };
        let oid = mcu.create_oid();
        mcu.add_config_cmd(McuCommand::ConfigLoadCellEndstop { oid }, false);
        mcu.add_config_cmd(McuCommand::clear_home(oid), true);
        load_cell.lock().attach_endstop(oid);
        let trsync = TriggerSync::new(Arc::clone(&mcu));
        Ok(Self {
            name,
            mcu,
            oid,
            load_cell,
            trsync,
            state: HomingState::Idle,
            pending: None,
            trigger_counts: 0,
            tare_counts: 0,
            sample_count,
            wait_timeout: Duration::from_secs_f64(wait_timeout),
            home_start_time: 0.0,
            last_trigger_time: None,
        })
    }

    pub fn get_mcu(&self) -> &Arc<dyn Mcu> {
        &self.mcu
    }

    pub fn get_oid(&self) -> u8 {
        self.oid
    }

    pub fn state(&self) -> HomingState {
        self.state
    }

    pub fn trsync(&self) -> &TriggerSync {
        &self.trsync
    }

    pub fn last_trigger_time(&self) -> Option<f64> {
        self.last_trigger_time
    }

    pub fn home_start_time(&self) -> f64 {
        self.home_start_time
    }

    pub fn add_stepper(&mut self, mcu: &Arc<dyn Mcu>, stepper: StepperRef) -> Result<()> {
        self.trsync.add_stepper(mcu, stepper)
    }

    pub fn get_steppers(&self) -> Vec<StepperRef> {
        self.trsync.get_steppers()
    }

    pub fn get_status(&self) -> EndstopStatus {
        EndstopStatus {
            trigger_counts: self.trigger_counts,
            tare_counts: self.tare_counts,
            sample_count: self.sample_count,
        }
    }

    pub fn get_status_json(&self) -> serde_json::Value {
        serde_json::json!(self.get_status())
    }

    /// Stores and pushes the trigger range. The threshold sign is dropped.
    pub fn set_range(&mut self, trigger_counts: i32, tare_counts: i32) -> Result<()> {
        if self.state == HomingState::Waiting {
            return Err(Error::InvalidState {
                operation: "set range",
                state: self.state.to_string(),
            });
        }
        self.trigger_counts = trigger_counts.unsigned_abs();
        self.tare_counts = tare_counts;
        self.send_range()?;
        info!(
            "{}: range set, trigger_counts {} tare_counts {}",
            self.name, self.trigger_counts, self.tare_counts
        );
        Ok(())
    }

    fn send_range(&self) -> Result<()> {
        self.mcu.send(
            McuCommand::SetRange {
                oid: self.oid,
                trigger_counts: self.trigger_counts,
                tare_counts: self.tare_counts,
            },
            0,
        )?;
        Ok(())
    }

    /// Arms the MCU side endstop and every trsync channel at `print_time`.
    pub fn home_start(&mut self, print_time: f64) -> Result<()> {
        if !self.load_cell.lock().is_calibrated() {
            return Err(Error::Calibration("Load Cell not calibrated".to_string()));
        }
        if self.state != HomingState::Idle {
            return Err(Error::InvalidState {
                operation: "start homing",
                state: self.state.to_string(),
            });
        }
        self.home_start_time = print_time;
        let clock = self.mcu.print_time_to_clock(print_time);
        let rest_ticks = self.load_cell.lock().clock_ticks_per_sample();
        let expire_timeout = self.trsync.timeout_budget();
        let pending = self.trsync.arm(print_time, expire_timeout)?;
        if let Err(e) = self.start_endstop(clock, rest_ticks) {
            warn!("{}: homing start failed: {}", self.name, e);
            if let Err(stop_err) = self.load_cell.lock().stop_collecting() {
                warn!("{}: {}", self.name, stop_err);
            }
            self.finish_homing();
            return Err(e);
        }
        self.pending = Some(pending);
        self.state = HomingState::Armed;
        Ok(())
    }

    fn start_endstop(&self, clock: u64, rest_ticks: u32) -> Result<()> {
        self.send_range()?;
        self.mcu.send(
            McuCommand::LoadCellEndstopHome {
                oid: self.oid,
                trsync_oid: self.trsync.primary().get_oid(),
                trigger_reason: TriggerReason::EndstopHit.code(),
                clock: clock as u32,
                sample_count: self.sample_count,
                rest_ticks,
                timeout: WATCHDOG_MAX,
            },
            clock,
        )?;
        self.load_cell.lock().start_collecting()
    }

    /// Blocks until the move resolves. Always leaves the endstop idle.
    pub fn home_wait(&mut self, home_end_time: f64) -> Result<HomingResult> {
        let pending = match (self.state, self.pending.take()) {
            (HomingState::Armed, Some(pending)) => pending,
            (state, _) => {
                return Err(Error::InvalidState {
                    operation: "wait for homing",
                    state: state.to_string(),
                })
            }
        };
        self.state = HomingState::Waiting;
        self.trsync.set_home_end_time(home_end_time);
        let outcome = self.trsync.wait(pending, self.wait_timeout);
        self.state = HomingState::Resolved;
        if let Err(e) = self.load_cell.lock().stop_collecting() {
            warn!("{}: {}", self.name, e);
        }
        let result = self.resolve(outcome);
        self.finish_homing();
        result
    }

    fn resolve(&mut self, outcome: TriggerOutcome) -> Result<HomingResult> {
        match outcome {
            TriggerOutcome::CommsTimeout => {
                warn!("{}: communication timeout during homing", self.name);
                Ok(HomingResult::Indeterminate)
            }
            TriggerOutcome::NoTrigger => Ok(HomingResult::NoTrigger),
            TriggerOutcome::EndstopHit(_) => {
                let state = self.query_state()?;
                let trigger_ticks = self.mcu.clock32_to_clock64(state.trigger_ticks);
                let trigger_time = self.mcu.clock_to_print_time(trigger_ticks as f64);
                info!(
                    "{}: triggered at {:.6} (sample {} counts)",
                    self.name, trigger_time, state.sample
                );
                self.last_trigger_time = Some(trigger_time);
                Ok(HomingResult::Triggered(trigger_time))
            }
        }
    }

    fn finish_homing(&mut self) {
        self.trsync.disarm();
        // Drop the trsync association so it cannot fire on a later move
        if let Err(e) = self.mcu.send(McuCommand::clear_home(self.oid), 0) {
            warn!("{}: clearing endstop trsync failed: {}", self.name, e);
        }
        self.state = HomingState::Idle;
    }

    pub fn query_state(&self) -> Result<EndstopState> {
        let cmd = McuCommand::QueryEndstopState { oid: self.oid };
        match self.mcu.query(cmd.clone())? {
            McuResponse::EndstopState {
                homing,
                homing_triggered,
                is_triggered,
                trigger_ticks,
                sample,
                sample_ticks,
                ..
            } => Ok(EndstopState {
                homing,
                homing_triggered,
                is_triggered,
                trigger_ticks,
                sample,
                sample_ticks,
            }),
            other => Err(TransportError::unexpected(&cmd, &other).into()),
        }
    }

    /// Triggered state as of the query: the homing result while homing,
    /// the live comparison otherwise.
    pub fn query_endstop(&self, print_time: f64) -> Result<bool> {
        let state = self.query_state()?;
        info!(
            "{}: endstop state at {:.3}: homing={} homing_triggered={} is_triggered={} \
             trigger_ticks={} sample={} sample_ticks={}",
            self.name,
            print_time,
            state.homing,
            state.homing_triggered,
            state.is_triggered,
            state.trigger_ticks,
            state.sample,
            state.sample_ticks
        );
        Ok(if state.homing {
            state.homing_triggered
        } else {
            state.is_triggered
        })
    }
}
