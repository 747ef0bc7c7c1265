// src/trsync.rs
// Trigger synchronisation: one logical "stop now" shared by every MCU that
// drives a stepper on the homing axis.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::configfile::ConfigError;
use crate::error::Result;
use crate::mcu::{Mcu, McuCommand, McuResponse, ResponseKind, TransportError, TriggerReason};
use crate::reactor::Completion;
use crate::stepper::StepperRef;

/// Expire budget when more than one MCU takes part.
pub const TRSYNC_TIMEOUT: f64 = 0.025;
pub const TRSYNC_SINGLE_MCU_TIMEOUT: f64 = 0.250;

// Status reports are requested at this fraction of the expire budget
const REPORT_FRACTION: f64 = 0.3;
const MIN_EXTEND_FRACTION: f64 = 0.8;

pub fn timeout_budget(channel_count: usize) -> f64 {
    if channel_count == 1 {
        TRSYNC_SINGLE_MCU_TIMEOUT
    } else {
        TRSYNC_TIMEOUT
    }
}

/// How a homing move ended, as seen by the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Carries the primary channel's reported trsync clock.
    EndstopHit(u64),
    NoTrigger,
    CommsTimeout,
}

/// Any timeout wins. Otherwise only the primary (first) channel decides
/// between hit and no hit.
pub fn resolve_outcome(reasons: &[TriggerReason], primary_clock: u64) -> TriggerOutcome {
    if reasons.iter().any(|r| *r == TriggerReason::CommsTimeout) {
        return TriggerOutcome::CommsTimeout;
    }
    match reasons.first() {
        Some(TriggerReason::EndstopHit) => TriggerOutcome::EndstopHit(primary_clock),
        _ => TriggerOutcome::NoTrigger,
    }
}

/// One trsync object on one MCU, plus the steppers it stops.
pub struct TriggerChannel {
    mcu: Arc<dyn Mcu>,
    oid: u8,
    steppers: Vec<StepperRef>,
}

impl TriggerChannel {
    fn new(mcu: Arc<dyn Mcu>) -> Self {
        let oid = mcu.create_oid();
        mcu.add_config_cmd(McuCommand::ConfigTrsync { oid }, false);
        mcu.add_config_cmd(
            McuCommand::TrsyncStart {
                oid,
                report_clock: 0,
                report_ticks: 0,
                expire_reason: 0,
            },
            true,
        );
        Self {
            mcu,
            oid,
            steppers: Vec::new(),
        }
    }

    pub fn get_mcu(&self) -> &Arc<dyn Mcu> {
        &self.mcu
    }

    pub fn get_oid(&self) -> u8 {
        self.oid
    }

    pub fn get_steppers(&self) -> &[StepperRef] {
        &self.steppers
    }

    fn add_stepper(&mut self, stepper: StepperRef) {
        if !self.steppers.contains(&stepper) {
            self.steppers.push(stepper);
        }
    }

    fn start(&self, timing: &ChannelTiming) -> std::result::Result<(), TransportError> {
        self.mcu.send(
            McuCommand::TrsyncStart {
                oid: self.oid,
                report_clock: timing.report_clock as u32,
                report_ticks: timing.report_ticks as u32,
                expire_reason: TriggerReason::CommsTimeout.code(),
            },
            timing.start_clock,
        )?;
        for stepper in &self.steppers {
            self.mcu.send(
                McuCommand::StepperStopOnTrigger {
                    oid: stepper.oid,
                    trsync_oid: self.oid,
                },
                0,
            )?;
        }
        self.mcu.send(
            McuCommand::TrsyncSetTimeout {
                oid: self.oid,
                clock: timing.expire_clock as u32,
            },
            timing.expire_clock,
        )
    }

    fn release(&self) {
        self.mcu.register_response(ResponseKind::TrsyncState, self.oid, None);
    }

    /// Forces the trsync to stop and reads back why it stopped. A failed
    /// query is reported as a comms timeout.
    fn stop(&self) -> (TriggerReason, u64) {
        self.release();
        let cmd = McuCommand::TrsyncTrigger {
            oid: self.oid,
            reason: TriggerReason::HostRequest.code(),
        };
        match self.mcu.query(cmd.clone()) {
            Ok(McuResponse::TrsyncState { trigger_reason, clock, .. }) => {
                (TriggerReason::from(trigger_reason), self.mcu.clock32_to_clock64(clock))
            }
            Ok(other) => {
                warn!("{}: {}", self.mcu.get_name(), TransportError::unexpected(&cmd, &other));
                (TriggerReason::CommsTimeout, 0)
            }
            Err(e) => {
                warn!("{}: trsync {} stop query failed: {}", self.mcu.get_name(), self.oid, e);
                (TriggerReason::CommsTimeout, 0)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelTiming {
    start_clock: u64,
    expire_clock: u64,
    expire_ticks: u64,
    report_clock: u64,
    report_ticks: u64,
    min_extend_ticks: u64,
}

impl ChannelTiming {
    fn compute(mcu: &dyn Mcu, print_time: f64, report_offset: f64, expire_timeout: f64) -> Self {
        let clock = mcu.print_time_to_clock(print_time);
        let expire_ticks = mcu.seconds_to_clock(expire_timeout);
        let report_ticks = mcu.seconds_to_clock(expire_timeout * REPORT_FRACTION);
        Self {
            start_clock: clock,
            expire_clock: clock + expire_ticks,
            expire_ticks,
            report_clock: clock + (report_ticks as f64 * report_offset + 0.5) as u64,
            report_ticks,
            min_extend_ticks: (report_ticks as f64 * MIN_EXTEND_FRACTION + 0.5) as u64,
        }
    }
}

struct DispatchChannel {
    mcu: Arc<dyn Mcu>,
    oid: u8,
    expire_clock: u64,
    expire_ticks: u64,
    min_extend_ticks: u64,
    last_status_time: Option<f64>,
}

struct DispatchState {
    active: bool,
    channels: Vec<DispatchChannel>,
    home_end_clock: Option<u64>,
    completion: Arc<Completion<bool>>,
}

impl DispatchState {
    fn handle_state(&mut self, index: usize, can_trigger: bool, reason: u8, clock32: u32) {
        if !can_trigger {
            let is_failure = TriggerReason::from(reason) == TriggerReason::CommsTimeout;
            self.completion.complete(is_failure);
            if self.active {
                self.active = false;
                self.trigger_others(index);
            }
            return;
        }
        let clock = {
            let ch = &mut self.channels[index];
            let clock = ch.mcu.clock32_to_clock64(clock32);
            ch.last_status_time = Some(ch.mcu.clock_to_print_time(clock as f64));
            clock
        };
        if index == 0 {
            if let Some(end_clock) = self.home_end_clock {
                if clock >= end_clock {
                    self.home_end_clock = None;
                    let ch = &self.channels[0];
                    debug!("{}: trsync {} past home end clock", ch.mcu.get_name(), ch.oid);
                    let cmd = McuCommand::TrsyncTrigger {
                        oid: ch.oid,
                        reason: TriggerReason::PastEndTime.code(),
                    };
                    if let Err(e) = ch.mcu.send(cmd, 0) {
                        warn!("{}: past end trigger failed: {}", ch.mcu.get_name(), e);
                    }
                }
            }
        }
        if self.active {
            self.extend_timeouts();
        }
    }

    fn trigger_others(&self, source: usize) {
        for (i, ch) in self.channels.iter().enumerate() {
            if i == source {
                continue;
            }
            let cmd = McuCommand::TrsyncTrigger {
                oid: ch.oid,
                reason: TriggerReason::HostRequest.code(),
            };
            if let Err(e) = ch.mcu.send(cmd, 0) {
                warn!("{}: forwarding trigger to trsync {} failed: {}", ch.mcu.get_name(), ch.oid, e);
            }
        }
    }

    // Every MCU has acknowledged up to the oldest reported time, so each
    // expire deadline can move to that time plus its budget.
    fn extend_timeouts(&mut self) {
        let mut min_time = f64::INFINITY;
        for ch in &self.channels {
            match ch.last_status_time {
                Some(t) => min_time = min_time.min(t),
                None => return,
            }
        }
        for ch in self.channels.iter_mut() {
            let expire_clock = ch.mcu.print_time_to_clock(min_time) + ch.expire_ticks;
            if expire_clock < ch.expire_clock + ch.min_extend_ticks {
                continue;
            }
            ch.expire_clock = expire_clock;
            let cmd = McuCommand::TrsyncSetTimeout {
                oid: ch.oid,
                clock: expire_clock as u32,
            };
            if let Err(e) = ch.mcu.send(cmd, expire_clock) {
                warn!("{}: trsync {} timeout extension failed: {}", ch.mcu.get_name(), ch.oid, e);
            }
        }
    }
}

/// Host side dispatch for one homing move. Dropping it stops forwarding.
pub struct TriggerDispatch {
    state: Arc<Mutex<DispatchState>>,
}

impl TriggerDispatch {
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn stop(&self) {
        self.state.lock().active = false;
    }

    /// Stops forwarding and tells every started channel to stop. Send
    /// errors are logged, not returned.
    fn abort(&self) {
        let mut state = self.state.lock();
        if !state.active {
            return;
        }
        state.active = false;
        for ch in &state.channels {
            let cmd = McuCommand::TrsyncTrigger {
                oid: ch.oid,
                reason: TriggerReason::HostRequest.code(),
            };
            if let Err(e) = ch.mcu.send(cmd, 0) {
                warn!("{}: releasing trsync {} failed: {}", ch.mcu.get_name(), ch.oid, e);
            }
        }
    }
}

impl Drop for TriggerDispatch {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle returned by [`TriggerSync::arm`], consumed by [`TriggerSync::wait`].
pub struct PendingTrigger {
    completion: Arc<Completion<bool>>,
    start_time: f64,
}

impl PendingTrigger {
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// True once any channel reported that it stopped.
    pub fn is_done(&self) -> bool {
        self.completion.test()
    }
}

pub struct TriggerSync {
    channels: Vec<TriggerChannel>,
    dispatch: Option<TriggerDispatch>,
}

impl TriggerSync {
    /// The primary channel lives on `mcu`.
    pub fn new(mcu: Arc<dyn Mcu>) -> Self {
        Self {
            channels: vec![TriggerChannel::new(mcu)],
            dispatch: None,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_oids(&self) -> Vec<u8> {
        self.channels.iter().map(|c| c.oid).collect()
    }

    pub fn primary(&self) -> &TriggerChannel {
        &self.channels[0]
    }

    pub fn get_steppers(&self) -> Vec<StepperRef> {
        self.channels.iter().flat_map(|c| c.steppers.iter().cloned()).collect()
    }

    pub fn is_armed(&self) -> bool {
        self.dispatch.is_some()
    }

    pub fn timeout_budget(&self) -> f64 {
        timeout_budget(self.channels.len())
    }

    pub fn add_channel(&mut self, mcu: Arc<dyn Mcu>, steppers: Vec<StepperRef>) -> Result<()> {
        for stepper in steppers {
            self.add_stepper(&mcu, stepper)?;
        }
        Ok(())
    }

    /// Steppers on the same MCU share a channel. A rail may not be split
    /// across MCUs.
    pub fn add_stepper(&mut self, mcu: &Arc<dyn Mcu>, stepper: StepperRef) -> Result<()> {
        let mcu_name = mcu.get_name();
        let index = self.channels.iter().position(|c| c.mcu.get_name() == mcu_name);
        for (i, other) in self.channels.iter().enumerate() {
            if Some(i) == index {
                continue;
            }
            if other.steppers.iter().any(|s| stepper.shares_rail_with(s)) {
                return Err(ConfigError::Invalid(
                    "Multi-mcu homing not supported on multi-mcu shared axis".to_string(),
                )
                .into());
            }
        }
        let index = match index {
            Some(i) => i,
            None => {
                debug!("adding trsync channel on mcu '{}'", mcu_name);
                self.channels.push(TriggerChannel::new(Arc::clone(mcu)));
                self.channels.len() - 1
            }
        };
        self.channels[index].add_stepper(stepper);
        Ok(())
    }

    /// Starts every channel at `print_time`. On a transport error the
    /// channels already started are released before returning.
    pub fn arm(&mut self, print_time: f64, expire_timeout: f64) -> Result<PendingTrigger> {
        self.disarm();
        let completion = Arc::new(Completion::new());
        let count = self.channels.len();
        let timings: Vec<ChannelTiming> = self
            .channels
            .iter()
            .enumerate()
            .map(|(i, c)| ChannelTiming::compute(c.mcu.as_ref(), print_time, i as f64 / count as f64, expire_timeout))
            .collect();
        let state = Arc::new(Mutex::new(DispatchState {
            active: true,
            channels: self
                .channels
                .iter()
                .zip(&timings)
                .map(|(c, t)| DispatchChannel {
                    mcu: Arc::clone(&c.mcu),
                    oid: c.oid,
                    expire_clock: t.expire_clock,
                    expire_ticks: t.expire_ticks,
                    min_extend_ticks: t.min_extend_ticks,
                    last_status_time: None,
                })
                .collect(),
            home_end_clock: None,
            completion: Arc::clone(&completion),
        }));
        self.dispatch = Some(TriggerDispatch {
            state: Arc::clone(&state),
        });
        let mut start_err = None;
        for (index, (channel, timing)) in self.channels.iter().zip(&timings).enumerate() {
            let handler_state = Arc::clone(&state);
            channel.mcu.register_response(
                ResponseKind::TrsyncState,
                channel.oid,
                Some(Box::new(move |resp| {
                    if let McuResponse::TrsyncState {
                        can_trigger,
                        trigger_reason,
                        clock,
                        ..
                    } = resp
                    {
                        handler_state.lock().handle_state(index, *can_trigger, *trigger_reason, *clock);
                    }
                })),
            );
            if let Err(e) = channel.start(timing) {
                warn!("{}: trsync {} start failed: {}", channel.mcu.get_name(), channel.oid, e);
                start_err = Some((index, e));
                break;
            }
        }
        if let Some((index, e)) = start_err {
            // Later channels were never started
            state.lock().channels.truncate(index + 1);
            self.disarm();
            return Err(e.into());
        }
        debug!(
            "armed {} trsync channel(s) at {:.6} (expire budget {:.3}s)",
            count, print_time, expire_timeout
        );
        Ok(PendingTrigger { completion, start_time: print_time })
    }

    /// The primary channel forces a past-end-time stop once its reports
    /// reach `home_end_time`.
    pub fn set_home_end_time(&self, home_end_time: f64) {
        match &self.dispatch {
            Some(dispatch) => {
                let clock = self.channels[0].mcu.print_time_to_clock(home_end_time);
                dispatch.state.lock().home_end_clock = Some(clock);
            }
            None => debug!("home end time {:.6} set while not armed", home_end_time),
        }
    }

    /// Blocks until a channel stops or `timeout` passes, then collects
    /// every channel's stop reason.
    pub fn wait(&mut self, pending: PendingTrigger, timeout: Duration) -> TriggerOutcome {
        if pending.completion.wait(timeout).is_none() {
            warn!(
                "no trsync report {:?} after homing start at {:.6}",
                timeout, pending.start_time
            );
        }
        if let Some(dispatch) = &self.dispatch {
            dispatch.stop();
        }
        let stops: Vec<(TriggerReason, u64)> = self.channels.iter().map(|c| c.stop()).collect();
        let reasons: Vec<TriggerReason> = stops.iter().map(|(r, _)| *r).collect();
        let outcome = resolve_outcome(&reasons, stops[0].1);
        info!("trsync resolved {:?} from reasons {:?}", outcome, reasons);
        outcome
    }

    /// Releases every channel and the dispatch. Safe to call at any time.
    /// Channels still armed on their MCU are triggered with a host request.
    pub fn disarm(&mut self) {
        for channel in &self.channels {
            channel.release();
        }
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
        }
    }
}
