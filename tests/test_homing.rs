use std::sync::Arc;
use std::thread;
use std::time::Duration;

use load_cell_host::configfile::Configfile;
use load_cell_host::extras::load_cell::LoadCell;
use load_cell_host::extras::load_cell_endstop::{HomingResult, HomingState, LoadCellEndstop};
use load_cell_host::mcu::{Mcu, McuCommand, McuResponse, TriggerReason};
use load_cell_host::stepper::StepperRef;
use load_cell_host::test_utils::MockMcu;
use load_cell_host::trsync::{timeout_budget, TRSYNC_SINGLE_MCU_TIMEOUT, TRSYNC_TIMEOUT};
use load_cell_host::Error;
use parking_lot::Mutex;

const CONFIG: &str = "
[load_cell probe]
sensor_type: hx717
sample_rate: 320
counts_per_gram: 120.5
reference_tare_counts: 50
homing_wait_timeout: 2
";

fn setup() -> (Arc<MockMcu>, LoadCellEndstop) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mcu = Arc::new(MockMcu::new("mcu"));
    let cf = Configfile::load(CONFIG).unwrap();
    let lc = LoadCell::new(&cf, "load_cell probe", mcu.clone()).unwrap();
    let endstop = LoadCellEndstop::new(&cf, "load_cell probe", Arc::new(Mutex::new(lc))).unwrap();
    (mcu, endstop)
}

fn trsync_stopped(oid: u8, reason: TriggerReason) -> McuResponse {
    McuResponse::TrsyncState {
        oid,
        can_trigger: false,
        trigger_reason: reason.code(),
        clock: 0,
    }
}

fn triggered_state(oid: u8, trigger_ticks: u32) -> McuResponse {
    McuResponse::EndstopState {
        oid,
        homing: true,
        homing_triggered: true,
        is_triggered: true,
        trigger_ticks,
        sample: 1100,
        sample_ticks: trigger_ticks,
    }
}

#[test]
fn test_endstop_hit_reports_trigger_sample_time() {
    let (mcu, mut endstop) = setup();
    endstop.set_range(1000, 50).unwrap();
    endstop.home_start(1.0).unwrap();

    let trsync_oid = endstop.trsync().primary().get_oid();
    mcu.set_endstop_state(triggered_state(endstop.get_oid(), 123456));
    mcu.set_trsync_reason(trsync_oid, TriggerReason::EndstopHit, 123456);
    assert!(mcu.deliver(trsync_stopped(trsync_oid, TriggerReason::EndstopHit)));

    let result = endstop.home_wait(3.0).unwrap();
    let expected = mcu.clock_to_print_time(123456.0);
    assert_eq!(result, HomingResult::Triggered(expected));
    assert_eq!(result.trigger_time().unwrap(), Some(expected));
    assert_eq!(endstop.last_trigger_time(), Some(expected));
    assert_eq!(endstop.state(), HomingState::Idle);

    // The range was pushed again right before arming
    let ranges = mcu.sent_named("set_range_load_cell_endstop");
    assert_eq!(ranges.len(), 2);
    assert_eq!(
        ranges[1],
        McuCommand::SetRange { oid: endstop.get_oid(), trigger_counts: 1000, tare_counts: 50 }
    );
    // Association cleared and sampling halted
    assert_eq!(
        mcu.sent_named("load_cell_endstop_home").last(),
        Some(&McuCommand::clear_home(endstop.get_oid()))
    );
    assert!(matches!(
        mcu.sent_named("query_load_cell_sensor").last(),
        Some(McuCommand::QuerySensor { rest_ticks: 0, .. })
    ));

    // Already resolved
    assert!(matches!(endstop.home_wait(3.0), Err(Error::InvalidState { .. })));
}

#[test]
fn test_trigger_delivered_while_waiting() {
    let (mcu, mut endstop) = setup();
    endstop.set_range(1000, 50).unwrap();
    endstop.home_start(1.0).unwrap();
    let trsync_oid = endstop.trsync().primary().get_oid();
    mcu.set_endstop_state(triggered_state(endstop.get_oid(), 20_000_000));
    mcu.set_trsync_reason(trsync_oid, TriggerReason::EndstopHit, 20_000_000);

    let producer = Arc::clone(&mcu);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        producer.deliver(trsync_stopped(trsync_oid, TriggerReason::EndstopHit));
    });
    let result = endstop.home_wait(3.0).unwrap();
    handle.join().unwrap();
    assert_eq!(result, HomingResult::Triggered(1.25));
}

#[test]
fn test_multi_mcu_timeout_dominates() {
    let (mcu, mut endstop) = setup();
    let aux = Arc::new(MockMcu::new("aux"));
    let mcu_dyn: Arc<dyn Mcu> = mcu.clone();
    let aux_dyn: Arc<dyn Mcu> = aux.clone();
    endstop.add_stepper(&mcu_dyn, StepperRef::new("stepper_z", 20)).unwrap();
    endstop.add_stepper(&aux_dyn, StepperRef::new("stepper_x", 21)).unwrap();
    assert_eq!(endstop.trsync().timeout_budget(), TRSYNC_TIMEOUT);
    assert_eq!(endstop.get_steppers().len(), 2);

    endstop.home_start(1.0).unwrap();
    let oids = endstop.trsync().channel_oids();
    mcu.set_trsync_reason(oids[0], TriggerReason::EndstopHit, 100);
    aux.set_trsync_reason(oids[1], TriggerReason::CommsTimeout, 0);
    aux.deliver(trsync_stopped(oids[1], TriggerReason::CommsTimeout));

    // The primary was told to stop on the aux timeout
    assert!(mcu
        .sent_named("trsync_trigger")
        .contains(&McuCommand::TrsyncTrigger { oid: oids[0], reason: TriggerReason::HostRequest.code() }));
    let result = endstop.home_wait(3.0).unwrap();
    assert_eq!(result, HomingResult::Indeterminate);
    assert!(endstop.last_trigger_time().is_none());
}

#[test]
fn test_shared_axis_rejected_before_arming() {
    let (mcu, mut endstop) = setup();
    let aux = Arc::new(MockMcu::new("aux"));
    let mcu_dyn: Arc<dyn Mcu> = mcu.clone();
    let aux_dyn: Arc<dyn Mcu> = aux.clone();
    endstop.add_stepper(&mcu_dyn, StepperRef::new("stepper_z", 20)).unwrap();
    let err = endstop
        .add_stepper(&aux_dyn, StepperRef::new("stepper_z1", 21))
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(endstop.trsync().channel_count(), 1);
    assert!(aux.sent_commands().is_empty());
    assert!(mcu.sent_named("trsync_start").is_empty());
}

#[test]
fn test_timeout_budget_selection() {
    assert_eq!(timeout_budget(1), TRSYNC_SINGLE_MCU_TIMEOUT);
    assert_eq!(timeout_budget(2), TRSYNC_TIMEOUT);
    assert_eq!(timeout_budget(5), TRSYNC_TIMEOUT);
}

#[test]
fn test_endstop_can_home_again_after_no_trigger() {
    let (mcu, mut endstop) = setup();
    let trsync_oid = endstop.trsync().primary().get_oid();
    endstop.home_start(1.0).unwrap();
    mcu.set_trsync_reason(trsync_oid, TriggerReason::PastEndTime, 0);
    mcu.deliver(trsync_stopped(trsync_oid, TriggerReason::PastEndTime));
    assert_eq!(endstop.home_wait(2.0).unwrap(), HomingResult::NoTrigger);

    mcu.set_trsync_reason(trsync_oid, TriggerReason::EndstopHit, 0);
    mcu.set_endstop_state(triggered_state(endstop.get_oid(), 48_000_000));
    endstop.home_start(2.5).unwrap();
    mcu.deliver(trsync_stopped(trsync_oid, TriggerReason::EndstopHit));
    assert_eq!(endstop.home_wait(4.0).unwrap(), HomingResult::Triggered(3.0));
}
