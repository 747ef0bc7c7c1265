use std::sync::Arc;

use load_cell_host::bulk_sensor::{
    BulkAdcSession, ChipClockSync, ClockSyncRegression, SessionParams, TimestampHelper, SAMPLES_PER_BLOCK, SAMPLE_ERROR,
};
use load_cell_host::bus::{RegisterBus, RegisterWrite};
use load_cell_host::mcu::{Mcu, McuCommand, McuResponse, TransportError};
use load_cell_host::test_utils::MockMcu;
use load_cell_host::Error;

const SPS: f64 = 320.0;

fn session(mcu: &Arc<MockMcu>) -> BulkAdcSession {
    let _ = env_logger::builder().is_test(true).try_init();
    let oid = mcu.create_oid();
    BulkAdcSession::new(
        mcu.clone(),
        oid,
        SessionParams { name: "probe".to_string(), sample_rate: SPS, duty_cycle: 0.7 },
    )
}

fn block(oid: u8, sequence: u16, counts: &[i32]) -> McuResponse {
    McuResponse::SensorBulkData {
        oid,
        sequence,
        data: counts.iter().flat_map(|c| c.to_le_bytes()).collect(),
    }
}

/// Status reply consistent with an MCU that produced `samples` samples by
/// `time` seconds.
fn status(mcu: &MockMcu, oid: u8, time: f64, samples: usize) -> McuResponse {
    McuResponse::SensorBulkStatus {
        oid,
        clock: mcu.print_time_to_clock(time) as u32,
        query_ticks: 100,
        next_sequence: (samples / SAMPLES_PER_BLOCK) as u16,
        buffered: ((samples % SAMPLES_PER_BLOCK) * 4) as u8,
        possible_overflows: 0,
    }
}

#[test]
fn test_start_and_stop_commands() {
    let mcu = Arc::new(MockMcu::new("mcu"));
    let mut session = session(&mcu);
    let oid = session.oid();
    session.start().unwrap();
    assert!(session.is_active());
    let rest_ticks = mcu.seconds_to_clock(0.7 / SPS) as u32;
    assert_eq!(mcu.sent_named("query_load_cell_sensor"), vec![McuCommand::QuerySensor { oid, rest_ticks }]);
    assert_eq!(mcu.queried_commands(), vec![McuCommand::QuerySensorStatus { oid }]);
    session.stop().unwrap();
    assert!(!session.is_active());
    assert_eq!(
        mcu.sent_named("query_load_cell_sensor").last(),
        Some(&McuCommand::QuerySensor { oid, rest_ticks: 0 })
    );
}

#[test]
fn test_stop_tolerates_timeout() {
    let mcu = Arc::new(MockMcu::new("mcu"));
    let mut session = session(&mcu);
    session.start().unwrap();
    mcu.fail_command("query_load_cell_sensor", TransportError::Timeout("query_load_cell_sensor".into()));
    session.stop().unwrap();
    assert!(!session.is_active());
}

#[test]
fn test_failed_clock_query_halts_sampling() {
    let mcu = Arc::new(MockMcu::new("mcu"));
    let mut session = session(&mcu);
    let oid = session.oid();
    mcu.fail_command("query_load_cell_sensor_status", TransportError::Disconnected("mcu".into()));
    assert!(matches!(session.start(), Err(Error::SessionLost(_))));
    assert!(!session.is_active());
    assert_eq!(
        mcu.sent_named("query_load_cell_sensor"),
        vec![
            McuCommand::QuerySensor { oid, rest_ticks: mcu.seconds_to_clock(0.7 / SPS) as u32 },
            McuCommand::QuerySensor { oid, rest_ticks: 0 },
        ]
    );
}

#[test]
fn test_batch_decoding_drops_bad_data() {
    let mcu = Arc::new(MockMcu::new("mcu"));
    let mut session = session(&mcu);
    let oid = session.oid();
    session.start().unwrap();
    mcu.deliver(block(oid, 0, &[1, SAMPLE_ERROR, 3]));
    mcu.deliver(McuResponse::SensorBulkData { oid, sequence: 1, data: vec![1, 2, 3] });
    mcu.deliver(block(oid, 2, &[-7]));
    let batch = session.process_batch().unwrap();
    let counts: Vec<i32> = batch.samples.iter().map(|(_, c)| *c).collect();
    assert_eq!(counts, vec![1, 3, -7]);
    assert_eq!(batch.errors, 2);
    // Nothing new
    assert!(session.process_batch().unwrap().is_empty());
}

#[test]
fn test_session_lost_on_disconnect() {
    let mcu = Arc::new(MockMcu::new("mcu"));
    let mut session = session(&mcu);
    session.start().unwrap();
    mcu.fail_command("query_load_cell_sensor_status", TransportError::Disconnected("mcu".into()));
    assert!(matches!(session.process_batch(), Err(Error::SessionLost(_))));
    assert!(!session.is_active());
    mcu.clear_failures();
    session.start().unwrap();
    assert!(session.is_active());
}

#[test]
fn test_timestamps_follow_mcu_clock_across_batches() {
    let mcu = Arc::new(MockMcu::new("mcu"));
    let mut session = session(&mcu);
    let oid = session.oid();
    mcu.set_sensor_status(status(&mcu, oid, 1.0, 0));
    session.start().unwrap();

    // First sample taken at 1.0s, one sample every 1/SPS
    let mut sequence = 0u16;
    let mut produced = 0usize;
    let mut last_time = f64::MIN;
    let mut all = Vec::new();
    for poll in 1..=40 {
        let now = 1.0 + poll as f64 * 0.1;
        let target = (poll as f64 * 0.1 * SPS) as usize;
        while produced + SAMPLES_PER_BLOCK <= target {
            mcu.deliver(block(oid, sequence, &[0; SAMPLES_PER_BLOCK]));
            sequence = sequence.wrapping_add(1);
            produced += SAMPLES_PER_BLOCK;
        }
        mcu.set_sensor_status(status(&mcu, oid, now, target));
        let batch = session.process_batch().unwrap();
        for (t, _) in &batch.samples {
            assert!(*t >= last_time, "time went backwards: {} < {}", t, last_time);
            last_time = *t;
        }
        all.extend(batch.samples);
    }
    // Once the regression settles the sample spacing is the sample period
    let tail = &all[all.len() - 100..];
    let spacing = (tail[99].0 - tail[0].0) / 99.0;
    assert!((spacing - 1.0 / SPS).abs() < 1e-4, "spacing {}", spacing);
}

#[test]
fn test_commit_continuity() {
    let mcu = Arc::new(MockMcu::new("mcu"));
    let mut sync = ClockSyncRegression::new(mcu.clone(), SPS * 0.1 * 2.0);
    // Chip clock n sampled at mcu clock n * 50000 (16MHz / 320sps)
    sync.reset(0.0, 0.0);
    for i in 1..50 {
        let chip = (i * 32) as f64;
        sync.update(chip * 50_000.0, chip);
    }
    let mut t_last = 0.0;
    {
        let mut ts = TimestampHelper::new(&mut sync, 100, SAMPLES_PER_BLOCK);
        ts.update_sequence(100);
        for i in 0..SAMPLES_PER_BLOCK {
            t_last = ts.time_of_sample(i);
        }
        ts.commit();
    }
    let t_first_next = {
        let mut ts = TimestampHelper::new(&mut sync, 101, SAMPLES_PER_BLOCK);
        ts.update_sequence(101);
        let t = ts.time_of_sample(0);
        ts.commit();
        t
    };
    let period = 1.0 / SPS;
    assert!(((t_first_next - t_last) - period).abs() < 1e-5, "gap {}", t_first_next - t_last);
    let model = sync.get_time_translation();
    assert!((model.inv_freq - period).abs() < 1e-6);
}

struct EchoBus(Vec<u8>);

impl RegisterBus for EchoBus {
    fn write_registers(&mut self, _register: u8, values: &[u8]) -> Result<(), TransportError> {
        self.0 = values.to_vec();
        Ok(())
    }

    fn read_registers(&mut self, _register: u8, count: usize) -> Result<Vec<u8>, TransportError> {
        Ok(self.0.iter().copied().take(count).map(|b| b & 0x7f).collect())
    }
}

#[test]
fn test_setup_device_reports_mismatch() {
    let mcu = Arc::new(MockMcu::new("mcu"));
    let session = session(&mcu);
    let mut bus = EchoBus(Vec::new());
    session.setup_device(&mut bus, &[RegisterWrite::new(0x00, vec![0x0e, 0x04])]).unwrap();
    let err = session
        .setup_device(&mut bus, &[RegisterWrite::new(0x02, vec![0x26, 0xb0])])
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Failed to set probe register [0x2] to [0x26, 0xb0]: got [0x26, 0x30]. \
         This may be a connection problem (e.g. faulty wiring)"
    );
}
