// src/bulk_sensor.rs
// Bulk ADC sample sessions: raw block queueing, chip clock tracking and
// timestamp reconstruction for sequenced sample blocks.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::bus::{self, RegisterBus, RegisterWrite};
use crate::clocksync::ClockSyncModel;
use crate::error::{Error, Result};
use crate::mcu::{Mcu, McuCommand, McuResponse, ResponseKind, TransportError};

/// Largest payload of one `sensor_bulk_data` message.
pub const MAX_BULK_MSG_SIZE: usize = 52;
pub const BYTES_PER_SAMPLE: usize = 4;
pub const SAMPLES_PER_BLOCK: usize = MAX_BULK_MSG_SIZE / BYTES_PER_SAMPLE;
/// Seconds between batch polls; also sizes the clock regression smoothing.
pub const UPDATE_INTERVAL: f64 = 0.10;
/// Firmware marker for a failed conversion.
pub const SAMPLE_ERROR: i32 = i32::MIN;

/// One sequenced block of raw sample bytes as received from the MCU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSampleBlock {
    pub sequence: u16,
    pub data: Vec<u8>,
}

/// Decoded `(time, counts)` pairs from one poll. Empty is normal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBatch {
    pub samples: Vec<(f64, i32)>,
    /// Malformed blocks plus error-marked samples dropped from this batch.
    pub errors: u32,
    /// Running count of possible MCU side buffer overflows.
    pub overflows: u64,
}

impl SampleBatch {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Signed difference between two 16-bit sequence numbers, correct while the
/// true gap is within +/-32767.
pub fn sequence_delta(last_sequence: u16, sequence: u16) -> i64 {
    let mut diff = sequence.wrapping_sub(last_sequence) as i64;
    if diff & 0x8000 != 0 {
        diff -= 0x10000;
    }
    diff
}

/// Chip clock source for a [`TimestampHelper`].
pub trait ChipClockSync {
    fn get_time_translation(&self) -> ClockSyncModel;
    fn set_last_chip_clock(&mut self, chip_clock: f64);
}

/// Tracks the relation between the sensor's sample counter ("chip clock")
/// and the MCU clock, then maps that onto print time.
pub struct ClockSyncRegression {
    mcu: Arc<dyn Mcu>,
    chip_clock_smooth: f64,
    decay: f64,
    last_chip_clock: Option<f64>,
    last_exp_mcu_clock: f64,
    mcu_clock_avg: f64,
    mcu_clock_variance: f64,
    chip_clock_avg: f64,
    chip_clock_covariance: f64,
}

impl ClockSyncRegression {
    pub fn new(mcu: Arc<dyn Mcu>, chip_clock_smooth: f64) -> Self {
        Self::with_decay(mcu, chip_clock_smooth, 1.0 / 20.0)
    }

    pub fn with_decay(mcu: Arc<dyn Mcu>, chip_clock_smooth: f64, decay: f64) -> Self {
        Self {
            mcu,
            chip_clock_smooth,
            decay,
            last_chip_clock: None,
            last_exp_mcu_clock: 0.0,
            mcu_clock_avg: 0.0,
            mcu_clock_variance: 0.0,
            chip_clock_avg: 0.0,
            chip_clock_covariance: 0.0,
        }
    }

    pub fn reset(&mut self, mcu_clock: f64, chip_clock: f64) {
        self.mcu_clock_avg = mcu_clock;
        self.chip_clock_avg = chip_clock;
        self.mcu_clock_variance = 0.0;
        self.chip_clock_covariance = 0.0;
        self.last_chip_clock = None;
        self.last_exp_mcu_clock = 0.0;
    }

    pub fn update(&mut self, mcu_clock: f64, chip_clock: f64) {
        let decay = self.decay;
        let diff_mcu_clock = mcu_clock - self.mcu_clock_avg;
        self.mcu_clock_avg += decay * diff_mcu_clock;
        self.mcu_clock_variance = (1.0 - decay) * (self.mcu_clock_variance + diff_mcu_clock.powi(2) * decay);
        let diff_chip_clock = chip_clock - self.chip_clock_avg;
        self.chip_clock_avg += decay * diff_chip_clock;
        self.chip_clock_covariance =
            (1.0 - decay) * (self.chip_clock_covariance + diff_mcu_clock * diff_chip_clock * decay);
    }

    /// `(base_mcu_clock, base_chip_clock, mcu ticks per chip tick)`.
    pub fn get_clock_translation(&self) -> (f64, f64, f64) {
        let inv_chip_freq = if self.chip_clock_covariance == 0.0 {
            0.0
        } else {
            self.mcu_clock_variance / self.chip_clock_covariance
        };
        let last_chip_clock = match self.last_chip_clock {
            Some(clock) => clock,
            None => return (self.mcu_clock_avg, self.chip_clock_avg, inv_chip_freq),
        };
        // Converge on the regression line a little ahead of the last
        // committed sample so consecutive batches join up.
        let s_chip_clock = last_chip_clock + self.chip_clock_smooth;
        let scdiff = s_chip_clock - self.chip_clock_avg;
        let s_mcu_clock = self.mcu_clock_avg + scdiff * inv_chip_freq;
        let mdiff = s_mcu_clock - self.last_exp_mcu_clock;
        let s_inv_chip_freq = mdiff / self.chip_clock_smooth;
        (self.last_exp_mcu_clock, last_chip_clock, s_inv_chip_freq)
    }
}

impl ChipClockSync for ClockSyncRegression {
    fn get_time_translation(&self) -> ClockSyncModel {
        let (base_mcu, base_chip, inv_cfreq) = self.get_clock_translation();
        let time_base = self.mcu.clock_to_print_time(base_mcu);
        let inv_freq = self.mcu.clock_to_print_time(base_mcu + inv_cfreq) - time_base;
        ClockSyncModel {
            time_base,
            chip_base: base_chip,
            inv_freq,
        }
    }

    fn set_last_chip_clock(&mut self, chip_clock: f64) {
        let (base_mcu, base_chip, inv_cfreq) = self.get_clock_translation();
        self.last_chip_clock = Some(chip_clock);
        self.last_exp_mcu_clock = base_mcu + (chip_clock - base_chip) * inv_cfreq;
    }
}

/// Position of a batch decoder in the 16-bit block sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceCursor {
    pub last_sequence: u16,
    pub reconstructed_seq: i64,
}

impl SequenceCursor {
    pub fn new(reconstructed_seq: i64) -> Self {
        Self {
            last_sequence: (reconstructed_seq & 0xffff) as u16,
            reconstructed_seq,
        }
    }

    /// Assumes at most one wrap since the previous block.
    pub fn advance(&mut self, sequence: u16) -> i64 {
        self.reconstructed_seq += sequence_delta(self.last_sequence, sequence);
        self.last_sequence = sequence;
        self.reconstructed_seq
    }
}

/// Generates sample timestamps while decoding one batch. The translation
/// is captured once at construction.
pub struct TimestampHelper<'a, C: ChipClockSync + ?Sized> {
    clock_sync: &'a mut C,
    cursor: SequenceCursor,
    translation: ClockSyncModel,
    samples_per_block: usize,
    msg_cdiff: f64,
    last_sample_index: usize,
}

impl<'a, C: ChipClockSync + ?Sized> TimestampHelper<'a, C> {
    pub fn new(clock_sync: &'a mut C, last_sequence: i64, samples_per_block: usize) -> Self {
        let translation = clock_sync.get_time_translation();
        let cursor = SequenceCursor::new(last_sequence);
        let msg_cdiff = (cursor.reconstructed_seq * samples_per_block as i64) as f64 - translation.chip_base;
        Self {
            clock_sync,
            cursor,
            translation,
            samples_per_block,
            msg_cdiff,
            last_sample_index: 0,
        }
    }

    pub fn update_sequence(&mut self, sequence: u16) {
        let seq = self.cursor.advance(sequence);
        self.msg_cdiff = (seq * self.samples_per_block as i64) as f64 - self.translation.chip_base;
    }

    /// Print time of sample `index` in the current block, to the microsecond.
    pub fn time_of_sample(&mut self, index: usize) -> f64 {
        self.last_sample_index = index;
        let time = self.translation.time_base + (self.msg_cdiff + index as f64) * self.translation.inv_freq;
        (time * 1_000_000.0).round() / 1_000_000.0
    }

    pub fn cursor(&self) -> SequenceCursor {
        self.cursor
    }

    /// Publishes the chip clock of the last sample handed out.
    pub fn commit(self) {
        let chip_clock = self.cursor.reconstructed_seq * self.samples_per_block as i64 + self.last_sample_index as i64;
        self.clock_sync.set_last_chip_clock(chip_clock as f64);
    }
}

/// Receives `sensor_bulk_data` blocks for one oid, in arrival order.
pub struct BulkDataQueue {
    mcu: Arc<dyn Mcu>,
    oid: u8,
    blocks: Arc<Mutex<Vec<RawSampleBlock>>>,
}

impl BulkDataQueue {
    pub fn new(mcu: Arc<dyn Mcu>, oid: u8) -> Self {
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&blocks);
        mcu.register_response(
            ResponseKind::SensorBulkData,
            oid,
            Some(Box::new(move |resp| {
                if let McuResponse::SensorBulkData { sequence, data, .. } = resp {
                    sink.lock().push(RawSampleBlock {
                        sequence: *sequence,
                        data: data.clone(),
                    });
                }
            })),
        );
        Self { mcu, oid, blocks }
    }

    pub fn pull_samples(&self) -> Vec<RawSampleBlock> {
        std::mem::take(&mut *self.blocks.lock())
    }

    pub fn clear_samples(&self) {
        self.blocks.lock().clear();
    }
}

impl Drop for BulkDataQueue {
    fn drop(&mut self) {
        self.mcu.register_response(ResponseKind::SensorBulkData, self.oid, None);
    }
}

/// Feeds [`ClockSyncRegression`] from the sensor's status query and keeps
/// the extended sequence and overflow counters.
pub struct ChipClockUpdater {
    mcu: Arc<dyn Mcu>,
    oid: u8,
    bytes_per_sample: usize,
    samples_per_block: usize,
    last_sequence: i64,
    last_overflows: u64,
    max_query_duration: u64,
}

impl ChipClockUpdater {
    pub fn new(mcu: Arc<dyn Mcu>, oid: u8, bytes_per_sample: usize) -> Self {
        Self {
            mcu,
            oid,
            bytes_per_sample,
            samples_per_block: MAX_BULK_MSG_SIZE / bytes_per_sample,
            last_sequence: 0,
            last_overflows: 0,
            max_query_duration: 0,
        }
    }

    pub fn get_last_sequence(&self) -> i64 {
        self.last_sequence
    }

    pub fn get_last_overflows(&self) -> u64 {
        self.last_overflows
    }

    pub fn samples_per_block(&self) -> usize {
        self.samples_per_block
    }

    fn clear_duration_filter(&mut self) {
        self.max_query_duration = 1 << 31;
    }

    pub fn note_start(&mut self, clock_sync: &mut ClockSyncRegression) -> std::result::Result<(), TransportError> {
        self.last_sequence = 0;
        self.last_overflows = 0;
        self.clear_duration_filter();
        self.update_clock(clock_sync, true)?;
        self.clear_duration_filter();
        Ok(())
    }

    pub fn update_clock(
        &mut self,
        clock_sync: &mut ClockSyncRegression,
        is_reset: bool,
    ) -> std::result::Result<(), TransportError> {
        let cmd = McuCommand::QuerySensorStatus { oid: self.oid };
        let (clock, query_ticks, next_sequence, buffered, possible_overflows) = match self.mcu.query(cmd.clone())? {
            McuResponse::SensorBulkStatus {
                clock,
                query_ticks,
                next_sequence,
                buffered,
                possible_overflows,
                ..
            } => (clock, query_ticks, next_sequence, buffered, possible_overflows),
            other => return Err(TransportError::unexpected(&cmd, &other)),
        };
        let mcu_clock = self.mcu.clock32_to_clock64(clock);
        // The MCU sequence only moves forward
        let seq_diff = next_sequence.wrapping_sub(self.last_sequence as u16);
        self.last_sequence += seq_diff as i64;
        let po_diff = possible_overflows.wrapping_sub(self.last_overflows as u16);
        self.last_overflows += po_diff as u64;

        let duration = query_ticks as u64;
        if duration > self.max_query_duration {
            // A slow query response would skew the regression
            self.max_query_duration = (2 * self.max_query_duration).max(self.mcu.seconds_to_clock(0.000005));
            debug!("skipping slow sensor status query ({} ticks)", duration);
            return Ok(());
        }
        self.max_query_duration = 2 * duration;
        let msg_count =
            self.last_sequence * self.samples_per_block as i64 + (buffered as usize / self.bytes_per_sample) as i64;
        // Half a sample for response inaccuracy plus half for the chip's
        // own processing delay.
        let chip_clock = (msg_count + 1) as f64;
        let avg_mcu_clock = (mcu_clock + duration / 2) as f64;
        if is_reset {
            clock_sync.reset(avg_mcu_clock, chip_clock);
        } else {
            clock_sync.update(avg_mcu_clock, chip_clock);
        }
        Ok(())
    }
}

/// Acquisition parameters for a [`BulkAdcSession`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub name: String,
    pub sample_rate: f64,
    /// Fraction of the sample period the MCU waits before polling the chip.
    pub duty_cycle: f64,
}

/// Periodic acquisition on one bulk ADC sensor.
pub struct BulkAdcSession {
    params: SessionParams,
    mcu: Arc<dyn Mcu>,
    oid: u8,
    bulk_queue: BulkDataQueue,
    clock_sync: ClockSyncRegression,
    clock_updater: ChipClockUpdater,
    is_active: bool,
}

impl BulkAdcSession {
    pub fn new(mcu: Arc<dyn Mcu>, oid: u8, params: SessionParams) -> Self {
        let chip_smooth = params.sample_rate * UPDATE_INTERVAL * 2.0;
        mcu.add_config_cmd(McuCommand::QuerySensor { oid, rest_ticks: 0 }, true);
        Self {
            bulk_queue: BulkDataQueue::new(Arc::clone(&mcu), oid),
            clock_sync: ClockSyncRegression::new(Arc::clone(&mcu), chip_smooth),
            clock_updater: ChipClockUpdater::new(Arc::clone(&mcu), oid, BYTES_PER_SAMPLE),
            params,
            mcu,
            oid,
            is_active: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn oid(&self) -> u8 {
        self.oid
    }

    pub fn sample_rate(&self) -> f64 {
        self.params.sample_rate
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn rest_ticks(&self) -> u32 {
        self.mcu
            .seconds_to_clock(self.params.duty_cycle / self.params.sample_rate) as u32
    }

    pub fn start(&mut self) -> Result<()> {
        if self.is_active {
            return Ok(());
        }
        self.bulk_queue.clear_samples();
        let rest_ticks = self.rest_ticks();
        self.mcu
            .send(McuCommand::QuerySensor { oid: self.oid, rest_ticks }, 0)
            .map_err(|e| self.session_error(e))?;
        info!("{} starting '{}' measurements", self.mcu.get_name(), self.params.name);
        if let Err(e) = self.clock_updater.note_start(&mut self.clock_sync) {
            // Sampling is already running on the MCU
            if let Err(halt_err) = self.mcu.send(McuCommand::QuerySensor { oid: self.oid, rest_ticks: 0 }, 0) {
                warn!("'{}' halt after failed start: {}", self.params.name, halt_err);
            }
            return Err(self.session_error(e));
        }
        self.is_active = true;
        Ok(())
    }

    /// Halts acquisition. A timeout on the halt command is tolerated.
    pub fn stop(&mut self) -> Result<()> {
        if !self.is_active {
            return Ok(());
        }
        self.is_active = false;
        let res = self.mcu.send_wait_ack(McuCommand::QuerySensor { oid: self.oid, rest_ticks: 0 });
        self.bulk_queue.clear_samples();
        info!("{} finished '{}' measurements", self.mcu.get_name(), self.params.name);
        match res {
            Ok(()) => Ok(()),
            Err(TransportError::Timeout(cmd)) => {
                warn!("'{}' stop not acknowledged ({}), continuing", self.params.name, cmd);
                Ok(())
            }
            Err(e) => Err(self.session_error(e)),
        }
    }

    /// Decodes every block received since the last call. Transport errors
    /// end the session.
    pub fn process_batch(&mut self) -> Result<SampleBatch> {
        if !self.is_active {
            return Ok(SampleBatch::default());
        }
        if let Err(e) = self.clock_updater.update_clock(&mut self.clock_sync, false) {
            self.is_active = false;
            self.bulk_queue.clear_samples();
            return Err(self.session_error(e));
        }
        let blocks = self.bulk_queue.pull_samples();
        let mut batch = SampleBatch {
            overflows: self.clock_updater.get_last_overflows(),
            ..SampleBatch::default()
        };
        if blocks.is_empty() {
            return Ok(batch);
        }
        let (samples, errors) = self.extract_samples(&blocks);
        batch.samples = samples;
        batch.errors = errors;
        Ok(batch)
    }

    fn extract_samples(&mut self, blocks: &[RawSampleBlock]) -> (Vec<(f64, i32)>, u32) {
        let samples_per_block = self.clock_updater.samples_per_block();
        let mut samples = Vec::with_capacity(blocks.len() * samples_per_block);
        let mut errors = 0;
        let mut timestamps = TimestampHelper::new(
            &mut self.clock_sync,
            self.clock_updater.get_last_sequence(),
            samples_per_block,
        );
        for block in blocks {
            timestamps.update_sequence(block.sequence);
            if block.data.len() % BYTES_PER_SAMPLE != 0 || block.data.len() > MAX_BULK_MSG_SIZE {
                debug!(
                    "'{}' dropping malformed block seq={} len={}",
                    self.params.name,
                    block.sequence,
                    block.data.len()
                );
                errors += 1;
                continue;
            }
            for (i, chunk) in block.data.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
                let counts = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if counts == SAMPLE_ERROR {
                    errors += 1;
                    continue;
                }
                samples.push((timestamps.time_of_sample(i), counts));
            }
        }
        timestamps.commit();
        (samples, errors)
    }

    /// Programs the chip through `bus`, verifying each write by read back.
    pub fn setup_device(&self, bus: &mut dyn RegisterBus, writes: &[RegisterWrite]) -> Result<()> {
        for write in writes {
            bus::write_verified(bus, &self.params.name, write)?;
        }
        info!("'{}' configured {} register blocks", self.params.name, writes.len());
        Ok(())
    }

    fn session_error(&self, err: TransportError) -> Error {
        if err.is_session_loss() {
            warn!("'{}' session lost: {}", self.params.name, err);
            Error::SessionLost(self.params.name.clone())
        } else {
            Error::Transport(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock {
        model: ClockSyncModel,
        committed: Option<f64>,
    }

    impl ChipClockSync for FixedClock {
        fn get_time_translation(&self) -> ClockSyncModel {
            self.model
        }
        fn set_last_chip_clock(&mut self, chip_clock: f64) {
            self.committed = Some(chip_clock);
        }
    }

    fn fixed(inv_freq: f64) -> FixedClock {
        FixedClock {
            model: ClockSyncModel { time_base: 10.0, chip_base: 0.0, inv_freq },
            committed: None,
        }
    }

    #[test]
    fn sequence_delta_wraps() {
        assert_eq!(sequence_delta(65530, 4), 10);
        assert_eq!(sequence_delta(4, 65530), -10);
        assert_eq!(sequence_delta(100, 100), 0);
        assert_eq!(sequence_delta(0, 32767), 32767);
        assert_eq!(sequence_delta(32767, 0), -32767);
    }

    #[test]
    fn sequence_delta_matches_true_gap() {
        for last in (0..=65535u32).step_by(257) {
            for gap in (-32767i64..=32767).step_by(97) {
                let seq = (last as i64 + gap).rem_euclid(65536) as u16;
                assert_eq!(sequence_delta(last as u16, seq), gap, "last={} gap={}", last, gap);
            }
        }
    }

    #[test]
    fn cursor_increases_across_wrap() {
        let mut cursor = SequenceCursor::new(65534);
        let mut prev = cursor.reconstructed_seq;
        for seq in [65535u16, 0, 1, 2] {
            let next = cursor.advance(seq);
            assert!(next > prev);
            prev = next;
        }
        assert_eq!(cursor.reconstructed_seq, 65538);
        assert_eq!(cursor.last_sequence, 2);
    }

    #[test]
    fn zero_sample_block_still_advances() {
        let mut clock = fixed(0.001);
        let mut ts = TimestampHelper::new(&mut clock, 0, SAMPLES_PER_BLOCK);
        ts.update_sequence(1);
        ts.update_sequence(2);
        assert_eq!(ts.cursor().reconstructed_seq, 2);
        let t = ts.time_of_sample(0);
        assert!((t - (10.0 + 2.0 * SAMPLES_PER_BLOCK as f64 * 0.001)).abs() < 1e-9);
    }

    #[test]
    fn timestamps_non_decreasing_within_batch() {
        for inv_freq in [0.0, 1e-7, 1.0 / 320.0, 0.25] {
            let mut clock = fixed(inv_freq);
            let mut ts = TimestampHelper::new(&mut clock, 65530, SAMPLES_PER_BLOCK);
            let mut last = f64::MIN;
            for seq in [65531u16, 65532, 65535, 0, 1] {
                ts.update_sequence(seq);
                for i in 0..SAMPLES_PER_BLOCK {
                    let t = ts.time_of_sample(i);
                    assert!(t >= last, "inv_freq={} t={} last={}", inv_freq, t, last);
                    last = t;
                }
            }
        }
    }

    #[test]
    fn commit_writes_last_chip_clock() {
        let mut clock = fixed(0.001);
        {
            let mut ts = TimestampHelper::new(&mut clock, 10, SAMPLES_PER_BLOCK);
            ts.update_sequence(11);
            ts.time_of_sample(0);
            ts.time_of_sample(5);
            ts.commit();
        }
        assert_eq!(clock.committed, Some((11 * SAMPLES_PER_BLOCK + 5) as f64));
    }

    #[test]
    fn time_is_rounded_to_microseconds() {
        let mut clock = fixed(1.0 / 3.0 * 1e-6);
        let mut ts = TimestampHelper::new(&mut clock, 0, SAMPLES_PER_BLOCK);
        ts.update_sequence(0);
        let t = ts.time_of_sample(1);
        assert_eq!(t, 10.0);
        assert_eq!((t * 1e6).fract(), 0.0);
    }
}
