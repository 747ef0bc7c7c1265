// src/extras/load_cell.rs
// A load cell: one bulk ADC sensor, its calibration and the consumers of
// its sample batches.

use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use crate::bulk_sensor::{BulkAdcSession, SampleBatch};
use crate::configfile::Configfile;
use crate::error::{Error, Result};
use crate::extras::sensor_types::SensorConfig;
use crate::mcu::{Mcu, McuCommand};

/// Batch consumer. Returning `false` unregisters it.
pub type BatchClient = Box<dyn FnMut(&SampleBatch) -> bool + Send>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadCellStatus {
    pub is_calibrated: bool,
    pub tare_counts: Option<i32>,
    pub counts_per_gram: Option<f64>,
    pub sample_rate: f64,
    pub last_counts: Option<i32>,
    pub force_g: Option<f64>,
    pub errors: u64,
    pub overflows: u64,
}

pub struct LoadCell {
    name: String,
    mcu: Arc<dyn Mcu>,
    sensor: SensorConfig,
    session: BulkAdcSession,
    clients: Vec<BatchClient>,
    collecting: bool,
    collected: Vec<(f64, i32)>,
    tare_counts: Option<i32>,
    counts_per_gram: Option<f64>,
    last_counts: Option<i32>,
    errors: u64,
    overflows: u64,
}

impl LoadCell {
    pub fn new(config: &Configfile, section: &str, mcu: Arc<dyn Mcu>) -> Result<Self> {
        let name = section.split_whitespace().last().unwrap_or(section).to_string();
        let sensor = SensorConfig::from_config(config, section)?;
        let counts_per_gram = if config.has_option(section, "counts_per_gram") {
            Some(config.getfloat(section, "counts_per_gram", None, None, None)?)
        } else {
            None
        };
        if counts_per_gram == Some(0.0) {
            return Err(Error::Calibration(format!("{}: counts_per_gram must be non-zero", name)));
        }
        let tare_counts = if config.has_option(section, "reference_tare_counts") {
            Some(config.getint(section, "reference_tare_counts", None, Some(i32::MIN as i64), Some(i32::MAX as i64))? as i32)
        } else {
            None
        };
        let oid = mcu.create_oid();
        let session = BulkAdcSession::new(Arc::clone(&mcu), oid, sensor.session_params(&name));
        info!(
            "load cell '{}': {} at {} sps, gain {}",
            name, sensor.sensor_type.name, sensor.sample_rate, sensor.gain
        );
        Ok(Self {
            name,
            mcu,
            sensor,
            session,
            clients: Vec::new(),
            collecting: false,
            collected: Vec::new(),
            tare_counts,
            counts_per_gram,
            last_counts: None,
            errors: 0,
            overflows: 0,
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_mcu(&self) -> Arc<dyn Mcu> {
        Arc::clone(&self.mcu)
    }

    pub fn get_sensor(&self) -> &SensorConfig {
        &self.sensor
    }

    pub fn sensor_oid(&self) -> u8 {
        self.session.oid()
    }

    pub fn session_mut(&mut self) -> &mut BulkAdcSession {
        &mut self.session
    }

    pub fn is_collecting(&self) -> bool {
        self.session.is_active()
    }

    /// MCU ticks between two samples.
    pub fn clock_ticks_per_sample(&self) -> u32 {
        self.mcu.seconds_to_clock(1.0 / self.sensor.sample_rate) as u32
    }

    /// Lets the sensor feed samples to the MCU side endstop `endstop_oid`.
    pub fn attach_endstop(&self, endstop_oid: u8) {
        self.mcu.add_config_cmd(
            McuCommand::AttachEndstop {
                oid: self.session.oid(),
                endstop_oid,
            },
            false,
        );
    }

    pub fn is_calibrated(&self) -> bool {
        self.tare_counts.is_some() && self.counts_per_gram.is_some()
    }

    pub fn tare_counts(&self) -> Option<i32> {
        self.tare_counts
    }

    pub fn counts_per_gram(&self) -> Option<f64> {
        self.counts_per_gram
    }

    pub fn tare(&mut self, tare_counts: i32) {
        info!("load cell '{}' tared at {} counts", self.name, tare_counts);
        self.tare_counts = Some(tare_counts);
    }

    pub fn set_calibration(&mut self, counts_per_gram: f64) -> Result<()> {
        if !counts_per_gram.is_finite() || counts_per_gram == 0.0 {
            return Err(Error::Calibration(format!(
                "{}: invalid counts_per_gram {}",
                self.name, counts_per_gram
            )));
        }
        self.counts_per_gram = Some(counts_per_gram);
        Ok(())
    }

    pub fn counts_to_grams(&self, counts: i32) -> Option<f64> {
        match (self.tare_counts, self.counts_per_gram) {
            (Some(tare), Some(cpg)) => Some((counts as f64 - tare as f64) / cpg),
            _ => None,
        }
    }

    /// Registers `client` and starts acquisition if needed.
    pub fn add_client(&mut self, client: BatchClient) -> Result<()> {
        self.clients.push(client);
        self.session.start()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Buffers every sample until [`LoadCell::stop_collecting`].
    pub fn start_collecting(&mut self) -> Result<()> {
        self.collected.clear();
        self.collecting = true;
        self.session.start()
    }

    /// Returns the buffered samples. Acquisition keeps running while
    /// clients remain.
    pub fn stop_collecting(&mut self) -> Result<Vec<(f64, i32)>> {
        self.collecting = false;
        let samples = std::mem::take(&mut self.collected);
        if self.clients.is_empty() {
            self.session.stop()?;
        }
        Ok(samples)
    }

    /// Processes one batch and hands it to every client. An error ends
    /// collection; [`LoadCell::start_collecting`] starts a new session.
    pub fn poll(&mut self) -> Result<SampleBatch> {
        let batch = match self.session.process_batch() {
            Ok(batch) => batch,
            Err(e) => {
                warn!("load cell '{}': {}", self.name, e);
                self.collecting = false;
                return Err(e);
            }
        };
        self.errors += batch.errors as u64;
        self.overflows = batch.overflows;
        if let Some((_, counts)) = batch.samples.last() {
            self.last_counts = Some(*counts);
        }
        if self.collecting {
            self.collected.extend_from_slice(&batch.samples);
        }
        if !self.clients.is_empty() {
            self.clients.retain_mut(|client| client(&batch));
            if self.clients.is_empty() && !self.collecting {
                self.session.stop()?;
            }
        }
        Ok(batch)
    }

    pub fn get_status(&self) -> LoadCellStatus {
        LoadCellStatus {
            is_calibrated: self.is_calibrated(),
            tare_counts: self.tare_counts,
            counts_per_gram: self.counts_per_gram,
            sample_rate: self.sensor.sample_rate,
            last_counts: self.last_counts,
            force_g: self.last_counts.and_then(|c| self.counts_to_grams(c)),
            errors: self.errors,
            overflows: self.overflows,
        }
    }
}
