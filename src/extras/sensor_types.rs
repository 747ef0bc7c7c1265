// src/extras/sensor_types.rs
// Bulk ADC chips usable as a load cell sensor.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::bulk_sensor::{SessionParams, BYTES_PER_SAMPLE};
use crate::configfile::{ConfigError, Configfile};

/// Option tables for one chip. `gains` maps the config value to the code
/// the chip (or its MCU driver) expects.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorType {
    pub name: &'static str,
    pub sample_rates: &'static [&'static str],
    pub default_sample_rate: &'static str,
    pub gains: &'static [(&'static str, u8)],
    pub default_gain: &'static str,
    pub bytes_per_sample: usize,
    /// Saturation limits in counts.
    pub range: (i32, i32),
}

const RANGE_24BIT: (i32, i32) = (-(1 << 24), 1 << 24);

static SENSOR_TYPES: Lazy<HashMap<&'static str, SensorType>> = Lazy::new(|| {
    let types = [
        SensorType {
            name: "hx711",
            sample_rates: &["80", "10"],
            default_sample_rate: "80",
            gains: &[("A-128", 1), ("B-32", 2), ("A-64", 3)],
            default_gain: "A-128",
            bytes_per_sample: BYTES_PER_SAMPLE,
            range: RANGE_24BIT,
        },
        SensorType {
            name: "hx717",
            sample_rates: &["320", "80", "20", "10"],
            default_sample_rate: "320",
            gains: &[("A-128", 1), ("B-64", 2), ("A-64", 3), ("B-8", 4)],
            default_gain: "A-128",
            bytes_per_sample: BYTES_PER_SAMPLE,
            range: RANGE_24BIT,
        },
        SensorType {
            name: "ads1220",
            sample_rates: &[
                "20", "45", "90", "175", "330", "600", "1000", "40", "180", "350", "660", "1200", "2000",
            ],
            default_sample_rate: "660",
            gains: &[
                ("1", 0x0),
                ("2", 0x1),
                ("4", 0x2),
                ("8", 0x3),
                ("16", 0x4),
                ("32", 0x5),
                ("64", 0x6),
                ("128", 0x7),
            ],
            default_gain: "128",
            bytes_per_sample: BYTES_PER_SAMPLE,
            range: RANGE_24BIT,
        },
        SensorType {
            name: "ads1256",
            sample_rates: &[
                "2.5", "5", "10", "15", "25", "30", "50", "60", "100", "500", "1000", "2000", "3750", "7500", "15000",
                "30000",
            ],
            default_sample_rate: "2000",
            gains: &[
                ("1", 0x0),
                ("2", 0x1),
                ("4", 0x2),
                ("8", 0x3),
                ("16", 0x4),
                ("32", 0x5),
                ("64", 0x6),
            ],
            default_gain: "64",
            bytes_per_sample: BYTES_PER_SAMPLE,
            range: RANGE_24BIT,
        },
    ];
    types.into_iter().map(|t| (t.name, t)).collect()
});

pub fn lookup(name: &str) -> Option<&'static SensorType> {
    SENSOR_TYPES.get(name)
}

pub fn sensor_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = SENSOR_TYPES.keys().copied().collect();
    names.sort_unstable();
    names
}

impl SensorType {
    pub fn gain_names(&self) -> Vec<&'static str> {
        self.gains.iter().map(|(name, _)| *name).collect()
    }

    pub fn gain_code(&self, gain: &str) -> Option<u8> {
        self.gains.iter().find(|(name, _)| *name == gain).map(|(_, code)| *code)
    }

    pub fn is_saturated(&self, counts: i32) -> bool {
        counts <= self.range.0 || counts >= self.range.1
    }
}

/// Resolved sensor options of one `[load_cell]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub sensor_type: &'static SensorType,
    pub sample_rate: f64,
    pub gain: String,
    pub gain_code: u8,
    pub duty_cycle: f64,
}

impl SensorConfig {
    pub fn from_config(config: &Configfile, section: &str) -> Result<Self, ConfigError> {
        let names = sensor_names();
        let type_name = config.getchoice(section, "sensor_type", &names, None)?;
        let sensor_type = lookup(&type_name)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown sensor_type '{}'", type_name)))?;
        let rate = config.getchoice(
            section,
            "sample_rate",
            sensor_type.sample_rates,
            Some(sensor_type.default_sample_rate),
        )?;
        let sample_rate = rate
            .parse::<f64>()
            .map_err(|_| ConfigError::ParseError("sample_rate".to_string(), rate.clone(), "float".to_string()))?;
        let gain = config.getchoice(section, "gain", &sensor_type.gain_names(), Some(sensor_type.default_gain))?;
        let gain_code = sensor_type
            .gain_code(&gain)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown gain '{}'", gain)))?;
        let duty_cycle = config.getfloat(section, "duty_cycle", Some(0.7), Some(0.1), Some(1.0))?;
        Ok(Self {
            sensor_type,
            sample_rate,
            gain,
            gain_code,
            duty_cycle,
        })
    }

    pub fn session_params(&self, name: &str) -> SessionParams {
        SessionParams {
            name: name.to_string(),
            sample_rate: self.sample_rate,
            duty_cycle: self.duty_cycle,
        }
    }
}
