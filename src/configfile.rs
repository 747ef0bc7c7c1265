// src/configfile.rs
// INI style printer configuration with typed, range checked getters.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Section not found: [{0}]")]
    SectionNotFound(String),
    #[error("Option '{1}' not found in section '[{0}]'")]
    OptionNotFound(String, String),
    #[error("Failed to parse option '{0}' value '{1}' as {2}")]
    ParseError(String, String, String), // option, value, type_expected
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Config syntax error: {0}")]
    Syntax(String),
    /// Options that parse fine but describe an unsupported setup.
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Default, Clone)]
pub struct Configfile {
    // section -> { option -> raw value }, names stored lowercase
    data: HashMap<String, HashMap<String, String>>,
}

impl Configfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(content: &str) -> Result<Self, ConfigError> {
        let mut cf = Self::new();
        cf.parse(content)?;
        Ok(cf)
    }

    /// Parses `[section]` headers followed by `key = value` or `key: value`
    /// lines. `#` and `;` start comments.
    pub fn parse(&mut self, content: &str) -> Result<(), ConfigError> {
        self.data.clear();
        let mut current: Option<String> = None;

        for raw in content.lines() {
            let line = match raw.find(|c| c == '#' || c == ';') {
                Some(index) => &raw[..index],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim().to_lowercase();
                if name.is_empty() {
                    return Err(ConfigError::Syntax("Empty section name found".to_string()));
                }
                self.data.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }

            let section = current
                .as_ref()
                .ok_or_else(|| ConfigError::Syntax(format!("Line outside of section: {}", raw)))?;
            let (key, value) = line
                .find(|c| c == '=' || c == ':')
                .map(|index| (&line[..index], &line[index + 1..]))
                .ok_or_else(|| {
                    ConfigError::Syntax(format!("Malformed line in section [{}]: {}", section, raw))
                })?;
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return Err(ConfigError::Syntax(format!(
                    "Empty key found in section [{}]",
                    section
                )));
            }
            self.data
                .entry(section.clone())
                .or_default()
                .insert(key, value.trim().to_string());
        }
        Ok(())
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.data.contains_key(&section.to_lowercase())
    }

    pub fn has_option(&self, section: &str, option: &str) -> bool {
        self.get_str(section, option).is_ok()
    }

    /// Sections whose name starts with `prefix`, e.g. "load_cell" matches
    /// "load_cell" and "load_cell probe".
    pub fn get_prefix_sections(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.to_lowercase();
        let mut names: Vec<String> = self
            .data
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn get_str(&self, section: &str, option: &str) -> Result<&String, ConfigError> {
        self.data
            .get(&section.to_lowercase())
            .ok_or_else(|| ConfigError::SectionNotFound(section.to_string()))?
            .get(&option.to_lowercase())
            .ok_or_else(|| ConfigError::OptionNotFound(section.to_string(), option.to_string()))
    }

    // Missing options fall back to `default`, anything else propagates.
    fn lookup<T>(
        &self,
        section: &str,
        option: &str,
        default: Option<T>,
        parse: impl FnOnce(&String) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        match self.get_str(section, option) {
            Ok(raw) => parse(raw),
            Err(ConfigError::OptionNotFound(s, o)) => default.ok_or(ConfigError::OptionNotFound(s, o)),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, section: &str, option: &str, default: Option<&str>) -> Result<String, ConfigError> {
        self.lookup(section, option, default.map(str::to_string), |raw| Ok(raw.clone()))
    }

    pub fn getfloat(
        &self,
        section: &str,
        option: &str,
        default: Option<f64>,
        minval: Option<f64>,
        maxval: Option<f64>,
    ) -> Result<f64, ConfigError> {
        let value = self.lookup(section, option, default, |raw| {
            match raw.parse::<f64>() {
                Ok(value) if value.is_finite() => Ok(value),
                _ => Err(ConfigError::ParseError(option.to_string(), raw.clone(), "float".to_string())),
            }
        })?;
        check_bounds(section, option, value, minval, maxval)?;
        Ok(value)
    }

    pub fn getint(
        &self,
        section: &str,
        option: &str,
        default: Option<i64>,
        minval: Option<i64>,
        maxval: Option<i64>,
    ) -> Result<i64, ConfigError> {
        let value = self.lookup(section, option, default, |raw| {
            raw.parse::<i64>()
                .map_err(|_| ConfigError::ParseError(option.to_string(), raw.clone(), "integer".to_string()))
        })?;
        check_bounds(section, option, value, minval, maxval)?;
        Ok(value)
    }

    pub fn getboolean(&self, section: &str, option: &str, default: Option<bool>) -> Result<bool, ConfigError> {
        self.lookup(section, option, default, |raw| match raw.to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(ConfigError::ParseError(option.to_string(), raw.clone(), "boolean".to_string())),
        })
    }

    /// Value must be one of `choices` (exact match).
    pub fn getchoice(
        &self,
        section: &str,
        option: &str,
        choices: &[&str],
        default: Option<&str>,
    ) -> Result<String, ConfigError> {
        let value = self.get(section, option, default)?;
        if choices.iter().any(|c| *c == value) {
            Ok(value)
        } else {
            Err(ConfigError::ValidationError(format!(
                "Choice '{}' for option '{}' in section '[{}]' is not a valid choice (expected one of: {})",
                value,
                option,
                section,
                choices.join(", ")
            )))
        }
    }
}

fn check_bounds<T: PartialOrd + std::fmt::Display>(
    section: &str,
    option: &str,
    value: T,
    minval: Option<T>,
    maxval: Option<T>,
) -> Result<(), ConfigError> {
    if let Some(min) = minval {
        if value < min {
            return Err(ConfigError::ValidationError(format!(
                "Option '{}' in section '[{}]' ({}) must be >= {}",
                option, section, value, min
            )));
        }
    }
    if let Some(max) = maxval {
        if value > max {
            return Err(ConfigError::ValidationError(format!(
                "Option '{}' in section '[{}]' ({}) must be <= {}",
                option, section, value, max
            )));
        }
    }
    Ok(())
}
