// src/stepper.rs

/// A stepper motor as seen by homing: its config name and its oid on the
/// MCU that drives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepperRef {
    pub name: String,
    pub oid: u8,
}

impl StepperRef {
    pub fn new(name: impl Into<String>, oid: u8) -> Self {
        Self { name: name.into(), oid }
    }

    /// "stepper_z1" -> "stepper_z". Steppers whose names start with the same
    /// rail prefix drive the same physical axis rail.
    pub fn rail_prefix(&self) -> Option<&str> {
        if !self.name.starts_with("stepper_") {
            return None;
        }
        let end = self
            .name
            .char_indices()
            .nth(9)
            .map_or(self.name.len(), |(i, _)| i);
        Some(&self.name[..end])
    }

    pub fn shares_rail_with(&self, other: &StepperRef) -> bool {
        self.rail_prefix()
            .map_or(false, |prefix| other.name.starts_with(prefix))
    }
}
