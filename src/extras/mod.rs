// src/extras/mod.rs
// Printer objects configured from `[load_cell]` style sections.

pub mod load_cell;
pub mod load_cell_endstop;
pub mod sensor_types;
