//! Command-set standards shared across instruments.

pub mod ieee488;
pub mod scpi;
