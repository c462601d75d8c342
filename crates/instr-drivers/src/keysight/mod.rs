//! Keysight DC power sources.

pub mod model_e3631a;
