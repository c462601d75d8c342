//! Declarative drivers for laboratory instruments.
//!
//! Every driver here is a table of [`instr_core`] declarations: command
//! templates, value mappings and numeric limits fed into the generic
//! descriptor engine. Shared command-set standards (IEEE 488.2, SCPI error
//! reporting, identity, DC-source interfaces) live under [`common`] and
//! [`base`] as capability bundles that concrete drivers include and
//! override.
//!
//! Supported instruments:
//!
//! - [`attocube::anc300`] — ANC300 open-loop positioner controller
//! - [`bilt::bn100`] — BN100 chassis with BE2100 DC voltage source cards
//! - [`yokogawa::model_gs200`] / [`yokogawa::model_7651`] — DC power sources
//! - [`keysight::model_e3631a`] — triple-output DC power source

pub mod base;
pub mod common;

pub mod attocube;
pub mod bilt;
pub mod keysight;
pub mod yokogawa;
