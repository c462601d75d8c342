//! Bilt modular chassis and cards.

pub mod be2100;
pub mod bn100;
