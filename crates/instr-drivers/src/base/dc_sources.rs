//! Standard interface expected from DC sources.
//!
//! These bundles declare the attribute *names and kinds* only — no command
//! templates. A driver includes the bundle matching its instrument class
//! and overrides each feature with the real commands; anything left
//! unoverridden fails with `UnsupportedOperation` rather than silently
//! returning nothing.

use instr_core::{Bundle, Feature};

/// Single-quantity DC voltage source.
pub fn dc_voltage_source() -> Bundle {
    Bundle::new()
        .feature(Feature::bool("output"))
        .feature(Feature::float("voltage").unit("V"))
        .feature(Feature::float("voltage_range").unit("V"))
}

/// Source able to deliver either voltage or current, selected by
/// `function`, with protection limits for the inactive quantity.
pub fn dc_power_source() -> Bundle {
    dc_voltage_source()
        .feature(Feature::text("function"))
        .feature(Feature::float("current").unit("A"))
        .feature(Feature::float("current_range").unit("A"))
        .feature(Feature::float("voltage_limit").unit("V"))
        .feature(Feature::float("current_limit").unit("A"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use instr_core::Schema;

    #[test]
    fn placeholder_features_build() {
        let schema = Schema::builder("dc")
            .include(dc_power_source())
            .build()
            .unwrap();
        assert!(schema.feature("voltage").is_some());
        assert!(schema.feature("current_limit").is_some());
    }
}
