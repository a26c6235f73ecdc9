//! Fuzz test for settings TOML parsing
//!
//! Tests that settings deserialization handles arbitrary TOML safely.

#![no_main]

use cdrip_core::Settings;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(settings) = Settings::from_toml(data) {
        // Should be able to serialize without panicking
        let _ = toml::to_string_pretty(&settings);

        // Conversions clamp out-of-range values instead of failing
        let _ = settings.drive_options();
        let _ = settings.output_config();
        let config = settings.config();
        let _ = config.strategy.name();
    }

    // Test with table wrappers (how sections appear in the file)
    for section in ["drive", "comparison", "paranoia", "output"] {
        let wrapped = format!("[{section}]\n{data}");
        let _ = Settings::from_toml(&wrapped);
    }
});
