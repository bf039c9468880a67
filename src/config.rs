// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! Configuration schema for the two documents loaded at boot: device
//! identity/role and the active therapy profile. Both are plain TOML,
//! following the same `serde` + `toml` pattern as the rest of the crate's
//! dependency stack.

use serde::{Deserialize, Serialize};

use crate::engine::PatternGeneratorParams;
use crate::state_machine::DeviceRole;

fn default_startup_window_sec() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub role: DeviceRole,
    pub ble_name: String,
    #[serde(default = "default_startup_window_sec")]
    pub startup_window_sec: u32,
    pub firmware_version: String,
}

fn default_battery_warning_voltage() -> f32 {
    3.3
}

fn default_battery_critical_voltage() -> f32 {
    3.0
}

/// The active therapy profile. `jitter_percent` is stored here as a plain
/// percentage; the wire codec separately encodes it ×10 fixed-point
/// (`235` meaning `23.5`) per the sync protocol's integer-only payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TherapyProfile {
    pub name: String,
    pub actuator_type: String,
    pub frequency_hz: f32,
    pub amplitude_percent: u8,
    pub time_on_ms: u32,
    pub time_off_ms: u32,
    pub jitter_percent: f32,
    pub num_fingers: u8,
    pub mirror_pattern: bool,
    pub session_duration_min: u32,
    pub pattern_type: String,
    #[serde(default = "default_battery_warning_voltage")]
    pub battery_warning_voltage: f32,
    #[serde(default = "default_battery_critical_voltage")]
    pub battery_critical_voltage: f32,
}

impl TherapyProfile {
    /// Wire encoding of `jitter_percent` as a ×10 fixed-point integer.
    pub fn jitter_percent_x10(&self) -> u32 {
        (self.jitter_percent * 10.0).round() as u32
    }

    pub fn session_duration_sec(&self) -> u32 {
        self.session_duration_min * 60
    }

    pub fn to_pattern_params(&self, random_seed: Option<u64>) -> PatternGeneratorParams {
        PatternGeneratorParams {
            num_fingers: self.num_fingers,
            mirror_pattern: self.mirror_pattern,
            randomize: true,
            reversed: false,
            random_seed,
            jitter_percent: self.jitter_percent as f64,
            time_on_ms: self.time_on_ms as f64,
            time_off_ms: self.time_off_ms as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_config_parses_from_toml_with_defaults() {
        let toml_str = r#"
            role = "Primary"
            ble_name = "bilateral-glove"
            firmware_version = "1.0.0"
        "#;
        let config: DeviceConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.startup_window_sec, 30);
        assert_eq!(config.role, DeviceRole::Primary);
    }

    #[test]
    fn therapy_profile_jitter_encodes_as_fixed_point() {
        let profile = TherapyProfile {
            name: "default".to_string(),
            actuator_type: "lra".to_string(),
            frequency_hz: 175.0,
            amplitude_percent: 75,
            time_on_ms: 100,
            time_off_ms: 50,
            jitter_percent: 23.5,
            num_fingers: 5,
            mirror_pattern: false,
            session_duration_min: 20,
            pattern_type: "rndp".to_string(),
            battery_warning_voltage: 3.3,
            battery_critical_voltage: 3.0,
        };
        assert_eq!(profile.jitter_percent_x10(), 235);
        assert_eq!(profile.session_duration_sec(), 1200);
    }
}
