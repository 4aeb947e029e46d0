// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Settings
//!
//! Resolution order, later wins:
//!
//! 1. built-in defaults
//! 2. the `[gpuav]` table of the TOML file named by `GPUAV_CONFIG`
//! 3. individual `GPUAV_*` environment variables
//!
//! A broken file is an error.  A broken environment variable is a warning and is ignored, since
//! it usually comes from a shell profile nobody is looking at.
//!
//! ```toml
//! [gpuav]
//! feedback_capacity = 4096
//! address_checks = false
//! sentinel_address = "0xffff000000000000"
//! ```

use gpuav_spirv::{DEFAULT_SENTINEL, InstrumentOptions};
use tracing::warn;

use crate::GpuavError;

pub const CONFIG_VAR: &str = "GPUAV_CONFIG";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Records per command buffer.
    pub feedback_capacity: u32,
    /// Diagnostics delivered per submission.  The rest are counted.
    pub max_diagnostics: usize,
    pub descriptor_checks: bool,
    pub address_checks: bool,
    pub texel_checks: bool,
    /// Base of the address window failed pointer chains are redirected into.
    pub sentinel_address: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            feedback_capacity: 1024,
            max_diagnostics: 256,
            descriptor_checks: true,
            address_checks: true,
            texel_checks: true,
            sentinel_address: DEFAULT_SENTINEL,
        }
    }
}

impl Settings {
    /// Defaults, then the config file, then the environment.
    pub fn load() -> Result<Self, GpuavError> {
        let mut settings = match std::env::var(CONFIG_VAR) {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)?;
                Self::from_toml(&text)?
            }
            Err(_) => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Defaults overridden by the `[gpuav]` table of `text`.  Other tables are ignored.
    pub fn from_toml(text: &str) -> Result<Self, GpuavError> {
        let parsed: toml::Table = toml::from_str(text)?;
        let mut settings = Self::default();
        let Some(table) = parsed.get("gpuav") else {
            return Ok(settings);
        };
        let table = table
            .as_table()
            .ok_or_else(|| GpuavError::Config("[gpuav] must be a table".to_owned()))?;

        for (key, value) in table {
            let invalid = || GpuavError::Config(format!("invalid value for {key}: {value}"));
            match key.as_str() {
                "feedback_capacity" => {
                    settings.feedback_capacity = value
                        .as_integer()
                        .and_then(|v| u32::try_from(v).ok())
                        .filter(|v| *v > 0)
                        .ok_or_else(invalid)?;
                }
                "max_diagnostics" => {
                    settings.max_diagnostics = value
                        .as_integer()
                        .and_then(|v| usize::try_from(v).ok())
                        .ok_or_else(invalid)?;
                }
                "descriptor_checks" => {
                    settings.descriptor_checks = value.as_bool().ok_or_else(invalid)?
                }
                "address_checks" => settings.address_checks = value.as_bool().ok_or_else(invalid)?,
                "texel_checks" => settings.texel_checks = value.as_bool().ok_or_else(invalid)?,
                "sentinel_address" => {
                    // Addresses above i64::MAX only fit as strings.
                    let address = match value {
                        toml::Value::Integer(v) => u64::try_from(*v).ok(),
                        toml::Value::String(s) => parse_u64(s),
                        _ => None,
                    };
                    settings.sentinel_address = address.ok_or_else(invalid)?;
                }
                other => warn!(key = other, "unknown gpuav setting"),
            }
        }
        Ok(settings)
    }

    /// Apply `GPUAV_*` overrides.  `lookup` is normally `std::env::var`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn get<T>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            parse: impl Fn(&str) -> Option<T>,
        ) -> Option<T> {
            let raw = lookup(key)?;
            let parsed = parse(raw.trim());
            if parsed.is_none() {
                warn!(key, value = raw, "ignoring invalid environment override");
            }
            parsed
        }

        if let Some(v) = get(&lookup, "GPUAV_FEEDBACK_CAPACITY", |s| {
            parse_u64(s)
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
        }) {
            self.feedback_capacity = v;
        }
        if let Some(v) = get(&lookup, "GPUAV_MAX_DIAGNOSTICS", |s| {
            parse_u64(s).and_then(|v| usize::try_from(v).ok())
        }) {
            self.max_diagnostics = v;
        }
        if let Some(v) = get(&lookup, "GPUAV_DESCRIPTOR_CHECKS", parse_bool) {
            self.descriptor_checks = v;
        }
        if let Some(v) = get(&lookup, "GPUAV_ADDRESS_CHECKS", parse_bool) {
            self.address_checks = v;
        }
        if let Some(v) = get(&lookup, "GPUAV_TEXEL_CHECKS", parse_bool) {
            self.texel_checks = v;
        }
        if let Some(v) = get(&lookup, "GPUAV_SENTINEL_ADDRESS", parse_u64) {
            self.sentinel_address = v;
        }
    }

    pub fn instrument_options(&self) -> InstrumentOptions {
        InstrumentOptions {
            descriptor_checks: self.descriptor_checks,
            address_checks: self.address_checks,
            texel_checks: self.texel_checks,
            sentinel_address: self.sentinel_address,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Decimal or `0x` hex, underscores allowed.
fn parse_u64(s: &str) -> Option<u64> {
    let s = s.replace('_', "");
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
