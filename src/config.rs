//! Lab configuration using Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. a TOML file (`config/lab.toml` by default)
//! 3. environment variables prefixed `AUTOLAB_`, nested with `__`
//!    (e.g. `AUTOLAB_ENGINE__ABORT_GRACE=5s`, `AUTOLAB_LOGGING__LEVEL=debug`)
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [[devices]]
//! category = "temperature_controller"
//! vendor = "sim"
//! model = "heater"
//! instance_id = "heater"
//! connection = { kind = "simulated", address = "heater" }
//!
//! [[safety]]
//! name = "max_temp"
//! field = "temperature"
//! when = { above = 90.0 }
//! action = "emergency_stop_all"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionSettings;
use crate::device::DeviceSpec;
use crate::engine::EngineSettings;
use crate::error::{LabError, LabResult};
use crate::logging::LoggingSettings;
use crate::safety::{SafetyRule, SafetyRuleSet};

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/lab.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "AUTOLAB_";

/// Run log output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    /// Directory receiving one CSV run log per run. Disabled when unset.
    pub run_log_dir: Option<PathBuf>,
}

/// Complete lab configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    /// Tracing setup.
    pub logging: LoggingSettings,
    /// Transport timeouts and reconnect policy.
    pub connection: ConnectionSettings,
    /// Engine tuning.
    pub engine: EngineSettings,
    /// Run log output.
    pub recorder: RecorderSettings,
    /// Devices to register and open.
    pub devices: Vec<DeviceSpec>,
    /// Safety rules.
    pub safety: Vec<SafetyRule>,
}

impl LabConfig {
    fn base() -> Figment {
        Figment::from(Serialized::defaults(LabConfig::default()))
    }

    /// Load defaults, then `path`, then the environment.
    pub fn load_from(path: impl AsRef<Path>) -> LabResult<Self> {
        Self::base()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| LabError::Configuration(e.to_string()))
    }

    /// Load from [`DEFAULT_CONFIG_PATH`].
    pub fn load() -> LabResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Parse a TOML document over the defaults. No environment overrides.
    pub fn from_toml_str(text: &str) -> LabResult<Self> {
        Self::base()
            .merge(Toml::string(text))
            .extract()
            .map_err(|e| LabError::Configuration(e.to_string()))
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> LabResult<()> {
        self.logging.level()?;

        let engine = &self.engine;
        if engine.default_step_timeout.is_zero() {
            return Err(LabError::Configuration(
                "engine.default_step_timeout must be positive".to_string(),
            ));
        }
        if engine.history_capacity == 0 {
            return Err(LabError::Configuration(
                "engine.history_capacity must be at least 1".to_string(),
            ));
        }

        let reconnect = &self.connection.reconnect;
        if reconnect.max_attempts == 0 {
            return Err(LabError::Configuration(
                "connection.reconnect.max_attempts must be at least 1".to_string(),
            ));
        }
        if reconnect.backoff_multiplier < 1.0 {
            return Err(LabError::Configuration(format!(
                "connection.reconnect.backoff_multiplier {} must be >= 1.0",
                reconnect.backoff_multiplier
            )));
        }

        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        for device in &self.devices {
            if device.id().is_empty() {
                return Err(LabError::Configuration(
                    "device instance_id must not be empty".to_string(),
                ));
            }
            if !ids.insert(device.id()) {
                return Err(LabError::Configuration(format!(
                    "duplicate device id '{}'",
                    device.id()
                )));
            }
            if !addresses.insert(device.connection.claim_key()) {
                return Err(LabError::Configuration(format!(
                    "device '{}' shares address {} with another device",
                    device.id(),
                    device.connection.claim_key()
                )));
            }
            if device.telemetry_interval.is_some_and(|i| i.is_zero()) {
                return Err(LabError::Configuration(format!(
                    "device '{}': telemetry_interval must be positive",
                    device.id()
                )));
            }
        }

        SafetyRuleSet::new(self.safety.clone())?;
        Ok(())
    }

    /// Frozen safety rules.
    pub fn rule_set(&self) -> LabResult<SafetyRuleSet> {
        SafetyRuleSet::new(self.safety.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::DeviceCategory;
    use crate::logging::OutputFormat;
    use crate::safety::SafetyAction;

    const SAMPLE: &str = r#"
        [logging]
        level = "debug"
        format = "json"

        [engine]
        abort_grace = "500ms"

        [[devices]]
        category = "temperature_controller"
        vendor = "sim"
        model = "heater"
        instance_id = "heater"
        telemetry_interval = "1s"
        connection = { kind = "simulated", address = "heater" }
        settings = { time_constant = "2s" }

        [[devices]]
        category = "pump"
        vendor = "sim"
        model = "syringe"
        instance_id = "pump"
        connection = { kind = "simulated", address = "pump" }

        [[safety]]
        name = "max_temp"
        category = "temperature_controller"
        field = "temperature"
        when = { above = 90.0 }
        action = "emergency_stop_all"
    "#;

    #[test]
    fn layers_file_over_defaults() {
        let config = LabConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, OutputFormat::Json);
        assert_eq!(config.engine.abort_grace, Duration::from_millis(500));
        // Untouched sections keep their defaults.
        assert_eq!(
            config.engine.default_step_timeout,
            EngineSettings::default().default_step_timeout
        );
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].category(), DeviceCategory::TemperatureController);
        assert_eq!(
            config.devices[0].telemetry_interval,
            Some(Duration::from_secs(1))
        );
        assert_eq!(config.safety[0].action, SafetyAction::EmergencyStopAll);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_devices() {
        let text = r#"
            [[devices]]
            category = "pump"
            vendor = "sim"
            model = "syringe"
            instance_id = "pump"
            connection = { kind = "simulated", address = "a" }

            [[devices]]
            category = "pump"
            vendor = "sim"
            model = "syringe"
            instance_id = "pump"
            connection = { kind = "simulated", address = "b" }
        "#;
        let config = LabConfig::from_toml_str(text).unwrap();
        assert!(matches!(
            config.validate(),
            Err(LabError::Configuration(msg)) if msg.contains("duplicate device id")
        ));
    }

    #[test]
    fn rejects_bad_log_level() {
        let config = LabConfig::from_toml_str("[logging]\nlevel = \"chatty\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn shipped_config_is_valid() {
        let config = LabConfig::from_toml_str(include_str!("../config/lab.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.devices.len(), 4);
        assert_eq!(config.rule_set().unwrap().len(), 2);
        assert_eq!(config.recorder.run_log_dir, Some(PathBuf::from("runs")));
    }

    #[test]
    fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = LabConfig::load_from(&path).unwrap();
        assert_eq!(config.devices[1].id(), "pump");
    }
}
