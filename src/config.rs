use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::executor::{ExecutionMode, DEFAULT_LIVE_INTERVAL, DEFAULT_LIVE_MAX_POINTS};
use crate::safety::{validate_compliance, validate_delay, FastLimit};
use crate::transport::SimModel;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub instrument: InstrumentConfig,
    pub sweep: SweepConfig,
    pub live: LiveConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct InstrumentConfig {
    /// VISA-style resource name, e.g. `GPIB0::24::INSTR`.
    pub resource: String,
    pub timeout_ms: u64,
    pub default_compliance_ua: f64,
    pub serial_baud: u32,
    /// Talk to the in-process simulator instead of hardware.
    pub simulate: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SweepConfig {
    pub execution: ExecutionMode,
    pub delay_s: f64,
    pub fast_limit: FastLimit,
    pub step: f64,
    pub cycles: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LiveConfig {
    pub interval_ms: u64,
    pub max_points: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub output_path: String,
    pub log_level: String,
    pub buffer_size: usize,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            resource: "GPIB0::24::INSTR".to_string(),
            timeout_ms: 5000,
            default_compliance_ua: 1.0,
            serial_baud: 9600,
            simulate: false,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionMode::HostPaced,
            delay_s: 0.1,
            fast_limit: FastLimit::OneMillisecond,
            step: 0.1,
            cycles: 1,
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_LIVE_INTERVAL.as_millis() as u64,
            max_points: DEFAULT_LIVE_MAX_POINTS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_path: "./data".to_string(),
            log_level: "info".to_string(),
            buffer_size: 100,
        }
    }
}

impl InstrumentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resource to open, honouring `simulate`.
    pub fn effective_resource(&self) -> String {
        if self.simulate && !self.resource.to_ascii_uppercase().starts_with("SIM::") {
            SimModel::Keithley2602.resource_name()
        } else {
            self.resource.clone()
        }
    }
}

impl LiveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl LoggingConfig {
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_path)
    }
}

impl AppConfig {
    /// Check values the instrument would reject before anything is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instrument.resource.trim().is_empty() && !self.instrument.simulate {
            return Err(ConfigError::Message(
                "instrument.resource must not be empty".to_string(),
            ));
        }
        if self.instrument.timeout_ms == 0 {
            return Err(ConfigError::Message(
                "instrument.timeout_ms must be positive".to_string(),
            ));
        }
        validate_compliance(self.instrument.default_compliance_ua)
            .map_err(|e| ConfigError::Message(format!("instrument.default_compliance_ua: {e}")))?;

        let fast_limit = match self.sweep.execution {
            ExecutionMode::HostPaced => None,
            ExecutionMode::InstrumentTimed => Some(self.sweep.fast_limit),
        };
        validate_delay(self.sweep.delay_s, fast_limit)
            .map_err(|e| ConfigError::Message(format!("sweep.delay_s: {e}")))?;
        if !self.sweep.step.is_finite() || self.sweep.step == 0.0 {
            return Err(ConfigError::Message(
                "sweep.step must be a nonzero finite number".to_string(),
            ));
        }
        if self.sweep.cycles == 0 {
            return Err(ConfigError::Message("sweep.cycles must be at least 1".to_string()));
        }

        if self.live.interval_ms == 0 {
            return Err(ConfigError::Message("live.interval_ms must be positive".to_string()));
        }
        if self.live.max_points == 0 {
            return Err(ConfigError::Message("live.max_points must be positive".to_string()));
        }
        if self.logging.buffer_size == 0 {
            return Err(ConfigError::Message(
                "logging.buffer_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        for path in ["smu.toml", "config.toml"] {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // RUSTY_SMU__INSTRUMENT__RESOURCE=... style overrides
    builder = builder.add_source(
        Environment::with_prefix("RUSTY_SMU")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?.try_deserialize::<AppConfig>()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rusty-smu-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.instrument.timeout(), Duration::from_millis(5000));
        assert_eq!(config.live.interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let path = write_temp(
            "override.toml",
            r#"
[instrument]
resource = "GPIB1::7::INSTR"
default_compliance_ua = 100.0

[sweep]
execution = "instrument-timed"
delay_s = 0.0005
fast_limit = "500ns"

[live]
interval_ms = 250
"#,
        );
        let config = load_config(Some(path.as_path())).unwrap();
        assert_eq!(config.instrument.resource, "GPIB1::7::INSTR");
        assert_eq!(config.instrument.default_compliance_ua, 100.0);
        assert_eq!(config.instrument.timeout_ms, 5000);
        assert_eq!(config.sweep.execution, ExecutionMode::InstrumentTimed);
        assert_eq!(config.sweep.fast_limit, FastLimit::FiveHundredNanoseconds);
        assert_eq!(config.live.interval_ms, 250);
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let path = write_temp(
            "invalid.toml",
            r#"
[sweep]
delay_s = 0.001
"#,
        );
        assert!(load_config(Some(path.as_path())).is_err());

        let mut config = AppConfig::default();
        config.instrument.default_compliance_ua = 2_000_000.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = Path::new("/nonexistent/smu.toml");
        assert!(load_config(Some(path)).is_err());
        let config = load_config_or_default(Some(path));
        assert_eq!(config.instrument.resource, "GPIB0::24::INSTR");
    }

    #[test]
    fn test_simulate_selects_sim_resource() {
        let mut instrument = InstrumentConfig::default();
        assert_eq!(instrument.effective_resource(), "GPIB0::24::INSTR");
        instrument.simulate = true;
        assert_eq!(instrument.effective_resource(), "SIM::2602::INSTR");
        instrument.resource = "SIM::2400::INSTR".to_string();
        assert_eq!(instrument.effective_resource(), "SIM::2400::INSTR");
    }
}
