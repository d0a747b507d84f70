//! Controller configuration.
//!
//! All tunables recognized by the core, with the defaults from the
//! deployment environment: per-tenant topic names, broker and store
//! addresses, QoT thresholds, and the reconfiguration policy. Values
//! load from environment variables (`from_env`) or are assembled with
//! the builder; `validate` rejects inconsistent combinations.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Modulation, DEFAULT_TOTAL_SLOTS};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("invalid value for {name}: {value}")]
    Environment { name: String, value: String },
}

/// Which connection end receives Tx-power adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustMode {
    Both,
    Source,
    Destination,
}

impl FromStr for AdjustMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "both" => Ok(Self::Both),
            "source" => Ok(Self::Source),
            "destination" => Ok(Self::Destination),
            other => Err(format!("unknown adjust mode: {other}")),
        }
    }
}

/// Complete controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Tenant identity owning this controller instance.
    pub virtual_operator: String,
    /// Identity carried in discovery broadcasts.
    pub controller_id: String,
    /// Controller-to-agent command topic, `config_<vop>` by default.
    pub config_topic: String,
    /// Agent-to-controller monitoring topic, `monitoring_<vop>` by default.
    pub monitoring_topic: String,
    /// Address of the message broker.
    pub broker_address: String,
    /// SQLite URL or path of the resource store.
    pub store_url: String,

    // QoT policy.
    pub osnr_threshold_db: f64,
    pub critical_osnr_db: f64,
    pub ber_threshold: f64,
    pub persistency_samples: usize,
    pub cooldown: Duration,
    pub tx_step_db: f64,
    pub tx_min_dbm: f64,
    pub tx_max_dbm: f64,
    pub adjust_mode: AdjustMode,
    pub max_reconfig_attempts: u32,

    // Path computation.
    pub slot_width_ghz: f64,
    pub default_spectrum_slots: u16,
    pub total_slots: u16,
    /// Spectral efficiency overrides in bit/s/Hz; formats absent here
    /// fall back to [`Modulation::default_spectral_efficiency`].
    pub spectral_efficiency: HashMap<Modulation, f64>,

    // Timers and timeouts.
    pub send_timeout: Duration,
    pub send_retries: u32,
    pub store_timeout: Duration,
    pub consumer_poll_interval: Duration,
    pub heartbeat_window: Duration,
    pub agent_reap_after: Duration,
    pub agent_reap_interval: Duration,
    pub recovery_sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let vop = "vOp1".to_string();
        Self {
            controller_id: format!("controller-{vop}"),
            config_topic: format!("config_{vop}"),
            monitoring_topic: format!("monitoring_{vop}"),
            virtual_operator: vop,
            broker_address: "localhost:9092".to_string(),
            store_url: "sqlite://lightpathd.db".to_string(),
            osnr_threshold_db: 18.0,
            critical_osnr_db: 15.0,
            ber_threshold: 1e-3,
            persistency_samples: 3,
            cooldown: Duration::from_secs(20),
            tx_step_db: 1.0,
            tx_min_dbm: -15.0,
            tx_max_dbm: 0.0,
            adjust_mode: AdjustMode::Both,
            max_reconfig_attempts: 3,
            slot_width_ghz: 12.5,
            default_spectrum_slots: 4,
            total_slots: DEFAULT_TOTAL_SLOTS,
            spectral_efficiency: HashMap::new(),
            send_timeout: Duration::from_secs(10),
            send_retries: 3,
            store_timeout: Duration::from_secs(5),
            consumer_poll_interval: Duration::from_secs(1),
            heartbeat_window: Duration::from_secs(60),
            agent_reap_after: Duration::from_secs(300),
            agent_reap_interval: Duration::from_secs(300),
            recovery_sweep_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ControllerConfig {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset. Topic names derive from
    /// `VIRTUAL_OPERATOR` unless given explicitly.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(vop) = std::env::var("VIRTUAL_OPERATOR") {
            cfg.controller_id = format!("controller-{vop}");
            cfg.config_topic = format!("config_{vop}");
            cfg.monitoring_topic = format!("monitoring_{vop}");
            cfg.virtual_operator = vop;
        }
        if let Ok(v) = std::env::var("CONTROLLER_ID") {
            cfg.controller_id = v;
        }
        if let Ok(v) = std::env::var("CONFIG_TOPIC") {
            cfg.config_topic = v;
        }
        if let Ok(v) = std::env::var("MONITORING_TOPIC") {
            cfg.monitoring_topic = v;
        }
        if let Ok(v) = std::env::var("BROKER_ADDRESS") {
            cfg.broker_address = v;
        }
        if let Ok(v) = std::env::var("STORE_URL") {
            cfg.store_url = v;
        }

        cfg.osnr_threshold_db = env_parse("OSNR_THRESHOLD", cfg.osnr_threshold_db)?;
        cfg.critical_osnr_db = env_parse("CRITICAL_OSNR_THRESHOLD", cfg.critical_osnr_db)?;
        cfg.ber_threshold = env_parse("BER_THRESHOLD", cfg.ber_threshold)?;
        cfg.persistency_samples = env_parse("PERSISTENCY_SAMPLES", cfg.persistency_samples)?;
        cfg.cooldown = Duration::from_secs(env_parse("COOLDOWN_SEC", cfg.cooldown.as_secs())?);
        cfg.tx_step_db = env_parse("TX_STEP_DB", cfg.tx_step_db)?;
        cfg.tx_min_dbm = env_parse("TX_MIN_DBM", cfg.tx_min_dbm)?;
        cfg.tx_max_dbm = env_parse("TX_MAX_DBM", cfg.tx_max_dbm)?;
        cfg.slot_width_ghz = env_parse("SLOT_WIDTH_GHZ", cfg.slot_width_ghz)?;
        cfg.default_spectrum_slots =
            env_parse("DEFAULT_SPECTRUM_SLOTS", cfg.default_spectrum_slots)?;

        if let Ok(v) = std::env::var("ADJUST_MODE") {
            cfg.adjust_mode = v.parse().map_err(|_| ConfigError::Environment {
                name: "ADJUST_MODE".to_string(),
                value: v,
            })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Starts a builder seeded with defaults.
    #[must_use]
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::new()
    }

    /// Preset for tests: in-memory-friendly store URL and short timers
    /// so scenario tests complete quickly.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            store_url: "sqlite::memory:".to_string(),
            cooldown: Duration::from_millis(400),
            send_timeout: Duration::from_secs(2),
            consumer_poll_interval: Duration::from_millis(20),
            heartbeat_window: Duration::from_secs(60),
            agent_reap_after: Duration::from_secs(2),
            agent_reap_interval: Duration::from_millis(100),
            recovery_sweep_interval: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Effective spectral efficiency for a modulation format.
    #[must_use]
    pub fn spectral_efficiency_for(&self, modulation: Modulation) -> f64 {
        self.spectral_efficiency
            .get(&modulation)
            .copied()
            .unwrap_or_else(|| modulation.default_spectral_efficiency())
    }

    /// Rejects configurations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.virtual_operator.is_empty() {
            return Err(validation("virtual_operator", "must not be empty"));
        }
        if self.slot_width_ghz <= 0.0 {
            return Err(validation("slot_width_ghz", "must be positive"));
        }
        if self.total_slots == 0 {
            return Err(validation("total_slots", "must be positive"));
        }
        if self.persistency_samples == 0 {
            return Err(validation("persistency_samples", "must be at least 1"));
        }
        if self.critical_osnr_db >= self.osnr_threshold_db {
            return Err(validation(
                "critical_osnr_db",
                "must be below osnr_threshold_db",
            ));
        }
        if self.tx_min_dbm >= self.tx_max_dbm {
            return Err(validation("tx_min_dbm", "must be below tx_max_dbm"));
        }
        if self.tx_step_db <= 0.0 {
            return Err(validation("tx_step_db", "must be positive"));
        }
        if self.send_timeout.is_zero() {
            return Err(validation("send_timeout", "must be positive"));
        }
        for (modulation, eff) in &self.spectral_efficiency {
            if *eff <= 0.0 {
                return Err(validation(
                    "spectral_efficiency",
                    &format!("{modulation} efficiency must be positive"),
                ));
            }
        }
        Ok(())
    }
}

fn validation(field: &str, reason: &str) -> ConfigError {
    ConfigError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Environment {
            name: name.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

/// Builder for custom configurations.
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
        }
    }

    /// Sets the tenant and re-derives controller id and topic names.
    #[must_use]
    pub fn virtual_operator(mut self, vop: impl Into<String>) -> Self {
        let vop = vop.into();
        self.config.controller_id = format!("controller-{vop}");
        self.config.config_topic = format!("config_{vop}");
        self.config.monitoring_topic = format!("monitoring_{vop}");
        self.config.virtual_operator = vop;
        self
    }

    #[must_use]
    pub fn broker_address(mut self, addr: impl Into<String>) -> Self {
        self.config.broker_address = addr.into();
        self
    }

    #[must_use]
    pub fn store_url(mut self, url: impl Into<String>) -> Self {
        self.config.store_url = url.into();
        self
    }

    #[must_use]
    pub fn osnr_threshold_db(mut self, db: f64) -> Self {
        self.config.osnr_threshold_db = db;
        self
    }

    #[must_use]
    pub fn ber_threshold(mut self, ber: f64) -> Self {
        self.config.ber_threshold = ber;
        self
    }

    #[must_use]
    pub fn persistency_samples(mut self, n: usize) -> Self {
        self.config.persistency_samples = n;
        self
    }

    #[must_use]
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn adjust_mode(mut self, mode: AdjustMode) -> Self {
        self.config.adjust_mode = mode;
        self
    }

    #[must_use]
    pub fn spectral_efficiency(mut self, modulation: Modulation, bits_per_hz: f64) -> Self {
        self.config
            .spectral_efficiency
            .insert(modulation, bits_per_hz);
        self
    }

    #[must_use]
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    /// Validates and returns the finished configuration.
    pub fn build(self) -> Result<ControllerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ControllerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn testing_config_is_valid() {
        assert!(ControllerConfig::testing().validate().is_ok());
    }

    #[test]
    fn topics_derive_from_virtual_operator() {
        let cfg = ControllerConfig::builder()
            .virtual_operator("vOp7")
            .build()
            .unwrap();
        assert_eq!(cfg.config_topic, "config_vOp7");
        assert_eq!(cfg.monitoring_topic, "monitoring_vOp7");
        assert_eq!(cfg.controller_id, "controller-vOp7");
    }

    #[test]
    fn critical_threshold_must_sit_below_degraded() {
        let cfg = ControllerConfig {
            critical_osnr_db: 19.0,
            ..ControllerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn efficiency_overrides_win_over_defaults() {
        let cfg = ControllerConfig::builder()
            .spectral_efficiency(Modulation::Dp16Qam, 4.5)
            .build()
            .unwrap();
        assert!((cfg.spectral_efficiency_for(Modulation::Dp16Qam) - 4.5).abs() < f64::EPSILON);
        assert!((cfg.spectral_efficiency_for(Modulation::DpQpsk) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn adjust_mode_parses_case_insensitively() {
        assert_eq!("BOTH".parse::<AdjustMode>().unwrap(), AdjustMode::Both);
        assert_eq!("source".parse::<AdjustMode>().unwrap(), AdjustMode::Source);
        assert!("sideways".parse::<AdjustMode>().is_err());
    }
}
