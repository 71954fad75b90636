//! Runtime configuration for the display driver.
//!
//! Values come from built-in defaults, then `NETDISP_*` environment variables,
//! then command-line flags. Each value remembers where it came from so a bad
//! setting can be reported against the variable or flag that produced it.

use crate::collect::cpu_idle::{NR_CPU_CORES, PROC_STAT_PATH};
use crate::collect::ports::{MANAGEMENT_PORT, NR_PORTS, PortRemap};
use crate::display::DEFAULT_MAX_BUSY_PERCENT;
use netdisp_common::{EnvError, EnvParser, Sourced};
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_FEED_PATH: &str = "/run/netdisp/ports";
pub const DEFAULT_PERIOD_MS: u64 = 100;
pub const DEFAULT_CORES: u32 = 2;
pub const DEFAULT_DECAY_NUM: u32 = 3;
pub const DEFAULT_DECAY_DEN: u32 = 4;

const MIN_PERIOD_MS: u64 = 10;
const MAX_PERIOD_MS: u64 = 10_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{} configuration error(s): {}", .0.len(), join_errors(.0))]
    Environment(Vec<EnvError>),

    #[error("decay fraction {num}/{den} must be below 1")]
    DecayFraction { num: u32, den: u32 },

    #[error("core count {count} outside 1..={max}")]
    CoreCount { count: u32, max: usize },

    #[error("port {0} cannot be marked unused")]
    UnusedPort(u32),

    #[error("invalid port remap: {0}")]
    Remap(String),
}

fn join_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Settings for one run of the driver.
#[derive(Debug, Clone)]
pub struct DisplayConfig {
    pub stat_path: Sourced<PathBuf>,
    pub feed_path: Sourced<PathBuf>,
    pub perf_period_ms: Sourced<u64>,
    pub port_period_ms: Sourced<u64>,
    pub decay_num: Sourced<u32>,
    pub decay_den: Sourced<u32>,
    pub max_busy_percent: Sourced<u32>,
    pub cores: Sourced<u32>,
    pub remap: Sourced<PortRemap>,
    pub unused_ports: Sourced<Vec<u32>>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            stat_path: Sourced::default_value(PathBuf::from(PROC_STAT_PATH)),
            feed_path: Sourced::default_value(PathBuf::from(DEFAULT_FEED_PATH)),
            perf_period_ms: Sourced::default_value(DEFAULT_PERIOD_MS),
            port_period_ms: Sourced::default_value(DEFAULT_PERIOD_MS),
            decay_num: Sourced::default_value(DEFAULT_DECAY_NUM),
            decay_den: Sourced::default_value(DEFAULT_DECAY_DEN),
            max_busy_percent: Sourced::default_value(DEFAULT_MAX_BUSY_PERCENT),
            cores: Sourced::default_value(DEFAULT_CORES),
            remap: Sourced::default_value(PortRemap::default()),
            unused_ports: Sourced::default_value(Vec::new()),
        }
    }
}

impl DisplayConfig {
    /// Load from `NETDISP_*` variables, reporting every bad variable at once.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut parser = EnvParser::new();

        let remap_raw = parser.get_choice("REMAP", "reverse", &["reverse", "rotate"]);
        let remap = Sourced {
            value: remap_raw.value.parse::<PortRemap>().map_err(ConfigError::Remap)?,
            source: remap_raw.source,
            origin: remap_raw.origin,
        };

        let config = Self {
            stat_path: parser.get_path("STAT_PATH", PROC_STAT_PATH),
            feed_path: parser.get_path("FEED_PATH", DEFAULT_FEED_PATH),
            perf_period_ms: parser.get_u64_range(
                "PERF_PERIOD_MS",
                DEFAULT_PERIOD_MS,
                MIN_PERIOD_MS,
                MAX_PERIOD_MS,
            ),
            port_period_ms: parser.get_u64_range(
                "PORT_PERIOD_MS",
                DEFAULT_PERIOD_MS,
                MIN_PERIOD_MS,
                MAX_PERIOD_MS,
            ),
            decay_num: parser.get_u32_range("DECAY_NUM", DEFAULT_DECAY_NUM, 0, 1023),
            decay_den: parser.get_u32_range("DECAY_DEN", DEFAULT_DECAY_DEN, 1, 1024),
            max_busy_percent: parser.get_u32_range(
                "MAX_BUSY_PERCENT",
                DEFAULT_MAX_BUSY_PERCENT,
                1,
                100,
            ),
            cores: parser.get_u32_range("CORES", DEFAULT_CORES, 1, NR_CPU_CORES as u32),
            remap,
            unused_ports: parser.get_u32_list("UNUSED_PORTS", 0, u32::MAX),
        };

        if parser.has_errors() {
            return Err(ConfigError::Environment(parser.take_errors()));
        }
        Ok(config)
    }

    /// Check cross-field constraints the per-variable parser cannot see.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.decay_num.value >= self.decay_den.value {
            return Err(ConfigError::DecayFraction {
                num: self.decay_num.value,
                den: self.decay_den.value,
            });
        }
        if self.cores.value == 0 || self.cores.value as usize > NR_CPU_CORES {
            return Err(ConfigError::CoreCount {
                count: self.cores.value,
                max: NR_CPU_CORES,
            });
        }
        if let Some(&port) = self
            .unused_ports
            .value
            .iter()
            .find(|&&p| p as usize == MANAGEMENT_PORT || p as usize >= NR_PORTS)
        {
            return Err(ConfigError::UnusedPort(port));
        }
        Ok(())
    }

    pub fn core_count(&self) -> usize {
        self.cores.value as usize
    }

    pub fn unused_port_indices(&self) -> Vec<usize> {
        self.unused_ports.value.iter().map(|&p| p as usize).collect()
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use netdisp_common::ConfigSource;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    const VARS: [&str; 6] = [
        "NETDISP_DECAY_NUM",
        "NETDISP_DECAY_DEN",
        "NETDISP_CORES",
        "NETDISP_REMAP",
        "NETDISP_UNUSED_PORTS",
        "NETDISP_PERF_PERIOD_MS",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: env access is serialized by env_lock
            unsafe { std::env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: env access is serialized by env_lock
        unsafe { std::env::set_var(key, value) };
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = DisplayConfig::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.core_count(), 2);
        assert_eq!(config.perf_period_ms.value, 100);
        assert_eq!(config.remap.value, PortRemap::Reverse);
    }

    #[test]
    fn test_from_env_reads_overrides() {
        let _guard = env_lock();
        clear_env();

        set_env("NETDISP_REMAP", "rotate");
        set_env("NETDISP_UNUSED_PORTS", "3,4");
        set_env("NETDISP_PERF_PERIOD_MS", "250");
        let config = DisplayConfig::from_env().expect("env should parse");
        config.validate().expect("config should validate");

        assert_eq!(config.remap.value, PortRemap::Rotate);
        assert_eq!(config.remap.source, ConfigSource::Environment);
        assert_eq!(config.unused_port_indices(), vec![3, 4]);
        assert_eq!(config.perf_period_ms.value, 250);
        assert_eq!(config.port_period_ms.source, ConfigSource::Default);

        clear_env();
    }

    #[test]
    fn test_from_env_collects_all_errors() {
        let _guard = env_lock();
        clear_env();

        set_env("NETDISP_CORES", "12");
        set_env("NETDISP_PERF_PERIOD_MS", "soon");
        match DisplayConfig::from_env() {
            Err(ConfigError::Environment(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected environment errors, got {other:?}"),
        }

        clear_env();
    }

    #[test]
    fn test_validate_rejects_bad_decay() {
        let mut config = DisplayConfig::default();
        config.decay_num = Sourced::from_cli(4, "--decay-num");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DecayFraction { num: 4, den: 4 })
        ));
    }

    #[test]
    fn test_validate_rejects_management_port_as_unused() {
        let mut config = DisplayConfig::default();
        config.unused_ports = Sourced::from_env(vec![2, 0], "NETDISP_UNUSED_PORTS");
        assert!(matches!(config.validate(), Err(ConfigError::UnusedPort(0))));

        config.unused_ports = Sourced::from_env(vec![5], "NETDISP_UNUSED_PORTS");
        assert!(matches!(config.validate(), Err(ConfigError::UnusedPort(5))));
    }
}
