//! Typed configuration with environment overrides, mirroring the loader
//! shape the rest of the reference codebase uses: a struct per concern, a
//! loader that can build it from a file, a string, or the environment, and a
//! `validate()` that runs before the engine starts.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "fleetctl".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub dlq_sweep_interval_secs: u64,
    pub cleanup_sweep_interval_secs: u64,
    pub stale_task_threshold_secs: u64,
    pub retry_base_delay_secs: u64,
    pub active_task_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dlq_sweep_interval_secs: 5 * 60,
            cleanup_sweep_interval_secs: 5 * 60,
            stale_task_threshold_secs: 2 * 60 * 60,
            retry_base_delay_secs: 60,
            active_task_ttl_secs: 2 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutConfig {
    pub default_replay_count: usize,
    pub liveness_tick_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            default_replay_count: 50,
            liveness_tick_secs: 30,
            write_timeout_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub fanout: FanOutConfig,
}

impl AppConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.scheduler.dlq_sweep_interval_secs == 0 {
            return Err(EngineError::InvalidTask(
                "scheduler.dlq_sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.scheduler.cleanup_sweep_interval_secs == 0 {
            return Err(EngineError::InvalidTask(
                "scheduler.cleanup_sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.fanout.default_replay_count > 10_000 {
            return Err(EngineError::InvalidTask(
                "fanout.default_replay_count is unreasonably large".into(),
            ));
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load_from_file(path: impl AsRef<Path>) -> EngineResult<AppConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Internal(format!("reading config file: {e}")))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> EngineResult<AppConfig> {
        let mut config: AppConfig = serde_json::from_str(contents)
            .map_err(|e| EngineError::Internal(format!("parsing config: {e}")))?;
        Self::apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_env() -> EngineResult<AppConfig> {
        let mut config = AppConfig::default();
        Self::apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(config: &mut AppConfig) {
        if let Ok(level) = std::env::var("FLEETCTL_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(name) = std::env::var("FLEETCTL_SERVICE_NAME") {
            config.service.name = name;
        }
        if let Ok(version) = std::env::var("FLEETCTL_SERVICE_VERSION") {
            config.service.version = version;
        }
    }
}
