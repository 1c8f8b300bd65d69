/// Configuration management for the convoflow engine
///
/// Everything is read from environment variables with fallbacks so the same
/// binary runs unchanged in a container or on a laptop.

use crate::runtime::engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub channel: ChannelConfig,
    pub engine: EngineSettings,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding automation.db (default: "data")
    pub data_dir: String,
}

/// Outbound channel gateway
///
/// Without a gateway URL every action is only logged (dry-run mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub gateway_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub timeout_secs: u64,
}

/// Engine and timer tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub max_steps_per_event: usize,
    pub max_delivery_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub max_conflict_retries: u32,
    /// How often overdue waits are swept up
    pub timer_sweep_secs: u64,
}

impl EngineSettings {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_steps_per_event: self.max_steps_per_event,
            max_delivery_attempts: self.max_delivery_attempts.max(1),
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_conflict_retries: self.max_conflict_retries.max(1),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.timer_sweep_secs.max(1))
    }
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            server: ServerConfig {
                host: std::env::var("CONVOFLOW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("CONVOFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("CONVOFLOW_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            channel: ChannelConfig {
                gateway_url: env_opt("CONVOFLOW_CHANNEL_URL"),
                api_token: env_opt("CONVOFLOW_CHANNEL_TOKEN"),
                timeout_secs: env_or("CONVOFLOW_CHANNEL_TIMEOUT_SECS", 10),
            },
            engine: EngineSettings {
                max_steps_per_event: env_or("CONVOFLOW_MAX_STEPS", defaults.max_steps_per_event),
                max_delivery_attempts: env_or("CONVOFLOW_DELIVERY_ATTEMPTS", defaults.max_delivery_attempts),
                retry_base_delay_ms: env_or(
                    "CONVOFLOW_RETRY_BASE_MS",
                    defaults.retry_base_delay.as_millis() as u64,
                ),
                max_conflict_retries: env_or("CONVOFLOW_CONFLICT_RETRIES", defaults.max_conflict_retries),
                timer_sweep_secs: env_or("CONVOFLOW_TIMER_SWEEP_SECS", 15),
            },
        }
    }
}
