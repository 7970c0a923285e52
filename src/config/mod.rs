use std::sync::OnceLock;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

mod log_config;
pub use log_config::LogConfig;

pub static CONFIG: OnceLock<ServerConfig> = OnceLock::new();

pub fn init() {
    let raw_config = Figment::new()
        .merge(Toml::file(
            Env::var("APP_CONFIG").as_deref().unwrap_or("config.toml"),
        ))
        .merge(Env::prefixed("APP_").global());

    let config = match raw_config.extract::<ServerConfig>() {
        Ok(s) => s,
        Err(e) => {
            eprintln!(
                "It looks like your config is invalid. The following error occurred: {e}"
            );
            std::process::exit(1);
        }
    };
    crate::config::CONFIG
        .set(config)
        .expect("config should be set");
}

/// Installs a default config for tests that never touch disk.
#[cfg(test)]
pub fn init_test() {
    let _ = crate::config::CONFIG.set(ServerConfig {
        listen_addr: default_listen_addr(),
        listen_port: default_listen_port(),
        log: LogConfig::default(),
        hub: HubConfig::default(),
        require_auth_sse: false,
        require_auth_notify: false,
    });
}

pub fn get() -> &'static ServerConfig {
    CONFIG.get().expect("config should be set")
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub hub: HubConfig,
    /// Deployment policy: whether `GET /api/sse` requires a resolved identity.
    #[serde(default = "default_true")]
    pub require_auth_sse: bool,
    /// Deployment policy: whether `POST /api/sse/notifications` requires one.
    #[serde(default)]
    pub require_auth_notify: bool,
}

/// Tunables for the [`crate::hub::Hub`], enumerated in full in §4.3.
#[derive(Deserialize, Clone, Copy, Debug)]
pub struct HubConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_true")]
    pub enable_heartbeat: bool,
    #[serde(default = "default_write_deadline_ms")]
    pub write_deadline_ms: u64,
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_connections: default_max_connections(),
            enable_heartbeat: true,
            write_deadline_ms: default_write_deadline_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "127.0.0.1".into()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_connection_timeout_ms() -> u64 {
    60_000
}

fn default_max_connections() -> usize {
    1000
}

fn default_write_deadline_ms() -> u64 {
    1_000
}
