use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hirebridge_cache::{CacheSettings, MemorySettings};
use hirebridge_realtime::{BackoffPolicy, validate_identifier};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub realtime: RealtimeSettings,
    #[serde(default)]
    pub admin: AdminSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.cache.validate().map_err(|e| e.to_string())?;
        self.memory.validate().map_err(|e| e.to_string())?;

        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }

        if self.admin.port == 0 {
            return Err("admin.port must be > 0".into());
        }
        if self.admin.host.parse::<IpAddr>().is_err() {
            return Err(format!(
                "admin.host must be an IP address, got '{}'",
                self.admin.host
            ));
        }

        self.realtime.validate()
    }

    /// Address the admin server binds to.
    pub fn admin_addr(&self) -> Result<SocketAddr, String> {
        self.admin.addr()
    }
}

/// Change feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Postgres connection string. Required when enabled.
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_tables")]
    pub tables: Vec<String>,

    /// Channels are named `{channel_prefix}_{table}`
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Create the notify function and per-table triggers at startup
    #[serde(default)]
    pub install_triggers: bool,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// First retry delay; doubles on each consecutive failure
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long the listener waits on a full queue before dropping an event
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub clear_on_reconnect: bool,
}

fn default_true() -> bool {
    true
}
fn default_tables() -> Vec<String> {
    vec!["students".into(), "companies".into()]
}
fn default_channel_prefix() -> String {
    "hirebridge_changes".into()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_enqueue_timeout_ms() -> u64 {
    50
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            database_url: None,
            tables: default_tables(),
            channel_prefix: default_channel_prefix(),
            install_triggers: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_attempts: default_max_attempts(),
            queue_capacity: default_queue_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            clear_on_reconnect: default_true(),
        }
    }
}

impl RealtimeSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.database_url.as_deref().unwrap_or("").trim().is_empty() {
            return Err("realtime.enabled=true requires realtime.database_url".into());
        }
        if self.tables.is_empty() {
            return Err("realtime.tables must not be empty".into());
        }
        for table in &self.tables {
            validate_identifier(table).map_err(|e| format!("realtime.tables: {e}"))?;
        }
        validate_identifier(&self.channel_prefix)
            .map_err(|e| format!("realtime.channel_prefix: {e}"))?;
        if self.connect_timeout_ms == 0 || self.base_delay_ms == 0 {
            return Err("realtime timeouts and delays must be > 0".into());
        }
        if self.queue_capacity == 0 {
            return Err("realtime.queue_capacity must be > 0".into());
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// Operator admin server. Keep it on a private interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSettings {
    #[serde(default = "default_admin_host")]
    pub host: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

fn default_admin_host() -> String {
    "127.0.0.1".into()
}
fn default_admin_port() -> u16 {
    9091
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            host: default_admin_host(),
            port: default_admin_port(),
        }
    }
}

impl AdminSettings {
    pub fn addr(&self) -> Result<SocketAddr, String> {
        self.host
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, self.port))
            .map_err(|e| format!("admin.host: {e}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    pub const DEFAULT_CONFIG_PATH: &str = "hirebridge.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            tracing::warn!(path = %pathbuf.display(), "Config file not found, using defaults and environment");
        }
        // Environment variable overrides, e.g., HIREBRIDGE__CACHE__MAX_SIZE_BYTES=1048576
        builder = builder.add_source(
            Environment::with_prefix("HIREBRIDGE")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("realtime.tables"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_from_path<P: AsRef<Path>>(path: P) -> Result<AppConfig, String> {
        let p = path.as_ref().to_string_lossy().to_string();
        load_config(Some(&p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.memory.ceiling_bytes = 512 * 1024 * 1024;
        cfg.realtime.database_url = Some("postgres://localhost/hirebridge".into());
        cfg
    }

    #[test]
    fn test_defaults_need_ceiling_and_database() {
        assert!(AppConfig::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_realtime_requires_database_url_only_when_enabled() {
        let mut cfg = valid();
        cfg.realtime.database_url = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("database_url"));

        cfg.realtime.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_unsafe_table_names() {
        let mut cfg = valid();
        cfg.realtime.tables = vec!["students; drop table x".into()];
        assert!(cfg.validate().unwrap_err().contains("realtime.tables"));
    }

    #[test]
    fn test_rejects_bad_log_level() {
        let mut cfg = valid();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().unwrap_err().contains("logging.level"));
    }

    #[test]
    fn test_backoff_from_settings() {
        let policy = valid().realtime.backoff();
        assert_eq!(policy, BackoffPolicy::default());
    }

    #[test]
    fn test_admin_addr() {
        let addr = valid().admin_addr().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9091");
    }
}
