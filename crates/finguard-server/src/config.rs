use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use finguard_auth::SecurityConfig;
use finguard_auth_redis::RedisConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Token, attempt, and session settings
    #[serde(default)]
    pub security: SecurityConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.session_cleanup_interval_secs == 0 {
            return Err("server.session_cleanup_interval_secs must be > 0".into());
        }
        if self.redis.enabled && self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.redis.enabled && self.redis.timeout_ms == 0 {
            return Err("redis.timeout_ms must be > 0".into());
        }
        self.security
            .validate()
            .map_err(|e| format!("security: {e}"))?;
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How often expired sessions are swept from the store
    #[serde(default = "default_session_cleanup_interval_secs")]
    pub session_cleanup_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_session_cleanup_interval_secs() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            session_cleanup_interval_secs: default_session_cleanup_interval_secs(),
        }
    }
}

impl ServerConfig {
    pub fn session_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.session_cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default configuration file, relative to the working directory.
    pub const DEFAULT_CONFIG_PATH: &str = "finguard.toml";

    /// Loads `path` (or `finguard.toml`) if it exists, then applies
    /// `FINGUARD__*` environment overrides, e.g. `FINGUARD__SERVER__PORT=9090`
    /// or `FINGUARD__SECURITY__TOKEN__SECRET=...`.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        builder = builder.add_source(
            Environment::with_prefix("FINGUARD")
                .try_parsing(true)
                .separator("__"),
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, File, FileFormat};

    const SAMPLE: &str = r#"
[server]
port = 9090

[redis]
enabled = true
url = "redis://cache:6379"

[logging]
level = "debug"

[security.token]
secret = "sample-secret-that-is-at-least-32-bytes"
expiration = "2h"
bind_ip = false

[security.attempts.policies.login]
max_attempts = 3
window = "10m"
lockout_duration = "1m"

[security.session]
max_concurrent_sessions = 2
"#;

    fn parse(toml: &str) -> AppConfig {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_sample_config_parses() {
        let cfg = parse(SAMPLE);
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.server.session_cleanup_interval(), Duration::from_secs(300));
        assert!(cfg.redis.enabled);
        assert_eq!(cfg.redis.pool_size, 10);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.security.token.expiration, Duration::from_secs(7200));
        assert!(!cfg.security.token.bind_ip);
        assert_eq!(cfg.security.attempts.policies.login.max_attempts, 3);
        assert_eq!(
            cfg.security.attempts.policies.login.lockout_duration,
            Duration::from_secs(60)
        );
        // untouched sections keep their defaults
        assert_eq!(cfg.security.attempts.policies.password_reset.max_attempts, 3);
        assert_eq!(cfg.security.session.max_concurrent_sessions, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_missing_secret_fails_validation() {
        let cfg = AppConfig::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.starts_with("security:"), "{err}");
    }

    #[test]
    fn test_addr_falls_back_to_unspecified() {
        let mut cfg = AppConfig::default();
        cfg.server.host = "not-an-ip".into();
        assert_eq!(cfg.addr(), "0.0.0.0:8080".parse().unwrap());
    }
}
