//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! An API key is loaded from the FAILOVER_API_KEY env var or api_key_file,
//! never stored in the TOML directly to avoid leaking secrets; it seeds
//! the credential store for an API-key account that has no stored
//! credential yet.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use failover::PollerConfig;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub poller: PollerSettings,
}

/// Daemon process settings
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    /// Path to a file containing an API key (alternative to the
    /// FAILOVER_API_KEY env var)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

/// Store file locations
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    pub credentials_path: PathBuf,
    pub accounts_path: PathBuf,
}

/// Poller tuning, all optional with shipped defaults.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    pub interval_secs: u64,
    pub api_cooldown_secs: u64,
    pub auth_cooldown_secs: u64,
    pub session_threshold: u8,
    pub weekly_threshold: u8,
    pub proactive_swap: bool,
    pub all_accounts_ttl_secs: u64,
    pub notify_window_secs: u64,
    pub notify_cap: usize,
    pub max_consecutive_failures: u32,
    pub http_timeout_secs: u64,
    pub refresh_lookahead_secs: u64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            api_cooldown_secs: 120,
            auth_cooldown_secs: 300,
            session_threshold: 95,
            weekly_threshold: 99,
            proactive_swap: true,
            all_accounts_ttl_secs: 60,
            notify_window_secs: 2,
            notify_cap: 5,
            max_consecutive_failures: 3,
            http_timeout_secs: 30,
            refresh_lookahead_secs: 1800,
        }
    }
}

impl PollerSettings {
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            poll_interval: Duration::from_secs(self.interval_secs),
            session_threshold: self.session_threshold,
            weekly_threshold: self.weekly_threshold,
            proactive_swap: self.proactive_swap,
            all_accounts_ttl: Duration::from_secs(self.all_accounts_ttl_secs),
            notify_window: Duration::from_secs(self.notify_window_secs),
            notify_cap: self.notify_cap,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    pub fn api_cooldown(&self) -> Duration {
        Duration::from_secs(self.api_cooldown_secs)
    }

    pub fn auth_cooldown(&self) -> Duration {
        Duration::from_secs(self.auth_cooldown_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn refresh_lookahead(&self) -> Duration {
        Duration::from_secs(self.refresh_lookahead_secs)
    }
}

fn default_max_connections() -> usize {
    64
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment
    /// variables.
    ///
    /// API key resolution order:
    /// 1. FAILOVER_API_KEY env var
    /// 2. api_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.poller.interval_secs == 0 {
            return Err(common::Error::Config(
                "poller.interval_secs must be greater than 0".into(),
            ));
        }
        if config.poller.http_timeout_secs == 0 {
            return Err(common::Error::Config(
                "poller.http_timeout_secs must be greater than 0".into(),
            ));
        }
        if config.poller.session_threshold > 100 || config.poller.weekly_threshold > 100 {
            return Err(common::Error::Config(
                "usage thresholds are percentages and must not exceed 100".into(),
            ));
        }
        if config.poller.notify_cap == 0 {
            return Err(common::Error::Config(
                "poller.notify_cap must be greater than 0".into(),
            ));
        }
        if config.daemon.max_connections == 0 {
            return Err(common::Error::Config(
                "daemon.max_connections must be greater than 0".into(),
            ));
        }

        // Resolve API key: env var takes precedence over file
        if let Ok(key) = std::env::var("FAILOVER_API_KEY") {
            config.daemon.api_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.daemon.api_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.daemon.api_key = Some(Secret::new(key));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("failover-daemon.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables,
    /// preventing data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[daemon]
listen_addr = "127.0.0.1:8090"

[storage]
credentials_path = "/var/lib/failover/credentials.json"
accounts_path = "/var/lib/failover/accounts.json"

[poller]
interval_secs = 15
session_threshold = 90
"#
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = std::env::temp_dir().join("failover-daemon-test-valid");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, valid_toml()).unwrap();

        unsafe { remove_env("FAILOVER_API_KEY") };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.daemon.listen_addr.port(), 8090);
        assert_eq!(config.daemon.max_connections, 64);
        assert_eq!(config.poller.interval_secs, 15);
        assert_eq!(config.poller.session_threshold, 90);
        // Unspecified settings keep their defaults
        assert_eq!(config.poller.weekly_threshold, 99);
        assert!(config.poller.proactive_swap);
        assert!(config.daemon.api_key.is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_env_api_key_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = std::env::temp_dir().join("failover-daemon-test-key");
        std::fs::create_dir_all(&dir).unwrap();
        let key_path = dir.join("key.txt");
        std::fs::write(&key_path, "sk-from-file\n").unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            format!(
                r#"
[daemon]
listen_addr = "127.0.0.1:8090"
api_key_file = "{}"

[storage]
credentials_path = "creds.json"
accounts_path = "accounts.json"
"#,
                key_path.display()
            ),
        )
        .unwrap();

        unsafe { set_env("FAILOVER_API_KEY", "sk-from-env") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.daemon.api_key.unwrap().expose(), "sk-from-env");

        unsafe { remove_env("FAILOVER_API_KEY") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.daemon.api_key.unwrap().expose(), "sk-from-file");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = std::env::temp_dir().join("failover-daemon-test-invalid");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.toml");
        std::fs::write(&path, "not valid {{{{ toml").unwrap();

        let result = Config::load(&path);
        assert!(result.is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_zero_interval_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = std::env::temp_dir().join("failover-daemon-test-zero");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            r#"
[daemon]
listen_addr = "127.0.0.1:8090"

[storage]
credentials_path = "creds.json"
accounts_path = "accounts.json"

[poller]
interval_secs = 0
"#,
        )
        .unwrap();

        assert!(Config::load(&path).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_threshold_over_100_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = std::env::temp_dir().join("failover-daemon-test-threshold");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            r#"
[daemon]
listen_addr = "127.0.0.1:8090"

[storage]
credentials_path = "creds.json"
accounts_path = "accounts.json"

[poller]
session_threshold = 101
"#,
        )
        .unwrap();

        assert!(Config::load(&path).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_resolve_path_prefers_cli() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/from/env.toml") };
        assert_eq!(
            Config::resolve_path(Some("/from/cli.toml")),
            PathBuf::from("/from/cli.toml")
        );
        assert_eq!(Config::resolve_path(None), PathBuf::from("/from/env.toml"));
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("failover-daemon.toml")
        );
    }
}
