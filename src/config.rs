//! Flotilla configuration
//!
//! Loaded from a YAML file when present, with `FLOTILLA_*` environment
//! variables taking precedence. The vault master key is env-only and never
//! appears in the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default socket path for the Flotilla daemon
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/flotilla.sock";

/// Environment variable holding the vault master key
pub const MASTER_KEY_ENV: &str = "FLOTILLA_MASTER_KEY";

/// Connection-layer tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Handshake (ping + version) timeout in seconds
    pub handshake_timeout_secs: u64,
    /// Total build timeout in seconds (connect + tunnel + handshake)
    pub total_timeout_secs: u64,
    /// How long a cached client stays fresh without re-probing, in seconds
    pub cache_freshness_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 10,
            total_timeout_secs: 30,
            cache_freshness_secs: 30,
        }
    }
}

impl ConnectionConfig {
    /// Handshake timeout as a `Duration`
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Total build timeout as a `Duration`
    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }

    /// Cache freshness window as a `Duration`
    pub fn cache_freshness(&self) -> Duration {
        Duration::from_secs(self.cache_freshness_secs)
    }
}

/// Circuit breaker tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Sliding window for counting failures, in seconds
    pub failure_window_secs: u64,
    /// Initial open-state cooldown, in seconds
    pub cooldown_secs: u64,
    /// Cooldown cap for exponential backoff, in seconds
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window_secs: 60,
            cooldown_secs: 30,
            max_cooldown_secs: 600,
        }
    }
}

impl BreakerConfig {
    /// Failure window as a `Duration`
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    /// Initial cooldown as a `Duration`
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Cooldown cap as a `Duration`
    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs)
    }
}

/// Health reporter tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Probe interval in seconds
    pub probe_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 60,
        }
    }
}

impl HealthConfig {
    /// Probe interval as a `Duration`
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

/// Vault key-derivation tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// PBKDF2 iteration count for master key derivation
    pub kdf_iterations: u32,
    /// Salt for master key derivation (stable per deployment)
    pub kdf_salt: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: 600_000,
            kdf_salt: "flotilla-vault-v1".to_string(),
        }
    }
}

/// Top-level Flotilla configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlotillaConfig {
    /// Unix socket path for the operational API
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Data directory (host store, temp key files)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Connection-layer tunables
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Circuit breaker tunables
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Health reporter tunables
    #[serde(default)]
    pub health: HealthConfig,
    /// Vault key-derivation tunables
    #[serde(default)]
    pub vault: VaultConfig,
}

impl Default for FlotillaConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            data_dir: default_data_dir(),
            connection: ConnectionConfig::default(),
            breaker: BreakerConfig::default(),
            health: HealthConfig::default(),
            vault: VaultConfig::default(),
        }
    }
}

impl FlotillaConfig {
    /// Load configuration from a YAML file, falling back to defaults when
    /// the file is absent, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                serde_yaml::from_str(&text)?
            }
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `FLOTILLA_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    // Takes a lookup closure instead of reading the process environment
    // directly so tests don't have to mutate global state.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup_u64 = |name: &str| lookup(name).and_then(|v| v.parse::<u64>().ok());

        if let Some(v) = lookup("FLOTILLA_SOCKET_PATH") {
            self.socket_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FLOTILLA_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup_u64("FLOTILLA_HANDSHAKE_TIMEOUT_SECS") {
            self.connection.handshake_timeout_secs = v;
        }
        if let Some(v) = lookup_u64("FLOTILLA_TOTAL_TIMEOUT_SECS") {
            self.connection.total_timeout_secs = v;
        }
        if let Some(v) = lookup_u64("FLOTILLA_CACHE_FRESHNESS_SECS") {
            self.connection.cache_freshness_secs = v;
        }
        if let Some(v) = lookup_u64("FLOTILLA_BREAKER_THRESHOLD") {
            self.breaker.failure_threshold = v as u32;
        }
        if let Some(v) = lookup_u64("FLOTILLA_BREAKER_WINDOW_SECS") {
            self.breaker.failure_window_secs = v;
        }
        if let Some(v) = lookup_u64("FLOTILLA_BREAKER_COOLDOWN_SECS") {
            self.breaker.cooldown_secs = v;
        }
        if let Some(v) = lookup_u64("FLOTILLA_BREAKER_MAX_COOLDOWN_SECS") {
            self.breaker.max_cooldown_secs = v;
        }
        if let Some(v) = lookup_u64("FLOTILLA_PROBE_INTERVAL_SECS") {
            self.health.probe_interval_secs = v;
        }
    }

    /// Read the vault master key from the environment
    pub fn master_key(&self) -> anyhow::Result<String> {
        std::env::var(MASTER_KEY_ENV)
            .map_err(|_| anyhow::anyhow!("{} is not set", MASTER_KEY_ENV))
    }

    /// Path of the host store file under the data directory
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("hosts.json")
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/flotilla")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FlotillaConfig::default();
        assert_eq!(config.connection.handshake_timeout_secs, 10);
        assert_eq!(config.connection.total_timeout_secs, 30);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown_secs, 30);
        assert_eq!(config.breaker.max_cooldown_secs, 600);
        assert_eq!(config.health.probe_interval_secs, 60);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = FlotillaConfig::default();
        let text = serde_yaml::to_string(&config).unwrap();
        let parsed: FlotillaConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(parsed.breaker.failure_threshold, 3);
        assert_eq!(parsed.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let parsed: FlotillaConfig =
            serde_yaml::from_str("socket_path: /tmp/f.sock\nbreaker:\n  cooldown_secs: 5\n")
                .unwrap();
        assert_eq!(parsed.socket_path, PathBuf::from("/tmp/f.sock"));
        assert_eq!(parsed.data_dir, PathBuf::from("/var/lib/flotilla"));
        assert_eq!(parsed.breaker.cooldown_secs, 5);
        assert_eq!(parsed.breaker.failure_threshold, 3);
        assert_eq!(parsed.connection.cache_freshness_secs, 30);
    }

    #[test]
    fn test_env_overrides() {
        let vars: std::collections::HashMap<&str, &str> = [
            ("FLOTILLA_BREAKER_THRESHOLD", "7"),
            ("FLOTILLA_PROBE_INTERVAL_SECS", "15"),
            ("FLOTILLA_DATA_DIR", "/tmp/flotilla-override"),
            ("FLOTILLA_BREAKER_WINDOW_SECS", "not a number"),
        ]
        .into_iter()
        .collect();

        let mut config = FlotillaConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.breaker.failure_threshold, 7);
        assert_eq!(config.health.probe_interval_secs, 15);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/flotilla-override"));
        // unparseable values are ignored, unset values untouched
        assert_eq!(config.breaker.failure_window_secs, 60);
        assert_eq!(config.connection.total_timeout_secs, 30);
    }
}
