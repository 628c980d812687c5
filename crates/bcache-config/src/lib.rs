//! Layered configuration and logging initialization (ambient stack §10.1,
//! §10.3), modeled directly on `vrift-config`: a `Config` struct split into
//! per-component sections, loaded from a TOML file and then overridden by
//! environment variables, exposed both as a process-wide singleton and as
//! an explicit `Config::load_from` for tests and embedders that don't want
//! global state.

pub mod logging;

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};

use bcache_events::ValidationMode;
use bcache_memo::ReplacementCheckPolicy;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|e| {
        eprintln!("[bcache-config] failed to load config: {e}, using defaults");
        Config::default()
    }))
});

/// Read-only access to the process-wide config singleton.
pub fn config() -> RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|p| p.into_inner())
}

/// Reload the singleton from `BCACHE_CONFIG` (or defaults) plus env overrides.
pub fn reload() -> Result<()> {
    let next = Config::load()?;
    *CONFIG.write().unwrap_or_else(|p| p.into_inner()) = next;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hashing: HashingConfig,
    pub storage: StorageAdapterConfig,
    pub local_cas: LocalCasConfig,
    pub two_level: TwoLevelConfig,
    pub memo: MemoConfig,
    pub master: MasterConfig,
    pub events: EventsConfig,
    pub copy: CopyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hashing: HashingConfig::default(),
            storage: StorageAdapterConfig::default(),
            local_cas: LocalCasConfig::default(),
            two_level: TwoLevelConfig::default(),
            memo: MemoConfig::default(),
            master: MasterConfig::default(),
            events: EventsConfig::default(),
            copy: CopyConfig::default(),
        }
    }
}

impl Config {
    /// Load from `BCACHE_CONFIG` if set and present, else defaults, then
    /// apply environment overrides. Mirrors `vrift_config::Config::load`'s
    /// layering, minus the global/project split this crate has no use for.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("BCACHE_CONFIG") {
            Ok(path) if Path::new(&path).exists() => Self::load_from(&path)?,
            _ => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BCACHE_PARALLEL_HASH_BOUNDARY") {
            if let Ok(n) = v.parse() {
                self.hashing.parallel_hash_boundary = n;
            }
        }
        if let Ok(v) = std::env::var("BCACHE_STORAGE_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.storage.timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("BCACHE_CAS_ROOT") {
            self.local_cas.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BCACHE_REMOTE_READ_ONLY") {
            self.two_level.remote_read_only = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("BCACHE_COPY_IDLE_WINDOW_SECS") {
            if let Ok(n) = v.parse() {
                self.copy.idle_window_secs = n;
            }
        }
    }

    pub fn storage_retry(&self) -> bcache_storage_retry::RetryBudget {
        bcache_storage_retry::RetryBudget {
            max_attempts: self.storage.retry_max_attempts,
            base_delay_ms: self.storage.retry_base_delay_ms,
            max_delay_ms: self.storage.retry_max_delay_ms,
        }
    }

    pub fn events_validation_mode(&self) -> ValidationMode {
        match self.events.validation_mode.as_str() {
            "off" => ValidationMode::Off,
            "trace" => ValidationMode::Trace,
            _ => ValidationMode::Fail,
        }
    }

    pub fn memo_replacement_policy(&self) -> ReplacementCheckPolicy {
        match self.memo.replacement_policy.as_str() {
            "replace_always" => ReplacementCheckPolicy::ReplaceAlways,
            "replace_never" => ReplacementCheckPolicy::ReplaceNever,
            "pin_always" => ReplacementCheckPolicy::PinAlways,
            _ => ReplacementCheckPolicy::AllowPinElision,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HashingConfig {
    /// Byte threshold at/above which `hash_stream`/`TeeHasher` switch to
    /// `update_rayon`. See `bcache-hash`.
    pub parallel_hash_boundary: u64,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            parallel_hash_boundary: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageAdapterConfig {
    pub timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for StorageAdapterConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            retry_max_attempts: 5,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalCasConfig {
    pub root: PathBuf,
    /// Number of opens after which an access is persisted to the last-access
    /// journal rather than kept purely in memory. See `bcache-local`.
    pub touch_threshold: u32,
}

impl Default for LocalCasConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .map(|h| h.join(".bcache/cas"))
                .unwrap_or_else(|| PathBuf::from("/tmp/bcache/cas")),
            touch_threshold: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwoLevelConfig {
    pub remote_read_only: bool,
    pub always_update_from_remote: bool,
    pub skip_remote_put_if_exists_locally_for_secs: Option<u64>,
    pub skip_remote_pin_on_put: bool,
    pub batch_remote_pins_on_put: bool,
    pub batch_max: usize,
    pub batch_parallelism: usize,
    pub temp_dir: Option<PathBuf>,
}

impl Default for TwoLevelConfig {
    fn default() -> Self {
        Self {
            remote_read_only: false,
            always_update_from_remote: false,
            skip_remote_put_if_exists_locally_for_secs: Some(60),
            skip_remote_pin_on_put: false,
            batch_remote_pins_on_put: false,
            batch_max: 64,
            batch_parallelism: 4,
            temp_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoConfig {
    pub max_attempts: u32,
    /// One of "replace_always" | "replace_never" | "allow_pin_elision" |
    /// "pin_always". See `Config::memo_replacement_policy`.
    pub replacement_policy: String,
    pub optimize_writes: bool,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            replacement_policy: "allow_pin_elision".to_string(),
            optimize_writes: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub lease_expiry_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            lease_expiry_secs: 30,
            heartbeat_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub max_batch_size: usize,
    pub partitions: usize,
    pub channel_capacity: usize,
    /// One of "off" | "trace" | "fail". See `Config::events_validation_mode`.
    pub validation_mode: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            partitions: 8,
            channel_capacity: 256,
            validation_mode: "fail".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    pub idle_window_secs: u64,
    pub pool_size: usize,
    pub bandwidth_floor_bytes_per_sec: u64,
    pub connect_timeout_secs: u64,
    pub first_byte_timeout_secs: u64,
    pub bandwidth_check_interval_secs: u64,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            idle_window_secs: 300,
            pool_size: 32,
            bandwidth_floor_bytes_per_sec: 16 * 1024,
            connect_timeout_secs: 5,
            first_byte_timeout_secs: 10,
            bandwidth_check_interval_secs: 2,
        }
    }
}

/// Small namespace so `Config::storage_retry` can return a plain value type
/// without this crate depending on `bcache-storage` just for `RetryPolicy`'s
/// shape (the two have independent construction parameters).
pub mod bcache_storage_retry {
    #[derive(Debug, Clone, Copy)]
    pub struct RetryBudget {
        pub max_attempts: u32,
        pub base_delay_ms: u64,
        pub max_delay_ms: u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_all_sections() {
        let config = Config::default();
        assert_eq!(config.events.max_batch_size, 100);
        assert_eq!(config.memo.max_attempts, 5);
        assert!(!config.two_level.remote_read_only);
    }

    #[test]
    fn load_from_partial_toml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[two_level]
remote_read_only = true
batch_max = 16
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.two_level.remote_read_only);
        assert_eq!(config.two_level.batch_max, 16);
        assert_eq!(config.two_level.batch_parallelism, 4);
        assert_eq!(config.memo.max_attempts, 5);
    }

    #[test]
    fn validation_mode_and_replacement_policy_map_correctly() {
        let mut config = Config::default();
        config.events.validation_mode = "off".to_string();
        assert_eq!(config.events_validation_mode(), ValidationMode::Off);

        config.memo.replacement_policy = "replace_never".to_string();
        assert_eq!(config.memo_replacement_policy(), ReplacementCheckPolicy::ReplaceNever);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = Config::default();
        let serialized = toml::to_string(&original).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.local_cas.touch_threshold, original.local_cas.touch_threshold);
        assert_eq!(parsed.copy.idle_window_secs, original.copy.idle_window_secs);
    }
}
