//! Server configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kiosk_core::{CacheConfig, KioskConfig, MeterConfig, ReaderConfig, SessionConfig};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Ledger backend and cache timing.
    pub ledger: LedgerConfig,
    /// Card reader polling.
    pub reader: ReaderSettings,
    /// Metering and pricing.
    pub metering: MeteringConfig,
    /// Simulated hardware.
    pub mock: MockConfig,
    /// Accounts inserted at startup when absent.
    pub seed_accounts: Vec<SeedAccount>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// # Example
    ///
    /// ```
    /// use kiosk_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.ledger.validate());
        errors.extend(self.reader.validate());
        errors.extend(self.metering.validate());
        errors.extend(self.mock.validate());

        let mut seen_tokens = HashSet::new();
        for (i, account) in self.seed_accounts.iter().enumerate() {
            let prefix = format!("seed_accounts[{}]", i);
            errors.extend(account.validate(&prefix));

            if !seen_tokens.insert(account.token_id.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.token_id", prefix),
                    format!("duplicate token '{}'", account.token_id),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Core configuration derived from these settings.
    pub fn kiosk_config(&self) -> KioskConfig {
        KioskConfig {
            reader: ReaderConfig {
                poll_interval: Duration::from_millis(self.reader.poll_interval_ms),
                debounce: Duration::from_millis(self.reader.debounce_ms),
                auto_provision_unknown: self.reader.auto_provision_unknown,
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(self.ledger.cache_ttl_secs),
                refresh_interval: Duration::from_secs(self.ledger.refresh_interval_secs),
                remote_timeout: Duration::from_millis(self.ledger.remote_timeout_ms),
            },
            session: SessionConfig {
                meter: MeterConfig {
                    tick: Duration::from_millis(self.metering.tick_ms),
                    pack_capacity_kwh: self.metering.pack_capacity_kwh,
                    cost_per_kwh: self.metering.cost_per_kwh,
                    assumed_start_battery: self.metering.assumed_start_battery,
                },
                ..SessionConfig::default()
            },
            full_charge_cost: self.metering.full_charge_cost,
            event_capacity: self.server.broadcast_buffer,
            ..KioskConfig::default()
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
    /// Per-subscriber event buffer for WebSocket clients.
    pub broadcast_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            broadcast_buffer: 100,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(ValidationError::new(
                "server.bind",
                "bind address cannot be empty",
            ));
        } else {
            match self.bind.rsplit_once(':') {
                None => errors.push(ValidationError::new(
                    "server.bind",
                    format!(
                        "invalid bind address '{}': expected format 'host:port'",
                        self.bind
                    ),
                )),
                Some((_, port)) => match port.parse::<u16>() {
                    Ok(0) => {
                        errors.push(ValidationError::new("server.bind", "port cannot be 0"))
                    }
                    Err(_) => errors.push(ValidationError::new(
                        "server.bind",
                        format!("invalid port '{}': must be a number 1-65535", port),
                    )),
                    Ok(_) => {}
                },
            }
        }

        if self.broadcast_buffer == 0 {
            errors.push(ValidationError::new(
                "server.broadcast_buffer",
                "broadcast buffer must be at least 1",
            ));
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: kiosk_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.path",
                "database path cannot be empty",
            ));
        }

        errors
    }
}

/// Where account balances live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// The local SQLite database.
    #[default]
    Sqlite,
    /// A remote ledger service over HTTP.
    Http,
}

impl LedgerBackend {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Http => "http",
        }
    }
}

/// Ledger backend and cache timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Backend kind.
    pub backend: LedgerBackend,
    /// Base URL of the remote ledger (http backend only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// How long account reads are served from cache.
    pub cache_ttl_secs: u64,
    /// Period of the background cache refresh.
    pub refresh_interval_secs: u64,
    /// Upper bound on each ledger call.
    pub remote_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Sqlite,
            url: None,
            cache_ttl_secs: 10,
            refresh_interval_secs: 30,
            remote_timeout_ms: 5000,
        }
    }
}

impl LedgerConfig {
    /// Validate ledger configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.backend == LedgerBackend::Http {
            match self.url.as_deref() {
                None | Some("") => errors.push(ValidationError::new(
                    "ledger.url",
                    "the http backend needs a ledger url",
                )),
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    errors.push(ValidationError::new(
                        "ledger.url",
                        format!("ledger url '{}' must start with http:// or https://", url),
                    ))
                }
                Some(_) => {}
            }
        }

        if self.cache_ttl_secs == 0 {
            errors.push(ValidationError::new(
                "ledger.cache_ttl_secs",
                "cache TTL must be at least 1 second",
            ));
        }
        if self.refresh_interval_secs == 0 {
            errors.push(ValidationError::new(
                "ledger.refresh_interval_secs",
                "refresh interval must be at least 1 second",
            ));
        }
        if self.remote_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "ledger.remote_timeout_ms",
                "remote timeout cannot be 0",
            ));
        }

        errors
    }
}

/// Minimum reader poll interval in milliseconds.
pub const MIN_POLL_INTERVAL_MS: u64 = 100;
/// Maximum reader poll interval in milliseconds.
pub const MAX_POLL_INTERVAL_MS: u64 = 1000;

/// Card reader polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderSettings {
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Debounce window in milliseconds.
    pub debounce_ms: u64,
    /// Create zero-balance accounts for unknown cards.
    pub auto_provision_unknown: bool,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            debounce_ms: 2000,
            auto_provision_unknown: false,
        }
    }
}

impl ReaderSettings {
    /// Validate reader configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&self.poll_interval_ms) {
            errors.push(ValidationError::new(
                "reader.poll_interval_ms",
                format!(
                    "poll interval {} ms is out of range ({}-{} ms)",
                    self.poll_interval_ms, MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS
                ),
            ));
        }
        if self.debounce_ms == 0 {
            errors.push(ValidationError::new(
                "reader.debounce_ms",
                "debounce window cannot be 0",
            ));
        }

        errors
    }
}

/// Metering and pricing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeteringConfig {
    /// Metering tick in milliseconds.
    pub tick_ms: u64,
    /// Usable battery capacity in kWh.
    pub pack_capacity_kwh: f64,
    /// Price per delivered kWh.
    pub cost_per_kwh: f64,
    /// Price of a full 0 to 100 % charge.
    pub full_charge_cost: f64,
    /// Start battery (%) when the charger cannot report one.
    pub assumed_start_battery: f64,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            pack_capacity_kwh: 10.0,
            cost_per_kwh: 10.0,
            full_charge_cost: 100.0,
            assumed_start_battery: 35.0,
        }
    }
}

impl MeteringConfig {
    /// Validate metering configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.tick_ms < 100 {
            errors.push(ValidationError::new(
                "metering.tick_ms",
                format!("tick {} ms is too short (minimum 100 ms)", self.tick_ms),
            ));
        }
        for (field, value) in [
            ("metering.pack_capacity_kwh", self.pack_capacity_kwh),
            ("metering.cost_per_kwh", self.cost_per_kwh),
            ("metering.full_charge_cost", self.full_charge_cost),
        ] {
            if !(value.is_finite() && value > 0.0) {
                errors.push(ValidationError::new(
                    field,
                    format!("{} must be a positive number", value),
                ));
            }
        }
        if !(0.0..=100.0).contains(&self.assumed_start_battery) {
            errors.push(ValidationError::new(
                "metering.assumed_start_battery",
                format!(
                    "start battery {} is not a percentage",
                    self.assumed_start_battery
                ),
            ));
        }

        errors
    }
}

/// Simulated charger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Power the simulated charger draws while the relay is closed (W).
    pub charge_power_w: f64,
    /// Simulated line voltage (V).
    pub voltage: f64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            charge_power_w: 3300.0,
            voltage: 230.0,
        }
    }
}

impl MockConfig {
    /// Validate mock hardware configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !(self.charge_power_w.is_finite() && self.charge_power_w >= 0.0) {
            errors.push(ValidationError::new(
                "mock.charge_power_w",
                "charge power cannot be negative",
            ));
        }
        if !(self.voltage.is_finite() && self.voltage > 0.0) {
            errors.push(ValidationError::new(
                "mock.voltage",
                "voltage must be positive",
            ));
        }
        errors
    }
}

/// An account to create at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedAccount {
    /// Card token.
    pub token_id: String,
    /// Display name.
    pub name: String,
    /// Contact detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    /// Opening balance.
    #[serde(default)]
    pub balance: f64,
}

impl SeedAccount {
    /// Validate a seed account.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.token_id.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("{}.token_id", prefix),
                "token cannot be empty",
            ));
        }
        if self.name.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("{}.name", prefix),
                "name cannot be empty",
            ));
        }
        if !(self.balance.is_finite() && self.balance >= 0.0) {
            errors.push(ValidationError::new(
                format!("{}.balance", prefix),
                format!("balance {} cannot be negative", self.balance),
            ));
        }
        errors
    }

    /// The account this seed describes.
    pub fn to_account(&self) -> kiosk_types::UserAccount {
        let mut account =
            kiosk_types::UserAccount::new(&self.token_id, &self.name).with_balance(self.balance);
        account.contact = self.contact.clone();
        account
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `seed_accounts[0].token_id`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kiosk")
        .join("server.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(config: &Config) -> Vec<String> {
        match config.validate() {
            Ok(()) => Vec::new(),
            Err(ConfigError::Validation(errors)) => errors.into_iter().map(|e| e.field).collect(),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.ledger.backend, LedgerBackend::Sqlite);
        assert!(config.seed_accounts.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.path, kiosk_store::default_db_path());
    }

    #[test]
    fn test_parse_full_file() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:9090"

            [ledger]
            backend = "http"
            url = "http://ledger.local/api"
            cache_ttl_secs = 5

            [reader]
            poll_interval_ms = 200
            debounce_ms = 3000

            [metering]
            full_charge_cost = 120.0

            [[seed_accounts]]
            token_id = "RFID001"
            name = "Demo User"
            balance = 100.0
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:9090");
        assert_eq!(config.server.broadcast_buffer, 100);
        assert_eq!(config.ledger.backend, LedgerBackend::Http);
        assert_eq!(config.ledger.cache_ttl_secs, 5);
        assert_eq!(config.ledger.refresh_interval_secs, 30);
        assert_eq!(config.reader.debounce_ms, 3000);
        assert_eq!(config.metering.full_charge_cost, 120.0);
        assert_eq!(config.metering.pack_capacity_kwh, 10.0);
        assert_eq!(config.seed_accounts.len(), 1);
        assert_eq!(config.seed_accounts[0].contact, None);
    }

    #[test]
    fn test_kiosk_config_conversion() {
        let mut config = Config::default();
        config.reader.debounce_ms = 3000;
        config.ledger.remote_timeout_ms = 750;
        config.metering.tick_ms = 500;

        let core = config.kiosk_config();
        assert_eq!(core.reader.debounce, Duration::from_secs(3));
        assert_eq!(core.cache.remote_timeout, Duration::from_millis(750));
        assert_eq!(core.session.meter.tick, Duration::from_millis(500));
        assert_eq!(core.full_charge_cost, 100.0);
        assert_eq!(core.event_capacity, 100);
    }

    #[test]
    fn test_validate_http_backend_needs_url() {
        let mut config = Config::default();
        config.ledger.backend = LedgerBackend::Http;
        assert_eq!(fields(&config), ["ledger.url"]);

        config.ledger.url = Some("ledger.local".to_string());
        assert_eq!(fields(&config), ["ledger.url"]);

        config.ledger.url = Some("https://ledger.local".to_string());
        assert!(fields(&config).is_empty());
    }

    #[test]
    fn test_validate_collects_every_error() {
        let mut config = Config::default();
        config.server.bind = "localhost".to_string();
        config.reader.poll_interval_ms = 10;
        config.metering.cost_per_kwh = 0.0;
        config.metering.assumed_start_battery = 120.0;

        let errors = fields(&config);
        assert!(errors.contains(&"server.bind".to_string()));
        assert!(errors.contains(&"reader.poll_interval_ms".to_string()));
        assert!(errors.contains(&"metering.cost_per_kwh".to_string()));
        assert!(errors.contains(&"metering.assumed_start_battery".to_string()));
    }

    #[test]
    fn test_validate_port_zero() {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1:0".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("port cannot be 0"));
    }

    #[test]
    fn test_validate_duplicate_seed_tokens() {
        let mut config = Config::default();
        for _ in 0..2 {
            config.seed_accounts.push(SeedAccount {
                token_id: "RFID001".to_string(),
                name: "Demo".to_string(),
                contact: None,
                balance: 10.0,
            });
        }
        assert_eq!(fields(&config), ["seed_accounts[1].token_id"]);
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("server.toml");

        let mut config = Config::default();
        config.server.bind = "0.0.0.0:9090".to_string();
        config.storage.path = PathBuf::from("/tmp/kiosk-test.db");
        config.seed_accounts.push(SeedAccount {
            token_id: "RFID001".to_string(),
            name: "Demo User".to_string(),
            contact: Some("demo@example.com".to_string()),
            balance: 100.0,
        });

        config.save(&config_path).unwrap();
        let loaded = Config::load_validated(&config_path).unwrap();

        assert_eq!(loaded.server.bind, "0.0.0.0:9090");
        assert_eq!(loaded.storage.path, PathBuf::from("/tmp/kiosk-test.db"));
        assert_eq!(loaded.seed_accounts[0].contact.as_deref(), Some("demo@example.com"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/kiosk/server.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_seed_account_to_account() {
        let seed = SeedAccount {
            token_id: "RFID001".to_string(),
            name: "Demo".to_string(),
            contact: Some("x".to_string()),
            balance: 12.5,
        };
        let account = seed.to_account();
        assert_eq!(account.balance, 12.5);
        assert_eq!(account.contact.as_deref(), Some("x"));
    }
}
